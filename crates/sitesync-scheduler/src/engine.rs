use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use sitesync_core::{Clock, KvStore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    schedule::is_due,
    state::JobStateStore,
    types::{JobDefinition, JobInfo, JobRegistry, JobStatusView},
};

const CONTROL_CHANNEL_CAPACITY: usize = 32;

enum ControlMessage {
    Status {
        reply: oneshot::Sender<Result<Vec<JobStatusView>>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobInfo>>,
    },
    Trigger {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetEnabled {
        name: String,
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable request/response handle to a running [`SchedulerEngine`].
///
/// Every request is served by the actor between ticks, so control calls never
/// race with job execution.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }

    pub async fn status(&self) -> Result<Vec<JobStatusView>> {
        self.request(|reply| ControlMessage::Status { reply }).await?
    }

    pub async fn list(&self) -> Result<Vec<JobInfo>> {
        self.request(|reply| ControlMessage::List { reply }).await
    }

    /// Run `name` once now, bypassing its due-check. Waits for the run to finish.
    pub async fn trigger(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| ControlMessage::Trigger { name, reply })
            .await?
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let name = name.to_string();
        self.request(|reply| ControlMessage::SetEnabled {
            name,
            enabled,
            reply,
        })
        .await?
    }
}

/// Single-owner scheduler actor.
///
/// Ticks immediately on start, then re-arms `tick_interval` after every tick,
/// whatever the tick's outcome.
pub struct SchedulerEngine {
    registry: Arc<JobRegistry>,
    state: JobStateStore,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    control_rx: mpsc::Receiver<ControlMessage>,
}

impl SchedulerEngine {
    pub fn new(
        registry: Arc<JobRegistry>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let engine = Self {
            registry,
            state: JobStateStore::new(kv),
            clock,
            tick_interval,
            control_rx,
        };
        (engine, SchedulerHandle { tx })
    }

    /// Main event loop. Runs until `shutdown` broadcasts `true` or its sender drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            jobs = self.registry.len(),
            tick_secs = self.tick_interval.as_secs(),
            "scheduler engine started"
        );

        let mut next_tick = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(next_tick) => {
                    if AssertUnwindSafe(self.tick()).catch_unwind().await.is_err() {
                        error!("scheduler tick panicked");
                    }
                    next_tick = Instant::now() + self.tick_interval;
                }
                Some(msg) = self.control_rx.recv() => {
                    self.handle_control(msg).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run every enabled, due job once, in registry order.
    pub async fn tick(&self) {
        let now = self.clock.now_ms();
        for job in self.registry.iter() {
            match self.state.is_enabled(&job.name).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job = %job.name, "job disabled, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(job = %job.name, error = %e, "could not read job state, skipping");
                    continue;
                }
            }

            let last_run = match self.state.last_run(&job.name).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "could not read last run, skipping");
                    continue;
                }
            };
            if !is_due(&job.schedule, now, last_run) {
                continue;
            }

            self.execute(job, now).await;
        }
    }

    /// Invoke the handler, then record `run_at` as its last run regardless of outcome.
    async fn execute(&self, job: &JobDefinition, run_at: i64) {
        info!(job = %job.name, "executing job");
        match AssertUnwindSafe(job.handler.run()).catch_unwind().await {
            Ok(Ok(())) => info!(job = %job.name, "job executed"),
            Ok(Err(e)) => error!(job = %job.name, code = %e.code, error = %e.message, "job failed"),
            Err(_) => error!(job = %job.name, "job panicked"),
        }

        if let Err(e) = self.state.set_last_run(&job.name, run_at).await {
            warn!(job = %job.name, error = %e, "failed to record last run");
        }
    }

    async fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::Status { reply } => {
                let _ = reply.send(self.status().await);
            }
            ControlMessage::List { reply } => {
                let _ = reply.send(self.registry.iter().map(JobDefinition::info).collect());
            }
            ControlMessage::Trigger { name, reply } => {
                let result = match self.registry.find(&name) {
                    Some(job) => {
                        self.execute(job, self.clock.now_ms()).await;
                        Ok(())
                    }
                    None => Err(SchedulerError::JobNotFound { name }),
                };
                let _ = reply.send(result);
            }
            ControlMessage::SetEnabled {
                name,
                enabled,
                reply,
            } => {
                let result = if self.registry.find(&name).is_some() {
                    self.state.set_enabled(&name, enabled).await.inspect(|_| {
                        info!(job = %name, enabled, "job enabled flag updated");
                    })
                } else {
                    Err(SchedulerError::JobNotFound { name })
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn status(&self) -> Result<Vec<JobStatusView>> {
        let now = self.clock.now_ms();
        let mut out = Vec::with_capacity(self.registry.len());
        for job in self.registry.iter() {
            let enabled = self.state.is_enabled(&job.name).await?;
            let last_run = self.state.last_run(&job.name).await?;
            out.push(JobStatusView {
                name: job.name.clone(),
                enabled,
                last_run,
                due_now: enabled && is_due(&job.schedule, now, last_run),
                schedule: job.schedule,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::types::{JobHandler, JobSchedule};
    use async_trait::async_trait;
    use sitesync_core::{ManualClock, MemoryKvStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct CountingJob {
        calls: AtomicU32,
        behaviour: Behaviour,
    }

    impl CountingJob {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                behaviour,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for CountingJob {
        async fn run(&self) -> std::result::Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(JobError::new("BOOM", "handler failed")),
                Behaviour::Panic => panic!("handler panicked"),
            }
        }
    }

    struct Fixture {
        engine: SchedulerEngine,
        handle: SchedulerHandle,
        clock: Arc<ManualClock>,
        kv: Arc<MemoryKvStore>,
    }

    fn fixture(jobs: Vec<JobDefinition>) -> Fixture {
        // 2026-01-05 00:00 UTC
        let clock = Arc::new(ManualClock::new(1_767_571_200_000));
        let kv = Arc::new(MemoryKvStore::new(clock.clone()));
        let (engine, handle) = SchedulerEngine::new(
            Arc::new(JobRegistry::new(jobs)),
            kv.clone(),
            clock.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            engine,
            handle,
            clock,
            kv,
        }
    }

    #[tokio::test]
    async fn interval_job_runs_first_tick_then_waits_for_interval() {
        let job = CountingJob::new(Behaviour::Succeed);
        let f = fixture(vec![JobDefinition::new(
            "five-min",
            JobSchedule::interval(300_000),
            job.clone(),
        )]);

        f.engine.tick().await;
        assert_eq!(job.calls(), 1);

        f.clock.advance_secs(60);
        f.engine.tick().await;
        assert_eq!(job.calls(), 1);

        f.clock.advance_secs(240);
        f.engine.tick().await;
        assert_eq!(job.calls(), 2);
    }

    #[tokio::test]
    async fn failure_still_records_last_run_and_later_jobs_run() {
        let failing = CountingJob::new(Behaviour::Fail);
        let panicking = CountingJob::new(Behaviour::Panic);
        let healthy = CountingJob::new(Behaviour::Succeed);
        let f = fixture(vec![
            JobDefinition::new("failing", JobSchedule::interval(300_000), failing.clone()),
            JobDefinition::new("panicking", JobSchedule::interval(300_000), panicking.clone()),
            JobDefinition::new("healthy", JobSchedule::interval(300_000), healthy.clone()),
        ]);

        f.engine.tick().await;
        assert_eq!(failing.calls(), 1);
        assert_eq!(panicking.calls(), 1);
        assert_eq!(healthy.calls(), 1);

        let now = f.clock.now_ms().to_string();
        for name in ["failing", "panicking", "healthy"] {
            let key = format!("job:{name}:lastRun");
            assert_eq!(f.kv.get(&key).await.unwrap(), Some(now.clone()));
        }

        // Not retried until the interval elapses.
        f.clock.advance_secs(60);
        f.engine.tick().await;
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn disabled_job_is_skipped() {
        let job = CountingJob::new(Behaviour::Succeed);
        let f = fixture(vec![JobDefinition::new(
            "j",
            JobSchedule::interval(0),
            job.clone(),
        )]);
        f.kv.put("job:j:enabled", "false", None).await.unwrap();
        f.engine.tick().await;
        assert_eq!(job.calls(), 0);
    }

    #[tokio::test]
    async fn control_handle_round_trip() {
        let job = CountingJob::new(Behaviour::Succeed);
        let f = fixture(vec![JobDefinition::new(
            "nightly",
            JobSchedule::daily_at_kst(21),
            job.clone(),
        )]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = f.handle.clone();
        let task = tokio::spawn(f.engine.run(shutdown_rx));

        // 09:00 KST: outside the 21h window, so the first tick runs nothing.
        let status = handle.status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(status[0].enabled);
        assert!(!status[0].due_now);
        assert_eq!(status[0].last_run, None);

        handle.trigger("nightly").await.unwrap();
        assert_eq!(job.calls(), 1);
        let status = handle.status().await.unwrap();
        assert_eq!(status[0].last_run, Some(f.clock.now_ms()));

        handle.set_enabled("nightly", false).await.unwrap();
        assert!(!handle.status().await.unwrap()[0].enabled);

        let list = handle.list().await.unwrap();
        assert_eq!(list[0].name, "nightly");
        assert_eq!(list[0].schedule.kst_hour, Some(21));

        let err = handle.trigger("missing").await.unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FOUND");
        let err = handle.set_enabled("missing", true).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { name } if name == "missing"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.status().await,
            Err(SchedulerError::Unavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn re_arms_after_every_tick_even_when_handler_panics() {
        let job = CountingJob::new(Behaviour::Panic);
        let f = fixture(vec![JobDefinition::new(
            "always",
            JobSchedule::interval(0),
            job.clone(),
        )]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.engine.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(job.calls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(job.calls(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(job.calls(), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
