use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use sitesync_core::config::TelemetryConfig;
use sitesync_core::types::{SyncFailureRecord, SyncType};
use sitesync_core::{Clock, KvStore};
use sitesync_store::LocalStore;

use crate::retry::with_retry;

/// Status flag other components read to suppress redundant source checks.
pub const SOURCE_STATUS_KEY: &str = "source:status";
pub const SOURCE_DOWN_TTL_SECS: u64 = 600;

const TELEMETRY_ATTEMPTS: u32 = 2;
const TELEMETRY_BASE_DELAY_MS: u64 = 500;
const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FailureOptions {
    pub sync_type: SyncType,
    pub error_code: String,
    pub error_message: String,
    pub lock_name: String,
    pub set_source_down: bool,
}

/// Persists sync failures: telemetry document, status flag, then the
/// `sync_errors` row. Each step is independent and never propagates errors.
pub struct FailureRecorder {
    store: Arc<LocalStore>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    client: reqwest::Client,
    telemetry: TelemetryConfig,
}

impl FailureRecorder {
    pub fn new(
        store: Arc<LocalStore>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        telemetry: TelemetryConfig,
    ) -> Self {
        Self {
            store,
            kv,
            clock,
            client: reqwest::Client::new(),
            telemetry,
        }
    }

    pub async fn persist(&self, opts: FailureOptions) -> SyncFailureRecord {
        let record = SyncFailureRecord {
            timestamp: self
                .clock
                .now()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            correlation_id: Uuid::new_v4().to_string(),
            sync_type: opts.sync_type,
            error_code: opts.error_code,
            error_message: opts.error_message,
            lock_name: opts.lock_name,
        };

        if let Err(e) = self.emit_telemetry(&record).await {
            warn!(
                correlation_id = %record.correlation_id,
                lock = %record.lock_name,
                error = %e,
                "failed to emit sync failure telemetry"
            );
        }

        if opts.set_source_down {
            if let Err(e) = self
                .kv
                .put(SOURCE_STATUS_KEY, "down", Some(SOURCE_DOWN_TTL_SECS))
                .await
            {
                warn!(error = %e, "failed to set source status flag");
            }
        }

        if let Err(e) = self.store.insert_sync_failure(&record) {
            warn!(correlation_id = %record.correlation_id, error = %e, "failed to store sync failure");
        }
        record
    }

    /// `PUT {url}/{prefix}-{YYYY.MM.DD}/_doc/{syncType}-{correlationId}`.
    async fn emit_telemetry(&self, record: &SyncFailureRecord) -> Result<(), reqwest::Error> {
        let Some(base) = self.telemetry.elasticsearch_url.as_deref() else {
            return Ok(());
        };
        let endpoint = telemetry_endpoint(base, &self.telemetry.index_prefix, record);
        let event_id = event_id(record);
        let message = format!("Scheduled sync failed ({})", record.sync_type);
        let body = json!({
            "level": "error",
            "module": "scheduled",
            "service": "sitesync",
            "message": message,
            "timestamp": record.timestamp,
            "@timestamp": record.timestamp,
            "action": "SYNC_FAILURE",
            "metadata": {
                "correlationId": record.correlation_id,
                "syncType": record.sync_type,
                "errorCode": record.error_code,
                "errorMessage": record.error_message,
                "lockName": record.lock_name,
                "eventId": event_id,
            },
        });

        let (client, endpoint, body) = (&self.client, &endpoint, &body);
        with_retry(
            move || async move {
                client
                    .put(endpoint)
                    .timeout(TELEMETRY_TIMEOUT)
                    .json(body)
                    .send()
                    .await?
                    .error_for_status()
                    .map(|_| ())
            },
            TELEMETRY_ATTEMPTS,
            TELEMETRY_BASE_DELAY_MS,
        )
        .await?;
        debug!(event_id = %event_id, "sync failure telemetry emitted");
        Ok(())
    }
}

fn event_id(record: &SyncFailureRecord) -> String {
    format!("{}-{}", record.sync_type, record.correlation_id)
}

pub fn telemetry_endpoint(base: &str, prefix: &str, record: &SyncFailureRecord) -> String {
    let day = record.timestamp.get(..10).unwrap_or_default().replace('-', ".");
    format!(
        "{}/{}-{}/_doc/{}",
        base.trim_end_matches('/'),
        prefix,
        day,
        event_id(record)
    )
}
