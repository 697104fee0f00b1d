use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use sitesync_core::config::AlertConfig;
use sitesync_core::{Clock, KvStore};

pub const SOURCE_DOWN_ALERT: &str = "SOURCE_DOWN";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub metadata: Value,
}

pub fn build_source_down_alert(error_message: &str, clock: &dyn Clock) -> Alert {
    Alert {
        alert_type: SOURCE_DOWN_ALERT.to_string(),
        severity: AlertSeverity::Critical,
        title: "Source of record sync failing".to_string(),
        message: format!("Employee sync with the source of record failed: {error_message}"),
        timestamp: clock.now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        metadata: json!({ "error": error_message }),
    }
}

fn cooldown_key(alert_type: &str) -> String {
    format!("alert:cooldown:{alert_type}")
}

/// Delivers alerts to a webhook with per-type cooldown.
///
/// Delivery is best-effort: every failure is logged and reported as `false`.
pub struct AlertNotifier {
    client: reqwest::Client,
    kv: Arc<dyn KvStore>,
    webhook_url: Option<String>,
    enabled: bool,
    cooldown_secs: u64,
}

impl AlertNotifier {
    pub fn new(cfg: &AlertConfig, kv: Arc<dyn KvStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            kv,
            webhook_url: cfg.resolve_webhook_url(),
            enabled: cfg.enabled,
            cooldown_secs: cfg.cooldown_secs,
        }
    }

    /// Returns whether the alert was delivered.
    pub async fn fire(&self, alert: &Alert) -> bool {
        if !self.enabled {
            debug!(alert = %alert.alert_type, "alerts disabled");
            return false;
        }
        let Some(url) = self.webhook_url.as_deref() else {
            debug!(alert = %alert.alert_type, "no alert webhook configured");
            return false;
        };

        let key = cooldown_key(&alert.alert_type);
        match self.kv.get(&key).await {
            Ok(Some(_)) => {
                debug!(alert = %alert.alert_type, "alert suppressed by cooldown");
                return false;
            }
            Ok(None) => {}
            Err(e) => warn!(alert = %alert.alert_type, error = %e, "cooldown lookup failed"),
        }

        let sent = self
            .client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(alert)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = sent {
            warn!(alert = %alert.alert_type, error = %e, "alert webhook delivery failed");
            return false;
        }

        if let Err(e) = self.kv.put(&key, "1", Some(self.cooldown_secs)).await {
            warn!(alert = %alert.alert_type, error = %e, "failed to record alert cooldown");
        }
        info!(alert = %alert.alert_type, "alert delivered");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitesync_core::{ManualClock, MemoryKvStore};

    fn cfg(url: Option<&str>) -> AlertConfig {
        AlertConfig {
            enabled: true,
            webhook_url: url.map(String::from),
            cooldown_secs: 300,
        }
    }

    #[test]
    fn source_down_alert_shape() {
        let clock = ManualClock::new(0);
        let alert = build_source_down_alert("ping timed out", &clock);
        let v = serde_json::to_value(&alert).unwrap();
        assert_eq!(v["type"], "SOURCE_DOWN");
        assert_eq!(v["severity"], "critical");
        assert_eq!(v["timestamp"], "1970-01-01T00:00:00.000Z");
        assert_eq!(v["metadata"]["error"], "ping timed out");
    }

    #[tokio::test]
    async fn disabled_notifier_sends_nothing() {
        let kv = Arc::new(MemoryKvStore::new(Arc::new(ManualClock::new(0))));
        let mut c = cfg(Some("http://127.0.0.1:9/hook"));
        c.enabled = false;
        let notifier = AlertNotifier::new(&c, kv.clone());
        let alert = build_source_down_alert("x", &ManualClock::new(0));
        assert!(!notifier.fire(&alert).await);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed_and_not_cooled_down() {
        let kv = Arc::new(MemoryKvStore::new(Arc::new(ManualClock::new(0))));
        // Port 9 (discard) is closed on test hosts; connect fails fast.
        let notifier = AlertNotifier::new(&cfg(Some("http://127.0.0.1:9/hook")), kv.clone());
        let alert = build_source_down_alert("x", &ManualClock::new(0));
        assert!(!notifier.fire(&alert).await);
        assert_eq!(kv.get("alert:cooldown:SOURCE_DOWN").await.unwrap(), None);
    }
}
