// =============================================================================
// Operational alerts — non-blocking delivery to the alert router
// =============================================================================
//
// Alerts surface operator-facing events (provider rate limits, incomplete
// analyses) without ever blocking or failing the trading path. Senders push
// into an unbounded channel; a drain task forwards to the store. A closed
// channel is logged at debug and ignored.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A single operational alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Machine-readable type tag, e.g. `provider_rate_limited`,
    /// `provider_error`, `analysis_incomplete`.
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    /// Structured context for dashboards.
    pub details: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        details: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            message: message.into(),
            details,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Cloneable, non-blocking alert sender.
#[derive(Clone)]
pub struct AlertRouter {
    tx: mpsc::UnboundedSender<Alert>,
}

impl AlertRouter {
    /// Create a router plus the receiving end for the drain task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Route an alert. Failures here must not fail the main path.
    pub fn send(&self, alert: Alert) {
        if alert.severity == Severity::Critical {
            warn!(
                alert_type = %alert.alert_type,
                message = %alert.message,
                "critical alert raised"
            );
        }
        if self.tx.send(alert).is_err() {
            debug!("alert channel closed; alert dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alerts_flow_through_channel() {
        let (router, mut rx) = AlertRouter::new();
        router.send(Alert::new(
            "provider_rate_limited",
            Severity::Warning,
            "provider alpha rate limited",
            serde_json::json!({"provider": "alpha"}),
            "provider_manager",
        ));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.alert_type, "provider_rate_limited");
        assert_eq!(alert.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_is_silent() {
        let (router, rx) = AlertRouter::new();
        drop(rx);
        // Must not panic or error.
        router.send(Alert::new(
            "provider_error",
            Severity::Critical,
            "boom",
            serde_json::Value::Null,
            "test",
        ));
    }
}
