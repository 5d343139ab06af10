// =============================================================================
// Alert Fan-out — webhook POSTs for operator-facing events
// =============================================================================
//
// Alerts are fire-and-forget: delivery runs on a spawned task with a small
// bounded retry, and a delivery failure only ever costs a log line. CRITICAL
// alerts (two-leg compensation failure, circuit-breaker trips) must never be
// able to wedge the trading path.
// =============================================================================

use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

const DELIVERY_ATTEMPTS: u32 = 2;

/// Severity carried in the webhook payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One alert event.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub body: String,
    pub symbol: Option<String>,
    pub at: String,
}

/// Webhook fan-out sender. Cheap to clone via `Arc`.
pub struct AlertSender {
    client: reqwest::Client,
    webhooks: Vec<String>,
}

impl AlertSender {
    pub fn new(webhooks: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for AlertSender"),
            webhooks,
        }
    }

    /// Queue an alert for delivery to every configured webhook.
    pub fn send(&self, severity: AlertSeverity, title: &str, body: &str, symbol: Option<&str>) {
        let alert = Alert {
            severity,
            title: title.to_string(),
            body: body.to_string(),
            symbol: symbol.map(|s| s.to_string()),
            at: Utc::now().to_rfc3339(),
        };

        match severity {
            AlertSeverity::Critical => error!(title, body, symbol = ?alert.symbol, "CRITICAL alert"),
            AlertSeverity::Warning => warn!(title, body, symbol = ?alert.symbol, "alert"),
            AlertSeverity::Info => tracing::info!(title, body, symbol = ?alert.symbol, "alert"),
        }

        for url in &self.webhooks {
            let client = self.client.clone();
            let url = url.clone();
            let payload = alert.clone();
            tokio::spawn(async move {
                for attempt in 1..=DELIVERY_ATTEMPTS {
                    match client.post(&url).json(&payload).send().await {
                        Ok(resp) if resp.status().is_success() => return,
                        Ok(resp) => warn!(
                            url = %url,
                            status = %resp.status(),
                            attempt,
                            "alert webhook returned non-success"
                        ),
                        Err(e) => warn!(url = %url, error = %e, attempt, "alert webhook delivery failed"),
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            });
        }
    }

    /// Shorthand for the compensation-failure / breaker-trip path.
    pub fn critical(&self, title: &str, body: &str, symbol: Option<&str>) {
        self.send(AlertSeverity::Critical, title, body, symbol);
    }
}

impl std::fmt::Debug for AlertSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSender")
            .field("webhooks", &self.webhooks.len())
            .finish()
    }
}
