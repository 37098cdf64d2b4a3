//! Operational alerts for failed or degraded runs.

use crate::dates::format_timestamp;
use crate::error::NotificationError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub text: String,
    pub severity: Severity,
    pub timestamp: String,
    pub environment: String,
}

/// Posts alerts to a webhook, or only logs them when none is configured.
pub struct Alerter {
    webhook: Option<(reqwest::blocking::Client, String)>,
    environment: String,
}

impl Alerter {
    pub fn new(webhook_url: Option<&str>, environment: &str) -> Self {
        let webhook = webhook_url
            .filter(|url| !url.trim().is_empty())
            .and_then(|url| {
                match reqwest::blocking::Client::builder().timeout(ALERT_TIMEOUT).build() {
                    Ok(client) => Some((client, url.to_string())),
                    Err(err) => {
                        warn!(error = %err, "alert webhook client unavailable, alerts will only be logged");
                        None
                    }
                }
            });
        Self {
            webhook,
            environment: environment.to_string(),
        }
    }

    pub fn payload(&self, severity: Severity, message: &str, at: OffsetDateTime) -> AlertPayload {
        AlertPayload {
            text: format!("LCF Civic Summaries [{severity}]: {message}"),
            severity,
            timestamp: format_timestamp(at),
            environment: self.environment.clone(),
        }
    }

    pub fn alert(&self, severity: Severity, message: &str) -> Result<(), NotificationError> {
        match severity {
            Severity::Info => info!(severity = %severity, "{message}"),
            Severity::Warning => warn!(severity = %severity, "{message}"),
            Severity::Error => error!(severity = %severity, "{message}"),
        }

        let Some((client, url)) = &self.webhook else {
            return Ok(());
        };
        let payload = self.payload(severity, message, OffsetDateTime::now_utc());
        let response = client
            .post(url)
            .json(&payload)
            .send()
            .map_err(|e| NotificationError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Like [`Alerter::alert`], but a delivery failure is only logged.
    pub fn alert_quietly(&self, severity: Severity, message: &str) {
        if let Err(err) = self.alert(severity, message) {
            warn!(error = %err, "alert delivery failed");
        }
    }
}
