//! Run notifications posted to a Discord webhook.

use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::Outcome;
use crate::error::NotifyError;

const USERNAME: &str = "regionslice";
const SUCCESS_COLOR: u32 = 0x00FF00;
const FAILURE_COLOR: u32 = 0xFF0000;
/// Discord truncates embed descriptions beyond this.
const MAX_DESCRIPTION: usize = 4096;

#[derive(Serialize, Debug)]
struct Embed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
}

#[derive(Serialize, Debug)]
struct Payload {
    username: String,
    embeds: Vec<Embed>,
}

pub struct DiscordWebhook {
    url: String,
    client: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn send_notification(&self, title: &str, description: &str, success: bool) -> Result<(), NotifyError> {
        let payload = Payload {
            username: USERNAME.to_string(),
            embeds: vec![Embed {
                title: title.to_string(),
                description: truncate(description, MAX_DESCRIPTION),
                color: if success { SUCCESS_COLOR } else { FAILURE_COLOR },
                timestamp: chrono::Utc::now().to_rfc3339(),
            }],
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!("Sent Discord notification: {}", title);
        Ok(())
    }
}

/// Best-effort notifier: delivery problems are logged and swallowed.
pub struct RunNotifier {
    webhook: Option<DiscordWebhook>,
}

impl RunNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook: webhook_url.map(DiscordWebhook::new),
        }
    }

    pub fn disabled() -> Self {
        Self { webhook: None }
    }

    pub async fn run_started(&self, countries: &[String], temporal_slicing: bool) {
        let scope = if countries.is_empty() {
            "all countries".to_string()
        } else {
            countries.join(", ")
        };
        let description = format!(
            "Extracting regions for {} (temporal slicing {})",
            scope,
            if temporal_slicing { "on" } else { "off" }
        );
        self.send("Region extraction started", &description, true).await;
    }

    pub async fn run_finished(&self, outcome: &Outcome) {
        let (title, description) = outcome_message(outcome);
        self.send(title, &description, outcome.is_success()).await;
    }

    async fn send(&self, title: &str, description: &str, success: bool) {
        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook.send_notification(title, description, success).await {
                warn!("Failed to send Discord notification: {}", e);
            }
        }
    }
}

fn outcome_message(outcome: &Outcome) -> (&'static str, String) {
    let title = if outcome.is_success() {
        "Region extraction completed"
    } else {
        "Region extraction failed"
    };
    (title, outcome.to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::UnitFailure;
    use crate::models::UnitKey;

    #[test]
    fn test_outcome_message() {
        let mut outcome = Outcome {
            units_total: 2,
            units_succeeded: 1,
            levels_total: 1,
            levels_combined: 1,
            ..Default::default()
        };
        outcome.failed_units.push(UnitFailure {
            unit: UnitKey {
                country: "BR".to_string(),
                level: "state".to_string(),
                slice: None,
            },
            cause: "store error: timeout".to_string(),
        });

        let (title, description) = outcome_message(&outcome);
        assert_eq!(title, "Region extraction failed");
        assert!(description.contains("FAILED unit BR/state"));
        assert!(description.contains("1/2 units succeeded"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(20);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_silent() {
        let notifier = RunNotifier::disabled();
        notifier.run_started(&[], false).await;
        notifier.run_finished(&Outcome::default()).await;
    }
}
