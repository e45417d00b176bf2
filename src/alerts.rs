use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{info, instrument};

use crate::config::{Alert, Webhook};
use crate::discord::{DiscordManager, IncidentTransition, MessageBuilder};
use crate::notifier::{IncidentAlert, Notifier};

/// Upper bound for one alert delivery
pub const DEFAULT_ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Notifier delivering incident alerts to Discord or a generic JSON webhook
#[derive(Debug, Clone)]
pub struct AlertNotifier {
    client: Client,
    alert: Alert,
    timeout: Duration,
    discord_manager: DiscordManager,
}

impl AlertNotifier {
    pub fn new(alert: Alert) -> Self {
        Self::with_timeout(alert, DEFAULT_ALERT_TIMEOUT)
    }

    pub fn with_timeout(alert: Alert, timeout: Duration) -> Self {
        let client = Client::new();
        Self {
            discord_manager: DiscordManager::new(client.clone(), timeout),
            client,
            alert,
            timeout,
        }
    }

    #[instrument(skip(self, alert), fields(incident = alert.incident_id))]
    async fn send(&self, alert: &IncidentAlert, transition: IncidentTransition) -> anyhow::Result<()> {
        match &self.alert {
            Alert::Discord(discord) => {
                let embed = self.discord_manager.build_incident_embed(alert, transition);
                let mut message_builder = MessageBuilder::new().add_embed(embed);
                if let Some(user_id) = &discord.user_id {
                    let emoji = match transition {
                        IncidentTransition::Down => "🔴",
                        IncidentTransition::Recovered => "✅",
                    };
                    message_builder = message_builder
                        .content(format!("{emoji} Monitor: `{}` <@{user_id}>", alert.monitor_name));
                }

                self.discord_manager
                    .send_message(discord, &message_builder.build())
                    .await
            }
            Alert::Webhook(webhook) => {
                self.send_webhook_alert(webhook, alert, transition).await
            }
        }
    }

    fn format_message(alert: &IncidentAlert, transition: IncidentTransition) -> String {
        match transition {
            IncidentTransition::Down => match &alert.error_message {
                Some(error) => format!(
                    "🔴 **Monitor DOWN**: `{}` ({})\nURL: {}",
                    alert.monitor_name, error, alert.monitor_url
                ),
                None => format!(
                    "🔴 **Monitor DOWN**: `{}`\nURL: {}",
                    alert.monitor_name, alert.monitor_url
                ),
            },
            IncidentTransition::Recovered => format!(
                "✅ **Monitor Recovered**: `{}` is back UP\nURL: {}",
                alert.monitor_name, alert.monitor_url
            ),
        }
    }

    async fn send_webhook_alert(
        &self,
        webhook: &Webhook,
        alert: &IncidentAlert,
        transition: IncidentTransition,
    ) -> anyhow::Result<()> {
        let payload = json!({
            "message": Self::format_message(alert, transition),
            "incident_id": alert.incident_id,
            "monitor": alert.monitor_name,
            "url": alert.monitor_url,
            "status": match transition {
                IncidentTransition::Down => "down",
                IncidentTransition::Recovered => "recovered",
            },
            "status_code": alert.status_code,
            "response_time_ms": alert.response_time_ms,
            "error": alert.error_message,
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self
            .client
            .post(&webhook.url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook alert failed with status: {}", response.status());
        }

        info!("Successfully sent webhook alert");
        Ok(())
    }
}

#[async_trait]
impl Notifier for AlertNotifier {
    async fn notify_down(&self, alert: &IncidentAlert) -> anyhow::Result<()> {
        self.send(alert, IncidentTransition::Down).await
    }

    async fn notify_recovered(&self, alert: &IncidentAlert) -> anyhow::Result<()> {
        self.send(alert, IncidentTransition::Recovered).await
    }
}
