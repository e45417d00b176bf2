use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::Discord;
use crate::notifier::IncidentAlert;

const COLOR_RED: u32 = 15158332;
const COLOR_GREEN: u32 = 3066993;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

/// Which side of an outage a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentTransition {
    Down,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct DiscordManager {
    client: Client,
    timeout: Duration,
}

impl DiscordManager {
    /// `timeout` bounds each message delivery
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn build_incident_embed(&self, alert: &IncidentAlert, transition: IncidentTransition) -> Embed {
        let (title, description, color) = match transition {
            IncidentTransition::Down => (
                "🔴 Monitor Down",
                format!("Monitor **{}** is not responding correctly", alert.monitor_name),
                COLOR_RED,
            ),
            IncidentTransition::Recovered => (
                "✅ Monitor Recovered",
                format!("Monitor **{}** is responding again", alert.monitor_name),
                COLOR_GREEN,
            ),
        };

        let mut fields = vec![EmbedField {
            name: "🌐 URL".to_string(),
            value: alert.monitor_url.clone(),
            inline: false,
        }];

        if let Some(code) = alert.status_code {
            fields.push(EmbedField {
                name: "📟 Status Code".to_string(),
                value: code.to_string(),
                inline: true,
            });
        }

        if let Some(ms) = alert.response_time_ms {
            fields.push(EmbedField {
                name: "⏱️ Response Time".to_string(),
                value: format!("{ms} ms"),
                inline: true,
            });
        }

        if transition == IncidentTransition::Down
            && let Some(error) = &alert.error_message
        {
            fields.push(EmbedField {
                name: "❌ Error".to_string(),
                value: format!("`{error}`"),
                inline: false,
            });
        }

        Embed {
            title: Some(title.to_string()),
            description: Some(description),
            color: Some(color),
            fields,
            footer: Some(EmbedFooter {
                text: format!("Incident #{} | Monitor #{}", alert.incident_id, alert.monitor_id),
            }),
            timestamp: Some(alert.checked_at.to_rfc3339()),
        }
    }

    #[instrument(skip(self, discord, message))]
    pub async fn send_message(&self, discord: &Discord, message: &Message) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&discord.url)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord message failed with status {status}: {body}");
        }

        debug!("Successfully sent Discord message");
        Ok(())
    }
}
