//! Discord REST API client.
//!
//! Posts channel messages through the v10 HTTP API with a bot token. Presence
//! updates need a gateway session; see [`DiscordRestClient::with_gateway`].

use async_trait::async_trait;
use serde::Serialize;
use twilight_gateway::MessageSender;
use tracing::{debug, warn};

use cordrelay_core::config::ActivityKind;

use super::gateway::send_presence;
use super::{ChannelId, ChatClient, ChatError, Payload};

/// Discord API base URL.
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Body of `POST /channels/{id}/messages`.
#[derive(Debug, Serialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<EmbedBody>,
}

/// A single embed in a [`CreateMessage`].
#[derive(Debug, Serialize)]
pub struct EmbedBody {
    pub description: String,
    pub color: u32,
}

impl From<&Payload> for CreateMessage {
    fn from(payload: &Payload) -> Self {
        match payload {
            Payload::Text(text) => Self {
                content: Some(text.clone()),
                embeds: Vec::new(),
            },
            Payload::Embed(embed) => Self {
                content: None,
                embeds: vec![EmbedBody {
                    description: embed.description.clone(),
                    color: embed.color,
                }],
            },
        }
    }
}

/// Client for the Discord HTTP API.
#[derive(Debug)]
pub struct DiscordRestClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
    gateway: Option<MessageSender>,
}

impl DiscordRestClient {
    /// Create a client for `token` against the public API.
    pub fn new(token: &str, http: reqwest::Client) -> Self {
        Self::with_api_base(token, http, DISCORD_API_BASE)
    }

    /// Create a client against a different API base (proxies, tests).
    pub fn with_api_base(token: &str, http: reqwest::Client, api_base: &str) -> Self {
        Self {
            http,
            token: token.trim().to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            gateway: None,
        }
    }

    /// Route presence updates through an open gateway session.
    #[must_use]
    pub fn with_gateway(mut self, sender: MessageSender) -> Self {
        self.gateway = Some(sender);
        self
    }

    /// URL for posting into `channel`.
    pub fn messages_url(&self, channel: ChannelId) -> String {
        format!("{}/channels/{channel}/messages", self.api_base)
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }
}

#[async_trait]
impl ChatClient for DiscordRestClient {
    async fn send(&self, channel: ChannelId, payload: &Payload) -> Result<(), ChatError> {
        if channel == 0 {
            debug!("Skipping send to unconfigured channel");
            return Ok(());
        }

        let response = self
            .http
            .post(self.messages_url(channel))
            .header("Authorization", self.auth_header())
            .json(&CreateMessage::from(payload))
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(channel, "Discord message sent");
            Ok(())
        } else {
            let status_code = status.as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            warn!(status = status_code, body = %body, "Discord API returned error");
            Err(ChatError::Api {
                status: status_code,
                body,
            })
        }
    }

    async fn set_presence_status(
        &self,
        text: &str,
        activity: ActivityKind,
    ) -> Result<(), ChatError> {
        let Some(gateway) = &self.gateway else {
            return Err(ChatError::Unsupported(
                "presence updates require a gateway session",
            ));
        };
        send_presence(gateway, text, activity)?;
        debug!(status = %text, "Bot status updated");
        Ok(())
    }
}
