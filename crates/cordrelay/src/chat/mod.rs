//! Chat-network seam.
//!
//! - [`ChatClient`]: what the relay needs from a Discord connection
//! - [`Payload`]/[`Embed`]: outbound message bodies
//! - [`InboundMessage`]: a message observed on the chat network
//! - [`gateway`]: the live session feeding inbound messages and presence

pub mod discord;
pub mod gateway;

use async_trait::async_trait;
use serde::Deserialize;

use cordrelay_core::config::ActivityKind;

pub use discord::DiscordRestClient;

/// Discord snowflake of a text channel. `0` means "not configured".
pub type ChannelId = u64;

/// A rich message with a colored side bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    pub description: String,
    /// `0xRRGGBB`.
    pub color: u32,
}

/// Body of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Embed(Embed),
}

impl Payload {
    pub fn embed(description: impl Into<String>, color: u32) -> Self {
        Self::Embed(Embed {
            description: description.into(),
            color,
        })
    }
}

/// Errors reported by a [`ChatClient`].
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The HTTP request could not be completed.
    #[error("chat request error: {0}")]
    Request(String),

    /// The chat API answered with a non-success status.
    #[error("chat API error (status {status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The client cannot perform this operation.
    #[error("unsupported chat operation: {0}")]
    Unsupported(&'static str),
}

/// Connection to the chat network. Delivery is fire-and-forget from the
/// relay's point of view; errors are logged by the caller and dropped.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post `payload` to `channel`.
    async fn send(&self, channel: ChannelId, payload: &Payload) -> Result<(), ChatError>;

    /// Replace the bot's presence line.
    async fn set_presence_status(&self, text: &str, activity: ActivityKind)
    -> Result<(), ChatError>;
}

/// Sticker rendering format as reported by Discord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickerFormat {
    #[default]
    Png,
    Apng,
    Lottie,
    Gif,
}

/// Sticker attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StickerRef {
    pub id: u64,
    #[serde(default)]
    pub format: StickerFormat,
}

impl StickerRef {
    /// CDN image for the sticker.
    pub fn url(&self) -> String {
        format!("https://cdn.discordapp.com/stickers/{}.png", self.id)
    }
}

/// Custom guild emoji used inline in an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EmojiRef {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub animated: bool,
}

impl EmojiRef {
    /// CDN image for the emoji.
    pub fn url(&self) -> String {
        let ext = if self.animated { "gif" } else { "png" };
        format!("https://cdn.discordapp.com/emojis/{}.{ext}", self.id)
    }
}

/// A message seen on the chat network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    pub sender_display_name: String,
    pub sender_username: String,
    pub sender_id: u64,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub author_is_bot: bool,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub sticker: Option<StickerRef>,
    #[serde(default)]
    pub custom_emojis: Vec<EmojiRef>,
}
