//! Discord gateway session.
//!
//! The gateway delivers the ready signal and channel messages, and is the
//! only way to change the bot's presence. Outbound messages still go through
//! [`DiscordRestClient`](super::DiscordRestClient).

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use twilight_gateway::{
    CloseFrame, Event, EventTypeFlags, Intents, MessageSender, Shard, ShardId, StreamExt as _,
};
use twilight_model::channel::message::Message;
use twilight_model::channel::message::sticker::{MessageSticker, StickerFormatType};
use twilight_model::gateway::payload::outgoing::UpdatePresence;
use twilight_model::gateway::presence::{ActivityType, MinimalActivity, Status};

use cordrelay_core::config::ActivityKind;

use super::{ChatError, InboundMessage, StickerFormat, StickerRef};
use crate::relay::RelayEvent;
use crate::relay::inbound::custom_emojis;

/// Events the relay consumes. Heartbeats and reconnects are handled by the
/// shard regardless.
const WANTED_EVENTS: EventTypeFlags =
    EventTypeFlags::READY.union(EventTypeFlags::MESSAGE_CREATE);

/// How long to wait for Discord to acknowledge a close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Open a single-shard session for `token`.
///
/// Reading message text needs the privileged message-content intent enabled
/// for the application.
pub fn connect(token: &str) -> Shard {
    let intents = Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT;
    Shard::new(ShardId::ONE, token.trim().to_string(), intents)
}

/// Drive `shard` until `shutdown` flips or the relay stops listening.
pub async fn run(
    mut shard: Shard,
    events: mpsc::Sender<RelayEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            item = shard.next_event(WANTED_EVENTS) => {
                let Some(item) = item else {
                    info!("Discord gateway stream ended");
                    break;
                };
                let event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Discord gateway receive error");
                        continue;
                    }
                };
                let Some(relay_event) = relay_event(&event) else {
                    continue;
                };
                if events.send(relay_event).await.is_err() {
                    debug!("Relay stopped listening, closing gateway");
                    break;
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    if let Err(e) = shard.sender().close(CloseFrame::NORMAL) {
        debug!(error = %e, "Discord gateway already closed");
        return;
    }
    let drained = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(item) = shard.next_event(EventTypeFlags::empty()).await {
            if matches!(item, Ok(Event::GatewayClose(_))) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("Timed out waiting for Discord to close the session");
    }
    info!("Discord gateway closed");
}

fn relay_event(event: &Event) -> Option<RelayEvent> {
    match event {
        Event::Ready(_) => {
            info!("Discord gateway ready");
            Some(RelayEvent::ChatReady)
        }
        Event::MessageCreate(message) => Some(RelayEvent::Inbound(inbound_message(&message.0))),
        _ => None,
    }
}

/// Flatten a gateway message into what the relay needs.
pub fn inbound_message(message: &Message) -> InboundMessage {
    let author = &message.author;
    let nick = message.member.as_ref().and_then(|m| m.nick.as_deref());
    InboundMessage {
        sender_display_name: display_name(nick, author.global_name.as_deref(), &author.name)
            .to_string(),
        sender_username: author.name.clone(),
        sender_id: author.id.get(),
        channel_id: message.channel_id.get(),
        author_is_bot: author.bot,
        raw_text: message.content.clone(),
        sticker: message.sticker_items.first().map(sticker_ref),
        custom_emojis: custom_emojis(&message.content),
    }
}

/// Guild nickname, then global display name, then account name.
pub fn display_name<'a>(
    nick: Option<&'a str>,
    global_name: Option<&'a str>,
    username: &'a str,
) -> &'a str {
    [nick, global_name]
        .into_iter()
        .flatten()
        .find(|name| !name.trim().is_empty())
        .unwrap_or(username)
}

pub fn sticker_ref(sticker: &MessageSticker) -> StickerRef {
    let format = match sticker.format_type {
        StickerFormatType::Apng => StickerFormat::Apng,
        StickerFormatType::Lottie => StickerFormat::Lottie,
        StickerFormatType::Gif => StickerFormat::Gif,
        _ => StickerFormat::Png,
    };
    StickerRef {
        id: sticker.id.get(),
        format,
    }
}

/// Gateway command replacing the bot's activity with `text`.
pub fn presence_update(text: &str, activity: ActivityKind) -> Result<UpdatePresence, ChatError> {
    let kind = match activity {
        ActivityKind::Playing => ActivityType::Playing,
        ActivityKind::Streaming => ActivityType::Streaming,
        ActivityKind::Listening => ActivityType::Listening,
        ActivityKind::Watching => ActivityType::Watching,
        ActivityKind::Competing => ActivityType::Competing,
    };
    let activity = MinimalActivity {
        kind,
        name: text.to_string(),
        url: None,
    };
    UpdatePresence::new(vec![activity.into()], false, None::<u64>, Status::Online)
        .map_err(|e| ChatError::Request(e.to_string()))
}

/// Send a presence update over an open session.
pub fn send_presence(
    sender: &MessageSender,
    text: &str,
    activity: ActivityKind,
) -> Result<(), ChatError> {
    let update = presence_update(text, activity)?;
    sender
        .command(&update)
        .map_err(|e| ChatError::Request(format!("gateway session closed: {e}")))
}
