//! Chat-network messages mirrored into the game session.

use std::sync::LazyLock;

use regex::Regex;

use cordrelay_core::RelayConfig;
use cordrelay_core::template::{fill, html_encode};

use crate::chat::{EmojiRef, InboundMessage, StickerFormat};

/// Inline custom emoji code, e.g. `<:pog:1234>` or `<a:party:5678>`.
#[allow(clippy::expect_used)]
static EMOJI_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(a?):(\w+):(\d+)>").expect("static regex is valid"));

/// Custom emojis referenced inline in `text`, in order of appearance.
pub fn custom_emojis(text: &str) -> Vec<EmojiRef> {
    EMOJI_CODE
        .captures_iter(text)
        .filter_map(|caps| {
            Some(EmojiRef {
                id: caps[3].parse().ok()?,
                name: caps[2].to_string(),
                animated: !caps[1].is_empty(),
            })
        })
        .collect()
}

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// Show as a HUD job.
    Hud(String),
    /// Print to every player's chat on the next tick.
    Broadcast(String),
    Ignore,
}

/// Decide how `msg` reaches the session.
///
/// A renderable sticker wins over everything else; custom emojis turn the
/// message into a HUD job; anything else with text becomes a chat line.
pub fn plan(config: &RelayConfig, msg: &InboundMessage) -> InboundAction {
    if !config.features.inbound_relay
        || msg.author_is_bot
        || msg.channel_id != config.chat_relay_channel_id
    {
        return InboundAction::Ignore;
    }

    let display_name = if msg.sender_display_name.trim().is_empty() {
        msg.sender_username.as_str()
    } else {
        msg.sender_display_name.as_str()
    };
    let user_id = msg.sender_id.to_string();

    if config.features.hud_for_sticker
        && let Some(sticker) = &msg.sticker
        && sticker.format != StickerFormat::Lottie
    {
        let user = html_encode(display_name);
        let url = sticker.url();
        return InboundAction::Hud(fill(
            &config.messages.inbound_hud_sticker_format,
            &[
                ("user", &user),
                ("username", &msg.sender_username),
                ("user_id", &user_id),
                ("sticker_url", &url),
            ],
        ));
    }

    if config.features.hud_for_emoji && !msg.custom_emojis.is_empty() {
        let emojis = msg
            .custom_emojis
            .iter()
            .map(|e| format!("<img src='{}'>", e.url()))
            .collect::<Vec<_>>()
            .join(" ");
        let text = EMOJI_CODE.replace_all(&msg.raw_text, "");
        let message = html_encode(text.trim()).replace('\n', "<br>");
        let user = html_encode(display_name);
        return InboundAction::Hud(fill(
            &config.messages.inbound_hud_format,
            &[
                ("user", &user),
                ("username", &msg.sender_username),
                ("user_id", &user_id),
                ("emojis", &emojis),
                ("message", &message),
            ],
        ));
    }

    if msg.raw_text.trim().is_empty() {
        return InboundAction::Ignore;
    }
    InboundAction::Broadcast(fill(
        &config.messages.inbound_format,
        &[
            ("user", display_name),
            ("username", &msg.sender_username),
            ("user_id", &user_id),
            ("message", &msg.raw_text),
        ],
    ))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::chat::StickerRef;

    const CHANNEL: u64 = 42;

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.chat_relay_channel_id = CHANNEL;
        config.messages.inbound_hud_format = "{user}|{emojis}|{message}".to_string();
        config.messages.inbound_hud_sticker_format = "{user}|{sticker_url}".to_string();
        config.messages.inbound_format = "{user} ({username}/{user_id}): {message}".to_string();
        config
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            sender_display_name: "Ann <3".to_string(),
            sender_username: "ann".to_string(),
            sender_id: 7,
            channel_id: CHANNEL,
            author_is_bot: false,
            raw_text: text.to_string(),
            sticker: None,
            custom_emojis: Vec::new(),
        }
    }

    fn pog() -> EmojiRef {
        EmojiRef {
            id: 99,
            name: "pog".to_string(),
            animated: false,
        }
    }

    #[test]
    fn emoji_codes_are_extracted() {
        let emojis = custom_emojis("gg <:pog:99> <a:party:1234> <:broken:x> :plain:");
        assert_eq!(
            emojis,
            vec![
                pog(),
                EmojiRef {
                    id: 1234,
                    name: "party".to_string(),
                    animated: true,
                },
            ]
        );
        assert!(custom_emojis("no emojis here").is_empty());
    }

    #[test]
    fn plain_text_is_broadcast_unescaped() {
        let action = plan(&config(), &message("hi <b>all</b>"));
        assert_eq!(
            action,
            InboundAction::Broadcast("Ann <3 (ann/7): hi <b>all</b>".to_string())
        );
    }

    #[test]
    fn blank_text_bot_and_foreign_channel_are_ignored() {
        let config = config();
        assert_eq!(plan(&config, &message("   ")), InboundAction::Ignore);

        let mut bot = message("hi");
        bot.author_is_bot = true;
        assert_eq!(plan(&config, &bot), InboundAction::Ignore);

        let mut elsewhere = message("hi");
        elsewhere.channel_id = CHANNEL + 1;
        assert_eq!(plan(&config, &elsewhere), InboundAction::Ignore);
    }

    #[test]
    fn inbound_relay_flag_gates_everything() {
        let mut config = config();
        config.features.inbound_relay = false;
        let mut msg = message("hi");
        msg.custom_emojis.push(pog());
        assert_eq!(plan(&config, &msg), InboundAction::Ignore);
    }

    #[test]
    fn sticker_becomes_hud_and_wins_over_emojis() {
        let mut msg = message("look <:pog:99>");
        msg.sticker = Some(StickerRef {
            id: 5,
            format: StickerFormat::Apng,
        });
        msg.custom_emojis.push(pog());

        let action = plan(&config(), &msg);
        assert_eq!(
            action,
            InboundAction::Hud(
                "Ann &lt;3|https://cdn.discordapp.com/stickers/5.png".to_string()
            )
        );
    }

    #[test]
    fn lottie_sticker_falls_through() {
        let mut msg = message("text");
        msg.sticker = Some(StickerRef {
            id: 5,
            format: StickerFormat::Lottie,
        });
        assert!(matches!(plan(&config(), &msg), InboundAction::Broadcast(_)));

        msg.raw_text.clear();
        assert_eq!(plan(&config(), &msg), InboundAction::Ignore);
    }

    #[test]
    fn emoji_message_is_encoded_for_hud() {
        let mut msg = message("<:pog:99> so <good>\nyes <a:party:12>");
        msg.custom_emojis.push(pog());
        msg.custom_emojis.push(EmojiRef {
            id: 12,
            name: "party".to_string(),
            animated: true,
        });

        let InboundAction::Hud(html) = plan(&config(), &msg) else {
            panic!("expected HUD job");
        };
        assert_eq!(
            html,
            "Ann &lt;3|<img src='https://cdn.discordapp.com/emojis/99.png'> \
             <img src='https://cdn.discordapp.com/emojis/12.gif'>|so &lt;good&gt;<br>yes"
        );
    }

    #[test]
    fn emoji_hud_disabled_falls_back_to_text() {
        let mut config = config();
        config.features.hud_for_emoji = false;
        let mut msg = message("<:pog:99>");
        msg.custom_emojis.push(pog());
        assert_eq!(
            plan(&config, &msg),
            InboundAction::Broadcast("Ann <3 (ann/7): <:pog:99>".to_string())
        );
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let mut msg = message("hi");
        msg.sender_display_name.clear();
        assert_eq!(
            plan(&config(), &msg),
            InboundAction::Broadcast("ann (ann/7): hi".to_string())
        );
    }
}
