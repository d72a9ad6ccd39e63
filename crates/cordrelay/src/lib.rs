//! cordrelay Library
//!
//! Relay coordination between a game session runtime and Discord:
//! - Paced outbound message queue in front of the chat client
//! - Presence debouncing (grace period, map-change suppression)
//! - Serialized, redrawn HUD messages for inbound emojis and stickers
//! - Cooperative tick scheduler that drives all timed behavior
//! - Stdin/stdout host for running against an external game server

pub mod chat;
pub mod host;
pub mod hud;
pub mod presence;
pub mod queue;
pub mod relay;
pub mod runtime;
pub mod tick;
