//! Configuration resolution for cordrelay.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. Settings file (explicit path, else `~/.config/cordrelay/settings.json`)
//! 3. Environment variables
//!
//! A missing settings file is created with the defaults so operators have
//! something to edit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Placeholder shipped in the default settings file.
pub const PLACEHOLDER_BOT_TOKEN: &str = "YOUR_DISCORD_BOT_TOKEN";

/// Placeholder shipped in the default settings file.
pub const PLACEHOLDER_INVITE_LINK: &str = "https://discord.gg/your-invite-code";

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bot_token: String,
    /// Channel that mirrors in-game chat and feeds inbound relay.
    pub chat_relay_channel_id: u64,
    /// Channel that receives join/leave/map-change notices.
    pub notification_channel_id: u64,
    pub features: FeatureFlags,
    /// Maps whose load is never announced (case-insensitive).
    pub map_blacklist: Vec<String>,
    pub timing: TimingConfig,
    pub messages: MessageConfig,
    pub colors: ColorConfig,
    pub in_game: InGameConfig,
    pub bot_status: BotStatusConfig,
    pub invite_announcer: InviteAnnouncerConfig,
    pub geo: GeoConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bot_token: PLACEHOLDER_BOT_TOKEN.to_string(),
            chat_relay_channel_id: 0,
            notification_channel_id: 0,
            features: FeatureFlags::default(),
            map_blacklist: vec!["ar_barrage".to_string()],
            timing: TimingConfig::default(),
            messages: MessageConfig::default(),
            colors: ColorConfig::default(),
            in_game: InGameConfig::default(),
            bot_status: BotStatusConfig::default(),
            invite_announcer: InviteAnnouncerConfig::default(),
            geo: GeoConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Whether a usable bot token is configured.
    pub fn has_bot_token(&self) -> bool {
        let token = self.bot_token.trim();
        !token.is_empty() && token != PLACEHOLDER_BOT_TOKEN
    }

    /// Whether the periodic invite announcement should run.
    pub fn invite_announcer_active(&self) -> bool {
        let link = self.invite_announcer.invite_link.trim();
        self.invite_announcer.enabled && !link.is_empty() && link != PLACEHOLDER_INVITE_LINK
    }

    /// Replace zero periods of repeating timers with their defaults.
    ///
    /// A zero period would re-arm on every tick and spin.
    pub fn clamp_intervals(&mut self) {
        let timing = TimingConfig::default();
        clamp_zero(
            "timing.idle_interval_ms",
            &mut self.timing.idle_interval_ms,
            timing.idle_interval_ms,
        );
        clamp_zero(
            "timing.hud_tick_ms",
            &mut self.timing.hud_tick_ms,
            timing.hud_tick_ms,
        );
        clamp_zero(
            "bot_status.update_interval_secs",
            &mut self.bot_status.update_interval_secs,
            BotStatusConfig::default().update_interval_secs,
        );
        clamp_zero(
            "invite_announcer.interval_secs",
            &mut self.invite_announcer.interval_secs,
            InviteAnnouncerConfig::default().interval_secs,
        );
    }
}

fn clamp_zero(field: &str, value: &mut u64, default: u64) {
    if *value == 0 {
        warn!(field, default, "Zero interval is not allowed, using default");
        *value = default;
    }
}

/// Per-feature switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct FeatureFlags {
    pub chat_relay: bool,
    pub join_message: bool,
    pub leave_message: bool,
    pub map_change_message: bool,
    pub inbound_relay: bool,
    pub hud_for_emoji: bool,
    pub hud_for_sticker: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            chat_relay: true,
            join_message: true,
            leave_message: true,
            map_change_message: true,
            inbound_relay: true,
            hud_for_emoji: true,
            hud_for_sticker: true,
        }
    }
}

/// Pacing and debounce tunables, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub pacing_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub recovery_window_ms: u64,
    pub hud_duration_ms: u64,
    pub hud_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pacing_interval_ms: 300,
            idle_interval_ms: 100,
            drain_timeout_ms: 5_000,
            grace_period_ms: 1_500,
            recovery_window_ms: 15_000,
            hud_duration_ms: 2_500,
            hud_tick_ms: 100,
        }
    }
}

impl TimingConfig {
    pub const fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub const fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub const fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    pub const fn hud_duration(&self) -> Duration {
        Duration::from_millis(self.hud_duration_ms)
    }

    pub const fn hud_tick(&self) -> Duration {
        Duration::from_millis(self.hud_tick_ms)
    }
}

/// Notification and relay templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Suffix after the linked player name in join embeds.
    pub join_message: String,
    /// Suffix after the linked player name in leave embeds.
    pub leave_message: String,
    /// Uses `{map}`.
    pub map_change_message: String,
    /// Plain in-game line for inbound chat. Uses `{user}`, `{username}`,
    /// `{user_id}`, `{message}`.
    pub inbound_format: String,
    /// HUD markup for inbound chat carrying custom emojis. Adds `{emojis}`.
    pub inbound_hud_format: String,
    /// HUD markup for inbound stickers. Uses `{sticker_url}`.
    pub inbound_hud_sticker_format: String,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            join_message: "has connected.".to_string(),
            leave_message: "has disconnected.".to_string(),
            map_change_message: "🗺️ Map changed to **{map}**".to_string(),
            inbound_format: " [Discord] {user} ({username}): {message}".to_string(),
            inbound_hud_format: "<center><font color='white' size='6'>{user} ({username})</font><br>{emojis}<br><font color='lightgray' size='5'>{message}</font></center>".to_string(),
            inbound_hud_sticker_format: "<center><font color='white' size='6'>{user} ({username})</font><br><img src='{sticker_url}' style='max-width:128px; max-height:128px;'></center>".to_string(),
        }
    }
}

/// Embed colors as `0xRRGGBB`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub join: u32,
    pub leave: u32,
    pub map_change: u32,
    pub chat: u32,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            join: 0x00FF00,
            leave: 0xFF0000,
            map_change: 0x3498DB,
            chat: 0x5DADE2,
        }
    }
}

/// In-game join/leave broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InGameConfig {
    pub enabled: bool,
    pub join_format: String,
    pub leave_format: String,
}

impl Default for InGameConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            join_format: " [+] {player_name} ({steam_id}) connected from {country_name}."
                .to_string(),
            leave_format: " [-] {player_name} ({steam_id}) from {country_name} has disconnected."
                .to_string(),
        }
    }
}

/// Activity shown next to the bot's status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Playing,
    Streaming,
    Listening,
    Watching,
    Competing,
}

/// Periodic bot presence update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotStatusConfig {
    pub enabled: bool,
    pub update_interval_secs: u64,
    pub activity: ActivityKind,
    /// Uses `{map}`, `{players}`, `{max_players}`.
    pub format: String,
}

impl Default for BotStatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_secs: 60,
            activity: ActivityKind::Watching,
            format: "{map} | {players}/{max_players} players".to_string(),
        }
    }
}

/// Periodic in-game invite link announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteAnnouncerConfig {
    pub enabled: bool,
    pub invite_link: String,
    pub interval_secs: u64,
    /// Uses `{link}`.
    pub format: String,
}

impl Default for InviteAnnouncerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            invite_link: PLACEHOLDER_INVITE_LINK.to_string(),
            interval_secs: 600,
            format: " [SERVER] Join our community on Discord! {link}".to_string(),
        }
    }
}

/// Geolocation sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// MaxMind GeoLite2/GeoIP2 country database (`.mmdb`).
    pub database_path: Option<PathBuf>,
    /// Fixed entries keyed by IP address, used when no database is set.
    pub entries: HashMap<String, GeoEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoEntry {
    /// ISO 3166-1 alpha-2 code, e.g. `"DE"`.
    pub country_code: String,
    pub country_name: String,
}

/// Load configuration from `path`, or from [`default_config_path`].
///
/// Writes the defaults to disk when the file does not exist yet.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()
            .ok_or_else(|| Error::Config("Cannot determine config directory".into()))?,
    };

    let mut config = if path.exists() {
        load_config_file(&path)?
    } else {
        let config = RelayConfig::default();
        write_config_file(&path, &config)?;
        info!(path = %path.display(), "Wrote default configuration");
        config
    };

    apply_env_overrides(&mut config);
    config.clamp_intervals();
    Ok(config)
}

/// Default settings file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cordrelay").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<RelayConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Write `config` as pretty-printed JSON, creating parent directories.
pub fn write_config_file(path: &Path, config: &RelayConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(val) = std::env::var("CORDRELAY_BOT_TOKEN") {
        config.bot_token = val;
    }
    if let Ok(val) = std::env::var("CORDRELAY_GEOIP_DB") {
        config.geo.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("CORDRELAY_CHAT_CHANNEL_ID")
        && let Ok(id) = val.parse()
    {
        config.chat_relay_channel_id = id;
    }
    if let Ok(val) = std::env::var("CORDRELAY_NOTIFICATION_CHANNEL_ID")
        && let Ok(id) = val.parse()
    {
        config.notification_channel_id = id;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_timings() {
        let timing = TimingConfig::default();
        assert_eq!(timing.pacing_interval(), Duration::from_millis(300));
        assert_eq!(timing.grace_period(), Duration::from_millis(1500));
        assert_eq!(timing.recovery_window(), Duration::from_secs(15));
        assert_eq!(timing.hud_duration(), Duration::from_millis(2500));
    }

    #[test]
    fn placeholder_token_is_not_usable() {
        let mut config = RelayConfig::default();
        assert!(!config.has_bot_token());
        config.bot_token = "   ".to_string();
        assert!(!config.has_bot_token());
        config.bot_token = "abc.def.ghi".to_string();
        assert!(config.has_bot_token());
    }

    #[test]
    fn invite_announcer_requires_real_link() {
        let mut config = RelayConfig::default();
        assert!(!config.invite_announcer_active());
        config.invite_announcer.invite_link = "https://discord.gg/abc".to_string();
        assert!(config.invite_announcer_active());
        config.invite_announcer.enabled = false;
        assert!(!config.invite_announcer_active());
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let config = load_config(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.map_blacklist, vec!["ar_barrage".to_string()]);

        let written: RelayConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.timing.hud_tick_ms, 100);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"notification_channel_id": 42, "features": {"leave_message": false},
                "bot_status": {"activity": "Competing"}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.notification_channel_id, 42);
        assert!(!config.features.leave_message);
        assert!(config.features.join_message);
        assert_eq!(config.bot_status.activity, ActivityKind::Competing);
        assert_eq!(config.colors.join, 0x00FF00);
    }

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"timing": {"hud_tick_ms": 0, "idle_interval_ms": 0, "pacing_interval_ms": 0},
                "bot_status": {"update_interval_secs": 0},
                "invite_announcer": {"interval_secs": 0}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.timing.hud_tick_ms, 100);
        assert_eq!(config.timing.idle_interval_ms, 100);
        assert_eq!(config.bot_status.update_interval_secs, 60);
        assert_eq!(config.invite_announcer.interval_secs, 600);
        // Not a timer period: zero means "no pacing".
        assert_eq!(config.timing.pacing_interval_ms, 0);
    }

    #[test]
    fn geo_database_path_is_read() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"geo": {"database_path": "/var/lib/GeoLite2-Country.mmdb"}}"#)
                .unwrap();
        assert_eq!(
            config.geo.database_path.as_deref(),
            Some(Path::new("/var/lib/GeoLite2-Country.mmdb"))
        );
        assert!(config.geo.entries.is_empty());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
