//! Relay context.
//!
//! [`Relay`] owns everything that lives in the cooperative domain: presence
//! tracking, HUD scheduling, periodic tasks and the session runtime. The host
//! feeds it [`RelayEvent`]s and calls [`Relay::tick`] from its frame loop.
//! The only thing handed to other threads is the [`OutboundQueue`].

pub mod inbound;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use cordrelay_core::template::fill;
use cordrelay_core::{GeoLookup, RelayConfig};

use crate::chat::{ChannelId, ChatClient, InboundMessage, Payload};
use crate::hud::{HudScheduler, HudSettings, HudTask};
use crate::presence::{
    OccupantConnect, PresenceNotice, PresenceRecord, PresenceSettings, PresenceTask,
    PresenceTracker,
};
use crate::queue::OutboundQueue;
use crate::runtime::{SessionRuntime, Slot};
use crate::tick::{TickScheduler, TimerHandle};

use self::inbound::InboundAction;

/// Session name before the first map has loaded.
pub const INITIAL_MAP: &str = "Lobby";

const PROFILE_URL: &str = "https://steamcommunity.com/profiles";

/// A chat line typed by a player in the game.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameChat {
    pub slot: Slot,
    pub display_name: String,
    #[serde(default)]
    pub identity_key: String,
    pub message: String,
    /// Sent with `say_team`.
    #[serde(default)]
    pub team: bool,
    #[serde(default)]
    pub is_bot: bool,
}

/// Something that happened in the session runtime or on the chat network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    OccupantConnected(OccupantConnect),
    OccupantDisconnected {
        slot: Slot,
        #[serde(default)]
        is_bot: bool,
    },
    SessionBoundaryStart,
    SessionBoundaryEnd {
        session_id: String,
    },
    GameChat(GameChat),
    /// The chat client finished connecting.
    ChatReady,
    Inbound(InboundMessage),
}

/// Every kind of timed work in the cooperative domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTask {
    Presence(PresenceTask),
    Hud(HudTask),
    RefreshStatus,
    AnnounceInvite,
    Broadcast(String),
}

impl From<PresenceTask> for RelayTask {
    fn from(task: PresenceTask) -> Self {
        Self::Presence(task)
    }
}

impl From<HudTask> for RelayTask {
    fn from(task: HudTask) -> Self {
        Self::Hud(task)
    }
}

/// Chat-network side of the relay. Absent when no bot token is configured.
#[derive(Clone)]
pub struct ChatLink {
    pub client: Arc<dyn ChatClient>,
    pub queue: OutboundQueue,
}

/// The relay service object.
pub struct Relay<R: SessionRuntime> {
    config: Arc<RelayConfig>,
    runtime: R,
    geo: Arc<dyn GeoLookup>,
    chat: Option<ChatLink>,
    sched: TickScheduler<RelayTask>,
    presence: PresenceTracker,
    hud: HudScheduler,
    current_map: String,
    status_timer: Option<TimerHandle>,
    announcer_timer: Option<TimerHandle>,
    chat_missing_logged: bool,
}

impl<R: SessionRuntime> Relay<R> {
    pub fn new(
        config: Arc<RelayConfig>,
        runtime: R,
        geo: Arc<dyn GeoLookup>,
        chat: Option<ChatLink>,
    ) -> Self {
        let mut sched = TickScheduler::new();
        let announcer_timer = config.invite_announcer_active().then(|| {
            info!(
                interval_secs = config.invite_announcer.interval_secs,
                "Invite announcer enabled"
            );
            sched.schedule_repeating(
                Duration::from_secs(config.invite_announcer.interval_secs),
                RelayTask::AnnounceInvite,
            )
        });

        Self {
            presence: PresenceTracker::new(PresenceSettings::from(config.as_ref())),
            hud: HudScheduler::new(HudSettings::from(&config.timing)),
            config,
            runtime,
            geo,
            chat,
            sched,
            current_map: INITIAL_MAP.to_string(),
            status_timer: None,
            announcer_timer,
            chat_missing_logged: false,
        }
    }

    /// Apply one event at time `now`.
    pub fn handle(&mut self, event: RelayEvent, now: Duration) {
        self.sched.set_time(now);
        match event {
            RelayEvent::OccupantConnected(occupant) => {
                let notices =
                    self.presence
                        .on_connect(&occupant, self.geo.as_ref(), &mut self.sched);
                self.publish(notices);
            }
            RelayEvent::OccupantDisconnected { slot, is_bot } => {
                self.presence.on_disconnect(slot, is_bot, &mut self.sched);
            }
            RelayEvent::SessionBoundaryStart => {
                self.presence.on_boundary_start(&mut self.sched);
            }
            RelayEvent::SessionBoundaryEnd { session_id } => {
                let notice = self.presence.on_boundary_end(&session_id, &mut self.sched);
                self.current_map = session_id;
                self.publish(notice);
            }
            RelayEvent::GameChat(chat) => self.relay_game_chat(&chat),
            RelayEvent::ChatReady => self.start_status_updates(),
            RelayEvent::Inbound(msg) => match inbound::plan(&self.config, &msg) {
                InboundAction::Hud(html) => self.hud.enqueue(html, &mut self.sched),
                InboundAction::Broadcast(text) => {
                    self.sched.run_on_next_tick(RelayTask::Broadcast(text));
                }
                InboundAction::Ignore => {}
            },
        }
    }

    /// Run everything due at `now`.
    pub fn tick(&mut self, now: Duration) {
        self.sched.advance(now);
        while let Some(task) = self.sched.pop_due() {
            self.dispatch(task);
        }
    }

    /// When [`tick`](Self::tick) next has work to do.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.sched.next_deadline()
    }

    /// Stop all timed work and forget presence state.
    pub fn shutdown(&mut self) {
        self.hud.clear(&mut self.sched);
        self.presence.shutdown(&mut self.sched);
        for timer in [self.status_timer.take(), self.announcer_timer.take()]
            .into_iter()
            .flatten()
        {
            self.sched.cancel(timer);
        }
        self.sched.clear();
        info!("Relay shut down");
    }

    pub fn current_map(&self) -> &str {
        &self.current_map
    }

    pub const fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub const fn hud(&self) -> &HudScheduler {
        &self.hud
    }

    pub const fn runtime(&self) -> &R {
        &self.runtime
    }

    pub const fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    fn dispatch(&mut self, task: RelayTask) {
        match task {
            RelayTask::Presence(task) => {
                let notices = self.presence.on_task(task);
                self.publish(notices);
            }
            RelayTask::Hud(task) => self.hud.on_task(task, &mut self.runtime, &mut self.sched),
            RelayTask::RefreshStatus => self.refresh_status(),
            RelayTask::AnnounceInvite => self.announce_invite(),
            RelayTask::Broadcast(text) => self.runtime.broadcast_text(&text),
        }
    }

    fn publish(&mut self, notices: impl IntoIterator<Item = PresenceNotice>) {
        let config = Arc::clone(&self.config);
        for notice in notices {
            match notice {
                PresenceNotice::Joined(record) => {
                    if config.features.join_message {
                        let embed = presence_embed(
                            &record,
                            &config.messages.join_message,
                            config.colors.join,
                        );
                        self.notify(config.notification_channel_id, embed);
                    }
                    self.broadcast_presence(&record, &config.in_game.join_format);
                }
                PresenceNotice::Left(record) => {
                    if config.features.leave_message {
                        let embed = presence_embed(
                            &record,
                            &config.messages.leave_message,
                            config.colors.leave,
                        );
                        self.notify(config.notification_channel_id, embed);
                    }
                    self.broadcast_presence(&record, &config.in_game.leave_format);
                }
                PresenceNotice::SessionChanged { session_id } => {
                    let description =
                        fill(&config.messages.map_change_message, &[("map", &session_id)]);
                    let embed = Payload::embed(description, config.colors.map_change);
                    self.notify(config.notification_channel_id, embed);
                }
            }
        }
    }

    fn broadcast_presence(&mut self, record: &PresenceRecord, format: &str) {
        if !self.config.in_game.enabled {
            return;
        }
        let line = fill(
            format,
            &[
                ("player_name", &record.display_name),
                ("steam_id", &record.identity_key),
                ("country_name", &record.country_name),
            ],
        );
        self.runtime.broadcast_text(&line);
    }

    /// Queue `payload` for the chat network, if there is one.
    fn notify(&mut self, channel: ChannelId, payload: Payload) {
        match &self.chat {
            Some(link) => link.queue.enqueue(channel, payload),
            None => {
                if !self.chat_missing_logged {
                    self.chat_missing_logged = true;
                    warn!("No chat client configured, chat notifications are disabled");
                }
            }
        }
    }

    fn relay_game_chat(&mut self, chat: &GameChat) {
        if !self.config.features.chat_relay || chat.is_bot || chat.display_name.is_empty() {
            return;
        }

        let message = chat.message.trim();
        if message.is_empty() || message == "\"\"" {
            return;
        }
        let message = message
            .strip_prefix('"')
            .and_then(|m| m.strip_suffix('"'))
            .unwrap_or(message);

        let prefix = if chat.team { "(Team) " } else { "" };
        let flag = self.presence.flag_for_slot(chat.slot);
        let description = format!(
            "{prefix}{flag} [{}]({PROFILE_URL}/{}): {message}",
            chat.display_name, chat.identity_key
        );
        let embed = Payload::embed(description, self.config.colors.chat);
        self.notify(self.config.chat_relay_channel_id, embed);
    }

    fn start_status_updates(&mut self) {
        let status = &self.config.bot_status;
        if !status.enabled {
            return;
        }
        if let Some(timer) = self.status_timer.take() {
            self.sched.cancel(timer);
        }
        let interval = Duration::from_secs(status.update_interval_secs);
        self.status_timer = Some(
            self.sched
                .schedule_repeating(interval, RelayTask::RefreshStatus),
        );
        info!(
            interval_secs = status.update_interval_secs,
            "Bot status updates started"
        );
    }

    /// Text for the bot's presence line.
    pub fn status_text(&self) -> String {
        let players = self.runtime.eligible_recipients().len().to_string();
        let max_players = self.runtime.max_occupants().to_string();
        fill(
            &self.config.bot_status.format,
            &[
                ("map", &self.current_map),
                ("players", &players),
                ("max_players", &max_players),
            ],
        )
    }

    fn refresh_status(&self) {
        let Some(link) = &self.chat else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, skipping status update");
            return;
        };

        let text = self.status_text();
        let activity = self.config.bot_status.activity;
        let client = Arc::clone(&link.client);
        handle.spawn(async move {
            if let Err(e) = client.set_presence_status(&text, activity).await {
                debug!(error = %e, "Bot status update failed");
            }
        });
    }

    fn announce_invite(&mut self) {
        if self.runtime.eligible_recipients().is_empty() {
            return;
        }
        let announcer = &self.config.invite_announcer;
        let line = fill(&announcer.format, &[("link", &announcer.invite_link)]);
        self.runtime.broadcast_text(&line);
    }
}

/// Join/leave embed: flag, linked bold name, then the configured suffix.
fn presence_embed(record: &PresenceRecord, suffix: &str, color: u32) -> Payload {
    Payload::embed(
        format!(
            "{} [**{}**]({PROFILE_URL}/{}) {suffix}",
            record.country_flag, record.display_name, record.identity_key
        ),
        color,
    )
}
