//! Presence debouncing.
//!
//! Turns raw connect/disconnect events and map changes into stable join and
//! leave notices. Each slot moves through
//! `Absent → Present → PendingDeparture → (Absent | Present)`:
//!
//! - a disconnect only starts a grace timer; a reconnect before it fires
//!   cancels the departure silently
//! - a map change (session boundary) cancels every pending departure and
//!   puts every present identity in a suppression set, so the mass
//!   disconnect/reconnect around the boundary announces nothing
//! - a fixed recovery window after the new map loads clears the suppression
//!   set and re-enables departure tracking
//!
//! Timers live in the caller's [`TickScheduler`]; fired [`PresenceTask`]s
//! must be routed back to [`PresenceTracker::on_task`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use cordrelay_core::config::RelayConfig;
use cordrelay_core::geo::{GENERIC_FLAG, GeoLookup};

use crate::runtime::Slot;
use crate::tick::{TickScheduler, TimerHandle};

/// Timed work owned by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTask {
    /// Grace period for a disconnect elapsed.
    ConfirmDeparture { slot: Slot, generation: u64 },
    /// Recovery window after a map change elapsed.
    EndRecovery { epoch: u64 },
}

/// A fully connected player as reported by the session runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OccupantConnect {
    pub slot: Slot,
    /// Stable account id; `None` until the player is authenticated.
    #[serde(default)]
    pub identity_key: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub source_address: String,
    #[serde(default)]
    pub is_bot: bool,
}

/// What the relay knows about a present player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub slot: Slot,
    pub identity_key: String,
    pub display_name: String,
    pub source_address: String,
    pub country_flag: String,
    pub country_name: String,
}

/// Debounced output of the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceNotice {
    Joined(PresenceRecord),
    Left(PresenceRecord),
    SessionChanged { session_id: String },
}

#[derive(Debug)]
struct PendingDeparture {
    record: PresenceRecord,
    timer: TimerHandle,
    generation: u64,
}

/// Tracker tunables.
#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub grace_period: Duration,
    pub recovery_window: Duration,
    pub announce_session_change: bool,
    /// Lowercased session identifiers that are never announced.
    pub session_denylist: HashSet<String>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for PresenceSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            grace_period: config.timing.grace_period(),
            recovery_window: config.timing.recovery_window(),
            announce_session_change: config.features.map_change_message,
            session_denylist: config
                .map_blacklist
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
        }
    }
}

/// Per-slot presence state machine.
#[derive(Debug)]
pub struct PresenceTracker {
    settings: PresenceSettings,
    records: HashMap<Slot, PresenceRecord>,
    pending: HashMap<Slot, PendingDeparture>,
    suppressed: HashSet<String>,
    boundary_in_progress: bool,
    recovery_timer: Option<TimerHandle>,
    /// Bumped at every session boundary start.
    epoch: u64,
    next_generation: u64,
    last_announced_session: Option<String>,
}

impl PresenceTracker {
    pub fn new(settings: PresenceSettings) -> Self {
        Self {
            settings,
            records: HashMap::new(),
            pending: HashMap::new(),
            suppressed: HashSet::new(),
            boundary_in_progress: false,
            recovery_timer: None,
            epoch: 0,
            next_generation: 0,
            last_announced_session: None,
        }
    }

    /// Handle a full connect.
    ///
    /// Unauthenticated players and bots are ignored entirely.
    pub fn on_connect<T>(
        &mut self,
        occupant: &OccupantConnect,
        geo: &dyn GeoLookup,
        sched: &mut TickScheduler<T>,
    ) -> Vec<PresenceNotice> {
        let Some(identity) = occupant.identity_key.as_deref().filter(|k| !k.is_empty()) else {
            return Vec::new();
        };
        if occupant.is_bot {
            return Vec::new();
        }

        let slot = occupant.slot;
        let mut notices = Vec::new();

        if let Some(pending) = self.pending.remove(&slot) {
            sched.cancel(pending.timer);
            if pending.record.identity_key == identity {
                debug!(slot, identity = %identity, "Reconnect within grace period");
                return notices;
            }
            // Slot recycled by someone else before the grace period ended:
            // the earlier player really left.
            self.records.remove(&slot);
            notices.push(PresenceNotice::Left(pending.record));
        }

        if self.suppressed.remove(identity) {
            debug!(slot, identity = %identity, "Suppressed reconnect after map change");
            if let Some(previous) = self.records.insert(slot, build_record(occupant, identity, geo))
                && previous.identity_key != identity
            {
                notices.push(PresenceNotice::Left(previous));
            }
            return notices;
        }

        if self
            .records
            .get(&slot)
            .is_some_and(|existing| existing.identity_key == identity)
        {
            return notices;
        }

        let record = build_record(occupant, identity, geo);
        info!(slot, identity = %identity, name = %record.display_name, "Player joined");
        if let Some(previous) = self.records.insert(slot, record.clone()) {
            // Stale record for a slot that changed hands without a disconnect.
            notices.push(PresenceNotice::Left(previous));
        }
        notices.push(PresenceNotice::Joined(record));
        notices
    }

    /// Handle a disconnect by starting the grace period.
    pub fn on_disconnect<T: From<PresenceTask>>(
        &mut self,
        slot: Slot,
        is_bot: bool,
        sched: &mut TickScheduler<T>,
    ) {
        if is_bot || self.boundary_in_progress || self.pending.contains_key(&slot) {
            return;
        }
        let Some(record) = self.records.get(&slot) else {
            return;
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let timer = sched.schedule_once(
            self.settings.grace_period,
            PresenceTask::ConfirmDeparture { slot, generation }.into(),
        );
        debug!(slot, identity = %record.identity_key, "Departure pending");
        self.pending.insert(
            slot,
            PendingDeparture {
                record: record.clone(),
                timer,
                generation,
            },
        );
    }

    /// Handle a fired tracker timer.
    pub fn on_task(&mut self, task: PresenceTask) -> Vec<PresenceNotice> {
        match task {
            PresenceTask::ConfirmDeparture { slot, generation } => self
                .confirm_departure(slot, generation)
                .into_iter()
                .collect(),
            PresenceTask::EndRecovery { epoch } => {
                self.end_recovery(epoch);
                Vec::new()
            }
        }
    }

    /// The old session is being torn down.
    pub fn on_boundary_start<T>(&mut self, sched: &mut TickScheduler<T>) {
        self.boundary_in_progress = true;
        self.epoch += 1;

        if let Some(timer) = self.recovery_timer.take() {
            sched.cancel(timer);
        }
        for (_, pending) in self.pending.drain() {
            sched.cancel(pending.timer);
        }

        self.suppressed.clear();
        self.suppressed
            .extend(self.records.drain().map(|(_, r)| r.identity_key));
        info!(
            suppressed = self.suppressed.len(),
            "Session boundary started"
        );
    }

    /// A new session has loaded.
    pub fn on_boundary_end<T: From<PresenceTask>>(
        &mut self,
        session_id: &str,
        sched: &mut TickScheduler<T>,
    ) -> Option<PresenceNotice> {
        let notice = self.session_change_notice(session_id);

        if let Some(timer) = self.recovery_timer.take() {
            sched.cancel(timer);
        }
        self.recovery_timer = Some(sched.schedule_once(
            self.settings.recovery_window,
            PresenceTask::EndRecovery { epoch: self.epoch }.into(),
        ));
        info!(session_id, "Session boundary ended");
        notice
    }

    /// Cancel every timer and forget all state.
    pub fn shutdown<T>(&mut self, sched: &mut TickScheduler<T>) {
        if let Some(timer) = self.recovery_timer.take() {
            sched.cancel(timer);
        }
        for (_, pending) in self.pending.drain() {
            sched.cancel(pending.timer);
        }
        self.records.clear();
        self.suppressed.clear();
        self.boundary_in_progress = false;
    }

    pub fn record(&self, slot: Slot) -> Option<&PresenceRecord> {
        self.records.get(&slot)
    }

    /// Flag glyph for the player in `slot`, or the generic flag.
    pub fn flag_for_slot(&self, slot: Slot) -> &str {
        self.records
            .get(&slot)
            .map(|r| r.country_flag.as_str())
            .filter(|f| !f.is_empty())
            .unwrap_or(GENERIC_FLAG)
    }

    pub fn is_departure_pending(&self, slot: Slot) -> bool {
        self.pending.contains_key(&slot)
    }

    pub fn is_suppressed(&self, identity: &str) -> bool {
        self.suppressed.contains(identity)
    }

    pub const fn boundary_in_progress(&self) -> bool {
        self.boundary_in_progress
    }

    pub fn present_count(&self) -> usize {
        self.records.len()
    }

    fn confirm_departure(&mut self, slot: Slot, generation: u64) -> Option<PresenceNotice> {
        if self
            .pending
            .get(&slot)
            .is_none_or(|p| p.generation != generation)
        {
            return None;
        }
        let pending = self.pending.remove(&slot)?;
        if self
            .records
            .get(&slot)
            .is_some_and(|r| r.identity_key == pending.record.identity_key)
        {
            self.records.remove(&slot);
        }
        info!(
            slot,
            identity = %pending.record.identity_key,
            name = %pending.record.display_name,
            "Player left"
        );
        Some(PresenceNotice::Left(pending.record))
    }

    fn end_recovery(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        self.recovery_timer = None;
        self.boundary_in_progress = false;
        if !self.suppressed.is_empty() {
            debug!(
                expired = self.suppressed.len(),
                "Suppression expired for players that never reconnected"
            );
        }
        self.suppressed.clear();
    }

    fn session_change_notice(&mut self, session_id: &str) -> Option<PresenceNotice> {
        if !self.settings.announce_session_change
            || self.last_announced_session.as_deref() == Some(session_id)
        {
            return None;
        }
        self.last_announced_session = Some(session_id.to_string());
        if self
            .settings
            .session_denylist
            .contains(&session_id.to_lowercase())
        {
            debug!(session_id, "Session change not announced (denylisted)");
            return None;
        }
        Some(PresenceNotice::SessionChanged {
            session_id: session_id.to_string(),
        })
    }
}

fn build_record(occupant: &OccupantConnect, identity: &str, geo: &dyn GeoLookup) -> PresenceRecord {
    let info = geo.lookup(&occupant.source_address);
    PresenceRecord {
        slot: occupant.slot,
        identity_key: identity.to_string(),
        display_name: occupant.display_name.clone(),
        source_address: occupant.source_address.clone(),
        country_flag: info.flag,
        country_name: info.country_name,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cordrelay_core::geo::UnknownGeo;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn player(slot: Slot, identity: &str) -> OccupantConnect {
        OccupantConnect {
            slot,
            identity_key: Some(identity.to_string()),
            display_name: format!("player-{identity}"),
            source_address: "203.0.113.7:27005".to_string(),
            is_bot: false,
        }
    }

    struct Harness {
        tracker: PresenceTracker,
        sched: TickScheduler<PresenceTask>,
        notices: Vec<PresenceNotice>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tracker: PresenceTracker::new(PresenceSettings::default()),
                sched: TickScheduler::new(),
                notices: Vec::new(),
            }
        }

        fn at(&mut self, now: u64) -> &mut Self {
            self.sched.advance(ms(now));
            while let Some(task) = self.sched.pop_due() {
                let out = self.tracker.on_task(task);
                self.notices.extend(out);
            }
            self
        }

        fn connect(&mut self, occupant: &OccupantConnect) {
            let out = self.tracker.on_connect(occupant, &UnknownGeo, &mut self.sched);
            self.notices.extend(out);
        }

        fn disconnect(&mut self, slot: Slot) {
            self.tracker.on_disconnect(slot, false, &mut self.sched);
        }

        fn joins(&self) -> usize {
            self.notices
                .iter()
                .filter(|n| matches!(n, PresenceNotice::Joined(_)))
                .count()
        }

        fn leaves(&self) -> usize {
            self.notices
                .iter()
                .filter(|n| matches!(n, PresenceNotice::Left(_)))
                .count()
        }
    }

    #[test]
    fn first_connect_joins_once() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.connect(&player(1, "A"));

        assert_eq!(h.joins(), 1);
        let record = h.tracker.record(1).unwrap();
        assert_eq!(record.identity_key, "A");
        assert_eq!(record.country_name, "Unknown");
    }

    #[test]
    fn quick_reconnect_is_silent() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.notices.clear();
        let before = h.tracker.record(1).cloned();

        h.disconnect(1);
        h.at(1000);
        assert!(h.tracker.is_departure_pending(1));
        h.connect(&player(1, "A"));
        h.at(5000);

        assert!(h.notices.is_empty());
        assert_eq!(h.tracker.record(1).cloned(), before);
        assert!(!h.tracker.is_departure_pending(1));
    }

    #[test]
    fn departure_confirmed_after_grace_period() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.disconnect(1);

        h.at(1499);
        assert_eq!(h.leaves(), 0);
        h.at(1500);
        assert_eq!(h.leaves(), 1);
        assert!(h.tracker.record(1).is_none());

        h.at(10_000);
        assert_eq!(h.leaves(), 1);
    }

    #[test]
    fn repeated_disconnect_keeps_single_pending_departure() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.disconnect(1);
        h.at(1000);
        h.disconnect(1);

        h.at(1500);
        assert_eq!(h.leaves(), 1);
        h.at(5000);
        assert_eq!(h.leaves(), 1);
    }

    #[test]
    fn unknown_slot_bot_and_anonymous_are_ignored() {
        let mut h = Harness::new();
        h.disconnect(9);

        let mut anon = player(2, "B");
        anon.identity_key = None;
        h.connect(&anon);
        let mut bot = player(3, "BOT");
        bot.is_bot = true;
        h.connect(&bot);

        h.at(5000);
        assert!(h.notices.is_empty());
        assert_eq!(h.tracker.present_count(), 0);
        assert_eq!(h.sched.pending_timers(), 0);
    }

    #[test]
    fn suppressed_reconnect_evicts_stale_occupant_of_slot() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.tracker.on_boundary_start(&mut h.sched);
        h.tracker.on_boundary_end("de_inferno", &mut h.sched);

        // X takes slot 1 and leaves while the boundary is still in progress,
        // so no departure is scheduled for it.
        h.connect(&player(1, "X"));
        h.disconnect(1);
        h.notices.clear();

        h.connect(&player(1, "A"));
        assert_eq!(h.joins(), 0);
        assert!(matches!(
            h.notices.as_slice(),
            [PresenceNotice::Left(record)] if record.identity_key == "X"
        ));
        assert_eq!(h.tracker.record(1).unwrap().identity_key, "A");
    }

    #[test]
    fn session_boundary_suppresses_reconnects() {
        let mut h = Harness::new();
        for (slot, id) in [(1, "A"), (2, "B"), (3, "C")] {
            h.connect(&player(slot, id));
        }
        h.disconnect(3);
        h.notices.clear();

        h.tracker.on_boundary_start(&mut h.sched);
        assert!(!h.tracker.is_departure_pending(3));
        assert_eq!(h.tracker.present_count(), 0);
        for slot in 1..=3 {
            h.disconnect(slot);
        }
        h.tracker.on_boundary_end("de_inferno", &mut h.sched);
        h.notices.clear();

        h.at(2000);
        // Slots shuffled on the new map.
        h.connect(&player(2, "A"));
        h.connect(&player(1, "B"));
        h.at(8000);
        h.connect(&player(3, "C"));
        h.at(20_000);

        assert_eq!(h.joins(), 0);
        assert_eq!(h.leaves(), 0);
        assert_eq!(h.tracker.present_count(), 3);
        assert!(!h.tracker.boundary_in_progress());
    }

    #[test]
    fn suppression_expires_after_recovery_window() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.tracker.on_boundary_start(&mut h.sched);
        h.tracker.on_boundary_end("de_nuke", &mut h.sched);
        assert!(h.tracker.is_suppressed("A"));
        h.notices.clear();

        h.at(14_999);
        assert!(h.tracker.is_suppressed("A"));
        h.at(15_000);
        assert!(!h.tracker.is_suppressed("A"));
        assert!(!h.tracker.boundary_in_progress());

        h.connect(&player(4, "A"));
        assert_eq!(h.joins(), 1);
    }

    #[test]
    fn disconnects_during_recovery_are_not_tracked() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.tracker.on_boundary_start(&mut h.sched);
        h.tracker.on_boundary_end("de_nuke", &mut h.sched);
        h.connect(&player(1, "A"));
        h.disconnect(1);

        assert!(!h.tracker.is_departure_pending(1));
        h.at(30_000);
        assert_eq!(h.leaves(), 0);
    }

    #[test]
    fn back_to_back_boundaries_use_latest_recovery_window() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.tracker.on_boundary_start(&mut h.sched);
        h.tracker.on_boundary_end("de_nuke", &mut h.sched);

        h.at(10_000);
        h.tracker.on_boundary_start(&mut h.sched);
        h.tracker.on_boundary_end("de_mirage", &mut h.sched);

        h.at(15_000);
        assert!(h.tracker.boundary_in_progress());
        h.at(25_000);
        assert!(!h.tracker.boundary_in_progress());
    }

    #[test]
    fn session_change_announced_once_and_respects_denylist() {
        let mut h = Harness::new();
        let first = h.tracker.on_boundary_end("de_dust2", &mut h.sched);
        assert_eq!(
            first,
            Some(PresenceNotice::SessionChanged {
                session_id: "de_dust2".to_string()
            })
        );
        assert!(h.tracker.on_boundary_end("de_dust2", &mut h.sched).is_none());
        assert!(h.tracker.on_boundary_end("AR_Barrage", &mut h.sched).is_none());
        assert!(h.tracker.on_boundary_end("de_dust2", &mut h.sched).is_some());
    }

    #[test]
    fn session_change_disabled() {
        let mut settings = PresenceSettings::default();
        settings.announce_session_change = false;
        let mut tracker = PresenceTracker::new(settings);
        let mut sched: TickScheduler<PresenceTask> = TickScheduler::new();
        assert!(tracker.on_boundary_end("de_dust2", &mut sched).is_none());
        // Recovery is still scheduled.
        assert_eq!(sched.pending_timers(), 1);
    }

    #[test]
    fn recycled_slot_during_grace_reports_both() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.notices.clear();
        h.disconnect(1);
        h.at(500);
        h.connect(&player(1, "B"));

        assert_eq!(h.leaves(), 1);
        assert_eq!(h.joins(), 1);
        assert_eq!(h.tracker.record(1).unwrap().identity_key, "B");
        h.at(5000);
        assert_eq!(h.leaves(), 1);
    }

    #[test]
    fn flag_defaults_to_generic() {
        let mut h = Harness::new();
        assert_eq!(h.tracker.flag_for_slot(5), GENERIC_FLAG);
        h.connect(&player(5, "E"));
        assert_eq!(h.tracker.flag_for_slot(5), GENERIC_FLAG);
    }

    #[test]
    fn shutdown_cancels_timers() {
        let mut h = Harness::new();
        h.connect(&player(1, "A"));
        h.disconnect(1);
        h.tracker.on_boundary_end("de_dust2", &mut h.sched);
        assert_eq!(h.sched.pending_timers(), 2);

        h.tracker.shutdown(&mut h.sched);
        assert_eq!(h.sched.pending_timers(), 0);
        assert_eq!(h.tracker.present_count(), 0);
    }
}
