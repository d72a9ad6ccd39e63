//! Transient on-screen display scheduler.
//!
//! The session runtime's center-screen primitive only lasts one frame, so a
//! message stays visible by being redrawn every tick for the configured
//! duration. Jobs are strictly serialized: the next one starts only after the
//! previous one has been cleared. The audience is evaluated when a job
//! starts and re-checked on every redraw.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use cordrelay_core::config::TimingConfig;

use crate::runtime::{RecipientId, SessionRuntime};
use crate::tick::{TickScheduler, TimerHandle};

/// Content drawn to erase a transient message.
const BLANK: &str = " ";

/// Timed work owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HudTask {
    /// Begin processing the pending queue.
    Start,
    /// Redraw the active job.
    Redraw,
}

#[derive(Debug, Clone, Copy)]
pub struct HudSettings {
    pub display_duration: Duration,
    pub tick_interval: Duration,
}

impl Default for HudSettings {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for HudSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            display_duration: timing.hud_duration(),
            tick_interval: timing.hud_tick(),
        }
    }
}

impl HudSettings {
    /// Number of redraws per job: `floor(duration / tick)`.
    pub fn repeat_count(&self) -> u64 {
        let tick = self.tick_interval.as_millis().max(1);
        u64::try_from(self.display_duration.as_millis() / tick).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
struct ActiveJob {
    content: String,
    audience: Vec<RecipientId>,
    ticks_remaining: u64,
    timer: TimerHandle,
}

/// Single-consumer queue of HUD jobs.
#[derive(Debug)]
pub struct HudScheduler {
    settings: HudSettings,
    pending: VecDeque<String>,
    active: Option<ActiveJob>,
    start_requested: bool,
}

impl HudScheduler {
    pub const fn new(settings: HudSettings) -> Self {
        Self {
            settings,
            pending: VecDeque::new(),
            active: None,
            start_requested: false,
        }
    }

    /// Queue `content`. Processing starts on the next tick, never inside the
    /// caller's.
    pub fn enqueue<T: From<HudTask>>(&mut self, content: String, sched: &mut TickScheduler<T>) {
        self.pending.push_back(content);
        if self.active.is_none() && !self.start_requested {
            self.start_requested = true;
            sched.run_on_next_tick(HudTask::Start.into());
        }
    }

    /// Drop every job that has not started and stop the active one.
    ///
    /// Whatever is on screen right now is left alone.
    pub fn clear<T>(&mut self, sched: &mut TickScheduler<T>) {
        self.pending.clear();
        if let Some(job) = self.active.take() {
            sched.cancel(job.timer);
        }
    }

    /// Handle a fired scheduler task.
    pub fn on_task<T, R>(&mut self, task: HudTask, runtime: &mut R, sched: &mut TickScheduler<T>)
    where
        T: From<HudTask>,
        R: SessionRuntime + ?Sized,
    {
        match task {
            HudTask::Start => {
                self.start_requested = false;
                if self.active.is_none() {
                    self.start_next(runtime, sched);
                }
            }
            HudTask::Redraw => self.redraw(runtime, sched),
        }
    }

    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn start_next<T, R>(&mut self, runtime: &mut R, sched: &mut TickScheduler<T>)
    where
        T: From<HudTask>,
        R: SessionRuntime + ?Sized,
    {
        while let Some(content) = self.pending.pop_front() {
            let audience = runtime.eligible_recipients();
            if audience.is_empty() {
                debug!("No HUD audience, discarding job");
                continue;
            }

            let timer = sched.schedule_repeating(self.settings.tick_interval, HudTask::Redraw.into());
            debug!(recipients = audience.len(), "HUD job started");
            self.active = Some(ActiveJob {
                content,
                audience,
                ticks_remaining: self.settings.repeat_count(),
                timer,
            });
            return;
        }
    }

    fn redraw<T, R>(&mut self, runtime: &mut R, sched: &mut TickScheduler<T>)
    where
        T: From<HudTask>,
        R: SessionRuntime + ?Sized,
    {
        let Some(job) = self.active.as_mut() else {
            return;
        };

        if job.ticks_remaining == 0 {
            sched.cancel(job.timer);
            for &recipient in &job.audience {
                if runtime.is_recipient_valid(recipient) {
                    runtime.render_transient(recipient, BLANK);
                }
            }
            self.active = None;
            self.start_next(runtime, sched);
            return;
        }

        for &recipient in &job.audience {
            if runtime.is_recipient_valid(recipient) {
                runtime.render_transient(recipient, &job.content);
            }
        }
        job.ticks_remaining -= 1;
    }
}
