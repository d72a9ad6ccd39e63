//! Cooperative tick scheduler.
//!
//! All timed behavior of the relay (grace periods, recovery windows, HUD
//! redraws, periodic status updates) is expressed as typed tasks held here
//! rather than as closures. The owner advances the scheduler with the current
//! time and pops due tasks one at a time, so a task handler may freely
//! schedule or cancel other timers while the tick is in progress.
//!
//! Time is a [`Duration`] since an arbitrary epoch chosen by the owner, which
//! keeps the scheduler independent of any real clock.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Smallest interval a repeating timer may use.
const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Handle returned when scheduling a timer; used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Timer<T> {
    deadline: Duration,
    interval: Option<Duration>,
    task: T,
}

/// Virtual-time timer table for the cooperative domain.
#[derive(Debug)]
pub struct TickScheduler<T> {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<u64, Timer<T>>,
    /// Tasks deferred with [`run_on_next_tick`](Self::run_on_next_tick).
    deferred: Vec<T>,
    /// Deferred tasks promoted by the current tick, not yet popped.
    ready: VecDeque<T>,
}

impl<T> Default for TickScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TickScheduler<T> {
    pub const fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_id: 0,
            timers: BTreeMap::new(),
            deferred: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Current scheduler time.
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Move the clock forward without starting a new tick. Time never goes
    /// backwards.
    pub fn set_time(&mut self, now: Duration) {
        self.now = self.now.max(now);
    }

    /// Start a new tick at `now`: move the clock and release every task
    /// deferred since the previous tick.
    pub fn advance(&mut self, now: Duration) {
        self.set_time(now);
        self.ready.extend(self.deferred.drain(..));
    }

    /// Fire `task` once, `delay` from now.
    pub fn schedule_once(&mut self, delay: Duration, task: T) -> TimerHandle {
        self.insert(delay, None, task)
    }

    /// Fire `task` every `interval`, first at `now + interval`.
    pub fn schedule_repeating(&mut self, interval: Duration, task: T) -> TimerHandle {
        let interval = interval.max(MIN_REPEAT_INTERVAL);
        self.insert(interval, Some(interval), task)
    }

    /// Run `task` at the start of the next tick, never within the current one.
    pub fn run_on_next_tick(&mut self, task: T) {
        self.deferred.push(task);
    }

    /// Cancel a timer. Returns `false` if it already fired (one-shot) or was
    /// cancelled before.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle.0).is_some()
    }

    /// Whether the timer is still scheduled.
    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle.0)
    }

    /// Number of live timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Earliest time at which something is runnable.
    pub fn next_deadline(&self) -> Option<Duration> {
        if !self.ready.is_empty() || !self.deferred.is_empty() {
            return Some(self.now);
        }
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Drop every timer and deferred task.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.deferred.clear();
        self.ready.clear();
    }

    fn insert(&mut self, delay: Duration, interval: Option<Duration>, task: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.insert(
            id,
            Timer {
                deadline: self.now + delay,
                interval,
                task,
            },
        );
        TimerHandle(id)
    }

    /// Id of the due timer with the earliest deadline; ties go to the timer
    /// scheduled first.
    fn earliest_due(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|(_, t)| t.deadline <= self.now)
            .min_by_key(|(id, t)| (t.deadline, **id))
            .map(|(id, _)| *id)
    }
}

impl<T: Clone> TickScheduler<T> {
    /// Pop the next runnable task for the current tick.
    ///
    /// Deferred tasks come first, then due timers in deadline order. A
    /// repeating timer is re-armed one interval after its previous deadline.
    pub fn pop_due(&mut self) -> Option<T> {
        if let Some(task) = self.ready.pop_front() {
            return Some(task);
        }

        let id = self.earliest_due()?;
        let timer = self.timers.get_mut(&id)?;
        match timer.interval {
            Some(interval) => {
                timer.deadline += interval;
                Some(timer.task.clone())
            }
            None => self.timers.remove(&id).map(|t| t.task),
        }
    }
}
