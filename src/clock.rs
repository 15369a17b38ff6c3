//! Deterministic simulation clock.
//!
//! The clock owns the notion of "now" for the whole simulator. Time only moves
//! through [SimClock::tick] (or [SimClock::advance_to], which loops it), by exactly
//! one timestep per call. One-shot and repeating timers live here; they fire from
//! within `tick` once their deadline is reached.
use crate::time::{SIM_START, SimDuration, SimInstant};

/// Smallest allowed timestep: 1 us.
pub const MIN_TIMESTEP: SimDuration = SimDuration::from_ticks(1);
/// Largest allowed timestep: 1 ms.
pub const MAX_TIMESTEP: SimDuration = SimDuration::from_ticks(1_000);

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerSlot {
    id: TimerId,
    fire_at: SimInstant,
    repeat: Option<SimDuration>,
    callback: Box<dyn FnMut(SimInstant)>,
}

/// Deterministic simulation clock with a configurable timestep.
///
/// Timers with equal deadlines fire in insertion order; the slot list is scanned
/// in insertion order and never sorted.
pub struct SimClock {
    timestep: SimDuration,
    now: SimInstant,
    running: bool,
    paused: bool,
    timers: Vec<TimerSlot>,
    next_timer_id: u64,
}

impl SimClock {
    /// Create a clock. The timestep is clamped to [MIN_TIMESTEP]..=[MAX_TIMESTEP].
    pub fn new(timestep: SimDuration) -> Self {
        SimClock {
            timestep: timestep.clamp(MIN_TIMESTEP, MAX_TIMESTEP),
            now: SIM_START,
            running: false,
            paused: false,
            timers: Vec::new(),
            next_timer_id: 0,
        }
    }

    #[inline]
    pub fn now(&self) -> SimInstant {
        self.now
    }

    #[inline]
    pub fn timestep(&self) -> SimDuration {
        self.timestep
    }

    /// Whether the clock advances on `tick`.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running && !self.paused
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.paused = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Zero simulated time and drop all timers. The running state is untouched.
    pub fn reset(&mut self) {
        self.now = SIM_START;
        self.timers.clear();
    }

    /// Advance by one timestep and fire all due timers.
    ///
    /// Returns false without side effects while the clock is stopped or paused.
    pub fn tick(&mut self) -> bool {
        match self.advance_step() {
            Some(_) => {
                self.fire_due_timers();
                true
            }
            None => false,
        }
    }

    /// First half of [Self::tick]: move time forward by one timestep.
    ///
    /// The kernel driver uses the split form so that scheduler entries can be
    /// dispatched between the time advance and the timer callbacks.
    pub fn advance_step(&mut self) -> Option<SimInstant> {
        if !self.is_running() {
            return None;
        }
        self.now = self.now + self.timestep;
        Some(self.now)
    }

    /// Second half of [Self::tick]: fire every timer with `fire_at <= now`.
    ///
    /// Repeating timers are rescheduled to `now + repeat` after their callback
    /// returns, which re-appends them behind all currently registered timers.
    pub fn fire_due_timers(&mut self) {
        if self.timers.is_empty() {
            return;
        }
        let now = self.now;
        let mut due = Vec::new();
        let mut idle = Vec::with_capacity(self.timers.len());
        for slot in self.timers.drain(..) {
            if slot.fire_at <= now {
                due.push(slot);
            } else {
                idle.push(slot);
            }
        }
        self.timers = idle;
        for mut slot in due {
            (slot.callback)(now);
            if let Some(interval) = slot.repeat {
                slot.fire_at = now + interval;
                self.timers.push(slot);
            }
        }
    }

    /// Loop `tick` until `now >= target` or the clock stops running.
    pub fn advance_to(&mut self, target: SimInstant) {
        while self.now < target && self.tick() {}
    }

    /// Schedule a callback `delay` after the current instant.
    ///
    /// With `repeat` set, the timer re-arms itself every interval after firing.
    pub fn schedule_timer(
        &mut self,
        delay: SimDuration,
        callback: impl FnMut(SimInstant) + 'static,
        repeat: Option<SimDuration>,
    ) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.timers.push(TimerSlot {
            id,
            fire_at: self.now + delay,
            repeat,
            callback: Box::new(callback),
        });
        id
    }

    /// Cancel a timer. Unknown or already fired ids are ignored.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.retain(|slot| slot.id != id);
    }

    /// Number of pending timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for SimClock {
    fn default() -> Self {
        SimClock::new(MIN_TIMESTEP)
    }
}
