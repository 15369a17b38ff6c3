//! Per-wire signal model: current value, digital state, sample history, edges.
//!
//! A [Signal] is a named wire. Writes go through [Signal::set_value], which
//! appends to a bounded sample ring (timestamps must be non-decreasing), derives
//! the digital state from TTL-style thresholds, and reports LOW/HIGH transitions
//! both as a return value (for the owning controller) and to registered edge
//! callbacks.
use std::collections::VecDeque;

use crate::time::{InstantExt, SimDuration, SimInstant};

/// Samples retained per signal before the oldest is evicted.
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// Value at or below this is LOW for a digital signal.
pub const LOW_THRESHOLD: f64 = 0.3;
/// Value at or above this is HIGH for a digital signal.
pub const HIGH_THRESHOLD: f64 = 0.7;

/// Digital signal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Low,
    High,
    /// High impedance, no driver attached.
    Floating,
    /// Between the LOW and HIGH thresholds.
    Unknown,
}

impl SignalState {
    /// Derive the state of a digital signal from its numeric value.
    pub fn from_value(value: f64) -> Self {
        if value >= HIGH_THRESHOLD {
            SignalState::High
        } else if value <= LOW_THRESHOLD {
            SignalState::Low
        } else {
            SignalState::Unknown
        }
    }
}

/// A LOW/HIGH transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Edge::Rising => "rising",
            Edge::Falling => "falling",
        }
    }
}

/// Edge selection for detection and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFilter {
    Rising,
    Falling,
    Both,
}

impl EdgeFilter {
    pub fn matches(&self, edge: Edge) -> bool {
        matches!(
            (self, edge),
            (EdgeFilter::Rising, Edge::Rising)
                | (EdgeFilter::Falling, Edge::Falling)
                | (EdgeFilter::Both, _)
        )
    }
}

/// Identifier-only reference to a signal owned by some peripheral.
///
/// The analyzer and other observers hold these instead of references into the
/// owning controller, and resolve them through a probe at sampling time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalSource {
    /// GPIO pin signal, by BCM number.
    Gpio(u8),
    /// PWM controller channel signal.
    Pwm(u8),
}

/// Single timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSample {
    pub timestamp: SimInstant,
    pub value: f64,
    pub state: SignalState,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("sample at {timestamp:?} precedes the last recorded sample at {last:?}")]
pub struct SampleOrderError {
    pub timestamp: SimInstant,
    pub last: SimInstant,
}

type EdgeCallback = Box<dyn FnMut(&str, Edge, SimInstant)>;

/// Digital or analog signal with bounded history and edge detection.
pub struct Signal {
    name: String,
    analog: bool,
    max_samples: usize,
    samples: VecDeque<SignalSample>,
    value: f64,
    state: SignalState,
    last_edge: Option<SimInstant>,
    callbacks: Vec<(EdgeFilter, EdgeCallback)>,
}

impl Signal {
    /// New digital signal with the default history depth.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, false, DEFAULT_MAX_SAMPLES)
    }

    /// New analog signal. Analog signals never report digital states or edges.
    pub fn new_analog(name: impl Into<String>) -> Self {
        Self::with_capacity(name, true, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_capacity(name: impl Into<String>, analog: bool, max_samples: usize) -> Self {
        Signal {
            name: name.into(),
            analog,
            max_samples: max_samples.max(1),
            samples: VecDeque::new(),
            value: 0.0,
            state: SignalState::Floating,
            last_edge: None,
            callbacks: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_analog(&self) -> bool {
        self.analog
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[inline]
    pub fn state(&self) -> SignalState {
        self.state
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Instant of the most recent LOW/HIGH transition.
    #[inline]
    pub fn last_edge(&self) -> Option<SimInstant> {
        self.last_edge
    }

    /// Update the signal value, record a sample and detect edges.
    ///
    /// For digital signals with no explicit `state`, the state is derived from
    /// the thresholds. The sample timestamp must not precede the previous one;
    /// equal timestamps are allowed. A detected edge is dispatched to the
    /// registered callbacks before this function returns, and also handed back
    /// to the caller.
    pub fn set_value(
        &mut self,
        value: f64,
        timestamp: SimInstant,
        state: Option<SignalState>,
    ) -> Result<Option<Edge>, SampleOrderError> {
        if let Some(last) = self.samples.back() {
            if timestamp < last.timestamp {
                return Err(SampleOrderError {
                    timestamp,
                    last: last.timestamp,
                });
            }
        }

        let old_state = self.state;
        self.value = value;
        self.state = match state {
            Some(state) => state,
            None if !self.analog => SignalState::from_value(value),
            None => self.state,
        };

        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(SignalSample {
            timestamp,
            value,
            state: self.state,
        });

        let edge = if self.analog {
            None
        } else {
            match (old_state, self.state) {
                (SignalState::Low, SignalState::High) => Some(Edge::Rising),
                (SignalState::High, SignalState::Low) => Some(Edge::Falling),
                _ => None,
            }
        };

        if let Some(edge) = edge {
            self.last_edge = Some(timestamp);
            let name = std::mem::take(&mut self.name);
            for (filter, callback) in &mut self.callbacks {
                if filter.matches(edge) {
                    callback(&name, edge, timestamp);
                }
            }
            self.name = name;
        }

        Ok(edge)
    }

    /// Register a callback invoked synchronously on matching edges with
    /// `(signal name, edge, timestamp)`.
    pub fn on_edge(&mut self, filter: EdgeFilter, callback: impl FnMut(&str, Edge, SimInstant) + 'static) {
        self.callbacks.push((filter, Box::new(callback)));
    }

    /// Samples within the (inclusive) time range.
    pub fn samples(
        &self,
        start: Option<SimInstant>,
        end: Option<SimInstant>,
    ) -> impl Iterator<Item = &SignalSample> {
        self.samples
            .iter()
            .filter(move |s| start.is_none_or(|t| s.timestamp >= t))
            .filter(move |s| end.is_none_or(|t| s.timestamp <= t))
    }

    /// Aligned `(timestamps, values)` arrays in seconds, for plotting and decoding.
    pub fn waveform(
        &self,
        start: Option<SimInstant>,
        end: Option<SimInstant>,
    ) -> (Vec<f64>, Vec<f64>) {
        let mut times = Vec::new();
        let mut values = Vec::new();
        for sample in self.samples(start, end) {
            times.push(sample.timestamp.as_secs_f64());
            values.push(sample.value);
        }
        (times, values)
    }

    /// Rising-edge frequency over the trailing window, in Hz.
    ///
    /// Returns `None` for analog signals, empty windows, or when no rising edge
    /// falls inside the window.
    pub fn frequency(&self, window: SimDuration) -> Option<f64> {
        if self.analog || window.ticks() == 0 {
            return None;
        }
        let newest = self.samples.back()?.timestamp;
        let start = newest.checked_sub_duration(window).unwrap_or(crate::time::SIM_START);

        let mut edges = 0u32;
        let mut last_state = SignalState::Low;
        for sample in &self.samples {
            if sample.timestamp < start {
                last_state = sample.state;
                continue;
            }
            if last_state == SignalState::Low && sample.state == SignalState::High {
                edges += 1;
            }
            last_state = sample.state;
        }
        if edges == 0 {
            return None;
        }
        Some(edges as f64 / window.ticks() as f64 * 1e6)
    }

    pub fn clear_history(&mut self) {
        self.samples.clear();
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("state", &self.state)
            .field("samples", &self.samples.len())
            .finish()
    }
}
