//! Multi-channel logic analyzer: per-tick digital sampling, a trigger state
//! machine, buffer measurements and waveform export.
//!
//! Channels reference signals by [SignalSource] identifier only; the kernel
//! passes a probe closure to [LogicAnalyzer::update] that resolves sources to
//! live values. Capture buffers are fixed-length rings aligned to a time axis of
//! `memory_depth` samples at `1/sample_rate` spacing, relative to the trigger
//! instant.
use std::collections::BTreeMap;
use std::path::Path;

use crate::decoder::{Trace, TraceMap};
use crate::signal::{Edge, EdgeFilter, SignalSource};
use crate::time::{Hertz, SimDuration, SimInstant};

pub mod export;

pub use export::{ExportError, ExportFormat, VcdDump, read_vcd};

/// Default and maximum channel count; bounded by the VCD symbol alphabet A-P.
pub const MAX_CHANNELS: usize = 16;
const VCD_SYMBOL_COUNT: usize = 16;
static_assertions::const_assert!(MAX_CHANNELS <= VCD_SYMBOL_COUNT);

/// Default per-channel capture depth.
pub const DEFAULT_MEMORY_DEPTH: usize = 10_000;

/// Default digitizing threshold for channel sampling.
pub const DEFAULT_CHANNEL_THRESHOLD: f64 = 0.5;

//==================================================================================================
// Definitions
//==================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Rising,
    Falling,
    Both,
    High,
    Low,
    Pattern,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub channel: usize,
    pub trigger: TriggerType,
    /// For [TriggerType::Pattern]: expected levels of the configured channels in
    /// ascending id order; shorter patterns compare as a prefix.
    pub pattern: Option<Vec<bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Armed,
    Triggered,
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    pub source: SignalSource,
    pub enabled: bool,
    pub color: String,
    pub threshold: f64,
    pub invert: bool,
}

struct Channel {
    config: ChannelConfig,
    buffer: Vec<bool>,
    /// Level at the previous trigger evaluation. Kept per channel.
    last_level: Option<bool>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AnalyzerError {
    #[error("channel id {0} exceeds the {1}-channel limit")]
    ChannelLimit(usize, usize),
    #[error("no channels are configured")]
    NoChannels,
    #[error("unknown channel {0}")]
    UnknownChannel(usize),
}

/// Acquisition statistics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub channels: usize,
    pub sample_rate: u32,
    pub memory_depth: usize,
    pub state: AcquisitionState,
    pub trigger_time: Option<f64>,
    pub per_channel: Vec<ChannelStats>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub id: usize,
    pub name: String,
    pub transitions: usize,
    /// Total high time across the buffer, seconds.
    pub high_time: f64,
    pub duty_cycle: f64,
}

//==================================================================================================
// Analyzer
//==================================================================================================

pub struct LogicAnalyzer {
    max_channels: usize,
    sample_rate: Hertz,
    memory_depth: usize,
    channels: BTreeMap<usize, Channel>,
    trigger: Option<TriggerConfig>,
    auto_trigger: bool,
    trigger_timeout: SimDuration,
    state: AcquisitionState,
    started_at: Option<SimInstant>,
    trigger_time: Option<SimInstant>,
}

impl LogicAnalyzer {
    pub fn new() -> Self {
        LogicAnalyzer {
            max_channels: MAX_CHANNELS,
            sample_rate: Hertz::from_raw(1_000_000),
            memory_depth: DEFAULT_MEMORY_DEPTH,
            channels: BTreeMap::new(),
            trigger: None,
            auto_trigger: true,
            trigger_timeout: SimDuration::secs(5),
            state: AcquisitionState::Idle,
            started_at: None,
            trigger_time: None,
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> Hertz {
        self.sample_rate
    }

    /// Set the sample rate. Takes effect for the next acquisition.
    pub fn set_sample_rate(&mut self, rate: Hertz) {
        self.sample_rate = Hertz::from_raw(rate.raw().max(1));
    }

    #[inline]
    pub fn memory_depth(&self) -> usize {
        self.memory_depth
    }

    /// Resize the capture buffers. Clears captured data.
    pub fn set_memory_depth(&mut self, depth: usize) {
        self.memory_depth = depth.max(1);
        for channel in self.channels.values_mut() {
            channel.buffer = vec![false; self.memory_depth];
        }
    }

    pub fn set_auto_trigger(&mut self, auto: bool) {
        self.auto_trigger = auto;
    }

    pub fn set_trigger_timeout(&mut self, timeout: SimDuration) {
        self.trigger_timeout = timeout;
    }

    #[inline]
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.state == AcquisitionState::Triggered
    }

    #[inline]
    pub fn trigger_time(&self) -> Option<SimInstant> {
        self.trigger_time
    }

    /// Add a channel. Ids must stay below the channel limit.
    pub fn add_channel(
        &mut self,
        id: usize,
        name: impl Into<String>,
        source: SignalSource,
        color: Option<&str>,
    ) -> Result<(), AnalyzerError> {
        if id >= self.max_channels {
            return Err(AnalyzerError::ChannelLimit(id, self.max_channels));
        }
        self.channels.insert(
            id,
            Channel {
                config: ChannelConfig {
                    name: name.into(),
                    source,
                    enabled: true,
                    color: color.unwrap_or("#00FF00").to_owned(),
                    threshold: DEFAULT_CHANNEL_THRESHOLD,
                    invert: false,
                },
                buffer: vec![false; self.memory_depth],
                last_level: None,
            },
        );
        Ok(())
    }

    pub fn remove_channel(&mut self, id: usize) -> bool {
        self.channels.remove(&id).is_some()
    }

    pub fn channel_config(&self, id: usize) -> Option<&ChannelConfig> {
        self.channels.get(&id).map(|c| &c.config)
    }

    pub fn channel_config_mut(&mut self, id: usize) -> Option<&mut ChannelConfig> {
        self.channels.get_mut(&id).map(|c| &mut c.config)
    }

    pub fn set_trigger(&mut self, channel: usize, trigger: TriggerType, pattern: Option<Vec<bool>>) {
        self.trigger = Some(TriggerConfig {
            channel,
            trigger,
            pattern,
        });
    }

    pub fn clear_trigger(&mut self) {
        self.trigger = None;
    }

    /// Arm the analyzer. With a trigger configured the state machine waits in
    /// `Armed`; otherwise, with auto-trigger on, capture behaves as triggered
    /// from `now`.
    pub fn start_acquisition(&mut self, now: SimInstant) -> Result<(), AnalyzerError> {
        if self.channels.is_empty() {
            return Err(AnalyzerError::NoChannels);
        }
        for channel in self.channels.values_mut() {
            channel.buffer = vec![false; self.memory_depth];
            channel.last_level = None;
        }
        self.started_at = Some(now);
        if self.trigger.is_some() || !self.auto_trigger {
            self.state = AcquisitionState::Armed;
            self.trigger_time = None;
        } else {
            self.state = AcquisitionState::Triggered;
            self.trigger_time = Some(now);
        }
        log::debug!(
            "analyzer armed with {} channels at {now:?}",
            self.channels.len()
        );
        Ok(())
    }

    pub fn stop_acquisition(&mut self) {
        self.state = AcquisitionState::Idle;
    }

    /// Per-tick evaluation: trigger predicate while armed, one sample per
    /// enabled channel once triggered. All channels sample at the same instant.
    pub fn update(&mut self, now: SimInstant, mut probe: impl FnMut(SignalSource) -> Option<f64>) {
        if self.state == AcquisitionState::Idle {
            return;
        }

        let mut levels: BTreeMap<usize, Option<bool>> = BTreeMap::new();
        for (&id, channel) in &self.channels {
            let level = probe(channel.config.source)
                .map(|v| (v > channel.config.threshold) != channel.config.invert);
            levels.insert(id, level);
        }

        if self.state == AcquisitionState::Armed {
            if self.trigger_fired(&levels) {
                self.state = AcquisitionState::Triggered;
                self.trigger_time = Some(now);
                log::debug!("analyzer triggered at {now:?}");
            } else if self.auto_trigger && self.timed_out(now) {
                self.state = AcquisitionState::Triggered;
                self.trigger_time = Some(now);
                log::warn!("analyzer trigger_timeout at {now:?}, forcing capture");
            }
        }

        if self.state == AcquisitionState::Triggered {
            let index = self.sample_index(now);
            for (&id, channel) in self.channels.iter_mut() {
                if !channel.config.enabled {
                    continue;
                }
                if let Some(Some(level)) = levels.get(&id) {
                    channel.buffer[index] = *level;
                }
            }
        }

        for (&id, channel) in self.channels.iter_mut() {
            if let Some(level) = levels.get(&id).copied().flatten() {
                channel.last_level = Some(level);
            }
        }
    }

    fn trigger_fired(&self, levels: &BTreeMap<usize, Option<bool>>) -> bool {
        let Some(config) = &self.trigger else {
            return false;
        };
        let Some(channel) = self.channels.get(&config.channel) else {
            return false;
        };
        let Some(Some(current)) = levels.get(&config.channel).copied() else {
            return false;
        };
        let previous = channel.last_level;
        match config.trigger {
            TriggerType::Rising => current && previous == Some(false),
            TriggerType::Falling => !current && previous == Some(true),
            TriggerType::Both => previous.is_some() && previous != Some(current),
            TriggerType::High => current,
            TriggerType::Low => !current,
            TriggerType::Pattern => match &config.pattern {
                Some(pattern) => self
                    .channels
                    .keys()
                    .zip(pattern.iter())
                    .all(|(id, &expected)| levels.get(id).copied().flatten() == Some(expected)),
                None => false,
            },
        }
    }

    fn timed_out(&self, now: SimInstant) -> bool {
        self.started_at
            .and_then(|started| now.checked_duration_since(started))
            .is_some_and(|elapsed| elapsed >= self.trigger_timeout)
    }

    fn sample_index(&self, now: SimInstant) -> usize {
        let elapsed = self
            .trigger_time
            .and_then(|t| now.checked_duration_since(t))
            .map(|d| d.ticks())
            .unwrap_or(0);
        ((elapsed * self.sample_rate.raw() as u64 / 1_000_000) % self.memory_depth as u64) as usize
    }

    //==============================================================================================
    // Buffer queries
    //==============================================================================================

    /// Capture time axis: `memory_depth` points at `1/sample_rate` spacing,
    /// relative to the trigger instant.
    pub fn time_axis(&self) -> Vec<f64> {
        let period = 1.0 / self.sample_rate.raw() as f64;
        (0..self.memory_depth).map(|i| i as f64 * period).collect()
    }

    /// `(times, values)` of one channel's capture buffer.
    pub fn waveform(&self, id: usize) -> Option<(Vec<f64>, Vec<bool>)> {
        let channel = self.channels.get(&id)?;
        Some((self.time_axis(), channel.buffer.clone()))
    }

    /// Build decoder input from captured channels, mapping channel ids to
    /// protocol channel names (e.g. `SCL`).
    pub fn traces(&self, mapping: &[(usize, &str)]) -> TraceMap {
        let times = self.time_axis();
        let mut map = TraceMap::new();
        for &(id, name) in mapping {
            if let Some(channel) = self.channels.get(&id) {
                let values = channel
                    .buffer
                    .iter()
                    .map(|&b| if b { 1.0 } else { 0.0 })
                    .collect();
                map.insert(name.to_owned(), Trace::new(times.clone(), values));
            }
        }
        map
    }

    fn window(&self, id: usize, start: f64, end: Option<f64>) -> Option<(Vec<f64>, Vec<bool>)> {
        let (times, values) = self.waveform(id)?;
        let end = end.unwrap_or_else(|| times.last().copied().unwrap_or(0.0));
        let pairs: (Vec<f64>, Vec<bool>) = times
            .into_iter()
            .zip(values)
            .filter(|&(t, _)| t >= start && t <= end)
            .unzip();
        Some(pairs)
    }

    /// Mean-period frequency from rising edges inside the window, in Hz.
    pub fn measure_frequency(&self, id: usize, start: f64, end: Option<f64>) -> Option<f64> {
        let (times, values) = self.window(id, start, end)?;
        let mut edge_times = Vec::new();
        for i in 1..values.len() {
            if values[i] && !values[i - 1] {
                edge_times.push(times[i]);
            }
        }
        if edge_times.len() < 2 {
            return None;
        }
        let span = edge_times.last().unwrap() - edge_times.first().unwrap();
        let mean_period = span / (edge_times.len() - 1) as f64;
        (mean_period > 0.0).then(|| 1.0 / mean_period)
    }

    /// High-sample fraction inside the window, in percent.
    pub fn measure_duty_cycle(&self, id: usize, start: f64, end: Option<f64>) -> Option<f64> {
        let (_, values) = self.window(id, start, end)?;
        if values.is_empty() {
            return None;
        }
        let high = values.iter().filter(|&&v| v).count();
        Some(high as f64 / values.len() as f64 * 100.0)
    }

    /// Edge instants in the capture buffer.
    pub fn find_edges(&self, id: usize, filter: EdgeFilter) -> Vec<(f64, Edge)> {
        let Some((times, values)) = self.waveform(id) else {
            return Vec::new();
        };
        let mut edges = Vec::new();
        for i in 1..values.len() {
            let edge = match (values[i - 1], values[i]) {
                (false, true) => Edge::Rising,
                (true, false) => Edge::Falling,
                _ => continue,
            };
            if filter.matches(edge) {
                edges.push((times[i], edge));
            }
        }
        edges
    }

    pub fn statistics(&self) -> Statistics {
        let sample_period = 1.0 / self.sample_rate.raw() as f64;
        let per_channel = self
            .channels
            .iter()
            .map(|(&id, channel)| {
                let high = channel.buffer.iter().filter(|&&v| v).count();
                let transitions = channel
                    .buffer
                    .windows(2)
                    .filter(|w| w[0] != w[1])
                    .count();
                ChannelStats {
                    id,
                    name: channel.config.name.clone(),
                    transitions,
                    high_time: high as f64 * sample_period,
                    duty_cycle: high as f64 / channel.buffer.len().max(1) as f64 * 100.0,
                }
            })
            .collect();
        Statistics {
            channels: self.channels.len(),
            sample_rate: self.sample_rate.raw(),
            memory_depth: self.memory_depth,
            state: self.state,
            trigger_time: self
                .trigger_time
                .map(|t| crate::time::InstantExt::as_secs_f64(&t)),
            per_channel,
        }
    }

    /// Export the capture buffers to CSV or VCD.
    pub fn export_data(&self, path: &Path, format: ExportFormat) -> Result<(), ExportError> {
        let channels: Vec<(usize, &str, &[bool])> = self
            .channels
            .iter()
            .filter(|(_, c)| c.config.enabled)
            .map(|(&id, c)| (id, c.config.name.as_str(), c.buffer.as_slice()))
            .collect();
        log::debug!(
            "exporting {} channels x {} samples to {}",
            channels.len(),
            self.memory_depth,
            path.display()
        );
        match format {
            ExportFormat::Csv => export::write_csv(path, &self.time_axis(), &channels),
            ExportFormat::Vcd => {
                export::write_vcd(path, self.sample_rate.raw(), self.memory_depth, &channels)
            }
        }
    }
}

impl Default for LogicAnalyzer {
    fn default() -> Self {
        LogicAnalyzer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(us: u64) -> SimInstant {
        SimInstant::from_ticks(us)
    }

    #[test]
    fn channel_ids_are_bounded() {
        let mut la = LogicAnalyzer::new();
        assert!(la.add_channel(15, "ch15", SignalSource::Gpio(4), None).is_ok());
        let err = la
            .add_channel(16, "ch16", SignalSource::Gpio(5), None)
            .unwrap_err();
        assert_eq!(err, AnalyzerError::ChannelLimit(16, MAX_CHANNELS));
    }

    #[test]
    fn acquisition_needs_channels() {
        let mut la = LogicAnalyzer::new();
        assert_eq!(
            la.start_acquisition(at(0)).unwrap_err(),
            AnalyzerError::NoChannels
        );
    }

    /// Drive one channel from a closure over a level variable.
    fn analyzer_with_channel() -> LogicAnalyzer {
        let mut la = LogicAnalyzer::new();
        la.add_channel(0, "GPIO18", SignalSource::Gpio(18), None).unwrap();
        la
    }

    #[test]
    fn rising_trigger_fires_on_transition_only() {
        let mut la = analyzer_with_channel();
        la.set_trigger(0, TriggerType::Rising, None);
        la.start_acquisition(at(0)).unwrap();
        assert_eq!(la.state(), AcquisitionState::Armed);
        // High from the very first evaluation: no previous level, no fire.
        la.update(at(1), |_| Some(1.0));
        assert!(!la.is_triggered());
        la.update(at(2), |_| Some(0.0));
        la.update(at(3), |_| Some(1.0));
        assert!(la.is_triggered());
        assert_eq!(la.trigger_time(), Some(at(3)));
        // Sample index 0 holds the trigger-instant level.
        assert!(la.waveform(0).unwrap().1[0]);
    }

    #[test]
    fn auto_trigger_captures_immediately_without_trigger() {
        let mut la = analyzer_with_channel();
        la.start_acquisition(at(10)).unwrap();
        assert!(la.is_triggered());
        assert_eq!(la.trigger_time(), Some(at(10)));
    }

    #[test]
    fn armed_auto_trigger_times_out() {
        let mut la = analyzer_with_channel();
        la.set_trigger(0, TriggerType::Rising, None);
        la.set_trigger_timeout(SimDuration::millis(1));
        la.start_acquisition(at(0)).unwrap();
        la.update(at(500), |_| Some(0.0));
        assert!(!la.is_triggered());
        la.update(at(1_000), |_| Some(0.0));
        assert!(la.is_triggered());
    }

    #[test]
    fn capture_wraps_at_memory_depth() {
        let mut la = analyzer_with_channel();
        la.set_memory_depth(4);
        la.start_acquisition(at(0)).unwrap();
        // 1 MHz sampling: one slot per microsecond; index 5 wraps onto 1.
        for us in 0..6u64 {
            la.update(at(us), |_| Some(if us == 5 { 1.0 } else { 0.0 }));
        }
        let (_, values) = la.waveform(0).unwrap();
        assert_eq!(values, vec![false, true, false, false]);
    }

    #[test]
    fn duty_and_frequency_measure_from_the_buffer() {
        let mut la = analyzer_with_channel();
        la.set_memory_depth(1_000);
        la.start_acquisition(at(0)).unwrap();
        // 10 kHz square wave at 25% duty: 100 us period, 25 us high.
        for us in 0..1_000u64 {
            let level = if us % 100 < 25 { 1.0 } else { 0.0 };
            la.update(at(us), move |_| Some(level));
        }
        let duty = la.measure_duty_cycle(0, 0.0, None).unwrap();
        assert!((duty - 25.0).abs() < 0.5, "duty = {duty}");
        let freq = la.measure_frequency(0, 0.0, None).unwrap();
        assert!((freq - 10_000.0).abs() < 5.0, "freq = {freq}");
    }

    #[test]
    fn pattern_trigger_matches_prefix_of_channels() {
        let mut la = LogicAnalyzer::new();
        la.add_channel(0, "a", SignalSource::Gpio(4), None).unwrap();
        la.add_channel(1, "b", SignalSource::Gpio(5), None).unwrap();
        la.set_trigger(0, TriggerType::Pattern, Some(vec![true, false]));
        la.start_acquisition(at(0)).unwrap();
        la.update(at(1), |src| match src {
            SignalSource::Gpio(4) => Some(1.0),
            _ => Some(1.0),
        });
        assert!(!la.is_triggered());
        la.update(at(2), |src| match src {
            SignalSource::Gpio(4) => Some(1.0),
            _ => Some(0.0),
        });
        assert!(la.is_triggered());
    }

    #[test]
    fn find_edges_reports_both_kinds_in_order() {
        let mut la = analyzer_with_channel();
        la.set_memory_depth(8);
        la.start_acquisition(at(0)).unwrap();
        for us in 0..8u64 {
            let level = if (2..5).contains(&us) { 1.0 } else { 0.0 };
            la.update(at(us), move |_| Some(level));
        }
        let edges = la.find_edges(0, EdgeFilter::Both);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].1, Edge::Rising);
        assert_eq!(edges[1].1, Edge::Falling);
        assert!(edges[0].0 < edges[1].0);
        assert_eq!(la.find_edges(0, EdgeFilter::Falling).len(), 1);
    }

    #[test]
    fn statistics_summarize_the_capture() {
        let mut la = analyzer_with_channel();
        la.set_memory_depth(10);
        la.start_acquisition(at(0)).unwrap();
        for us in 0..10u64 {
            la.update(at(us), move |_| Some(if us < 5 { 1.0 } else { 0.0 }));
        }
        let stats = la.statistics();
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.state, AcquisitionState::Triggered);
        let ch = &stats.per_channel[0];
        assert_eq!(ch.transitions, 1);
        assert_eq!(ch.duty_cycle, 50.0);
    }
}
