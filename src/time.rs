//! Simulated time base.
//!
//! The kernel counts time in microsecond ticks. [SimInstant] and [SimDuration] are
//! fixed-point [fugit] types at a 1 MHz tick rate, so one tick is exactly one
//! microsecond and arithmetic never drifts. Floating-point seconds only appear at
//! the waveform and export boundaries.
pub use fugit::ExtU64;
pub use fugit::HertzU32 as Hertz;
pub use fugit::RateExtU32;

/// A point in simulated time, measured in microseconds since simulation start.
pub type SimInstant = fugit::TimerInstantU64<1_000_000>;
/// A span of simulated time with microsecond resolution.
pub type SimDuration = fugit::TimerDurationU64<1_000_000>;

/// Simulation time zero.
pub const SIM_START: SimInstant = SimInstant::from_ticks(0);

/// Boundary conversions between tick-based time and seconds.
pub trait InstantExt {
    fn as_secs_f64(&self) -> f64;
    fn from_secs_f64(secs: f64) -> Self;
}

impl InstantExt for SimInstant {
    #[inline]
    fn as_secs_f64(&self) -> f64 {
        self.duration_since_epoch().ticks() as f64 / 1e6
    }

    #[inline]
    fn from_secs_f64(secs: f64) -> Self {
        SimInstant::from_ticks((secs * 1e6).round() as u64)
    }
}

pub trait DurationExt {
    fn as_secs_f64(&self) -> f64;
    fn from_secs_f64(secs: f64) -> Self;
}

impl DurationExt for SimDuration {
    #[inline]
    fn as_secs_f64(&self) -> f64 {
        self.ticks() as f64 / 1e6
    }

    #[inline]
    fn from_secs_f64(secs: f64) -> Self {
        SimDuration::from_ticks((secs * 1e6).round() as u64)
    }
}
