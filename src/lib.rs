//! Deterministic simulator for single-board-computer peripherals.
//!
//! User code written against the familiar GPIO/I²C/SPI/UART/PWM surface runs
//! against a simulated board instead of real silicon. Every pin transition, bus
//! transaction and timer fires at a precise simulated timestamp and lands in a
//! recordable event history; a multi-channel logic analyzer captures the
//! resulting waveforms and the protocol decoders reconstruct framed traffic
//! from them.
//!
//! The kernel is single-threaded and cooperative in simulated time: a driver
//! loop calls [Simulator::tick], which advances the clock by one fixed timestep
//! and runs scheduler ops, timers, PWM updates and analyzer sampling in a fixed
//! order. Peripheral APIs take explicit timestamps, so tests can also drive
//! controllers directly without running the loop.
pub mod analyzer;
pub mod clock;
pub mod decoder;
pub mod event;
pub mod gpio;
pub mod i2c;
pub mod pins;
pub mod pwm;
pub mod sched;
pub mod signal;
pub mod simulator;
pub mod spi;
pub mod testkit;
pub mod time;
pub mod uart;

pub use analyzer::LogicAnalyzer;
pub use clock::SimClock;
pub use event::{Event, EventBus, EventKind, Payload, Value};
pub use gpio::GpioController;
pub use sched::Scheduler;
pub use signal::{Edge, EdgeFilter, Signal, SignalSource, SignalState};
pub use simulator::{KernelOp, SimConfig, Simulator};
pub use time::{Hertz, SimDuration, SimInstant};

pub use embedded_hal::digital::PinState;
