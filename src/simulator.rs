//! Kernel driver: owns the clock, event bus, scheduler and every peripheral,
//! and advances them in a fixed per-tick order.
//!
//! Within one tick: time advances one timestep, due scheduler ops dispatch, due
//! clock timers fire, GPIO PWM outputs update, PWM controller channels update,
//! and finally the logic analyzer samples. All callbacks run to completion on
//! the driver thread before the tick returns.
use embedded_hal::digital::PinState;

use crate::analyzer::LogicAnalyzer;
use crate::clock::SimClock;
use crate::event::{DEFAULT_HISTORY_CAPACITY, Event, EventBus, EventKind, Payload};
use crate::gpio::{self, GpioController, GpioError};
use crate::i2c::{I2cController, I2cMaster};
use crate::pwm::{DutyCycle, NoPwmChannelError, PwmController};
use crate::sched::Scheduler;
use crate::signal::SignalSource;
use crate::spi::{SpiController, SpiMaster};
use crate::time::{Hertz, RateExtU32, SimDuration, SimInstant};
use crate::uart::{self, Serial, UartController};

/// Deferred kernel work dispatched by the scheduler.
///
/// Ops are data, not callbacks; dispatch happens in [Simulator::tick] where
/// mutable access to the peripherals is available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelOp {
    /// Drive a pin level, used by glitch restoration and scheduled stimuli.
    RestoreLevel { pin: u8, level: PinState },
}

/// Simulator construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub timestep: SimDuration,
    pub i2c_clock: Hertz,
    pub uart: uart::Config,
    pub event_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            timestep: SimDuration::micros(1),
            i2c_clock: 100_u32.kHz(),
            uart: uart::Config::default(),
            event_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// One simulator instance: virtual board plus measurement gear.
pub struct Simulator {
    clock: SimClock,
    bus: EventBus,
    sched: Scheduler<KernelOp>,
    pub gpio: GpioController,
    pub i2c: I2cController,
    pub spi: SpiController,
    pub uart: UartController,
    pub pwm: PwmController,
    pub analyzer: LogicAnalyzer,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        let bus = EventBus::with_capacity(config.event_capacity);
        Simulator {
            clock: SimClock::new(config.timestep),
            gpio: GpioController::new(bus.clone()),
            i2c: I2cController::new(1, bus.clone(), config.i2c_clock),
            spi: SpiController::new(0, bus.clone()),
            uart: UartController::new(0, bus.clone(), config.uart),
            pwm: PwmController::new(bus.clone()),
            analyzer: LogicAnalyzer::new(),
            sched: Scheduler::new(),
            bus,
        }
    }

    #[inline]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[inline]
    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    #[inline]
    pub fn clock_mut(&mut self) -> &mut SimClock {
        &mut self.clock
    }

    #[inline]
    pub fn now(&self) -> SimInstant {
        self.clock.now()
    }

    /// Start the clock and publish `simulation_start`.
    pub fn start(&mut self) {
        self.clock.start();
        self.publish_lifecycle(EventKind::SimulationStart);
    }

    /// Stop the clock and publish `simulation_stop`.
    pub fn stop(&mut self) {
        self.clock.stop();
        self.publish_lifecycle(EventKind::SimulationStop);
    }

    /// Zero time, drop timers and scheduled ops, publish `simulation_reset`.
    pub fn reset(&mut self) {
        self.clock.reset();
        self.sched.clear();
        self.publish_lifecycle(EventKind::SimulationReset);
    }

    fn publish_lifecycle(&self, kind: EventKind) {
        self.bus.publish(Event::new(
            kind,
            self.clock.now(),
            "simulator",
            Payload::new(),
        ));
    }

    /// Advance the simulation by one timestep.
    ///
    /// Ordering within the tick: scheduler ops, clock timers, GPIO PWM, PWM
    /// controller, analyzer sampling. Returns false while the clock is stopped
    /// or paused.
    pub fn tick(&mut self) -> bool {
        let Some(now) = self.clock.advance_step() else {
            return false;
        };
        while let Some((_, op)) = self.sched.pop_due(now) {
            self.apply(op, now);
        }
        self.clock.fire_due_timers();
        self.gpio.update_pwm(now);
        self.pwm.update(now);

        let (analyzer, gpio, pwm) = (&mut self.analyzer, &self.gpio, &self.pwm);
        analyzer.update(now, |source| match source {
            SignalSource::Gpio(pin) => gpio.signal(pin).map(|s| s.value()),
            SignalSource::Pwm(channel) => pwm.signal_by_channel(channel).map(|s| s.value()),
        });
        true
    }

    fn apply(&mut self, op: KernelOp, now: SimInstant) {
        match op {
            KernelOp::RestoreLevel { pin, level } => {
                if let Err(err) = self.gpio.restore_level(pin, level, now) {
                    log::warn!("scheduled level write on GPIO{pin} at {now:?} failed: {err}");
                }
            }
        }
    }

    /// Loop `tick` until `now >= target` or the clock stops.
    pub fn advance_to(&mut self, target: SimInstant) {
        while self.clock.now() < target && self.tick() {}
    }

    /// Run for a simulated duration from the current instant.
    pub fn run_for(&mut self, duration: SimDuration) {
        let target = self.clock.now() + duration;
        self.advance_to(target);
    }

    /// Resolve a signal source against the live peripherals.
    pub fn signal_value(&self, source: SignalSource) -> Option<f64> {
        match source {
            SignalSource::Gpio(pin) => self.gpio.signal(pin).map(|s| s.value()),
            SignalSource::Pwm(channel) => self.pwm.signal_by_channel(channel).map(|s| s.value()),
        }
    }

    /// Invert a pin for `duration` starting at `now`; the restore op runs
    /// through the kernel scheduler.
    pub fn inject_glitch(
        &mut self,
        pin: u8,
        duration: SimDuration,
        now: SimInstant,
    ) -> Result<(), GpioError> {
        let restore = self.gpio.inject_glitch(pin, duration, now)?;
        self.sched.schedule_at(
            restore.at,
            0,
            KernelOp::RestoreLevel {
                pin: restore.pin,
                level: restore.level,
            },
        );
        Ok(())
    }

    /// Schedule a pin level write at an absolute instant; a deterministic
    /// external stimulus for tests.
    pub fn drive_pin_at(&mut self, pin: u8, level: PinState, at: SimInstant) {
        self.sched
            .schedule_at(at, 0, KernelOp::RestoreLevel { pin, level });
    }

    //==============================================================================================
    // embedded-hal handles
    //==============================================================================================

    pub fn output_pin(&mut self, pin: u8, initial: PinState) -> Result<gpio::Output<'_>, GpioError> {
        gpio::Output::new(&mut self.gpio, &self.clock, pin, initial)
    }

    pub fn input_pin(&mut self, pin: u8, pull: gpio::Pull) -> Result<gpio::Input<'_>, GpioError> {
        gpio::Input::new_with_pull(&mut self.gpio, &self.clock, pin, pull)
    }

    pub fn i2c_master(&mut self) -> I2cMaster<'_> {
        I2cMaster::new(&mut self.i2c, &self.clock)
    }

    pub fn spi_bus(&mut self, chip_select: u8) -> SpiMaster<'_> {
        SpiMaster::new(&mut self.spi, &self.clock, chip_select)
    }

    pub fn serial(&mut self) -> Serial<'_> {
        Serial::new(&mut self.uart, &self.clock)
    }

    pub fn pwm_channel(&mut self, pin: u8) -> Result<DutyCycle<'_>, NoPwmChannelError> {
        DutyCycle::new(&mut self.pwm, &self.clock, pin)
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Simulator::new(SimConfig::default())
    }
}
