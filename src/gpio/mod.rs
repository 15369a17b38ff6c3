//! GPIO controller: pin modes, pulls, edge detection, hardware and software PWM.
//!
//! All mutations flow through `&mut self`; the simulator owns the controller and
//! the borrow checker serializes access. Every level change publishes a
//! `gpio_state` event and, when it produces a LOW/HIGH transition, a `gpio_edge`
//! event at the same timestamp, in that order.
use std::collections::BTreeMap;

pub use embedded_hal::digital::PinState;

use crate::clock::SimClock;
use crate::event::{Event, EventBus, EventKind, Payload};
use crate::pins::{self, PinMode};
use crate::signal::{Edge, EdgeFilter, SampleOrderError, Signal};
use crate::time::{Hertz, SimDuration, SimInstant};

pub mod regs;

pub use regs::{FunctionSelect, PullEncoding, RegisterFile};

/// Hardware PWM channel map: (channel, pin).
pub const HW_PWM_CHANNELS: [(usize, u8); 4] = [(0, 18), (1, 19), (2, 12), (3, 13)];

/// Reference clock feeding the hardware PWM dividers.
pub const PWM_REF_CLOCK: Hertz = Hertz::from_raw(19_200_000);

const DUTY_MIN: f64 = 0.0;
const DUTY_MAX: f64 = 100.0;

//==================================================================================================
// Definitions
//==================================================================================================

/// Pull resistor selection. Pull-up and pull-down are mutually exclusive by
/// construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    #[default]
    None,
    Up,
    Down,
}

impl Pull {
    fn encoding(&self) -> PullEncoding {
        match self {
            Pull::None => PullEncoding::Off,
            Pull::Up => PullEncoding::Up,
            Pull::Down => PullEncoding::Down,
        }
    }

    /// Level an undriven input reads at.
    fn idle_level(&self) -> PinState {
        match self {
            Pull::Up => PinState::High,
            _ => PinState::Low,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum GpioError {
    #[error("invalid GPIO pin {0}")]
    InvalidPin(u8),
    #[error("pin {pin} is in {mode:?} mode, expected {expected:?}")]
    WrongMode {
        pin: u8,
        mode: PinMode,
        expected: PinMode,
    },
    #[error("pin {0} has no hardware PWM channel")]
    NoHardwarePwm(u8),
    #[error("no PWM is configured on pin {0}")]
    PwmNotConfigured(u8),
    #[error("drive strength {0} mA is not one of 2, 4, .., 16")]
    InvalidDriveStrength(u8),
    #[error(transparent)]
    SampleOrder(#[from] SampleOrderError),
}

impl GpioError {
    /// Stable textual error code.
    pub fn code(&self) -> &'static str {
        match self {
            GpioError::InvalidPin(_) | GpioError::NoHardwarePwm(_) => "invalid_pin",
            GpioError::WrongMode { .. } | GpioError::PwmNotConfigured(_) => "wrong_mode",
            GpioError::InvalidDriveStrength(_) => "invalid_pin",
            GpioError::SampleOrder(_) => "sample_order",
        }
    }
}

/// Deferred glitch restoration, scheduled by the kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlitchRestore {
    pub pin: u8,
    pub level: PinState,
    pub at: SimInstant,
}

type DetectCallback = Box<dyn FnMut(u8, Edge, SimInstant)>;

struct EdgeDetect {
    filter: EdgeFilter,
    callbacks: Vec<DetectCallback>,
}

struct PinRuntime {
    mode: PinMode,
    /// Output latch; what the pin drives in output mode.
    latch: PinState,
    /// External drive on the wire, set by stimulus APIs. Wins over pulls.
    driven: Option<PinState>,
    pull: Pull,
    drive_strength_ma: u8,
    fast_slew: bool,
    bounce: Option<SimDuration>,
    last_edge: Option<SimInstant>,
    detect: Option<EdgeDetect>,
}

impl PinRuntime {
    fn new() -> Self {
        PinRuntime {
            mode: PinMode::Input,
            latch: PinState::Low,
            driven: None,
            pull: Pull::None,
            drive_strength_ma: 8,
            fast_slew: true,
            bounce: None,
            last_edge: None,
            detect: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HwPwm {
    pin: u8,
    frequency: Hertz,
    duty: f64,
    enabled: bool,
    level: bool,
}

#[derive(Debug, Clone, Copy)]
struct SoftPwm {
    frequency: Hertz,
    duty: f64,
    enabled: bool,
    level: bool,
}

#[inline]
fn level_bit(level: PinState) -> u8 {
    match level {
        PinState::Low => 0,
        PinState::High => 1,
    }
}

#[inline]
fn pwm_level(now: SimInstant, frequency: Hertz, duty: f64) -> bool {
    let period_us = 1e6 / frequency.raw() as f64;
    let cycle = now.duration_since_epoch().ticks() as f64 % period_us;
    cycle < period_us * duty / 100.0
}

//==================================================================================================
// Controller
//==================================================================================================

/// BCM-numbered GPIO controller with per-pin signals and an observable register
/// mirror.
pub struct GpioController {
    bus: EventBus,
    pins: BTreeMap<u8, PinRuntime>,
    signals: BTreeMap<u8, Signal>,
    regs: RegisterFile,
    hw_pwm: [HwPwm; 4],
    sw_pwm: BTreeMap<u8, SoftPwm>,
}

impl GpioController {
    pub fn new(bus: EventBus) -> Self {
        let mut pins = BTreeMap::new();
        let mut signals = BTreeMap::new();
        for def in pins::HEADER_PINS.iter().filter(|p| p.is_gpio()) {
            pins.insert(def.bcm, PinRuntime::new());
            signals.insert(def.bcm, Signal::new(def.name));
        }
        GpioController {
            bus,
            pins,
            signals,
            regs: RegisterFile::new(),
            hw_pwm: HW_PWM_CHANNELS.map(|(_, pin)| HwPwm {
                pin,
                frequency: Hertz::from_raw(1_000),
                duty: 0.0,
                enabled: false,
                level: false,
            }),
            sw_pwm: BTreeMap::new(),
        }
    }

    fn pin(&self, pin: u8) -> Result<&PinRuntime, GpioError> {
        pins::require_gpio(pin)?;
        self.pins.get(&pin).ok_or(GpioError::InvalidPin(pin))
    }

    fn pin_mut(&mut self, pin: u8) -> Result<&mut PinRuntime, GpioError> {
        pins::require_gpio(pin)?;
        self.pins.get_mut(&pin).ok_or(GpioError::InvalidPin(pin))
    }

    /// Configure a pin's mode and pull resistors.
    ///
    /// After an input setup with pull-up the pin reads 1, otherwise 0; the
    /// initial level is recorded as a signal sample at `now` without publishing
    /// any event.
    pub fn setup(
        &mut self,
        pin: u8,
        mode: PinMode,
        pull: Pull,
        now: SimInstant,
    ) -> Result<(), GpioError> {
        let rt = self.pin_mut(pin)?;
        rt.mode = mode;
        rt.pull = pull;
        let initial = pull.idle_level();
        rt.latch = initial;
        self.regs.set_function(pin, mode.into());
        self.regs.set_pull(pull.encoding());
        self.regs.set_level(pin, level_bit(initial) == 1);
        if let Some(signal) = self.signals.get_mut(&pin) {
            // Edges from re-configuration are intentionally not reported.
            let _ = signal.set_value(level_bit(initial) as f64, now, None)?;
        }
        Ok(())
    }

    /// Drive an output pin. The pin must be in output mode.
    pub fn output(&mut self, pin: u8, level: PinState, now: SimInstant) -> Result<(), GpioError> {
        let rt = self.pin(pin)?;
        if rt.mode != PinMode::Output {
            return Err(GpioError::WrongMode {
                pin,
                mode: rt.mode,
                expected: PinMode::Output,
            });
        }
        self.apply_level(pin, level, now, true)
    }

    /// Read the effective level of a pin.
    ///
    /// An external drive wins over the pull resistors; without one, an input pin
    /// reads its pull's idle level and an output pin reads its latch.
    pub fn input(&self, pin: u8) -> Result<PinState, GpioError> {
        let rt = self.pin(pin)?;
        if let Some(level) = rt.driven {
            return Ok(level);
        }
        Ok(match rt.mode {
            PinMode::Input => rt.pull.idle_level(),
            _ => rt.latch,
        })
    }

    /// External stimulus: drive the wire from outside the controller.
    pub fn drive_input(
        &mut self,
        pin: u8,
        level: PinState,
        now: SimInstant,
    ) -> Result<(), GpioError> {
        self.pin(pin)?;
        self.apply_level(pin, level, now, false)
    }

    /// Remove an external drive; the pin falls back to its pull level on the
    /// next read. No event is published.
    pub fn release_input(&mut self, pin: u8) -> Result<(), GpioError> {
        self.pin_mut(pin)?.driven = None;
        Ok(())
    }

    /// Shared write path for outputs, stimuli, PWM and glitch restoration.
    ///
    /// Publishes `gpio_state`, updates the signal, then publishes `gpio_edge`
    /// and runs debounced detect callbacks if the write produced an edge.
    fn apply_level(
        &mut self,
        pin: u8,
        level: PinState,
        now: SimInstant,
        latch: bool,
    ) -> Result<(), GpioError> {
        {
            let rt = self.pins.get_mut(&pin).ok_or(GpioError::InvalidPin(pin))?;
            if latch {
                rt.latch = level;
            } else {
                rt.driven = Some(level);
            }
        }
        let bit = level_bit(level);
        self.regs.set_level(pin, bit == 1);

        self.bus.publish(Event::new(
            EventKind::GpioState,
            now,
            format!("GPIO{pin}"),
            Payload::new().with("pin", pin).with("value", bit),
        ));

        let edge = match self.signals.get_mut(&pin) {
            Some(signal) => signal.set_value(bit as f64, now, None)?,
            None => None,
        };
        if let Some(edge) = edge {
            self.handle_edge(pin, edge, bit, now);
        }
        Ok(())
    }

    fn handle_edge(&mut self, pin: u8, edge: Edge, bit: u8, now: SimInstant) {
        self.bus.publish(Event::new(
            EventKind::GpioEdge,
            now,
            format!("GPIO{pin}"),
            Payload::new()
                .with("pin", pin)
                .with("edge", edge.as_str())
                .with("value", bit),
        ));

        let Some(rt) = self.pins.get_mut(&pin) else {
            return;
        };
        let previous_edge = rt.last_edge.replace(now);
        let suppressed = match (rt.bounce, previous_edge) {
            (Some(bounce), Some(previous)) => now
                .checked_duration_since(previous)
                .is_some_and(|elapsed| elapsed < bounce),
            _ => false,
        };
        if suppressed {
            log::trace!("GPIO{pin}: edge at {now:?} suppressed by bounce filter");
            return;
        }
        if let Some(detect) = rt.detect.as_mut() {
            if detect.filter.matches(edge) {
                for callback in &mut detect.callbacks {
                    callback(pin, edge, now);
                }
            }
        }
    }

    /// Register edge detection on a pin.
    ///
    /// Every matching transition still publishes `gpio_edge`; the callback is
    /// additionally invoked unless the edge falls inside the bounce window.
    pub fn add_event_detect(
        &mut self,
        pin: u8,
        filter: EdgeFilter,
        callback: Option<impl FnMut(u8, Edge, SimInstant) + 'static>,
        bounce: Option<SimDuration>,
    ) -> Result<(), GpioError> {
        let rt = self.pin_mut(pin)?;
        let detect = rt.detect.get_or_insert_with(|| EdgeDetect {
            filter,
            callbacks: Vec::new(),
        });
        detect.filter = filter;
        if let Some(callback) = callback {
            detect.callbacks.push(Box::new(callback));
        }
        rt.bounce = bounce;
        self.regs.set_edge_detect(pin, filter, true);
        Ok(())
    }

    pub fn remove_event_detect(&mut self, pin: u8) -> Result<(), GpioError> {
        let rt = self.pin_mut(pin)?;
        rt.detect = None;
        rt.bounce = None;
        self.regs.clear_edge_detect(pin);
        Ok(())
    }

    /// Electrical characteristics. Valid drive strengths are 2, 4, .., 16 mA.
    pub fn configure_drive(
        &mut self,
        pin: u8,
        strength_ma: u8,
        fast_slew: bool,
    ) -> Result<(), GpioError> {
        if !(2..=16).contains(&strength_ma) || strength_ma % 2 != 0 {
            return Err(GpioError::InvalidDriveStrength(strength_ma));
        }
        let rt = self.pin_mut(pin)?;
        rt.drive_strength_ma = strength_ma;
        rt.fast_slew = fast_slew;
        Ok(())
    }

    pub fn drive_strength(&self, pin: u8) -> Result<u8, GpioError> {
        Ok(self.pin(pin)?.drive_strength_ma)
    }

    pub fn pin_mode(&self, pin: u8) -> Result<PinMode, GpioError> {
        Ok(self.pin(pin)?.mode)
    }

    //==============================================================================================
    // PWM
    //==============================================================================================

    /// Enable a hardware PWM channel on one of the fixed PWM pins.
    ///
    /// Computes `range = refclk / freq` and `data = range * duty / 100` into the
    /// register mirror and switches the pin to its PWM alternate function.
    pub fn setup_pwm_hardware(
        &mut self,
        pin: u8,
        frequency: Hertz,
        duty: f64,
    ) -> Result<(), GpioError> {
        let channel = Self::hw_channel(pin).ok_or(GpioError::NoHardwarePwm(pin))?;
        self.pin(pin)?;
        let duty = duty.clamp(DUTY_MIN, DUTY_MAX);
        let frequency = Hertz::from_raw(frequency.raw().clamp(1, 100_000));
        {
            let hw = &mut self.hw_pwm[channel];
            hw.frequency = frequency;
            hw.duty = duty;
            hw.enabled = true;
        }
        self.update_hw_registers(channel);
        self.regs.set_pwm_channel(channel, true);
        let mode = match pin {
            18 | 19 => PinMode::Alt5,
            _ => PinMode::Alt0,
        };
        let rt = self.pins.get_mut(&pin).ok_or(GpioError::InvalidPin(pin))?;
        rt.mode = mode;
        self.regs.set_function(pin, mode.into());
        Ok(())
    }

    /// Configure software PWM on any GPIO pin. The pin is switched to output.
    pub fn setup_pwm_software(
        &mut self,
        pin: u8,
        frequency: Hertz,
        now: SimInstant,
    ) -> Result<(), GpioError> {
        self.setup(pin, PinMode::Output, Pull::None, now)?;
        let entry = self.sw_pwm.entry(pin).or_insert(SoftPwm {
            frequency,
            duty: 0.0,
            enabled: false,
            level: false,
        });
        entry.frequency = Hertz::from_raw(frequency.raw().clamp(1, 100_000));
        Ok(())
    }

    /// Start PWM output with the given duty cycle. Hardware channels win when
    /// the pin has one.
    pub fn start_pwm(&mut self, pin: u8, duty: f64) -> Result<(), GpioError> {
        let duty = duty.clamp(DUTY_MIN, DUTY_MAX);
        if let Some(channel) = Self::hw_channel(pin) {
            self.hw_pwm[channel].duty = duty;
            self.hw_pwm[channel].enabled = true;
            self.update_hw_registers(channel);
            self.regs.set_pwm_channel(channel, true);
            return Ok(());
        }
        match self.sw_pwm.get_mut(&pin) {
            Some(sw) => {
                sw.duty = duty;
                sw.enabled = true;
                Ok(())
            }
            None => Err(GpioError::PwmNotConfigured(pin)),
        }
    }

    /// Stop PWM on a pin. Software PWM additionally drives the pin low.
    pub fn stop_pwm(&mut self, pin: u8, now: SimInstant) -> Result<(), GpioError> {
        if let Some(channel) = Self::hw_channel(pin) {
            if self.hw_pwm[channel].enabled {
                self.hw_pwm[channel].enabled = false;
                self.regs.set_pwm_channel(channel, false);
                return Ok(());
            }
        }
        match self.sw_pwm.get_mut(&pin) {
            Some(sw) => {
                sw.enabled = false;
                sw.level = false;
                self.apply_level(pin, PinState::Low, now, true)
            }
            None => Err(GpioError::PwmNotConfigured(pin)),
        }
    }

    /// Change the duty cycle of an already running PWM output.
    pub fn change_duty_cycle(&mut self, pin: u8, duty: f64) -> Result<(), GpioError> {
        let duty = duty.clamp(DUTY_MIN, DUTY_MAX);
        if let Some(channel) = Self::hw_channel(pin) {
            if self.hw_pwm[channel].enabled {
                self.hw_pwm[channel].duty = duty;
                self.update_hw_registers(channel);
                return Ok(());
            }
        }
        match self.sw_pwm.get_mut(&pin) {
            Some(sw) if sw.enabled => {
                sw.duty = duty;
                Ok(())
            }
            _ => Err(GpioError::PwmNotConfigured(pin)),
        }
    }

    /// Change the frequency of an already running PWM output.
    pub fn change_frequency(&mut self, pin: u8, frequency: Hertz) -> Result<(), GpioError> {
        let frequency = Hertz::from_raw(frequency.raw().clamp(1, 100_000));
        if let Some(channel) = Self::hw_channel(pin) {
            if self.hw_pwm[channel].enabled {
                self.hw_pwm[channel].frequency = frequency;
                self.update_hw_registers(channel);
                return Ok(());
            }
        }
        match self.sw_pwm.get_mut(&pin) {
            Some(sw) if sw.enabled => {
                sw.frequency = frequency;
                Ok(())
            }
            _ => Err(GpioError::PwmNotConfigured(pin)),
        }
    }

    /// Per-tick PWM evaluation for all enabled channels. Only transitions are
    /// written out.
    pub fn update_pwm(&mut self, now: SimInstant) {
        let mut writes: Vec<(u8, PinState)> = Vec::new();

        for channel in 0..self.hw_pwm.len() {
            let hw = &mut self.hw_pwm[channel];
            if !hw.enabled {
                continue;
            }
            let level = pwm_level(now, hw.frequency, hw.duty);
            if level != hw.level {
                hw.level = level;
                writes.push((hw.pin, PinState::from(level)));
            }
        }

        for (&pin, sw) in self.sw_pwm.iter_mut() {
            if !sw.enabled {
                continue;
            }
            let level = pwm_level(now, sw.frequency, sw.duty);
            if level != sw.level {
                sw.level = level;
                writes.push((pin, PinState::from(level)));
            }
        }

        for (pin, level) in writes {
            if let Err(err) = self.apply_level(pin, level, now, true) {
                log::warn!("GPIO{pin}: PWM update at {now:?} dropped: {err}");
            }
        }
    }

    fn hw_channel(pin: u8) -> Option<usize> {
        HW_PWM_CHANNELS
            .iter()
            .find(|(_, p)| *p == pin)
            .map(|(ch, _)| *ch)
    }

    fn update_hw_registers(&mut self, channel: usize) {
        let hw = &self.hw_pwm[channel];
        let range = PWM_REF_CLOCK.raw() / hw.frequency.raw().max(1);
        let data = (range as f64 * hw.duty / 100.0) as u32;
        self.regs.set_pwm_values(channel, range, data);
    }

    //==============================================================================================
    // Fault injection and observability
    //==============================================================================================

    /// Invert the pin for `duration`, for fault-injection tests.
    ///
    /// The inverse level is driven immediately; the returned restore op must be
    /// handed to the kernel scheduler to write the original level back at
    /// `now + duration`.
    pub fn inject_glitch(
        &mut self,
        pin: u8,
        duration: SimDuration,
        now: SimInstant,
    ) -> Result<GlitchRestore, GpioError> {
        self.pin(pin)?;
        let original = match self.signals.get(&pin) {
            Some(signal) if signal.value() >= 0.5 => PinState::High,
            _ => PinState::Low,
        };
        let inverse = match original {
            PinState::High => PinState::Low,
            PinState::Low => PinState::High,
        };
        log::debug!("GPIO{pin}: injecting {duration:?} glitch at {now:?}");
        self.apply_level(pin, inverse, now, false)?;
        Ok(GlitchRestore {
            pin,
            level: original,
            at: now + duration,
        })
    }

    /// Restore a level previously saved by [Self::inject_glitch].
    pub fn restore_level(
        &mut self,
        pin: u8,
        level: PinState,
        now: SimInstant,
    ) -> Result<(), GpioError> {
        self.apply_level(pin, level, now, false)
    }

    /// Signal backing a pin, for the analyzer and for waveform queries.
    pub fn signal(&self, pin: u8) -> Option<&Signal> {
        self.signals.get(&pin)
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    /// Debug read of a mirrored register by name.
    pub fn read_register(&self, name: &str) -> Option<u32> {
        self.regs.read_by_name(name)
    }
}

//==================================================================================================
// embedded-hal pin handles
//==================================================================================================

/// Push-pull output pin handle over the controller.
///
/// Writes land at the clock's current instant, so the handle stays truthful as
/// the kernel advances time between calls.
pub struct Output<'a> {
    gpio: &'a mut GpioController,
    clock: &'a SimClock,
    pin: u8,
}

impl<'a> Output<'a> {
    pub fn new(
        gpio: &'a mut GpioController,
        clock: &'a SimClock,
        pin: u8,
        initial: PinState,
    ) -> Result<Self, GpioError> {
        gpio.setup(pin, PinMode::Output, Pull::None, clock.now())?;
        gpio.output(pin, initial, clock.now())?;
        Ok(Output { gpio, clock, pin })
    }

    #[inline]
    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn is_set_high(&self) -> bool {
        matches!(self.gpio.input(self.pin), Ok(PinState::High))
    }
}

impl embedded_hal::digital::ErrorType for Output<'_> {
    type Error = GpioError;
}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

impl embedded_hal::digital::OutputPin for Output<'_> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.gpio.output(self.pin, PinState::Low, self.clock.now())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.gpio.output(self.pin, PinState::High, self.clock.now())
    }
}

impl embedded_hal::digital::StatefulOutputPin for Output<'_> {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(Output::is_set_high(self))
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!Output::is_set_high(self))
    }
}

/// Input pin handle over the controller.
pub struct Input<'a> {
    gpio: &'a mut GpioController,
    clock: &'a SimClock,
    pin: u8,
}

impl<'a> Input<'a> {
    pub fn new_floating(
        gpio: &'a mut GpioController,
        clock: &'a SimClock,
        pin: u8,
    ) -> Result<Self, GpioError> {
        Self::new_with_pull(gpio, clock, pin, Pull::None)
    }

    pub fn new_with_pull(
        gpio: &'a mut GpioController,
        clock: &'a SimClock,
        pin: u8,
        pull: Pull,
    ) -> Result<Self, GpioError> {
        gpio.setup(pin, PinMode::Input, pull, clock.now())?;
        Ok(Input { gpio, clock, pin })
    }

    #[inline]
    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn is_high(&self) -> Result<bool, GpioError> {
        Ok(self.gpio.input(self.pin)? == PinState::High)
    }

    /// Drive the wire from the test side of the handle.
    pub fn drive(&mut self, level: PinState) -> Result<(), GpioError> {
        self.gpio.drive_input(self.pin, level, self.clock.now())
    }
}

impl embedded_hal::digital::ErrorType for Input<'_> {
    type Error = GpioError;
}

impl embedded_hal::digital::InputPin for Input<'_> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Input::is_high(self)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!Input::is_high(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn at(us: u64) -> SimInstant {
        SimInstant::from_ticks(us)
    }

    fn controller() -> (GpioController, EventBus) {
        let bus = EventBus::new();
        (GpioController::new(bus.clone()), bus)
    }

    #[test]
    fn setup_rejects_non_gpio_pins() {
        let (mut gpio, _bus) = controller();
        let err = gpio
            .setup(40, PinMode::Output, Pull::None, at(0))
            .unwrap_err();
        assert_eq!(err, GpioError::InvalidPin(40));
        assert_eq!(err.code(), "invalid_pin");
    }

    #[test]
    fn output_requires_output_mode() {
        let (mut gpio, _bus) = controller();
        gpio.setup(17, PinMode::Input, Pull::None, at(0)).unwrap();
        let err = gpio.output(17, PinState::High, at(1)).unwrap_err();
        assert_eq!(err.code(), "wrong_mode");
    }

    #[test]
    fn pull_up_input_reads_high_until_driven_low() {
        let (mut gpio, _bus) = controller();
        gpio.setup(17, PinMode::Input, Pull::Up, at(0)).unwrap();
        assert_eq!(gpio.input(17).unwrap(), PinState::High);
        // External drive wins over the pull.
        gpio.drive_input(17, PinState::Low, at(1)).unwrap();
        assert_eq!(gpio.input(17).unwrap(), PinState::Low);
        gpio.release_input(17).unwrap();
        assert_eq!(gpio.input(17).unwrap(), PinState::High);
    }

    #[test]
    fn pull_down_input_reads_low() {
        let (mut gpio, _bus) = controller();
        gpio.setup(17, PinMode::Input, Pull::Down, at(0)).unwrap();
        assert_eq!(gpio.input(17).unwrap(), PinState::Low);
    }

    #[test]
    fn output_publishes_state_then_edge_at_same_timestamp() {
        let (mut gpio, bus) = controller();
        bus.start_recording();
        gpio.setup(18, PinMode::Output, Pull::None, at(0)).unwrap();
        gpio.output(18, PinState::High, at(5)).unwrap();
        let events = bus.stop_recording();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::GpioState);
        assert_eq!(events[1].kind, EventKind::GpioEdge);
        assert_eq!(events[0].timestamp, events[1].timestamp);
        assert_eq!(events[1].payload.get("edge").unwrap().as_str(), Some("rising"));
    }

    #[test]
    fn setup_publishes_no_events() {
        let (mut gpio, bus) = controller();
        bus.start_recording();
        gpio.setup(18, PinMode::Output, Pull::None, at(0)).unwrap();
        assert_eq!(bus.recorded_len(), 0);
    }

    #[test]
    fn edge_callbacks_fire_with_filter() {
        let (mut gpio, _bus) = controller();
        gpio.setup(23, PinMode::Input, Pull::None, at(0)).unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let log = hits.clone();
        gpio.add_event_detect(
            23,
            EdgeFilter::Rising,
            Some(move |pin: u8, edge: Edge, t: SimInstant| {
                log.borrow_mut().push((pin, edge, t.duration_since_epoch().ticks()));
            }),
            None,
        )
        .unwrap();
        gpio.drive_input(23, PinState::High, at(10)).unwrap();
        gpio.drive_input(23, PinState::Low, at(20)).unwrap();
        gpio.drive_input(23, PinState::High, at(30)).unwrap();
        assert_eq!(
            *hits.borrow(),
            vec![(23, Edge::Rising, 10), (23, Edge::Rising, 30)]
        );
    }

    #[test]
    fn bounce_suppresses_rapid_callbacks_but_not_events() {
        let (mut gpio, bus) = controller();
        gpio.setup(23, PinMode::Input, Pull::None, at(0)).unwrap();
        let hits = Rc::new(RefCell::new(0u32));
        let counter = hits.clone();
        gpio.add_event_detect(
            23,
            EdgeFilter::Both,
            Some(move |_: u8, _: Edge, _: SimInstant| *counter.borrow_mut() += 1),
            Some(SimDuration::millis(50)),
        )
        .unwrap();
        bus.start_recording();
        gpio.drive_input(23, PinState::High, at(10_000)).unwrap();
        // 10 ms later: inside the bounce window.
        gpio.drive_input(23, PinState::Low, at(20_000)).unwrap();
        // 100 ms later: outside.
        gpio.drive_input(23, PinState::High, at(120_000)).unwrap();
        assert_eq!(*hits.borrow(), 2);
        assert_eq!(bus.events_of(EventKind::GpioEdge).len(), 3);
    }

    #[test]
    fn hardware_pwm_updates_register_mirror() {
        let (mut gpio, _bus) = controller();
        gpio.setup(18, PinMode::Output, Pull::None, at(0)).unwrap();
        gpio.setup_pwm_hardware(18, Hertz::from_raw(1_000), 25.0)
            .unwrap();
        // range = 19.2 MHz / 1 kHz, data = range / 4.
        assert_eq!(gpio.read_register("PWM_RNG0").unwrap(), 19_200);
        assert_eq!(gpio.read_register("PWM_DAT0").unwrap(), 4_800);
        assert!(gpio.registers().pwm_ctl().channel(0));
        assert_eq!(gpio.registers().function(18), FunctionSelect::Alt5);
    }

    #[test]
    fn hardware_pwm_is_pin_restricted() {
        let (mut gpio, _bus) = controller();
        let err = gpio
            .setup_pwm_hardware(4, Hertz::from_raw(1_000), 50.0)
            .unwrap_err();
        assert_eq!(err, GpioError::NoHardwarePwm(4));
    }

    #[test]
    fn software_pwm_generates_transitions_on_tick() {
        let (mut gpio, bus) = controller();
        gpio.setup_pwm_software(4, Hertz::from_raw(1_000), at(0)).unwrap();
        gpio.start_pwm(4, 50.0).unwrap();
        bus.start_recording();
        // 1 kHz, 50%: high during [0, 500) us of each 1000 us period.
        for us in 1..2_000u64 {
            gpio.update_pwm(at(us));
        }
        let edges = bus.events_of(EventKind::GpioEdge);
        // Rising at 1 and 1000, falling at 500 and 1500.
        assert_eq!(edges.len(), 4);
        let signal = gpio.signal(4).unwrap();
        assert_eq!(signal.frequency(SimDuration::millis(2)), Some(1_000.0));
    }

    #[test]
    fn stop_pwm_drives_software_pin_low() {
        let (mut gpio, _bus) = controller();
        gpio.setup_pwm_software(4, Hertz::from_raw(1_000), at(0)).unwrap();
        gpio.start_pwm(4, 100.0).unwrap();
        gpio.update_pwm(at(100));
        assert_eq!(gpio.input(4).unwrap(), PinState::High);
        gpio.stop_pwm(4, at(200)).unwrap();
        assert_eq!(gpio.input(4).unwrap(), PinState::Low);
    }

    #[test]
    fn change_duty_requires_running_pwm() {
        let (mut gpio, _bus) = controller();
        let err = gpio.change_duty_cycle(4, 10.0).unwrap_err();
        assert_eq!(err, GpioError::PwmNotConfigured(4));
    }

    #[test]
    fn glitch_inverts_and_reports_restore_op() {
        let (mut gpio, _bus) = controller();
        gpio.setup(18, PinMode::Output, Pull::None, at(0)).unwrap();
        gpio.output(18, PinState::High, at(10)).unwrap();
        let restore = gpio
            .inject_glitch(18, SimDuration::micros(50), at(100))
            .unwrap();
        assert_eq!(gpio.input(18).unwrap(), PinState::Low);
        assert_eq!(restore.level, PinState::High);
        assert_eq!(restore.at, at(150));
        gpio.restore_level(restore.pin, restore.level, restore.at).unwrap();
        assert_eq!(gpio.input(18).unwrap(), PinState::High);
    }

    #[test]
    fn stale_write_is_rejected() {
        let (mut gpio, _bus) = controller();
        gpio.setup(18, PinMode::Output, Pull::None, at(100)).unwrap();
        let err = gpio.output(18, PinState::High, at(50)).unwrap_err();
        assert!(matches!(err, GpioError::SampleOrder(_)));
    }

    #[test]
    fn output_handle_implements_embedded_hal() {
        use embedded_hal::digital::OutputPin;
        let bus = EventBus::new();
        let mut gpio = GpioController::new(bus.clone());
        let mut clock = SimClock::default();
        clock.start();
        clock.tick();
        let mut led = Output::new(&mut gpio, &clock, 18, PinState::Low).unwrap();
        led.set_high().unwrap();
        assert!(led.is_set_high());
    }
}
