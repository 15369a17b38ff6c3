//! Standalone PWM controller: per-channel frequency/duty waveform generation
//! into an owned signal.
//!
//! This coexists with the GPIO controller's PWM subsystem; which one owns a pin
//! is decided by the API the caller used. Channels here drive their own `PWM<n>`
//! signals, sampled by the analyzer through [crate::signal::SignalSource::Pwm].
use std::collections::BTreeMap;

use crate::event::{Event, EventBus, EventKind, Payload};
use crate::signal::Signal;
use crate::time::{Hertz, SimInstant};

/// Channel-to-pin map shared with the hardware PWM block.
pub const PWM_CHANNEL_PINS: [(u8, u8); 4] = [(0, 18), (1, 19), (2, 12), (3, 13)];

/// Frequency clamp range.
pub const MIN_FREQUENCY: Hertz = Hertz::from_raw(1);
pub const MAX_FREQUENCY: Hertz = Hertz::from_raw(100_000);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("no PWM channel is bound to pin {0}")]
pub struct NoPwmChannelError(pub u8);

impl NoPwmChannelError {
    pub fn code(&self) -> &'static str {
        "invalid_pin"
    }
}

/// One PWM output channel with its bound signal.
pub struct PwmChannel {
    channel: u8,
    pin: u8,
    frequency: Hertz,
    duty: f64,
    enabled: bool,
    level: bool,
    signal: Signal,
}

impl PwmChannel {
    fn new(channel: u8, pin: u8) -> Self {
        PwmChannel {
            channel,
            pin,
            frequency: Hertz::from_raw(1_000),
            duty: 0.0,
            enabled: false,
            level: false,
            signal: Signal::new(format!("PWM{channel}")),
        }
    }

    #[inline]
    pub fn pin(&self) -> u8 {
        self.pin
    }

    #[inline]
    pub fn frequency(&self) -> Hertz {
        self.frequency
    }

    #[inline]
    pub fn duty_cycle(&self) -> f64 {
        self.duty
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    fn set_frequency(&mut self, frequency: Hertz) {
        self.frequency =
            Hertz::from_raw(frequency.raw().clamp(MIN_FREQUENCY.raw(), MAX_FREQUENCY.raw()));
    }

    fn set_duty_cycle(&mut self, duty: f64) {
        self.duty = duty.clamp(0.0, 100.0);
    }

    /// Evaluate the waveform at `now`, writing the signal only on transitions.
    fn update(&mut self, now: SimInstant) {
        if !self.enabled {
            return;
        }
        let period_us = 1e6 / self.frequency.raw() as f64;
        let cycle = now.duration_since_epoch().ticks() as f64 % period_us;
        let level = cycle < period_us * self.duty / 100.0;
        if level != self.level {
            self.level = level;
            let value = if level { 1.0 } else { 0.0 };
            if let Err(err) = self.signal.set_value(value, now, None) {
                log::warn!("PWM{}: sample at {now:?} dropped: {err}", self.channel);
            }
        }
    }
}

/// PWM controller owning the hardware channels.
pub struct PwmController {
    bus: EventBus,
    channels: BTreeMap<u8, PwmChannel>,
}

impl PwmController {
    pub fn new(bus: EventBus) -> Self {
        let channels = PWM_CHANNEL_PINS
            .iter()
            .map(|&(channel, pin)| (channel, PwmChannel::new(channel, pin)))
            .collect();
        PwmController { bus, channels }
    }

    /// Channel bound to a pin, if any.
    pub fn channel_for_pin(&self, pin: u8) -> Option<&PwmChannel> {
        self.channels.values().find(|c| c.pin == pin)
    }

    fn channel_for_pin_mut(&mut self, pin: u8) -> Result<&mut PwmChannel, NoPwmChannelError> {
        self.channels
            .values_mut()
            .find(|c| c.pin == pin)
            .ok_or(NoPwmChannelError(pin))
    }

    pub fn channel(&self, channel: u8) -> Option<&PwmChannel> {
        self.channels.get(&channel)
    }

    /// Set a pin's PWM frequency, clamped to [MIN_FREQUENCY]..=[MAX_FREQUENCY].
    pub fn set_frequency(
        &mut self,
        pin: u8,
        frequency: Hertz,
        now: SimInstant,
    ) -> Result<(), NoPwmChannelError> {
        let channel = self.channel_for_pin_mut(pin)?;
        let old = channel.frequency;
        channel.set_frequency(frequency);
        let (id, new) = (channel.channel, channel.frequency);
        self.bus.publish(Event::new(
            EventKind::PwmUpdate,
            now,
            format!("PWM{id}"),
            Payload::new()
                .with("pin", pin)
                .with("frequency", new.raw())
                .with("old_frequency", old.raw()),
        ));
        Ok(())
    }

    /// Set a pin's duty cycle in percent, clamped to [0, 100].
    pub fn set_duty_cycle(
        &mut self,
        pin: u8,
        duty: f64,
        now: SimInstant,
    ) -> Result<(), NoPwmChannelError> {
        let channel = self.channel_for_pin_mut(pin)?;
        let old = channel.duty;
        channel.set_duty_cycle(duty);
        let (id, new) = (channel.channel, channel.duty);
        self.bus.publish(Event::new(
            EventKind::PwmUpdate,
            now,
            format!("PWM{id}"),
            Payload::new()
                .with("pin", pin)
                .with("duty_cycle", new)
                .with("old_duty_cycle", old),
        ));
        Ok(())
    }

    pub fn start_pwm(&mut self, pin: u8) -> Result<(), NoPwmChannelError> {
        self.channel_for_pin_mut(pin)?.enabled = true;
        Ok(())
    }

    pub fn stop_pwm(&mut self, pin: u8) -> Result<(), NoPwmChannelError> {
        self.channel_for_pin_mut(pin)?.enabled = false;
        Ok(())
    }

    /// Per-tick evaluation of all enabled channels; called by the kernel.
    pub fn update(&mut self, now: SimInstant) {
        for channel in self.channels.values_mut() {
            channel.update(now);
        }
    }

    /// Signal owned by the channel bound to `pin`.
    pub fn signal(&self, pin: u8) -> Option<&Signal> {
        self.channel_for_pin(pin).map(|c| c.signal())
    }

    /// Signal owned by a channel id, for the analyzer probe.
    pub fn signal_by_channel(&self, channel: u8) -> Option<&Signal> {
        self.channels.get(&channel).map(|c| c.signal())
    }
}

//==================================================================================================
// embedded-hal duty-cycle handle
//==================================================================================================

const EH_DUTY_MAX: u16 = u16::MAX;

/// `embedded-hal` duty-cycle handle bound to one channel pin.
pub struct DutyCycle<'a> {
    pwm: &'a mut PwmController,
    clock: &'a crate::clock::SimClock,
    pin: u8,
}

impl<'a> DutyCycle<'a> {
    pub fn new(
        pwm: &'a mut PwmController,
        clock: &'a crate::clock::SimClock,
        pin: u8,
    ) -> Result<Self, NoPwmChannelError> {
        if pwm.channel_for_pin(pin).is_none() {
            return Err(NoPwmChannelError(pin));
        }
        Ok(DutyCycle { pwm, clock, pin })
    }
}

impl embedded_hal::pwm::ErrorType for DutyCycle<'_> {
    type Error = core::convert::Infallible;
}

impl embedded_hal::pwm::SetDutyCycle for DutyCycle<'_> {
    #[inline]
    fn max_duty_cycle(&self) -> u16 {
        EH_DUTY_MAX
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Self::Error> {
        let percent = duty as f64 / EH_DUTY_MAX as f64 * 100.0;
        // The channel is validated at construction.
        let _ = self.pwm.set_duty_cycle(self.pin, percent, self.clock.now());
        Ok(())
    }
}
