//! SPI bus controller: full-duplex transfers against per-chip-select device
//! models.
//!
//! Transfers are atomic at the transaction level; the controller guarantees the
//! received byte count equals the transmitted count regardless of what the
//! attached model returns.
use std::collections::BTreeMap;

use embedded_hal::spi::{MODE_0, Mode, Phase, Polarity};

use crate::clock::SimClock;
use crate::event::{Event, EventBus, EventKind, Payload};
use crate::time::{Hertz, SimInstant};

/// Clock clamp range.
pub const MIN_CLOCK: Hertz = Hertz::from_raw(1_000);
pub const MAX_CLOCK: Hertz = Hertz::from_raw(32_000_000);

//==================================================================================================
// Devices
//==================================================================================================

/// Capability of an attached SPI device: one full-duplex transfer.
pub trait SpiDevice {
    /// Exchange bytes; the returned vector should match `mosi` in length.
    fn transfer(&mut self, mosi: &[u8]) -> Vec<u8>;
}

/// Attached device, built-in model or boxed custom implementation.
pub enum SpiSlave {
    Loopback(Loopback),
    Adc(Mcp3008),
    Custom(Box<dyn SpiDevice>),
}

impl SpiDevice for SpiSlave {
    fn transfer(&mut self, mosi: &[u8]) -> Vec<u8> {
        match self {
            SpiSlave::Loopback(dev) => dev.transfer(mosi),
            SpiSlave::Adc(dev) => dev.transfer(mosi),
            SpiSlave::Custom(dev) => dev.transfer(mosi),
        }
    }
}

/// Echoes MOSI back on MISO.
#[derive(Debug, Default)]
pub struct Loopback;

impl SpiDevice for Loopback {
    fn transfer(&mut self, mosi: &[u8]) -> Vec<u8> {
        mosi.to_vec()
    }
}

/// MCP3008-style 8-channel 10-bit ADC speaking the 3-byte single-ended
/// protocol: `[start, channel << 4, _]` in, `[_, high bits, low byte]` out.
#[derive(Debug, Default)]
pub struct Mcp3008 {
    channels: [u16; 8],
}

impl Mcp3008 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the 10-bit raw sample of a channel.
    pub fn set_channel_value(&mut self, channel: usize, raw: u16) {
        if let Some(slot) = self.channels.get_mut(channel) {
            *slot = raw & 0x3FF;
        }
    }
}

impl SpiDevice for Mcp3008 {
    fn transfer(&mut self, mosi: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; mosi.len()];
        if mosi.len() >= 3 && mosi[0] & 0x01 != 0 {
            let channel = ((mosi[1] >> 4) & 0x07) as usize;
            let raw = self.channels[channel];
            out[1] = (raw >> 8) as u8 & 0x03;
            out[2] = raw as u8;
        }
        out
    }
}

//==================================================================================================
// Controller
//==================================================================================================

/// The numeric index of an SPI mode, for events and decoders.
pub fn mode_index(mode: Mode) -> u8 {
    match (mode.polarity, mode.phase) {
        (Polarity::IdleLow, Phase::CaptureOnFirstTransition) => 0,
        (Polarity::IdleLow, Phase::CaptureOnSecondTransition) => 1,
        (Polarity::IdleHigh, Phase::CaptureOnFirstTransition) => 2,
        (Polarity::IdleHigh, Phase::CaptureOnSecondTransition) => 3,
    }
}

/// Completed transfer record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub timestamp: SimInstant,
    pub chip_select: u8,
    pub data_out: Vec<u8>,
    pub data_in: Vec<u8>,
    pub clock_freq: Hertz,
    pub mode: u8,
    /// Wire time in seconds: `len * 8 / clock`.
    pub duration: f64,
}

/// SPI bus with device models keyed by chip select.
pub struct SpiController {
    bus_id: u8,
    bus: EventBus,
    clock_freq: Hertz,
    mode: Mode,
    bits_per_word: u8,
    devices: BTreeMap<u8, SpiSlave>,
    transactions: Vec<TransferRecord>,
}

impl SpiController {
    pub fn new(bus_id: u8, bus: EventBus) -> Self {
        SpiController {
            bus_id,
            bus,
            clock_freq: Hertz::from_raw(1_000_000),
            mode: MODE_0,
            bits_per_word: 8,
            devices: BTreeMap::new(),
            transactions: Vec::new(),
        }
    }

    /// Attach a device. An existing device on the same chip select is replaced.
    pub fn add_device(&mut self, chip_select: u8, device: SpiSlave) {
        self.devices.insert(chip_select, device);
    }

    pub fn remove_device(&mut self, chip_select: u8) -> Option<SpiSlave> {
        self.devices.remove(&chip_select)
    }

    pub fn device_mut(&mut self, chip_select: u8) -> Option<&mut SpiSlave> {
        self.devices.get_mut(&chip_select)
    }

    /// Set the bus clock, clamped to [MIN_CLOCK]..=[MAX_CLOCK].
    pub fn set_clock_freq(&mut self, freq: Hertz) {
        self.clock_freq = Hertz::from_raw(freq.raw().clamp(MIN_CLOCK.raw(), MAX_CLOCK.raw()));
    }

    #[inline]
    pub fn clock_freq(&self) -> Hertz {
        self.clock_freq
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn bits_per_word(&self) -> u8 {
        self.bits_per_word
    }

    /// Full-duplex transfer with the device on `chip_select`.
    ///
    /// Returns the received bytes, always exactly `data.len()` of them, or
    /// `None` when no device is attached.
    pub fn transfer(&mut self, data: &[u8], chip_select: u8, now: SimInstant) -> Option<Vec<u8>> {
        let device = self.devices.get_mut(&chip_select)?;
        let mut received = device.transfer(data);
        if received.len() != data.len() {
            log::warn!(
                "SPI{}: device on CS{chip_select} returned {} bytes for a {}-byte transfer",
                self.bus_id,
                received.len(),
                data.len()
            );
            received.resize(data.len(), 0);
        }

        let duration = data.len() as f64 * 8.0 / self.clock_freq.raw() as f64;
        let mode = mode_index(self.mode);
        self.transactions.push(TransferRecord {
            timestamp: now,
            chip_select,
            data_out: data.to_vec(),
            data_in: received.clone(),
            clock_freq: self.clock_freq,
            mode,
            duration,
        });

        self.bus.publish(Event::new(
            EventKind::SpiTransaction,
            now,
            format!("SPI{}", self.bus_id),
            Payload::new()
                .with("device", chip_select)
                .with("data_out", data.to_vec())
                .with("data_in", received.clone())
                .with("clock_freq", self.clock_freq.raw())
                .with("mode", mode)
                .with("duration", duration),
        ));

        Some(received)
    }

    pub fn transactions(&self) -> &[TransferRecord] {
        &self.transactions
    }
}

//==================================================================================================
// embedded-hal bus handle
//==================================================================================================

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SpiMasterError {
    #[error("no device attached on chip select {0}")]
    NoDevice(u8),
}

impl embedded_hal::spi::Error for SpiMasterError {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        match self {
            SpiMasterError::NoDevice(_) => embedded_hal::spi::ErrorKind::ChipSelectFault,
        }
    }
}

/// `embedded-hal` bus view bound to one chip select.
pub struct SpiMaster<'a> {
    ctrl: &'a mut SpiController,
    clock: &'a SimClock,
    chip_select: u8,
}

impl<'a> SpiMaster<'a> {
    pub fn new(ctrl: &'a mut SpiController, clock: &'a SimClock, chip_select: u8) -> Self {
        SpiMaster {
            ctrl,
            clock,
            chip_select,
        }
    }

    fn exchange(&mut self, data: &[u8]) -> Result<Vec<u8>, SpiMasterError> {
        self.ctrl
            .transfer(data, self.chip_select, self.clock.now())
            .ok_or(SpiMasterError::NoDevice(self.chip_select))
    }
}

impl embedded_hal::spi::ErrorType for SpiMaster<'_> {
    type Error = SpiMasterError;
}

impl embedded_hal::spi::SpiBus<u8> for SpiMaster<'_> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let received = self.exchange(&vec![0u8; words.len()])?;
        words.copy_from_slice(&received);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.exchange(words).map(|_| ())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        let len = read.len().max(write.len());
        let mut out = write.to_vec();
        out.resize(len, 0);
        let received = self.exchange(&out)?;
        let n = read.len().min(received.len());
        read[..n].copy_from_slice(&received[..n]);
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let received = self.exchange(words)?;
        words.copy_from_slice(&received);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
