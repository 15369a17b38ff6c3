//! UART controller: framed byte transmission with configurable line parameters
//! and deterministic bit-error injection.
//!
//! TX and RX are bounded FIFOs. `write` models the transmit side and publishes
//! per-byte events carrying the frame duration; `inject_data` is the external
//! driver's inverse, feeding the receive side (optionally through the bit-error
//! model) and firing the receive callback synchronously.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::SimClock;
use crate::event::{Event, EventBus, EventKind, Payload};
use crate::time::{Hertz, RateExtU32, SimInstant};

/// Depth of the TX and RX FIFOs.
pub const FIFO_DEPTH: usize = 1024;

//==================================================================================================
// Configuration
//==================================================================================================

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub const fn count(&self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum WordSize {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl WordSize {
    pub const fn bits(&self) -> u8 {
        match self {
            WordSize::Five => 5,
            WordSize::Six => 6,
            WordSize::Seven => 7,
            WordSize::Eight => 8,
        }
    }
}

/// Line configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    pub baudrate: Hertz,
    pub word_size: WordSize,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Config {
    pub fn baudrate(mut self, baudrate: Hertz) -> Self {
        self.baudrate = baudrate;
        self
    }

    pub fn parity_none(mut self) -> Self {
        self.parity = Parity::None;
        self
    }

    pub fn parity_even(mut self) -> Self {
        self.parity = Parity::Even;
        self
    }

    pub fn parity_odd(mut self) -> Self {
        self.parity = Parity::Odd;
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn word_size(mut self, word_size: WordSize) -> Self {
        self.word_size = word_size;
        self
    }

    /// Bits per frame including start, parity and stop bits.
    pub fn frame_bits(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        1 + self.word_size.bits() as u32 + parity + self.stop_bits.count() as u32
    }

    /// Frame duration in seconds at the configured baud rate.
    pub fn frame_duration(&self) -> f64 {
        self.frame_bits() as f64 / self.baudrate.raw() as f64
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            baudrate: 9_600_u32.Hz(),
            word_size: WordSize::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl From<Hertz> for Config {
    fn from(baud: Hertz) -> Self {
        Config::default().baudrate(baud)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("port is closed")]
pub struct PortClosedError;

impl PortClosedError {
    pub fn code(&self) -> &'static str {
        "bus_closed"
    }
}

//==================================================================================================
// Controller
//==================================================================================================

type RxCallback = Box<dyn FnMut(u8)>;

/// Simulated UART port.
pub struct UartController {
    port_id: u8,
    bus: EventBus,
    config: Config,
    tx: heapless::Deque<u8, FIFO_DEPTH>,
    rx: heapless::Deque<u8, FIFO_DEPTH>,
    open: bool,
    error_rate: f64,
    rng: StdRng,
    rx_callback: Option<RxCallback>,
}

impl UartController {
    pub fn new(port_id: u8, bus: EventBus, config: Config) -> Self {
        UartController {
            port_id,
            bus,
            config,
            tx: heapless::Deque::new(),
            rx: heapless::Deque::new(),
            open: false,
            error_rate: 0.0,
            rng: StdRng::seed_from_u64(0x5EED_0000 ^ port_id as u64),
            rx_callback: None,
        }
    }

    /// Open the port, clearing both FIFOs. Idempotent.
    pub fn open(&mut self) {
        if !self.open {
            self.open = true;
            self.tx.clear();
            self.rx.clear();
        }
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn configure(&mut self, config: Config) {
        self.config = config;
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queue bytes for transmission.
    ///
    /// Returns how many bytes fit into the TX FIFO. Each queued byte publishes a
    /// `uart_data` event with the frame duration.
    pub fn write(&mut self, data: &[u8], now: SimInstant) -> Result<usize, PortClosedError> {
        if !self.open {
            return Err(PortClosedError);
        }
        let duration = self.config.frame_duration();
        let mut queued = 0;
        for &byte in data {
            if self.tx.push_back(byte).is_err() {
                log::warn!("UART{}: TX FIFO full, {} bytes dropped", self.port_id, data.len() - queued);
                break;
            }
            queued += 1;
            self.bus.publish(Event::new(
                EventKind::UartData,
                now,
                format!("UART{}", self.port_id),
                Payload::new()
                    .with("direction", "tx")
                    .with("data", byte)
                    .with("baud_rate", self.config.baudrate.raw())
                    .with("duration", duration),
            ));
        }
        Ok(queued)
    }

    /// Drain up to `max` received bytes. An unopened port reads empty.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        if !self.open {
            return Vec::new();
        }
        let mut data = Vec::with_capacity(max.min(self.rx.len()));
        for _ in 0..max {
            match self.rx.pop_front() {
                Some(byte) => data.push(byte),
                None => break,
            }
        }
        data
    }

    /// Bytes waiting in the RX FIFO.
    #[inline]
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Feed received bytes in from the external side.
    ///
    /// With a non-zero error rate, each byte independently has one random bit
    /// flipped with that probability. Returns the number of bytes queued; bytes
    /// hitting a full FIFO are dropped.
    pub fn inject_data(&mut self, data: &[u8], now: SimInstant) -> usize {
        if !self.open {
            return 0;
        }
        let mut queued = 0;
        for &byte in data {
            let mut byte = byte;
            if self.error_rate > 0.0 && self.rng.random::<f64>() < self.error_rate {
                let bit = self.rng.random_range(0..8u8);
                byte ^= 1 << bit;
                log::trace!("UART{}: flipped bit {bit} of injected byte", self.port_id);
            }
            if self.rx.push_back(byte).is_err() {
                log::warn!("UART{}: RX FIFO full, dropping byte (buffer_full)", self.port_id);
                continue;
            }
            queued += 1;
            self.bus.publish(Event::new(
                EventKind::UartData,
                now,
                format!("UART{}", self.port_id),
                Payload::new()
                    .with("direction", "rx")
                    .with("data", byte)
                    .with("baud_rate", self.config.baudrate.raw()),
            ));
            if let Some(callback) = self.rx_callback.as_mut() {
                callback(byte);
            }
        }
        queued
    }

    /// Probability of a single-bit error per injected byte, clamped to [0, 1].
    pub fn set_error_rate(&mut self, rate: f64) {
        self.error_rate = rate.clamp(0.0, 1.0);
    }

    /// Reseed the error-injection RNG for reproducible fault runs.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Register the synchronous receive callback.
    pub fn on_data_received(&mut self, callback: impl FnMut(u8) + 'static) {
        self.rx_callback = Some(Box::new(callback));
    }

    /// Drain up to `max` bytes from the transmit side, as the wire would.
    pub fn drain_tx(&mut self, max: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(max.min(self.tx.len()));
        for _ in 0..max {
            match self.tx.pop_front() {
                Some(byte) => data.push(byte),
                None => break,
            }
        }
        data
    }

    pub fn flush_tx(&mut self) {
        self.tx.clear();
    }

    pub fn flush_rx(&mut self) {
        self.rx.clear();
    }
}

//==================================================================================================
// Serial handles
//==================================================================================================

impl embedded_io::Error for PortClosedError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::NotConnected
    }
}

impl embedded_hal_nb::serial::Error for PortClosedError {
    fn kind(&self) -> embedded_hal_nb::serial::ErrorKind {
        embedded_hal_nb::serial::ErrorKind::Other
    }
}

/// Byte-stream view of the port, timestamping writes at the simulation clock.
pub struct Serial<'a> {
    uart: &'a mut UartController,
    clock: &'a SimClock,
}

impl<'a> Serial<'a> {
    pub fn new(uart: &'a mut UartController, clock: &'a SimClock) -> Self {
        Serial { uart, clock }
    }
}

impl embedded_io::ErrorType for Serial<'_> {
    type Error = PortClosedError;
}

impl embedded_io::Write for Serial<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.uart.write(buf, self.clock.now())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_hal_nb::serial::ErrorType for Serial<'_> {
    type Error = PortClosedError;
}

impl embedded_hal_nb::serial::Read<u8> for Serial<'_> {
    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if !self.uart.is_open() {
            return Err(nb::Error::Other(PortClosedError));
        }
        self.uart
            .rx
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}
