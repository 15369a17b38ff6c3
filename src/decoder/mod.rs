//! Protocol decoders: reconstruct framed transactions from captured waveforms.
//!
//! Decoders are stateless. They consume a [TraceMap] of named `(times, values)`
//! arrays, digitize at a threshold, align channels by truncating to the shortest,
//! and return an ordered list of [DecodedFrame]s. Malformed frames carry a
//! non-empty `error`; truncation at the end of the buffer simply terminates
//! decoding.
use std::collections::BTreeMap;

pub mod i2c;
pub mod spi;
pub mod uart;

pub use i2c::I2cDecoder;
pub use spi::SpiDecoder;
pub use uart::UartDecoder;

/// Default digitizing threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Well-known channel names.
pub const CH_SCL: &str = "SCL";
pub const CH_SDA: &str = "SDA";
pub const CH_SCLK: &str = "SCLK";
pub const CH_MOSI: &str = "MOSI";
pub const CH_MISO: &str = "MISO";
pub const CH_CS: &str = "CS";
pub const CH_TX: &str = "TX";
pub const CH_RX: &str = "RX";

/// Stable error codes attached to malformed frames.
pub const ERR_PARITY: &str = "parity_error";
pub const ERR_TRUNCATED: &str = "truncated_frame";
pub const ERR_DECODE: &str = "decode_error";

/// One captured channel: aligned timestamp and value arrays, seconds/volts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl Trace {
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> Self {
        Trace { times, values }
    }

    /// Usable sample count; the shorter of the two arrays.
    pub fn len(&self) -> usize {
        self.times.len().min(self.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Binary view of the first `len` samples.
    pub fn digitize(&self, threshold: f64, len: usize) -> Vec<u8> {
        self.values[..len.min(self.values.len())]
            .iter()
            .map(|&v| u8::from(v > threshold))
            .collect()
    }
}

/// Named channel traces handed to a decoder.
pub type TraceMap = BTreeMap<String, Trace>;

/// Decoded frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Start,
    Stop,
    Address,
    Data,
    Ack,
    Nack,
    Error,
}

impl FrameKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Start => "start",
            FrameKind::Stop => "stop",
            FrameKind::Address => "address",
            FrameKind::Data => "data",
            FrameKind::Ack => "ack",
            FrameKind::Nack => "nack",
            FrameKind::Error => "error",
        }
    }
}

/// Typed frame contents.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    None,
    Ack(bool),
    Address { address: u8, read: bool },
    Byte(u8),
    Duplex { mosi: u8, miso: u8 },
    Uart { value: u8, line: &'static str },
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Frame start, seconds.
    pub start: f64,
    /// Frame end, seconds.
    pub end: f64,
    pub kind: FrameKind,
    pub payload: FramePayload,
    pub description: String,
    pub error: Option<&'static str>,
}

impl DecodedFrame {
    pub fn new(
        start: f64,
        end: f64,
        kind: FrameKind,
        payload: FramePayload,
        description: impl Into<String>,
    ) -> Self {
        DecodedFrame {
            start,
            end,
            kind,
            payload,
            description: description.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: &'static str) -> Self {
        self.error = Some(error);
        self
    }

    /// Data byte carried by the frame, for any protocol.
    pub fn byte(&self) -> Option<u8> {
        match self.payload {
            FramePayload::Byte(b) => Some(b),
            FramePayload::Duplex { mosi, .. } => Some(mosi),
            FramePayload::Uart { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Frames within a time range, by start time.
pub fn frames_between(frames: &[DecodedFrame], start: f64, end: Option<f64>) -> Vec<DecodedFrame> {
    frames
        .iter()
        .filter(|f| f.start >= start && end.is_none_or(|e| f.start <= e))
        .cloned()
        .collect()
}
