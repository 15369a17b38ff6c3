//! I²C decoder: START/STOP detection, MSB-first bytes, ACK/NACK slots.
use super::{
    CH_SCL, CH_SDA, DEFAULT_THRESHOLD, DecodedFrame, FrameKind, FramePayload, TraceMap,
};

/// Stateless I²C decoder over `SCL`/`SDA` traces.
#[derive(Debug, Clone, Copy)]
pub struct I2cDecoder {
    pub threshold: f64,
}

impl Default for I2cDecoder {
    fn default() -> Self {
        I2cDecoder {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Index of the sample just after the next SCL rising edge at or after `from`.
fn next_rising(scl: &[u8], from: usize) -> Option<usize> {
    let mut k = from;
    while k + 1 < scl.len() {
        if scl[k] == 0 && scl[k + 1] == 1 {
            return Some(k + 1);
        }
        k += 1;
    }
    None
}

/// Read eight bits, MSB first, sampling SDA on each SCL rising edge. Returns the
/// byte and the index of the last bit's sample.
fn read_byte(scl: &[u8], sda: &[u8], from: usize) -> Option<(u8, usize)> {
    let mut byte = 0u8;
    let mut i = from;
    for _ in 0..8 {
        let j = next_rising(scl, i)?;
        byte = (byte << 1) | sda[j];
        i = j;
    }
    Some((byte, i))
}

/// Sample the ACK slot. ACK is SDA low.
fn read_ack(scl: &[u8], sda: &[u8], from: usize) -> Option<(bool, usize)> {
    let j = next_rising(scl, from)?;
    Some((sda[j] == 0, j))
}

enum GapEvent {
    /// STOP condition; index of the sample where SDA is high again.
    Stop(usize),
    /// Repeated START; index of the sample preceding the SDA fall.
    Repeat(usize),
    /// A data bit's clock; index of the low sample before the rising edge.
    Byte(usize),
    End,
}

/// Classify the next bus event after an ACK slot.
///
/// A STOP and a data bit both begin with an SCL rising edge while SDA is low,
/// so a candidate bit edge is confirmed by looking through its clock-high phase
/// for an SDA transition: none means a genuine data bit.
fn scan_gap(scl: &[u8], sda: &[u8], from: usize) -> GapEvent {
    let n = scl.len();
    let mut k = from;
    while k + 1 < n {
        let scl_high = scl[k] == 1 && scl[k + 1] == 1;
        if scl_high && sda[k] == 0 && sda[k + 1] == 1 {
            return GapEvent::Stop(k + 1);
        }
        if scl_high && sda[k] == 1 && sda[k + 1] == 0 {
            return GapEvent::Repeat(k);
        }
        if scl[k] == 0 && scl[k + 1] == 1 {
            let mut m = k + 1;
            while m + 1 < n && scl[m + 1] == 1 {
                if sda[m] == 0 && sda[m + 1] == 1 {
                    return GapEvent::Stop(m + 1);
                }
                if sda[m] == 1 && sda[m + 1] == 0 {
                    return GapEvent::Repeat(m);
                }
                m += 1;
            }
            return GapEvent::Byte(k);
        }
        k += 1;
    }
    GapEvent::End
}

fn push_ack(frames: &mut Vec<DecodedFrame>, ack: bool, t: f64) {
    let (kind, description) = if ack {
        (FrameKind::Ack, "ACK")
    } else {
        (FrameKind::Nack, "NACK")
    };
    frames.push(DecodedFrame::new(
        t,
        t,
        kind,
        FramePayload::Ack(ack),
        description,
    ));
}

impl I2cDecoder {
    /// Decode all transactions in the capture.
    ///
    /// A byte that never receives its ninth clock produces no ACK frame and
    /// terminates the transaction; a missing STOP at the end of the buffer is
    /// not an error.
    pub fn decode(&self, signals: &TraceMap) -> Vec<DecodedFrame> {
        let mut frames = Vec::new();
        let (Some(scl_trace), Some(sda_trace)) = (signals.get(CH_SCL), signals.get(CH_SDA)) else {
            return frames;
        };
        let n = scl_trace.len().min(sda_trace.len());
        if n < 2 {
            return frames;
        }
        let times = &scl_trace.times[..n];
        let scl = scl_trace.digitize(self.threshold, n);
        let sda = sda_trace.digitize(self.threshold, n);

        let mut i = 0;
        while i + 1 < n {
            // START: SDA falls while SCL is high.
            if scl[i] == 1 && scl[i + 1] == 1 && sda[i] == 1 && sda[i + 1] == 0 {
                i = self.decode_transaction(times, &scl, &sda, i, &mut frames);
            } else {
                i += 1;
            }
        }
        frames
    }

    /// Decode one transaction beginning at the START condition at `start`.
    /// Returns the index to resume scanning from.
    fn decode_transaction(
        &self,
        times: &[f64],
        scl: &[u8],
        sda: &[u8],
        start: usize,
        frames: &mut Vec<DecodedFrame>,
    ) -> usize {
        let n = times.len();
        frames.push(DecodedFrame::new(
            times[start],
            times[start + 1],
            FrameKind::Start,
            FramePayload::None,
            "START condition",
        ));

        // Address byte: 7 address bits plus the R/W flag.
        let Some((addr_byte, after_addr)) = read_byte(scl, sda, start + 1) else {
            return n;
        };
        let address = addr_byte >> 1;
        let read = addr_byte & 0x01 != 0;
        frames.push(DecodedFrame::new(
            times[start],
            times[after_addr],
            FrameKind::Address,
            FramePayload::Address { address, read },
            format!("Address: 0x{address:02X} {}", if read { "R" } else { "W" }),
        ));
        let Some((ack, after_ack)) = read_ack(scl, sda, after_addr) else {
            return n;
        };
        push_ack(frames, ack, times[after_ack]);

        let mut i = after_ack;
        loop {
            // Between bytes: the next event is a STOP, a repeated START, or the
            // first clock of another data byte.
            let byte_start = match scan_gap(scl, sda, i) {
                GapEvent::Stop(k) => {
                    frames.push(DecodedFrame::new(
                        times[k - 1],
                        times[k],
                        FrameKind::Stop,
                        FramePayload::None,
                        "STOP condition",
                    ));
                    return k;
                }
                // Repeated START; hand control back to the outer scan.
                GapEvent::Repeat(k) => return k,
                GapEvent::Byte(k) => k,
                // Buffer exhausted without a STOP; not an error.
                GapEvent::End => return n,
            };

            let Some((byte, after_byte)) = read_byte(scl, sda, byte_start) else {
                return n;
            };
            frames.push(DecodedFrame::new(
                times[byte_start],
                times[after_byte],
                FrameKind::Data,
                FramePayload::Byte(byte),
                format!("Data: 0x{byte:02X}"),
            ));
            let Some((ack, after_ack)) = read_ack(scl, sda, after_byte) else {
                return n;
            };
            push_ack(frames, ack, times[after_ack]);
            i = after_ack;
        }
    }
}
