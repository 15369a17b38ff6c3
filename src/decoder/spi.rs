//! SPI decoder: mode-dependent sampling edges, optional chip-select gating.
use super::{
    CH_CS, CH_MISO, CH_MOSI, CH_SCLK, DEFAULT_THRESHOLD, DecodedFrame, ERR_TRUNCATED, FrameKind,
    FramePayload, TraceMap,
};

/// Stateless SPI decoder over `SCLK`/`MOSI` traces, with optional `MISO` and
/// `CS` (active low).
#[derive(Debug, Clone, Copy)]
pub struct SpiDecoder {
    pub threshold: f64,
    /// SPI mode 0-3. Modes 0 and 2 sample on the SCLK rising edge, 1 and 3 on
    /// the falling edge.
    pub mode: u8,
}

impl Default for SpiDecoder {
    fn default() -> Self {
        SpiDecoder {
            threshold: DEFAULT_THRESHOLD,
            mode: 0,
        }
    }
}

enum EdgeScan {
    /// Index of the sample just after the sampling edge.
    Found(usize),
    /// Chip select went inactive at this index.
    CsDropped(usize),
    End,
}

impl SpiDecoder {
    fn sample_on_rising(&self) -> bool {
        matches!(self.mode & 0x3, 0 | 2)
    }

    fn next_sample_edge(&self, sclk: &[u8], cs: &[u8], from: usize) -> EdgeScan {
        let (before, after) = if self.sample_on_rising() {
            (0, 1)
        } else {
            (1, 0)
        };
        let mut k = from;
        while k + 1 < sclk.len() {
            if cs[k + 1] != 0 {
                return EdgeScan::CsDropped(k + 1);
            }
            if sclk[k] == before && sclk[k + 1] == after {
                return EdgeScan::Found(k + 1);
            }
            k += 1;
        }
        EdgeScan::End
    }

    /// Decode every 8-bit transfer in the capture, MSB first.
    ///
    /// With a `CS` trace present, decoding is gated to CS-low intervals; a CS
    /// deassert in the middle of a byte yields a `truncated_frame` error frame.
    /// Truncation at the end of the buffer terminates silently.
    pub fn decode(&self, signals: &TraceMap) -> Vec<DecodedFrame> {
        let mut frames = Vec::new();
        let (Some(sclk_trace), Some(mosi_trace)) = (signals.get(CH_SCLK), signals.get(CH_MOSI))
        else {
            return frames;
        };
        let mut n = sclk_trace.len().min(mosi_trace.len());
        if let Some(miso) = signals.get(CH_MISO) {
            n = n.min(miso.len());
        }
        if let Some(cs) = signals.get(CH_CS) {
            n = n.min(cs.len());
        }
        if n < 2 {
            return frames;
        }

        let times = &sclk_trace.times[..n];
        let sclk = sclk_trace.digitize(self.threshold, n);
        let mosi = mosi_trace.digitize(self.threshold, n);
        let miso = signals
            .get(CH_MISO)
            .map(|t| t.digitize(self.threshold, n))
            .unwrap_or_else(|| vec![0; n]);
        let cs = signals
            .get(CH_CS)
            .map(|t| t.digitize(self.threshold, n))
            .unwrap_or_else(|| vec![0; n]);

        let mut i = 0;
        'transfers: while i + 1 < n {
            if cs[i] != 0 {
                i += 1;
                continue;
            }
            let mut mosi_byte = 0u8;
            let mut miso_byte = 0u8;
            let mut first_sample = None;
            let mut last_sample = 0;
            for bit in 0..8 {
                match self.next_sample_edge(&sclk, &cs, if bit == 0 { i } else { last_sample }) {
                    EdgeScan::Found(j) => {
                        mosi_byte = (mosi_byte << 1) | mosi[j];
                        miso_byte = (miso_byte << 1) | miso[j];
                        first_sample.get_or_insert(j);
                        last_sample = j;
                    }
                    EdgeScan::CsDropped(j) => {
                        if bit > 0 {
                            let start = first_sample.unwrap_or(i);
                            frames.push(
                                DecodedFrame::new(
                                    times[start],
                                    times[j],
                                    FrameKind::Error,
                                    FramePayload::None,
                                    format!("chip select dropped after {bit} bits"),
                                )
                                .with_error(ERR_TRUNCATED),
                            );
                        }
                        i = j;
                        continue 'transfers;
                    }
                    EdgeScan::End => break 'transfers,
                }
            }
            let start = first_sample.unwrap_or(i);
            frames.push(DecodedFrame::new(
                times[start],
                times[last_sample],
                FrameKind::Data,
                FramePayload::Duplex {
                    mosi: mosi_byte,
                    miso: miso_byte,
                },
                format!("MOSI: 0x{mosi_byte:02X}, MISO: 0x{miso_byte:02X}"),
            ));
            i = last_sample;
        }
        frames
    }
}
