//! UART decoder: start-bit scan, LSB-first assembly, parity checking.
use super::{
    CH_RX, CH_TX, DEFAULT_THRESHOLD, DecodedFrame, ERR_DECODE, ERR_PARITY, FrameKind,
    FramePayload, Trace, TraceMap,
};
use crate::uart::{Parity, StopBits, WordSize};

/// Stateless UART decoder over `TX` and/or `RX` traces.
#[derive(Debug, Clone, Copy)]
pub struct UartDecoder {
    pub baud: u32,
    pub word_size: WordSize,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub threshold: f64,
}

impl Default for UartDecoder {
    fn default() -> Self {
        UartDecoder {
            baud: 9_600,
            word_size: WordSize::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl UartDecoder {
    /// Decode every frame on the TX and RX lines, ordered by start time.
    pub fn decode(&self, signals: &TraceMap) -> Vec<DecodedFrame> {
        let mut frames = Vec::new();
        for line in [CH_TX, CH_RX] {
            if let Some(trace) = signals.get(line) {
                self.decode_line(trace, line, &mut frames);
            }
        }
        frames.sort_by(|a, b| a.start.total_cmp(&b.start));
        frames
    }

    fn decode_line(&self, trace: &Trace, line: &'static str, frames: &mut Vec<DecodedFrame>) {
        let n = trace.len();
        if n < 2 {
            return;
        }
        let times = &trace.times[..n];
        let data = trace.digitize(self.threshold, n);

        let dt = times[1] - times[0];
        if dt <= 0.0 {
            frames.push(
                DecodedFrame::new(
                    times[0],
                    times[0],
                    FrameKind::Error,
                    FramePayload::None,
                    format!("{line}: time axis is not increasing"),
                )
                .with_error(ERR_DECODE),
            );
            return;
        }
        let sample_rate = 1.0 / dt;
        let samples_per_bit = (sample_rate / self.baud as f64).round() as usize;
        if samples_per_bit == 0 {
            frames.push(
                DecodedFrame::new(
                    times[0],
                    times[0],
                    FrameKind::Error,
                    FramePayload::None,
                    format!("{line}: sample rate below the baud rate"),
                )
                .with_error(ERR_DECODE),
            );
            return;
        }

        let data_bits = self.word_size.bits() as usize;
        let mut i = 0;
        while i + 1 < n {
            // Idle-high to low: start bit candidate.
            if !(data[i] == 1 && data[i + 1] == 0) {
                i += 1;
                continue;
            }
            let start = i + 1;
            let start_center = start + samples_per_bit / 2;
            if start_center >= n {
                return;
            }
            if data[start_center] != 0 {
                // Narrow spike, not a start bit.
                i += 1;
                continue;
            }

            let mut value = 0u8;
            let mut truncated = false;
            for bit in 0..data_bits {
                let center = start + samples_per_bit * (1 + bit) + samples_per_bit / 2;
                if center >= n {
                    truncated = true;
                    break;
                }
                value |= data[center] << bit;
            }
            if truncated {
                // End of capture inside a frame terminates decoding silently.
                return;
            }

            let mut error = None;
            let mut end = start + samples_per_bit * (1 + data_bits);
            if self.parity != Parity::None {
                let center = end + samples_per_bit / 2;
                if center >= n {
                    return;
                }
                let expected = match self.parity {
                    Parity::Even => value.count_ones() % 2,
                    Parity::Odd => (value.count_ones() + 1) % 2,
                    Parity::None => unreachable!(),
                };
                if data[center] as u32 != expected {
                    error = Some(ERR_PARITY);
                }
                end += samples_per_bit;
            }
            end += samples_per_bit * self.stop_bits.count() as usize;

            let mut description = format!("{line}: 0x{value:02X}");
            if (0x20..=0x7E).contains(&value) {
                description.push_str(&format!(" ('{}')", value as char));
            }
            let mut frame = DecodedFrame::new(
                times[i],
                times[end.min(n - 1)],
                FrameKind::Data,
                FramePayload::Uart { value, line },
                description,
            );
            if let Some(error) = error {
                frame = frame.with_error(error);
            }
            frames.push(frame);
            // Resume on the final stop-bit sample so an immediately following
            // start bit still presents a falling edge.
            i = end - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPB: usize = 8;

    /// Sampled UART line at `SPB` samples per bit.
    fn line_wave(bytes: &[(u8, Option<u8>)], decoder: &UartDecoder) -> Trace {
        let mut bits: Vec<u8> = vec![1; SPB * 2];
        for &(byte, parity_override) in bytes {
            bits.extend(std::iter::repeat_n(0, SPB)); // start bit
            for bit in 0..decoder.word_size.bits() {
                let level = (byte >> bit) & 1;
                bits.extend(std::iter::repeat_n(level, SPB));
            }
            if decoder.parity != Parity::None {
                let computed = match decoder.parity {
                    Parity::Even => byte.count_ones() % 2,
                    Parity::Odd => (byte.count_ones() + 1) % 2,
                    Parity::None => 0,
                } as u8;
                let level = parity_override.unwrap_or(computed);
                bits.extend(std::iter::repeat_n(level, SPB));
            }
            for _ in 0..decoder.stop_bits.count() {
                bits.extend(std::iter::repeat_n(1, SPB));
            }
        }
        bits.extend(std::iter::repeat_n(1, SPB));

        // Sample period chosen so sample_rate / baud == SPB.
        let dt = 1.0 / (decoder.baud as f64 * SPB as f64);
        let times: Vec<f64> = (0..bits.len()).map(|i| i as f64 * dt).collect();
        Trace::new(times, bits.iter().map(|&b| b as f64).collect())
    }

    fn tx_map(trace: Trace) -> TraceMap {
        let mut map = TraceMap::new();
        map.insert(CH_TX.to_owned(), trace);
        map
    }

    #[test]
    fn decodes_ascii_bytes_lsb_first() {
        let decoder = UartDecoder::default();
        let trace = line_wave(&[(b'H', None), (b'i', None)], &decoder);
        let frames = decoder.decode(&tx_map(trace));
        let bytes: Vec<u8> = frames.iter().filter_map(|f| f.byte()).collect();
        assert_eq!(bytes, b"Hi".to_vec());
        assert!(frames[0].description.contains("('H')"));
        assert!(frames.iter().all(|f| f.error.is_none()));
    }

    #[test]
    fn even_parity_checks_out() {
        let decoder = UartDecoder {
            parity: Parity::Even,
            ..UartDecoder::default()
        };
        let trace = line_wave(&[(0b0110_1001, None)], &decoder);
        let frames = decoder.decode(&tx_map(trace));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].error.is_none());
    }

    #[test]
    fn bad_parity_is_flagged_but_decoding_continues() {
        let decoder = UartDecoder {
            parity: Parity::Odd,
            ..UartDecoder::default()
        };
        // First byte carries a wrong parity bit, second is clean.
        let wrong = match decoder.parity {
            Parity::Odd => ((b'x'.count_ones() + 1) % 2) as u8 ^ 1,
            _ => 0,
        };
        let trace = line_wave(&[(b'x', Some(wrong)), (b'y', None)], &decoder);
        let frames = decoder.decode(&tx_map(trace));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].error, Some(ERR_PARITY));
        assert!(frames[1].error.is_none());
    }

    #[test]
    fn truncated_final_frame_is_silent() {
        let decoder = UartDecoder::default();
        let mut trace = line_wave(&[(0x00, None)], &decoder);
        // Keep the start bit and three data bits only.
        let keep = SPB * 2 + SPB * 4;
        trace.times.truncate(keep);
        trace.values.truncate(keep);
        let frames = decoder.decode(&tx_map(trace));
        assert!(frames.is_empty());
    }

    #[test]
    fn both_lines_merge_in_time_order() {
        let decoder = UartDecoder::default();
        let tx = line_wave(&[(b'a', None)], &decoder);
        // RX idles twice as long before its byte, so it decodes later.
        let mut rx_bits = line_wave(&[(b'b', None)], &decoder);
        let dt = rx_bits.times[1] - rx_bits.times[0];
        let shift = SPB as f64 * 20.0 * dt;
        for t in &mut rx_bits.times {
            *t += shift;
        }
        let mut map = TraceMap::new();
        map.insert(CH_TX.to_owned(), tx);
        map.insert(CH_RX.to_owned(), rx_bits);
        let frames = decoder.decode(&map);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0].payload,
            FramePayload::Uart {
                value: b'a',
                line: CH_TX
            }
        );
        assert_eq!(
            frames[1].payload,
            FramePayload::Uart {
                value: b'b',
                line: CH_RX
            }
        );
    }

    #[test]
    fn sub_baud_sample_rate_reports_decode_error() {
        let decoder = UartDecoder::default();
        // 1 kHz sampling of a 9600 baud line.
        let times: Vec<f64> = (0..16).map(|i| i as f64 * 1e-3).collect();
        let values = vec![1.0; 16];
        let frames = decoder.decode(&tx_map(Trace::new(times, values)));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].error, Some(ERR_DECODE));
    }

    #[test]
    fn narrow_spike_is_not_a_start_bit() {
        let decoder = UartDecoder::default();
        let mut bits = vec![1u8; SPB * 4];
        bits[SPB] = 0; // one-sample glitch
        let dt = 1.0 / (decoder.baud as f64 * SPB as f64);
        let times: Vec<f64> = (0..bits.len()).map(|i| i as f64 * dt).collect();
        let trace = Trace::new(times, bits.iter().map(|&b| b as f64).collect());
        assert!(decoder.decode(&tx_map(trace)).is_empty());
    }
}
