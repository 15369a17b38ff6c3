//! Capture export: CSV (RFC 4180) and VCD, plus a VCD importer used to verify
//! export reversibility.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Vcd,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed VCD: {0}")]
    Malformed(String),
}

/// VCD symbol for a channel id: `A` for 0 through `P` for 15.
fn symbol(id: usize) -> char {
    (b'A' + id as u8) as char
}

/// Nanosecond timestamp of a sample index on the capture grid.
fn sample_ns(index: u64, sample_rate: u32) -> u64 {
    index * 1_000_000_000 / sample_rate as u64
}

/// Write the capture as RFC 4180 CSV: header `Time,<ch>..`, time in seconds
/// with nine fractional digits, channel levels as `0`/`1`.
pub fn write_csv(
    path: &Path,
    times: &[f64],
    channels: &[(usize, &str, &[bool])],
) -> Result<(), ExportError> {
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "Time")?;
    for (_, name, _) in channels {
        write!(w, ",{name}")?;
    }
    w.write_all(b"\r\n")?;
    for (i, t) in times.iter().enumerate() {
        write!(w, "{t:.9}")?;
        for (_, _, buffer) in channels {
            let bit = buffer.get(i).copied().unwrap_or(false);
            write!(w, ",{}", u8::from(bit))?;
        }
        w.write_all(b"\r\n")?;
    }
    w.flush()?;
    Ok(())
}

/// Write the capture as a Value Change Dump.
///
/// One `$timescale 1ns` header, a `top` scope with one wire per channel
/// (symbols from `A`), initial values under `$dumpvars`, then a `#<ns>` record
/// at every sample instant where at least one channel changed. LF endings.
pub fn write_vcd(
    path: &Path,
    sample_rate: u32,
    memory_depth: usize,
    channels: &[(usize, &str, &[bool])],
) -> Result<(), ExportError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "$version pisim logic analyzer $end")?;
    writeln!(w, "$timescale 1ns $end")?;
    writeln!(w, "$scope module top $end")?;
    for (id, name, _) in channels {
        writeln!(w, "$var wire 1 {} {name} $end", symbol(*id))?;
    }
    writeln!(w, "$upscope $end")?;
    writeln!(w, "$enddefinitions $end")?;

    writeln!(w, "$dumpvars")?;
    for (id, _, buffer) in channels {
        let initial = buffer.first().copied().unwrap_or(false);
        writeln!(w, "{}{}", u8::from(initial), symbol(*id))?;
    }
    writeln!(w, "$end")?;

    for i in 1..memory_depth {
        let changed: Vec<&(usize, &str, &[bool])> = channels
            .iter()
            .filter(|(_, _, buffer)| {
                i < buffer.len() && buffer[i] != buffer[i - 1]
            })
            .collect();
        if changed.is_empty() {
            continue;
        }
        writeln!(w, "#{}", sample_ns(i as u64, sample_rate))?;
        for (id, _, buffer) in changed {
            writeln!(w, "{}{}", u8::from(buffer[i]), symbol(*id))?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Parsed VCD contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VcdDump {
    /// Symbol to wire name.
    pub names: BTreeMap<char, String>,
    /// Initial value per symbol.
    pub initial: BTreeMap<char, bool>,
    /// `(timestamp ns, symbol, new value)` in file order.
    pub changes: Vec<(u64, char, bool)>,
}

impl VcdDump {
    /// Re-sample the dump onto a capture grid of `memory_depth` points at
    /// `sample_rate`. Returns per-wire sample vectors keyed by name.
    pub fn resample(&self, sample_rate: u32, memory_depth: usize) -> BTreeMap<String, Vec<bool>> {
        let mut out: BTreeMap<String, Vec<bool>> = BTreeMap::new();
        for (&sym, name) in &self.names {
            let mut level = self.initial.get(&sym).copied().unwrap_or(false);
            let mut samples = Vec::with_capacity(memory_depth);
            let mut next_change = 0usize;
            for i in 0..memory_depth {
                let t = sample_ns(i as u64, sample_rate);
                while next_change < self.changes.len() && self.changes[next_change].0 <= t {
                    let (_, change_sym, value) = self.changes[next_change];
                    if change_sym == sym {
                        level = value;
                    }
                    next_change += 1;
                }
                samples.push(level);
            }
            out.insert(name.clone(), samples);
        }
        out
    }
}

/// Parse a VCD file previously written by [write_vcd] (single scope, 1-bit
/// wires, scalar value changes).
pub fn read_vcd(path: &Path) -> Result<VcdDump, ExportError> {
    let reader = BufReader::new(File::open(path)?);
    let mut dump = VcdDump::default();
    let mut in_dumpvars = false;
    let mut current_time = 0u64;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("$var ") {
            // "$var wire 1 A GPIO18 $end"
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 5 || fields[0] != "wire" {
                return Err(ExportError::Malformed(format!("bad $var line: {line}")));
            }
            let sym = fields[2]
                .chars()
                .next()
                .ok_or_else(|| ExportError::Malformed("empty symbol".into()))?;
            dump.names.insert(sym, fields[3].to_owned());
            continue;
        }
        if line == "$dumpvars" {
            in_dumpvars = true;
            continue;
        }
        if line == "$end" {
            in_dumpvars = false;
            continue;
        }
        if line.starts_with('$') {
            continue;
        }
        if let Some(stamp) = line.strip_prefix('#') {
            current_time = stamp
                .parse()
                .map_err(|_| ExportError::Malformed(format!("bad timestamp: {line}")))?;
            continue;
        }
        // Scalar value change: "<0|1><symbol>".
        let mut chars = line.chars();
        let (Some(value), Some(sym)) = (chars.next(), chars.next()) else {
            return Err(ExportError::Malformed(format!("bad value change: {line}")));
        };
        let value = match value {
            '0' => false,
            '1' => true,
            _ => return Err(ExportError::Malformed(format!("bad value change: {line}"))),
        };
        if in_dumpvars {
            dump.initial.insert(sym, value);
        } else {
            dump.changes.push((current_time, sym, value));
        }
    }
    Ok(dump)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("pisim-export-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn csv_rows_carry_nine_digit_times() {
        let path = temp_path("a.csv");
        let times = vec![0.0, 1e-6, 2e-6];
        let ch0 = [false, true, true];
        let ch1 = [true, false, true];
        write_csv(
            &path,
            &times,
            &[(0, "SCL", ch0.as_slice()), (1, "SDA", ch1.as_slice())],
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "Time,SCL,SDA");
        assert_eq!(lines[1], "0.000000000,0,1");
        assert_eq!(lines[2], "0.000001000,1,0");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn vcd_emits_records_only_on_change() {
        let path = temp_path("a.vcd");
        let ch0 = [false, false, true, true, false];
        write_vcd(&path, 1_000_000, 5, &[(0, "GPIO18", ch0.as_slice())]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("$timescale 1ns $end\n"));
        assert!(text.contains("$var wire 1 A GPIO18 $end\n"));
        // Changes at samples 2 and 4: 2000 ns and 4000 ns.
        assert!(text.contains("#2000\n1A\n"));
        assert!(text.contains("#4000\n0A\n"));
        assert!(!text.contains("#1000"));
        assert!(!text.contains("#3000"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn vcd_round_trip_reproduces_buffers() {
        let path = temp_path("rt.vcd");
        let rate = 1_000_000;
        let depth = 64;
        let ch0: Vec<bool> = (0..depth).map(|i| i % 7 < 3).collect();
        let ch1: Vec<bool> = (0..depth).map(|i| i % 5 == 0).collect();
        write_vcd(
            &path,
            rate,
            depth,
            &[(0, "SCL", ch0.as_slice()), (1, "SDA", ch1.as_slice())],
        )
        .unwrap();
        let dump = read_vcd(&path).unwrap();
        let resampled = dump.resample(rate, depth);
        assert_eq!(resampled["SCL"], ch0);
        assert_eq!(resampled["SDA"], ch1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn malformed_vcd_is_rejected() {
        let path = temp_path("bad.vcd");
        std::fs::write(&path, "$var wire 1 A x $end\n#notanumber\n").unwrap();
        let err = read_vcd(&path).unwrap_err();
        assert!(matches!(err, ExportError::Malformed(_)));
        std::fs::remove_file(&path).ok();
    }
}
