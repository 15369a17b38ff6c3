//! Observable register mirror for the GPIO block.
//!
//! The mirror tracks what the real function-select, level, edge-detect and PWM
//! registers would hold, for debug introspection only; controller behavior never
//! reads back from it. Fields are fixed struct members; [RegisterFile::read_by_name]
//! resolves the debugger-facing names through a lazy name-to-offset index.
use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::pins::PinMode;
use crate::signal::EdgeFilter;

/// Function select encoding, one 3-bit field per pin.
#[bitbybit::bitenum(u3, exhaustive = true)]
#[derive(Debug, PartialEq, Eq)]
pub enum FunctionSelect {
    Input = 0b000,
    Output = 0b001,
    Alt5 = 0b010,
    Alt4 = 0b011,
    Alt0 = 0b100,
    Alt1 = 0b101,
    Alt2 = 0b110,
    Alt3 = 0b111,
}

impl From<PinMode> for FunctionSelect {
    fn from(mode: PinMode) -> Self {
        match mode {
            PinMode::Input => FunctionSelect::Input,
            PinMode::Output => FunctionSelect::Output,
            PinMode::Alt0 => FunctionSelect::Alt0,
            PinMode::Alt1 => FunctionSelect::Alt1,
            PinMode::Alt2 => FunctionSelect::Alt2,
            PinMode::Alt3 => FunctionSelect::Alt3,
            PinMode::Alt4 => FunctionSelect::Alt4,
            PinMode::Alt5 => FunctionSelect::Alt5,
        }
    }
}

/// Pull configuration encoding for the PUD control register.
#[bitbybit::bitenum(u2, exhaustive = false)]
#[derive(Debug, PartialEq, Eq)]
pub enum PullEncoding {
    Off = 0b00,
    Down = 0b01,
    Up = 0b10,
}

/// PWM control register, one enable bit per hardware channel.
#[bitbybit::bitfield(u32, default = 0x0, debug)]
pub struct PwmControl {
    #[bit(0, rw)]
    enable_ch0: bool,
    #[bit(8, rw)]
    enable_ch1: bool,
    #[bit(16, rw)]
    enable_ch2: bool,
    #[bit(24, rw)]
    enable_ch3: bool,
}

impl PwmControl {
    pub fn set_channel(&mut self, channel: usize, enabled: bool) {
        match channel {
            0 => self.set_enable_ch0(enabled),
            1 => self.set_enable_ch1(enabled),
            2 => self.set_enable_ch2(enabled),
            3 => self.set_enable_ch3(enabled),
            _ => {}
        }
    }

    pub fn channel(&self, channel: usize) -> bool {
        match channel {
            0 => self.enable_ch0(),
            1 => self.enable_ch1(),
            2 => self.enable_ch2(),
            3 => self.enable_ch3(),
            _ => false,
        }
    }
}

/// Debugger-facing register names and their word offsets in the flattened view.
pub const REGISTER_LAYOUT: &[(&str, usize)] = &[
    ("GPFSEL0", 0),
    ("GPFSEL1", 1),
    ("GPFSEL2", 2),
    ("GPFSEL3", 3),
    ("GPFSEL4", 4),
    ("GPFSEL5", 5),
    ("GPLEV0", 6),
    ("GPLEV1", 7),
    ("GPREN0", 8),
    ("GPREN1", 9),
    ("GPFEN0", 10),
    ("GPFEN1", 11),
    ("GPPUD", 12),
    ("PWM_CTL", 13),
    ("PWM_RNG0", 14),
    ("PWM_RNG1", 15),
    ("PWM_RNG2", 16),
    ("PWM_RNG3", 17),
    ("PWM_DAT0", 18),
    ("PWM_DAT1", 19),
    ("PWM_DAT2", 20),
    ("PWM_DAT3", 21),
];

static REGISTER_INDEX: Lazy<HashMap<&'static str, usize>> =
    Lazy::new(|| REGISTER_LAYOUT.iter().copied().collect());

/// Mirror of the GPIO/PWM register block.
#[derive(Debug, Default)]
pub struct RegisterFile {
    gpfsel: [u32; 6],
    gplev: [u32; 2],
    gpren: [u32; 2],
    gpfen: [u32; 2],
    gppud: u32,
    pwm_ctl: PwmControl,
    pwm_rng: [u32; 4],
    pwm_dat: [u32; 4],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the function select for a pin.
    pub fn set_function(&mut self, pin: u8, fsel: FunctionSelect) {
        let reg = (pin / 10) as usize;
        let shift = (pin % 10) as u32 * 3;
        if reg >= self.gpfsel.len() {
            return;
        }
        self.gpfsel[reg] &= !(0x7 << shift);
        self.gpfsel[reg] |= (fsel.raw_value().value() as u32) << shift;
    }

    /// Read back the function select for a pin.
    pub fn function(&self, pin: u8) -> FunctionSelect {
        let reg = (pin / 10) as usize;
        let shift = (pin % 10) as u32 * 3;
        let raw = (self.gpfsel.get(reg).copied().unwrap_or(0) >> shift) & 0x7;
        FunctionSelect::new_with_raw_value(arbitrary_int::u3::new(raw as u8))
    }

    /// Record a pin level in the GPLEV mirror.
    pub fn set_level(&mut self, pin: u8, high: bool) {
        let reg = (pin / 32) as usize;
        let mask = 1u32 << (pin % 32);
        if reg >= self.gplev.len() {
            return;
        }
        if high {
            self.gplev[reg] |= mask;
        } else {
            self.gplev[reg] &= !mask;
        }
    }

    pub fn level(&self, pin: u8) -> bool {
        let reg = (pin / 32) as usize;
        let mask = 1u32 << (pin % 32);
        self.gplev.get(reg).copied().unwrap_or(0) & mask != 0
    }

    /// Record the last pull command written to the PUD register.
    pub fn set_pull(&mut self, encoding: PullEncoding) {
        self.gppud = encoding.raw_value().value() as u32;
    }

    /// Mirror the rising/falling edge detect enables for a pin.
    pub fn set_edge_detect(&mut self, pin: u8, filter: EdgeFilter, enable: bool) {
        let reg = (pin / 32) as usize;
        let mask = 1u32 << (pin % 32);
        if reg >= self.gpren.len() {
            return;
        }
        let rising = matches!(filter, EdgeFilter::Rising | EdgeFilter::Both);
        let falling = matches!(filter, EdgeFilter::Falling | EdgeFilter::Both);
        if rising {
            if enable {
                self.gpren[reg] |= mask;
            } else {
                self.gpren[reg] &= !mask;
            }
        }
        if falling {
            if enable {
                self.gpfen[reg] |= mask;
            } else {
                self.gpfen[reg] &= !mask;
            }
        }
    }

    /// Clear both edge-detect enables for a pin.
    pub fn clear_edge_detect(&mut self, pin: u8) {
        self.set_edge_detect(pin, EdgeFilter::Both, false);
    }

    pub fn pwm_ctl(&self) -> PwmControl {
        self.pwm_ctl
    }

    pub fn set_pwm_channel(&mut self, channel: usize, enabled: bool) {
        self.pwm_ctl.set_channel(channel, enabled);
    }

    /// Record range/data for a hardware PWM channel.
    pub fn set_pwm_values(&mut self, channel: usize, range: u32, data: u32) {
        if channel < self.pwm_rng.len() {
            self.pwm_rng[channel] = range;
            self.pwm_dat[channel] = data;
        }
    }

    pub fn pwm_range(&self, channel: usize) -> u32 {
        self.pwm_rng.get(channel).copied().unwrap_or(0)
    }

    pub fn pwm_data(&self, channel: usize) -> u32 {
        self.pwm_dat.get(channel).copied().unwrap_or(0)
    }

    fn word(&self, offset: usize) -> Option<u32> {
        Some(match offset {
            0..=5 => self.gpfsel[offset],
            6..=7 => self.gplev[offset - 6],
            8..=9 => self.gpren[offset - 8],
            10..=11 => self.gpfen[offset - 10],
            12 => self.gppud,
            13 => self.pwm_ctl.raw_value(),
            14..=17 => self.pwm_rng[offset - 14],
            18..=21 => self.pwm_dat[offset - 18],
            _ => return None,
        })
    }

    /// Debug read of a register by its documented name.
    pub fn read_by_name(&self, name: &str) -> Option<u32> {
        REGISTER_INDEX.get(name).and_then(|&offset| self.word(offset))
    }
}
