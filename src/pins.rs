//! 40-pin header metadata: BCM/board numbering, pin kinds, alternate functions.
//!
//! The table is static board data. Power and ground rows are present so that
//! configuring a non-GPIO pin is a real, testable failure rather than a missing
//! key.
use crate::gpio::GpioError;

/// Pin modes selectable through the function-select machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    Alt0,
    Alt1,
    Alt2,
    Alt3,
    Alt4,
    Alt5,
}

impl PinMode {
    pub fn is_output(&self) -> bool {
        matches!(self, PinMode::Output)
    }

    pub fn is_input(&self) -> bool {
        matches!(self, PinMode::Input)
    }
}

/// Peripheral function a pin can be muxed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFunction {
    I2cSda,
    I2cScl,
    SpiMosi,
    SpiMiso,
    SpiSclk,
    SpiCe0,
    SpiCe1,
    UartTx,
    UartRx,
    Pwm0,
    Pwm1,
}

/// What a physical header position is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    Gpio,
    Power3v3,
    Power5v,
    Ground,
}

/// One header position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinDefinition {
    /// BCM GPIO number. Zero for power/ground rows.
    pub bcm: u8,
    /// Physical board pin number, 1-40.
    pub board: u8,
    pub name: &'static str,
    pub kind: PinKind,
    /// Alternate functions reachable from this pin.
    pub alts: &'static [(PinMode, PinFunction)],
}

impl PinDefinition {
    #[inline]
    pub fn is_gpio(&self) -> bool {
        self.kind == PinKind::Gpio
    }

    /// Function provided by the pin in the given mode, if any.
    pub fn function_in(&self, mode: PinMode) -> Option<PinFunction> {
        self.alts
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, f)| *f)
    }
}

macro_rules! gpio_pin {
    ($bcm:literal, $board:literal $(, $mode:ident => $func:ident)*) => {
        PinDefinition {
            bcm: $bcm,
            board: $board,
            name: concat!("GPIO", stringify!($bcm)),
            kind: PinKind::Gpio,
            alts: &[$((PinMode::$mode, PinFunction::$func)),*],
        }
    };
}

macro_rules! fixed_pin {
    ($board:literal, $name:literal, $kind:ident) => {
        PinDefinition {
            bcm: 0,
            board: $board,
            name: $name,
            kind: PinKind::$kind,
            alts: &[],
        }
    };
}

/// The standard 40-pin header layout.
pub const HEADER_PINS: &[PinDefinition] = &[
    fixed_pin!(1, "3V3", Power3v3),
    fixed_pin!(2, "5V", Power5v),
    fixed_pin!(4, "5V", Power5v),
    fixed_pin!(6, "GND", Ground),
    fixed_pin!(9, "GND", Ground),
    fixed_pin!(14, "GND", Ground),
    fixed_pin!(17, "3V3", Power3v3),
    fixed_pin!(20, "GND", Ground),
    fixed_pin!(25, "GND", Ground),
    fixed_pin!(30, "GND", Ground),
    fixed_pin!(34, "GND", Ground),
    fixed_pin!(39, "GND", Ground),
    gpio_pin!(2, 3, Alt0 => I2cSda),
    gpio_pin!(3, 5, Alt0 => I2cScl),
    gpio_pin!(4, 7),
    gpio_pin!(5, 29),
    gpio_pin!(6, 31),
    gpio_pin!(7, 26, Alt0 => SpiCe1),
    gpio_pin!(8, 24, Alt0 => SpiCe0),
    gpio_pin!(9, 21, Alt0 => SpiMiso),
    gpio_pin!(10, 19, Alt0 => SpiMosi),
    gpio_pin!(11, 23, Alt0 => SpiSclk),
    gpio_pin!(12, 32, Alt0 => Pwm0),
    gpio_pin!(13, 33, Alt0 => Pwm1),
    gpio_pin!(14, 8, Alt0 => UartTx),
    gpio_pin!(15, 10, Alt0 => UartRx),
    gpio_pin!(16, 36),
    gpio_pin!(17, 11),
    gpio_pin!(18, 12, Alt5 => Pwm0),
    gpio_pin!(19, 35, Alt5 => Pwm1),
    gpio_pin!(20, 38),
    gpio_pin!(21, 40),
    gpio_pin!(22, 15),
    gpio_pin!(23, 16),
    gpio_pin!(24, 18),
    gpio_pin!(25, 22),
    gpio_pin!(26, 37),
    gpio_pin!(27, 13),
];

/// Look up a GPIO-capable pin by BCM number.
pub fn pin_by_bcm(bcm: u8) -> Option<&'static PinDefinition> {
    HEADER_PINS
        .iter()
        .find(|p| p.is_gpio() && p.bcm == bcm)
}

/// Look up any header position by physical board number.
pub fn pin_by_board(board: u8) -> Option<&'static PinDefinition> {
    HEADER_PINS.iter().find(|p| p.board == board)
}

/// Translate BOARD numbering to BCM numbering. Power and ground positions
/// have no BCM number.
pub fn bcm_for_board(board: u8) -> Option<u8> {
    pin_by_board(board).filter(|p| p.is_gpio()).map(|p| p.bcm)
}

/// Resolve a BCM number to its definition or fail with `invalid_pin`.
pub fn require_gpio(bcm: u8) -> Result<&'static PinDefinition, GpioError> {
    pin_by_bcm(bcm).ok_or(GpioError::InvalidPin(bcm))
}
