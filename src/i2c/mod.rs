//! I²C bus controller: addressed transactions against attached device models,
//! protocol timing accounting and fault injection.
//!
//! Devices are polymorphic over the [I2cDevice] capability pair; the built-in
//! models live in [devices] and attach through the [I2cSlave] variants so the
//! test kit can register mocks without boxing.
use std::collections::BTreeMap;

use arbitrary_int::u7;
use embedded_hal::i2c::{self, Operation, SevenBitAddress};

use crate::clock::SimClock;
use crate::event::{Event, EventBus, EventKind, Payload};
use crate::time::{Hertz, RateExtU32, SimInstant};

pub mod devices;

pub use devices::{AdcConverter, FifoBuffer, LedExpander, Thermometer};

/// Lowest valid 7-bit device address.
pub const FIRST_VALID_ADDRESS: u8 = 0x08;
/// One past the highest valid 7-bit device address.
pub const LAST_VALID_ADDRESS: u8 = 0x78;

/// Start condition setup time at 100 kHz; scales inversely with the bus clock.
const SETUP_TIME_100K: f64 = 4.7e-6;
/// Stop condition hold time at 100 kHz; scales inversely with the bus clock.
const HOLD_TIME_100K: f64 = 4.0e-6;
/// Bit-times added to a transaction by an injected clock stretch.
const CLOCK_STRETCH_BITS: f64 = 100.0;

//==================================================================================================
// Devices
//==================================================================================================

/// Capability set of an attached I²C device.
pub trait I2cDevice {
    /// Handle a write; returns true to ACK.
    fn write(&mut self, data: &[u8]) -> bool;
    /// Handle a read of exactly `len` bytes.
    fn read(&mut self, len: usize) -> Vec<u8>;
}

/// Attached device, either one of the built-in models or a boxed custom one.
pub enum I2cSlave {
    Led(LedExpander),
    Adc(AdcConverter),
    Thermometer(Thermometer),
    Fifo(FifoBuffer),
    Custom(Box<dyn I2cDevice>),
}

impl I2cSlave {
    pub fn kind_name(&self) -> &'static str {
        match self {
            I2cSlave::Led(_) => "led-expander",
            I2cSlave::Adc(_) => "adc",
            I2cSlave::Thermometer(_) => "thermometer",
            I2cSlave::Fifo(_) => "fifo",
            I2cSlave::Custom(_) => "custom",
        }
    }
}

impl I2cDevice for I2cSlave {
    fn write(&mut self, data: &[u8]) -> bool {
        match self {
            I2cSlave::Led(dev) => dev.write(data),
            I2cSlave::Adc(dev) => dev.write(data),
            I2cSlave::Thermometer(dev) => dev.write(data),
            I2cSlave::Fifo(dev) => dev.write(data),
            I2cSlave::Custom(dev) => dev.write(data),
        }
    }

    fn read(&mut self, len: usize) -> Vec<u8> {
        match self {
            I2cSlave::Led(dev) => dev.read(len),
            I2cSlave::Adc(dev) => dev.read(len),
            I2cSlave::Thermometer(dev) => dev.read(len),
            I2cSlave::Fifo(dev) => dev.read(len),
            I2cSlave::Custom(dev) => dev.read(len),
        }
    }
}

//==================================================================================================
// Definitions
//==================================================================================================

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("device already attached at address 0x{:02X}", .0.value())]
pub struct AddressCollisionError(pub u7);

impl AddressCollisionError {
    pub fn code(&self) -> &'static str {
        "address_collision"
    }
}

/// Injectable bus faults, consumed by the next transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cFault {
    ClockStretch,
    BusCollision,
    Nack,
}

impl I2cFault {
    pub const fn as_str(&self) -> &'static str {
        match self {
            I2cFault::ClockStretch => "clock_stretch",
            I2cFault::BusCollision => "bus_collision",
            I2cFault::Nack => "nack",
        }
    }
}

/// Completed transaction record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub timestamp: SimInstant,
    pub address: u7,
    pub read: bool,
    pub data: Vec<u8>,
    pub ack: bool,
    pub success: bool,
    /// Wire time of the whole transaction, in seconds.
    pub duration: f64,
}

//==================================================================================================
// Controller
//==================================================================================================

/// Single I²C bus with attached device models.
pub struct I2cController {
    bus_id: u8,
    bus: EventBus,
    clock_freq: Hertz,
    devices: BTreeMap<u8, I2cSlave>,
    transactions: Vec<TransactionRecord>,
    pending_fault: Option<I2cFault>,
}

impl I2cController {
    pub fn new(bus_id: u8, bus: EventBus, clock_freq: Hertz) -> Self {
        I2cController {
            bus_id,
            bus,
            clock_freq,
            devices: BTreeMap::new(),
            transactions: Vec::new(),
            pending_fault: None,
        }
    }

    /// Standard-mode bus (100 kHz).
    pub fn new_standard(bus_id: u8, bus: EventBus) -> Self {
        Self::new(bus_id, bus, 100_u32.kHz())
    }

    #[inline]
    pub fn clock_freq(&self) -> Hertz {
        self.clock_freq
    }

    #[inline]
    fn bit_time(&self) -> f64 {
        1.0 / self.clock_freq.raw() as f64
    }

    #[inline]
    fn setup_time(&self) -> f64 {
        SETUP_TIME_100K * 100_000.0 / self.clock_freq.raw() as f64
    }

    #[inline]
    fn hold_time(&self) -> f64 {
        HOLD_TIME_100K * 100_000.0 / self.clock_freq.raw() as f64
    }

    /// Attach a device. At most one device per address.
    pub fn add_device(
        &mut self,
        address: u7,
        device: I2cSlave,
    ) -> Result<(), AddressCollisionError> {
        if self.devices.contains_key(&address.value()) {
            return Err(AddressCollisionError(address));
        }
        self.devices.insert(address.value(), device);
        Ok(())
    }

    pub fn remove_device(&mut self, address: u7) -> Option<I2cSlave> {
        self.devices.remove(&address.value())
    }

    pub fn device(&self, address: u7) -> Option<&I2cSlave> {
        self.devices.get(&address.value())
    }

    pub fn device_mut(&mut self, address: u7) -> Option<&mut I2cSlave> {
        self.devices.get_mut(&address.value())
    }

    /// Write `data` to the device at `address`. Returns the ACK state; an empty
    /// address slot NACKs without publishing anything.
    pub fn write_transaction(&mut self, address: u7, data: &[u8], now: SimInstant) -> bool {
        let fault = self.pending_fault.take();
        let Some(device) = self.devices.get_mut(&address.value()) else {
            return false;
        };

        let collision = fault == Some(I2cFault::BusCollision);
        let ack = if collision || fault == Some(I2cFault::Nack) {
            false
        } else {
            device.write(data)
        };

        // START + address byte + address ACK slot.
        let mut duration = self.setup_time() + 9.0 * self.bit_time();
        if ack {
            // 8 data bits plus the ACK clock, per byte.
            duration += data.len() as f64 * 9.0 * self.bit_time();
        }
        if fault == Some(I2cFault::ClockStretch) {
            duration += CLOCK_STRETCH_BITS * self.bit_time();
        }
        duration += self.hold_time();

        self.transactions.push(TransactionRecord {
            timestamp: now,
            address,
            read: false,
            data: data.to_vec(),
            ack,
            success: ack && !collision,
            duration,
        });

        let mut payload = Payload::new()
            .with("address", address.value())
            .with("write", true)
            .with("data", data.to_vec())
            .with("ack", ack)
            .with("duration", duration);
        if collision {
            payload = payload.with("error", I2cFault::BusCollision.as_str());
        }
        self.bus.publish(Event::new(
            EventKind::I2cTransaction,
            now,
            format!("I2C{}", self.bus_id),
            payload,
        ));

        ack && !collision
    }

    /// Read `length` bytes from the device at `address`. `None` when the slot is
    /// empty or the transaction faulted.
    pub fn read_transaction(
        &mut self,
        address: u7,
        length: usize,
        now: SimInstant,
    ) -> Option<Vec<u8>> {
        let fault = self.pending_fault.take();
        let device = self.devices.get_mut(&address.value())?;

        let failed = matches!(fault, Some(I2cFault::BusCollision) | Some(I2cFault::Nack));
        let data = if failed {
            Vec::new()
        } else {
            device.read(length)
        };

        let mut duration = self.setup_time() + 9.0 * self.bit_time();
        if !failed {
            duration += length as f64 * 9.0 * self.bit_time();
        }
        if fault == Some(I2cFault::ClockStretch) {
            duration += CLOCK_STRETCH_BITS * self.bit_time();
        }
        duration += self.hold_time();

        self.transactions.push(TransactionRecord {
            timestamp: now,
            address,
            read: true,
            data: data.clone(),
            ack: !failed,
            success: !failed,
            duration,
        });

        let mut payload = Payload::new()
            .with("address", address.value())
            .with("read", true)
            .with("data", data.clone())
            .with("length", length as i64)
            .with("duration", duration);
        if let Some(fault) = fault.filter(|_| failed) {
            payload = payload.with("error", fault.as_str());
        }
        self.bus.publish(Event::new(
            EventKind::I2cTransaction,
            now,
            format!("I2C{}", self.bus_id),
            payload,
        ));

        if failed { None } else { Some(data) }
    }

    /// Addresses responding on the bus, in ascending order.
    pub fn scan_bus(&self, _now: SimInstant) -> Vec<u7> {
        self.devices
            .keys()
            .copied()
            .filter(|a| (FIRST_VALID_ADDRESS..LAST_VALID_ADDRESS).contains(a))
            .map(u7::new)
            .collect()
    }

    /// Arm a one-shot fault consumed by the next transaction.
    pub fn inject_error(&mut self, fault: I2cFault, now: SimInstant) {
        log::debug!("I2C{}: injecting {} at {now:?}", self.bus_id, fault.as_str());
        self.pending_fault = Some(fault);
        self.bus.publish(Event::new(
            EventKind::DeviceUpdate,
            now,
            format!("I2C{}", self.bus_id),
            Payload::new()
                .with("bus", self.bus_id)
                .with("error", fault.as_str()),
        ));
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.transactions
    }

    //==============================================================================================
    // SMBus-style register access
    //==============================================================================================

    /// Write a single register value.
    pub fn write_byte_data(&mut self, address: u7, register: u8, value: u8, now: SimInstant) -> bool {
        self.write_transaction(address, &[register, value], now)
    }

    /// Read a single register value (register-pointer write, then 1-byte read).
    pub fn read_byte_data(&mut self, address: u7, register: u8, now: SimInstant) -> Option<u8> {
        if !self.write_transaction(address, &[register], now) {
            return None;
        }
        self.read_transaction(address, 1, now)
            .and_then(|bytes| bytes.first().copied())
    }

    /// Read a block of registers.
    pub fn read_block(
        &mut self,
        address: u7,
        register: u8,
        length: usize,
        now: SimInstant,
    ) -> Option<Vec<u8>> {
        if !self.write_transaction(address, &[register], now) {
            return None;
        }
        self.read_transaction(address, length, now)
    }
}

//==================================================================================================
// embedded-hal master handle
//==================================================================================================

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum I2cMasterError {
    #[error("address not acknowledged")]
    NackAddr,
    #[error("data not acknowledged in write operation")]
    NackData,
}

impl i2c::Error for I2cMasterError {
    fn kind(&self) -> i2c::ErrorKind {
        match self {
            I2cMasterError::NackAddr => {
                i2c::ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Address)
            }
            I2cMasterError::NackData => {
                i2c::ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Data)
            }
        }
    }
}

/// `embedded-hal` master view of the bus, timestamping at the simulation clock.
pub struct I2cMaster<'a> {
    ctrl: &'a mut I2cController,
    clock: &'a SimClock,
}

impl<'a> I2cMaster<'a> {
    pub fn new(ctrl: &'a mut I2cController, clock: &'a SimClock) -> Self {
        I2cMaster { ctrl, clock }
    }
}

impl i2c::ErrorType for I2cMaster<'_> {
    type Error = I2cMasterError;
}

impl i2c::I2c<SevenBitAddress> for I2cMaster<'_> {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let address = u7::new(address & 0x7F);
        let now = self.clock.now();
        for operation in operations {
            match operation {
                Operation::Write(bytes) => {
                    if !self.ctrl.write_transaction(address, bytes, now) {
                        return Err(if self.ctrl.device(address).is_some() {
                            I2cMasterError::NackData
                        } else {
                            I2cMasterError::NackAddr
                        });
                    }
                }
                Operation::Read(buffer) => {
                    let data = self
                        .ctrl
                        .read_transaction(address, buffer.len(), now)
                        .ok_or(I2cMasterError::NackAddr)?;
                    buffer.copy_from_slice(&data);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(us: u64) -> SimInstant {
        SimInstant::from_ticks(us)
    }

    fn bus_with_fifo() -> (I2cController, EventBus) {
        let bus = EventBus::new();
        let mut i2c = I2cController::new_standard(1, bus.clone());
        i2c.add_device(u7::new(0x27), I2cSlave::Fifo(FifoBuffer::new()))
            .unwrap();
        (i2c, bus)
    }

    #[test]
    fn second_device_at_same_address_collides() {
        let (mut i2c, _bus) = bus_with_fifo();
        let err = i2c
            .add_device(u7::new(0x27), I2cSlave::Fifo(FifoBuffer::new()))
            .unwrap_err();
        assert_eq!(err.code(), "address_collision");
    }

    #[test]
    fn scan_reports_attached_addresses_in_order() {
        let (mut i2c, _bus) = bus_with_fifo();
        i2c.add_device(u7::new(0x76), I2cSlave::Thermometer(Thermometer::new(21.5)))
            .unwrap();
        let found: Vec<u8> = i2c.scan_bus(at(0)).iter().map(|a| a.value()).collect();
        assert_eq!(found, vec![0x27, 0x76]);
    }

    #[test]
    fn write_to_empty_slot_nacks_silently() {
        let (mut i2c, bus) = bus_with_fifo();
        bus.start_recording();
        assert!(!i2c.write_transaction(u7::new(0x40), &[0x00], at(0)));
        assert_eq!(i2c.read_transaction(u7::new(0x40), 1, at(0)), None);
        assert_eq!(bus.recorded_len(), 0);
        assert!(i2c.transactions().is_empty());
    }

    #[test]
    fn write_transaction_accounts_protocol_timing() {
        let (mut i2c, bus) = bus_with_fifo();
        bus.start_recording();
        assert!(i2c.write_transaction(u7::new(0x27), &[0xAA, 0xBB], at(0)));
        let events = bus.events_of(EventKind::I2cTransaction);
        assert_eq!(events.len(), 1);
        let payload = &events[0].payload;
        assert_eq!(payload.get("ack").unwrap().as_bool(), Some(true));
        assert_eq!(payload.get("data").unwrap().as_bytes(), Some(&[0xAA, 0xBB][..]));
        let bit = 1.0 / 100_000.0;
        let expected = 4.7e-6 + 8.0 * bit + bit + 2.0 * 9.0 * bit + 4.0e-6;
        let duration = payload.get("duration").unwrap().as_float().unwrap();
        assert!((duration - expected).abs() < 1e-12, "duration = {duration}");
    }

    #[test]
    fn fifo_round_trips_written_bytes() {
        let (mut i2c, _bus) = bus_with_fifo();
        let sent = [0x01, 0x02, 0x03];
        assert!(i2c.write_transaction(u7::new(0x27), &sent, at(0)));
        let got = i2c.read_transaction(u7::new(0x27), sent.len(), at(1)).unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn nack_fault_fails_exactly_one_transaction() {
        let (mut i2c, _bus) = bus_with_fifo();
        i2c.inject_error(I2cFault::Nack, at(0));
        assert!(!i2c.write_transaction(u7::new(0x27), &[0x01], at(1)));
        assert!(i2c.write_transaction(u7::new(0x27), &[0x02], at(2)));
    }

    #[test]
    fn clock_stretch_fault_lengthens_duration() {
        let (mut i2c, _bus) = bus_with_fifo();
        assert!(i2c.write_transaction(u7::new(0x27), &[0x01], at(0)));
        let base = i2c.transactions()[0].duration;
        i2c.inject_error(I2cFault::ClockStretch, at(1));
        assert!(i2c.write_transaction(u7::new(0x27), &[0x01], at(2)));
        let stretched = i2c.transactions()[1].duration;
        assert!((stretched - base - 100.0 / 100_000.0).abs() < 1e-12);
    }

    #[test]
    fn bus_collision_tags_the_event() {
        let (mut i2c, bus) = bus_with_fifo();
        bus.start_recording();
        i2c.inject_error(I2cFault::BusCollision, at(0));
        assert!(!i2c.write_transaction(u7::new(0x27), &[0x01], at(1)));
        let events = bus.events_of(EventKind::I2cTransaction);
        assert_eq!(
            events[0].payload.get("error").unwrap().as_str(),
            Some("bus_collision")
        );
    }

    #[test]
    fn smbus_register_round_trip() {
        let bus = EventBus::new();
        let mut i2c = I2cController::new_standard(1, bus);
        i2c.add_device(u7::new(0x48), I2cSlave::Adc(AdcConverter::new()))
            .unwrap();
        if let Some(I2cSlave::Adc(adc)) = i2c.device_mut(u7::new(0x48)) {
            adc.set_channel_value(2, 0x0123);
        }
        let block = i2c.read_block(u7::new(0x48), 0x02, 2, at(0)).unwrap();
        assert_eq!(block, vec![0x01, 0x23]);
    }

    #[test]
    fn master_handle_speaks_embedded_hal() {
        use embedded_hal::i2c::I2c as _;
        let bus = EventBus::new();
        let mut i2c = I2cController::new_standard(1, bus);
        i2c.add_device(u7::new(0x27), I2cSlave::Fifo(FifoBuffer::new()))
            .unwrap();
        let mut clock = SimClock::default();
        clock.start();
        let mut master = I2cMaster::new(&mut i2c, &clock);
        master.write(0x27, &[0x11, 0x22]).unwrap();
        let mut buf = [0u8; 2];
        master.read(0x27, &mut buf).unwrap();
        assert_eq!(buf, [0x11, 0x22]);
        let err = master.write(0x40, &[0x00]).unwrap_err();
        assert_eq!(err, I2cMasterError::NackAddr);
    }
}
