//! Timestamped pub/sub event bus with a bounded, recordable history.
//!
//! Every peripheral mutation publishes an [Event] here at the clock's current
//! instant. Subscribers register per [EventKind]; a subscription is tied to the
//! [Subscription] guard it returns, so dropping the guard unregisters the callback
//! (the slot is reaped on the next publish to that kind). Publication is
//! synchronous and single-threaded; callbacks must not re-enter `publish` for the
//! event they are currently handling.
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::time::{InstantExt, SimInstant};

/// Number of events retained while recording before FIFO eviction kicks in.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

//==================================================================================================
// Event model
//==================================================================================================

/// Standard simulation event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    GpioEdge,
    GpioState,
    I2cTransaction,
    SpiTransaction,
    UartData,
    PwmUpdate,
    DeviceUpdate,
    SimulationStart,
    SimulationStop,
    SimulationReset,
}

impl EventKind {
    /// Stable wire name of the event kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::GpioEdge => "gpio_edge",
            EventKind::GpioState => "gpio_state",
            EventKind::I2cTransaction => "i2c_transaction",
            EventKind::SpiTransaction => "spi_transaction",
            EventKind::UartData => "uart_data",
            EventKind::PwmUpdate => "pwm_update",
            EventKind::DeviceUpdate => "device_update",
            EventKind::SimulationStart => "simulation_start",
            EventKind::SimulationStop => "simulation_stop",
            EventKind::SimulationReset => "simulation_reset",
        }
    }
}

/// A single payload value. Payload key names and value shapes are stable API;
/// subscribers and the JSON export rely on them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Str(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.collect_seq(v.iter()),
        }
    }
}

/// Ordered key/value mapping carried by every event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Vec<(&'static str, Value)>);

impl Payload {
    pub fn new() -> Self {
        Payload(Vec::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.0.push((key, value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Immutable simulation event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: SimInstant,
    pub source: String,
    pub payload: Payload,
}

impl Event {
    pub fn new(
        kind: EventKind,
        timestamp: SimInstant,
        source: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Event {
            kind,
            timestamp,
            source: source.into(),
            payload,
        }
    }

    /// Event timestamp in seconds.
    #[inline]
    pub fn secs(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Event", 4)?;
        s.serialize_field("kind", self.kind.as_str())?;
        s.serialize_field("timestamp", &self.secs())?;
        s.serialize_field("source", &self.source)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

//==================================================================================================
// Bus
//==================================================================================================

struct Slot {
    alive: Rc<Cell<bool>>,
    callback: Rc<RefCell<dyn FnMut(&Event)>>,
}

struct BusInner {
    subscribers: HashMap<EventKind, Vec<Slot>>,
    history: VecDeque<Event>,
    capacity: usize,
    recording: bool,
}

/// Guard for an active subscription. Dropping it unregisters the callback.
#[must_use = "dropping the subscription immediately unsubscribes the callback"]
pub struct Subscription {
    alive: Rc<Cell<bool>>,
}

impl Subscription {
    /// Explicitly unregister. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.alive.set(false);
    }
}

/// Cheaply clonable handle to the shared event bus.
///
/// Each controller holds its own clone. The bus is single-threaded by
/// construction; the kernel and all callbacks run on the driver thread.
#[derive(Clone)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus with a custom recording ring capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        EventBus {
            inner: Rc::new(RefCell::new(BusInner {
                subscribers: HashMap::new(),
                history: VecDeque::new(),
                capacity: capacity.max(1),
                recording: false,
            })),
        }
    }

    /// Register a callback for one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl FnMut(&Event) + 'static,
    ) -> Subscription {
        let alive = Rc::new(Cell::new(true));
        let slot = Slot {
            alive: alive.clone(),
            callback: Rc::new(RefCell::new(callback)),
        };
        self.inner
            .borrow_mut()
            .subscribers
            .entry(kind)
            .or_default()
            .push(slot);
        Subscription { alive }
    }

    /// Publish an event to all live subscribers of its kind.
    ///
    /// The event is appended to the recording ring first (evicting the oldest
    /// entry when full), then the subscriber list is snapshotted and dispatched,
    /// so callbacks may publish further events.
    pub fn publish(&self, event: Event) {
        let callbacks: Vec<Rc<RefCell<dyn FnMut(&Event)>>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.recording {
                if inner.history.len() == inner.capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
            }
            match inner.subscribers.get_mut(&event.kind) {
                Some(slots) => {
                    slots.retain(|slot| slot.alive.get());
                    slots.iter().map(|slot| slot.callback.clone()).collect()
                }
                None => Vec::new(),
            }
        };
        for callback in callbacks {
            (callback.borrow_mut())(&event);
        }
    }

    /// Start recording. Clears any previous history.
    pub fn start_recording(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.recording = true;
        inner.history.clear();
    }

    /// Stop recording and return the recorded history.
    pub fn stop_recording(&self) -> Vec<Event> {
        let mut inner = self.inner.borrow_mut();
        inner.recording = false;
        inner.history.iter().cloned().collect()
    }

    /// Filtered copy of the recorded history.
    pub fn events(
        &self,
        kind: Option<EventKind>,
        start: Option<SimInstant>,
        end: Option<SimInstant>,
    ) -> Vec<Event> {
        self.inner
            .borrow()
            .history
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .filter(|e| start.is_none_or(|s| e.timestamp >= s))
            .filter(|e| end.is_none_or(|s| e.timestamp <= s))
            .cloned()
            .collect()
    }

    /// All recorded events of one kind.
    pub fn events_of(&self, kind: EventKind) -> Vec<Event> {
        self.events(Some(kind), None, None)
    }

    pub fn clear_history(&self) {
        self.inner.borrow_mut().history.clear();
    }

    pub fn recorded_len(&self) -> usize {
        self.inner.borrow().history.len()
    }

    /// Serialize the recorded history as a JSON array of
    /// `{kind, timestamp, source, payload}` objects.
    pub fn export_json(&self, writer: impl std::io::Write) -> serde_json::Result<()> {
        let events: Vec<Event> = self.inner.borrow().history.iter().cloned().collect();
        serde_json::to_writer(writer, &events)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn event_at(us: u64, source: &str) -> Event {
        Event::new(
            EventKind::GpioState,
            SimInstant::from_ticks(us),
            source,
            Payload::new().with("pin", 18u8).with("value", 1u8),
        )
    }

    #[test]
    fn subscriber_receives_matching_kind_only() {
        let bus = EventBus::new();
        let seen = Rc::new(Cell::new(0u32));
        let counter = seen.clone();
        let _sub = bus.subscribe(EventKind::GpioState, move |_| {
            counter.set(counter.get() + 1)
        });
        bus.publish(event_at(1, "GPIO18"));
        bus.publish(Event::new(
            EventKind::UartData,
            SimInstant::from_ticks(2),
            "UART0",
            Payload::new(),
        ));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let bus = EventBus::new();
        let seen = Rc::new(Cell::new(0u32));
        let counter = seen.clone();
        let sub = bus.subscribe(EventKind::GpioState, move |_| {
            counter.set(counter.get() + 1)
        });
        bus.publish(event_at(1, "GPIO18"));
        drop(sub);
        bus.publish(event_at(2, "GPIO18"));
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn callbacks_may_publish_other_events() {
        let bus = EventBus::new();
        let relay = bus.clone();
        let _sub = bus.subscribe(EventKind::GpioState, move |e| {
            relay.publish(Event::new(
                EventKind::DeviceUpdate,
                e.timestamp,
                "relay",
                Payload::new(),
            ));
        });
        bus.start_recording();
        bus.publish(event_at(5, "GPIO18"));
        let history = bus.stop_recording();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventKind::GpioState);
        assert_eq!(history[1].kind, EventKind::DeviceUpdate);
    }

    #[test]
    fn recording_ring_evicts_oldest_first() {
        let bus = EventBus::with_capacity(3);
        bus.start_recording();
        for us in 0..5 {
            bus.publish(event_at(us, "GPIO18"));
        }
        let history = bus.stop_recording();
        let times: Vec<u64> = history
            .iter()
            .map(|e| e.timestamp.duration_since_epoch().ticks())
            .collect();
        assert_eq!(times, vec![2, 3, 4]);
    }

    #[test]
    fn events_filters_by_kind_and_time() {
        let bus = EventBus::new();
        bus.start_recording();
        for us in 0..10 {
            bus.publish(event_at(us, "GPIO18"));
        }
        let window = bus.events(
            Some(EventKind::GpioState),
            Some(SimInstant::from_ticks(3)),
            Some(SimInstant::from_ticks(6)),
        );
        assert_eq!(window.len(), 4);
        assert!(bus.events_of(EventKind::UartData).is_empty());
    }

    #[test]
    fn export_json_has_stable_shape() {
        let bus = EventBus::new();
        bus.start_recording();
        bus.publish(event_at(1_500_000, "GPIO18"));
        let mut out = Vec::new();
        bus.export_json(&mut out).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json[0]["kind"], "gpio_state");
        assert_eq!(json[0]["timestamp"], 1.5);
        assert_eq!(json[0]["source"], "GPIO18");
        assert_eq!(json[0]["payload"]["pin"], 18);
    }
}
