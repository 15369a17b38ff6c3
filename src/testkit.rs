//! Assertion helpers over recorded event history.
//!
//! The simulator is deterministic, so test assertions inspect the recorded
//! history directly instead of polling. Helpers panic with descriptive messages
//! and are meant for use inside `#[test]` functions.
use crate::event::{Event, EventKind};

/// `(seconds, level)` of every `gpio_state` event for one pin, in record order.
pub fn gpio_states(events: &[Event], pin: u8) -> Vec<(f64, u8)> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::GpioState)
        .filter(|e| e.payload.get("pin").and_then(|v| v.as_int()) == Some(pin as i64))
        .map(|e| {
            let value = e.payload.get("value").and_then(|v| v.as_int()).unwrap_or(0);
            (e.secs(), value as u8)
        })
        .collect()
}

/// `(seconds, edge kind)` of every `gpio_edge` event for one pin.
pub fn gpio_edges(events: &[Event], pin: u8) -> Vec<(f64, String)> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::GpioEdge)
        .filter(|e| e.payload.get("pin").and_then(|v| v.as_int()) == Some(pin as i64))
        .map(|e| {
            let edge = e
                .payload
                .get("edge")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_owned();
            (e.secs(), edge)
        })
        .collect()
}

/// Assert the exact `gpio_state` sequence of a pin, with a timing tolerance in
/// seconds.
pub fn assert_pin_sequence(events: &[Event], pin: u8, expected: &[(f64, u8)], tolerance: f64) {
    let actual = gpio_states(events, pin);
    assert_eq!(
        actual.len(),
        expected.len(),
        "pin {pin}: expected {} state events, saw {}: {actual:?}",
        expected.len(),
        actual.len()
    );
    for (i, ((t, v), (et, ev))) in actual.iter().zip(expected).enumerate() {
        assert!(
            (t - et).abs() <= tolerance,
            "pin {pin} event {i}: expected t={et}, got t={t}"
        );
        assert_eq!(v, ev, "pin {pin} event {i}: expected level {ev}, got {v}");
    }
}

/// Assert the edge-kind sequence of a pin.
pub fn assert_edge_kinds(events: &[Event], pin: u8, expected: &[&str]) {
    let actual: Vec<String> = gpio_edges(events, pin).into_iter().map(|(_, e)| e).collect();
    assert_eq!(
        actual, expected,
        "pin {pin}: edge kinds {actual:?} do not match {expected:?}"
    );
}

/// Assert that every `gpio_edge` is preceded by exactly one `gpio_state` for
/// the same pin at the same timestamp.
pub fn assert_edges_follow_states(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        if event.kind != EventKind::GpioEdge {
            continue;
        }
        let pin = event.payload.get("pin").and_then(|v| v.as_int());
        let matching = events[..i]
            .iter()
            .filter(|e| e.kind == EventKind::GpioState)
            .filter(|e| e.payload.get("pin").and_then(|v| v.as_int()) == pin)
            .filter(|e| e.timestamp == event.timestamp)
            .count();
        assert_eq!(
            matching, 1,
            "edge at {} on pin {pin:?} is preceded by {matching} state events",
            event.secs()
        );
    }
}

/// Find an `i2c_transaction` write event for an address and payload.
pub fn find_i2c_write<'a>(events: &'a [Event], address: u8, data: &[u8]) -> Option<&'a Event> {
    events.iter().find(|e| {
        e.kind == EventKind::I2cTransaction
            && e.payload.get("address").and_then(|v| v.as_int()) == Some(address as i64)
            && e.payload.get("write").and_then(|v| v.as_bool()) == Some(true)
            && e.payload.get("data").and_then(|v| v.as_bytes()) == Some(data)
    })
}

/// Assert an I²C write happened and return its event.
pub fn assert_i2c_write<'a>(events: &'a [Event], address: u8, data: &[u8]) -> &'a Event {
    find_i2c_write(events, address, data).unwrap_or_else(|| {
        panic!("no i2c write to 0x{address:02X} with data {data:02X?} in {} events", events.len())
    })
}

/// Mean-period frequency of a pin from its recorded rising edges.
pub fn edge_frequency(events: &[Event], pin: u8) -> Option<f64> {
    let rising: Vec<f64> = gpio_edges(events, pin)
        .into_iter()
        .filter(|(_, kind)| kind == "rising")
        .map(|(t, _)| t)
        .collect();
    if rising.len() < 2 {
        return None;
    }
    let span = rising.last().unwrap() - rising.first().unwrap();
    let mean_period = span / (rising.len() - 1) as f64;
    (mean_period > 0.0).then(|| 1.0 / mean_period)
}
