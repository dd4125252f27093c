//! Keyed telemetry store shared by every producer on the vehicle bus.
//!
//! CAN decoders, the GPS task and the pipeline itself publish readings under
//! string keys; the packet forger reads them back when assembling a packet.
//! A handful of keys are computed on read (tick counter, heap statistics,
//! CPU usage) and never stored.
//!
//! Array-shaped data is flattened with an index suffix: `set_array("x", ..)`
//! writes `x_0, x_1, …`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{heap, timebase};

type ComputedFloat = fn() -> f64;
type ComputedInt = fn() -> i64;

/// Keys served by function pointers instead of the maps.
const COMPUTED_FLOATS: &[(&str, ComputedFloat)] = &[("rtos_cpu_usage", || 0.0)];

#[allow(clippy::cast_possible_wrap)]
const COMPUTED_INTS: &[(&str, ComputedInt)] = &[
    ("hal_lf_ticks", timebase::ticks_ms),
    ("rtos_heap_free", || heap::stats().free_bytes as i64),
    ("rtos_heap_allocations", || heap::stats().allocations as i64),
    ("rtos_heap_deallocations", || heap::stats().deallocations as i64),
];

#[derive(Default)]
struct Maps {
    floats: HashMap<String, f64>,
    ints: HashMap<String, i64>,
}

/// Thread-safe keyed store. Critical sections are short and never do I/O.
#[derive(Default)]
pub struct DataCollector {
    maps: Mutex<Maps>,
}

impl DataCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_float(&self, key: &str, value: f64) {
        let mut maps = self.maps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        maps.floats.insert(key.to_string(), value);
    }

    pub fn set_int(&self, key: &str, value: i64) {
        let mut maps = self.maps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        maps.ints.insert(key.to_string(), value);
    }

    /// Read a float key, preferring computed keys over stored ones.
    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        if let Some((_, f)) = COMPUTED_FLOATS.iter().find(|(k, _)| *k == key) {
            return f();
        }
        let maps = self.maps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        maps.floats.get(key).copied().unwrap_or(default)
    }

    /// Read an integer key, preferring computed keys over stored ones.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        if let Some((_, f)) = COMPUTED_INTS.iter().find(|(k, _)| *k == key) {
            return f();
        }
        let maps = self.maps.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        maps.ints.get(key).copied().unwrap_or(default)
    }

    /// Write `values` under `base_0 … base_n`, starting at `offset`.
    pub fn set_float_array(&self, base: &str, values: &[f64], offset: usize) {
        for (i, v) in values.iter().enumerate() {
            self.set_float(&format!("{base}_{}", offset + i), *v);
        }
    }

    /// Fill `out` from `base_0 … base_n`; missing entries read as zero.
    pub fn get_float_array(&self, base: &str, out: &mut [f64]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.get_float(&format!("{base}_{i}"), 0.0);
        }
    }
}
