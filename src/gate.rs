//! Admission control for correctness requests.

use std::sync::{Arc, Mutex};

/// Permit count meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// A bounded-permit gate limiting how many requests are mid-flight.
///
/// A request that finds no permit left is rejected immediately rather than
/// queued. A permit count of [`UNLIMITED`] disables the gate.
#[derive(Debug)]
pub struct ConcurrencyGate {
    available: Mutex<i64>,
}

impl ConcurrencyGate {
    pub fn new(permits: i64) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(permits),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(UNLIMITED)
    }

    /// Takes a permit if one is available. The permit is returned to the gate
    /// when the guard is dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut available = self.available.lock().unwrap();
        match *available {
            n if n < 0 => Some(Permit { gate: None }),
            0 => None,
            _ => {
                *available -= 1;
                Some(Permit {
                    gate: Some(Arc::clone(self)),
                })
            }
        }
    }

    /// Permits currently available, or [`UNLIMITED`].
    pub fn available(&self) -> i64 {
        *self.available.lock().unwrap()
    }

    fn release(&self) {
        *self.available.lock().unwrap() += 1;
    }
}

/// An admitted request's hold on the gate.
#[derive(Debug)]
pub struct Permit {
    gate: Option<Arc<ConcurrencyGate>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}
