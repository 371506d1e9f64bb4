use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error as ThisError;
use tracing::info;

#[derive(Debug, ThisError)]
pub enum PeripheralError {
    #[error("peripheral error; {0}")]
    Device(String),
}

/// Hardware actions reachable from the command protocol.
pub trait Peripheral: Send + Sync {
    fn set_led(&self, on: bool) -> Result<(), PeripheralError>;
}

/// An LED that only exists in the logs. Used when no GPIO driver is available.
#[derive(Debug, Default)]
pub struct SimulatedLed {
    lit: AtomicBool,
    writes: AtomicUsize,
}

impl SimulatedLed {
    pub fn new() -> SimulatedLed {
        SimulatedLed::default()
    }

    pub fn is_lit(&self) -> bool {
        self.lit.load(Ordering::SeqCst)
    }

    /// Number of times the LED state has been written.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Peripheral for SimulatedLed {
    fn set_led(&self, on: bool) -> Result<(), PeripheralError> {
        self.lit.store(on, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        info!(on, "LED set");
        Ok(())
    }
}
