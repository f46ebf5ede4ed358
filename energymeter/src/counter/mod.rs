//! Cumulative CPU package and DRAM energy counters.

use crate::{models::CounterSnapshot, Result};

mod msr;
mod powercap;
pub use msr::*;
pub use powercap::*;

/// Synchronous access to cumulative energy counters, in microjoules.
pub trait CounterSource: Send {
    fn name(&self) -> String;
    /// Reads every rail once. Rails the platform does not expose are `None`.
    fn snapshot(&mut self) -> Result<CounterSnapshot>;
}

/// Stands in when no counter interface is readable. Both rails are absent.
#[derive(Debug)]
pub struct NoCounters {
    init: std::time::Instant,
}

impl NoCounters {
    pub fn new() -> Self {
        Self {
            init: std::time::Instant::now(),
        }
    }
}

impl Default for NoCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for NoCounters {
    fn name(&self) -> String {
        "none".to_string()
    }

    fn snapshot(&mut self) -> Result<CounterSnapshot> {
        Ok(CounterSnapshot {
            elapsed: self.init.elapsed(),
            package: None,
            dram: None,
        })
    }
}

/// Powercap when readable, then RAPL MSRs, then nothing.
pub fn default_counter_source() -> Box<dyn CounterSource> {
    match PowercapSource::discover(POWERCAP_RAPL_PATH) {
        Ok(source) => return Box::new(source),
        Err(e) => log::info!("Powercap counters not usable ({}), trying MSR", e),
    }
    match MsrSource::open() {
        Ok(source) => return Box::new(source),
        Err(e) => log::warn!("MSR counters not usable ({}), CPU and DRAM will read zero", e),
    }
    Box::new(NoCounters::new())
}
