//! Per-component energy of a code region: CPU packages and DRAM from RAPL,
//! GPU from polled board power, disk from traced I/O.
//!
//! ```no_run
//! use energymeter::{EnergyMeter, MeterConfig};
//!
//! let config = MeterConfig::new(1.6e9, 6.0, 1.42).with_label("matmul");
//! let mut meter = EnergyMeter::new(config)?;
//! meter.measure(|| {
//!     // workload
//! })?;
//! println!("{:?}", meter.component_energy(true)?);
//! # Ok::<(), energymeter::MeterError>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("energymeter only supports linux");

#[macro_use]
mod error;
pub use error::*;

pub mod config;
pub mod counter;
pub mod estimate;
pub mod logger;
mod meter;
pub mod models;
pub mod sampler;
pub mod trace;

pub use config::{DiskProfile, GpuBackendKind, MeterConfig, ProcessFilter, TraceCommand};
pub use meter::{EnergyMeter, Phase};
pub use models::{Component, ComponentEnergy, EnergyReport, IoTotals, PowerSample, Session};
