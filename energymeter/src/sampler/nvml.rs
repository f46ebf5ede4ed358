use std::collections::HashMap;

use nvml_wrapper::{error::NvmlError, Nvml};
use once_cell::sync::OnceCell;

use super::{GpuBackend, GpuReading};
use crate::{config::ProcessFilter, models::Component, MeterError, Result};

static NVML: OnceCell<Nvml> = OnceCell::new();

// sys_process_name crops to this many bytes
const PROCESS_NAME_LEN: usize = 256;

fn nvml() -> Result<&'static Nvml> {
    NVML.get_or_try_init(Nvml::init)
        .map_err(|e| MeterError::unavailable(Component::Gpu, format!("NVML init failed: {}", e)))
}

fn gpu_err(e: NvmlError) -> MeterError {
    MeterError::unavailable(Component::Gpu, e.to_string())
}

/// Reads power and per-process utilisation straight from NVML.
pub struct NvmlBackend {
    nvml: &'static Nvml,
    index: u32,
    /// Newest utilisation timestamp already consumed, in microseconds.
    last_seen: u64,
}

impl NvmlBackend {
    pub fn new(index: u32) -> Result<Self> {
        let nvml = nvml()?;
        let device = nvml.device_by_index(index).map_err(gpu_err)?;
        if let Ok(name) = device.name() {
            log::info!("NVML: sampling GPU {} ({})", index, name);
        }
        Ok(Self {
            nvml,
            index,
            last_seen: 0,
        })
    }

    fn activity(&mut self, filter: &ProcessFilter) -> Result<f64> {
        let device = self.nvml.device_by_index(self.index).map_err(gpu_err)?;
        let samples = match device.process_utilization_stats(self.last_seen) {
            Ok(samples) => samples,
            // no process ran on the device since `last_seen`
            Err(NvmlError::NotFound) => return Ok(0.0),
            Err(e) => return Err(gpu_err(e)),
        };

        // newest sample per pid
        let mut latest: HashMap<u32, (u64, u32)> = HashMap::new();
        for s in samples {
            self.last_seen = self.last_seen.max(s.timestamp);
            let entry = latest.entry(s.pid).or_insert((s.timestamp, s.sm_util));
            if s.timestamp >= entry.0 {
                *entry = (s.timestamp, s.sm_util);
            }
        }

        let mut activity = 0.0;
        for (pid, (_, sm_util)) in latest {
            match self.nvml.sys_process_name(pid, PROCESS_NAME_LEN) {
                Ok(name) if filter.matches(&name) => activity += sm_util as f64,
                Ok(_) => {}
                Err(e) => log::debug!("NVML: no name for pid {}: {}", pid, e),
            }
        }
        Ok(activity)
    }
}

impl GpuBackend for NvmlBackend {
    fn name(&self) -> String {
        format!("nvml:{}", self.index)
    }

    fn query(&mut self, filter: &ProcessFilter) -> Result<GpuReading> {
        let device = self.nvml.device_by_index(self.index).map_err(gpu_err)?;
        let power_mw = device.power_usage().map_err(gpu_err)?;
        Ok(GpuReading {
            power_watts: power_mw as f64 / 1000.0,
            activity: self.activity(filter)?,
        })
    }
}
