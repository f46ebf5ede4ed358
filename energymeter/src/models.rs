use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

/// Hardware component an energy figure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Cpu,
    Dram,
    Gpu,
    Disk,
}

impl Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Cpu => write!(f, "CPU"),
            Component::Dram => write!(f, "DRAM"),
            Component::Gpu => write!(f, "GPU"),
            Component::Disk => write!(f, "Disk"),
        }
    }
}

/// One measurement run between `begin()` and `end()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub label: String,
    pub include_idle: bool,
    /// Seconds since the unix epoch.
    pub started_at: f64,
    pub ended_at: f64,
    pub duration_s: f64,
}

/// A cumulative energy counter of a single RAPL domain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailCounter {
    pub energy_uj: u64,
    /// The value at which the counter wraps back to zero.
    pub max_energy_uj: u64,
}

impl RailCounter {
    pub fn new(energy_uj: u64, max_energy_uj: u64) -> Self {
        Self {
            energy_uj,
            max_energy_uj,
        }
    }

    /// Microjoules consumed between `self` and a later reading.
    pub fn delta_uj(&self, later: &RailCounter) -> u64 {
        // if the counter wrapped between the two reads
        if later.energy_uj < self.energy_uj {
            self.max_energy_uj.saturating_sub(self.energy_uj) + later.energy_uj
        } else {
            later.energy_uj - self.energy_uj
        }
    }
}

/// Counters of all CPU sockets at one point in time.
///
/// `None` means the platform has no counter for that rail.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Time covered since the counter source was initialised.
    pub elapsed: Duration,
    pub package: Option<Vec<RailCounter>>,
    pub dram: Option<Vec<RailCounter>>,
}

/// One GPU reading. Power and activity of the same instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub power_watts: f64,
    /// Utilisation attributed to the measured processes, in percent.
    pub activity: f64,
}

impl PowerSample {
    pub fn new(power_watts: f64, activity: f64) -> Self {
        Self {
            power_watts,
            activity,
        }
    }

    pub fn is_active(&self) -> bool {
        self.activity > 0.0
    }
}

/// Disk bytes attributed to the measured processes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoTotals {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl IoTotals {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_read.saturating_add(self.bytes_written)
    }
}

/// Joules per component. CPU and DRAM carry one value per socket.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEnergy {
    pub cpu: Vec<f64>,
    pub dram: Vec<f64>,
    pub gpu: f64,
    pub disk: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

impl ComponentEnergy {
    pub fn sum(&self) -> f64 {
        self.cpu.iter().sum::<f64>() + self.dram.iter().sum::<f64>() + self.gpu + self.disk
    }

    pub fn with_total(mut self) -> Self {
        self.total = Some(self.sum());
        self
    }
}

/// A finished session together with its energy breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReport {
    pub session: Session,
    pub energy: ComponentEnergy,
    pub gpu_samples: usize,
    pub io: IoTotals,
}

/// Flat row written by the CSV logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReportRow {
    pub label: String,
    pub include_idle: bool,
    pub started_at: f64,
    pub duration_s: f64,
    pub cpu_j: f64,
    pub dram_j: f64,
    pub gpu_j: f64,
    pub disk_j: f64,
    pub total_j: f64,
    pub gpu_samples: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl From<&EnergyReport> for ReportRow {
    fn from(report: &EnergyReport) -> Self {
        let energy = &report.energy;
        ReportRow {
            label: report.session.label.clone(),
            include_idle: report.session.include_idle,
            started_at: report.session.started_at,
            duration_s: report.session.duration_s,
            cpu_j: energy.cpu.iter().sum(),
            dram_j: energy.dram.iter().sum(),
            gpu_j: energy.gpu,
            disk_j: energy.disk,
            total_j: energy.total.unwrap_or_else(|| energy.sum()),
            gpu_samples: report.gpu_samples,
            bytes_read: report.io.bytes_read,
            bytes_written: report.io.bytes_written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rail_delta_without_wrap() {
        let start = RailCounter::new(1_000, u32::MAX as u64);
        let end = RailCounter::new(5_001_000, u32::MAX as u64);
        assert_eq!(start.delta_uj(&end), 5_000_000);
    }

    #[test]
    fn rail_delta_handles_wrap_around() {
        let start = RailCounter::new(990, 1_000);
        let end = RailCounter::new(15, 1_000);
        assert_eq!(start.delta_uj(&end), 25);
    }

    #[test]
    fn total_bytes_saturates() {
        let io = IoTotals {
            bytes_read: u64::MAX,
            bytes_written: 1,
        };
        assert_eq!(io.total_bytes(), u64::MAX);
    }

    #[test]
    fn total_sums_every_socket() {
        let energy = ComponentEnergy {
            cpu: vec![1.0, 2.0],
            dram: vec![0.5, 0.5],
            gpu: 3.0,
            disk: 0.25,
            total: None,
        }
        .with_total();
        assert_eq!(energy.total, Some(7.25));
    }

    #[test]
    fn total_is_omitted_from_json_when_absent() {
        let energy = ComponentEnergy {
            cpu: vec![1.0],
            dram: vec![0.0],
            gpu: 0.0,
            disk: 0.0,
            total: None,
        };
        let json = serde_json::to_string(&energy).unwrap();
        assert!(!json.contains("total"));
    }
}
