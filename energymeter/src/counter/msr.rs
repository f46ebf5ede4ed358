use std::{
    collections::BTreeMap,
    fs::File,
    os::unix::fs::FileExt,
    path::Path,
    time::Instant,
};

use super::CounterSource;
use crate::{
    models::{Component, CounterSnapshot, RailCounter},
    MeterError, Result,
};

const MSR_RAPL_POWER_UNIT: u64 = 0x606;
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;

const AMD_MSR_RAPL_POWER_UNIT: u64 = 0xC001_0299;
const AMD_MSR_PKG_ENERGY_STATUS: u64 = 0xC001_029B;

const ENERGY_STATUS_UNIT_MASK: u64 = 0x1F00;
const ENERGY_STATUS_UNIT_SHIFT: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

impl CpuVendor {
    pub fn detect() -> Option<Self> {
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        if cpuinfo.contains("GenuineIntel") {
            Some(CpuVendor::Intel)
        } else if cpuinfo.contains("AuthenticAMD") {
            Some(CpuVendor::Amd)
        } else {
            None
        }
    }

    fn power_unit_msr(&self) -> u64 {
        match self {
            CpuVendor::Intel => MSR_RAPL_POWER_UNIT,
            CpuVendor::Amd => AMD_MSR_RAPL_POWER_UNIT,
        }
    }

    fn pkg_energy_msr(&self) -> u64 {
        match self {
            CpuVendor::Intel => MSR_PKG_ENERGY_STATUS,
            CpuVendor::Amd => AMD_MSR_PKG_ENERGY_STATUS,
        }
    }

    /// AMD exposes no DRAM energy domain.
    fn dram_energy_msr(&self) -> Option<u64> {
        match self {
            CpuVendor::Intel => Some(MSR_DRAM_ENERGY_STATUS),
            CpuVendor::Amd => None,
        }
    }
}

/// Joules per counter increment, from the "Energy Status Units" field.
pub fn energy_unit(power_unit: u64) -> f64 {
    let raw = (power_unit & ENERGY_STATUS_UNIT_MASK) >> ENERGY_STATUS_UNIT_SHIFT;
    1.0 / (1u64 << raw) as f64
}

/// Converts a raw 32-bit energy status into microjoules.
pub fn raw_to_uj(raw: u64, unit: f64) -> u64 {
    ((raw & u32::MAX as u64) as f64 * unit * 1e6) as u64
}

struct MsrReader {
    core: u32,
    msr: File,
}

impl MsrReader {
    fn open(core: u32) -> Result<Self> {
        let path = format!("/dev/cpu/{}/msr", core);
        let msr = File::open(&path).map_err(|e| {
            MeterError::unavailable(Component::Cpu, format!("failed to open `{}`: {}", path, e))
        })?;
        Ok(Self { core, msr })
    }

    fn read(&self, which: u64) -> Result<u64> {
        let mut data = [0u8; 8];
        self.msr.read_exact_at(&mut data, which).map_err(|e| {
            MeterError::unavailable(
                Component::Cpu,
                format!("failed to read msr({}) at {:#x}: {}", self.core, which, e),
            )
        })?;
        Ok(u64::from_ne_bytes(data))
    }
}

struct Package {
    reader: MsrReader,
    unit: f64,
    has_dram: bool,
}

/// RAPL energy status registers read through the `msr` driver.
pub struct MsrSource {
    vendor: CpuVendor,
    packages: Vec<Package>,
    init: Instant,
}

impl MsrSource {
    pub fn open() -> Result<Self> {
        let vendor = CpuVendor::detect()
            .ok_or_else(|| MeterError::unavailable(Component::Cpu, "unsupported CPU vendor"))?;

        let mut packages = vec![];
        for (pkg, core) in first_core_of_packages(Path::new("/sys/devices/system/cpu"))? {
            let reader = MsrReader::open(core)?;
            let unit = energy_unit(reader.read(vendor.power_unit_msr())?);
            let has_dram = vendor
                .dram_energy_msr()
                .map(|which| reader.read(which).is_ok())
                .unwrap_or(false);
            log::debug!(
                "MSR: package {} on core {}, unit {} J, dram {}",
                pkg,
                core,
                unit,
                has_dram
            );
            packages.push(Package {
                reader,
                unit,
                has_dram,
            });
        }

        if packages.is_empty() {
            return Err(MeterError::unavailable(Component::Cpu, "no CPU package found"));
        }

        Ok(Self {
            vendor,
            packages,
            init: Instant::now(),
        })
    }

    fn read_rail(&self, package: &Package, which: u64) -> Result<RailCounter> {
        let raw = package.reader.read(which)?;
        Ok(RailCounter::new(
            raw_to_uj(raw, package.unit),
            raw_to_uj(u32::MAX as u64, package.unit),
        ))
    }
}

impl CounterSource for MsrSource {
    fn name(&self) -> String {
        "msr".to_string()
    }

    fn snapshot(&mut self) -> Result<CounterSnapshot> {
        let elapsed = self.init.elapsed();

        let package = self
            .packages
            .iter()
            .map(|p| self.read_rail(p, self.vendor.pkg_energy_msr()))
            .collect::<Result<Vec<_>>>()?;

        let dram = match self.vendor.dram_energy_msr() {
            Some(which) if self.packages.iter().all(|p| p.has_dram) => Some(
                self.packages
                    .iter()
                    .map(|p| self.read_rail(p, which))
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => None,
        };

        Ok(CounterSnapshot {
            elapsed,
            package: Some(package),
            dram,
        })
    }
}

/// Maps every physical package to its lowest-numbered logical cpu.
fn first_core_of_packages(cpu_root: &Path) -> Result<BTreeMap<u32, u32>> {
    let mut out = BTreeMap::new();
    for entry in std::fs::read_dir(cpu_root)? {
        let path = entry?.path();
        let Some(core) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("cpu"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(pkg) = std::fs::read_to_string(path.join("topology/physical_package_id")) else {
            continue;
        };
        let Ok(pkg) = pkg.trim().parse::<u32>() else {
            continue;
        };
        out.entry(pkg)
            .and_modify(|c: &mut u32| *c = (*c).min(core))
            .or_insert(core);
    }
    Ok(out)
}
