// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Instant,
};

use super::CounterSource;
use crate::{
    models::{Component, CounterSnapshot, RailCounter},
    MeterError, Result,
};

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl:";

#[derive(Debug)]
struct Zone {
    path: PathBuf,
    max_energy_uj: u64,
}

impl Zone {
    fn open(path: PathBuf) -> Result<Self> {
        let max_energy_uj = read_uj(&path.join("max_energy_range_uj"))?;
        // energy_uj is root-only on recent kernels
        read_uj(&path.join("energy_uj"))?;
        Ok(Self {
            path,
            max_energy_uj,
        })
    }

    fn read(&self) -> Result<RailCounter> {
        Ok(RailCounter::new(
            read_uj(&self.path.join("energy_uj"))?,
            self.max_energy_uj,
        ))
    }
}

/// RAPL counters exposed by the Linux powercap framework.
///
/// `package-N` zones are CPU rails, their `dram` sub-zones are DRAM rails.
#[derive(Debug)]
pub struct PowercapSource {
    packages: Vec<Zone>,
    drams: Vec<Zone>,
    init: Instant,
}

impl PowercapSource {
    pub fn discover<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(MeterError::unavailable(
                Component::Cpu,
                format!("powercap root `{}` not found", root.display()),
            ));
        }

        let mut packages = vec![];
        let mut drams = vec![];
        for zone in zone_dirs(root)? {
            let name = zone_name(&zone)?;
            if name.starts_with("package") {
                for sub in zone_dirs(&zone)? {
                    if zone_name(&sub)? == "dram" {
                        drams.push(Zone::open(sub)?);
                    }
                }
                packages.push(Zone::open(zone)?);
            } else if name == "dram" {
                drams.push(Zone::open(zone)?);
            }
        }

        if packages.is_empty() && drams.is_empty() {
            return Err(MeterError::unavailable(
                Component::Cpu,
                format!("no RAPL zones under `{}`", root.display()),
            ));
        }

        log::debug!(
            "Powercap: {} package zone(s), {} dram zone(s)",
            packages.len(),
            drams.len()
        );
        Ok(Self {
            packages,
            drams,
            init: Instant::now(),
        })
    }
}

impl CounterSource for PowercapSource {
    fn name(&self) -> String {
        "powercap".to_string()
    }

    fn snapshot(&mut self) -> Result<CounterSnapshot> {
        let elapsed = self.init.elapsed();
        Ok(CounterSnapshot {
            elapsed,
            package: read_rails(&self.packages)?,
            dram: read_rails(&self.drams)?,
        })
    }
}

fn read_rails(zones: &[Zone]) -> Result<Option<Vec<RailCounter>>> {
    if zones.is_empty() {
        return Ok(None);
    }
    zones
        .iter()
        .map(Zone::read)
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// `intel-rapl:*` children of `dir`, sorted by path.
fn zone_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut zones = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_zone = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(POWER_ZONE_PREFIX))
            .unwrap_or(false);
        if is_zone && path.is_dir() {
            zones.push(path);
        }
    }
    zones.sort();
    Ok(zones)
}

fn zone_name(zone: &Path) -> Result<String> {
    Ok(fs::read_to_string(zone.join("name"))?.trim().to_owned())
}

fn read_uj(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path)?;
    raw.trim().parse::<u64>().map_err(|e| {
        MeterError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unreadable counter `{}`: {}", path.display(), e),
        ))
    })
}
