use std::process::Command;

use super::{GpuBackend, GpuReading};
use crate::{config::ProcessFilter, models::Component, MeterError, Result};

const NVIDIA_SMI: &str = "nvidia-smi";

/// Queries the GPU by running `nvidia-smi` twice per sample.
///
/// Much slower than NVML (tens of milliseconds per call) but needs nothing
/// beyond the driver's command-line tool.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
    index: u32,
}

impl NvidiaSmi {
    pub fn new(index: u32) -> Result<Self> {
        let smi = Self {
            program: NVIDIA_SMI.to_string(),
            index,
        };
        // probe once so a missing tool is reported at construction
        smi.power_draw()?;
        Ok(smi)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let index = self.index.to_string();
        let output = Command::new(&self.program)
            .args(args)
            .args(["-i", index.as_str()])
            .output()
            .map_err(|e| {
                MeterError::unavailable(
                    Component::Gpu,
                    format!("failed to run `{}`: {}", self.program, e),
                )
            })?;

        if !output.status.success() {
            return Err(MeterError::unavailable(
                Component::Gpu,
                format!(
                    "`{} {}` exited with {}: {}",
                    self.program,
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn power_draw(&self) -> Result<f64> {
        let out = self.run(&["--query-gpu=power.draw", "--format=csv,noheader,nounits"])?;
        parse_power_draw(&out)
    }
}

impl GpuBackend for NvidiaSmi {
    fn name(&self) -> String {
        format!("{}:{}", NVIDIA_SMI, self.index)
    }

    fn query(&mut self, filter: &ProcessFilter) -> Result<GpuReading> {
        let power_watts = self.power_draw()?;
        let pmon = self.run(&["pmon", "-c", "1"])?;
        Ok(GpuReading {
            power_watts,
            activity: parse_pmon(&pmon, filter),
        })
    }
}

/// Parses `--query-gpu=power.draw --format=csv,noheader,nounits` output.
pub fn parse_power_draw(output: &str) -> Result<f64> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| MeterError::unavailable(Component::Gpu, "empty power.draw output"))?;
    line.parse::<f64>().map_err(|_| {
        MeterError::unavailable(Component::Gpu, format!("power.draw not reported: `{}`", line))
    })
}

/// Sums the SM utilisation of `pmon` rows whose command matches `filter`.
///
/// The column layout is taken from the `# gpu pid type sm ...` header since
/// newer drivers add columns. Idle rows print `-`, counted as zero.
pub fn parse_pmon(output: &str, filter: &ProcessFilter) -> f64 {
    let mut sm_col = 3;
    let mut activity = 0.0;
    let mut header_seen = false;

    for line in output.lines() {
        let line = line.trim();
        if let Some(header) = line.strip_prefix('#') {
            if !header_seen {
                if let Some(i) = header.split_whitespace().position(|c| c == "sm") {
                    sm_col = i;
                }
                header_seen = true;
            }
            continue;
        }

        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() <= sm_col + 1 {
            continue;
        }
        let command = cols[cols.len() - 1];
        if !filter.matches(command) {
            continue;
        }
        if let Ok(sm) = cols[sm_col].parse::<f64>() {
            activity += sm;
        }
    }

    activity
}
