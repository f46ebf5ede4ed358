use std::{collections::BTreeSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Default time between two GPU samples.
pub const DEFAULT_SAMPLING_INTERVAL_SECS: f64 = 0.5;
pub const DEFAULT_LABEL: &str = "Meter";

/// Counts read and written bytes per command name. Maps are printed on exit.
pub const BPFTRACE_SCRIPT: &str = "tracepoint:syscalls:sys_enter_write {@wbytes[comm] = sum(args->count);} \
tracepoint:syscalls:sys_enter_read {@rbytes[comm] = sum(args->count);}";

// Longest command name the kernel reports (TASK_COMM_LEN - 1).
const COMM_LEN: usize = 15;

/// Characteristics of the disk the workload runs on, usually taken from the
/// disk's data sheet and a throughput benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskProfile {
    /// Average read/write throughput in bytes per second.
    pub avg_speed: f64,
    /// Watts drawn while transferring data.
    pub active_power: f64,
    /// Watts drawn while idle.
    pub idle_power: f64,
}

impl DiskProfile {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("avg_speed", self.avg_speed),
            ("active_power", self.active_power),
            ("idle_power", self.idle_power),
        ] {
            if !value.is_finite() || value <= 0.0 {
                throw_err!(
                    Configuration,
                    "disk {} must be a positive number, got {}",
                    name,
                    value
                );
            }
        }
        Ok(())
    }
}

/// Which GPU power backend the sampler polls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuBackendKind {
    /// Direct NVML library calls.
    #[default]
    Nvml,
    /// One `nvidia-smi` invocation per query. Slower, no library needed.
    NvidiaSmi,
    /// Do not sample the GPU.
    None,
}

/// The external tracer launched for each session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TraceCommand {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `sudo bpftrace -f json -e <script>`
    pub fn bpftrace() -> Self {
        Self::new(
            "sudo",
            vec![
                "bpftrace".to_string(),
                "-f".to_string(),
                "json".to_string(),
                "-e".to_string(),
                BPFTRACE_SCRIPT.to_string(),
            ],
        )
    }
}

impl Default for TraceCommand {
    fn default() -> Self {
        Self::bpftrace()
    }
}

/// Names of the processes whose GPU and disk activity is attributed to the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessFilter {
    names: BTreeSet<String>,
}

impl ProcessFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Filter matching the calling process only.
    pub fn current_process() -> Self {
        let comm = std::fs::read_to_string("/proc/self/comm")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            });
        match comm {
            Some(comm) => Self::new([comm]),
            None => {
                log::warn!("Failed to resolve the current process name, nothing will be attributed");
                Self::new(Vec::<String>::new())
            }
        }
    }

    pub fn insert<S: Into<String>>(&mut self, name: S) {
        self.names.insert(name.into());
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Accepts a bare command name or a path. Kernel command names are
    /// truncated, so a truncated name matches any configured name it prefixes.
    pub fn matches(&self, name: &str) -> bool {
        let base = name.rsplit('/').next().unwrap_or(name);
        if base.is_empty() {
            return false;
        }
        self.names
            .iter()
            .any(|n| n == base || (base.len() == COMM_LEN && n.starts_with(base)))
    }
}

impl Default for ProcessFilter {
    fn default() -> Self {
        Self::current_process()
    }
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_sampling_interval() -> f64 {
    DEFAULT_SAMPLING_INTERVAL_SECS
}

fn default_trace_signal() -> i32 {
    libc::SIGTERM
}

/// Construction parameters of an [`crate::EnergyMeter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    pub disk: DiskProfile,
    #[serde(default = "default_label")]
    pub label: String,
    /// Count idle-time energy for the disk and the GPU.
    #[serde(default)]
    pub include_idle: bool,
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_secs: f64,
    #[serde(default)]
    pub process_names: ProcessFilter,
    #[serde(default)]
    pub gpu: GpuBackendKind,
    #[serde(default)]
    pub gpu_index: u32,
    #[serde(default)]
    pub trace: TraceCommand,
    /// Signal asking the tracer to print its maps and exit.
    #[serde(default = "default_trace_signal")]
    pub trace_signal: i32,
}

impl MeterConfig {
    pub fn new(disk_avg_speed: f64, disk_active_power: f64, disk_idle_power: f64) -> Self {
        Self {
            disk: DiskProfile {
                avg_speed: disk_avg_speed,
                active_power: disk_active_power,
                idle_power: disk_idle_power,
            },
            label: default_label(),
            include_idle: false,
            sampling_interval_secs: DEFAULT_SAMPLING_INTERVAL_SECS,
            process_names: ProcessFilter::default(),
            gpu: GpuBackendKind::default(),
            gpu_index: 0,
            trace: TraceCommand::default(),
            trace_signal: default_trace_signal(),
        }
    }

    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }

    pub fn include_idle(mut self, include_idle: bool) -> Self {
        self.include_idle = include_idle;
        self
    }

    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_process_names(mut self, names: ProcessFilter) -> Self {
        self.process_names = names;
        self
    }

    pub fn with_gpu(mut self, gpu: GpuBackendKind, index: u32) -> Self {
        self.gpu = gpu;
        self.gpu_index = index;
        self
    }

    pub fn with_trace_command(mut self, trace: TraceCommand) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_trace_signal(mut self, signal: i32) -> Self {
        self.trace_signal = signal;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.disk.validate()?;
        if self.sampling_interval_secs <= 0.0
            || Duration::try_from_secs_f64(self.sampling_interval_secs).is_err()
        {
            throw_err!(
                Configuration,
                "sampling interval must be a positive number of seconds, got {}",
                self.sampling_interval_secs
            );
        }
        if self.trace.program.trim().is_empty() {
            throw_err!(Configuration, "trace program must not be empty");
        }
        if !(1..=libc::SIGRTMAX()).contains(&self.trace_signal) {
            throw_err!(Configuration, "invalid trace signal {}", self.trace_signal);
        }
        Ok(())
    }

    /// Falls back to the default interval on a configuration that does not
    /// validate.
    pub fn sampling_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.sampling_interval_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_SAMPLING_INTERVAL_SECS))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MeterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&data)
    }
}
