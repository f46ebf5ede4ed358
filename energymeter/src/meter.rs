use std::{
    fmt::Display,
    time::{Instant, SystemTime},
};

use crate::{
    config::MeterConfig,
    counter::{default_counter_source, CounterSource},
    estimate,
    models::{
        Component, ComponentEnergy, CounterSnapshot, EnergyReport, IoTotals, PowerSample,
        RailCounter, Session,
    },
    sampler::{gpu_backend, GpuBackend, PollingSampler},
    trace::{parse_report, TraceCollector},
    MeterError, Result,
};

/// Lifecycle phase of an [`EnergyMeter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Measuring,
    Ended,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Measuring => write!(f, "measuring"),
            Phase::Ended => write!(f, "ended"),
        }
    }
}

/// Why the disk figure of an ended session cannot be trusted.
#[derive(Debug, Clone)]
enum DiskFailure {
    Parse(String),
    Process(String),
}

impl DiskFailure {
    fn from_error(e: MeterError) -> Self {
        match e {
            MeterError::TraceParse(msg) => DiskFailure::Parse(msg),
            MeterError::BackendProcess(msg) => DiskFailure::Process(msg),
            other => DiskFailure::Process(other.to_string()),
        }
    }

    fn to_error(&self) -> MeterError {
        match self {
            DiskFailure::Parse(msg) => MeterError::TraceParse(msg.clone()),
            DiskFailure::Process(msg) => MeterError::BackendProcess(msg.clone()),
        }
    }
}

struct Running {
    begin: CounterSnapshot,
    started_at: SystemTime,
    started: Instant,
}

/// Everything captured by `end()`. Read-only afterwards.
struct Measurement {
    session: Session,
    cpu_uj: Option<Vec<u64>>,
    dram_uj: Option<Vec<u64>>,
    samples: Vec<PowerSample>,
    io: std::result::Result<IoTotals, DiskFailure>,
}

enum MeterState {
    Idle,
    Measuring(Running),
    Ended(Measurement),
}

impl MeterState {
    fn phase(&self) -> Phase {
        match self {
            MeterState::Idle => Phase::Idle,
            MeterState::Measuring(_) => Phase::Measuring,
            MeterState::Ended(_) => Phase::Ended,
        }
    }
}

/// Measures the energy used by CPU, DRAM, GPU and disk between `begin()` and
/// `end()`.
///
/// - CPU and DRAM: delta of the RAPL counters.
/// - GPU: power polled on a background thread, averaged over the samples
///   where the measured processes were active (or over all of them with
///   `include_idle`).
/// - Disk: bytes traced by an external process, turned into time and energy
///   with the configured [`crate::DiskProfile`].
///
/// A meter measures one session. Dropping it mid-session releases the
/// sampler thread and the trace process.
pub struct EnergyMeter {
    config: MeterConfig,
    counters: Box<dyn CounterSource>,
    sampler: PollingSampler,
    trace: TraceCollector,
    state: MeterState,
    warnings: Vec<MeterError>,
}

impl EnergyMeter {
    /// Builds a meter on the platform's default counter source and the
    /// configured GPU backend.
    pub fn new(config: MeterConfig) -> Result<Self> {
        config.validate()?;
        let mut warnings = vec![];
        let gpu = match gpu_backend(config.gpu, config.gpu_index) {
            Ok(gpu) => gpu,
            Err(e) if e.is_recoverable() => {
                log::warn!("{}. GPU energy will read zero", e);
                warnings.push(e);
                None
            }
            Err(e) => return Err(e),
        };
        let mut meter = Self::with_sources(config, default_counter_source(), gpu)?;
        meter.warnings.extend(warnings);
        Ok(meter)
    }

    /// Builds a meter on explicit backends.
    pub fn with_sources(
        config: MeterConfig,
        counters: Box<dyn CounterSource>,
        gpu: Option<Box<dyn GpuBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "Meter `{}`: counters `{}`, gpu `{}`",
            config.label,
            counters.name(),
            gpu.as_ref().map(|g| g.name()).unwrap_or_else(|| "none".to_string())
        );
        if config.process_names.is_empty() {
            log::warn!(
                "Meter `{}` has no process to attribute, GPU activity and disk I/O will read zero",
                config.label
            );
        } else {
            log::debug!(
                "Meter `{}` attributes {}",
                config.label,
                config.process_names.names().collect::<Vec<_>>().join(", ")
            );
        }
        let sampler = PollingSampler::new(
            gpu,
            config.process_names.clone(),
            config.sampling_interval(),
        );
        let trace = TraceCollector::new(config.trace.clone(), config.trace_signal);
        Ok(Self {
            config,
            counters,
            sampler,
            trace,
            state: MeterState::Idle,
            warnings: vec![],
        })
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Recoverable problems met so far: absent counter rails or GPU backend.
    pub fn warnings(&self) -> &[MeterError] {
        &self.warnings
    }

    /// Starts the counters, the trace process and the GPU sampler.
    pub fn begin(&mut self) -> Result<()> {
        if !matches!(self.state, MeterState::Idle) {
            throw_err!(
                InvalidState,
                "begin() called on meter `{}` while {}",
                self.config.label,
                self.phase()
            );
        }

        let started_at = SystemTime::now();
        let started = Instant::now();
        let begin = self.counters.snapshot()?;
        self.trace.start()?;
        if let Err(e) = self.sampler.start() {
            self.trace.abort();
            return Err(e);
        }

        self.state = MeterState::Measuring(Running {
            begin,
            started_at,
            started,
        });
        log::info!("Meter `{}` started", self.config.label);
        Ok(())
    }

    /// Stops every source and freezes the session.
    ///
    /// An unparsable trace report still ends the session: the error is
    /// returned here and again by [`EnergyMeter::total_joules_disk`].
    pub fn end(&mut self) -> Result<()> {
        let running = match std::mem::replace(&mut self.state, MeterState::Idle) {
            MeterState::Measuring(running) => running,
            other => {
                let phase = other.phase();
                self.state = other;
                throw_err!(
                    InvalidState,
                    "end() called on meter `{}` while {}",
                    self.config.label,
                    phase
                );
            }
        };

        let end_snapshot = self.counters.snapshot();
        let ended_at = SystemTime::now();
        let wall = running.started.elapsed();

        let signalled = self.trace.request_stop();
        self.sampler.request_stop();
        let samples = match self.sampler.join() {
            Ok(samples) => samples,
            Err(e) => {
                log::warn!("{}. GPU energy will read zero", e);
                self.warnings.push(e);
                vec![]
            }
        };

        let io = match signalled.and_then(|_| self.trace.collect()) {
            Ok(output) => parse_report(&output, &self.config.process_names),
            Err(e) => {
                self.trace.abort();
                Err(e)
            }
        }
        .map_err(DiskFailure::from_error);

        let (duration, cpu_uj, dram_uj) = match end_snapshot {
            Ok(end) => (
                end.elapsed.saturating_sub(running.begin.elapsed),
                rail_delta(&running.begin.package, &end.package),
                rail_delta(&running.begin.dram, &end.dram),
            ),
            Err(e) => {
                log::warn!("Failed to read closing counters: {}", e);
                (wall, None, None)
            }
        };

        if cpu_uj.is_none() {
            self.warn(Component::Cpu, "RAPL did not record energy for the CPU package");
        }
        if dram_uj.is_none() {
            self.warn(Component::Dram, "RAPL did not record energy for DRAM");
        }

        let session = Session {
            label: self.config.label.clone(),
            include_idle: self.config.include_idle,
            started_at: epoch_secs(running.started_at),
            ended_at: epoch_secs(ended_at),
            duration_s: duration.as_secs_f64(),
        };

        if let Ok(io) = &io {
            let active = estimate::disk_active_time(io, &self.config.disk);
            if active > session.duration_s {
                log::warn!(
                    "Traced I/O implies {:.3}s of disk activity in a {:.3}s session, idle time is negative",
                    active,
                    session.duration_s
                );
            }
        }

        log::info!(
            "Meter `{}` ended after {:.3}s with {} GPU sample(s)",
            session.label,
            session.duration_s,
            samples.len()
        );

        let failure = io.as_ref().err().map(DiskFailure::to_error);
        self.state = MeterState::Ended(Measurement {
            session,
            cpu_uj,
            dram_uj,
            samples,
            io,
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs `workload` between `begin()` and `end()`.
    pub fn measure<T, F: FnOnce() -> T>(&mut self, workload: F) -> Result<T> {
        self.begin()?;
        let out = workload();
        self.end()?;
        Ok(out)
    }

    fn warn(&mut self, component: Component, reason: &str) {
        let e = MeterError::unavailable(component, reason);
        log::warn!("{}", e);
        self.warnings.push(e);
    }

    fn measurement(&self) -> Result<&Measurement> {
        match &self.state {
            MeterState::Ended(m) => Ok(m),
            state => throw_err!(
                NotReady,
                "meter `{}` is {}, call end() first",
                self.config.label,
                state.phase()
            ),
        }
    }

    pub fn session(&self) -> Result<&Session> {
        Ok(&self.measurement()?.session)
    }

    /// GPU samples in collection order.
    pub fn samples(&self) -> Result<&[PowerSample]> {
        Ok(&self.measurement()?.samples)
    }

    pub fn io_totals(&self) -> Result<IoTotals> {
        self.measurement()?.io.clone().map_err(|f| f.to_error())
    }

    /// Joules per CPU package. `[0.0]` when the platform has no package counter.
    pub fn total_joules_cpu(&self) -> Result<Vec<f64>> {
        Ok(rail_joules(&self.measurement()?.cpu_uj))
    }

    /// Joules per DRAM rail. `[0.0]` when the platform has no DRAM counter.
    pub fn total_joules_dram(&self) -> Result<Vec<f64>> {
        Ok(rail_joules(&self.measurement()?.dram_uj))
    }

    pub fn total_joules_gpu(&self) -> Result<f64> {
        let m = self.measurement()?;
        Ok(estimate::gpu_joules(
            &m.samples,
            m.session.duration_s,
            self.sampler.interval().as_secs_f64(),
            self.config.include_idle,
        ))
    }

    pub fn total_joules_disk(&self) -> Result<f64> {
        let m = self.measurement()?;
        let io = m.io.as_ref().map_err(DiskFailure::to_error)?;
        Ok(estimate::disk_joules(
            io,
            &self.config.disk,
            m.session.duration_s,
            self.config.include_idle,
        ))
    }

    pub fn component_energy(&self, include_total: bool) -> Result<ComponentEnergy> {
        let energy = ComponentEnergy {
            cpu: self.total_joules_cpu()?,
            dram: self.total_joules_dram()?,
            gpu: self.total_joules_gpu()?,
            disk: self.total_joules_disk()?,
            total: None,
        };
        Ok(if include_total {
            energy.with_total()
        } else {
            energy
        })
    }

    pub fn report(&self) -> Result<EnergyReport> {
        let m = self.measurement()?;
        Ok(EnergyReport {
            session: m.session.clone(),
            energy: self.component_energy(true)?,
            gpu_samples: m.samples.len(),
            io: self.io_totals()?,
        })
    }
}

impl Drop for EnergyMeter {
    fn drop(&mut self) {
        if let MeterState::Measuring(_) = self.state {
            log::warn!(
                "Meter `{}` dropped while measuring, releasing its sources",
                self.config.label
            );
            self.sampler.request_stop();
            let _ = self.sampler.join();
            self.trace.abort();
        }
    }
}

fn rail_delta(
    begin: &Option<Vec<RailCounter>>,
    end: &Option<Vec<RailCounter>>,
) -> Option<Vec<u64>> {
    match (begin, end) {
        (Some(begin), Some(end)) if !begin.is_empty() && begin.len() == end.len() => Some(
            begin
                .iter()
                .zip(end)
                .map(|(b, e)| b.delta_uj(e))
                .collect(),
        ),
        _ => None,
    }
}

fn rail_joules(delta_uj: &Option<Vec<u64>>) -> Vec<f64> {
    match delta_uj {
        Some(delta) => estimate::counter_joules(delta),
        None => vec![0.0],
    }
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
