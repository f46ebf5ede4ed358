//! Background GPU power sampling.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, SyncSender},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    config::{GpuBackendKind, ProcessFilter},
    models::{Component, PowerSample},
    MeterError, Result,
};

mod nvml;
mod smi;
pub use nvml::*;
pub use smi::*;

// measurement thread
pub(crate) const THREAD_KILL: i8 = 1;

/// Instantaneous GPU state.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GpuReading {
    pub power_watts: f64,
    /// Utilisation of the measured processes, in percent.
    pub activity: f64,
}

/// A source of GPU power and per-process utilisation readings.
pub trait GpuBackend: Send {
    fn name(&self) -> String;
    fn query(&mut self, filter: &ProcessFilter) -> Result<GpuReading>;
}

/// Builds the configured backend. `Ok(None)` when GPU sampling is disabled.
pub fn gpu_backend(kind: GpuBackendKind, index: u32) -> Result<Option<Box<dyn GpuBackend>>> {
    match kind {
        GpuBackendKind::None => Ok(None),
        GpuBackendKind::Nvml => Ok(Some(Box::new(NvmlBackend::new(index)?))),
        GpuBackendKind::NvidiaSmi => Ok(Some(Box::new(NvidiaSmi::new(index)?))),
    }
}

enum SamplerState {
    Ready(Option<Box<dyn GpuBackend>>),
    Running {
        tx: SyncSender<i8>,
        thr: JoinHandle<Vec<PowerSample>>,
    },
    Stopped,
}

/// Polls a [`GpuBackend`] on its own thread at a fixed cadence.
///
/// The thread owns the samples and hands them back on [`PollingSampler::join`].
pub struct PollingSampler {
    state: SamplerState,
    filter: ProcessFilter,
    interval: Duration,
}

impl PollingSampler {
    /// A sampler without backend records nothing.
    pub fn new(
        backend: Option<Box<dyn GpuBackend>>,
        filter: ProcessFilter,
        interval: Duration,
    ) -> Self {
        Self {
            state: SamplerState::Ready(backend),
            filter,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SamplerState::Running { .. })
    }

    /// Spawns the sampling thread. Only the first call has an effect.
    pub fn start(&mut self) -> Result<()> {
        let backend = match &mut self.state {
            SamplerState::Ready(backend) => backend.take(),
            _ => {
                log::warn!("GPU sampler already started, ignore it");
                return Ok(());
            }
        };

        let Some(backend) = backend else {
            self.state = SamplerState::Stopped;
            return Ok(());
        };

        let (tx, rx) = std::sync::mpsc::sync_channel::<i8>(1);
        let filter = self.filter.clone();
        let interval = self.interval;
        let thr = std::thread::Builder::new()
            .name("gpu-sampler".to_string())
            .spawn(move || sampling_loop(backend, filter, interval, rx))?;

        self.state = SamplerState::Running { tx, thr };
        Ok(())
    }

    /// Asks the thread to exit after its current iteration. Does not block.
    pub fn request_stop(&self) {
        if let SamplerState::Running { tx, .. } = &self.state {
            // a full channel already holds a kill message
            let _ = tx.try_send(THREAD_KILL);
        }
    }

    /// Stops the thread if needed and returns every recorded sample.
    pub fn join(&mut self) -> Result<Vec<PowerSample>> {
        match std::mem::replace(&mut self.state, SamplerState::Stopped) {
            SamplerState::Running { tx, thr } => {
                let _ = tx.try_send(THREAD_KILL);
                drop(tx);
                thr.join().map_err(|_| {
                    MeterError::unavailable(Component::Gpu, "sampler thread panicked")
                })
            }
            SamplerState::Ready(_) | SamplerState::Stopped => Ok(vec![]),
        }
    }
}

impl Drop for PollingSampler {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.join();
        }
    }
}

fn sampling_loop(
    mut backend: Box<dyn GpuBackend>,
    filter: ProcessFilter,
    interval: Duration,
    recv: Receiver<i8>,
) -> Vec<PowerSample> {
    let mut samples = vec![];
    let mut failures = 0usize;
    log::debug!("GPU sampler `{}` started", backend.name());

    loop {
        let now = Instant::now();
        match backend.query(&filter) {
            Ok(reading) => samples.push(PowerSample::new(reading.power_watts, reading.activity)),
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    log::warn!("GPU query on `{}` failed: {}", backend.name(), e);
                } else {
                    log::debug!("GPU query on `{}` failed: {}", backend.name(), e);
                }
            }
        }

        match recv.recv_timeout(interval.saturating_sub(now.elapsed())) {
            Ok(msg) if msg == THREAD_KILL => break,
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!(
        "GPU sampler `{}` stopped with {} sample(s), {} failed quer(ies)",
        backend.name(),
        samples.len(),
        failures
    );
    samples
}
