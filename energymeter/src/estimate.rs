//! Closed-form energy models, one per component.
//!
//! All functions are pure: the same captured inputs always give the same
//! joules.

use crate::{
    config::DiskProfile,
    models::{ComponentEnergy, IoTotals, PowerSample},
};

/// RAPL counters report microjoules.
pub const MICROJOULE: f64 = 1e-6;

/// Converts per-socket counter deltas to joules.
pub fn counter_joules(delta_uj: &[u64]) -> Vec<f64> {
    delta_uj.iter().map(|uj| *uj as f64 * MICROJOULE).collect()
}

/// Seconds the disk spent transferring `io` at the profile's average speed.
pub fn disk_active_time(io: &IoTotals, disk: &DiskProfile) -> f64 {
    io.total_bytes() as f64 / disk.avg_speed
}

/// Disk energy over a session of `duration_s` seconds.
///
/// `active = bytes / avg_speed`, `idle = duration - active`. The idle term is
/// only counted with `include_idle`. Idle time is not clamped: when the
/// transferred bytes imply more time than the session lasted, it is negative.
pub fn disk_joules(io: &IoTotals, disk: &DiskProfile, duration_s: f64, include_idle: bool) -> f64 {
    let active = disk_active_time(io, disk);
    let mut energy = active * disk.active_power;
    if include_idle {
        let idle = duration_s - active;
        energy += idle * disk.idle_power;
    }
    energy
}

fn mean_power<'a, I: Iterator<Item = &'a PowerSample>>(samples: I) -> Option<f64> {
    let (sum, n) = samples.fold((0.0, 0usize), |(sum, n), s| (sum + s.power_watts, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// GPU energy from polled power samples.
///
/// With `include_idle` the mean of every sample spans the whole session.
/// Otherwise only samples where the measured processes were active count, and
/// they span `min(duration, active_samples * interval)`. The error of that
/// estimate is bounded to about `(duration - 2 * interval, duration + interval)`.
pub fn gpu_joules(
    samples: &[PowerSample],
    duration_s: f64,
    interval_s: f64,
    include_idle: bool,
) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    if include_idle {
        return mean_power(samples.iter()).unwrap_or(0.0) * duration_s;
    }

    let active = || samples.iter().filter(|s| s.is_active());
    match mean_power(active()) {
        Some(mean) => {
            let span = active().count() as f64 * interval_s;
            mean * duration_s.min(span)
        }
        None => 0.0,
    }
}

/// Sum over every socket and component.
pub fn total_joules(energy: &ComponentEnergy) -> f64 {
    energy.sum()
}
