use std::{collections::VecDeque, path::Path, time::Duration};

use energymeter::{
    counter::CounterSource,
    models::{CounterSnapshot, RailCounter},
    sampler::{GpuBackend, GpuReading},
    Component, EnergyMeter, MeterConfig, MeterError, Phase, ProcessFilter, Result, TraceCommand,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

/// Replays scripted snapshots, one per call.
struct ScriptedCounters {
    snapshots: VecDeque<CounterSnapshot>,
}

impl ScriptedCounters {
    fn boxed(snapshots: Vec<CounterSnapshot>) -> Box<dyn CounterSource> {
        Box::new(Self {
            snapshots: snapshots.into(),
        })
    }
}

impl CounterSource for ScriptedCounters {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    fn snapshot(&mut self) -> Result<CounterSnapshot> {
        self.snapshots
            .pop_front()
            .ok_or_else(|| MeterError::unavailable(Component::Cpu, "script exhausted"))
    }
}

fn snapshot(secs: u64, package: &[u64], dram: &[u64]) -> CounterSnapshot {
    let rail = |values: &[u64]| -> Option<Vec<RailCounter>> {
        Some(
            values
                .iter()
                .map(|uj| RailCounter::new(*uj, u32::MAX as u64))
                .collect(),
        )
    };
    CounterSnapshot {
        elapsed: Duration::from_secs(secs),
        package: rail(package),
        dram: rail(dram),
    }
}

/// Two sockets, 10 s apart: 5 J + 3 J on the packages, 1 J + 1 J on DRAM.
fn two_sockets() -> Box<dyn CounterSource> {
    ScriptedCounters::boxed(vec![
        snapshot(100, &[1_000_000, 2_000_000], &[0, 500_000]),
        snapshot(110, &[6_000_000, 5_000_000], &[1_000_000, 1_500_000]),
    ])
}

struct SteadyGpu {
    reading: GpuReading,
}

impl GpuBackend for SteadyGpu {
    fn name(&self) -> String {
        "steady".to_string()
    }

    fn query(&mut self, _filter: &ProcessFilter) -> Result<GpuReading> {
        Ok(self.reading)
    }
}

fn steady_gpu(power_watts: f64, activity: f64) -> Option<Box<dyn GpuBackend>> {
    Some(Box::new(SteadyGpu {
        reading: GpuReading {
            power_watts,
            activity,
        },
    }))
}

/// A tracer printing `report` once it is signalled.
fn tracer_printing(report: &Path) -> TraceCommand {
    let script = format!(
        "trap 'cat {}; exit 0' TERM\nwhile :; do sleep 0.02; done",
        report.display()
    );
    TraceCommand::new("sh", vec!["-c".to_string(), script])
}

fn silent_tracer() -> TraceCommand {
    TraceCommand::new("true", vec![])
}

fn config(trace: TraceCommand) -> MeterConfig {
    MeterConfig::new(1.6e9, 6.0, 1.42)
        .with_label("integration")
        .with_sampling_interval(Duration::from_millis(10))
        .with_process_names(ProcessFilter::new(["worker"]))
        .with_trace_command(trace)
}

fn io_report(dir: &Path, rbytes: u64, wbytes: u64) -> std::path::PathBuf {
    let path = dir.join("report.json");
    let body = format!(
        "{{\"type\": \"attached_probes\", \"data\": {{\"probes\": 2}}}}\n\
         {{\"type\": \"map\", \"data\": {{\"@rbytes\": {{\"worker\": {}, \"sshd\": 77}}}}}}\n\
         {{\"type\": \"map\", \"data\": {{\"@wbytes\": {{\"worker\": {}}}}}}}\n",
        rbytes, wbytes
    );
    std::fs::write(&path, body).unwrap();
    path
}

fn settle() {
    // gives the tracer time to install its trap
    std::thread::sleep(Duration::from_millis(150));
}

#[test]
fn cpu_dram_and_disk_energy() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let report = io_report(dir.path(), 1_000_000_000, 600_000_000);
    let mut meter =
        EnergyMeter::with_sources(config(tracer_printing(&report)), two_sockets(), None).unwrap();

    meter.measure(settle).unwrap();

    assert_eq!(meter.phase(), Phase::Ended);
    assert!(close(meter.session().unwrap().duration_s, 10.0));
    let cpu = meter.total_joules_cpu().unwrap();
    assert_eq!(cpu.len(), 2);
    assert!(close(cpu[0], 5.0) && close(cpu[1], 3.0));
    let dram = meter.total_joules_dram().unwrap();
    assert!(close(dram[0], 1.0) && close(dram[1], 1.0));
    assert_eq!(meter.total_joules_gpu().unwrap(), 0.0);

    let io = meter.io_totals().unwrap();
    assert_eq!((io.bytes_read, io.bytes_written), (1_000_000_000, 600_000_000));
    // 1 s of transfer at 6 W
    assert!(close(meter.total_joules_disk().unwrap(), 6.0));

    let energy = meter.component_energy(true).unwrap();
    assert!(close(energy.total.unwrap(), 16.0));
    assert!(meter.component_energy(false).unwrap().total.is_none());
    assert!(meter.warnings().is_empty());
}

#[test]
fn disk_idle_time_is_counted_on_request() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let report = io_report(dir.path(), 1_600_000_000, 0);
    let mut meter = EnergyMeter::with_sources(
        config(tracer_printing(&report)).include_idle(true),
        two_sockets(),
        None,
    )
    .unwrap();

    meter.measure(settle).unwrap();
    // 1 s active at 6 W, 9 s idle at 1.42 W
    assert!(close(meter.total_joules_disk().unwrap(), 6.0 + 9.0 * 1.42));
}

#[test]
fn no_io_means_no_active_disk_energy() {
    init();
    let mut meter =
        EnergyMeter::with_sources(config(silent_tracer()), two_sockets(), None).unwrap();
    meter.measure(|| ()).unwrap();
    assert_eq!(meter.io_totals().unwrap().total_bytes(), 0);
    assert_eq!(meter.total_joules_disk().unwrap(), 0.0);

    let mut meter = EnergyMeter::with_sources(
        config(silent_tracer()).include_idle(true),
        two_sockets(),
        None,
    )
    .unwrap();
    meter.measure(|| ()).unwrap();
    assert!(close(meter.total_joules_disk().unwrap(), 10.0 * 1.42));
}

#[test]
fn gpu_energy_spans_active_samples() {
    init();
    let mut meter = EnergyMeter::with_sources(
        config(silent_tracer()),
        two_sockets(),
        steady_gpu(100.0, 12.0),
    )
    .unwrap();
    meter
        .measure(|| std::thread::sleep(Duration::from_millis(80)))
        .unwrap();

    let samples = meter.samples().unwrap();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.is_active()));
    let span = (samples.len() as f64 * 0.01).min(10.0);
    assert!(close(meter.total_joules_gpu().unwrap(), 100.0 * span));
    assert_eq!(meter.report().unwrap().gpu_samples, samples.len());
}

#[test]
fn idle_gpu_reads_zero_unless_idle_is_included() {
    init();
    let mut meter = EnergyMeter::with_sources(
        config(silent_tracer()),
        two_sockets(),
        steady_gpu(60.0, 0.0),
    )
    .unwrap();
    meter
        .measure(|| std::thread::sleep(Duration::from_millis(40)))
        .unwrap();
    assert_eq!(meter.total_joules_gpu().unwrap(), 0.0);

    let mut meter = EnergyMeter::with_sources(
        config(silent_tracer()).include_idle(true),
        two_sockets(),
        steady_gpu(60.0, 0.0),
    )
    .unwrap();
    meter
        .measure(|| std::thread::sleep(Duration::from_millis(40)))
        .unwrap();
    // mean power over the whole 10 s session
    assert!(close(meter.total_joules_gpu().unwrap(), 600.0));
}

#[test]
fn lifecycle_is_enforced() {
    init();
    let mut meter =
        EnergyMeter::with_sources(config(silent_tracer()), two_sockets(), None).unwrap();

    assert!(matches!(meter.end(), Err(MeterError::InvalidState(_))));
    assert_eq!(meter.phase(), Phase::Idle);
    assert!(matches!(meter.total_joules_cpu(), Err(MeterError::NotReady(_))));

    meter.begin().unwrap();
    assert!(matches!(meter.begin(), Err(MeterError::InvalidState(_))));
    assert!(matches!(meter.total_joules_disk(), Err(MeterError::NotReady(_))));
    assert_eq!(meter.phase(), Phase::Measuring);

    meter.end().unwrap();
    assert!(matches!(meter.end(), Err(MeterError::InvalidState(_))));
    assert!(matches!(meter.begin(), Err(MeterError::InvalidState(_))));
    assert_eq!(meter.phase(), Phase::Ended);
}

#[test]
fn accessors_are_idempotent() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let report = io_report(dir.path(), 5_000, 3_000);
    let mut meter = EnergyMeter::with_sources(
        config(tracer_printing(&report)).include_idle(true),
        two_sockets(),
        steady_gpu(90.0, 3.0),
    )
    .unwrap();
    meter.measure(settle).unwrap();

    let first = meter.report().unwrap();
    for _ in 0..3 {
        assert_eq!(meter.report().unwrap(), first);
        assert_eq!(meter.total_joules_gpu().unwrap(), first.energy.gpu);
        assert_eq!(meter.total_joules_disk().unwrap(), first.energy.disk);
    }
    let energy = &first.energy;
    let sum: f64 = energy.cpu.iter().chain(&energy.dram).sum::<f64>() + energy.gpu + energy.disk;
    assert!(close(energy.total.unwrap(), sum));
}

#[test]
fn absent_rails_read_zero_with_warnings() {
    init();
    let bare = ScriptedCounters::boxed(vec![
        CounterSnapshot {
            elapsed: Duration::from_secs(1),
            package: Some(vec![RailCounter::new(0, 1_000)]),
            dram: None,
        },
        CounterSnapshot {
            elapsed: Duration::from_secs(3),
            package: Some(vec![RailCounter::new(400, 1_000)]),
            dram: None,
        },
    ]);
    let mut meter = EnergyMeter::with_sources(config(silent_tracer()), bare, None).unwrap();
    meter.measure(|| ()).unwrap();

    assert_eq!(meter.total_joules_dram().unwrap(), vec![0.0]);
    assert!(close(meter.total_joules_cpu().unwrap()[0], 0.0004));
    assert!(meter.warnings().iter().any(|w| matches!(
        w,
        MeterError::BackendUnavailable {
            component: Component::Dram,
            ..
        }
    )));
}

#[test]
fn wrapped_counter_still_counts_forward() {
    init();
    let counters = ScriptedCounters::boxed(vec![
        CounterSnapshot {
            elapsed: Duration::from_secs(0),
            package: Some(vec![RailCounter::new(9_000_000, 10_000_000)]),
            dram: Some(vec![RailCounter::new(0, 10_000_000)]),
        },
        CounterSnapshot {
            elapsed: Duration::from_secs(2),
            package: Some(vec![RailCounter::new(1_000_000, 10_000_000)]),
            dram: Some(vec![RailCounter::new(0, 10_000_000)]),
        },
    ]);
    let mut meter = EnergyMeter::with_sources(config(silent_tracer()), counters, None).unwrap();
    meter.measure(|| ()).unwrap();
    assert!(close(meter.total_joules_cpu().unwrap()[0], 2.0));
}

#[test]
fn unreadable_trace_report_fails_disk_only() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("garbage.txt");
    std::fs::write(&report, "Attaching 2 probes...\n").unwrap();
    let mut meter =
        EnergyMeter::with_sources(config(tracer_printing(&report)), two_sockets(), None).unwrap();

    meter.begin().unwrap();
    settle();
    assert!(matches!(meter.end(), Err(MeterError::TraceParse(_))));
    assert_eq!(meter.phase(), Phase::Ended);
    assert!(matches!(
        meter.total_joules_disk(),
        Err(MeterError::TraceParse(_))
    ));
    assert!(matches!(meter.report(), Err(MeterError::TraceParse(_))));
    assert!(close(meter.total_joules_cpu().unwrap()[0], 5.0));
}

#[test]
fn binary_trace_report_is_a_parse_error() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("binary.out");
    std::fs::write(&report, b"\xff\xfegarbage").unwrap();
    let mut meter =
        EnergyMeter::with_sources(config(tracer_printing(&report)), two_sockets(), None).unwrap();

    meter.begin().unwrap();
    settle();
    assert!(matches!(meter.end(), Err(MeterError::TraceParse(_))));
    assert!(matches!(
        meter.io_totals(),
        Err(MeterError::TraceParse(_))
    ));
}

#[test]
fn out_of_range_trace_signal_is_rejected() {
    init();
    assert!(matches!(
        EnergyMeter::with_sources(
            config(silent_tracer()).with_trace_signal(999),
            two_sockets(),
            None
        ),
        Err(MeterError::Configuration(_))
    ));
}

#[test]
fn missing_tracer_keeps_the_meter_idle() {
    init();
    let mut meter = EnergyMeter::with_sources(
        config(TraceCommand::new("/nonexistent/tracer", vec![])),
        two_sockets(),
        steady_gpu(50.0, 1.0),
    )
    .unwrap();
    assert!(matches!(meter.begin(), Err(MeterError::BackendProcess(_))));
    assert_eq!(meter.phase(), Phase::Idle);
}

#[test]
fn measure_returns_the_workload_value() {
    init();
    let mut meter =
        EnergyMeter::with_sources(config(silent_tracer()), two_sockets(), None).unwrap();
    let answer = meter.measure(|| 6 * 7).unwrap();
    assert_eq!(answer, 42);
    assert_eq!(meter.session().unwrap().label, "integration");
}

#[test]
fn dropping_mid_session_releases_sources() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let report = io_report(dir.path(), 1, 1);
    let mut meter = EnergyMeter::with_sources(
        config(tracer_printing(&report)),
        two_sockets(),
        steady_gpu(10.0, 1.0),
    )
    .unwrap();
    meter.begin().unwrap();
    let started = std::time::Instant::now();
    drop(meter);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn invalid_configuration_is_rejected() {
    init();
    let bad = MeterConfig::new(0.0, 6.0, 1.42).with_trace_command(silent_tracer());
    assert!(matches!(
        EnergyMeter::with_sources(bad, two_sockets(), None),
        Err(MeterError::Configuration(_))
    ));
}
