use criterion::{black_box, criterion_group, criterion_main, Criterion};
use energymeter::{estimate, trace::parse_report, DiskProfile, IoTotals, PowerSample, ProcessFilter};

const SAMPLES: usize = 7200;
const PROCESSES: usize = 512;

pub fn b(c: &mut Criterion) {
    // an hour of samples at the default interval
    let samples: Vec<PowerSample> = (0..SAMPLES)
        .map(|i| PowerSample::new(60.0 + (i % 40) as f64, (i % 3) as f64))
        .collect();
    c.bench_function("gpu_joules", |b| {
        b.iter(|| estimate::gpu_joules(black_box(&samples), 3600.0, 0.5, false));
    });

    let disk = DiskProfile {
        avg_speed: 1.6e9,
        active_power: 6.0,
        idle_power: 1.42,
    };
    let io = IoTotals {
        bytes_read: 1 << 30,
        bytes_written: 1 << 28,
    };
    c.bench_function("disk_joules", |b| {
        b.iter(|| estimate::disk_joules(black_box(&io), &disk, 3600.0, true));
    });

    let counts: Vec<String> = (0..PROCESSES)
        .map(|i| format!("\"proc-{}\": {}", i, i * 4096))
        .collect();
    let report = format!(
        "{{\"type\": \"map\", \"data\": {{\"@rbytes\": {{{}}}}}}}\n\
         {{\"type\": \"map\", \"data\": {{\"@wbytes\": {{{}}}}}}}\n",
        counts.join(", "),
        counts.join(", ")
    );
    let filter = ProcessFilter::new(["proc-1", "proc-42", "proc-511"]);
    c.bench_function("parse_report", |b| {
        b.iter(|| parse_report(black_box(&report), &filter));
    });
}

criterion_group!(benches, b);
criterion_main!(benches);
