use crate::models::{EnergyReport, ReportRow};
use crate::Result;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Appends one row per report to a CSV file, writing the header only when
/// the file is created.
pub fn log_report<P: AsRef<Path>>(report: &EnergyReport, file_path: P) -> Result<()> {
    let file_path = file_path.as_ref();
    let exists = file_path.exists() && std::fs::metadata(file_path)?.len() > 0;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;

    let mut wtr = csv::WriterBuilder::default()
        .has_headers(!exists)
        .from_writer(file);
    wtr.serialize(ReportRow::from(report))?;
    wtr.flush()?;

    log::debug!(
        "Logged session `{}` to `{}`",
        report.session.label,
        file_path.display()
    );
    Ok(())
}

/// Writes a report as pretty-printed JSON, replacing the file.
pub fn dump_report<P: AsRef<Path>>(report: &EnergyReport, file_path: P) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(file_path.as_ref())?;
    let json = serde_json::to_string_pretty(report)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}
