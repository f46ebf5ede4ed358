//! Disk I/O attribution through an external syscall tracer.

use std::{
    collections::BTreeMap,
    io::{self, Read},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, Stdio},
};

use serde::Deserialize;

use crate::{
    config::{ProcessFilter, TraceCommand},
    models::IoTotals,
    MeterError, Result,
};

pub const READ_BYTES_MAP: &str = "@rbytes";
pub const WRITE_BYTES_MAP: &str = "@wbytes";

#[derive(Debug, Deserialize)]
struct TraceRecord {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// Launches the tracer in its own process group and collects its report.
pub struct TraceCollector {
    command: TraceCommand,
    signal: i32,
    child: Option<Child>,
    signalled: bool,
}

impl TraceCollector {
    pub fn new(command: TraceCommand, signal: i32) -> Self {
        Self {
            command,
            signal,
            child: None,
            signalled: false,
        }
    }

    /// Process group of the running tracer.
    pub fn pgid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.id() as i32)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            throw_err!(BackendProcess, "trace process already running");
        }

        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // new group, signalled apart from the caller's process tree
            .process_group(0)
            .spawn()
            .map_err(|e| {
                new_err!(
                    BackendProcess,
                    "failed to launch `{}`: {}",
                    self.command.program,
                    e
                )
            })?;

        log::info!(
            "Trace process `{}` started (pgid {})",
            self.command.program,
            child.id()
        );
        self.child = Some(child);
        self.signalled = false;
        Ok(())
    }

    /// Asks the tracer to print its report and exit. Does not wait.
    pub fn request_stop(&mut self) -> Result<()> {
        let Some(pgid) = self.pgid() else {
            throw_err!(BackendProcess, "trace process not running");
        };
        if self.signalled {
            return Ok(());
        }

        let ret = unsafe { libc::killpg(pgid, self.signal) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            // the tracer is already gone, its output is still in the pipe
            if err.raw_os_error() != Some(libc::ESRCH) {
                throw_err!(
                    BackendProcess,
                    "failed to signal trace process group {}: {}",
                    pgid,
                    err
                );
            }
            log::warn!("Trace process group {} exited before it was signalled", pgid);
        }
        self.signalled = true;
        Ok(())
    }

    /// Reads the tracer's output to the end and reaps it.
    pub fn collect(&mut self) -> Result<String> {
        self.request_stop()?;
        let Some(mut child) = self.child.take() else {
            throw_err!(BackendProcess, "trace process not running");
        };

        let mut output = vec![];
        let read = match child.stdout.take() {
            Some(mut stdout) => stdout.read_to_end(&mut output).map(|_| ()),
            None => Ok(()),
        };
        // reaped even when the pipe failed
        let status = child.wait()?;
        read?;
        log::debug!("Trace process exited with {}", status);

        let ok = status.success() || status.signal() == Some(self.signal);
        if !ok && output.iter().all(u8::is_ascii_whitespace) {
            throw_err!(
                BackendProcess,
                "trace process `{}` failed with {}",
                self.command.program,
                status
            );
        }
        if !ok {
            log::warn!("Trace process exited with {}, parsing its output anyway", status);
        }
        String::from_utf8(output)
            .map_err(|e| new_err!(TraceParse, "trace output is not UTF-8: {}", e))
    }

    /// Signals and reaps a tracer still running, ignoring failures. A group
    /// that cannot be signalled is killed.
    pub fn abort(&mut self) {
        if self.child.is_none() {
            return;
        }
        if let Err(e) = self.collect() {
            ignore_err!(e);
        }
        if let Some(mut child) = self.child.take() {
            let pgid = child.id() as i32;
            log::warn!("Killing trace process group {}", pgid);
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
                if let Err(e) = child.kill() {
                    log::warn!("Failed to kill trace process {}: {}", pgid, e);
                }
            }
            if let Err(e) = child.wait() {
                log::warn!("Failed to reap trace process {}: {}", pgid, e);
            }
        }
    }
}

impl Drop for TraceCollector {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Parses the tracer's line-delimited JSON report.
///
/// Blank output means no I/O. Non-blank output must hold at least one of the
/// read or write byte maps.
pub fn parse_report(output: &str, filter: &ProcessFilter) -> Result<IoTotals> {
    if output.trim().is_empty() {
        return Ok(IoTotals::default());
    }

    let mut rbytes = None;
    let mut wbytes = None;
    for (lineno, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: TraceRecord = serde_json::from_str(line)
            .map_err(|e| new_err!(TraceParse, "line {}: {}", lineno + 1, e))?;
        if record.kind != "map" {
            continue;
        }

        let serde_json::Value::Object(maps) = record.data else {
            throw_err!(TraceParse, "line {}: map data is not an object", lineno + 1);
        };
        for (name, counts) in maps {
            let slot = match name.as_str() {
                READ_BYTES_MAP => &mut rbytes,
                WRITE_BYTES_MAP => &mut wbytes,
                _ => continue,
            };
            let counts: BTreeMap<String, u64> = serde_json::from_value(counts)
                .map_err(|e| new_err!(TraceParse, "line {}: map `{}`: {}", lineno + 1, name, e))?;
            *slot = Some(attributed_bytes(&counts, filter));
        }
    }

    if rbytes.is_none() && wbytes.is_none() {
        return Err(MeterError::TraceParse(format!(
            "report has neither `{}` nor `{}`",
            READ_BYTES_MAP, WRITE_BYTES_MAP
        )));
    }

    Ok(IoTotals {
        bytes_read: rbytes.unwrap_or(0),
        bytes_written: wbytes.unwrap_or(0),
    })
}

fn attributed_bytes(counts: &BTreeMap<String, u64>, filter: &ProcessFilter) -> u64 {
    counts
        .iter()
        .filter(|(comm, _)| filter.matches(comm))
        .fold(0u64, |acc, (_, n)| acc.saturating_add(*n))
}
