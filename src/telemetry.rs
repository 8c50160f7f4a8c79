//! Invocation event log.
//!
//! One JSON line per terminal request outcome, appended to an optional
//! size-rotated file and optionally mirrored to the `tracing` output.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::config::RotationConfig;

/// Append-only line writer rotating to `<path>.1 .. <path>.N` once the
/// active file reaches `max_bytes`.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.size().is_some_and(|len| len >= limit) {
                self.rotate()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn backup(&self, idx: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", idx));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let keep = self.rotation.keep;
        if keep > 0 {
            for idx in (1..keep).rev() {
                for suffix in ["", ".gz"] {
                    let from = with_suffix(&self.backup(idx), suffix);
                    if from.exists() {
                        fs::rename(&from, with_suffix(&self.backup(idx + 1), suffix))?;
                    }
                }
            }
            let first = self.backup(1);
            fs::rename(&self.path, &first)?;
            if self.rotation.compress {
                compress_in_place(&first)?;
            }
        }
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn compress_in_place(path: &Path) -> std::io::Result<()> {
    let data = fs::read(path)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&data)?;
    fs::write(with_suffix(path, ".gz"), gz.finish()?)?;
    fs::remove_file(path)
}

/// One line of the event log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent<'a> {
    pub schema_version: u8,
    pub ts: String,
    pub client_id: &'a str,
    pub stage: &'a str,
    pub outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'a str>,
    pub latency_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<&'a str>,
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: &InvocationEvent<'_>) {
        if let Some(target) = &self.writer {
            match serde_json::to_string(event) {
                Ok(line) => {
                    let mut guard = target.lock().unwrap_or_else(|e| e.into_inner());
                    match guard.write_line(&line) {
                        Ok(()) => {
                            self.lines_total.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to write invocation event");
                            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialise invocation event"),
            }
        }
        if self.log_stdout {
            tracing::info!(
                target: "telemetry",
                clientId = event.client_id,
                stage = event.stage,
                outcome = event.outcome,
                errorKind = ?event.error_kind,
                latencyMs = event.latency_ms as u64,
                s3Key = ?event.s3_key,
                "invocation event"
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}
