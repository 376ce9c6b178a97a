pub mod archive;
pub mod cancel;
pub mod convert;
pub mod download;
pub mod error;
pub mod exec;
pub mod export;
pub mod naming;
pub mod record;
pub mod resume;
pub mod sanitize;
pub mod validate;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use cancel::{CancellationToken, CancelledError};
pub use download::FetchOutcome;
pub use error::PipelineError;
pub use record::{MediaKind, MemoryRecord};

fn default_max_retries() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_backend_timeout_secs() -> u64 {
    300
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_min_payload_bytes() -> u64 {
    validate::MIN_MEDIA_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub output: PathBuf,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Normalize downloaded videos to H.264.
    #[serde(default = "default_true")]
    pub convert_videos: bool,
    /// Probe existing videos during resume planning and re-convert ones
    /// that are not in the target codec.
    #[serde(default)]
    pub check_existing: bool,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_min_payload_bytes")]
    pub min_payload_bytes: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output: PathBuf::from("downloads"),
            max_retries: default_max_retries(),
            convert_videos: default_true(),
            check_existing: false,
            backend_timeout_secs: default_backend_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            min_payload_bytes: default_min_payload_bytes(),
        }
    }
}

/// Progress callback: (status, index, total, message). Fired at
/// well-defined points only, never mid-byte-stream.
pub type ProgressFn = dyn Fn(&str, u64, u64, &str) + Send + Sync;

/// Diagnostic log callback; receives already-timestamped lines.
pub type LogFn = dyn Fn(&str) + Send + Sync;

/// Per-run handle: cancellation flag plus the progress/log channels.
/// Built once by the caller, passed into every pipeline call.
pub struct RunContext {
    pub cancel: CancellationToken,
    progress: Box<ProgressFn>,
    log: Box<LogFn>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, progress: Box<ProgressFn>, log: Box<LogFn>) -> Self {
        Self {
            cancel,
            progress,
            log,
        }
    }

    pub fn progress(&self, status: &str, index: u64, total: u64, message: &str) {
        (self.progress)(status, index, total, message);
    }

    pub fn log(&self, message: &str) {
        let line = format!(
            "{} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        );
        (self.log)(&line);
    }
}

/// One failed record, with enough detail to retry just that subset by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub id: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub merged: u64,
    pub failed: u64,
    pub skipped: u64,
    pub reconverted: u64,
    pub cancelled: bool,
    #[serde(default)]
    pub failures: Vec<FailureDetail>,
}

/// Run the pipeline over all records sequentially.
///
/// Each record yields exactly one outcome; a single record's failure never
/// aborts the run. Cancellation stops before the next record and the
/// summary covers whatever was processed.
pub fn process(
    records: &[MemoryRecord],
    options: &RunOptions,
    ctx: &RunContext,
) -> anyhow::Result<RunSummary> {
    std::fs::create_dir_all(&options.output)?;

    let orchestrator = download::Orchestrator::new(options)?;
    let total = records.len() as u64;
    let mut summary = RunSummary {
        total,
        ..RunSummary::default()
    };

    for (i, record) in records.iter().enumerate() {
        let index = i as u64 + 1;
        if ctx.cancel.check().is_err() {
            ctx.log("run cancelled");
            summary.cancelled = true;
            break;
        }

        match resume::plan_record(record, &options.output, index, options) {
            resume::ResumePlan::AlreadyComplete(path) => {
                summary.skipped += 1;
                ctx.progress(
                    "skipped",
                    index,
                    total,
                    &format!("already complete: {}", path.display()),
                );
            }
            resume::ResumePlan::NeedsReconvert(path) => {
                ctx.progress(
                    "reconvert",
                    index,
                    total,
                    &format!("re-encoding existing {}", path.display()),
                );
                match orchestrator.converter().convert(&path, &path, ctx) {
                    Ok(_) => summary.reconverted += 1,
                    Err(e) => record_failure(&mut summary, record, &e, ctx, index, total),
                }
            }
            resume::ResumePlan::NeedsDownload => {
                match orchestrator.fetch_record(record, &options.output, index, total, options, ctx)
                {
                    FetchOutcome::Success(path) => {
                        summary.succeeded += 1;
                        ctx.progress("done", index, total, &format!("saved {}", path.display()));
                    }
                    FetchOutcome::SuccessMerged(paths) => {
                        summary.succeeded += 1;
                        summary.merged += 1;
                        ctx.progress(
                            "done",
                            index,
                            total,
                            &format!("saved {} merged file(s)", paths.len()),
                        );
                    }
                    FetchOutcome::Failed(e) => {
                        if matches!(e, PipelineError::Cancelled) {
                            summary.cancelled = true;
                            ctx.log("run cancelled");
                            break;
                        }
                        record_failure(&mut summary, record, &e, ctx, index, total);
                    }
                }
            }
        }
    }

    ctx.log(&format!(
        "run finished: {} ok ({} merged), {} failed, {} skipped, {} re-encoded of {}",
        summary.succeeded,
        summary.merged,
        summary.failed,
        summary.skipped,
        summary.reconverted,
        summary.total
    ));
    for failure in &summary.failures {
        ctx.log(&format!(
            "failed [{}] {}: {}",
            failure.kind, failure.id, failure.reason
        ));
    }

    Ok(summary)
}

fn record_failure(
    summary: &mut RunSummary,
    record: &MemoryRecord,
    error: &PipelineError,
    ctx: &RunContext,
    index: u64,
    total: u64,
) {
    summary.failed += 1;
    summary.failures.push(FailureDetail {
        id: record.id.clone(),
        kind: error.kind().to_string(),
        reason: error.to_string(),
    });
    ctx.progress("failed", index, total, &error.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_record, serve_responses, test_context};
    use tempfile::tempdir;

    #[test]
    fn test_process_mixes_outcomes_without_aborting() {
        let mut jpeg = b"\xff\xd8\xff\xe0".to_vec();
        jpeg.resize(2048, 0);
        let mut ok_bytes = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            jpeg.len()
        )
        .into_bytes();
        ok_bytes.extend_from_slice(&jpeg);
        let (ok_url, _) = serve_responses(ok_bytes, 2);
        let (bad_url, _) = serve_responses(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
            8,
        );

        let dir = tempdir().unwrap();
        let options = RunOptions {
            output: dir.path().to_path_buf(),
            max_retries: 2,
            retry_base_delay_ms: 1,
            convert_videos: false,
            ..RunOptions::default()
        };

        let mut ok_record = sample_record(MediaKind::Image);
        ok_record.url = ok_url;
        let mut bad_record = sample_record(MediaKind::Image);
        bad_record.id = "bad".to_string();
        bad_record.url = bad_url;
        // Distinct timestamp so the resume check cannot mistake the first
        // record's output for this one.
        bad_record.taken_at += chrono::Duration::seconds(1);

        let ctx = test_context();
        let summary = process(&[ok_record, bad_record], &options, &ctx).unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].id, "bad");
        assert!(dir.path().join("20210704_183005_1.jpg").exists());
    }

    #[test]
    fn test_process_skips_complete_records() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("20210704_183005_1.jpg"), b"data").unwrap();

        let options = RunOptions {
            output: dir.path().to_path_buf(),
            convert_videos: false,
            ..RunOptions::default()
        };
        let record = sample_record(MediaKind::Image);

        let ctx = test_context();
        let summary = process(&[record], &options, &ctx).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_process_honors_cancellation() {
        let dir = tempdir().unwrap();
        let options = RunOptions {
            output: dir.path().to_path_buf(),
            ..RunOptions::default()
        };
        let record = sample_record(MediaKind::Image);

        let ctx = test_context();
        ctx.cancel.cancel();
        let summary = process(&[record.clone(), record], &options, &ctx).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.succeeded + summary.failed + summary.skipped, 0);
    }
}
