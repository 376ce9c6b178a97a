use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;

use crate::archive;
use crate::convert::Converter;
use crate::error::PipelineError;
use crate::naming;
use crate::record::MemoryRecord;
use crate::validate;
use crate::{RunContext, RunOptions};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const CHUNK_SIZE: usize = 8192;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Produced exactly once per record.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(PathBuf),
    SuccessMerged(Vec<PathBuf>),
    Failed(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    Archive,
    Media,
}

/// Classify a payload from its leading bytes; the URL is never trusted.
fn classify_payload(magic: &[u8]) -> Result<PayloadKind, String> {
    if validate::looks_like_html(magic) {
        return Err("HTML page instead of media file".to_string());
    }
    match validate::header_kind(magic) {
        Some("zip") => Ok(PayloadKind::Archive),
        Some(_) => Ok(PayloadKind::Media),
        None => Err("unrecognized payload header".to_string()),
    }
}

pub struct Orchestrator {
    client: reqwest::blocking::Client,
    converter: Converter,
}

impl Orchestrator {
    pub fn new(options: &RunOptions) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        let converter = Converter::new(Duration::from_secs(options.backend_timeout_secs));
        Ok(Self { client, converter })
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// Fetch one record into `dest_dir` with retry/backoff. Side effects
    /// stay inside `dest_dir`; no partial file is ever left under a
    /// canonical name.
    pub fn fetch_record(
        &self,
        record: &MemoryRecord,
        dest_dir: &Path,
        index: u64,
        total: u64,
        options: &RunOptions,
        ctx: &RunContext,
    ) -> FetchOutcome {
        let mut last_error = PipelineError::Network {
            attempts: 0,
            detail: "no attempt made".to_string(),
        };

        for attempt in 1..=options.max_retries {
            if ctx.cancel.check().is_err() {
                return FetchOutcome::Failed(PipelineError::Cancelled);
            }
            if attempt > 1 {
                let wait = backoff_delay(options.retry_base_delay_ms, attempt);
                ctx.progress(
                    "retry",
                    index,
                    total,
                    &format!(
                        "retry attempt {}/{} after {:.0}s wait",
                        attempt,
                        options.max_retries,
                        wait.as_secs_f64()
                    ),
                );
                if sleep_cancellable(wait, ctx).is_err() {
                    return FetchOutcome::Failed(PipelineError::Cancelled);
                }
            } else {
                ctx.progress(
                    "attempt",
                    index,
                    total,
                    &format!("attempting download (1/{})", options.max_retries),
                );
            }

            match self.try_fetch(record, dest_dir, index, total, options, ctx) {
                Ok(outcome) => return outcome,
                Err(e) => {
                    ctx.progress(
                        "attempt-failed",
                        index,
                        total,
                        &format!("attempt {}/{} failed: {}", attempt, options.max_retries, e),
                    );
                    // Cancellation ends the record outright; a conversion
                    // failure already quarantined the file, so another
                    // download would not help.
                    if matches!(
                        e,
                        PipelineError::Cancelled | PipelineError::ConversionFailed(_)
                    ) {
                        return FetchOutcome::Failed(e);
                    }
                    last_error = e;
                }
            }
        }

        let detail = last_error.to_string();
        let failed = match last_error {
            PipelineError::InvalidPayload(d) => PipelineError::InvalidPayload(d),
            _ => PipelineError::Network {
                attempts: options.max_retries,
                detail,
            },
        };
        FetchOutcome::Failed(failed)
    }

    /// One attempt: GET, sniff, stream to a temp file, dispatch by payload
    /// kind. Any error here is a retryable attempt failure.
    fn try_fetch(
        &self,
        record: &MemoryRecord,
        dest_dir: &Path,
        index: u64,
        total: u64,
        options: &RunOptions,
        ctx: &RunContext,
    ) -> Result<FetchOutcome, PipelineError> {
        let mut response = self
            .client
            .get(&record.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| PipelineError::Network {
                attempts: 1,
                detail: e.to_string(),
            })?;

        let temp = tempfile::Builder::new()
            .prefix(".snapmem_dl_")
            .tempfile_in(dest_dir)
            .map_err(PipelineError::Io)?;
        let size = stream_body(&mut response, temp.as_file(), ctx)?;

        if size < options.min_payload_bytes {
            return Err(PipelineError::InvalidPayload(format!(
                "payload too small ({} bytes)",
                size
            )));
        }

        let mut magic = [0u8; 32];
        let n = read_leading(temp.path(), &mut magic)?;
        let kind = classify_payload(&magic[..n]).map_err(PipelineError::InvalidPayload)?;

        match kind {
            PayloadKind::Archive => {
                ctx.progress("merge", index, total, "downloaded archive, merging overlays");
                let outputs = archive::resolve_archive(
                    temp.path(),
                    dest_dir,
                    record,
                    Duration::from_secs(options.backend_timeout_secs),
                    ctx,
                )?;
                ctx.progress(
                    "merge-done",
                    index,
                    total,
                    &format!("archive produced {} file(s)", outputs.len()),
                );
                for output in &outputs {
                    set_capture_mtime(output, record);
                }
                Ok(FetchOutcome::SuccessMerged(outputs))
            }
            PayloadKind::Media => {
                let stem = naming::record_stem(&record.taken_at, Some(index));
                let target =
                    naming::resolve_collision(dest_dir, &stem, record.kind.extension());
                temp.persist(&target).map_err(|e| e.error)?;

                if record.is_video() && options.convert_videos {
                    if self.converter.has_backend() {
                        self.converter.convert(&target, &target, ctx)?;
                    } else {
                        ctx.log("no conversion backend available; keeping original encoding");
                    }
                }
                set_capture_mtime(&target, record);
                ctx.progress(
                    "downloaded",
                    index,
                    total,
                    &format!("saved {} ({} bytes)", target.display(), size),
                );
                Ok(FetchOutcome::Success(target))
            }
        }
    }
}

/// Base delay doubling per attempt, capped.
fn backoff_delay(base_ms: u64, attempt: usize) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(2).min(16) as u32);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}

/// Sleep in short slices so cancellation between attempts is honored
/// promptly.
fn sleep_cancellable(total: Duration, ctx: &RunContext) -> Result<(), PipelineError> {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if ctx.cancel.check().is_err() {
            return Err(PipelineError::Cancelled);
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    Ok(())
}

/// Stream the response body to the temp file, checking cancellation
/// between chunks.
fn stream_body(
    response: &mut reqwest::blocking::Response,
    mut out: &fs::File,
    ctx: &RunContext,
) -> Result<u64, PipelineError> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        if ctx.cancel.check().is_err() {
            return Err(PipelineError::Cancelled);
        }
        let n = response.read(&mut buf).map_err(|e| PipelineError::Network {
            attempts: 1,
            detail: format!("read failed mid-transfer: {}", e),
        })?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    out.flush()?;
    Ok(written)
}

fn read_leading(path: &Path, buf: &mut [u8]) -> Result<usize, PipelineError> {
    let mut file = fs::File::open(path)?;
    let n = file.read(buf)?;
    Ok(n)
}

/// Stamp the finalized file with the record's capture time.
fn set_capture_mtime(path: &Path, record: &MemoryRecord) {
    let ts = record.taken_at.and_utc().timestamp();
    let ft = FileTime::from_unix_time(ts, 0);
    let _ = filetime::set_file_mtime(path, ft);
}
