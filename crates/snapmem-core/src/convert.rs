use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::PipelineError;
use crate::exec::{self, ToolRun};
use crate::sanitize::sanitize_path;
use crate::validate::{self, ValidationReport, MIN_VIDEO_BYTES};
use crate::RunContext;

/// Codec every finalized video is normalized to.
pub const TARGET_CODEC: &str = "h264";

/// Directory under the output dir receiving files that could not be
/// converted, next to their diagnostic logs.
pub const FAILED_DIR: &str = "failed_conversions";

/// What one backend attempt reported: the path it claims to have written
/// (possibly with format-string artifacts) and the raw process result.
pub struct BackendRun {
    pub claimed_output: String,
    pub exit_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl BackendRun {
    fn from_tool(run: ToolRun, claimed_output: &Path) -> Self {
        Self {
            claimed_output: claimed_output.to_string_lossy().into_owned(),
            exit_ok: run.exit_ok && !run.timed_out,
            stdout: if run.timed_out {
                format!("(killed after timeout)\n{}", run.stdout)
            } else {
                run.stdout
            },
            stderr: run.stderr,
        }
    }
}

/// One encoding backend. Backends write only to the temp path they are
/// given, never to the final target.
pub trait ConvertBackend {
    fn name(&self) -> &'static str;
    fn available(&self) -> bool;
    fn try_convert(&self, source: &Path, temp: &Path, timeout: Duration)
        -> anyhow::Result<BackendRun>;
}

/// External player/encoder process (VLC in transcode mode).
pub struct VlcBackend;

impl VlcBackend {
    fn executable() -> Option<PathBuf> {
        let candidates = [
            "vlc",
            r"C:\Program Files\VideoLAN\VLC\vlc.exe",
            r"C:\Program Files (x86)\VideoLAN\VLC\vlc.exe",
        ];
        for candidate in candidates {
            let path = Path::new(candidate);
            if path.is_absolute() {
                if path.exists() {
                    return Some(path.to_path_buf());
                }
            } else if exec::tool_available(candidate) {
                return Some(PathBuf::from(candidate));
            }
        }
        None
    }
}

impl ConvertBackend for VlcBackend {
    fn name(&self) -> &'static str {
        "vlc"
    }

    fn available(&self) -> bool {
        Self::executable().is_some()
    }

    fn try_convert(
        &self,
        source: &Path,
        temp: &Path,
        timeout: Duration,
    ) -> anyhow::Result<BackendRun> {
        let vlc = Self::executable().ok_or_else(|| anyhow::anyhow!("vlc not found"))?;
        let sout = format!(
            "#transcode{{vcodec=h264,venc=x264{{preset=medium,profile=main}},acodec=mp3,ab=192,channels=2,samplerate=44100}}:standard{{access=file,mux=mp4,dst={}}}",
            temp.display()
        );
        let mut cmd = Command::new(vlc);
        cmd.arg("-I")
            .arg("dummy")
            .arg("--no-repeat")
            .arg("--no-loop")
            .arg(source)
            .arg("--sout")
            .arg(sout)
            .arg("vlc://quit");
        let run = exec::run_with_timeout(cmd, timeout)?;
        Ok(BackendRun::from_tool(run, temp))
    }
}

/// Command-line encoder process (ffmpeg).
pub struct FfmpegBackend;

impl ConvertBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn available(&self) -> bool {
        exec::tool_available("ffmpeg")
    }

    fn try_convert(
        &self,
        source: &Path,
        temp: &Path,
        timeout: Duration,
    ) -> anyhow::Result<BackendRun> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(source)
            .arg("-c:v")
            .arg("libx264")
            .arg("-crf")
            .arg("18")
            .arg("-preset")
            .arg("veryfast")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-c:a")
            .arg("aac")
            .arg("-f")
            .arg("mp4")
            .arg(temp);
        let run = exec::run_with_timeout(cmd, timeout)?;
        Ok(BackendRun::from_tool(run, temp))
    }
}

/// Priority order: external player first, command-line encoder last.
pub fn default_backends() -> Vec<Box<dyn ConvertBackend>> {
    vec![Box::new(VlcBackend), Box::new(FfmpegBackend)]
}

/// One conversion attempt's paths. The temp artifact is removed on every
/// exit path unless it was committed to the target.
pub struct ConversionJob {
    pub source: PathBuf,
    pub temp: PathBuf,
    pub target: PathBuf,
    pub codec: &'static str,
    committed: bool,
}

impl ConversionJob {
    pub fn new(source: &Path, target: &Path) -> Self {
        let temp = PathBuf::from(format!("{}.temp", target.display()));
        Self {
            source: source.to_path_buf(),
            temp,
            target: target.to_path_buf(),
            codec: TARGET_CODEC,
            committed: false,
        }
    }

    /// Atomic rename of the validated temp file onto the target. The temp
    /// file is a sibling of the target, so the rename stays on one
    /// filesystem and no observer ever sees a partial target.
    fn commit(&mut self, validated: &Path) -> std::io::Result<()> {
        fs::rename(validated, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for ConversionJob {
    fn drop(&mut self) {
        if !self.committed && self.temp.exists() {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

pub struct Converter {
    backends: Vec<Box<dyn ConvertBackend>>,
    timeout: Duration,
    min_size: u64,
}

impl Converter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            backends: default_backends(),
            timeout,
            min_size: MIN_VIDEO_BYTES,
        }
    }

    pub fn with_backends(backends: Vec<Box<dyn ConvertBackend>>, timeout: Duration) -> Self {
        Self {
            backends,
            timeout,
            min_size: MIN_VIDEO_BYTES,
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backends.iter().any(|b| b.available())
    }

    /// Normalize `source` to the target codec at `target` (source and
    /// target may be the same path). On success the target holds validated
    /// media; on failure the source is quarantined with a diagnostic log
    /// and the target path is left absent.
    pub fn convert(
        &self,
        source: &Path,
        target: &Path,
        ctx: &RunContext,
    ) -> Result<PathBuf, PipelineError> {
        let mut job = ConversionJob::new(source, target);
        let basename = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let mut diagnostics: Vec<String> = Vec::new();
        let mut attempt = 0u32;

        for backend in &self.backends {
            if !backend.available() {
                continue;
            }
            if ctx.cancel.check().is_err() {
                return Err(PipelineError::Cancelled);
            }
            attempt += 1;
            let tag = format!(
                "{}_{}_{}",
                basename,
                chrono::Local::now().format("%Y%m%d%H%M%S"),
                attempt
            );
            ctx.log(&format!("[{}] converting with {}", tag, backend.name()));

            if job.temp.exists() {
                let _ = fs::remove_file(&job.temp);
            }

            let run = match backend.try_convert(&job.source, &job.temp, self.timeout) {
                Ok(run) => run,
                Err(e) => {
                    diagnostics.push(format!("[{}] {} did not run: {}", tag, backend.name(), e));
                    continue;
                }
            };

            let Some(output) = sanitize_path(&run.claimed_output) else {
                diagnostics.push(format!(
                    "[{}] {} reported no usable output path",
                    tag,
                    backend.name()
                ));
                continue;
            };

            let report = validate::probe_video(&output, self.min_size);
            if report.passed {
                if !run.exit_ok {
                    ctx.log(&format!(
                        "[{}] {} exited non-zero but output validated; treating as success",
                        tag,
                        backend.name()
                    ));
                }
                job.commit(&output).map_err(PipelineError::Io)?;
                ctx.log(&format!("[{}] committed {}", tag, target.display()));
                return Ok(target.to_path_buf());
            }

            diagnostics.push(backend_failure_entry(&tag, backend.name(), &run, &report));
        }

        if attempt == 0 {
            diagnostics.push("no conversion backend available".to_string());
        }
        let reason = diagnostics
            .last()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        self.quarantine(&job, &basename, &diagnostics, ctx);
        Err(PipelineError::ConversionFailed(reason))
    }

    /// Move the unconvertible source under `failed_conversions/`, keeping
    /// its canonical basename, and write the companion diagnostic log.
    fn quarantine(&self, job: &ConversionJob, basename: &str, diagnostics: &[String], ctx: &RunContext) {
        let Some(parent) = job.target.parent() else {
            return;
        };
        let failed_dir = parent.join(FAILED_DIR);
        if let Err(e) = fs::create_dir_all(&failed_dir) {
            ctx.log(&format!("could not create quarantine dir: {}", e));
            return;
        }

        let stem = Path::new(basename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let log_path = failed_dir.join(format!(
            "{}_error_{}.log",
            stem,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ));
        let mut body = format!("Failed conversion: {}\n", job.source.display());
        for line in diagnostics {
            body.push_str(line);
            body.push('\n');
        }
        if let Err(e) = fs::write(&log_path, body) {
            ctx.log(&format!("could not write quarantine log: {}", e));
        }

        if job.source.exists() {
            let quarantined = failed_dir.join(basename);
            if fs::rename(&job.source, &quarantined).is_err() {
                // Different filesystem; fall back to copy+remove.
                if fs::copy(&job.source, &quarantined).is_ok() {
                    let _ = fs::remove_file(&job.source);
                }
            }
            ctx.log(&format!("quarantined {}", quarantined.display()));
        }
    }
}

fn backend_failure_entry(
    tag: &str,
    backend: &str,
    run: &BackendRun,
    report: &ValidationReport,
) -> String {
    let reason = PipelineError::ValidationFailed(
        report.failure.clone().unwrap_or_else(|| "unknown".to_string()),
    );
    format!(
        "[{tag}] {backend}: {reason}\nexit ok: {}\nstdout:\n{}\nstderr:\n{}",
        run.exit_ok,
        run.stdout.trim(),
        run.stderr.trim(),
    )
}
