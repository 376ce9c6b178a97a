use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Interval between liveness checks on a running child process.
const POLL_INTERVAL_MS: u64 = 100;

/// Captured result of one external tool invocation.
#[derive(Debug)]
pub struct ToolRun {
    pub exit_ok: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Check whether a tool is reachable on PATH. Only spawnability matters;
/// the probe flag's exit code does not.
pub fn tool_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Run a command with a bounded execution time. A child still running when
/// the deadline passes is killed and reported as `timed_out`; it must never
/// be left to block the pipeline.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> anyhow::Result<ToolRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("could not capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("could not capture stderr"))?;

    // Drain pipes on threads so a chatty child never deadlocks on a full
    // pipe buffer while we poll for exit.
    let out_handle = std::thread::spawn(move || read_to_string_lossy(stdout));
    let err_handle = std::thread::spawn(move || read_to_string_lossy(stderr));

    let deadline = Instant::now() + timeout;
    let (status, timed_out) = loop {
        match child.try_wait()? {
            Some(status) => break (Some(status), false),
            None => {
                if Instant::now() >= deadline {
                    kill_quietly(&mut child);
                    break (None, true);
                }
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    Ok(ToolRun {
        exit_ok: status.map(|s| s.success()).unwrap_or(false),
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        stdout,
        stderr,
    })
}

fn read_to_string_lossy(mut pipe: impl Read) -> String {
    let mut bytes = Vec::new();
    let _ = pipe.read_to_end(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
