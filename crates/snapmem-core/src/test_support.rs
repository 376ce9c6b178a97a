//! Shared helpers for in-module tests.

use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use crate::exec;
use crate::record::{MediaKind, MemoryRecord};
use crate::{CancellationToken, RunContext};

pub fn test_context() -> RunContext {
    RunContext::new(
        CancellationToken::new(),
        Box::new(|_, _, _, _| {}),
        Box::new(|_| {}),
    )
}

pub fn sample_record(kind: MediaKind) -> MemoryRecord {
    MemoryRecord {
        id: "sample".to_string(),
        kind,
        taken_at: NaiveDate::from_ymd_opt(2021, 7, 4)
            .unwrap()
            .and_hms_opt(18, 30, 5)
            .unwrap(),
        utc_offset_minutes: None,
        location: None,
        url: "http://127.0.0.1:1/unused".to_string(),
        overlay_url: None,
    }
}

pub fn ffmpeg_available() -> bool {
    exec::tool_available("ffmpeg") && exec::tool_available("ffprobe")
}

/// A real (if ffmpeg is present) or well-formed-enough video file that the
/// validator accepts either way.
pub fn make_playable_video(path: &Path) {
    if ffmpeg_available() {
        make_test_clip(path, 1.0);
        return;
    }
    let mut bytes = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00".to_vec();
    bytes.resize(4096, 0);
    std::fs::File::create(path)
        .unwrap()
        .write_all(&bytes)
        .unwrap();
}

/// Encode a short test-pattern clip. Callers must gate on
/// `ffmpeg_available`.
pub fn make_test_clip(path: &Path, seconds: f64) {
    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-f")
        .arg("lavfi")
        .arg("-i")
        .arg(format!("testsrc=duration={}:size=320x240:rate=10", seconds))
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-f")
        .arg("mp4")
        .arg(path)
        .output()
        .expect("ffmpeg run");
    assert!(status.status.success(), "could not encode test clip");
}

/// Encode a small still image. Callers must gate on `ffmpeg_available`.
pub fn make_test_still(path: &Path) {
    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-f")
        .arg("lavfi")
        .arg("-i")
        .arg("color=c=red@0.5:size=320x240")
        .arg("-frames:v")
        .arg("1")
        .arg(path)
        .output()
        .expect("ffmpeg run");
    assert!(status.status.success(), "could not encode test still");
}

/// Write a zip archive containing the given (name, bytes) entries.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

/// Serve the same raw HTTP response for up to `max_conns` connections on an
/// ephemeral port. Returns the URL and a counter of connections handled.
pub fn serve_responses(response: Vec<u8>, max_conns: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    std::thread::spawn(move || {
        for _ in 0..max_conns {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            hits_clone.fetch_add(1, Ordering::SeqCst);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
            // Read the request head so the client does not see a reset
            // before it finishes writing.
            let mut buf = [0u8; 4096];
            use std::io::Read;
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(&response);
            let _ = stream.flush();
        }
    });

    (format!("http://{}/media", addr), hits)
}
