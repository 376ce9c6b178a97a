use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use crate::exec;

/// Payloads below this size are never valid media.
pub const MIN_MEDIA_BYTES: u64 = 100;

/// Minimum size for an encoded video to be considered non-degenerate.
pub const MIN_VIDEO_BYTES: u64 = 1000;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Structural health of a media file. Pure function of the file's current
/// bytes; never mutates.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub duration_secs: Option<f64>,
    pub codec: Option<String>,
    pub has_video_stream: bool,
    pub size: u64,
    pub failure: Option<String>,
}

impl ValidationReport {
    fn fail(size: u64, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            duration_secs: None,
            codec: None,
            has_video_stream: false,
            size,
            failure: Some(reason.into()),
        }
    }
}

pub fn ffprobe_available() -> bool {
    exec::tool_available("ffprobe")
}

/// Recognize a payload's leading bytes.
pub fn header_kind(magic: &[u8]) -> Option<&'static str> {
    if magic.len() >= 4 && &magic[..4] == b"PK\x03\x04" {
        return Some("zip");
    }
    if magic.len() >= 3 && &magic[..3] == b"\xff\xd8\xff" {
        return Some("jpeg");
    }
    if magic.len() >= 8 && &magic[..8] == b"\x89PNG\r\n\x1a\n" {
        return Some("png");
    }
    if magic.len() >= 12 {
        match &magic[4..8] {
            b"ftyp" | b"mdat" | b"moov" | b"wide" => return Some("mp4"),
            _ => {}
        }
    }
    None
}

/// Error pages arrive with a 200 status often enough that the body has to
/// be sniffed.
pub fn looks_like_html(magic: &[u8]) -> bool {
    let lower: Vec<u8> = magic.iter().map(|b| b.to_ascii_lowercase()).collect();
    lower.starts_with(b"<!doc")
        || lower.starts_with(b"<html")
        || lower.windows(5).any(|w| w == b"<html")
        || lower.windows(9).any(|w| w == b"<!doctype")
}

fn read_leading_bytes(path: &Path) -> std::io::Result<(u64, Vec<u8>)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut magic = [0u8; 32];
    let n = file.read(&mut magic)?;
    Ok((size, magic[..n].to_vec()))
}

/// Size and magic-header check for any downloaded media file.
pub fn validate_media(path: &Path, min_size: u64) -> ValidationReport {
    let (size, magic) = match read_leading_bytes(path) {
        Ok(v) => v,
        Err(e) => return ValidationReport::fail(0, format!("cannot read file: {}", e)),
    };

    if size < min_size {
        return ValidationReport::fail(size, format!("file too small ({} bytes)", size));
    }

    match header_kind(&magic) {
        Some(kind) => ValidationReport {
            passed: true,
            duration_secs: None,
            codec: None,
            has_video_stream: kind == "mp4",
            size,
            failure: None,
        },
        None => ValidationReport::fail(
            size,
            format!(
                "unrecognized header (magic: {})",
                magic
                    .iter()
                    .take(8)
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>()
            ),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_name: Option<String>,
    codec_type: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe a video with ffprobe: pass requires a decodable video stream,
/// duration > 0 and size above the minimum. With ffprobe unavailable this
/// degrades to the header+size check and leaves duration/codec unknown.
pub fn probe_video(path: &Path, min_size: u64) -> ValidationReport {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size < min_size {
        return ValidationReport::fail(size, format!("file too small ({} bytes)", size));
    }

    if !ffprobe_available() {
        return validate_media(path, min_size);
    }

    let mut cmd = Command::new("ffprobe");
    cmd.arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("stream=codec_name,codec_type,duration:format=duration")
        .arg("-of")
        .arg("json")
        .arg(path);

    let run = match exec::run_with_timeout(cmd, PROBE_TIMEOUT) {
        Ok(run) => run,
        Err(e) => return ValidationReport::fail(size, format!("ffprobe failed to start: {}", e)),
    };
    if run.timed_out {
        return ValidationReport::fail(size, "ffprobe timed out");
    }

    let parsed: ProbeOutput = match serde_json::from_str(&run.stdout) {
        Ok(p) => p,
        Err(_) => {
            return ValidationReport::fail(size, "ffprobe produced no readable stream info")
        }
    };

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let codec = video.and_then(|s| s.codec_name.clone());
    let duration_secs = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| video.and_then(|s| s.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());

    let mut report = ValidationReport {
        passed: true,
        duration_secs,
        codec,
        has_video_stream: video.is_some(),
        size,
        failure: None,
    };

    if !report.has_video_stream {
        report.passed = false;
        report.failure = Some("no video stream".to_string());
    } else if !matches!(report.duration_secs, Some(d) if d > 0.0) {
        report.passed = false;
        report.failure = Some("zero or unknown duration".to_string());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_header_kind() {
        assert_eq!(header_kind(b"PK\x03\x04rest"), Some("zip"));
        assert_eq!(header_kind(b"\xff\xd8\xff\xe0etc"), Some("jpeg"));
        assert_eq!(header_kind(b"\x89PNG\r\n\x1a\nrest"), Some("png"));
        assert_eq!(header_kind(b"\x00\x00\x00\x20ftypisom____"), Some("mp4"));
        assert_eq!(header_kind(b"garbage bytes here"), None);
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html(b"<!DOCTYPE html><head>"));
        assert!(looks_like_html(b"<html lang=\"en\">"));
        assert!(looks_like_html(b"\n <HTML>"));
        assert!(!looks_like_html(b"\xff\xd8\xff\xe0"));
    }

    #[test]
    fn test_small_file_fails_with_size_reason() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "tiny.jpg", b"\xff\xd8\xff");
        let report = validate_media(&path, MIN_MEDIA_BYTES);
        assert!(!report.passed);
        assert!(report.failure.unwrap().contains("too small"));
    }

    #[test]
    fn test_unknown_header_fails() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "junk.bin", &[0xABu8; 512]);
        let report = validate_media(&path, MIN_MEDIA_BYTES);
        assert!(!report.passed);
        assert!(report.failure.unwrap().contains("unrecognized header"));
    }

    #[test]
    fn test_valid_jpeg_header_passes() {
        let dir = tempdir().unwrap();
        let mut bytes = b"\xff\xd8\xff\xe0".to_vec();
        bytes.resize(4096, 0);
        let path = write_file(dir.path(), "ok.jpg", &bytes);
        let report = validate_media(&path, MIN_MEDIA_BYTES);
        assert!(report.passed, "{:?}", report.failure);
        assert_eq!(report.size, 4096);
    }

    #[test]
    fn test_probe_rejects_text_posing_as_video() {
        let dir = tempdir().unwrap();
        let mut bytes = b"this is not a video file".to_vec();
        bytes.resize(4096, b'x');
        let path = write_file(dir.path(), "fake.mp4", &bytes);
        let report = probe_video(&path, MIN_VIDEO_BYTES);
        assert!(!report.passed);
    }
}
