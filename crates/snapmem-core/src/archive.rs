use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use encoding_rs::SHIFT_JIS;
use regex::Regex;
use zip::ZipArchive;

use crate::error::PipelineError;
use crate::exec;
use crate::naming;
use crate::record::{MediaKind, MemoryRecord};
use crate::validate;
use crate::RunContext;

static MAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<stem>.+)-main(?P<ext>\.[^.]+)$").unwrap());
static OVERLAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<stem>.+)-overlay(?P<ext>\.[^.]+)$").unwrap());

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".m4v", ".avi", ".mkv"];

/// A merged video shorter than this fraction of its base is reported as a
/// truncated merge.
const MIN_DURATION_RATIO: f64 = 0.9;

/// A base entry with its optional overlay, matched on a shared stem inside
/// one archive. Scoped to a single archive-processing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntryPair {
    pub base: String,
    pub overlay: Option<String>,
    pub kind: MediaKind,
}

/// Decode a zip entry name, trying UTF-8 first, then Shift_JIS.
fn decode_entry_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }
    let (decoded, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

fn entry_kind(name: &str) -> MediaKind {
    let lower = name.to_lowercase();
    if VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return MediaKind::Video;
    }
    match mime_guess::from_path(name).first() {
        Some(mime) if mime.type_() == mime_guess::mime::VIDEO => MediaKind::Video,
        _ => MediaKind::Image,
    }
}

/// Group entry names into base/overlay pairs by shared stem. Entries that
/// match neither suffix, and suffixed entries whose counterpart is absent,
/// come back as pairs with only a base.
pub fn pair_entries(names: &[String]) -> Vec<ArchiveEntryPair> {
    let mut mains: BTreeMap<String, String> = BTreeMap::new();
    let mut overlays: BTreeMap<String, String> = BTreeMap::new();
    let mut plain: Vec<String> = Vec::new();

    for name in names {
        if let Some(caps) = MAIN_RE.captures(name) {
            mains.insert(caps["stem"].to_lowercase(), name.clone());
        } else if let Some(caps) = OVERLAY_RE.captures(name) {
            overlays.insert(caps["stem"].to_lowercase(), name.clone());
        } else {
            plain.push(name.clone());
        }
    }

    let mut pairs = Vec::new();
    for (stem, base) in mains {
        let overlay = overlays.remove(&stem);
        let kind = entry_kind(&base);
        pairs.push(ArchiveEntryPair { base, overlay, kind });
    }
    // Orphan overlays and unsuffixed entries pass through unmodified.
    for (_, name) in overlays {
        let kind = entry_kind(&name);
        pairs.push(ArchiveEntryPair {
            base: name,
            overlay: None,
            kind,
        });
    }
    for name in plain {
        let kind = entry_kind(&name);
        pairs.push(ArchiveEntryPair {
            base: name,
            overlay: None,
            kind,
        });
    }
    pairs
}

/// Process an archive payload for one record: extract, merge overlay pairs,
/// finalize every output under a canonical timestamp name in `dest_dir`.
///
/// Extraction happens into a scoped temp dir that is removed on every exit
/// path. A failed merge degrades to exposing the unmerged base file.
pub fn resolve_archive(
    archive_path: &Path,
    dest_dir: &Path,
    record: &MemoryRecord,
    backend_timeout: Duration,
    ctx: &RunContext,
) -> Result<Vec<PathBuf>, PipelineError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;

    let temp_dir = tempfile::Builder::new()
        .prefix("snapmem_extract_")
        .tempdir()
        .map_err(PipelineError::Io)?;

    // Flat extraction by basename; Snapchat archives carry no directories
    // worth preserving, and this sidesteps hostile entry paths.
    let mut names: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = decode_entry_name(entry.name_raw());
        let Some(basename) = Path::new(&name)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        let out_path = temp_dir.path().join(&basename);
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;
        names.push(basename);
    }

    if names.is_empty() {
        return Err(PipelineError::ArchiveCorrupt(
            "archive contains no files".to_string(),
        ));
    }

    let stem = naming::timestamp_stem(&record.taken_at);
    let mut outputs = Vec::new();

    for pair in pair_entries(&names) {
        if ctx.cancel.check().is_err() {
            return Err(PipelineError::Cancelled);
        }

        let base_path = temp_dir.path().join(&pair.base);
        let ext = extension_of(&pair.base);

        let finalized = match &pair.overlay {
            Some(overlay) => {
                let overlay_path = temp_dir.path().join(overlay);
                ctx.log(&format!(
                    "merging {} + {} ({:?})",
                    pair.base, overlay, pair.kind
                ));
                match merge_pair(&base_path, &overlay_path, pair.kind, backend_timeout, ctx) {
                    Ok(merged) => finalize(&merged, dest_dir, &stem, &ext)?,
                    Err(e) => {
                        ctx.log(&format!(
                            "{}; keeping unmerged base {}",
                            PipelineError::MergeFailed(e),
                            pair.base
                        ));
                        finalize(&base_path, dest_dir, &stem, &ext)?
                    }
                }
            }
            None => finalize(&base_path, dest_dir, &stem, &ext)?,
        };
        outputs.push(finalized);
    }

    Ok(outputs)
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_else(|| ".bin".to_string())
}

/// Move a finished file out of the extraction dir under its canonical name.
/// The rename crosses filesystems when the system temp dir lives elsewhere,
/// so fall back to copy+remove; the copy goes to a `.part` sibling first so
/// the canonical name never holds partial bytes.
fn finalize(
    produced: &Path,
    dest_dir: &Path,
    stem: &str,
    ext: &str,
) -> Result<PathBuf, PipelineError> {
    let target = naming::resolve_collision(dest_dir, stem, ext);
    if fs::rename(produced, &target).is_err() {
        let part = PathBuf::from(format!("{}.part", target.display()));
        fs::copy(produced, &part)?;
        fs::rename(&part, &target)?;
        let _ = fs::remove_file(produced);
    }
    Ok(target)
}

fn merge_pair(
    base: &Path,
    overlay: &Path,
    kind: MediaKind,
    timeout: Duration,
    ctx: &RunContext,
) -> Result<PathBuf, String> {
    if !exec::tool_available("ffmpeg") {
        return Err("ffmpeg not found".to_string());
    }
    match kind {
        MediaKind::Video => merge_video_overlay(base, overlay, timeout, ctx),
        MediaKind::Image => merge_image_overlay(base, overlay, timeout),
    }
}

/// Composite a still overlay onto a video for the video's full duration.
/// The overlay input is looped and the overlay filter stops at the end of
/// the base stream, so output duration tracks the base rather than the
/// overlay's single frame.
fn merge_video_overlay(
    base: &Path,
    overlay: &Path,
    timeout: Duration,
    ctx: &RunContext,
) -> Result<PathBuf, String> {
    let merged = sibling(base, "-merged");
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(base)
        .arg("-loop")
        .arg("1")
        .arg("-i")
        .arg(overlay)
        .arg("-filter_complex")
        .arg("[1:v][0:v]scale2ref[ov][b];[b][ov]overlay=0:0:shortest=1")
        .arg("-c:a")
        .arg("copy")
        .arg("-c:v")
        .arg("libx264")
        .arg("-crf")
        .arg("18")
        .arg("-preset")
        .arg("veryfast")
        .arg(&merged);

    let run = exec::run_with_timeout(cmd, timeout).map_err(|e| e.to_string())?;
    if run.timed_out {
        return Err("ffmpeg timed out".to_string());
    }

    let base_duration = validate::probe_video(base, 1).duration_secs;
    let report = validate::probe_video(&merged, validate::MIN_VIDEO_BYTES);
    if !report.passed {
        return Err(report
            .failure
            .unwrap_or_else(|| "merged output did not validate".to_string()));
    }
    if let (Some(base_d), Some(merged_d)) = (base_duration, report.duration_secs) {
        if base_d > 0.0 && merged_d < base_d * MIN_DURATION_RATIO {
            ctx.log(&format!(
                "merged duration {:.2}s is under {:.0}% of base {:.2}s",
                merged_d,
                MIN_DURATION_RATIO * 100.0,
                base_d
            ));
        }
    }
    Ok(merged)
}

/// Composite an overlay image onto a base image, scaling the overlay to
/// cover the base, encoded once to the base's format.
fn merge_image_overlay(
    base: &Path,
    overlay: &Path,
    timeout: Duration,
) -> Result<PathBuf, String> {
    let merged = sibling(base, "-merged");
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(base)
        .arg("-i")
        .arg(overlay)
        .arg("-filter_complex")
        .arg("[1:v][0:v]scale2ref[ov][b];[b][ov]overlay=0:0")
        .arg("-frames:v")
        .arg("1")
        .arg("-update")
        .arg("1")
        .arg("-q:v")
        .arg("2")
        .arg(&merged);

    let run = exec::run_with_timeout(cmd, timeout).map_err(|e| e.to_string())?;
    if run.timed_out {
        return Err("ffmpeg timed out".to_string());
    }

    let report = validate::validate_media(&merged, validate::MIN_MEDIA_BYTES);
    if !report.passed {
        return Err(report
            .failure
            .unwrap_or_else(|| "merged output did not validate".to_string()));
    }
    Ok(merged)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("merged");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    path.with_file_name(format!("{}{}.{}", stem, suffix, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ffmpeg_available, sample_record, test_context, write_zip};
    use tempfile::tempdir;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pair_entries_matches_by_stem() {
        let pairs = pair_entries(&names(&[
            "foo-main.mp4",
            "foo-overlay.jpg",
            "bar-main.jpg",
            "loose.jpg",
        ]));

        let foo = pairs.iter().find(|p| p.base == "foo-main.mp4").unwrap();
        assert_eq!(foo.overlay.as_deref(), Some("foo-overlay.jpg"));
        assert_eq!(foo.kind, MediaKind::Video);

        let bar = pairs.iter().find(|p| p.base == "bar-main.jpg").unwrap();
        assert_eq!(bar.overlay, None);
        assert_eq!(bar.kind, MediaKind::Image);

        let loose = pairs.iter().find(|p| p.base == "loose.jpg").unwrap();
        assert_eq!(loose.overlay, None);
    }

    #[test]
    fn test_pair_entries_is_case_insensitive() {
        let pairs = pair_entries(&names(&["Foo-MAIN.MP4", "foo-Overlay.JPG"]));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].overlay.as_deref(), Some("foo-Overlay.JPG"));
    }

    #[test]
    fn test_orphan_overlay_passes_through() {
        let pairs = pair_entries(&names(&["solo-overlay.jpg"]));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].base, "solo-overlay.jpg");
        assert_eq!(pairs[0].overlay, None);
    }

    #[test]
    fn test_unpaired_entries_are_extracted_under_canonical_names() {
        let dir = tempdir().unwrap();
        let mut jpeg = b"\xff\xd8\xff\xe0".to_vec();
        jpeg.resize(2048, 0);
        let zip_path = dir.path().join("payload.zip");
        write_zip(&zip_path, &[("photo.jpg", &jpeg), ("other.jpg", &jpeg)]);

        let record = sample_record(MediaKind::Image);
        let ctx = test_context();
        let outputs = resolve_archive(
            &zip_path,
            dir.path(),
            &record,
            Duration::from_secs(30),
            &ctx,
        )
        .unwrap();

        assert_eq!(outputs.len(), 2);
        assert!(outputs.contains(&dir.path().join("20210704_183005.jpg")));
        assert!(outputs.contains(&dir.path().join("20210704_183005_1.jpg")));
        for out in &outputs {
            assert!(out.exists());
        }
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("bad.zip");
        std::fs::write(&zip_path, b"PK\x03\x04 but truncated").unwrap();

        let record = sample_record(MediaKind::Image);
        let ctx = test_context();
        let err = resolve_archive(
            &zip_path,
            dir.path(),
            &record,
            Duration::from_secs(30),
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ArchiveCorrupt(_)));
    }

    #[test]
    fn test_video_pair_merges_to_full_base_duration() {
        if !ffmpeg_available() {
            return;
        }
        let dir = tempdir().unwrap();

        let base = dir.path().join("foo-main.mp4");
        crate::test_support::make_test_clip(&base, 2.0);
        let overlay = dir.path().join("foo-overlay.png");
        crate::test_support::make_test_still(&overlay);

        let zip_path = dir.path().join("payload.zip");
        write_zip(
            &zip_path,
            &[
                ("foo-main.mp4", &std::fs::read(&base).unwrap()),
                ("foo-overlay.png", &std::fs::read(&overlay).unwrap()),
            ],
        );

        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();
        let record = sample_record(MediaKind::Video);
        let ctx = test_context();
        let outputs = resolve_archive(
            &zip_path,
            &out_dir,
            &record,
            Duration::from_secs(120),
            &ctx,
        )
        .unwrap();

        assert_eq!(outputs.len(), 1, "exactly one canonical output expected");
        let merged = validate::probe_video(&outputs[0], 1);
        assert!(merged.passed, "{:?}", merged.failure);
        let base_d = validate::probe_video(&base, 1).duration_secs.unwrap();
        let merged_d = merged.duration_secs.unwrap();
        assert!(
            (merged_d - base_d).abs() <= base_d * 0.1,
            "merged {}s vs base {}s",
            merged_d,
            base_d
        );
    }
}
