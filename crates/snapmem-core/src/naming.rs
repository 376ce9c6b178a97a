use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// "20210704_183005"
pub fn timestamp_stem(taken_at: &NaiveDateTime) -> String {
    taken_at.format("%Y%m%d_%H%M%S").to_string()
}

/// Canonical stem for a record: the timestamp, plus the record's run index
/// when one is used ("20210704_183005_7"). Merged archive outputs use the
/// un-indexed form.
pub fn record_stem(taken_at: &NaiveDateTime, index: Option<u64>) -> String {
    match index {
        Some(i) => format!("{}_{}", timestamp_stem(taken_at), i),
        None => timestamp_stem(taken_at),
    }
}

/// First free path for `<stem><ext>` in `dir`, appending a `_N` collision
/// suffix when the plain name is taken.
///
/// The counter is recomputed from the directory on every call, which is
/// only safe while records are processed sequentially; a parallel caller
/// must replace this with a shared synchronized counter.
pub fn resolve_collision(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let plain = dir.join(format!("{}{}", stem, ext));
    if !plain.exists() {
        return plain;
    }
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Every name a prior run could have produced for this record: indexed,
/// un-indexed (merged archive output) and their `_N` collision variants.
pub fn prior_run_candidates(
    dir: &Path,
    taken_at: &NaiveDateTime,
    index: u64,
    ext: &str,
) -> Vec<PathBuf> {
    let ts = timestamp_stem(taken_at);
    let stems = [format!("{}_{}", ts, index), ts];

    let mut candidates = Vec::new();
    for stem in &stems {
        candidates.push(dir.join(format!("{}{}", stem, ext)));
        // Collision-suffixed variants actually present on disk.
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.ends_with(ext) {
                    continue;
                }
                let base = &name[..name.len() - ext.len()];
                if let Some(rest) = base.strip_prefix(stem.as_str()) {
                    if rest
                        .strip_prefix('_')
                        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                    {
                        candidates.push(entry.path());
                    }
                }
            }
        }
    }
    candidates.dedup();
    candidates
}
