use std::path::{Path, PathBuf};

use crate::convert::TARGET_CODEC;
use crate::naming;
use crate::record::MemoryRecord;
use crate::validate;
use crate::RunOptions;

/// What a prior run already did for a record. Advisory only: planning never
/// deletes or mutates existing files, it only decides whether the
/// orchestrator runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    AlreadyComplete(PathBuf),
    NeedsReconvert(PathBuf),
    NeedsDownload,
}

/// Decide whether prior output already satisfies `record`.
///
/// Checks every canonical name a prior run could have produced (indexed,
/// un-indexed merged, collision-suffixed); any existing non-empty match
/// counts. With reconvert checking enabled, an existing video whose codec
/// is not the target is reported for in-place conversion instead.
pub fn plan_record(
    record: &MemoryRecord,
    dest_dir: &Path,
    index: u64,
    options: &RunOptions,
) -> ResumePlan {
    let ext = record.kind.extension();
    let existing = naming::prior_run_candidates(dest_dir, &record.taken_at, index, ext)
        .into_iter()
        .find(|p| non_empty(p));

    let Some(path) = existing else {
        return ResumePlan::NeedsDownload;
    };

    if record.is_video() && options.convert_videos && options.check_existing {
        let report = validate::probe_video(&path, 1);
        if let Some(codec) = report.codec.as_deref() {
            if codec != TARGET_CODEC {
                return ResumePlan::NeedsReconvert(path);
            }
        }
    }

    ResumePlan::AlreadyComplete(path)
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
