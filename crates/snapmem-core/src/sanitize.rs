use std::path::{Component, Path, PathBuf};

/// Characters some conversion backends append to reported paths when their
/// own format strings are not escaped properly (VLC `--sout` in particular
/// leaks trailing `}` characters).
const STRAY_TRAILING: &[char] = &['}', ' ', '\t', '\r', '\n'];

/// Clean a path string reported by an external tool and resolve it to an
/// absolute, normalized form.
///
/// Returns None for empty or whitespace-only input instead of guessing.
pub fn sanitize_path(raw: &str) -> Option<PathBuf> {
    let cleaned = raw
        .trim_end_matches(STRAY_TRAILING)
        .trim_start_matches([' ', '\t']);
    if cleaned.is_empty() {
        return None;
    }

    let path = Path::new(cleaned);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Some(normalize(&absolute))
}

/// Lexically resolve `.` and `..` components. Does not touch the
/// filesystem, so a not-yet-existing temp output still normalizes.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
