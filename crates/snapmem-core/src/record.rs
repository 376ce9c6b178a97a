use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Map the export's "Media Type" field.
    pub fn from_export(s: &str) -> Option<Self> {
        match s {
            "Image" | "PHOTO" => Some(MediaKind::Image),
            "Video" | "VIDEO" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Canonical output extension (with dot).
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Image => ".jpg",
            MediaKind::Video => ".mp4",
        }
    }
}

/// One exported memory. Immutable once read from the export; source of
/// truth for naming and metadata.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MediaKind,
    /// Capture timestamp as stored in the export (UTC wall clock).
    pub taken_at: NaiveDateTime,
    /// Offset from UTC in minutes, when the export carries one.
    pub utc_offset_minutes: Option<i32>,
    /// (latitude, longitude)
    pub location: Option<(f64, f64)>,
    pub url: String,
    pub overlay_url: Option<String>,
}

impl MemoryRecord {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}
