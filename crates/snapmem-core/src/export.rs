use chrono::NaiveDateTime;

use crate::record::{MediaKind, MemoryRecord};

/// Date format used by the export: "2021-07-04 18:30:05 UTC"
const EXPORT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Parse a Snapchat `memories_history.json` export into records.
///
/// Entries missing a URL, a parseable date or a known media type are
/// skipped; their indices are returned alongside so the caller can log
/// them.
pub fn parse_export(json_bytes: &[u8]) -> anyhow::Result<(Vec<MemoryRecord>, Vec<usize>)> {
    let data: serde_json::Value = serde_json::from_slice(json_bytes)?;
    let items = data
        .get("Saved Media")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("export has no \"Saved Media\" array"))?;

    let mut records = Vec::with_capacity(items.len());
    let mut skipped = Vec::new();

    for (i, item) in items.iter().enumerate() {
        match parse_item(item, i) {
            Some(record) => records.push(record),
            None => skipped.push(i + 1),
        }
    }

    Ok((records, skipped))
}

fn parse_item(item: &serde_json::Value, index: usize) -> Option<MemoryRecord> {
    let field = |name: &str| item.get(name).and_then(|v| v.as_str());

    let url = field("Media Download Url")
        .or_else(|| field("Download Link"))
        .filter(|s| !s.is_empty())?
        .to_string();
    let taken_at = parse_export_date(field("Date")?)?;
    let kind = MediaKind::from_export(field("Media Type")?)?;
    let location = field("Location").and_then(parse_location);
    let overlay_url = field("Overlay Download Url")
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let id = field("Media ID")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}#{}", taken_at.format("%Y%m%d_%H%M%S"), index + 1));

    Some(MemoryRecord {
        id,
        kind,
        taken_at,
        utc_offset_minutes: None,
        location,
        url,
        overlay_url,
    })
}

fn parse_export_date(date_str: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(date_str.trim(), EXPORT_DATE_FORMAT).ok()
}

/// "Latitude, Longitude: 40.712800, -74.006000" -> (40.7128, -74.006)
fn parse_location(location_str: &str) -> Option<(f64, f64)> {
    if location_str.is_empty() || location_str == "N/A" {
        return None;
    }
    let coords = location_str.split(": ").nth(1)?;
    let mut parts = coords.split(", ");
    let lat = parts.next()?.trim().parse::<f64>().ok()?;
    let lon = parts.next()?.trim().parse::<f64>().ok()?;
    Some((lat, lon))
}
