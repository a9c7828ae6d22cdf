//! On-disk detection archive: `detections.jsonl` plus the label file.
//!
//! The JSONL log is append-only on the camera side; the dashboard may
//! rewrite it to delete events. Labels live in a separate per-camera
//! `detection_labels.json` keyed by the event's wall-timestamp string, so
//! relabelling never touches the append-only log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use detect_core::DetectionRecord;
use tracing::warn;

pub const DETECTIONS_FILE: &str = "detections.jsonl";
pub const LABELS_FILE: &str = "detection_labels.json";

/// The closed set of labels accepted on write. The empty string clears a
/// label.
pub const ALLOWED_LABELS: [&str; 4] = ["", "meteor", "non-meteor", "post_detected"];

pub fn is_allowed_label(label: &str) -> bool {
    ALLOWED_LABELS.contains(&label)
}

/// Labels read back from disk: anything outside the closed set collapses
/// to "" (unclassified), absorbing vocabulary drift from older versions.
pub fn normalize_label(label: &str) -> &str {
    if label.is_empty() || !is_allowed_label(label) {
        ""
    } else {
        label
    }
}

/// Append one record to the camera's JSONL log.
///
/// A single `write_all` of the full line plus the trailing flush keeps
/// tailing readers from ever observing a half-line.
pub fn append_detection(camera_dir: &Path, record: &DetectionRecord) -> Result<()> {
    fs::create_dir_all(camera_dir)
        .with_context(|| format!("creating {}", camera_dir.display()))?;
    let path = camera_dir.join(DETECTIONS_FILE);
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Read every parseable record; malformed lines are skipped with a warning.
pub fn read_detections(camera_dir: &Path) -> Vec<DetectionRecord> {
    let path = camera_dir.join(DETECTIONS_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };
    let mut records = Vec::new();
    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DetectionRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(path = %path.display(), "skipping malformed line: {err}"),
        }
    }
    records
}

/// Remove every record whose timestamp starts with `timestamp_prefix`.
/// The file is rewritten through a temp file and renamed into place.
pub fn remove_detection_lines(camera_dir: &Path, timestamp_prefix: &str) -> Result<usize> {
    let path = camera_dir.join(DETECTIONS_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let file = File::open(&path)?;
    let tmp_path = path.with_extension("jsonl.tmp");
    let mut tmp = File::create(&tmp_path)?;
    let mut removed = 0;

    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        let keep = match serde_json::from_str::<DetectionRecord>(&line) {
            Ok(record) => !record.timestamp.starts_with(timestamp_prefix),
            // Preserve lines we cannot parse; deleting them would lose data.
            Err(_) => true,
        };
        if keep {
            writeln!(tmp, "{line}")?;
        } else {
            removed += 1;
        }
    }
    tmp.flush()?;
    fs::rename(&tmp_path, &path)?;
    Ok(removed)
}

/// Load the per-camera label map, normalising unknown labels away.
pub fn load_labels(camera_dir: &Path) -> BTreeMap<String, String> {
    let path = camera_dir.join(LABELS_FILE);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str::<BTreeMap<String, String>>(&data) {
        Ok(map) => map
            .into_iter()
            .map(|(k, v)| {
                let normalized = normalize_label(&v).to_string();
                (k, normalized)
            })
            .filter(|(_, v)| !v.is_empty())
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), "label file unreadable: {err}");
            BTreeMap::new()
        }
    }
}

fn save_labels(camera_dir: &Path, labels: &BTreeMap<String, String>) -> Result<()> {
    fs::create_dir_all(camera_dir)?;
    let path = camera_dir.join(LABELS_FILE);
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = File::create(&tmp_path)?;
    serde_json::to_writer(&mut tmp, labels)?;
    tmp.flush()?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Insert, replace, or (with an empty label) remove one label entry.
pub fn upsert_label(camera_dir: &Path, timestamp: &str, label: &str) -> Result<()> {
    let mut labels = load_labels(camera_dir);
    if label.is_empty() {
        labels.remove(timestamp);
    } else {
        labels.insert(timestamp.to_string(), label.to_string());
    }
    save_labels(camera_dir, &labels)
}

/// Remove every label whose key starts with `timestamp_prefix`.
pub fn remove_labels_with_prefix(camera_dir: &Path, timestamp_prefix: &str) -> Result<usize> {
    let mut labels = load_labels(camera_dir);
    let before = labels.len();
    labels.retain(|key, _| !key.starts_with(timestamp_prefix));
    let removed = before - labels.len();
    if removed > 0 {
        save_labels(camera_dir, &labels)?;
    }
    Ok(removed)
}

/// Files an event may own on disk, existing or not.
pub fn event_file_candidates(camera_dir: &Path, base_name: &str) -> Vec<PathBuf> {
    [
        format!("{base_name}.mov"),
        format!("{base_name}.mp4"),
        format!("{base_name}_composite.jpg"),
        format!("{base_name}_composite_original.jpg"),
    ]
    .into_iter()
    .map(|name| camera_dir.join(name))
    .collect()
}

/// Delete the clip and composites for one event; returns deleted names.
pub fn delete_event_files(camera_dir: &Path, base_name: &str) -> Vec<String> {
    let mut deleted = Vec::new();
    for path in event_file_candidates(camera_dir, base_name) {
        if path.exists() && fs::remove_file(&path).is_ok() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                deleted.push(name.to_string());
            }
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use detect_core::MeteorEvent;
    use tempfile::TempDir;

    fn record(second: u32) -> DetectionRecord {
        MeteorEvent {
            wall: NaiveDate::from_ymd_opt(2026, 2, 2)
                .unwrap()
                .and_hms_micro_opt(6, 55, second, 411_811)
                .unwrap(),
            start_ts: 125.34,
            end_ts: 125.78,
            start_point: (320, 180),
            end_point: (450, 220),
            peak_brightness: 245.3,
            confidence: 0.87,
        }
        .to_record()
    }

    #[test]
    fn append_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        append_detection(dir.path(), &record(10)).unwrap();
        append_detection(dir.path(), &record(20)).unwrap();

        let records = read_detections(dir.path());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record(10));
        assert_eq!(records[1], record(20));
    }

    #[test]
    fn rewrite_after_read_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        append_detection(dir.path(), &record(10)).unwrap();
        let original = fs::read_to_string(dir.path().join(DETECTIONS_FILE)).unwrap();

        let records = read_detections(dir.path());
        let other = TempDir::new().unwrap();
        append_detection(other.path(), &records[0]).unwrap();
        let rewritten = fs::read_to_string(other.path().join(DETECTIONS_FILE)).unwrap();
        assert_eq!(original, rewritten);
    }

    #[test]
    fn malformed_lines_are_skipped_but_preserved() {
        let dir = TempDir::new().unwrap();
        append_detection(dir.path(), &record(10)).unwrap();
        let path = dir.path().join(DETECTIONS_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        append_detection(dir.path(), &record(20)).unwrap();

        assert_eq!(read_detections(dir.path()).len(), 2);
        remove_detection_lines(dir.path(), "2026-02-02T06:55:10").unwrap();
        let remaining = fs::read_to_string(&path).unwrap();
        assert!(remaining.contains("{not json"));
        assert_eq!(read_detections(dir.path()).len(), 1);
    }

    #[test]
    fn label_upsert_and_normalisation() {
        let dir = TempDir::new().unwrap();
        upsert_label(dir.path(), "2026-02-02T06:55:10.411811", "non-meteor").unwrap();
        upsert_label(dir.path(), "2026-02-02T06:55:20.411811", "meteor").unwrap();

        let labels = load_labels(dir.path());
        assert_eq!(labels.len(), 2);
        assert_eq!(
            labels.get("2026-02-02T06:55:10.411811").map(String::as_str),
            Some("non-meteor")
        );

        // Clearing via empty label removes the entry.
        upsert_label(dir.path(), "2026-02-02T06:55:10.411811", "").unwrap();
        assert_eq!(load_labels(dir.path()).len(), 1);
    }

    #[test]
    fn unknown_labels_read_back_as_unset() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(LABELS_FILE),
            r#"{"2026-02-02T06:55:10.411811":"detected","k2":"meteor"}"#,
        )
        .unwrap();
        let labels = load_labels(dir.path());
        assert!(!labels.contains_key("2026-02-02T06:55:10.411811"));
        assert_eq!(labels.get("k2").map(String::as_str), Some("meteor"));
    }

    #[test]
    fn delete_removes_files_line_and_label() {
        let dir = TempDir::new().unwrap();
        let rec = record(10);
        append_detection(dir.path(), &rec).unwrap();
        append_detection(dir.path(), &record(20)).unwrap();
        upsert_label(dir.path(), &rec.timestamp, "non-meteor").unwrap();

        let base = rec.base_name().unwrap();
        fs::write(dir.path().join(format!("{base}.mov")), b"clip").unwrap();
        fs::write(dir.path().join(format!("{base}_composite.jpg")), b"jpg").unwrap();

        let deleted = delete_event_files(dir.path(), &base);
        assert_eq!(deleted.len(), 2);
        let removed = remove_detection_lines(dir.path(), "2026-02-02T06:55:10").unwrap();
        assert_eq!(removed, 1);
        remove_labels_with_prefix(dir.path(), "2026-02-02T06:55:10").unwrap();

        assert_eq!(read_detections(dir.path()).len(), 1);
        assert!(load_labels(dir.path()).is_empty());
        assert!(!dir.path().join(format!("{base}.mov")).exists());
    }
}
