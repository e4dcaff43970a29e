//! Lenient dotted-version comparison.
//!
//! Versions are split on `.` and compared segment by segment as integers.
//! Missing trailing segments count as `0`, and so does any segment that is not
//! a plain number. Malformed input therefore never errors; it just compares low.

use crate::types::{InstalledRecord, ToolStatus};
use std::cmp::Ordering;

fn segments(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    trimmed
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// Compare two version strings. `Greater` means `a` is the later version.
pub fn compare(a: &str, b: &str) -> Ordering {
    let left = segments(a);
    let right = segments(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Same as [`compare`], rendered as `-1`, `0` or `1`.
pub fn compare_versions(a: &str, b: &str) -> i32 {
    match compare(a, b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// Classify a catalog version against what is installed locally.
pub fn classify(catalog_version: &str, installed: Option<&InstalledRecord>) -> ToolStatus {
    match installed {
        None => ToolStatus::NotDownloaded,
        Some(record) => match record.version.as_deref() {
            Some(local) if compare(catalog_version, local) == Ordering::Greater => {
                ToolStatus::NeedUpdate
            }
            _ => ToolStatus::Downloaded,
        },
    }
}

pub fn needs_app_update(current: &str, latest: &str) -> bool {
    compare(latest, current) == Ordering::Greater
}

/// The running version is below the minimum the server still supports.
pub fn needs_force_update(current: &str, min_version: &str) -> bool {
    compare(current, min_version) == Ordering::Less
}
