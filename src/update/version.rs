use std::cmp::Ordering;

use super::error::VersionParseError;

/// Version of this build, used when the config does not override it
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse a dotted numeric version (with or without 'v' prefix) into its segments
pub fn parse_version(version_str: &str) -> Result<Vec<u64>, VersionParseError> {
    let fail = |reason: &str| VersionParseError {
        input: version_str.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = version_str.trim();
    let cleaned = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if cleaned.is_empty() {
        return Err(fail("empty version"));
    }

    cleaned
        .split('.')
        .map(|segment| {
            if segment.is_empty() {
                return Err(fail("empty segment"));
            }
            if !segment.bytes().all(|b| b.is_ascii_digit()) {
                return Err(fail("segments must be non-negative integers"));
            }
            segment
                .parse::<u64>()
                .map_err(|_| fail("segment out of range"))
        })
        .collect()
}

/// Order two parsed versions, treating the shorter one as zero-padded
pub fn compare_segments(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Compare versions, returns true if remote is strictly newer than current.
///
/// Fails closed: callers should treat `Err` as "not newer".
pub fn is_newer(remote: &str, current: &str) -> Result<bool, VersionParseError> {
    let remote_ver = parse_version(remote)?;
    let current_ver = parse_version(current)?;
    Ok(compare_segments(&remote_ver, &current_ver) == Ordering::Greater)
}
