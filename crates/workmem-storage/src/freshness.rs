//! Modification-time based freshness checks.

use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::Result;

/// Time since `path` was last modified, or `None` if it does not exist.
///
/// An mtime in the future (clock skew) counts as zero age.
pub fn file_age(path: &Path) -> Result<Option<Duration>> {
    let Some(modified) = modified_system_time(path)? else {
        return Ok(None);
    };
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}

/// Last-modified time of `path` in UTC.
pub fn modified_at(path: &Path) -> Result<Option<DateTime<Utc>>> {
    Ok(modified_system_time(path)?.map(DateTime::<Utc>::from))
}

/// Whether `path` was modified less than `threshold` ago.
///
/// A missing file is never throttled.
pub fn is_throttled(path: &Path, threshold: Duration) -> Result<bool> {
    Ok(file_age(path)?.is_some_and(|age| age < threshold))
}

/// Whether `path` is older than `threshold`. A missing file is not "old".
pub fn is_older_than(path: &Path, threshold: Duration) -> Result<bool> {
    Ok(file_age(path)?.is_some_and(|age| age > threshold))
}

fn modified_system_time(path: &Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
