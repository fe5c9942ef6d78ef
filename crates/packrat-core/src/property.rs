// ABOUTME: The metadata-provider interface a host implements to describe pending archive items.
// ABOUTME: Values arrive typed; consumers reject values whose type disagrees with the property kind.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds between the FILETIME epoch (1601-01-01) and the Unix epoch.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// The per-item properties an update asks the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    Path,
    IsDir,
    Size,
    Attrib,
    CTime,
    ATime,
    MTime,
    IsAnti,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyKind::Path => "path",
            PropertyKind::IsDir => "is_dir",
            PropertyKind::Size => "size",
            PropertyKind::Attrib => "attrib",
            PropertyKind::CTime => "ctime",
            PropertyKind::ATime => "atime",
            PropertyKind::MTime => "mtime",
            PropertyKind::IsAnti => "is_anti",
        };
        f.write_str(name)
    }
}

/// A typed property value. `Empty` means the host has no value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropValue {
    Empty,
    Bool(bool),
    U32(u32),
    U64(u64),
    Str(String),
    /// 100-nanosecond ticks since 1601-01-01 UTC.
    FileTime(u64),
}

impl PropValue {
    /// Short name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropValue::Empty => "empty",
            PropValue::Bool(_) => "bool",
            PropValue::U32(_) => "u32",
            PropValue::U64(_) => "u64",
            PropValue::Str(_) => "string",
            PropValue::FileTime(_) => "filetime",
        }
    }
}

/// What the host wants done with pending item `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateItemInfo {
    pub new_data: bool,
    pub new_properties: bool,
    /// Index of the item in the existing archive, when it already exists there.
    pub index_in_archive: Option<u32>,
}

/// A failure reported by the host while answering a query.
#[derive(Debug, Error)]
#[error("property provider failed: {0}")]
pub struct ProviderError(pub String);

/// Answers property queries about pending items.
pub trait PropertyProvider {
    fn update_item_info(&self, index: u32) -> Result<UpdateItemInfo, ProviderError>;

    fn property(&self, index: u32, kind: PropertyKind) -> Result<PropValue, ProviderError>;
}

/// Convert FILETIME ticks to a UTC timestamp. Returns None when out of range.
pub fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(ticks / FILETIME_TICKS_PER_SEC).ok()? - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ticks % FILETIME_TICKS_PER_SEC) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Convert a UTC timestamp to FILETIME ticks. Times before 1601 clamp to zero.
pub fn datetime_to_filetime(at: DateTime<Utc>) -> u64 {
    let secs = at.timestamp() + FILETIME_UNIX_OFFSET_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * FILETIME_TICKS_PER_SEC + u64::from(at.timestamp_subsec_nanos() / 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_in_filetime_ticks() {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap();
        assert_eq!(datetime_to_filetime(epoch), 116_444_736_000_000_000);
        assert_eq!(filetime_to_datetime(116_444_736_000_000_000), Some(epoch));
    }

    #[test]
    fn filetime_keeps_sub_second_ticks() {
        let ticks = 132_000_000_000_000_123;
        let at = filetime_to_datetime(ticks).unwrap();
        assert_eq!(datetime_to_filetime(at), ticks);
    }

    #[test]
    fn type_names_are_stable() {
        assert_eq!(PropValue::Empty.type_name(), "empty");
        assert_eq!(PropValue::FileTime(1).type_name(), "filetime");
        assert_eq!(PropertyKind::MTime.to_string(), "mtime");
    }

    #[test]
    fn prop_value_serializes_as_json() {
        let json = serde_json::to_string(&PropValue::Str("a/b.txt".to_string())).unwrap();
        let back: PropValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PropValue::Str("a/b.txt".to_string()));
    }
}
