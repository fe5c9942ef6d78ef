// ABOUTME: Core library for packrat, containing the archive database model and host interfaces.
// ABOUTME: This crate defines the shared data types used by the journal, volume stream, and sessions.

pub mod cursor;
pub mod database;
pub mod model;
pub mod optional;
pub mod property;

use thiserror::Error;

pub use cursor::RecoveryCursor;
pub use database::{ArchiveDatabase, EntryTimes, PackedStream};
pub use model::{ATTRIBUTE_DIRECTORY, BindPair, CoderDescriptor, Entry, Folder};
pub use optional::OptionalVector;
pub use property::{PropValue, PropertyKind, PropertyProvider, ProviderError, UpdateItemInfo};

/// Violations of the archive database invariants.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("field {field} has {len} elements, expected {expected}")]
    MisalignedField {
        field: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("optional vector holds more values than flags")]
    SparseOverflow,

    #[error("bind pair {side} index {index} outside the folder's {limit} streams")]
    BindPairOutOfRange {
        index: u32,
        limit: u64,
        side: &'static str,
    },

    #[error("pack stream {0} referenced twice in one folder")]
    DuplicatePackStream(u32),

    #[error("packed streams total {total} bytes but only {physical} are present")]
    PackedOverflow { total: u64, physical: u64 },
}
