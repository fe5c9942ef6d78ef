// ABOUTME: Defines RecoveryCursor, the per-field count of database elements already flushed to the journal.
// ABOUTME: The same shape doubles as a snapshot of field lengths at a commit point.

use serde::{Deserialize, Serialize};

/// One counter per tracked field of an `ArchiveDatabase`. As a flush cursor it
/// marks how many elements of each field have been written to the journal;
/// as a snapshot it records each field's length at some point in time.
///
/// A cursor is an ordinary value: each journal session builds its own and
/// threads it through every checkpoint append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCursor {
    pub start_pos: usize,
    pub ctime: usize,
    pub mtime: usize,
    pub atime: usize,
    pub pack_crc_defined: usize,
    pub pack_crcs: usize,
    pub pack_sizes: usize,
    pub num_unpack_streams: usize,
    pub is_anti: usize,
    pub entries: usize,
    pub folders: usize,
}

impl RecoveryCursor {
    /// A cursor with nothing flushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every counter of `self` is at most the matching counter of `other`.
    pub fn is_at_or_before(&self, other: &RecoveryCursor) -> bool {
        self.start_pos <= other.start_pos
            && self.ctime <= other.ctime
            && self.mtime <= other.mtime
            && self.atime <= other.atime
            && self.pack_crc_defined <= other.pack_crc_defined
            && self.pack_crcs <= other.pack_crcs
            && self.pack_sizes <= other.pack_sizes
            && self.num_unpack_streams <= other.num_unpack_streams
            && self.is_anti <= other.is_anti
            && self.entries <= other.entries
            && self.folders <= other.folders
    }
}
