// ABOUTME: Defines ArchiveDatabase, the in-memory table of entries, folders, and their parallel fields.
// ABOUTME: Supports delta slicing, appending, and truncation against a RecoveryCursor.

use serde::{Deserialize, Serialize};

use crate::ModelError;
use crate::cursor::RecoveryCursor;
use crate::model::{Entry, Folder};
use crate::optional::OptionalVector;

/// Per-entry values stored in the optional fields next to `entries`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTimes {
    pub ctime: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
    pub start_pos: Option<u64>,
}

/// One packed stream of a folder, as recorded in the three pack fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedStream {
    pub size: u64,
    pub crc: Option<u32>,
}

/// The archive's item table. Per-entry fields (`start_pos`, the three
/// timestamps, `is_anti`) are index-aligned with `entries`; per-folder
/// `num_unpack_streams` is aligned with `folders`; the three pack fields
/// are aligned with each other, one element per packed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDatabase {
    pub entries: Vec<Entry>,
    pub folders: Vec<Folder>,
    pub start_pos: OptionalVector<u64>,
    pub ctime: OptionalVector<u64>,
    pub mtime: OptionalVector<u64>,
    pub atime: OptionalVector<u64>,
    pub pack_crc_defined: Vec<bool>,
    pub pack_crcs: Vec<u32>,
    pub pack_sizes: Vec<u64>,
    pub num_unpack_streams: Vec<u32>,
    pub is_anti: Vec<bool>,
}

impl ArchiveDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry together with its aligned per-entry fields.
    pub fn push_entry(&mut self, entry: Entry, times: EntryTimes, is_anti: bool) {
        self.entries.push(entry);
        self.start_pos.push(times.start_pos);
        self.ctime.push(times.ctime);
        self.mtime.push(times.mtime);
        self.atime.push(times.atime);
        self.is_anti.push(is_anti);
    }

    /// Append a folder, the number of entries it unpacks to, and its packed streams.
    pub fn push_folder(&mut self, folder: Folder, num_unpack_streams: u32, packed: &[PackedStream]) {
        self.folders.push(folder);
        self.num_unpack_streams.push(num_unpack_streams);
        for stream in packed {
            self.pack_sizes.push(stream.size);
            self.pack_crc_defined.push(stream.crc.is_some());
            self.pack_crcs.push(stream.crc.unwrap_or(0));
        }
    }

    /// Timestamps and start position of entry `index`.
    pub fn entry_times(&self, index: usize) -> EntryTimes {
        EntryTimes {
            ctime: self.ctime.get(index),
            atime: self.atime.get(index),
            mtime: self.mtime.get(index),
            start_pos: self.start_pos.get(index),
        }
    }

    /// Current length of every tracked field.
    pub fn lengths(&self) -> RecoveryCursor {
        RecoveryCursor {
            start_pos: self.start_pos.len(),
            ctime: self.ctime.len(),
            mtime: self.mtime.len(),
            atime: self.atime.len(),
            pack_crc_defined: self.pack_crc_defined.len(),
            pack_crcs: self.pack_crcs.len(),
            pack_sizes: self.pack_sizes.len(),
            num_unpack_streams: self.num_unpack_streams.len(),
            is_anti: self.is_anti.len(),
            entries: self.entries.len(),
            folders: self.folders.len(),
        }
    }

    /// The elements of every field at or after the cursor's position.
    /// Counters past a field's end yield an empty slice for that field.
    pub fn slice_from(&self, cursor: &RecoveryCursor) -> ArchiveDatabase {
        fn tail<T: Clone>(items: &[T], from: usize) -> Vec<T> {
            items.get(from..).map(<[T]>::to_vec).unwrap_or_default()
        }
        fn tail_opt(v: &OptionalVector<u64>, from: usize) -> OptionalVector<u64> {
            v.iter().skip(from).collect()
        }

        ArchiveDatabase {
            entries: tail(&self.entries, cursor.entries),
            folders: tail(&self.folders, cursor.folders),
            start_pos: tail_opt(&self.start_pos, cursor.start_pos),
            ctime: tail_opt(&self.ctime, cursor.ctime),
            mtime: tail_opt(&self.mtime, cursor.mtime),
            atime: tail_opt(&self.atime, cursor.atime),
            pack_crc_defined: tail(&self.pack_crc_defined, cursor.pack_crc_defined),
            pack_crcs: tail(&self.pack_crcs, cursor.pack_crcs),
            pack_sizes: tail(&self.pack_sizes, cursor.pack_sizes),
            num_unpack_streams: tail(&self.num_unpack_streams, cursor.num_unpack_streams),
            is_anti: tail(&self.is_anti, cursor.is_anti),
        }
    }

    /// Append every field of `delta` after this database's own elements.
    pub fn extend(&mut self, delta: &ArchiveDatabase) {
        self.start_pos.extend_from(&delta.start_pos);
        self.ctime.extend_from(&delta.ctime);
        self.mtime.extend_from(&delta.mtime);
        self.atime.extend_from(&delta.atime);
        self.pack_crc_defined.extend_from_slice(&delta.pack_crc_defined);
        self.pack_crcs.extend_from_slice(&delta.pack_crcs);
        self.pack_sizes.extend_from_slice(&delta.pack_sizes);
        self.num_unpack_streams.extend_from_slice(&delta.num_unpack_streams);
        self.is_anti.extend_from_slice(&delta.is_anti);
        self.entries.extend(delta.entries.iter().cloned());
        self.folders.extend(delta.folders.iter().cloned());
    }

    /// Cut every field back to the lengths recorded in `lengths`.
    pub fn truncate_to(&mut self, lengths: &RecoveryCursor) {
        self.start_pos.truncate(lengths.start_pos);
        self.ctime.truncate(lengths.ctime);
        self.mtime.truncate(lengths.mtime);
        self.atime.truncate(lengths.atime);
        self.pack_crc_defined.truncate(lengths.pack_crc_defined);
        self.pack_crcs.truncate(lengths.pack_crcs);
        self.pack_sizes.truncate(lengths.pack_sizes);
        self.num_unpack_streams.truncate(lengths.num_unpack_streams);
        self.is_anti.truncate(lengths.is_anti);
        self.entries.truncate(lengths.entries);
        self.folders.truncate(lengths.folders);
    }

    /// Index of the first entry named exactly `name`.
    pub fn find_entry(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Sum of all packed stream sizes.
    pub fn total_pack_size(&self) -> u64 {
        self.pack_sizes.iter().sum()
    }

    /// The folder holding the content of entry `index`. Content entries are
    /// assigned to folders in order, each folder taking as many entries as
    /// its unpack-stream count.
    pub fn folder_of_entry(&self, index: usize) -> Option<usize> {
        let entry = self.entries.get(index)?;
        if !entry.has_stream {
            return None;
        }

        let content_rank = self.entries[..index]
            .iter()
            .filter(|e| e.has_stream)
            .count();

        let mut remaining = content_rank;
        for (folder_index, &count) in self.num_unpack_streams.iter().enumerate() {
            let count = count as usize;
            if remaining < count {
                return (folder_index < self.folders.len()).then_some(folder_index);
            }
            remaining -= count;
        }
        None
    }

    /// Check the parallel-sequence invariants and every folder's wiring.
    pub fn validate(&self) -> Result<(), ModelError> {
        let entries = self.entries.len();
        let per_entry = [
            ("start_pos", self.start_pos.len()),
            ("ctime", self.ctime.len()),
            ("mtime", self.mtime.len()),
            ("atime", self.atime.len()),
            ("is_anti", self.is_anti.len()),
        ];
        for (field, len) in per_entry {
            if len != entries {
                return Err(ModelError::MisalignedField {
                    field,
                    len,
                    expected: entries,
                });
            }
        }

        if self.num_unpack_streams.len() != self.folders.len() {
            return Err(ModelError::MisalignedField {
                field: "num_unpack_streams",
                len: self.num_unpack_streams.len(),
                expected: self.folders.len(),
            });
        }

        let packs = self.pack_sizes.len();
        for (field, len) in [
            ("pack_crc_defined", self.pack_crc_defined.len()),
            ("pack_crcs", self.pack_crcs.len()),
        ] {
            if len != packs {
                return Err(ModelError::MisalignedField {
                    field,
                    len,
                    expected: packs,
                });
            }
        }

        for v in [&self.start_pos, &self.ctime, &self.mtime, &self.atime] {
            if !v.is_well_formed() {
                return Err(ModelError::SparseOverflow);
            }
        }

        for folder in &self.folders {
            folder.validate()?;
        }

        Ok(())
    }

    /// Check that the referenced packed streams fit in `physical_len` bytes
    /// of packed data.
    pub fn validate_packed_len(&self, physical_len: u64) -> Result<(), ModelError> {
        let total = self.total_pack_size();
        if total > physical_len {
            return Err(ModelError::PackedOverflow {
                total,
                physical: physical_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CoderDescriptor;

    fn push_file(db: &mut ArchiveDatabase, name: &str, size: u64) {
        let times = EntryTimes {
            mtime: Some(132_000_000_000_000_000),
            ..EntryTimes::default()
        };
        db.push_entry(Entry::file(name, size, Some(0x1234)), times, false);
        if size > 0 {
            let folder = Folder::single(CoderDescriptor::simple(0x21, vec![0x18]), size, Some(0x1234));
            db.push_folder(folder, 1, &[PackedStream { size: size / 2, crc: None }]);
        }
    }

    #[test]
    fn lengths_track_every_field() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 10);
        push_file(&mut db, "empty.txt", 0);

        let lengths = db.lengths();
        assert_eq!(lengths.entries, 2);
        assert_eq!(lengths.mtime, 2);
        assert_eq!(lengths.folders, 1);
        assert_eq!(lengths.pack_sizes, 1);
    }

    #[test]
    fn slice_then_extend_rebuilds_database() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 10);
        let mid = db.lengths();
        push_file(&mut db, "b.txt", 20);

        let mut rebuilt = db.clone();
        rebuilt.truncate_to(&mid);
        let delta = db.slice_from(&mid);
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(delta.entries[0].name, "b.txt");

        rebuilt.extend(&delta);
        assert_eq!(rebuilt, db);
    }

    #[test]
    fn slice_past_end_is_empty() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 10);
        let beyond = RecoveryCursor {
            entries: 10,
            ..db.lengths()
        };

        assert!(db.slice_from(&beyond).entries.is_empty());
    }

    #[test]
    fn entry_times_reads_back_pushed_values() {
        let mut db = ArchiveDatabase::new();
        let times = EntryTimes {
            ctime: Some(7),
            atime: None,
            mtime: Some(9),
            start_pos: Some(0),
        };
        db.push_entry(Entry::named("a"), times, false);

        assert_eq!(db.entry_times(0), times);
        assert_eq!(db.entry_times(1), EntryTimes::default());
    }

    #[test]
    fn find_entry_returns_first_match() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "dup.txt", 1);
        push_file(&mut db, "dup.txt", 2);

        assert_eq!(db.find_entry("dup.txt"), Some(0));
        assert_eq!(db.find_entry("missing"), None);
    }

    #[test]
    fn folder_of_entry_skips_empty_entries() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 10);
        push_file(&mut db, "empty.txt", 0);
        push_file(&mut db, "b.txt", 30);

        assert_eq!(db.folder_of_entry(0), Some(0));
        assert_eq!(db.folder_of_entry(1), None);
        assert_eq!(db.folder_of_entry(2), Some(1));
        assert_eq!(db.folder_of_entry(3), None);
    }

    #[test]
    fn folder_of_entry_handles_solid_folders() {
        let mut db = ArchiveDatabase::new();
        for name in ["x", "y", "z"] {
            db.entries.push(Entry::file(name, 5, None));
        }
        db.folders.push(Folder::default());
        db.folders.push(Folder::default());
        db.num_unpack_streams = vec![2, 1];

        assert_eq!(db.folder_of_entry(0), Some(0));
        assert_eq!(db.folder_of_entry(1), Some(0));
        assert_eq!(db.folder_of_entry(2), Some(1));
    }

    #[test]
    fn validate_accepts_aligned_database() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 10);
        push_file(&mut db, "b.txt", 0);

        assert!(db.validate().is_ok());
        assert!(db.validate_packed_len(5).is_ok());
    }

    #[test]
    fn validate_reports_misaligned_timestamps() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 10);
        db.mtime.push(None);

        let err = db.validate().unwrap_err();
        assert!(matches!(err, ModelError::MisalignedField { field: "mtime", .. }));
    }

    #[test]
    fn validate_packed_len_rejects_overflow() {
        let mut db = ArchiveDatabase::new();
        push_file(&mut db, "a.txt", 100);

        let err = db.validate_packed_len(10).unwrap_err();
        assert!(matches!(err, ModelError::PackedOverflow { total: 50, physical: 10 }));
    }
}
