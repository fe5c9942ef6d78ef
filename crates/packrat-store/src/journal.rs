// ABOUTME: Recovery journal manager: append checkpoints, soft-delete pending entries, and resume after a crash.
// ABOUTME: Replay rolls the database back to the last checkpoint whose final entry is a commit marker.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use packrat_core::{ArchiveDatabase, Entry, ModelError, RecoveryCursor};
use serde::Serialize;
use thiserror::Error;

use crate::codec::{self, CodecError, Decoded};

/// Errors that can occur while writing or replaying a journal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("malformed journal at byte {offset}: {reason}")]
    Format { offset: u64, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("no entry named {0:?}")]
    NotFound(String),

    #[error("flush cursor is ahead of the database")]
    CursorAhead,

    #[error("recovered database is inconsistent: {0}")]
    Model(#[from] ModelError),
}

impl JournalError {
    /// Lift a codec error raised while decoding bytes that start at `base`.
    fn from_codec(err: CodecError, base: usize) -> Self {
        match err {
            CodecError::Format { offset, reason } => JournalError::Format {
                offset: (base + offset) as u64,
                reason,
            },
            CodecError::Truncated => JournalError::Format {
                offset: base as u64,
                reason: "journal ends inside its header".to_string(),
            },
            CodecError::Io(e) => JournalError::Io(e),
        }
    }
}

/// Backing store of a journal: a dedicated file or a volume set.
pub trait JournalStorage: Write + Seek {
    /// Force written bytes to durable storage.
    fn sync(&mut self) -> io::Result<()>;

    /// Read the whole stream from the start.
    fn read_all(&mut self) -> io::Result<Vec<u8>>;

    /// Discard every byte at or after `len`.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl JournalStorage for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.seek(SeekFrom::Start(0))?;
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Name filters applied while replaying a journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFilters {
    /// Replay stops before a checkpoint holding an entry under any of these prefixes.
    pub trash_dirs: Vec<String>,
    /// Recovered entries under this prefix are counted in the statistics.
    pub stats_filter: String,
    /// A checkpoint whose last entry starts with this name is a commit point.
    pub commit_marker: String,
}

impl Default for ResumeFilters {
    fn default() -> Self {
        Self {
            trash_dirs: vec![DEFAULT_TRASH_DIR.to_string()],
            stats_filter: String::new(),
            commit_marker: DEFAULT_COMMIT_MARKER.to_string(),
        }
    }
}

impl ResumeFilters {
    /// Where soft-deleted entries are renamed to: the first trash prefix.
    pub fn trash_dir(&self) -> &str {
        self.trash_dirs
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_TRASH_DIR)
    }

    fn is_trashed(&self, entry: &Entry) -> bool {
        self.trash_dirs
            .iter()
            .any(|dir| !dir.is_empty() && entry.is_under(dir))
    }

    fn is_commit(&self, delta: &ArchiveDatabase) -> bool {
        delta
            .entries
            .last()
            .is_some_and(|e| e.is_under(&self.commit_marker))
    }
}

pub const DEFAULT_TRASH_DIR: &str = "Trash/";
pub const DEFAULT_COMMIT_MARKER: &str = "__coc__";

/// Files and bytes recovered under the stats filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub recovered_files: u64,
    pub recovered_bytes: u64,
}

/// Why replay stopped reading checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Clean end of the journal, or the start of a zero-filled region.
    EndOfJournal,
    /// The last checkpoint was cut short.
    Truncated,
    /// A checkpoint held an entry under a trash directory.
    TrashFiltered,
}

/// The result of replaying a journal.
#[derive(Debug, Clone, Serialize)]
pub struct Recovered {
    pub db: ArchiveDatabase,
    /// Flush cursor matching `db`: everything recovered is already journaled.
    pub cursor: RecoveryCursor,
    pub stats: RecoveryStats,
    /// Offset just past the last committed checkpoint.
    pub valid_offset: u64,
    pub checkpoints_read: usize,
    pub checkpoints_committed: usize,
    pub stop: StopReason,
}

/// Replay journal bytes without touching any storage.
pub fn recover(bytes: &[u8], filters: &ResumeFilters) -> Result<Recovered, JournalError> {
    let mut pos = codec::decode_header(bytes).map_err(|e| JournalError::from_codec(e, 0))?;

    let mut db = ArchiveDatabase::new();
    let mut committed = db.lengths();
    let mut valid_offset = pos;
    let mut checkpoints_read = 0;
    let mut checkpoints_committed = 0;

    let stop = loop {
        let decoded =
            codec::decode_checkpoint(&bytes[pos..]).map_err(|e| JournalError::from_codec(e, pos))?;
        match decoded {
            Decoded::End => break StopReason::EndOfJournal,
            Decoded::Truncated { partial } => {
                if partial.entries.iter().any(|e| filters.is_trashed(e)) {
                    break StopReason::TrashFiltered;
                }
                break StopReason::Truncated;
            }
            Decoded::Complete { delta, consumed } => {
                if delta.entries.iter().any(|e| filters.is_trashed(e)) {
                    break StopReason::TrashFiltered;
                }
                db.extend(&delta);
                pos += consumed;
                checkpoints_read += 1;
                if filters.is_commit(&delta) {
                    committed = db.lengths();
                    valid_offset = pos;
                    checkpoints_committed = checkpoints_read;
                }
            }
        }
    };

    db.truncate_to(&committed);
    db.validate()?;
    let stats = recovery_stats(&db, &filters.stats_filter);

    Ok(Recovered {
        cursor: db.lengths(),
        db,
        stats,
        valid_offset: valid_offset as u64,
        checkpoints_read,
        checkpoints_committed,
        stop,
    })
}

/// Count entries under `prefix` and the unpacked size of the folders holding them.
fn recovery_stats(db: &ArchiveDatabase, prefix: &str) -> RecoveryStats {
    let mut stats = RecoveryStats::default();
    for (index, entry) in db.entries.iter().enumerate() {
        if !entry.is_under(prefix) {
            continue;
        }
        stats.recovered_files += 1;
        if let Some(folder) = db.folder_of_entry(index) {
            stats.recovered_bytes += db.folders[folder].unpack_size();
        }
    }
    stats
}

/// Outcome of a soft-delete request for an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftDelete {
    /// The entry was renamed into the trash and its journal tail erased.
    Erased { from: u64, len: u64 },
    /// The entry has no pending journal bytes; nothing changed.
    NothingPending,
}

/// An open recovery journal positioned for appending.
#[derive(Debug)]
pub struct Journal<S: JournalStorage = File> {
    storage: S,
    offset: u64,
}

impl Journal<File> {
    /// Create a fresh journal file, replacing any existing one.
    pub fn create(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        tracing::info!(path = %path.display(), "recovery journal created");
        Self::create_on(file)
    }

    /// Open an existing journal file and replay it.
    pub fn resume(path: &Path, filters: &ResumeFilters) -> Result<(Self, Recovered), JournalError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::resume_on(file, filters)
    }
}

impl<S: JournalStorage> Journal<S> {
    /// Write a fresh header to `storage`. The caller starts from an empty
    /// database and a zeroed cursor.
    pub fn create_on(mut storage: S) -> Result<Self, JournalError> {
        let header = codec::encode_header();
        storage.seek(SeekFrom::Start(0))?;
        storage.write_all(&header)?;
        storage.flush()?;
        storage.sync()?;

        Ok(Self {
            storage,
            offset: header.len() as u64,
        })
    }

    /// Replay `storage`, drop every byte after the last commit point, and
    /// position for appending there.
    pub fn resume_on(mut storage: S, filters: &ResumeFilters) -> Result<(Self, Recovered), JournalError> {
        let bytes = storage.read_all()?;
        let recovered = recover(&bytes, filters)?;

        let end = bytes.len() as u64;
        if end > recovered.valid_offset {
            tracing::warn!(
                discarded = end - recovered.valid_offset,
                stop = ?recovered.stop,
                "discarding journal bytes after the last commit point"
            );
            storage.truncate_to(recovered.valid_offset)?;
        }
        storage.seek(SeekFrom::Start(recovered.valid_offset))?;

        tracing::info!(
            checkpoints_read = recovered.checkpoints_read,
            checkpoints_committed = recovered.checkpoints_committed,
            entries = recovered.db.entries.len(),
            recovered_files = recovered.stats.recovered_files,
            offset = recovered.valid_offset,
            "recovery journal resumed"
        );

        let journal = Self {
            storage,
            offset: recovered.valid_offset,
        };
        Ok((journal, recovered))
    }

    /// Current write offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Flush every field element of `db` past `cursor` as one checkpoint,
    /// sync it, and advance `cursor`. Returns the bytes written.
    pub fn append_checkpoint(
        &mut self,
        db: &mut ArchiveDatabase,
        cursor: &mut RecoveryCursor,
    ) -> Result<u64, JournalError> {
        if !cursor.is_at_or_before(&db.lengths()) {
            return Err(JournalError::CursorAhead);
        }
        if let Some(entry) = db.entries.get_mut(cursor.entries) {
            entry.journal_anchor = self.offset;
        }

        let bytes = codec::encode_delta(cursor, db).map_err(|e| JournalError::from_codec(e, 0))?;
        self.storage.seek(SeekFrom::Start(self.offset))?;
        self.storage.write_all(&bytes)?;
        self.storage.flush()?;
        self.storage.sync()?;

        let written = bytes.len() as u64;
        tracing::debug!(offset = self.offset, bytes = written, "checkpoint appended");
        self.offset += written;
        *cursor = db.lengths();
        Ok(written)
    }

    /// Move the first entry named `name` into `trash_dir` and erase the
    /// journal bytes written since its checkpoint began. The cursor is left
    /// alone, so the erased checkpoints never reach the journal again.
    pub fn soft_delete(
        &mut self,
        db: &mut ArchiveDatabase,
        name: &str,
        trash_dir: &str,
    ) -> Result<SoftDelete, JournalError> {
        let index = db
            .find_entry(name)
            .ok_or_else(|| JournalError::NotFound(name.to_string()))?;

        let anchor = db.entries[index].journal_anchor;
        if anchor == 0 || anchor >= self.offset {
            return Ok(SoftDelete::NothingPending);
        }

        let len = self.offset - anchor;
        self.storage.seek(SeekFrom::Start(anchor))?;
        io::copy(&mut io::repeat(0).take(len), &mut self.storage)?;
        self.storage.flush()?;
        self.storage.sync()?;
        self.storage.seek(SeekFrom::Start(anchor))?;
        self.offset = anchor;

        let entry = &mut db.entries[index];
        entry.name = format!("{trash_dir}{name}");
        entry.journal_anchor = 0;

        tracing::info!(name, from = anchor, bytes = len, "entry moved to trash");
        Ok(SoftDelete::Erased { from: anchor, len })
    }

    /// Flush and sync, then hand back the storage.
    pub fn close(mut self) -> Result<S, JournalError> {
        self.storage.flush()?;
        self.storage.sync()?;
        Ok(self.storage)
    }
}
