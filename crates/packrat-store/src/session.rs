// ABOUTME: The update session: owns the journal, the archive volume set, and the database they mirror.
// ABOUTME: Exposes narrow capability traits for reading stats, writing items, and setting properties.

use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use packrat_core::{
    ArchiveDatabase, Entry, Folder, ModelError, PackedStream, PropValue, PropertyProvider,
    RecoveryCursor,
};
use thiserror::Error;

use crate::journal::{Journal, JournalError, RecoveryStats, ResumeFilters, SoftDelete};
use crate::multivol::{DefaultVolumeEvents, MultiVolumeWriter, VolumeError, VolumeEvents};
use crate::update::{HeaderOptions, UpdateError, UpdateItem, plan_update_items};

/// Bytes reserved at the start of the archive for its signature header.
pub const SIGNATURE_HEADER_SIZE: u64 = 32;

/// Errors surfaced by an update session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("invalid property {name:?}: {reason}")]
    InvalidProperty { name: String, reason: String },

    #[error("encoder returned {got} stream digests for {expected} items")]
    EncoderMismatch { expected: usize, got: usize },

    #[error("session is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Connects output stream `out_stream` of coder `out_coder` to input
/// stream `in_stream` of coder `in_coder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoderBind {
    pub out_coder: u32,
    pub out_stream: u32,
    pub in_coder: u32,
    pub in_stream: u32,
}

impl CoderBind {
    /// Parse `<outCoder>[S<outStream>]:<inCoder>[S<inStream>]`.
    pub fn parse(text: &str) -> Option<Self> {
        fn side(s: &str) -> Option<(u32, u32)> {
            match s.split_once('S') {
                Some((coder, stream)) => Some((coder.parse().ok()?, stream.parse().ok()?)),
                None => Some((s.parse().ok()?, 0)),
            }
        }

        let (out, inp) = text.split_once(':')?;
        let (out_coder, out_stream) = side(out)?;
        let (in_coder, in_stream) = side(inp)?;
        Some(Self {
            out_coder,
            out_stream,
            in_coder,
            in_stream,
        })
    }
}

/// Size and checksum of one unpacked stream produced by an encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamDigest {
    pub size: u64,
    pub crc: Option<u32>,
}

/// What an encoder produced for one batch of content items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedFolder {
    pub folder: Folder,
    pub packed: Vec<PackedStream>,
    /// One digest per encoded item, in item order.
    pub streams: Vec<StreamDigest>,
}

/// The compression pipeline. Writes packed bytes for `items` into `out`.
pub trait FolderEncoder {
    fn encode(
        &mut self,
        items: &[UpdateItem],
        binds: &[CoderBind],
        settings: &[(String, PropValue)],
        out: &mut dyn Write,
    ) -> io::Result<EncodedFolder>;
}

/// Lays out the final archive header once the session closes.
pub trait HeaderWriter {
    fn write_header(&mut self, db: &ArchiveDatabase, out: &mut dyn Write) -> io::Result<()>;
}

/// Read access to a session's database and recovery statistics.
pub trait ReadableArchive {
    fn database(&self) -> &ArchiveDatabase;

    fn file_count(&self) -> usize {
        self.database().entries.len()
    }

    fn total_packed_size(&self) -> u64;

    fn recovered_file_count(&self) -> u64;

    fn recovered_uncompressed_size(&self) -> u64;
}

/// Outcome of one `update_items` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied {
        entries: usize,
        checkpoint_bytes: Option<u64>,
    },
    Closed,
}

/// Accepts pending items from a host.
pub trait WritableArchive {
    fn update_items(
        &mut self,
        provider: &dyn PropertyProvider,
        count: u32,
        encoder: &mut dyn FolderEncoder,
        header: &mut dyn HeaderWriter,
    ) -> Result<UpdateOutcome, SessionError>;
}

/// Accepts compression settings.
pub trait PropertySettable {
    fn set_properties(&mut self, props: &[(String, PropValue)]) -> Result<(), SessionError>;
}

/// Options fixed for the life of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub filters: ResumeFilters,
    pub header: HeaderOptions,
}

/// One writer's update session over a journal file and an archive volume set.
pub struct UpdateSession<E: VolumeEvents = DefaultVolumeEvents> {
    journal: Option<Journal>,
    archive: MultiVolumeWriter<E>,
    db: ArchiveDatabase,
    cursor: RecoveryCursor,
    stats: RecoveryStats,
    total_pack_size: u64,
    options: SessionOptions,
    binds: Vec<CoderBind>,
    settings: Vec<(String, PropValue)>,
}

impl<E: VolumeEvents> UpdateSession<E> {
    /// Start a new archive and a fresh journal.
    pub fn create(
        journal_path: &Path,
        mut archive: MultiVolumeWriter<E>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let journal = Journal::create(journal_path)?;
        archive.seek(SeekFrom::Start(0))?;
        archive.write_all(&[0u8; SIGNATURE_HEADER_SIZE as usize])?;

        Ok(Self {
            journal: Some(journal),
            archive,
            db: ArchiveDatabase::new(),
            cursor: RecoveryCursor::new(),
            stats: RecoveryStats::default(),
            total_pack_size: 0,
            options,
            binds: Vec::new(),
            settings: Vec::new(),
        })
    }

    /// Replay the journal, cut the archive back to the packed data the
    /// recovered database accounts for, and continue writing after it.
    pub fn resume(
        journal_path: &Path,
        mut archive: MultiVolumeWriter<E>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let (journal, recovered) = Journal::resume(journal_path, &options.filters)?;

        archive.open()?;
        let packed = archive.len().saturating_sub(SIGNATURE_HEADER_SIZE);
        recovered.db.validate_packed_len(packed)?;

        let total_pack_size = recovered.db.total_pack_size();
        let end = SIGNATURE_HEADER_SIZE + total_pack_size;
        archive.set_size(end)?;
        archive.seek(SeekFrom::Start(end))?;
        tracing::info!(
            archive_len = end,
            entries = recovered.db.entries.len(),
            "archive repositioned after recovery"
        );

        Ok(Self {
            journal: Some(journal),
            archive,
            db: recovered.db,
            cursor: recovered.cursor,
            stats: recovered.stats,
            total_pack_size,
            options,
            binds: Vec::new(),
            settings: Vec::new(),
        })
    }

    pub fn cursor(&self) -> &RecoveryCursor {
        &self.cursor
    }

    pub fn binds(&self) -> &[CoderBind] {
        &self.binds
    }

    pub fn settings(&self) -> &[(String, PropValue)] {
        &self.settings
    }

    pub fn archive(&self) -> &MultiVolumeWriter<E> {
        &self.archive
    }

    pub fn is_closed(&self) -> bool {
        self.journal.is_none()
    }

    fn journal_mut(&mut self) -> Result<&mut Journal, SessionError> {
        self.journal.as_mut().ok_or(SessionError::Closed)
    }

    /// Append every unflushed field to the journal.
    pub fn checkpoint(&mut self) -> Result<u64, SessionError> {
        let journal = self.journal.as_mut().ok_or(SessionError::Closed)?;
        let written = journal.append_checkpoint(&mut self.db, &mut self.cursor)?;
        self.total_pack_size = self.db.total_pack_size();
        Ok(written)
    }

    /// Rename `name` into the trash and erase its pending journal bytes.
    pub fn move_to_trash(&mut self, name: &str) -> Result<SoftDelete, SessionError> {
        let journal = self.journal.as_mut().ok_or(SessionError::Closed)?;
        let trash_dir = self.options.filters.trash_dir();
        Ok(journal.soft_delete(&mut self.db, name, trash_dir)?)
    }

    /// Write the final header, sync the archive, and close the journal.
    pub fn close(&mut self, header: &mut dyn HeaderWriter) -> Result<(), SessionError> {
        let journal = self.journal.take().ok_or(SessionError::Closed)?;
        header.write_header(&self.db, &mut self.archive)?;
        self.archive.close()?;
        journal.close()?;
        tracing::info!(entries = self.db.entries.len(), "update session closed");
        Ok(())
    }

    /// Append the planned items to the database. Content items go through
    /// the encoder as one folder.
    fn apply(
        &mut self,
        items: &[UpdateItem],
        encoder: &mut dyn FolderEncoder,
    ) -> Result<usize, SessionError> {
        let content: Vec<UpdateItem> = items
            .iter()
            .filter(|item| item.new_data && has_content(item))
            .cloned()
            .collect();

        let mut digests = Vec::new().into_iter();
        if !content.is_empty() {
            let encoded = encoder.encode(&content, &self.binds, &self.settings, &mut self.archive)?;
            if encoded.streams.len() != content.len() {
                return Err(SessionError::EncoderMismatch {
                    expected: content.len(),
                    got: encoded.streams.len(),
                });
            }
            encoded.folder.validate()?;
            let unpack_streams = encoded.streams.len() as u32;
            self.db.push_folder(encoded.folder, unpack_streams, &encoded.packed);
            digests = encoded.streams.into_iter();
        }

        let mut appended = 0;
        for item in items {
            if let Some(existing) = item.index_in_archive
                && !item.new_data
            {
                if item.new_props {
                    self.rewrite_properties(existing as usize, item);
                }
                continue;
            }

            let mut entry = Entry {
                name: item.name.clone(),
                attrib: item.attrib,
                is_dir: item.is_dir,
                size: item.size,
                ..Entry::default()
            };
            if item.new_data && has_content(item) {
                let digest = digests.next().unwrap_or_default();
                entry.has_stream = true;
                entry.size = digest.size;
                entry.crc = digest.crc;
            }
            self.db.push_entry(entry, item.times, item.is_anti);
            appended += 1;
        }
        Ok(appended)
    }

    fn rewrite_properties(&mut self, index: usize, item: &UpdateItem) {
        if let Some(entry) = self.db.entries.get_mut(index) {
            entry.name = item.name.clone();
            entry.attrib = item.attrib;
            entry.is_dir = item.is_dir;
        }
        self.db.ctime.set(index, item.times.ctime);
        self.db.atime.set(index, item.times.atime);
        self.db.mtime.set(index, item.times.mtime);
    }
}

fn has_content(item: &UpdateItem) -> bool {
    item.size > 0 && !item.is_dir && !item.is_anti
}

impl<E: VolumeEvents> ReadableArchive for UpdateSession<E> {
    fn database(&self) -> &ArchiveDatabase {
        &self.db
    }

    fn total_packed_size(&self) -> u64 {
        self.total_pack_size
    }

    fn recovered_file_count(&self) -> u64 {
        self.stats.recovered_files
    }

    fn recovered_uncompressed_size(&self) -> u64 {
        self.stats.recovered_bytes
    }
}

impl<E: VolumeEvents> WritableArchive for UpdateSession<E> {
    fn update_items(
        &mut self,
        provider: &dyn PropertyProvider,
        count: u32,
        encoder: &mut dyn FolderEncoder,
        header: &mut dyn HeaderWriter,
    ) -> Result<UpdateOutcome, SessionError> {
        self.journal_mut()?;
        if count == 0 {
            self.close(header)?;
            return Ok(UpdateOutcome::Closed);
        }

        let items = plan_update_items(provider, &self.db, count, &self.options.header)?;
        let entries = self.apply(&items, encoder)?;

        // A short stream records fewer bytes than the host announced.
        let complete = self
            .db
            .entries
            .last()
            .is_some_and(|last| last.size == items[0].size);
        let checkpoint_bytes = if complete {
            Some(self.checkpoint()?)
        } else {
            tracing::warn!(
                expected = items[0].size,
                "last entry is incomplete; checkpoint skipped"
            );
            None
        };

        tracing::debug!(items = items.len(), entries, "update applied");
        Ok(UpdateOutcome::Applied {
            entries,
            checkpoint_bytes,
        })
    }
}

impl<E: VolumeEvents> PropertySettable for UpdateSession<E> {
    fn set_properties(&mut self, props: &[(String, PropValue)]) -> Result<(), SessionError> {
        self.binds.clear();
        self.settings.clear();

        for (raw_name, value) in props {
            let name = raw_name.to_uppercase();
            if name.is_empty() {
                return Err(SessionError::InvalidProperty {
                    name: raw_name.clone(),
                    reason: "empty name".to_string(),
                });
            }

            if let Some(text) = name.strip_prefix('B') {
                if *value != PropValue::Empty {
                    return Err(SessionError::InvalidProperty {
                        name,
                        reason: format!("bind takes no value, got {}", value.type_name()),
                    });
                }
                let bind = CoderBind::parse(text).ok_or_else(|| SessionError::InvalidProperty {
                    name: name.clone(),
                    reason: "expected <coder>[S<stream>]:<coder>[S<stream>]".to_string(),
                })?;
                self.binds.push(bind);
                continue;
            }

            self.settings.push((name, value.clone()));
        }
        Ok(())
    }
}
