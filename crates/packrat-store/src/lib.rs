// ABOUTME: Persistence layer for packrat, handling the recovery journal and archive output streams.
// ABOUTME: Provides the journal codec and manager, multi-volume output, update planning, and sessions.

pub mod codec;
pub mod config;
pub mod journal;
pub mod multivol;
pub mod session;
pub mod update;

pub use codec::{CodecError, Decoded, decode_checkpoint, encode_delta};
pub use config::{ConfigError, PackratConfig};
pub use journal::{
    Journal, JournalError, JournalStorage, Recovered, RecoveryStats, ResumeFilters, SoftDelete,
    StopReason, recover,
};
pub use multivol::{DefaultVolumeEvents, MultiVolumeWriter, VolumeError, VolumeEvents};
pub use session::{
    CoderBind, EncodedFolder, FolderEncoder, HeaderWriter, PropertySettable, ReadableArchive,
    SIGNATURE_HEADER_SIZE, SessionError, SessionOptions, StreamDigest, UpdateOutcome,
    UpdateSession, WritableArchive,
};
pub use update::{HeaderOptions, UpdateError, UpdateItem, plan_update_items};
