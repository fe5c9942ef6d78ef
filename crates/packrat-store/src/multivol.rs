// ABOUTME: A seekable byte stream laid over numbered volume files of bounded capacity.
// ABOUTME: Volumes are created on demand while writing and deleted when the stream shrinks.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::journal::JournalStorage;

/// Errors raised while opening or resizing a volume set.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume sizes must be non-empty and nonzero")]
    InvalidSizes,

    #[error("placeholder volume {0} cannot start or end a volume set")]
    PlaceholderAtEdge(PathBuf),

    #[error("cannot grow a volume set from {length} to {requested} bytes")]
    ShrinkOnly { requested: u64, length: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Hooks a host can provide to observe and steer volume management.
pub trait VolumeEvents {
    /// A new volume file was created.
    fn on_new_volume(&mut self, _index: usize, _path: &Path) {}

    /// True when a missing volume file is an expected gap rather than the
    /// end of the set.
    fn is_placeholder(&self, _path: &Path) -> bool {
        false
    }

    /// Remove a volume file that fell outside the stream.
    fn remove_volume(&mut self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Deletes trailing volumes and recognises no placeholders.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultVolumeEvents;

impl VolumeEvents for DefaultVolumeEvents {}

#[derive(Debug)]
struct Volume {
    path: PathBuf,
    /// None for a placeholder that exists only logically.
    file: Option<File>,
    /// Position of the file's own cursor.
    pos: u64,
    real_size: u64,
}

/// The logical stream. Seeks only record the target position; the next
/// write walks the volumes from the first one to find where it lands.
pub struct MultiVolumeWriter<E: VolumeEvents = DefaultVolumeEvents> {
    prefix: PathBuf,
    sizes: Vec<u64>,
    volumes: Vec<Volume>,
    stream_index: usize,
    offset_pos: u64,
    abs_pos: u64,
    length: u64,
    events: E,
}

impl MultiVolumeWriter<DefaultVolumeEvents> {
    pub fn new(prefix: impl Into<PathBuf>, sizes: Vec<u64>) -> Result<Self, VolumeError> {
        Self::with_events(prefix, sizes, DefaultVolumeEvents)
    }
}

impl<E: VolumeEvents> MultiVolumeWriter<E> {
    /// Volume `i` holds at most `sizes[i]` bytes; volumes past the end of
    /// `sizes` reuse its last value.
    pub fn with_events(
        prefix: impl Into<PathBuf>,
        sizes: Vec<u64>,
        events: E,
    ) -> Result<Self, VolumeError> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(VolumeError::InvalidSizes);
        }
        Ok(Self {
            prefix: prefix.into(),
            sizes,
            volumes: Vec::new(),
            stream_index: 0,
            offset_pos: 0,
            abs_pos: 0,
            length: 0,
            events,
        })
    }

    /// Path of the volume at zero-based `index`: the prefix followed by a
    /// three-digit number starting at 001.
    pub fn volume_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.prefix.as_os_str());
        name.push(format!("{:03}", index + 1));
        PathBuf::from(name)
    }

    /// Capacity of the volume at `index`.
    pub fn volume_capacity(&self, index: usize) -> u64 {
        self.sizes
            .get(index)
            .or(self.sizes.last())
            .copied()
            .unwrap_or(u64::MAX)
    }

    /// Discover existing volumes. Probing stops at the first missing file
    /// that is not a placeholder. A placeholder takes the size of the
    /// volume before it.
    pub fn open(&mut self) -> Result<(), VolumeError> {
        self.volumes.clear();
        loop {
            let path = self.volume_path(self.volumes.len());
            if path.is_file() {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                let real_size = file.metadata()?.len();
                self.volumes.push(Volume {
                    path,
                    file: Some(file),
                    pos: 0,
                    real_size,
                });
            } else if self.events.is_placeholder(&path) {
                let Some(previous) = self.volumes.last() else {
                    return Err(VolumeError::PlaceholderAtEdge(path));
                };
                let real_size = previous.real_size;
                self.volumes.push(Volume {
                    path,
                    file: None,
                    pos: 0,
                    real_size,
                });
            } else {
                break;
            }
        }

        if let Some(last) = self.volumes.last()
            && last.file.is_none()
        {
            return Err(VolumeError::PlaceholderAtEdge(last.path.clone()));
        }

        self.length = self.volumes.iter().map(|v| v.real_size).sum();
        self.stream_index = 0;
        self.offset_pos = 0;
        self.abs_pos = 0;
        tracing::info!(
            volumes = self.volumes.len(),
            length = self.length,
            prefix = %self.prefix.display(),
            "volume set opened"
        );
        Ok(())
    }

    /// Logical length of the stream.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    /// Bytes held by each volume.
    pub fn volume_sizes(&self) -> Vec<u64> {
        self.volumes.iter().map(|v| v.real_size).collect()
    }

    pub fn volume_paths(&self) -> Vec<&Path> {
        self.volumes.iter().map(|v| v.path.as_path()).collect()
    }

    fn create_volume(&mut self) -> io::Result<()> {
        let index = self.volumes.len();
        let path = self.volume_path(index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        self.events.on_new_volume(index, &path);
        tracing::info!(index, path = %path.display(), "volume created");
        self.volumes.push(Volume {
            path,
            file: Some(file),
            pos: 0,
            real_size: 0,
        });
        Ok(())
    }

    /// Shrink the stream to `new_size` bytes. Volumes that start at or past
    /// the new end are removed; the first volume always stays.
    pub fn set_size(&mut self, new_size: u64) -> Result<(), VolumeError> {
        if new_size > self.length {
            return Err(VolumeError::ShrinkOnly {
                requested: new_size,
                length: self.length,
            });
        }

        let mut start = 0u64;
        let mut keep = 0;
        for index in 0..self.volumes.len() {
            if index > 0 && start >= new_size {
                break;
            }
            keep = index + 1;
            let capacity = self.volume_capacity(index);
            let volume = &mut self.volumes[index];
            let local = new_size - start;
            if local < volume.real_size {
                if let Some(file) = volume.file.as_mut() {
                    file.set_len(local)?;
                    if volume.pos > local {
                        file.seek(SeekFrom::Start(local))?;
                    }
                }
                volume.real_size = local;
                volume.pos = volume.pos.min(local);
            }
            start = start.saturating_add(capacity);
        }

        for volume in self.volumes.drain(keep..).rev() {
            let Volume { path, file, .. } = volume;
            if file.is_some() {
                drop(file);
                self.events.remove_volume(&path)?;
                tracing::info!(path = %path.display(), "volume removed");
            }
        }

        self.length = new_size;
        self.stream_index = 0;
        self.offset_pos = self.abs_pos;
        tracing::debug!(length = new_size, volumes = self.volumes.len(), "volume set resized");
        Ok(())
    }

    /// Read the whole stream by concatenating the volumes.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length.min(1 << 20) as usize);
        for volume in &mut self.volumes {
            let Some(file) = volume.file.as_mut() else {
                return Err(io::Error::other(format!(
                    "volume {} is a placeholder and cannot be read",
                    volume.path.display()
                )));
            };
            file.seek(SeekFrom::Start(0))?;
            let read = file.read_to_end(&mut buf)?;
            volume.pos = read as u64;
        }
        Ok(buf)
    }

    /// Flush and sync every open volume.
    pub fn close(&mut self) -> io::Result<()> {
        for file in self.volumes.iter_mut().filter_map(|v| v.file.as_mut()) {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl<E: VolumeEvents> Write for MultiVolumeWriter<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // A write past the end zero-fills the gap so no volume is left short.
        if self.abs_pos > self.length {
            let target = self.abs_pos;
            let gap = target - self.length;
            self.seek(SeekFrom::Start(self.length))?;
            io::copy(&mut io::repeat(0).take(gap), self)?;
            debug_assert_eq!(self.abs_pos, target);
        }

        loop {
            if self.stream_index >= self.volumes.len() {
                self.create_volume()?;
            }
            let capacity = self.volume_capacity(self.stream_index);
            if self.offset_pos >= capacity {
                self.offset_pos -= capacity;
                self.stream_index += 1;
                continue;
            }

            let volume = &mut self.volumes[self.stream_index];
            let Some(file) = volume.file.as_mut() else {
                return Err(io::Error::other(format!(
                    "volume {} is a placeholder and cannot be written",
                    volume.path.display()
                )));
            };
            if self.offset_pos != volume.pos {
                file.seek(SeekFrom::Start(self.offset_pos))?;
                volume.pos = self.offset_pos;
            }

            let room = capacity - volume.pos;
            let chunk = usize::try_from(room).map_or(buf.len(), |room| room.min(buf.len()));
            let written = file.write(&buf[..chunk])?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "volume accepted no bytes",
                ));
            }

            let written_u64 = written as u64;
            volume.pos += written_u64;
            volume.real_size = volume.real_size.max(volume.pos);
            self.abs_pos += written_u64;
            self.offset_pos += written_u64;
            self.length = self.length.max(self.abs_pos);
            if self.offset_pos == capacity {
                self.stream_index += 1;
                self.offset_pos = 0;
            }
            return Ok(written);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for file in self.volumes.iter_mut().filter_map(|v| v.file.as_mut()) {
            file.flush()?;
        }
        Ok(())
    }
}

impl<E: VolumeEvents> Seek for MultiVolumeWriter<E> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.abs_pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            ));
        };

        self.abs_pos = target;
        self.offset_pos = target;
        self.stream_index = 0;
        Ok(target)
    }
}

impl<E: VolumeEvents> JournalStorage for MultiVolumeWriter<E> {
    fn sync(&mut self) -> io::Result<()> {
        self.close()
    }

    fn read_all(&mut self) -> io::Result<Vec<u8>> {
        MultiVolumeWriter::read_all(self)
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_size(len).map_err(|e| match e {
            VolumeError::Io(io) => io,
            other => io::Error::other(other),
        })
    }
}
