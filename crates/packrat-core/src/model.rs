// ABOUTME: Defines the archive item types: Entry, CoderDescriptor, BindPair, and Folder.
// ABOUTME: A Folder is one compression unit whose coders are wired together by bind pairs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Windows directory attribute bit, as carried in entry attributes.
pub const ATTRIBUTE_DIRECTORY: u32 = 0x10;

/// One archive item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub attrib: Option<u32>,
    pub crc: Option<u32>,
    pub has_stream: bool,
    pub is_dir: bool,
    pub size: u64,
    /// Offset in the journal where the checkpoint that first carried this
    /// entry begins. Zero when not journaled in this session.
    #[serde(skip)]
    pub journal_anchor: u64,
}

// The anchor is per-session bookkeeping, so it does not take part in equality.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.attrib == other.attrib
            && self.crc == other.crc
            && self.has_stream == other.has_stream
            && self.is_dir == other.is_dir
            && self.size == other.size
    }
}

impl Eq for Entry {}

impl Entry {
    /// A file entry whose content lives in a folder.
    pub fn file(name: impl Into<String>, size: u64, crc: Option<u32>) -> Self {
        Self {
            name: name.into(),
            crc,
            has_stream: size > 0,
            size,
            ..Self::default()
        }
    }

    /// A directory entry without content.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrib: Some(ATTRIBUTE_DIRECTORY),
            is_dir: true,
            ..Self::default()
        }
    }

    /// An empty entry carrying only a name, such as a commit marker.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// True when the name starts with `prefix`.
    pub fn is_under(&self, prefix: &str) -> bool {
        self.name.starts_with(prefix)
    }
}

/// One coder inside a folder: a method id plus its stream arity and
/// codec-specific property bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoderDescriptor {
    pub method_id: u64,
    pub num_in_streams: u32,
    pub num_out_streams: u32,
    pub props: Vec<u8>,
}

impl CoderDescriptor {
    /// A simple one-in, one-out coder.
    pub fn simple(method_id: u64, props: Vec<u8>) -> Self {
        Self {
            method_id,
            num_in_streams: 1,
            num_out_streams: 1,
            props,
        }
    }
}

/// Connects the output stream `out_index` of one coder to the input stream
/// `in_index` of another, indices counted across the whole folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindPair {
    pub in_index: u32,
    pub out_index: u32,
}

/// A compression unit: an acyclic pipeline of coders consuming packed
/// streams and producing unpacked output streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub coders: Vec<CoderDescriptor>,
    pub bind_pairs: Vec<BindPair>,
    pub pack_streams: Vec<u32>,
    pub unpack_crc: Option<u32>,
    pub unpack_sizes: Vec<u64>,
}

impl Folder {
    /// A folder with a single coder reading one packed stream.
    pub fn single(coder: CoderDescriptor, unpack_size: u64, unpack_crc: Option<u32>) -> Self {
        Self {
            coders: vec![coder],
            bind_pairs: Vec::new(),
            pack_streams: vec![0],
            unpack_crc,
            unpack_sizes: vec![unpack_size],
        }
    }

    pub fn total_in_streams(&self) -> u64 {
        self.coders.iter().map(|c| u64::from(c.num_in_streams)).sum()
    }

    pub fn total_out_streams(&self) -> u64 {
        self.coders.iter().map(|c| u64::from(c.num_out_streams)).sum()
    }

    /// Size of the folder's final output: the one output stream not consumed
    /// by any bind pair. Zero for a folder without outputs.
    pub fn unpack_size(&self) -> u64 {
        (0..self.unpack_sizes.len())
            .rev()
            .find(|&i| !self.bind_pairs.iter().any(|bp| bp.out_index as usize == i))
            .map(|i| self.unpack_sizes[i])
            .unwrap_or(0)
    }

    /// Check bind pair slots and pack stream uniqueness.
    pub fn validate(&self) -> Result<(), ModelError> {
        let total_in = self.total_in_streams();
        let total_out = self.total_out_streams();

        for bp in &self.bind_pairs {
            if u64::from(bp.in_index) >= total_in {
                return Err(ModelError::BindPairOutOfRange {
                    index: bp.in_index,
                    limit: total_in,
                    side: "input",
                });
            }
            if u64::from(bp.out_index) >= total_out {
                return Err(ModelError::BindPairOutOfRange {
                    index: bp.out_index,
                    limit: total_out,
                    side: "output",
                });
            }
        }

        let mut seen = HashSet::with_capacity(self.pack_streams.len());
        for &stream in &self.pack_streams {
            if !seen.insert(stream) {
                return Err(ModelError::DuplicatePackStream(stream));
            }
        }

        Ok(())
    }
}
