// ABOUTME: Binary schema for recovery journal checkpoints, shared by the encode and decode directions.
// ABOUTME: Each type is described once by a transcode function generic over a reading or writing Codec.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use packrat_core::{
    ArchiveDatabase, BindPair, CoderDescriptor, Entry, Folder, OptionalVector, RecoveryCursor,
};
use thiserror::Error;

/// Journal signature: "D7ZR" as UTF-16LE code units plus a NUL terminator.
pub const SIGNATURE: [u16; 5] = [0x44, 0x37, 0x5a, 0x52, 0x00];

/// Current journal schema version, written right after the signature.
pub const SCHEMA_VERSION: u16 = 1;

/// Bytes taken by the signature and the schema version.
pub const HEADER_LEN: usize = SIGNATURE.len() * 2 + 2;

/// Field tags in the fixed order they appear within a checkpoint.
/// `End` closes a checkpoint; a checkpoint without it is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldTag {
    StartPos = 1,
    CTime = 2,
    MTime = 3,
    ATime = 4,
    PackCrcDefined = 5,
    PackCrcs = 6,
    PackSizes = 7,
    NumUnpackStreams = 8,
    IsAnti = 9,
    Entries = 10,
    Folders = 11,
    End = 12,
}

/// Errors raised while encoding or decoding journal bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended inside a record. Callers treat this as a torn tail.
    #[error("journal ends inside a record")]
    Truncated,

    #[error("malformed journal at byte {offset}: {reason}")]
    Format { offset: usize, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One direction of the journal schema. The writer emits each value it is
/// handed; the reader overwrites each value with what it decodes.
pub trait Codec {
    fn is_reading(&self) -> bool;

    fn u8(&mut self, v: &mut u8) -> Result<(), CodecError>;

    fn u32(&mut self, v: &mut u32) -> Result<(), CodecError>;

    fn u64(&mut self, v: &mut u64) -> Result<(), CodecError>;

    /// Raw bytes of a length already transcoded by the caller.
    fn bytes(&mut self, v: &mut Vec<u8>, len: usize) -> Result<(), CodecError>;

    /// A field tag: written as-is, checked on read.
    fn tag(&mut self, tag: FieldTag) -> Result<(), CodecError>;

    /// Byte offset of the next value, for error reporting.
    fn offset(&self) -> usize;

    fn bool(&mut self, v: &mut bool) -> Result<(), CodecError> {
        let mut byte = u8::from(*v);
        self.u8(&mut byte)?;
        match byte {
            0 => *v = false,
            1 => *v = true,
            other => {
                return Err(CodecError::Format {
                    offset: self.offset().saturating_sub(1),
                    reason: format!("invalid bool byte {other:#04x}"),
                });
            }
        }
        Ok(())
    }

    /// An element count, stored as a signed 32-bit integer.
    fn count(&mut self, len: &mut usize) -> Result<(), CodecError> {
        let at = self.offset();
        let mut raw = i32::try_from(*len).map_err(|_| CodecError::Format {
            offset: at,
            reason: format!("count {len} does not fit the schema"),
        })? as u32;
        self.u32(&mut raw)?;
        let signed = raw as i32;
        if signed < 0 {
            return Err(CodecError::Format {
                offset: at,
                reason: format!("negative count {signed}"),
            });
        }
        *len = signed as usize;
        Ok(())
    }
}

/// Writes journal bytes into a growable buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Codec for Encoder {
    fn is_reading(&self) -> bool {
        false
    }

    fn u8(&mut self, v: &mut u8) -> Result<(), CodecError> {
        self.buf.write_u8(*v)?;
        Ok(())
    }

    fn u32(&mut self, v: &mut u32) -> Result<(), CodecError> {
        self.buf.write_u32::<LittleEndian>(*v)?;
        Ok(())
    }

    fn u64(&mut self, v: &mut u64) -> Result<(), CodecError> {
        self.buf.write_u64::<LittleEndian>(*v)?;
        Ok(())
    }

    fn bytes(&mut self, v: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
        self.buf.extend_from_slice(&v[..len]);
        Ok(())
    }

    fn tag(&mut self, tag: FieldTag) -> Result<(), CodecError> {
        self.buf.push(tag as u8);
        Ok(())
    }

    fn offset(&self) -> usize {
        self.buf.len()
    }
}

/// Reads journal bytes sequentially from a slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.input.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    /// True when every byte from the current position on is zero.
    fn rest_is_zeroed(&self) -> bool {
        self.input[self.pos..].iter().all(|&b| b == 0)
    }
}

impl Codec for Decoder<'_> {
    fn is_reading(&self) -> bool {
        true
    }

    fn u8(&mut self, v: &mut u8) -> Result<(), CodecError> {
        *v = self.take(1)?[0];
        Ok(())
    }

    fn u32(&mut self, v: &mut u32) -> Result<(), CodecError> {
        *v = LittleEndian::read_u32(self.take(4)?);
        Ok(())
    }

    fn u64(&mut self, v: &mut u64) -> Result<(), CodecError> {
        *v = LittleEndian::read_u64(self.take(8)?);
        Ok(())
    }

    fn bytes(&mut self, v: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
        *v = self.take(len)?.to_vec();
        Ok(())
    }

    fn tag(&mut self, tag: FieldTag) -> Result<(), CodecError> {
        let at = self.pos;
        let found = *self.input.get(at).ok_or(CodecError::Truncated)?;
        if found == tag as u8 {
            self.pos += 1;
            return Ok(());
        }
        // A zero where a tag belongs marks the start of a soft-deleted region.
        if found == 0 && self.rest_is_zeroed() {
            return Err(CodecError::Truncated);
        }
        Err(CodecError::Format {
            offset: at,
            reason: format!("expected tag {} ({tag:?}), found {found}", tag as u8),
        })
    }

    fn offset(&self) -> usize {
        self.pos
    }
}

/// Transcode a counted sequence. On read the sequence is replaced only once
/// every element has decoded, so a torn field leaves the target untouched.
fn seq<C, T, F>(c: &mut C, items: &mut Vec<T>, mut each: F) -> Result<(), CodecError>
where
    C: Codec,
    T: Default,
    F: FnMut(&mut C, &mut T) -> Result<(), CodecError>,
{
    let mut len = items.len();
    c.count(&mut len)?;
    if c.is_reading() {
        let mut decoded = Vec::new();
        for _ in 0..len {
            let mut item = T::default();
            each(c, &mut item)?;
            decoded.push(item);
        }
        *items = decoded;
    } else {
        for item in items.iter_mut() {
            each(c, item)?;
        }
    }
    Ok(())
}

/// `[value: u32][defined: bool]`, the layout entries and folders use.
fn u32_then_flag<C: Codec>(c: &mut C, v: &mut Option<u32>) -> Result<(), CodecError> {
    let mut value = v.unwrap_or(0);
    let mut defined = v.is_some();
    c.u32(&mut value)?;
    c.bool(&mut defined)?;
    *v = defined.then_some(value);
    Ok(())
}

/// `[count: u32][UTF-8 bytes]`.
fn string<C: Codec>(c: &mut C, s: &mut String) -> Result<(), CodecError> {
    let mut bytes = if c.is_reading() {
        Vec::new()
    } else {
        s.as_bytes().to_vec()
    };
    let mut len = u32::try_from(bytes.len()).map_err(|_| CodecError::Format {
        offset: c.offset(),
        reason: "name longer than 4 GiB".to_string(),
    })?;
    c.u32(&mut len)?;
    let at = c.offset();
    c.bytes(&mut bytes, len as usize)?;
    if c.is_reading() {
        *s = String::from_utf8(bytes).map_err(|e| CodecError::Format {
            offset: at,
            reason: format!("entry name is not UTF-8: {e}"),
        })?;
    }
    Ok(())
}

/// `[count][defined: bool, value: u64]*`, writing zero for undefined slots.
fn optional_u64<C: Codec>(c: &mut C, v: &mut OptionalVector<u64>) -> Result<(), CodecError> {
    let mut slots: Vec<(bool, u64)> = if c.is_reading() {
        Vec::new()
    } else {
        v.iter().map(|s| (s.is_some(), s.unwrap_or(0))).collect()
    };
    seq(c, &mut slots, |c, (defined, value)| {
        c.bool(defined)?;
        c.u64(value)
    })?;
    if c.is_reading() {
        *v = slots
            .into_iter()
            .map(|(defined, value)| defined.then_some(value))
            .collect();
    }
    Ok(())
}

fn entry<C: Codec>(c: &mut C, e: &mut Entry) -> Result<(), CodecError> {
    u32_then_flag(c, &mut e.attrib)?;
    u32_then_flag(c, &mut e.crc)?;
    c.bool(&mut e.has_stream)?;
    c.bool(&mut e.is_dir)?;
    string(c, &mut e.name)?;
    c.u64(&mut e.size)
}

fn coder<C: Codec>(c: &mut C, coder: &mut CoderDescriptor) -> Result<(), CodecError> {
    c.u64(&mut coder.method_id)?;
    c.u32(&mut coder.num_in_streams)?;
    c.u32(&mut coder.num_out_streams)?;
    let mut len = u32::try_from(coder.props.len()).map_err(|_| CodecError::Format {
        offset: c.offset(),
        reason: "coder properties longer than 4 GiB".to_string(),
    })?;
    c.u32(&mut len)?;
    c.bytes(&mut coder.props, len as usize)
}

fn folder<C: Codec>(c: &mut C, f: &mut Folder) -> Result<(), CodecError> {
    seq(c, &mut f.bind_pairs, |c, bp: &mut BindPair| {
        c.u32(&mut bp.in_index)?;
        c.u32(&mut bp.out_index)
    })?;
    seq(c, &mut f.coders, coder)?;
    seq(c, &mut f.pack_streams, |c, s| c.u32(s))?;
    u32_then_flag(c, &mut f.unpack_crc)?;
    seq(c, &mut f.unpack_sizes, |c, s| c.u64(s))
}

/// The whole checkpoint schema: eleven tagged fields then the closing tag.
pub fn transcode_checkpoint<C: Codec>(c: &mut C, db: &mut ArchiveDatabase) -> Result<(), CodecError> {
    c.tag(FieldTag::StartPos)?;
    optional_u64(c, &mut db.start_pos)?;
    c.tag(FieldTag::CTime)?;
    optional_u64(c, &mut db.ctime)?;
    c.tag(FieldTag::MTime)?;
    optional_u64(c, &mut db.mtime)?;
    c.tag(FieldTag::ATime)?;
    optional_u64(c, &mut db.atime)?;
    c.tag(FieldTag::PackCrcDefined)?;
    seq(c, &mut db.pack_crc_defined, |c, v| c.bool(v))?;
    c.tag(FieldTag::PackCrcs)?;
    seq(c, &mut db.pack_crcs, |c, v| c.u32(v))?;
    c.tag(FieldTag::PackSizes)?;
    seq(c, &mut db.pack_sizes, |c, v| c.u64(v))?;
    c.tag(FieldTag::NumUnpackStreams)?;
    seq(c, &mut db.num_unpack_streams, |c, v| c.u32(v))?;
    c.tag(FieldTag::IsAnti)?;
    seq(c, &mut db.is_anti, |c, v| c.bool(v))?;
    c.tag(FieldTag::Entries)?;
    seq(c, &mut db.entries, entry)?;
    c.tag(FieldTag::Folders)?;
    seq(c, &mut db.folders, folder)?;
    c.tag(FieldTag::End)
}

/// Encode the journal header.
pub fn encode_header() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    for unit in SIGNATURE {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    buf
}

/// Check the journal header and return its length.
pub fn decode_header(input: &[u8]) -> Result<usize, CodecError> {
    let signature_len = SIGNATURE.len() * 2;
    let matches = input.len() >= signature_len
        && SIGNATURE
            .iter()
            .enumerate()
            .all(|(i, &unit)| LittleEndian::read_u16(&input[i * 2..i * 2 + 2]) == unit);
    if !matches {
        return Err(CodecError::Format {
            offset: 0,
            reason: "missing recovery journal signature".to_string(),
        });
    }

    let version = input
        .get(signature_len..HEADER_LEN)
        .map(LittleEndian::read_u16)
        .ok_or_else(|| CodecError::Format {
            offset: signature_len,
            reason: "missing schema version".to_string(),
        })?;
    if version != SCHEMA_VERSION {
        return Err(CodecError::Format {
            offset: signature_len,
            reason: format!("unsupported schema version {version}"),
        });
    }

    Ok(HEADER_LEN)
}

/// Encode everything in `db` not yet covered by `cursor` as one checkpoint.
/// The same cursor and database always produce the same bytes.
pub fn encode_delta(cursor: &RecoveryCursor, db: &ArchiveDatabase) -> Result<Vec<u8>, CodecError> {
    let mut delta = db.slice_from(cursor);
    let mut encoder = Encoder::new();
    transcode_checkpoint(&mut encoder, &mut delta)?;
    Ok(encoder.into_bytes())
}

/// Outcome of decoding one checkpoint.
#[derive(Debug)]
pub enum Decoded {
    /// A full checkpoint occupying `consumed` bytes.
    Complete {
        delta: ArchiveDatabase,
        consumed: usize,
    },
    /// The input ended mid-checkpoint. `partial` holds only the fields that
    /// decoded completely and must not be applied.
    Truncated { partial: ArchiveDatabase },
    /// No checkpoint starts here: the input is empty or zero-filled.
    End,
}

impl Decoded {
    /// True when a whole checkpoint was read.
    pub fn consumed_fully(&self) -> bool {
        matches!(self, Decoded::Complete { .. })
    }
}

/// Decode the checkpoint at the start of `input`.
pub fn decode_checkpoint(input: &[u8]) -> Result<Decoded, CodecError> {
    if input.iter().all(|&b| b == 0) {
        return Ok(Decoded::End);
    }

    let mut decoder = Decoder::new(input);
    let mut delta = ArchiveDatabase::new();
    match transcode_checkpoint(&mut decoder, &mut delta) {
        Ok(()) => Ok(Decoded::Complete {
            consumed: decoder.position(),
            delta,
        }),
        Err(CodecError::Truncated) => Ok(Decoded::Truncated { partial: delta }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_delta() -> ArchiveDatabase {
        let mut db = ArchiveDatabase::new();
        db.entries.push(Entry {
            name: "photos/caf\u{e9}.jpg".to_string(),
            attrib: Some(0x20),
            crc: Some(0xcafe_babe),
            has_stream: true,
            is_dir: false,
            size: 4096,
            journal_anchor: 0,
        });
        db.entries.push(Entry::directory("photos/"));
        db.start_pos.push(None);
        db.start_pos.push(Some(0));
        db.ctime.push(Some(130_000_000_000_000_000));
        db.ctime.push(None);
        db.mtime.push(Some(131_000_000_000_000_000));
        db.mtime.push(Some(131_000_000_000_000_001));
        db.atime.push(None);
        db.atime.push(None);
        db.is_anti.extend([false, false]);
        db.folders.push(Folder {
            coders: vec![
                CoderDescriptor::simple(0x030101, vec![0x5d, 0x00, 0x00, 0x10, 0x00]),
                CoderDescriptor {
                    method_id: 0x0303011b,
                    num_in_streams: 4,
                    num_out_streams: 1,
                    props: Vec::new(),
                },
            ],
            bind_pairs: vec![BindPair {
                in_index: 0,
                out_index: 1,
            }],
            pack_streams: vec![1, 2, 3, 4],
            unpack_crc: None,
            unpack_sizes: vec![4096, 4096],
        });
        db.num_unpack_streams.push(1);
        db.pack_sizes.push(1200);
        db.pack_crc_defined.push(true);
        db.pack_crcs.push(0x0102_0304);
        db
    }

    fn encode(db: &ArchiveDatabase) -> Vec<u8> {
        encode_delta(&RecoveryCursor::default(), db).unwrap()
    }

    #[test]
    fn checkpoint_round_trips() {
        let delta = sample_delta();
        let bytes = encode(&delta);

        match decode_checkpoint(&bytes).unwrap() {
            Decoded::Complete { delta: back, consumed } => {
                assert_eq!(back, delta);
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("expected a complete checkpoint, got {other:?}"),
        }
    }

    #[test]
    fn empty_delta_round_trips() {
        let bytes = encode(&ArchiveDatabase::new());
        // 12 tags, 11 zero counts.
        assert_eq!(bytes.len(), 12 + 11 * 4);

        let decoded = decode_checkpoint(&bytes).unwrap();
        assert!(decoded.consumed_fully());
    }

    #[test]
    fn encoding_is_deterministic() {
        let db = sample_delta();
        assert_eq!(encode(&db), encode(&db));
    }

    #[test]
    fn cursor_limits_encoded_elements() {
        let db = sample_delta();
        let cursor = RecoveryCursor {
            entries: 1,
            start_pos: 1,
            ..RecoveryCursor::default()
        };
        let bytes = encode_delta(&cursor, &db).unwrap();

        let Decoded::Complete { delta, .. } = decode_checkpoint(&bytes).unwrap() else {
            panic!("expected a complete checkpoint");
        };
        assert_eq!(delta.entries, vec![Entry::directory("photos/")]);
        assert_eq!(delta.start_pos.iter().collect::<Vec<_>>(), vec![Some(0)]);
        assert_eq!(delta.folders.len(), 1);
    }

    #[test]
    fn truncation_at_every_offset_is_not_an_error() {
        let bytes = encode(&sample_delta());
        for cut in 1..bytes.len() {
            match decode_checkpoint(&bytes[..cut]) {
                Ok(Decoded::Truncated { .. }) => {}
                other => panic!("cut at {cut}: expected truncation, got {other:?}"),
            }
        }
    }

    #[test]
    fn truncated_checkpoint_keeps_only_finished_fields() {
        let db = sample_delta();
        let bytes = encode(&db);
        // Cut inside the folder count, after the entries field finished.
        let folders_tag_at = bytes.len() - 1 - encode_folders_len(&db) - 1;
        let cut = &bytes[..folders_tag_at + 3];
        let Decoded::Truncated { partial } = decode_checkpoint(cut).unwrap() else {
            panic!("expected truncation");
        };
        assert_eq!(partial.entries, db.entries);
        assert!(partial.folders.is_empty());
    }

    fn encode_folders_len(db: &ArchiveDatabase) -> usize {
        let mut encoder = Encoder::new();
        let mut folders = db.folders.clone();
        seq(&mut encoder, &mut folders, folder).unwrap();
        encoder.into_bytes().len()
    }

    #[test]
    fn zero_filled_input_is_end_of_journal() {
        assert!(matches!(decode_checkpoint(&[]).unwrap(), Decoded::End));
        assert!(matches!(decode_checkpoint(&[0u8; 64]).unwrap(), Decoded::End));
    }

    #[test]
    fn torn_record_followed_by_zeros_is_truncation() {
        let bytes = encode(&sample_delta());
        let mut torn = bytes[..bytes.len() / 2].to_vec();
        torn.extend(std::iter::repeat_n(0u8, 40));

        assert!(matches!(
            decode_checkpoint(&torn).unwrap(),
            Decoded::Truncated { .. }
        ));
    }

    #[test]
    fn wrong_tag_is_a_format_error() {
        let mut bytes = encode(&sample_delta());
        bytes[0] = FieldTag::Folders as u8;

        let err = decode_checkpoint(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Format { offset: 0, .. }));
    }

    #[test]
    fn invalid_bool_is_a_format_error() {
        let mut db = ArchiveDatabase::new();
        db.is_anti.push(true);
        let mut bytes = encode(&db);
        // Earlier tags are 1..=8 and their counts are zero.
        let is_anti_tag = bytes
            .iter()
            .position(|&b| b == FieldTag::IsAnti as u8)
            .unwrap();
        bytes[is_anti_tag + 5] = 7;

        let err = decode_checkpoint(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Format { .. }));
    }

    #[test]
    fn negative_count_is_a_format_error() {
        let mut bytes = encode(&ArchiveDatabase::new());
        bytes[1..5].copy_from_slice(&(-3i32).to_le_bytes());

        let err = decode_checkpoint(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Format { offset: 1, .. }));
    }

    #[test]
    fn header_round_trips() {
        let header = encode_header();
        assert_eq!(header.len(), HEADER_LEN);
        assert_eq!(&header[..4], &[0x44, 0x00, 0x37, 0x00]);
        assert_eq!(decode_header(&header).unwrap(), HEADER_LEN);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut header = encode_header();
        header[0] = b'X';
        assert!(matches!(
            decode_header(&header),
            Err(CodecError::Format { offset: 0, .. })
        ));
        assert!(decode_header(&header[..3]).is_err());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut header = encode_header();
        header[HEADER_LEN - 2] = 9;
        assert!(decode_header(&header).is_err());
    }
}
