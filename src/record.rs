//! On-disk record layer.
//!
//! A bag file is a version line followed by records, each a header (see
//! [`crate::header`]) plus a data blob:
//!
//! ```text
//! #ROSBAG V2.0\n
//! file-header record            padded to 4096 bytes, rewritten on close
//! chunk record
//!   index-data record*          one per topic present in the chunk
//! chunk record
//!   index-data record*
//! ...
//! message-definition record*    index region: one per topic
//! chunk-info record*            index region: one per chunk
//! ```
//!
//! | op   | record             | data section                         |
//! |------|--------------------|--------------------------------------|
//! | 0x03 | file-header        | space padding                        |
//! | 0x05 | chunk              | compressed run of records            |
//! | 0x04 | index-data         | `count` x 12 bytes (sec, nsec, offset) |
//! | 0x01 | message-definition | empty                                |
//! | 0x02 | message-data       | serialized message bytes             |
//! | 0x06 | chunk-info         | per topic: name length, name, count  |

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::file::LogFile;
use crate::header::Fields;
use crate::time::Time;

pub const OP_MSG_DEF: u8 = 0x01;
pub const OP_MSG_DATA: u8 = 0x02;
pub const OP_FILE_HEADER: u8 = 0x03;
pub const OP_INDEX_DATA: u8 = 0x04;
pub const OP_CHUNK: u8 = 0x05;
pub const OP_CHUNK_INFO: u8 = 0x06;

/// The file-header record is padded out to this many bytes so it can be
/// rewritten in place on close without moving anything after it.
pub const FILE_HEADER_LENGTH: u32 = 4096;

pub const INDEX_VERSION: u32 = 1;
pub const CHUNK_INFO_VERSION: u32 = 1;

pub(crate) const VERSION_PREFIX: &str = "#ROSBAG V";
pub(crate) const VERSION_WRITTEN: &str = "2.0";

pub(crate) const FIELD_OP: &str = "op";
pub(crate) const FIELD_INDEX_POS: &str = "index_pos";
pub(crate) const FIELD_CONN_COUNT: &str = "conn_count";
pub(crate) const FIELD_CHUNK_COUNT: &str = "chunk_count";
pub(crate) const FIELD_COMPRESSION: &str = "compression";
pub(crate) const FIELD_SIZE: &str = "size";
pub(crate) const FIELD_VER: &str = "ver";
pub(crate) const FIELD_TOPIC: &str = "topic";
pub(crate) const FIELD_COUNT: &str = "count";
pub(crate) const FIELD_MD5: &str = "md5";
pub(crate) const FIELD_TYPE: &str = "type";
pub(crate) const FIELD_DEF: &str = "def";
pub(crate) const FIELD_TIME: &str = "time";
pub(crate) const FIELD_LATCHING: &str = "latching";
pub(crate) const FIELD_CALLERID: &str = "callerid";
pub(crate) const FIELD_CHUNK_POS: &str = "chunk_pos";
pub(crate) const FIELD_START_TIME: &str = "start_time";
pub(crate) const FIELD_END_TIME: &str = "end_time";

/// Chunk payload compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Bz2,
    Zlib,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bz2 => "bz2",
            Compression::Zlib => "zlib",
        }
    }

    pub(crate) fn from_bytes(raw: &[u8]) -> Result<Self> {
        match raw {
            b"none" => Ok(Compression::None),
            b"bz2" => Ok(Compression::Bz2),
            b"zlib" => Ok(Compression::Zlib),
            _ => Err(Error::Compression("unknown chunk compression")),
        }
    }
}

/// The schema of one topic, captured on first write and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic: String,
    pub datatype: String,
    pub md5sum: String,
    pub msg_def: String,
}

/// Points at one message record inside a chunk.
///
/// `chunk_pos` is the file offset of the chunk record's header; `offset`
/// is the byte offset of the message's record header within the chunk's
/// decompressed payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub time: Time,
    pub chunk_pos: u64,
    pub offset: u32,
}

/// Summary of one chunk, kept in memory and serialized to the index
/// region on close.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkInfo {
    pub pos: u64,
    pub start_time: Time,
    pub end_time: Time,
    pub topic_counts: BTreeMap<String, u32>,
}

/// Decoded chunk record header.
#[derive(Clone, Copy, Debug)]
pub struct ChunkHeader {
    pub compression: Compression,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

/// Writes a record header: length word, field area, data length word.
pub(crate) fn write_header(file: &mut LogFile, fields: &Fields, data_len: u32) -> Result<()> {
    let header = fields.encode();
    file.write_all(&(header.len() as u32).to_le_bytes())?;
    file.write_all(&header)?;
    file.write_all(&data_len.to_le_bytes())?;
    Ok(())
}

// Upper bound on a single record header; definition texts are large but
// nowhere near this.
const MAX_HEADER_LEN: u32 = 1 << 26;

/// Reads a record header from the file, leaving the cursor at the start
/// of the data section.
pub(crate) fn read_header(file: &mut LogFile) -> Result<(Fields, u32)> {
    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let header_len = u32::from_le_bytes(word);
    if header_len > MAX_HEADER_LEN {
        return Err(Error::Format("record header length out of range"));
    }
    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let fields = Fields::parse(&header)?;
    file.read_exact(&mut word)?;
    let data_len = u32::from_le_bytes(word);
    Ok((fields, data_len))
}

pub(crate) fn expect_op(fields: &Fields, op: u8) -> Result<()> {
    let found = fields.get_u8(FIELD_OP)?;
    if found != op {
        return Err(Error::UnexpectedOp(found));
    }
    Ok(())
}

/// Index-data payload, current layout: 12 bytes per entry.
pub(crate) fn encode_index_entries(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 12);
    for entry in entries {
        out.extend_from_slice(&entry.time.sec.to_le_bytes());
        out.extend_from_slice(&entry.time.nsec.to_le_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
    }
    out
}

pub(crate) fn decode_index_entries_v1(
    data: &[u8],
    count: u32,
    chunk_pos: u64,
) -> Result<Vec<IndexEntry>> {
    if data.len() != count as usize * 12 {
        return Err(Error::Format("index data size does not match count"));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for raw in data.chunks_exact(12) {
        entries.push(IndexEntry {
            time: Time::new(
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ),
            chunk_pos,
            offset: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        });
    }
    Ok(entries)
}

/// Legacy layout (1.2 bags): 20 bytes per entry, absolute record position
/// stored where the chunk position lives today, no intra-chunk offset.
pub(crate) fn decode_index_entries_v0(data: &[u8], count: u32) -> Result<Vec<IndexEntry>> {
    if data.len() < count as usize * 20 {
        return Err(Error::Format("index data shorter than count"));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for raw in data.chunks_exact(20).take(count as usize) {
        entries.push(IndexEntry {
            time: Time::new(
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ),
            chunk_pos: u64::from_le_bytes([
                raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
            ]),
            offset: 0,
        });
    }
    Ok(entries)
}

/// Chunk-info payload: per topic, a length-prefixed name and a count.
pub(crate) fn encode_topic_counts(counts: &BTreeMap<String, u32>) -> Vec<u8> {
    let mut out = Vec::new();
    for (topic, count) in counts {
        out.extend_from_slice(&(topic.len() as u32).to_le_bytes());
        out.extend_from_slice(topic.as_bytes());
        out.extend_from_slice(&count.to_le_bytes());
    }
    out
}

pub(crate) fn decode_topic_counts(data: &[u8], count: u32) -> Result<BTreeMap<String, u32>> {
    let mut counts = BTreeMap::new();
    let mut pos = 0usize;
    for _ in 0..count {
        if pos + 4 > data.len() {
            return Err(Error::Format("truncated chunk-info entry"));
        }
        let name_len =
            u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if name_len > data.len().saturating_sub(pos + 4) {
            return Err(Error::Format("chunk-info topic name overruns record"));
        }
        let topic = std::str::from_utf8(&data[pos..pos + name_len])
            .map_err(|_| Error::Format("chunk-info topic name is not utf-8"))?
            .to_string();
        pos += name_len;
        let messages =
            u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        pos += 4;
        counts.insert(topic, messages);
    }
    if pos != data.len() {
        return Err(Error::Format("trailing bytes in chunk-info record"));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_entries_round_trip() {
        let entries = vec![
            IndexEntry {
                time: Time::new(10, 0),
                chunk_pos: 4242,
                offset: 0,
            },
            IndexEntry {
                time: Time::new(10, 500),
                chunk_pos: 4242,
                offset: 77,
            },
        ];
        let data = encode_index_entries(&entries);
        assert_eq!(data.len(), 24);
        let decoded = decode_index_entries_v1(&data, 2, 4242).expect("decode");
        assert_eq!(decoded, entries);
    }

    #[test]
    fn index_entries_v1_rejects_count_mismatch() {
        let data = encode_index_entries(&[IndexEntry::default()]);
        assert!(decode_index_entries_v1(&data, 2, 0).is_err());
    }

    #[test]
    fn index_entries_v0_layout() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&9u32.to_le_bytes());
        data.extend_from_slice(&123_456u64.to_le_bytes());
        let decoded = decode_index_entries_v0(&data, 1).expect("decode");
        assert_eq!(
            decoded,
            vec![IndexEntry {
                time: Time::new(7, 9),
                chunk_pos: 123_456,
                offset: 0,
            }]
        );
    }

    #[test]
    fn topic_counts_round_trip() {
        let mut counts = BTreeMap::new();
        counts.insert("/camera/image".to_string(), 12);
        counts.insert("/imu".to_string(), 3);
        let data = encode_topic_counts(&counts);
        let decoded = decode_topic_counts(&data, 2).expect("decode");
        assert_eq!(decoded, counts);
    }

    #[test]
    fn topic_counts_rejects_truncation() {
        let mut counts = BTreeMap::new();
        counts.insert("/imu".to_string(), 3);
        let data = encode_topic_counts(&counts);
        assert!(decode_topic_counts(&data[..data.len() - 1], 1).is_err());
    }

    #[test]
    fn compression_names() {
        assert_eq!(
            Compression::from_bytes(b"bz2").expect("bz2"),
            Compression::Bz2
        );
        assert_eq!(
            Compression::from_bytes(b"none").expect("none"),
            Compression::None
        );
        assert_eq!(
            Compression::from_bytes(b"zlib").expect("zlib"),
            Compression::Zlib
        );
        assert!(Compression::from_bytes(b"lz4").is_err());
    }
}
