//! Byte-level checks of the on-disk layout: fixed-size file header,
//! uncompressed chunks addressable straight from index entries, chunk
//! thresholds, and connection-header flags landing in record headers.

use std::sync::Arc;

use bagfile::header::parse_record;
use bagfile::{
    Bag, BagMode, Compression, Message, RawMessage, Time, TopicInfo, FILE_HEADER_LENGTH,
};
use tempfile::tempdir;

const VERSION_LINE: &str = "#ROSBAG V2.0\n";

fn topic_info(topic: &str) -> Arc<TopicInfo> {
    Arc::new(TopicInfo {
        topic: topic.to_string(),
        datatype: "test_msgs/Blob".to_string(),
        md5sum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        msg_def: "byte[] data\n".to_string(),
    })
}

fn msg(info: &Arc<TopicInfo>, bytes: &[u8]) -> RawMessage {
    RawMessage::new(info.clone(), bytes.to_vec())
}

/// File offset of the first record after the padded file header.
fn first_chunk_pos() -> u64 {
    VERSION_LINE.len() as u64 + 8 + FILE_HEADER_LENGTH as u64
}

#[test]
fn file_header_is_padded_to_fixed_size() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pad.bag");

    let info = topic_info("/a");
    let mut bag = Bag::open(&path, BagMode::Write).expect("open write");
    bag.write("/a", Time::new(1, 0), &msg(&info, b"x")).expect("write");
    bag.close().expect("close");

    let bytes = std::fs::read(&path).expect("read file");
    assert!(bytes.starts_with(VERSION_LINE.as_bytes()));

    let (fields, data_len, consumed) =
        parse_record(&bytes, VERSION_LINE.len()).expect("parse file header");
    assert_eq!(fields.get_u8("op").expect("op"), 0x03);
    assert_eq!(consumed as u32 - 8 + data_len, FILE_HEADER_LENGTH);
    assert_ne!(fields.get_u64("index_pos").expect("index_pos"), 0);

    // The padding is spaces, so the close-time rewrite stays in place.
    let padding = &bytes[VERSION_LINE.len() + consumed..][..data_len as usize];
    assert!(padding.iter().all(|&b| b == b' '));

    let bag = Bag::open(&path, BagMode::Read).expect("open read");
    assert_eq!(bag.chunks()[0].pos, first_chunk_pos());
}

#[test]
fn uncompressed_chunks_are_directly_addressable() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("raw.bag");

    let info = topic_info("/a");
    let first = b"first payload".to_vec();
    let second = b"second payload, also known bytes".to_vec();

    let mut bag = Bag::open(&path, BagMode::Write).expect("open write");
    bag.set_compression(Compression::None);
    bag.write("/a", Time::new(1, 0), &msg(&info, &first)).expect("write 1");
    bag.write("/a", Time::new(2, 0), &msg(&info, &second)).expect("write 2");
    bag.close().expect("close");

    let bytes = std::fs::read(&path).expect("read file");
    let bag = Bag::open(&path, BagMode::Read).expect("open read");
    let index = bag.topic_index("/a").expect("index");
    assert_eq!(index.len(), 2);

    for (entry, payload) in index.iter().zip([&first, &second]) {
        // The chunk's data section starts right after its header.
        let (_, _, chunk_consumed) =
            parse_record(&bytes, entry.chunk_pos as usize).expect("parse chunk header");
        let record_at = entry.chunk_pos as usize + chunk_consumed + entry.offset as usize;

        // With no compression the message record sits in the file at
        // exactly chunk start + header + offset.
        let mut at = record_at;
        loop {
            let (fields, data_len, consumed) = parse_record(&bytes, at).expect("parse record");
            let op = fields.get_u8("op").expect("op");
            at += consumed;
            if op == 0x01 {
                at += data_len as usize;
                continue;
            }
            assert_eq!(op, 0x02);
            assert_eq!(fields.get_str("topic").expect("topic"), "/a");
            assert_eq!(&bytes[at..at + data_len as usize], payload.as_slice());
            break;
        }
    }
}

#[test]
fn chunks_cross_threshold_before_closing() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("threshold.bag");

    let info = topic_info("/a");
    let threshold = 256u32;

    let mut bag = Bag::open(&path, BagMode::Write).expect("open write");
    bag.set_compression(Compression::None);
    bag.set_chunk_threshold(threshold);
    for i in 0..50u32 {
        bag.write("/a", Time::new(i, 0), &msg(&info, &[i as u8; 24])).expect("write");
    }
    bag.close().expect("close");

    let bytes = std::fs::read(&path).expect("read file");
    let bag = Bag::open(&path, BagMode::Read).expect("open read");
    let chunks = bag.chunks();
    assert!(chunks.len() > 1);

    for (i, chunk) in chunks.iter().enumerate() {
        let (fields, _, _) = parse_record(&bytes, chunk.pos as usize).expect("parse chunk header");
        let uncompressed = fields.get_u32("size").expect("size");
        let messages: u32 = chunk.topic_counts.values().sum();
        assert!(messages >= 1);
        if i + 1 < chunks.len() {
            assert!(uncompressed > threshold);
        }
    }
}

struct LatchedMessage {
    inner: RawMessage,
    conn: std::collections::BTreeMap<String, String>,
}

impl Message for LatchedMessage {
    fn data_type(&self) -> &str {
        self.inner.data_type()
    }

    fn md5sum(&self) -> &str {
        self.inner.md5sum()
    }

    fn message_definition(&self) -> &str {
        self.inner.message_definition()
    }

    fn serialized_len(&self) -> u32 {
        self.inner.serialized_len()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.inner.serialize(buf)
    }

    fn connection_header(&self) -> Option<&std::collections::BTreeMap<String, String>> {
        Some(&self.conn)
    }
}

#[test]
fn latching_and_callerid_are_recorded() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("latch.bag");

    let info = topic_info("/tf_static");
    let mut conn = std::collections::BTreeMap::new();
    conn.insert("latching".to_string(), "1".to_string());
    conn.insert("callerid".to_string(), "/recorder".to_string());
    let latched = LatchedMessage {
        inner: msg(&info, b"pose"),
        conn,
    };

    let mut bag = Bag::open(&path, BagMode::Write).expect("open write");
    bag.set_compression(Compression::None);
    bag.write("/tf_static", Time::new(1, 0), &latched).expect("write");
    bag.close().expect("close");

    let bytes = std::fs::read(&path).expect("read file");
    let needle = b"latching=1";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));
    let needle = b"callerid=/recorder";
    assert!(bytes.windows(needle.len()).any(|w| w == needle));

    let mut bag = Bag::open(&path, BagMode::Read).expect("open read");
    let messages = bag.get_messages(Time::ZERO, Time::MAX);
    assert_eq!(messages.len(), 1);
    assert_eq!(bag.read_message(&messages[0]).expect("read"), b"pose");
}
