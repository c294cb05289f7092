//! Messages consumed by the writer.
//!
//! The engine treats message payloads as opaque bytes; serialization and
//! the type system live with the caller. A writable message exposes its
//! schema identity (data type name, MD5 fingerprint, definition text),
//! its serialized form, and optionally the connection header the
//! middleware attached to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::record::TopicInfo;

pub trait Message {
    /// Fully qualified data type name, e.g. `sensor_msgs/Imu`.
    fn data_type(&self) -> &str;

    /// 32-hex-character fingerprint of the schema.
    fn md5sum(&self) -> &str;

    /// Full text of the schema definition.
    fn message_definition(&self) -> &str;

    /// Serialized size in bytes; used to pre-size the record buffer.
    fn serialized_len(&self) -> u32;

    /// Appends the serialized message to `buf`.
    fn serialize(&self, buf: &mut Vec<u8>);

    /// Middleware connection header, if any. The writer records the
    /// `latching` flag and `callerid` from it.
    fn connection_header(&self) -> Option<&BTreeMap<String, String>> {
        None
    }
}

/// An already-serialized message paired with its topic's schema.
///
/// This is what replay hands back: the rewrite utility reads payload
/// bytes out of one bag and writes them into another without ever
/// deserializing.
#[derive(Clone, Debug)]
pub struct RawMessage {
    topic_info: Arc<TopicInfo>,
    bytes: Vec<u8>,
}

impl RawMessage {
    pub fn new(topic_info: Arc<TopicInfo>, bytes: Vec<u8>) -> Self {
        Self { topic_info, bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn topic_info(&self) -> &TopicInfo {
        &self.topic_info
    }
}

impl Message for RawMessage {
    fn data_type(&self) -> &str {
        &self.topic_info.datatype
    }

    fn md5sum(&self) -> &str {
        &self.topic_info.md5sum
    }

    fn message_definition(&self) -> &str {
        &self.topic_info.msg_def
    }

    fn serialized_len(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bytes);
    }
}
