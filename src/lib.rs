//! Chunked, compressed, indexed log files ("bags") for recording and
//! replaying timestamped topic messages.
//!
//! A bag is one self-describing file: messages from many topics are
//! appended chronologically into compressed chunks, each chunk is
//! followed by per-topic index records, and a trailing index region
//! (message definitions plus chunk summaries) makes time-range and
//! topic-filtered replay cheap. Bags can be reopened for append, and a
//! bag whose writer died before closing is rebuilt from its chunks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bagfile::{Bag, BagMode, RawMessage, Time, TopicInfo};
//!
//! let info = Arc::new(TopicInfo {
//!     topic: "/imu".to_string(),
//!     datatype: "sensor_msgs/Imu".to_string(),
//!     md5sum: "6a62c6daae103f4ff57a132d6f95cec2".to_string(),
//!     msg_def: "...".to_string(),
//! });
//!
//! let mut bag = Bag::open("run.bag", BagMode::Write)?;
//! bag.write("/imu", Time::new(100, 0), &RawMessage::new(info, vec![1, 2, 3]))?;
//! bag.close()?;
//!
//! let mut bag = Bag::open("run.bag", BagMode::Read)?;
//! for msg in bag.get_messages_by_topic(&["/imu"], Time::ZERO, Time::MAX) {
//!     let payload = bag.read_message(&msg)?;
//!     println!("{} @ {}: {} bytes", msg.topic(), msg.time(), payload.len());
//! }
//! # Ok::<(), bagfile::Error>(())
//! ```

pub mod bag;
pub mod disk;
pub mod error;
mod file;
pub mod header;
pub mod merge;
pub mod message;
pub mod record;
pub mod rewrite;
pub mod time;

pub use bag::{Bag, BagMode};
pub use disk::{DiskSpace, StatvfsDiskSpace, SystemWallClock, WallClock};
pub use error::{Error, Result};
pub use merge::MessageInfo;
pub use message::{Message, RawMessage};
pub use record::{
    ChunkHeader, ChunkInfo, Compression, IndexEntry, TopicInfo, CHUNK_INFO_VERSION,
    FILE_HEADER_LENGTH, INDEX_VERSION,
};
pub use rewrite::rewrite;
pub use time::Time;
