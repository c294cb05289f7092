//! Time-ordered merge across per-topic indexes.
//!
//! Each requested topic contributes a cursor over the slice of its index
//! that falls inside the time window (found by binary search). A min-heap
//! keyed on the cursor's next timestamp drains the cursors into one
//! globally non-decreasing sequence. Equal timestamps are emitted in the
//! order the topics appeared in the caller's list; the file format leaves
//! this tie-break implementation-defined.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use crate::record::{IndexEntry, TopicInfo};
use crate::time::Time;

/// A lazy handle to one recorded message.
///
/// Holds the topic's schema and the index entry locating the message;
/// the payload bytes are materialized separately with
/// [`crate::Bag::read_message`], which touches the reader's single-chunk
/// decompression cache.
#[derive(Clone, Debug)]
pub struct MessageInfo {
    pub topic_info: Arc<TopicInfo>,
    pub entry: IndexEntry,
}

impl MessageInfo {
    pub fn topic(&self) -> &str {
        &self.topic_info.topic
    }

    pub fn time(&self) -> Time {
        self.entry.time
    }
}

struct Cursor<'a> {
    entries: &'a [IndexEntry],
    next: usize,
    topic_info: &'a Arc<TopicInfo>,
}

pub(crate) fn merge_topics(
    topic_infos: &BTreeMap<String, Arc<TopicInfo>>,
    topic_indexes: &BTreeMap<String, Vec<IndexEntry>>,
    topics: &[&str],
    start: Time,
    end: Time,
) -> Vec<MessageInfo> {
    let mut cursors = Vec::new();
    for topic in topics {
        let topic_info = match topic_infos.get(*topic) {
            Some(info) => info,
            None => continue,
        };
        let index = match topic_indexes.get(*topic) {
            Some(index) => index,
            None => continue,
        };
        let lo = index.partition_point(|e| e.time < start);
        let hi = index.partition_point(|e| e.time <= end);
        if lo < hi {
            cursors.push(Cursor {
                entries: &index[lo..hi],
                next: 0,
                topic_info,
            });
        }
    }

    let mut heap: BinaryHeap<Reverse<(Time, usize)>> = cursors
        .iter()
        .enumerate()
        .map(|(i, cursor)| Reverse((cursor.entries[0].time, i)))
        .collect();

    let mut messages = Vec::new();
    while let Some(Reverse((_, i))) = heap.pop() {
        let cursor = &mut cursors[i];
        let entry = cursor.entries[cursor.next];
        messages.push(MessageInfo {
            topic_info: cursor.topic_info.clone(),
            entry,
        });
        cursor.next += 1;
        if cursor.next < cursor.entries.len() {
            heap.push(Reverse((cursor.entries[cursor.next].time, i)));
        }
    }
    messages
}
