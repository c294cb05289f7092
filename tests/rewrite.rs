use std::sync::Arc;

use bagfile::{rewrite, Bag, BagMode, Compression, RawMessage, Time, TopicInfo};
use tempfile::tempdir;

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

fn drain(path: &std::path::Path) -> Vec<(String, Time, Vec<u8>)> {
    let mut bag = Bag::open(path, BagMode::Read).expect("open read");
    let messages = bag.get_messages(Time::ZERO, Time::MAX);
    messages
        .iter()
        .map(|info| {
            let payload = bag.read_message(info).expect("read message");
            (info.topic().to_string(), info.time(), payload)
        })
        .collect()
}

fn write_sample(path: &std::path::Path) {
    let info_a = topic_info("/a");
    let info_b = topic_info("/b");
    let mut bag = Bag::open(path, BagMode::Write).expect("open write");
    bag.set_chunk_threshold(256);
    for i in 0..30u32 {
        let (topic, info) = if i % 2 == 0 { ("/a", &info_a) } else { ("/b", &info_b) };
        bag.write(topic, Time::new(i, i), &msg(info, &[i as u8; 10])).expect("write");
    }
    bag.close().expect("close");
}

#[test]
fn rewrite_to_new_path_preserves_content() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("src.bag");
    let dst = dir.path().join("dst.bag");

    write_sample(&src);
    let before = drain(&src);

    rewrite(&src, &dst).expect("rewrite");

    assert_eq!(drain(&dst), before);
    assert_eq!(drain(&src), before);
}

#[test]
fn rewrite_in_place_goes_through_active_file() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("inplace.bag");

    write_sample(&src);
    let before = drain(&src);

    rewrite(&src, &src).expect("rewrite");

    assert_eq!(drain(&src), before);
    assert!(!dir.path().join("inplace.bag.active").exists());
}

#[test]
fn rewrite_changes_compression() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("stored.bag");
    let dst = dir.path().join("packed.bag");

    let info = topic_info("/a");
    let mut bag = Bag::open(&src, BagMode::Write).expect("open write");
    bag.set_compression(Compression::None);
    for i in 0..20u32 {
        bag.write("/a", Time::new(i, 0), &msg(&info, &[0u8; 512])).expect("write");
    }
    bag.close().expect("close");

    rewrite(&src, &dst).expect("rewrite");

    // The destination writer uses its own (compressing) defaults.
    assert_eq!(drain(&dst), drain(&src));
    let src_len = std::fs::metadata(&src).expect("metadata").len();
    let dst_len = std::fs::metadata(&dst).expect("metadata").len();
    assert!(dst_len < src_len);
}

#[test]
fn rewrite_missing_source_fails() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("missing.bag");
    let dst = dir.path().join("out.bag");
    assert!(rewrite(&src, &dst).is_err());
}
