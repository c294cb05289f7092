//! Bag rewrite utility.

use std::path::{Path, PathBuf};

use log::debug;

use crate::bag::{Bag, BagMode};
use crate::error::Result;
use crate::message::RawMessage;
use crate::time::Time;

/// Copies every message of `src` into a freshly written bag at `dst`.
///
/// Messages are replayed in time order within each topic, so the result
/// has a clean index and freshly packed chunks regardless of how `src`
/// was produced. When `dst` equals `src` the new bag is written next to
/// it with an `.active` suffix and renamed over the original only after
/// both bags have closed cleanly.
pub fn rewrite(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    let mut reader = Bag::open(src, BagMode::Read)?;

    let target: PathBuf = if dst == src {
        let mut name = dst.as_os_str().to_os_string();
        name.push(".active");
        PathBuf::from(name)
    } else {
        dst.to_path_buf()
    };
    debug!("rewriting {} into {}", src.display(), target.display());

    let mut writer = Bag::open(&target, BagMode::Write)?;
    for info in reader.get_messages(Time::ZERO, Time::MAX) {
        let bytes = reader.read_message(&info)?;
        let msg = RawMessage::new(info.topic_info.clone(), bytes);
        writer.write(&info.topic_info.topic, info.entry.time, &msg)?;
    }
    writer.close()?;
    reader.close()?;

    if target != dst {
        std::fs::rename(&target, dst)?;
    }
    Ok(())
}
