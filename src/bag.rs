//! The bag engine.
//!
//! A [`Bag`] wraps one log file in one of four modes. Writers accumulate
//! messages into a compressed chunk, closing it once its uncompressed
//! size crosses the configured threshold and following it with one
//! index-data record per topic. Closing the bag writes the index region
//! (message definitions, then chunk summaries) and rewrites the padded
//! file header so it points at it. Readers walk the same structure
//! backwards: header, index region, then each chunk's trailing index
//! records.
//!
//! Append opens an existing bag, loads its index, chops the index region
//! off and continues writing; the file header keeps `index_pos = 0`
//! until the next clean close, which is how a crashed writer is
//! detected. Appending to such a file triggers a chunk-by-chunk scan
//! that rebuilds the index from the data itself.
//!
//! A bag is exclusively owned while in use (`&mut self` on every
//! mutating operation); wrap it in a lock to share across threads.
//! `close` performs no signal handling of its own. Callers that must not
//! be interrupted mid-close (the index region write is what makes the
//! file self-describing) arrange SIGINT deferral at the application
//! boundary.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::disk::{DiskSpace, StatvfsDiskSpace, SystemWallClock, WallClock};
use crate::error::{Error, Result};
use crate::file::{decompress, LogFile};
use crate::header::{self, Fields};
use crate::merge::{merge_topics, MessageInfo};
use crate::message::Message;
use crate::record::{
    self, ChunkHeader, ChunkInfo, Compression, IndexEntry, TopicInfo, CHUNK_INFO_VERSION,
    FIELD_CALLERID, FIELD_CHUNK_COUNT, FIELD_CHUNK_POS, FIELD_COMPRESSION, FIELD_CONN_COUNT,
    FIELD_COUNT, FIELD_DEF, FIELD_END_TIME, FIELD_INDEX_POS, FIELD_LATCHING, FIELD_MD5, FIELD_OP,
    FIELD_SIZE, FIELD_START_TIME, FIELD_TIME, FIELD_TOPIC, FIELD_TYPE, FIELD_VER,
    FILE_HEADER_LENGTH, INDEX_VERSION, OP_CHUNK, OP_CHUNK_INFO, OP_FILE_HEADER, OP_INDEX_DATA,
    OP_MSG_DATA, OP_MSG_DEF, VERSION_PREFIX, VERSION_WRITTEN,
};
use crate::time::Time;

const DEFAULT_CHUNK_THRESHOLD: u32 = 768 * 1024;

const DISK_CHECK_INTERVAL_SECS: u64 = 20;
const DROP_WARN_INTERVAL_SECS: u64 = 5;
const DISABLE_FREE_BYTES: u64 = 1 << 30;
const WARN_FREE_BYTES: u64 = 5 << 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BagMode {
    Read,
    Write,
    Append,
    ReadAppend,
}

pub struct Bag {
    file: LogFile,
    mode: BagMode,
    version: u32,

    compression: Compression,
    chunk_threshold: u32,

    file_header_pos: u64,
    index_data_pos: u64,

    topic_infos: BTreeMap<String, Arc<TopicInfo>>,
    topic_indexes: BTreeMap<String, Vec<IndexEntry>>,
    chunk_infos: Vec<ChunkInfo>,

    chunk_open: bool,
    curr_chunk_info: ChunkInfo,
    curr_chunk_compression: Compression,
    curr_chunk_topic_indexes: BTreeMap<String, Vec<IndexEntry>>,
    curr_chunk_data_pos: u64,

    decompressed_chunk: Option<u64>,
    decompress_buffer: Vec<u8>,

    writing_enabled: bool,
    check_disk_next: u64,
    warn_next: u64,

    clock: Box<dyn WallClock>,
    disk: Box<dyn DiskSpace>,

    closed: bool,
}

impl Bag {
    /// Opens a bag file.
    ///
    /// `Read` loads the index of an existing bag; `Write` creates or
    /// truncates; `Append` and `ReadAppend` load an existing bag's index
    /// and continue writing after its last chunk.
    ///
    /// # Errors
    ///
    /// - `Error::Io`: the file cannot be opened
    /// - `Error::UnsupportedVersion`: the version line names a format
    ///   this crate does not read
    /// - `Error::Format`: the header or index structure is malformed
    pub fn open(path: impl AsRef<Path>, mode: BagMode) -> Result<Bag> {
        let file = match mode {
            BagMode::Read => LogFile::open_read(path.as_ref())?,
            BagMode::Write => LogFile::open_write(path.as_ref())?,
            BagMode::Append | BagMode::ReadAppend => LogFile::open_read_write(path.as_ref())?,
        };
        let mut bag = Bag {
            file,
            mode,
            version: 0,
            compression: Compression::Bz2,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            file_header_pos: 0,
            index_data_pos: 0,
            topic_infos: BTreeMap::new(),
            topic_indexes: BTreeMap::new(),
            chunk_infos: Vec::new(),
            chunk_open: false,
            curr_chunk_info: ChunkInfo::default(),
            curr_chunk_compression: Compression::None,
            curr_chunk_topic_indexes: BTreeMap::new(),
            curr_chunk_data_pos: 0,
            decompressed_chunk: None,
            decompress_buffer: Vec::new(),
            writing_enabled: true,
            check_disk_next: 0,
            warn_next: 0,
            clock: Box::new(SystemWallClock),
            disk: Box::new(StatvfsDiskSpace),
            closed: false,
        };
        let opened = match mode {
            BagMode::Read => bag.open_read(),
            BagMode::Write => bag.open_write(),
            BagMode::Append | BagMode::ReadAppend => bag.open_append(),
        };
        if let Err(err) = opened {
            // Keep drop from running the close path over a file this
            // bag never finished opening.
            bag.closed = true;
            return Err(err);
        }
        Ok(bag)
    }

    /// Finishes the bag. For writing modes this closes any open chunk,
    /// writes the index region and rewrites the file header; without it
    /// the file is left index-less (recoverable by append). Idempotent;
    /// also run on drop, where errors are discarded.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        // Marked first: a close that failed partway is not retried on
        // drop over a file in an unknown state.
        self.closed = true;
        if matches!(
            self.mode,
            BagMode::Write | BagMode::Append | BagMode::ReadAppend
        ) {
            self.stop_writing()?;
        }
        Ok(())
    }

    pub fn mode(&self) -> BagMode {
        self.mode
    }

    /// Current raw file offset.
    pub fn offset(&self) -> u64 {
        self.file.offset()
    }

    pub fn major_version(&self) -> u32 {
        self.version / 100
    }

    pub fn minor_version(&self) -> u32 {
        self.version % 100
    }

    pub fn set_chunk_threshold(&mut self, bytes: u32) {
        self.chunk_threshold = bytes;
    }

    pub fn chunk_threshold(&self) -> u32 {
        self.chunk_threshold
    }

    /// Compression for chunks opened from now on; the chunk currently
    /// being filled keeps the kind it was opened with.
    pub fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Topics seen so far, in lexical order.
    pub fn topics(&self) -> Vec<&str> {
        self.topic_infos.keys().map(String::as_str).collect()
    }

    pub fn topic_info(&self, topic: &str) -> Option<&Arc<TopicInfo>> {
        self.topic_infos.get(topic)
    }

    /// Chunk summaries, in file order. Excludes the chunk currently
    /// being written.
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunk_infos
    }

    /// Index entries for one topic. Entries for the chunk currently
    /// being written appear only after that chunk closes.
    pub fn topic_index(&self, topic: &str) -> Option<&[IndexEntry]> {
        self.topic_indexes.get(topic).map(Vec::as_slice)
    }

    /// Replaces the wall clock used for disk-check pacing.
    pub fn set_clock(&mut self, clock: Box<dyn WallClock>) {
        self.clock = clock;
    }

    /// Replaces the free-disk probe.
    pub fn set_disk_space(&mut self, disk: Box<dyn DiskSpace>) {
        self.disk = disk;
    }

    // Write path

    /// Records one message.
    ///
    /// The first message on a new topic captures the topic's schema from
    /// `msg` and writes a definition record ahead of it inside the
    /// chunk. When free disk space has dropped below 1 GiB the message
    /// is dropped silently (a warning is logged at most every five
    /// seconds); this is not an error.
    pub fn write<M: Message + ?Sized>(&mut self, topic: &str, time: Time, msg: &M) -> Result<()> {
        if self.mode == BagMode::Read {
            return Err(Error::BadState("bag is open read-only"));
        }
        if self.closed {
            return Err(Error::BadState("bag is closed"));
        }
        if !self.check_logging() {
            return Ok(());
        }
        self.scheduled_check_disk();

        let needs_def = !self.topic_infos.contains_key(topic);
        if needs_def {
            let info = Arc::new(TopicInfo {
                topic: topic.to_string(),
                datatype: msg.data_type().to_string(),
                md5sum: msg.md5sum().to_string(),
                msg_def: msg.message_definition().to_string(),
            });
            self.topic_infos.insert(topic.to_string(), info);
            self.topic_indexes.entry(topic.to_string()).or_default();
        }

        // A read may have moved the cursor.
        self.file.seek(SeekFrom::End(0))?;

        if !self.chunk_open {
            self.start_writing_chunk(time)?;
        }

        let entry = IndexEntry {
            time,
            chunk_pos: self.curr_chunk_info.pos,
            offset: self.chunk_offset(),
        };
        self.curr_chunk_topic_indexes
            .entry(topic.to_string())
            .or_default()
            .push(entry);
        *self
            .curr_chunk_info
            .topic_counts
            .entry(topic.to_string())
            .or_insert(0) += 1;

        if needs_def {
            let info = self.topic_infos[topic].clone();
            self.write_message_definition_record(&info)?;
        }

        self.write_message_data_record(topic, time, msg)?;

        if time > self.curr_chunk_info.end_time {
            self.curr_chunk_info.end_time = time;
        }

        if self.chunk_offset() > self.chunk_threshold {
            self.stop_writing_chunk()?;
        }
        Ok(())
    }

    /// Logical size of the open chunk: raw growth for uncompressed
    /// chunks, otherwise the compressor's bytes-in counter.
    fn chunk_offset(&self) -> u32 {
        if self.curr_chunk_compression == Compression::None {
            (self.file.offset() - self.curr_chunk_data_pos) as u32
        } else {
            self.file.compressed_bytes_in() as u32
        }
    }

    fn start_writing_chunk(&mut self, time: Time) -> Result<()> {
        self.curr_chunk_info = ChunkInfo {
            pos: self.file.offset(),
            start_time: time,
            end_time: time,
            topic_counts: BTreeMap::new(),
        };
        self.curr_chunk_compression = self.compression;
        // Sizes are placeholders until the chunk ends.
        self.write_chunk_header(self.curr_chunk_compression, 0, 0)?;
        self.file.set_write_mode(self.curr_chunk_compression)?;
        self.curr_chunk_data_pos = self.file.offset();
        self.chunk_open = true;
        Ok(())
    }

    fn stop_writing_chunk(&mut self) -> Result<()> {
        let curr_indexes = std::mem::take(&mut self.curr_chunk_topic_indexes);
        self.chunk_infos.push(self.curr_chunk_info.clone());
        for (topic, entries) in &curr_indexes {
            self.topic_indexes
                .entry(topic.clone())
                .or_default()
                .extend(entries.iter().copied());
        }

        let uncompressed_size = self.chunk_offset();
        self.file.set_write_mode(Compression::None)?;
        let compressed_size = (self.file.offset() - self.curr_chunk_data_pos) as u32;
        debug!("end chunk: compressed={compressed_size} uncompressed={uncompressed_size}");

        let end_of_chunk = self.file.offset();
        self.file.seek(SeekFrom::Start(self.curr_chunk_info.pos))?;
        self.write_chunk_header(self.curr_chunk_compression, compressed_size, uncompressed_size)?;
        self.file.seek(SeekFrom::Start(end_of_chunk))?;
        self.write_index_records(&curr_indexes)?;
        self.chunk_open = false;
        Ok(())
    }

    fn stop_writing(&mut self) -> Result<()> {
        if self.chunk_open {
            self.stop_writing_chunk()?;
        }
        self.file.seek(SeekFrom::End(0))?;
        self.index_data_pos = self.file.offset();
        self.write_message_definition_records()?;
        self.write_chunk_info_records()?;
        self.file.seek(SeekFrom::Start(self.file_header_pos))?;
        self.write_file_header_record()?;
        Ok(())
    }

    fn write_version(&mut self) -> Result<()> {
        let line = format!("{VERSION_PREFIX}{VERSION_WRITTEN}\n");
        debug!("writing version line at {}: {}", self.file.offset(), line.trim_end());
        self.file.write_all(line.as_bytes())
    }

    fn write_file_header_record(&mut self) -> Result<()> {
        let topic_count = self.topic_infos.len() as u32;
        let chunk_count = self.chunk_infos.len() as u32;
        debug!(
            "writing FILE_HEADER at {}: index_pos={} topic_count={topic_count} chunk_count={chunk_count}",
            self.file.offset(),
            self.index_data_pos
        );

        let mut fields = Fields::new();
        fields.set_u8(FIELD_OP, OP_FILE_HEADER);
        fields.set_u64(FIELD_INDEX_POS, self.index_data_pos);
        fields.set_u32(FIELD_CONN_COUNT, topic_count);
        fields.set_u32(FIELD_CHUNK_COUNT, chunk_count);

        let header = fields.encode();
        let header_len = header.len() as u32;
        let data_len = FILE_HEADER_LENGTH.saturating_sub(header_len);
        self.file.write_all(&header_len.to_le_bytes())?;
        self.file.write_all(&header)?;
        self.file.write_all(&data_len.to_le_bytes())?;
        if data_len > 0 {
            // Space padding keeps the record at a fixed size so the
            // close-time rewrite cannot move anything after it.
            self.file.write_all(&vec![b' '; data_len as usize])?;
        }
        Ok(())
    }

    fn write_chunk_header(
        &mut self,
        compression: Compression,
        compressed_size: u32,
        uncompressed_size: u32,
    ) -> Result<()> {
        debug!(
            "writing CHUNK at {}: compression={} compressed={compressed_size} uncompressed={uncompressed_size}",
            self.file.offset(),
            compression.as_str()
        );
        let mut fields = Fields::new();
        fields.set_u8(FIELD_OP, OP_CHUNK);
        fields.set_str(FIELD_COMPRESSION, compression.as_str());
        fields.set_u32(FIELD_SIZE, uncompressed_size);
        record::write_header(&mut self.file, &fields, compressed_size)
    }

    fn write_index_records(&mut self, indexes: &BTreeMap<String, Vec<IndexEntry>>) -> Result<()> {
        for (topic, entries) in indexes {
            debug!(
                "writing INDEX_DATA at {}: topic={topic} count={}",
                self.file.offset(),
                entries.len()
            );
            let mut fields = Fields::new();
            fields.set_u8(FIELD_OP, OP_INDEX_DATA);
            fields.set_str(FIELD_TOPIC, topic);
            fields.set_u32(FIELD_VER, INDEX_VERSION);
            fields.set_u32(FIELD_COUNT, entries.len() as u32);
            let data = record::encode_index_entries(entries);
            record::write_header(&mut self.file, &fields, data.len() as u32)?;
            self.file.write_all(&data)?;
        }
        Ok(())
    }

    fn write_message_definition_records(&mut self) -> Result<()> {
        let infos: Vec<Arc<TopicInfo>> = self.topic_infos.values().cloned().collect();
        for info in infos {
            self.write_message_definition_record(&info)?;
        }
        Ok(())
    }

    fn write_message_definition_record(&mut self, info: &TopicInfo) -> Result<()> {
        debug!(
            "writing MSG_DEF at {}: topic={} type={}",
            self.file.offset(),
            info.topic,
            info.datatype
        );
        let mut fields = Fields::new();
        fields.set_u8(FIELD_OP, OP_MSG_DEF);
        fields.set_str(FIELD_TOPIC, &info.topic);
        fields.set_str(FIELD_MD5, &info.md5sum);
        fields.set_str(FIELD_TYPE, &info.datatype);
        fields.set_str(FIELD_DEF, &info.msg_def);
        record::write_header(&mut self.file, &fields, 0)
    }

    fn write_message_data_record<M: Message + ?Sized>(
        &mut self,
        topic: &str,
        time: Time,
        msg: &M,
    ) -> Result<()> {
        let mut fields = Fields::new();
        fields.set_u8(FIELD_OP, OP_MSG_DATA);
        fields.set_str(FIELD_TOPIC, topic);
        fields.set_time(FIELD_TIME, time);
        if let Some(conn) = msg.connection_header() {
            let latching = conn.get(FIELD_LATCHING).is_some_and(|v| v != "0");
            if latching {
                fields.set_str(FIELD_LATCHING, "1");
                if let Some(callerid) = conn.get(FIELD_CALLERID) {
                    fields.set_str(FIELD_CALLERID, callerid);
                }
            }
        }

        let mut data = Vec::with_capacity(msg.serialized_len() as usize);
        msg.serialize(&mut data);
        debug!(
            "writing MSG_DATA at {}+{}: topic={topic} time={time} data_len={}",
            self.file.offset(),
            self.chunk_offset(),
            data.len()
        );
        record::write_header(&mut self.file, &fields, data.len() as u32)?;
        self.file.write_all(&data)
    }

    fn write_chunk_info_records(&mut self) -> Result<()> {
        let chunk_infos = std::mem::take(&mut self.chunk_infos);
        for info in &chunk_infos {
            debug!(
                "writing CHUNK_INFO at {}: pos={} start={} end={} topics={}",
                self.file.offset(),
                info.pos,
                info.start_time,
                info.end_time,
                info.topic_counts.len()
            );
            let mut fields = Fields::new();
            fields.set_u8(FIELD_OP, OP_CHUNK_INFO);
            fields.set_u32(FIELD_VER, CHUNK_INFO_VERSION);
            fields.set_u64(FIELD_CHUNK_POS, info.pos);
            fields.set_time(FIELD_START_TIME, info.start_time);
            fields.set_time(FIELD_END_TIME, info.end_time);
            fields.set_u32(FIELD_COUNT, info.topic_counts.len() as u32);
            let data = record::encode_topic_counts(&info.topic_counts);
            record::write_header(&mut self.file, &fields, data.len() as u32)?;
            self.file.write_all(&data)?;
        }
        self.chunk_infos = chunk_infos;
        Ok(())
    }

    // Open paths

    fn open_read(&mut self) -> Result<()> {
        self.read_version()?;
        match self.version {
            102 => self.start_reading_102(),
            103 | 200 => self.start_reading_200(),
            version => Err(Error::UnsupportedVersion(version)),
        }
    }

    fn open_write(&mut self) -> Result<()> {
        self.version = 200;
        self.check_disk();
        self.check_disk_next = self.clock.now_secs() + DISK_CHECK_INTERVAL_SECS;
        self.write_version()?;
        self.file_header_pos = self.file.offset();
        self.write_file_header_record()
    }

    fn open_append(&mut self) -> Result<()> {
        self.check_disk();
        self.check_disk_next = self.clock.now_secs() + DISK_CHECK_INTERVAL_SECS;

        self.read_version()?;
        if self.version != 103 && self.version != 200 {
            return Err(Error::UnsupportedVersion(self.version));
        }

        let (topic_count, chunk_count) = self.read_file_header_record()?;
        if self.index_data_pos == 0 {
            // The previous writer never closed; the chunks are the only
            // source of truth left.
            self.recover_unindexed()?;
        } else {
            self.load_index(topic_count, chunk_count)?;
            // Chop off the index region; it is rewritten on close.
            self.file.truncate(self.index_data_pos)?;
        }

        self.index_data_pos = 0;
        self.file.seek(SeekFrom::Start(self.file_header_pos))?;
        self.write_file_header_record()?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn read_version(&mut self) -> Result<()> {
        let line = self.file.read_line()?;
        self.file_header_pos = self.file.offset();
        let trimmed = line.trim_end();
        self.version = match trimmed.strip_prefix(VERSION_PREFIX) {
            Some(rest) => {
                let mut parts = rest.splitn(2, '.');
                let major: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error::Format("malformed version line"))?;
                let minor: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error::Format("malformed version line"))?;
                major * 100 + minor
            }
            None if trimmed.starts_with('#') => 100,
            None => return Err(Error::Format("missing bag version line")),
        };
        debug!("read version line: {}.{}", self.major_version(), self.minor_version());
        Ok(())
    }

    fn start_reading_200(&mut self) -> Result<()> {
        let (topic_count, chunk_count) = self.read_file_header_record()?;
        self.load_index(topic_count, chunk_count)
    }

    fn load_index(&mut self, topic_count: u32, chunk_count: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.index_data_pos))?;
        for _ in 0..topic_count {
            self.read_message_definition_record()?;
        }
        for _ in 0..chunk_count {
            self.read_chunk_info_record()?;
        }
        for i in 0..self.chunk_infos.len() {
            let pos = self.chunk_infos[i].pos;
            let topics = self.chunk_infos[i].topic_counts.len();
            self.file.seek(SeekFrom::Start(pos))?;
            let chunk_header = self.read_chunk_header()?;
            self.file
                .seek(SeekFrom::Current(chunk_header.compressed_size as i64))?;
            for _ in 0..topics {
                self.read_index_record(pos)?;
            }
        }
        self.sort_topic_indexes();
        Ok(())
    }

    /// Legacy 1.2 layout: no chunks; the index region holds raw topic
    /// index records whose entries point at absolute record positions,
    /// and each topic's definition sits at its first recorded position.
    fn start_reading_102(&mut self) -> Result<()> {
        self.read_file_header_record()?;
        let file_len = self.file.len()?;
        self.file.seek(SeekFrom::Start(self.index_data_pos))?;
        while self.file.offset() < file_len {
            self.read_index_record(0)?;
        }

        let first_positions: Vec<(String, u64)> = self
            .topic_indexes
            .iter()
            .filter_map(|(topic, index)| index.first().map(|e| (topic.clone(), e.chunk_pos)))
            .collect();
        for (topic, pos) in first_positions {
            debug!("reading message definition for {topic} at {pos}");
            self.file.seek(SeekFrom::Start(pos))?;
            self.read_message_definition_record()?;
        }
        self.sort_topic_indexes();
        Ok(())
    }

    /// The merge reader binary-searches per-topic indexes, so entries
    /// must be time-sorted once loading is done; the file itself does
    /// not guarantee per-topic monotonicity.
    fn sort_topic_indexes(&mut self) {
        for entries in self.topic_indexes.values_mut() {
            entries.sort_by_key(|e| e.time);
        }
    }

    fn read_file_header_record(&mut self) -> Result<(u32, u32)> {
        let (fields, data_len) = record::read_header(&mut self.file)?;
        record::expect_op(&fields, OP_FILE_HEADER)?;
        self.index_data_pos = fields.get_u64(FIELD_INDEX_POS)?;
        let (topic_count, chunk_count) = if self.version >= 103 {
            (
                fields.get_u32(FIELD_CONN_COUNT)?,
                fields.get_u32(FIELD_CHUNK_COUNT)?,
            )
        } else {
            (0, 0)
        };
        debug!(
            "read FILE_HEADER: index_pos={} topic_count={topic_count} chunk_count={chunk_count}",
            self.index_data_pos
        );
        // The data section is padding.
        self.file.seek(SeekFrom::Current(data_len as i64))?;
        Ok((topic_count, chunk_count))
    }

    fn read_chunk_header(&mut self) -> Result<ChunkHeader> {
        let (fields, data_len) = record::read_header(&mut self.file)?;
        record::expect_op(&fields, OP_CHUNK)?;
        let compression = Compression::from_bytes(fields.get_bytes(FIELD_COMPRESSION)?)?;
        let uncompressed_size = fields.get_u32(FIELD_SIZE)?;
        Ok(ChunkHeader {
            compression,
            compressed_size: data_len,
            uncompressed_size,
        })
    }

    fn read_index_record(&mut self, chunk_pos: u64) -> Result<()> {
        let (fields, data_len) = record::read_header(&mut self.file)?;
        record::expect_op(&fields, OP_INDEX_DATA)?;
        let version = fields.get_u32(FIELD_VER)?;
        let topic = fields.get_str(FIELD_TOPIC)?.to_string();
        let count = fields.get_u32(FIELD_COUNT)?;
        let mut data = vec![0u8; data_len as usize];
        self.file.read_exact(&mut data)?;
        let entries = match version {
            0 => record::decode_index_entries_v0(&data, count)?,
            1 => record::decode_index_entries_v1(&data, count, chunk_pos)?,
            _ => return Err(Error::Format("unknown index data version")),
        };
        debug!("read INDEX_DATA: ver={version} topic={topic} count={count}");
        self.topic_indexes.entry(topic).or_default().extend(entries);
        Ok(())
    }

    fn read_message_definition_record(&mut self) -> Result<()> {
        let (fields, data_len) = record::read_header(&mut self.file)?;
        record::expect_op(&fields, OP_MSG_DEF)?;
        let topic = fields.get_str(FIELD_TOPIC)?.to_string();
        let md5sum = fields.get_str_bounded(FIELD_MD5, 32, 32)?.to_string();
        let datatype = fields.get_str(FIELD_TYPE)?.to_string();
        let msg_def = fields.get_str_bounded(FIELD_DEF, 0, usize::MAX)?.to_string();
        if data_len > 0 {
            self.file.seek(SeekFrom::Current(data_len as i64))?;
        }
        if !self.topic_infos.contains_key(&topic) {
            debug!("read MSG_DEF: topic={topic} type={datatype}");
            self.topic_indexes.entry(topic.clone()).or_default();
            self.topic_infos.insert(
                topic.clone(),
                Arc::new(TopicInfo {
                    topic,
                    datatype,
                    md5sum,
                    msg_def,
                }),
            );
        }
        Ok(())
    }

    fn read_chunk_info_record(&mut self) -> Result<()> {
        let (fields, data_len) = record::read_header(&mut self.file)?;
        record::expect_op(&fields, OP_CHUNK_INFO)?;
        let version = fields.get_u32(FIELD_VER)?;
        if version != CHUNK_INFO_VERSION {
            return Err(Error::Format("unsupported chunk info version"));
        }
        let pos = fields.get_u64(FIELD_CHUNK_POS)?;
        let start_time = fields.get_time(FIELD_START_TIME)?;
        let end_time = fields.get_time(FIELD_END_TIME)?;
        let topic_count = fields.get_u32(FIELD_COUNT)?;
        let mut data = vec![0u8; data_len as usize];
        self.file.read_exact(&mut data)?;
        let topic_counts = record::decode_topic_counts(&data, topic_count)?;
        debug!(
            "read CHUNK_INFO: pos={pos} start={start_time} end={end_time} topics={topic_count}"
        );
        self.chunk_infos.push(ChunkInfo {
            pos,
            start_time,
            end_time,
            topic_counts,
        });
        Ok(())
    }

    // Recovery of an unindexed file (append after an unclean close)

    fn recover_unindexed(&mut self) -> Result<()> {
        warn!(
            "bag {} has no index (unclean close); scanning chunks to rebuild it",
            self.file.path().display()
        );
        let file_len = self.file.len()?;
        let mut resume_pos = self.file.offset();

        loop {
            let chunk_pos = self.file.offset();
            if chunk_pos >= file_len {
                break;
            }
            let chunk_header = match self.read_chunk_header() {
                Ok(header) => header,
                Err(_) => break,
            };
            if chunk_header.compressed_size == 0 {
                // Placeholder sizes: the writer died inside this chunk.
                break;
            }
            let mut compressed = vec![0u8; chunk_header.compressed_size as usize];
            if self.file.read_exact(&mut compressed).is_err() {
                break;
            }
            let mut payload = vec![0u8; chunk_header.uncompressed_size as usize];
            if decompress(chunk_header.compression, &mut payload, &compressed).is_err() {
                break;
            }
            let scan = match scan_chunk_records(&payload, chunk_pos) {
                Ok(scan) => scan,
                Err(_) => break,
            };
            let end_of_payload = self.file.offset();

            // The trailing index records may be missing or torn if the
            // writer died right after sealing the chunk; rewrite them
            // from the scan in that case.
            let expected = scan.entries.len();
            let mut found = 0usize;
            while found < expected && self.skip_index_record(file_len)? {
                found += 1;
            }
            if found < expected {
                self.file.truncate(end_of_payload)?;
                self.file.seek(SeekFrom::Start(end_of_payload))?;
                self.write_index_records(&scan.entries)?;
            }

            let mut topic_counts = BTreeMap::new();
            for (topic, entries) in &scan.entries {
                topic_counts.insert(topic.clone(), entries.len() as u32);
            }
            self.chunk_infos.push(ChunkInfo {
                pos: chunk_pos,
                start_time: scan.start_time,
                end_time: scan.end_time,
                topic_counts,
            });
            for def in scan.defs {
                if !self.topic_infos.contains_key(&def.topic) {
                    self.topic_indexes.entry(def.topic.clone()).or_default();
                    self.topic_infos.insert(def.topic.clone(), Arc::new(def));
                }
            }
            for (topic, entries) in scan.entries {
                self.topic_indexes.entry(topic).or_default().extend(entries);
            }
            resume_pos = self.file.offset();
        }

        self.file.truncate(resume_pos)?;
        self.file.seek(SeekFrom::Start(resume_pos))?;
        self.sort_topic_indexes();
        debug!(
            "recovered {} chunks across {} topics",
            self.chunk_infos.len(),
            self.topic_infos.len()
        );
        Ok(())
    }

    /// Consumes one index-data record if one starts at the cursor;
    /// rewinds and reports `false` otherwise.
    fn skip_index_record(&mut self, file_len: u64) -> Result<bool> {
        let pos = self.file.offset();
        if pos >= file_len {
            return Ok(false);
        }
        let intact = (|| -> Result<bool> {
            let (fields, data_len) = record::read_header(&mut self.file)?;
            if fields.get_u8(FIELD_OP)? != OP_INDEX_DATA {
                return Ok(false);
            }
            self.file.seek(SeekFrom::Current(data_len as i64))?;
            Ok(self.file.offset() <= file_len)
        })()
        .unwrap_or(false);
        if !intact {
            self.file.seek(SeekFrom::Start(pos))?;
        }
        Ok(intact)
    }

    // Random-access fetch

    /// Materializes the payload bytes of one recorded message.
    ///
    /// Decompresses the containing chunk into the single-chunk cache if
    /// it is not already there; uncompressed chunks are read straight
    /// from the file. The bytes are copied out, so the returned vector
    /// stays valid across later fetches.
    pub fn read_message(&mut self, info: &MessageInfo) -> Result<Vec<u8>> {
        if self.version == 102 {
            self.file.seek(SeekFrom::Start(info.entry.chunk_pos))?;
            return self.read_message_data_from_file(&info.topic_info.topic);
        }
        self.read_message_indexed(&info.topic_info.topic, info.entry.chunk_pos, info.entry.offset)
    }

    fn read_message_indexed(
        &mut self,
        topic: &str,
        chunk_pos: u64,
        offset: u32,
    ) -> Result<Vec<u8>> {
        if self.decompressed_chunk != Some(chunk_pos) {
            self.file.seek(SeekFrom::Start(chunk_pos))?;
            let chunk_header = self.read_chunk_header()?;
            match chunk_header.compression {
                Compression::None => {
                    self.file.seek(SeekFrom::Current(offset as i64))?;
                    return self.read_message_data_from_file(topic);
                }
                kind => {
                    let mut compressed = vec![0u8; chunk_header.compressed_size as usize];
                    self.file.read_exact(&mut compressed)?;
                    self.decompressed_chunk = None;
                    self.decompress_buffer.clear();
                    self.decompress_buffer
                        .resize(chunk_header.uncompressed_size as usize, 0);
                    decompress(kind, &mut self.decompress_buffer, &compressed)?;
                    self.decompressed_chunk = Some(chunk_pos);
                }
            }
        }
        self.read_message_data_from_buffer(topic, offset as usize)
    }

    /// Reads forward from the cursor, skipping definition records, until
    /// the message-data record is found.
    fn read_message_data_from_file(&mut self, topic: &str) -> Result<Vec<u8>> {
        loop {
            let (fields, data_len) = record::read_header(&mut self.file)?;
            match fields.get_u8(FIELD_OP)? {
                OP_MSG_DEF => {
                    if data_len > 0 {
                        self.file.seek(SeekFrom::Current(data_len as i64))?;
                    }
                }
                OP_MSG_DATA => {
                    if fields.get_str(FIELD_TOPIC)? != topic {
                        return Err(Error::Format("index entry points at another topic"));
                    }
                    let mut data = vec![0u8; data_len as usize];
                    self.file.read_exact(&mut data)?;
                    return Ok(data);
                }
                other => return Err(Error::UnexpectedOp(other)),
            }
        }
    }

    fn read_message_data_from_buffer(&self, topic: &str, mut offset: usize) -> Result<Vec<u8>> {
        loop {
            let (fields, data_len, consumed) =
                header::parse_record(&self.decompress_buffer, offset)?;
            offset += consumed;
            match fields.get_u8(FIELD_OP)? {
                OP_MSG_DEF => offset += data_len as usize,
                OP_MSG_DATA => {
                    if fields.get_str(FIELD_TOPIC)? != topic {
                        return Err(Error::Format("index entry points at another topic"));
                    }
                    let data = self
                        .decompress_buffer
                        .get(offset..offset + data_len as usize)
                        .ok_or(Error::Format("message data overruns chunk"))?;
                    return Ok(data.to_vec());
                }
                other => return Err(Error::UnexpectedOp(other)),
            }
        }
    }

    // Queries

    /// All messages in `[start, end]`, grouped by topic in lexical
    /// order. Not globally time-sorted; use
    /// [`Bag::get_messages_by_topic`] for that.
    pub fn get_messages(&self, start: Time, end: Time) -> Vec<MessageInfo> {
        let mut messages = Vec::new();
        for (topic, info) in &self.topic_infos {
            let index = match self.topic_indexes.get(topic) {
                Some(index) => index,
                None => continue,
            };
            for entry in index {
                if entry.time >= start && entry.time <= end {
                    messages.push(MessageInfo {
                        topic_info: info.clone(),
                        entry: *entry,
                    });
                }
            }
        }
        messages
    }

    /// Messages on the given topics in `[start, end]`, merged into one
    /// globally non-decreasing time order. Topics without recorded
    /// messages are skipped. Equal timestamps follow the order of
    /// `topics`.
    pub fn get_messages_by_topic(
        &self,
        topics: &[&str],
        start: Time,
        end: Time,
    ) -> Vec<MessageInfo> {
        merge_topics(&self.topic_infos, &self.topic_indexes, topics, start, end)
    }

    // Disk space gate

    fn check_logging(&mut self) -> bool {
        if self.writing_enabled {
            return true;
        }
        let now = self.clock.now_secs();
        if now >= self.warn_next {
            self.warn_next = now + DROP_WARN_INTERVAL_SECS;
            warn!("dropped message: writing disabled, most likely the disk is full");
        }
        false
    }

    fn scheduled_check_disk(&mut self) {
        let now = self.clock.now_secs();
        if now < self.check_disk_next {
            return;
        }
        self.check_disk_next += DISK_CHECK_INTERVAL_SECS;
        self.check_disk();
    }

    fn check_disk(&mut self) {
        let path = self.file.path();
        let free = match self.disk.free_bytes(path) {
            Ok(free) => free,
            Err(err) => {
                warn!("failed to check free space for {}: {err}", path.display());
                return;
            }
        };
        if free < DISABLE_FREE_BYTES {
            error!(
                "less than 1 GiB free on the disk holding {}; disabling writing",
                path.display()
            );
            self.writing_enabled = false;
        } else {
            if free < WARN_FREE_BYTES {
                warn!("less than 5 GiB free on the disk holding {}", path.display());
            }
            self.writing_enabled = true;
        }
    }
}

impl Drop for Bag {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct ChunkScan {
    defs: Vec<TopicInfo>,
    entries: BTreeMap<String, Vec<IndexEntry>>,
    start_time: Time,
    end_time: Time,
}

/// Walks every record in a decompressed chunk payload, collecting topic
/// definitions and rebuilding the index entries the chunk would have
/// been followed by.
fn scan_chunk_records(payload: &[u8], chunk_pos: u64) -> Result<ChunkScan> {
    let mut scan = ChunkScan {
        defs: Vec::new(),
        entries: BTreeMap::new(),
        start_time: Time::MAX,
        end_time: Time::ZERO,
    };
    let mut offset = 0usize;
    while offset < payload.len() {
        let (fields, data_len, consumed) = header::parse_record(payload, offset)?;
        let data_start = offset + consumed;
        let data_end = data_start + data_len as usize;
        if data_end > payload.len() {
            return Err(Error::Format("record data overruns chunk"));
        }
        match fields.get_u8(FIELD_OP)? {
            OP_MSG_DEF => scan.defs.push(TopicInfo {
                topic: fields.get_str(FIELD_TOPIC)?.to_string(),
                datatype: fields.get_str(FIELD_TYPE)?.to_string(),
                md5sum: fields.get_str_bounded(FIELD_MD5, 32, 32)?.to_string(),
                msg_def: fields.get_str_bounded(FIELD_DEF, 0, usize::MAX)?.to_string(),
            }),
            OP_MSG_DATA => {
                let topic = fields.get_str(FIELD_TOPIC)?.to_string();
                let time = fields.get_time(FIELD_TIME)?;
                scan.start_time = scan.start_time.min(time);
                scan.end_time = scan.end_time.max(time);
                scan.entries.entry(topic).or_default().push(IndexEntry {
                    time,
                    chunk_pos,
                    offset: offset as u32,
                });
            }
            other => return Err(Error::UnexpectedOp(other)),
        }
        offset = data_end;
    }
    if scan.entries.is_empty() {
        return Err(Error::Format("chunk contains no messages"));
    }
    Ok(scan)
}
