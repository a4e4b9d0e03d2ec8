// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::basics::{common_prefix_length, put_u24};
use crate::block::BlockWriter;
use crate::config::WriteOptions;
use crate::record::{
    BlockType, IndexRecord, LogRecord, LogValue, ObjRecord, Record, RefRecord, RefValue,
    UpdateIndex,
};
use crate::{Error, Result};
use byteorder::{BigEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Write;

pub(crate) const MAGIC: &[u8; 4] = b"REFT";

/// The block length field is 24 bits wide.
pub(crate) const MAX_BLOCK_SIZE: u32 = 1 << 24;

/// The object id length field is 5 bits wide.
const MAX_OBJ_ID_LEN: usize = 31;
const MIN_OBJ_ID_LEN: usize = 2;

pub(crate) fn header_size(version: u8) -> usize {
    match version {
        1 => 24,
        _ => 28,
    }
}

pub(crate) fn footer_size(version: u8) -> usize {
    header_size(version) + 5 * 8 + 4
}

/// Statistics for a single block type.
#[derive(Copy, Clone, Debug, Default)]
pub struct BlockStats {
    /// Total number of entries written
    pub entries: usize,

    /// Total number of key restarts
    pub restarts: usize,

    /// Total number of blocks
    pub blocks: usize,

    /// Total number of index blocks
    pub index_blocks: usize,

    /// Depth of the index
    pub max_index_level: usize,

    /// Offset of the first block of this type
    pub offset: u64,

    /// Offset of the top level index block, or 0 if not present
    pub index_offset: u64,
}

/// Overall statistics for a single written table.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Total number of blocks written
    pub blocks: usize,

    /// Stats for ref data
    pub ref_stats: BlockStats,

    /// Stats for the object id → ref mapping
    pub obj_stats: BlockStats,

    /// Stats for index blocks
    pub idx_stats: BlockStats,

    /// Stats for log data
    pub log_stats: BlockStats,

    /// Disambiguation length of shortened object ids
    pub object_id_len: usize,
}

/// Streams records into blocks, indices and a footer, producing one table.
///
/// Refs must be added in ascending name order, then logs in ascending
/// `(refname, descending update_index)` order. All update indices must lie
/// within the limits declared up front via [`Writer::set_limits`].
pub struct Writer<W: Write> {
    out: W,
    opts: WriteOptions,
    version: u8,

    min_update_index: UpdateIndex,
    max_update_index: UpdateIndex,

    /// Offset at which the next flushed block will land
    next: u64,
    pending_padding: u64,

    block: Option<BlockWriter>,
    index: Vec<IndexRecord>,
    last_key: Vec<u8>,
    key_scratch: Vec<u8>,

    /// Full object id → ascending ref block offsets
    obj_index: BTreeMap<Vec<u8>, Vec<u64>>,

    log_started: bool,
    finished: bool,

    stats: Stats,
}

impl<W: Write> Writer<W> {
    /// Creates a writer streaming to `out`.
    pub fn new(out: W, opts: &WriteOptions) -> Result<Self> {
        if opts.block_size == 0 || opts.block_size >= MAX_BLOCK_SIZE {
            return Err(Error::Api("block size must be in (0, 2^24)"));
        }

        let version = opts.hash_id.format_version();
        if opts.block_size as usize <= header_size(version) + 4 {
            return Err(Error::Api("block size too small for the table header"));
        }

        Ok(Self {
            out,
            opts: opts.clone(),
            version,
            min_update_index: 0,
            max_update_index: 0,
            next: 0,
            pending_padding: 0,
            block: None,
            index: Vec::new(),
            last_key: Vec::new(),
            key_scratch: Vec::new(),
            obj_index: BTreeMap::new(),
            log_started: false,
            finished: false,
            stats: Stats::default(),
        })
    }

    /// Declares the range of update indices for the records to come.
    ///
    /// When writing into a stack, `min` must be at least the stack's next
    /// update index.
    pub fn set_limits(&mut self, min: UpdateIndex, max: UpdateIndex) -> Result<()> {
        if self.finished || self.next > 0 || self.block.is_some() {
            return Err(Error::Api("limits must be set before adding records"));
        }
        if min > max {
            return Err(Error::Api("min update index exceeds max"));
        }

        self.min_update_index = min;
        self.max_update_index = max;
        Ok(())
    }

    /// Smallest update index declared via [`Writer::set_limits`].
    #[must_use]
    pub fn min_update_index(&self) -> UpdateIndex {
        self.min_update_index
    }

    /// Largest update index declared via [`Writer::set_limits`].
    #[must_use]
    pub fn max_update_index(&self) -> UpdateIndex {
        self.max_update_index
    }

    /// Statistics of the table written so far; complete after
    /// [`Writer::finish`].
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Adds a ref record. Must be called in ascending refname order.
    pub fn add_ref(&mut self, rec: &RefRecord) -> Result<()> {
        if self.finished {
            return Err(Error::Api("writer is already finished"));
        }
        if self.log_started {
            return Err(Error::Api("cannot add ref records after log records"));
        }
        if rec.refname.is_empty() {
            return Err(Error::Api("empty refname"));
        }
        if rec.refname.as_bytes().contains(&0) {
            return Err(Error::RefName("refname contains NUL byte"));
        }
        if rec.update_index < self.min_update_index || rec.update_index > self.max_update_index {
            return Err(Error::Api("ref update index outside table limits"));
        }

        // stored relative to the table's minimum
        let mut copy = rec.clone();
        copy.update_index -= self.min_update_index;
        self.add_record(Record::Ref(copy))?;

        if !self.opts.skip_index_objects {
            match &rec.value {
                RefValue::Val1(value) => self.index_hash(value.clone()),
                RefValue::Val2 {
                    value,
                    target_value,
                } => {
                    self.index_hash(value.clone());
                    self.index_hash(target_value.clone());
                }
                RefValue::Deletion | RefValue::Symref(_) => {}
            }
        }

        Ok(())
    }

    /// Convenience function to add multiple refs; sorts them by name first.
    pub fn add_refs(&mut self, refs: &mut [RefRecord]) -> Result<()> {
        refs.sort_by(|a, b| a.refname.cmp(&b.refname));
        for rec in refs.iter() {
            self.add_ref(rec)?;
        }
        Ok(())
    }

    /// Adds a log record. Log keys are `(refname, descending update_index)`
    /// and must be added in ascending key order.
    pub fn add_log(&mut self, rec: &LogRecord) -> Result<()> {
        if self.finished {
            return Err(Error::Api("writer is already finished"));
        }
        if rec.refname.is_empty() {
            return Err(Error::Api("empty refname"));
        }
        if rec.refname.as_bytes().contains(&0) {
            return Err(Error::RefName("refname contains NUL byte"));
        }
        if rec.update_index < self.min_update_index || rec.update_index > self.max_update_index {
            return Err(Error::Api("log update index outside table limits"));
        }

        let mut copy = rec.clone();
        if let LogValue::Update(update) = &mut copy.value {
            if !self.opts.exact_log_message {
                if let Some(pos) = update.message.find('\n') {
                    if pos + 1 != update.message.len() {
                        return Err(Error::Api("multi-line log message"));
                    }
                }
                if !update.message.ends_with('\n') {
                    update.message.push('\n');
                }
            }
        }

        if !self.log_started {
            if self.block.is_some() {
                self.finish_public_section(BlockType::Ref)?;
            }
            self.log_started = true;
        }

        self.add_record(Record::Log(copy))
    }

    /// Convenience function to add multiple logs; sorts them by key first.
    pub fn add_logs(&mut self, logs: &mut [LogRecord]) -> Result<()> {
        logs.sort_by(|a, b| {
            a.refname
                .cmp(&b.refname)
                .then(b.update_index.cmp(&a.update_index))
        });
        for rec in logs.iter() {
            self.add_log(rec)?;
        }
        Ok(())
    }

    /// Finalizes the table: remaining sections, object index, footer.
    ///
    /// Fails with [`Error::EmptyTable`] if no records were added; in that
    /// case nothing has been written to the sink.
    pub fn finish(&mut self) -> Result<Stats> {
        if self.finished {
            return Err(Error::Api("writer is already finished"));
        }

        if self.log_started {
            self.finish_public_section(BlockType::Log)?;
        } else if self.block.is_some() {
            self.finish_public_section(BlockType::Ref)?;
        }

        self.finished = true;

        if self.next == 0 {
            return Err(Error::EmptyTable);
        }

        let mut footer = Vec::with_capacity(footer_size(self.version));
        footer.resize(header_size(self.version), 0);
        self.fill_header(&mut footer);

        footer.write_u64::<BigEndian>(self.stats.ref_stats.index_offset)?;
        footer.write_u64::<BigEndian>(
            (self.stats.obj_stats.offset << 5) | self.stats.object_id_len as u64,
        )?;
        footer.write_u64::<BigEndian>(self.stats.obj_stats.index_offset)?;
        footer.write_u64::<BigEndian>(self.stats.log_stats.offset)?;
        footer.write_u64::<BigEndian>(self.stats.log_stats.index_offset)?;

        let crc = crc32fast::hash(&footer);
        footer.write_u32::<BigEndian>(crc)?;

        // trailing padding of the last block is dropped
        self.out.write_all(&footer)?;
        self.out.flush()?;

        Ok(self.stats.clone())
    }

    /// Consumes the writer, returning the sink.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn fill_header(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(MAGIC);
        buf[4] = self.version;
        put_u24(&mut buf[5..], self.opts.block_size);

        let mut pos = 8;
        if self.version == 2 {
            buf[8..12].copy_from_slice(&self.opts.hash_id.tag());
            pos = 12;
        }

        buf[pos..pos + 8].copy_from_slice(&self.min_update_index.to_be_bytes());
        buf[pos + 8..pos + 16].copy_from_slice(&self.max_update_index.to_be_bytes());
    }

    /// Offset at which the current in-progress block will land.
    fn current_block_offset(&self) -> u64 {
        self.next + self.pending_padding
    }

    fn index_hash(&mut self, hash: Vec<u8>) {
        let offset = self.current_block_offset();

        let offsets = self.obj_index.entry(hash).or_default();
        if offsets.last() != Some(&offset) {
            offsets.push(offset);
        }
    }

    fn new_block_writer(&self, typ: BlockType) -> BlockWriter {
        let header_off = if self.next == 0 {
            header_size(self.version)
        } else {
            0
        };

        BlockWriter::new(
            typ,
            self.opts.block_size as usize,
            header_off,
            self.opts.hash_id.size(),
            usize::from(self.opts.restart_interval),
        )
    }

    /// Adds an already keyed/ordered record, enforcing strict key order.
    fn add_record(&mut self, rec: Record) -> Result<()> {
        rec.key(&mut self.key_scratch);
        if !self.last_key.is_empty() && self.key_scratch <= self.last_key {
            return Err(Error::Api("records must be added in ascending key order"));
        }
        std::mem::swap(&mut self.last_key, &mut self.key_scratch);

        self.push_block_record(&rec)
    }

    /// Appends a record to the current block, flushing and retrying on
    /// overflow.
    fn push_block_record(&mut self, rec: &Record) -> Result<()> {
        let typ = rec.block_type();

        if self.block.is_none() {
            self.block = Some(self.new_block_writer(typ));
        }

        if let Some(block) = &mut self.block {
            debug_assert_eq!(typ, block.block_type());
            if block.add(rec)? {
                return Ok(());
            }
        }

        self.flush_block()?;
        self.block = Some(self.new_block_writer(typ));

        if let Some(block) = &mut self.block {
            if block.add(rec)? {
                return Ok(());
            }
        }

        Err(Error::EntryTooBig)
    }

    /// Finishes and writes the current block, registering it in the index
    /// list of the section being written.
    fn flush_block(&mut self) -> Result<()> {
        let Some(mut block) = self.block.take() else {
            return Ok(());
        };
        if block.is_empty() {
            return Ok(());
        }

        let typ = block.block_type();

        if block.header_off() > 0 {
            let mut header = vec![0; block.header_off()];
            self.fill_header(&mut header);
            block.header_bytes_mut().copy_from_slice(&header);
        }

        let raw_len = block.finish()? as u64;

        if self.pending_padding > 0 {
            let padding = vec![0; self.pending_padding as usize];
            self.out.write_all(&padding)?;
            self.next += self.pending_padding;
            self.pending_padding = 0;
        }

        let offset = self.next;
        self.index.push(IndexRecord {
            last_key: block.last_key().to_vec(),
            offset,
        });

        self.out.write_all(block.bytes())?;
        self.next += raw_len;

        if !self.opts.unpadded && typ != BlockType::Log {
            self.pending_padding = u64::from(self.opts.block_size) - raw_len;
        }

        self.stats.blocks += 1;
        let stats = Self::block_stats_mut(&mut self.stats, typ);
        if stats.blocks == 0 {
            stats.offset = offset;
        }
        stats.entries += block.entries();
        stats.restarts += block.restart_count();
        stats.blocks += 1;

        Ok(())
    }

    fn block_stats_mut(stats: &mut Stats, typ: BlockType) -> &mut BlockStats {
        match typ {
            BlockType::Ref => &mut stats.ref_stats,
            BlockType::Obj => &mut stats.obj_stats,
            BlockType::Index => &mut stats.idx_stats,
            BlockType::Log => &mut stats.log_stats,
        }
    }

    /// Flushes the section's trailing block and builds its index pyramid:
    /// index blocks, then index-of-index blocks, until one root remains.
    fn finish_section(&mut self, typ: BlockType) -> Result<()> {
        self.flush_block()?;

        let mut index_start = 0;
        let mut max_level = 0;
        let index_blocks_before = self.stats.idx_stats.blocks;

        while self.index.len() > 1 {
            max_level += 1;
            index_start = self.current_block_offset();

            let entries = std::mem::take(&mut self.index);
            for entry in entries {
                // flushed index blocks feed the next level through
                // self.index
                self.push_block_record(&Record::Index(entry))?;
            }

            self.flush_block()?;
        }
        self.index.clear();

        let index_blocks = self.stats.idx_stats.blocks - index_blocks_before;
        let stats = Self::block_stats_mut(&mut self.stats, typ);
        stats.index_blocks = index_blocks;
        stats.index_offset = index_start;
        stats.max_index_level = max_level;

        // the next section may start with any key
        self.last_key.clear();

        Ok(())
    }

    fn finish_public_section(&mut self, typ: BlockType) -> Result<()> {
        match typ {
            BlockType::Ref => {
                self.finish_section(BlockType::Ref)?;
                if !self.opts.skip_index_objects && !self.obj_index.is_empty() {
                    self.write_obj_section()?;
                }
            }
            BlockType::Log => self.finish_section(BlockType::Log)?,
            BlockType::Obj | BlockType::Index => {
                debug_assert!(false, "not a public section");
            }
        }
        Ok(())
    }

    /// Emits one obj record per distinct (shortened) object id.
    fn write_obj_section(&mut self) -> Result<()> {
        // grow the prefix until adjacent hashes differ within it
        let mut common = 0;
        let mut prev: Option<&[u8]> = None;
        for hash in self.obj_index.keys() {
            if let Some(prev) = prev {
                common = common.max(common_prefix_length(prev, hash));
            }
            prev = Some(hash);
        }

        let hash_size = self.opts.hash_id.size();
        let object_id_len = (common + 1)
            .clamp(MIN_OBJ_ID_LEN, MAX_OBJ_ID_LEN)
            .min(hash_size);
        self.stats.object_id_len = object_id_len;

        let obj_index = std::mem::take(&mut self.obj_index);
        for (hash, offsets) in obj_index {
            let rec = ObjRecord {
                hash_prefix: hash[..object_id_len].to_vec(),
                offsets,
            };

            match self.push_block_record(&Record::Obj(rec.clone())) {
                Ok(()) => {}
                Err(Error::EntryTooBig) => {
                    // too many refs for one block; write the prefix without
                    // positions, readers fall back to scanning
                    self.push_block_record(&Record::Obj(ObjRecord {
                        hash_prefix: rec.hash_prefix,
                        offsets: Vec::new(),
                    }))?;
                }
                Err(e) => return Err(e),
            }
        }

        self.finish_section(BlockType::Obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn val1(name: &str, update_index: u64, byte: u8) -> RefRecord {
        RefRecord {
            refname: name.into(),
            update_index,
            value: RefValue::Val1(vec![byte; 20]),
        }
    }

    #[test]
    fn empty_table() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;

        assert!(matches!(writer.finish(), Err(Error::EmptyTable)));
        assert!(out.is_empty(), "no bytes may be left behind");

        Ok(())
    }

    #[test]
    fn single_record_single_block() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;
        writer.add_ref(&val1("refs/heads/main", 1, 0x42))?;

        let stats = writer.finish()?;
        assert_eq!(1, stats.ref_stats.blocks);
        assert_eq!(0, stats.ref_stats.index_blocks);
        assert_eq!(0, stats.ref_stats.index_offset);
        assert_eq!(1, stats.ref_stats.entries);

        // header + first (unpadded trailing) block + obj section + footer
        assert_eq!(&out[..4], MAGIC);
        assert_eq!(1, out[4]);

        Ok(())
    }

    #[test]
    fn rejects_unsorted_refs() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;

        writer.add_ref(&val1("refs/heads/b", 1, 1))?;
        assert!(matches!(
            writer.add_ref(&val1("refs/heads/a", 1, 2)),
            Err(Error::Api(_))
        ));

        // equal keys are rejected, too
        assert!(matches!(
            writer.add_ref(&val1("refs/heads/b", 1, 3)),
            Err(Error::Api(_))
        ));

        Ok(())
    }

    #[test]
    fn rejects_update_index_outside_limits() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(5, 10)?;

        assert!(matches!(
            writer.add_ref(&val1("refs/heads/a", 4, 1)),
            Err(Error::Api(_))
        ));
        assert!(matches!(
            writer.add_ref(&val1("refs/heads/a", 11, 1)),
            Err(Error::Api(_))
        ));
        writer.add_ref(&val1("refs/heads/a", 5, 1))?;

        Ok(())
    }

    #[test]
    fn rejects_bad_refnames() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;

        assert!(matches!(
            writer.add_ref(&val1("", 1, 1)),
            Err(Error::Api(_))
        ));
        assert!(matches!(
            writer.add_ref(&val1("refs/heads/\0evil", 1, 1)),
            Err(Error::RefName(_))
        ));

        Ok(())
    }

    #[test]
    fn rejects_multiline_log_message() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;

        let mut log = LogRecord {
            refname: "refs/heads/main".into(),
            update_index: 1,
            value: LogValue::Update(crate::record::LogUpdate {
                old_hash: vec![0; 20],
                new_hash: vec![1; 20],
                name: "Jane".into(),
                email: "jane@invalid".into(),
                time: 1_000,
                tz_offset: 0,
                message: "one\ntwo\n".into(),
            }),
        };

        assert!(matches!(writer.add_log(&log), Err(Error::Api(_))));

        // single line passes, trailing newline is appended
        if let LogValue::Update(update) = &mut log.value {
            update.message = "one".into();
        }
        writer.add_log(&log)?;

        Ok(())
    }

    #[test]
    fn rejects_ref_after_log() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;

        writer.add_log(&LogRecord {
            refname: "refs/heads/main".into(),
            update_index: 1,
            value: LogValue::Deletion,
        })?;

        assert!(matches!(
            writer.add_ref(&val1("refs/heads/main", 1, 1)),
            Err(Error::Api(_))
        ));

        Ok(())
    }

    #[test]
    fn entry_too_big() -> crate::Result<()> {
        let opts = WriteOptions {
            block_size: 64,
            ..Default::default()
        };

        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &opts)?;
        writer.set_limits(1, 1)?;

        let rec = RefRecord {
            refname: "refs/heads/much-too-long-for-such-a-small-block".into(),
            update_index: 1,
            value: RefValue::Symref("refs/heads/equally-long-target-name".into()),
        };
        assert!(matches!(writer.add_ref(&rec), Err(Error::EntryTooBig)));

        Ok(())
    }

    #[test]
    fn multi_block_table_gets_an_index() -> crate::Result<()> {
        let opts = WriteOptions {
            block_size: 256,
            ..Default::default()
        };

        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &opts)?;
        writer.set_limits(1, 1)?;

        for i in 0..64 {
            writer.add_ref(&val1(&format!("refs/heads/branch{i:04}"), 1, i as u8))?;
        }

        let stats = writer.finish()?;
        assert!(stats.ref_stats.blocks > 1);
        assert!(stats.ref_stats.index_blocks > 0);
        assert!(stats.ref_stats.index_offset > 0);
        assert!(stats.ref_stats.max_index_level >= 1);
        assert_eq!(64, stats.ref_stats.entries);

        // every distinct hash got an obj record
        assert!(stats.obj_stats.entries > 0);
        assert_eq!(2, stats.object_id_len);

        Ok(())
    }

    #[test]
    fn skip_index_objects_writes_no_obj_section() -> crate::Result<()> {
        let opts = WriteOptions {
            block_size: 256,
            skip_index_objects: true,
            ..Default::default()
        };

        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &opts)?;
        writer.set_limits(1, 1)?;

        for i in 0..64 {
            writer.add_ref(&val1(&format!("refs/heads/branch{i:04}"), 1, i as u8))?;
        }

        let stats = writer.finish()?;
        assert_eq!(0, stats.obj_stats.blocks);
        assert_eq!(0, stats.object_id_len);

        Ok(())
    }

    #[test]
    fn finished_writer_rejects_use() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 1)?;
        writer.add_ref(&val1("refs/heads/main", 1, 1))?;
        writer.finish()?;

        assert!(matches!(
            writer.add_ref(&val1("refs/heads/other", 1, 1)),
            Err(Error::Api(_))
        ));
        assert!(matches!(writer.finish(), Err(Error::Api(_))));

        Ok(())
    }

    #[test]
    fn sorts_bulk_added_records() -> crate::Result<()> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &WriteOptions::default())?;
        writer.set_limits(1, 3)?;

        let mut refs = vec![
            val1("refs/heads/c", 1, 1),
            val1("refs/heads/a", 2, 2),
            val1("refs/heads/b", 3, 3),
        ];
        writer.add_refs(&mut refs)?;

        let mut logs = vec![
            LogRecord {
                refname: "refs/heads/a".into(),
                update_index: 1,
                value: LogValue::Deletion,
            },
            LogRecord {
                refname: "refs/heads/a".into(),
                update_index: 2,
                value: LogValue::Deletion,
            },
        ];
        writer.add_logs(&mut logs)?;

        writer.finish()?;
        Ok(())
    }
}
