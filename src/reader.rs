// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::basics::u24_at;
use crate::block::{BlockIter, BlockReader};
use crate::blocksource::{BlockSource, FileSource};
use crate::config::HashId;
use crate::iter::{LogIterator, RefIterator};
use crate::record::{log_key, BlockType, Record, RefRecord, RefValue, UpdateIndex};
use crate::writer::{footer_size, header_size, MAGIC};
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Default)]
struct Section {
    present: bool,
    offset: u64,
    index_offset: u64,
}

struct ReaderInner {
    src: Box<dyn BlockSource>,
    name: String,

    version: u8,
    hash_id: HashId,
    block_size: u32,
    min_update_index: UpdateIndex,
    max_update_index: UpdateIndex,
    object_id_len: usize,

    refs: Section,
    objs: Section,
    logs: Section,

    /// File size excluding the footer; blocks never start past this
    size: u64,

    /// Full file size
    total_size: u64,
}

/// Handle to one open table.
///
/// Cheap to clone; iterators keep their own clone so they stay valid when the
/// stack reloads and drops the table from its current set.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<ReaderInner>,
}

impl Reader {
    /// Opens a table, validating magic, version and the footer checksum.
    pub fn new(src: Box<dyn BlockSource>, name: &str) -> Result<Self> {
        let total_size = src.size();

        let head = src.read_block(0, 28)?;
        if head.len() < 24 || &head[..4] != MAGIC {
            return Err(Error::Format("bad table magic"));
        }

        let version = head[4];
        if version != 1 && version != 2 {
            return Err(Error::Format("unsupported table version"));
        }

        let header_len = header_size(version);
        let footer_len = footer_size(version);
        if total_size < (header_len + footer_len) as u64 {
            return Err(Error::Format("table file too small"));
        }

        let block_size = u24_at(&head, 5)?;

        let (hash_id, index_pos) = if version == 2 {
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&head[8..12]);
            let hash_id = HashId::from_tag(tag).ok_or(Error::Format("unknown hash id"))?;
            (hash_id, 12)
        } else {
            (HashId::Sha1, 8)
        };

        let mut word = [0u8; 8];
        word.copy_from_slice(&head[index_pos..index_pos + 8]);
        let min_update_index = u64::from_be_bytes(word);
        word.copy_from_slice(&head[index_pos + 8..index_pos + 16]);
        let max_update_index = u64::from_be_bytes(word);

        let footer = src.read_block(total_size - footer_len as u64, footer_len as u32)?;
        if footer.len() < footer_len {
            return Err(Error::Format("truncated footer"));
        }

        let mut crc = [0u8; 4];
        crc.copy_from_slice(&footer[footer_len - 4..]);
        if crc32fast::hash(&footer[..footer_len - 4]) != u32::from_be_bytes(crc) {
            return Err(Error::Format("footer checksum mismatch"));
        }
        if footer[..header_len] != head[..header_len] {
            return Err(Error::Format("footer disagrees with header"));
        }

        let mut offsets = [0u64; 5];
        for (i, chunk) in footer[header_len..footer_len - 4].chunks_exact(8).enumerate() {
            word.copy_from_slice(chunk);
            offsets[i] = u64::from_be_bytes(word);
        }
        let [ref_index_off, obj_packed, obj_index_off, log_off, log_index_off] = offsets;

        let obj_off = obj_packed >> 5;
        let object_id_len = (obj_packed & 0x1F) as usize;

        // the first section starts right behind the header; only its block
        // type byte tells refs and logs-only tables apart
        let first_type = src.read_block(header_len as u64, 1)?;
        let refs_present = first_type.first() == Some(&BlockType::Ref.tag());
        let logs_first = first_type.first() == Some(&BlockType::Log.tag());

        let inner = ReaderInner {
            src,
            name: name.to_owned(),
            version,
            hash_id,
            block_size,
            min_update_index,
            max_update_index,
            object_id_len,
            refs: Section {
                present: refs_present,
                offset: 0,
                index_offset: ref_index_off,
            },
            objs: Section {
                present: obj_off > 0,
                offset: obj_off,
                index_offset: obj_index_off,
            },
            logs: Section {
                present: log_off > 0 || logs_first,
                offset: log_off,
                index_offset: log_index_off,
            },
            size: total_size - footer_len as u64,
            total_size,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Opens a table file from disk, named after its basename.
    pub fn open_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let src = FileSource::open(path)?;
        Self::new(Box::new(src), &name)
    }

    /// Basename this table is listed under in `tables.list`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Hash identity of all object ids in this table.
    #[must_use]
    pub fn hash_id(&self) -> HashId {
        self.inner.hash_id
    }

    /// Smallest update index covered by this table.
    #[must_use]
    pub fn min_update_index(&self) -> UpdateIndex {
        self.inner.min_update_index
    }

    /// Largest update index covered by this table.
    #[must_use]
    pub fn max_update_index(&self) -> UpdateIndex {
        self.inner.max_update_index
    }

    /// Size of the table file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.total_size
    }

    /// Returns an iterator positioned where `refname` would be inserted.
    ///
    /// Seeking to `""` positions before the first record.
    pub fn seek_ref(&self, refname: &str) -> Result<RefIterator> {
        let iter = self.seek(BlockType::Ref, refname.as_bytes())?;
        Ok(RefIterator::from_table(iter))
    }

    /// Iterates all ref records.
    pub fn ref_iter(&self) -> Result<RefIterator> {
        self.seek_ref("")
    }

    /// Seeks to the newest log entry for `refname`.
    pub fn seek_log(&self, refname: &str) -> Result<LogIterator> {
        self.seek_log_at(refname, u64::MAX)
    }

    /// Seeks to log entries for `refname` at or below `update_index`.
    pub fn seek_log_at(&self, refname: &str, update_index: UpdateIndex) -> Result<LogIterator> {
        let mut want = Vec::new();
        log_key(&mut want, refname, update_index);
        let iter = self.seek(BlockType::Log, &want)?;
        Ok(LogIterator::from_table(iter))
    }

    /// Returns an iterator over the refs whose value or peeled target is
    /// `oid`, using the object index if present and falling back to a full
    /// scan otherwise.
    pub fn refs_for(&self, oid: &[u8]) -> Result<RefIterator> {
        if self.inner.objs.present && self.inner.object_id_len > 0 {
            let prefix_len = self.inner.object_id_len.min(oid.len());
            let prefix = &oid[..prefix_len];

            let mut iter = self.seek(BlockType::Obj, prefix)?;
            if let Some(Record::Obj(obj)) = iter.next_record()? {
                if obj.hash_prefix == prefix {
                    if obj.offsets.is_empty() {
                        // positions were dropped at write time
                        return self.refs_for_scan(oid);
                    }

                    return Ok(RefIterator::from_indexed(IndexedRefIter {
                        reader: self.clone(),
                        oid: oid.to_vec(),
                        offsets: obj.offsets,
                        next_idx: 0,
                        block: None,
                    }));
                }
            }

            // no obj record: nothing references this oid
            return Ok(RefIterator::from_indexed(IndexedRefIter {
                reader: self.clone(),
                oid: oid.to_vec(),
                offsets: Vec::new(),
                next_idx: 0,
                block: None,
            }));
        }

        self.refs_for_scan(oid)
    }

    fn refs_for_scan(&self, oid: &[u8]) -> Result<RefIterator> {
        Ok(RefIterator::filtered(self.seek_ref("")?, oid.to_vec()))
    }

    fn section(&self, typ: BlockType) -> Section {
        match typ {
            BlockType::Ref => self.inner.refs,
            BlockType::Obj => self.inner.objs,
            BlockType::Log => self.inner.logs,
            BlockType::Index => Section::default(),
        }
    }

    /// Reads the block starting at `off`, or `None` past the last block.
    fn block_at(&self, off: u64) -> Result<Option<BlockReader>> {
        if off >= self.inner.size {
            return Ok(None);
        }

        let header_off = if off == 0 {
            header_size(self.inner.version)
        } else {
            0
        };

        let data = self.inner.src.read_block(off, self.inner.block_size)?;
        Ok(Some(BlockReader::new(
            data,
            header_off,
            self.inner.block_size,
            self.inner.hash_id.size(),
        )?))
    }

    /// Positions an iterator of the given section at `want`, descending the
    /// section's index if it has one.
    pub(crate) fn seek(&self, typ: BlockType, want: &[u8]) -> Result<TableIter> {
        let section = self.section(typ);
        if !section.present {
            return Ok(TableIter::exhausted(self.clone(), typ));
        }

        if section.index_offset > 0 {
            self.seek_indexed(typ, section.index_offset, want)
        } else {
            self.seek_linear(typ, section.offset, want)
        }
    }

    fn seek_indexed(&self, typ: BlockType, root: u64, want: &[u8]) -> Result<TableIter> {
        let mut off = root;

        loop {
            let Some(block) = self.block_at(off)? else {
                return Ok(TableIter::exhausted(self.clone(), typ));
            };

            if block.block_type() == typ {
                let mut bi = block.iter();
                bi.seek(want)?;
                return Ok(TableIter {
                    reader: self.clone(),
                    typ,
                    block_off: off,
                    block: Some(bi),
                });
            }

            if block.block_type() != BlockType::Index {
                return Err(Error::Format("unexpected block type during index descent"));
            }

            let mut bi = block.iter();
            bi.seek(want)?;

            match bi.next_record()? {
                Some(Record::Index(idx)) => off = idx.offset,
                Some(_) => return Err(Error::Format("non-index record in index block")),

                // seeked past the last key of the table
                None => return Ok(TableIter::exhausted(self.clone(), typ)),
            }
        }
    }

    fn seek_linear(&self, typ: BlockType, start: u64, want: &[u8]) -> Result<TableIter> {
        let Some(mut block) = self.block_at(start)? else {
            return Ok(TableIter::exhausted(self.clone(), typ));
        };
        if block.block_type() != typ {
            return Ok(TableIter::exhausted(self.clone(), typ));
        }

        let mut block_off = start;
        let mut key = Vec::new();

        // walk forward while the *next* block could still contain `want`
        loop {
            let next_off = block_off + block.full_block_size() as u64;
            let Some(next) = self.block_at(next_off)? else {
                break;
            };
            if next.block_type() != typ {
                break;
            }

            next.first_key(&mut key)?;
            if key.as_slice() > want {
                break;
            }

            block = next;
            block_off = next_off;
        }

        let mut bi = block.iter();
        bi.seek(want)?;

        Ok(TableIter {
            reader: self.clone(),
            typ,
            block_off,
            block: Some(bi),
        })
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reader({}, v{}, [{}, {}])",
            self.inner.name, self.inner.version, self.inner.min_update_index, self.inner.max_update_index,
        )
    }
}

/// Iterates one section of one table, stepping through its blocks.
pub(crate) struct TableIter {
    reader: Reader,
    typ: BlockType,
    block_off: u64,
    block: Option<BlockIter>,
}

impl TableIter {
    fn exhausted(reader: Reader, typ: BlockType) -> Self {
        Self {
            reader,
            typ,
            block_off: 0,
            block: None,
        }
    }

    /// Yields the next record of the section, or `None` at its end.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(bi) = &mut self.block else {
                return Ok(None);
            };

            if let Some(mut rec) = bi.next_record()? {
                if let Record::Ref(rec) = &mut rec {
                    // stored relative to the table's minimum
                    rec.update_index += self.reader.inner.min_update_index;
                }
                return Ok(Some(rec));
            }

            let next_off = self.block_off + bi.full_block_size() as u64;
            match self.reader.block_at(next_off)? {
                Some(block) if block.block_type() == self.typ => {
                    self.block_off = next_off;
                    self.block = Some(block.iter());
                }
                _ => {
                    self.block = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Re-seeks this iterator to `want` within its section.
    pub fn seek(&mut self, want: &[u8]) -> Result<()> {
        *self = self.reader.clone().seek(self.typ, want)?;
        Ok(())
    }
}

/// Iterates the ref blocks named by an obj record, filtering for one oid.
pub(crate) struct IndexedRefIter {
    reader: Reader,
    oid: Vec<u8>,
    offsets: Vec<u64>,
    next_idx: usize,
    block: Option<BlockIter>,
}

impl IndexedRefIter {
    pub fn matches(value: &RefValue, oid: &[u8]) -> bool {
        match value {
            RefValue::Val1(value) => value == oid,
            RefValue::Val2 {
                value,
                target_value,
            } => value == oid || target_value == oid,
            RefValue::Deletion | RefValue::Symref(_) => false,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<RefRecord>> {
        loop {
            let Some(bi) = &mut self.block else {
                let Some(offset) = self.offsets.get(self.next_idx).copied() else {
                    return Ok(None);
                };
                self.next_idx += 1;

                let Some(block) = self.reader.block_at(offset)? else {
                    return Err(Error::Format("obj record points past the table"));
                };
                if block.block_type() != BlockType::Ref {
                    return Err(Error::Format("obj record points at a non-ref block"));
                }

                self.block = Some(block.iter());
                continue;
            };

            match bi.next_record()? {
                None => self.block = None,
                Some(Record::Ref(mut rec)) => {
                    rec.update_index += self.reader.inner.min_update_index;
                    if Self::matches(&rec.value, &self.oid) {
                        return Ok(Some(rec));
                    }
                }
                Some(_) => return Err(Error::Format("non-ref record in ref block")),
            }
        }
    }

    pub fn rewind(&mut self) {
        self.next_idx = 0;
        self.block = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocksource::MemorySource;
    use crate::config::WriteOptions;
    use crate::record::{LogRecord, LogUpdate, LogValue, RefValue};
    use crate::writer::Writer;
    use test_log::test;

    fn oid(byte: u8) -> Vec<u8> {
        vec![byte; 20]
    }

    fn val1(name: &str, update_index: u64, byte: u8) -> RefRecord {
        RefRecord {
            refname: name.into(),
            update_index,
            value: RefValue::Val1(oid(byte)),
        }
    }

    fn log_update(name: &str, update_index: u64) -> LogRecord {
        LogRecord {
            refname: name.into(),
            update_index,
            value: LogValue::Update(LogUpdate {
                old_hash: oid(1),
                new_hash: oid(2),
                name: "Jane Doe".into(),
                email: "jane@invalid".into(),
                time: 1_000 + update_index,
                tz_offset: 60,
                message: format!("update {update_index}\n"),
            }),
        }
    }

    fn write_table(
        opts: &WriteOptions,
        refs: &[RefRecord],
        logs: &[LogRecord],
    ) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, opts)?;

        let min = refs
            .iter()
            .map(|r| r.update_index)
            .chain(logs.iter().map(|l| l.update_index))
            .min()
            .unwrap_or(1);
        let max = refs
            .iter()
            .map(|r| r.update_index)
            .chain(logs.iter().map(|l| l.update_index))
            .max()
            .unwrap_or(1);
        writer.set_limits(min, max)?;

        for rec in refs {
            writer.add_ref(rec)?;
        }
        for rec in logs {
            writer.add_log(rec)?;
        }
        writer.finish()?;

        Ok(out)
    }

    fn open(bytes: Vec<u8>) -> crate::Result<Reader> {
        Reader::new(Box::new(MemorySource::new(bytes)), "table.ref")
    }

    #[test]
    fn open_and_read_single_ref() -> crate::Result<()> {
        let bytes = write_table(
            &WriteOptions::default(),
            &[val1("refs/heads/main", 1, 0x42)],
            &[],
        )?;
        let reader = open(bytes)?;

        assert_eq!(HashId::Sha1, reader.hash_id());
        assert_eq!(1, reader.min_update_index());
        assert_eq!(1, reader.max_update_index());

        let mut iter = reader.seek_ref("refs/heads/main")?;
        let rec = iter.next().expect("should find ref")?;
        assert_eq!(val1("refs/heads/main", 1, 0x42), rec);
        assert!(iter.next().is_none());

        Ok(())
    }

    #[test]
    fn rejects_corruption() -> crate::Result<()> {
        let bytes = write_table(
            &WriteOptions::default(),
            &[val1("refs/heads/main", 1, 0x42)],
            &[],
        )?;

        // bad magic
        let mut corrupt = bytes.clone();
        corrupt[0] = b'X';
        assert!(matches!(open(corrupt), Err(Error::Format(_))));

        // flipped byte in the footer breaks the checksum
        let mut corrupt = bytes.clone();
        let len = corrupt.len();
        corrupt[len - 20] ^= 0xFF;
        assert!(matches!(open(corrupt), Err(Error::Format(_))));

        // truncation
        assert!(matches!(open(bytes[..60].to_vec()), Err(Error::Format(_))));

        Ok(())
    }

    #[test]
    fn iterates_in_order_from_start() -> crate::Result<()> {
        let refs: Vec<_> = (0..100)
            .map(|i| val1(&format!("refs/heads/branch{i:04}"), 1, i as u8))
            .collect();

        let opts = WriteOptions {
            block_size: 256,
            ..Default::default()
        };
        let reader = open(write_table(&opts, &refs, &[])?)?;

        let got: Vec<_> = reader.ref_iter()?.collect::<crate::Result<_>>()?;
        assert_eq!(refs, got);

        Ok(())
    }

    #[test]
    fn seek_ref_through_index() -> crate::Result<()> {
        let refs: Vec<_> = (0..512)
            .map(|i| val1(&format!("refs/heads/branch{i:04}"), 1, i as u8))
            .collect();

        let opts = WriteOptions {
            block_size: 256,
            ..Default::default()
        };
        let reader = open(write_table(&opts, &refs, &[])?)?;

        for i in [0usize, 1, 255, 256, 300, 511] {
            let name = format!("refs/heads/branch{i:04}");
            let mut iter = reader.seek_ref(&name)?;
            let rec = iter.next().expect("should find ref")?;
            assert_eq!(name, rec.refname);
        }

        // seeking between keys lands on the next greater one
        let mut iter = reader.seek_ref("refs/heads/branch0100a")?;
        let rec = iter.next().expect("should find ref")?;
        assert_eq!("refs/heads/branch0101", rec.refname);

        // seeking past the end yields nothing
        let mut iter = reader.seek_ref("refs/zzz")?;
        assert!(iter.next().is_none());

        Ok(())
    }

    #[test]
    fn seek_is_resumable_and_repeatable() -> crate::Result<()> {
        let refs: Vec<_> = (0..64)
            .map(|i| val1(&format!("refs/heads/branch{i:02}"), 1, i as u8))
            .collect();

        let opts = WriteOptions {
            block_size: 256,
            ..Default::default()
        };
        let reader = open(write_table(&opts, &refs, &[])?)?;

        let mut iter = reader.seek_ref("refs/heads/branch10")?;
        for i in 10..20 {
            let rec = iter.next().expect("should find ref")?;
            assert_eq!(format!("refs/heads/branch{i:02}"), rec.refname);
        }

        iter.seek("refs/heads/branch05")?;
        let rec = iter.next().expect("should find ref")?;
        assert_eq!("refs/heads/branch05", rec.refname);

        Ok(())
    }

    #[test]
    fn logs_sort_newest_first() -> crate::Result<()> {
        let logs: Vec<_> = (1..=5)
            .rev()
            .map(|i| log_update("refs/heads/main", i))
            .collect();

        let reader = open(write_table(&WriteOptions::default(), &[], &logs)?)?;

        let mut iter = reader.seek_log("refs/heads/main")?;
        let rec = iter.next().expect("should find log")?;
        assert_eq!(5, rec.update_index);

        // pinning the update index skips newer entries
        let mut iter = reader.seek_log_at("refs/heads/main", 3)?;
        let rec = iter.next().expect("should find log")?;
        assert_eq!(3, rec.update_index);
        let rec = iter.next().expect("should find log")?;
        assert_eq!(2, rec.update_index);

        Ok(())
    }

    #[test]
    fn logs_only_table() -> crate::Result<()> {
        let logs = vec![log_update("refs/heads/main", 1)];
        let reader = open(write_table(&WriteOptions::default(), &[], &logs)?)?;

        // no ref section
        let mut iter = reader.seek_ref("refs/heads/main")?;
        assert!(iter.next().is_none());

        let mut iter = reader.seek_log("refs/heads/main")?;
        assert!(iter.next().is_some());

        Ok(())
    }

    #[test]
    fn refs_for_uses_obj_index() -> crate::Result<()> {
        let mut refs: Vec<_> = (0..64)
            .map(|i| val1(&format!("refs/heads/branch{i:02}"), 1, i as u8))
            .collect();
        // two extra refs sharing one oid
        refs.push(val1("refs/tags/shared-a", 1, 7));
        refs.push(val1("refs/tags/shared-b", 1, 7));

        let opts = WriteOptions {
            block_size: 256,
            ..Default::default()
        };
        let reader = open(write_table(&opts, &refs, &[])?)?;

        let names: Vec<_> = reader
            .refs_for(&oid(7))?
            .map(|r| r.map(|r| r.refname))
            .collect::<crate::Result<_>>()?;
        assert_eq!(
            vec!["refs/heads/branch07", "refs/tags/shared-a", "refs/tags/shared-b"],
            names
        );

        // unreferenced oid yields nothing
        assert_eq!(0, reader.refs_for(&oid(0xEE))?.count());

        Ok(())
    }

    #[test]
    fn refs_for_falls_back_to_scan() -> crate::Result<()> {
        let refs: Vec<_> = (0..64)
            .map(|i| val1(&format!("refs/heads/branch{i:02}"), 1, i as u8))
            .collect();

        let opts = WriteOptions {
            block_size: 256,
            skip_index_objects: true,
            ..Default::default()
        };
        let reader = open(write_table(&opts, &refs, &[])?)?;

        let names: Vec<_> = reader
            .refs_for(&oid(9))?
            .map(|r| r.map(|r| r.refname))
            .collect::<crate::Result<_>>()?;
        assert_eq!(vec!["refs/heads/branch09"], names);

        Ok(())
    }

    #[test]
    fn unpadded_table_roundtrip() -> crate::Result<()> {
        let refs: Vec<_> = (0..100)
            .map(|i| val1(&format!("refs/heads/branch{i:04}"), 1, i as u8))
            .collect();

        let opts = WriteOptions {
            block_size: 256,
            unpadded: true,
            ..Default::default()
        };
        let bytes = write_table(&opts, &refs, &[])?;

        // unpadded tables are denser than a padded block grid
        assert!(bytes.len() < 100 * 256);

        let reader = open(bytes)?;
        let got: Vec<_> = reader.ref_iter()?.collect::<crate::Result<_>>()?;
        assert_eq!(refs, got);

        let mut iter = reader.seek_ref("refs/heads/branch0042")?;
        let rec = iter.next().expect("should find ref")?;
        assert_eq!("refs/heads/branch0042", rec.refname);

        Ok(())
    }

    #[test]
    fn dense_restarts_roundtrip() -> crate::Result<()> {
        let refs: Vec<_> = (0..50)
            .map(|i| val1(&format!("refs/heads/branch{i:04}"), 1, i as u8))
            .collect();

        // a restart point at every record
        let opts = WriteOptions {
            block_size: 512,
            restart_interval: 1,
            ..Default::default()
        };
        let reader = open(write_table(&opts, &refs, &[])?)?;

        let got: Vec<_> = reader.ref_iter()?.collect::<crate::Result<_>>()?;
        assert_eq!(refs, got);

        Ok(())
    }

    #[test]
    fn sha256_table_roundtrip() -> crate::Result<()> {
        let opts = WriteOptions {
            hash_id: HashId::Sha256,
            ..Default::default()
        };

        let rec = RefRecord {
            refname: "refs/heads/main".into(),
            update_index: 1,
            value: RefValue::Val1(vec![0x42; 32]),
        };

        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out, &opts)?;
        writer.set_limits(1, 1)?;
        writer.add_ref(&rec)?;
        writer.finish()?;

        assert_eq!(2, out[4]);

        let reader = open(out)?;
        assert_eq!(HashId::Sha256, reader.hash_id());

        let mut iter = reader.seek_ref("refs/heads/main")?;
        assert_eq!(rec, iter.next().expect("should find ref")?);

        Ok(())
    }

    #[test]
    fn corrupt_log_block_leaves_refs_readable() -> crate::Result<()> {
        let refs = vec![val1("refs/heads/main", 1, 0x42)];
        let logs = vec![log_update("refs/heads/main", 1)];

        let mut bytes = write_table(&WriteOptions::default(), &refs, &logs)?;

        // locate the log block through the footer and damage its compressed
        // payload
        let footer_base = bytes.len() - 68;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[footer_base + 48..footer_base + 56]);
        let log_off = u64::from_be_bytes(word) as usize;
        assert_eq!(b'g', bytes[log_off]);
        bytes[log_off + 10] ^= 0xFF;

        let reader = open(bytes)?;

        let mut iter = reader.seek_ref("refs/heads/main")?;
        assert!(iter.next().is_some());

        assert!(matches!(
            reader.seek_log("refs/heads/main"),
            Err(Error::Zlib | Error::Format(_))
        ));

        Ok(())
    }
}
