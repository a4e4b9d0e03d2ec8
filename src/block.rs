// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::basics::{partition_point, put_u24, u16_at, u24_at};
use crate::blocksource::BlockData;
use crate::compress;
use crate::record::{decode_key, encode_key, BlockType, Record};
use crate::{Error, Result};

/// The restart table stores the restart count as a 16-bit integer.
const MAX_RESTARTS: usize = (1 << 16) - 1;

/// Accumulates records into a fixed-size block buffer.
///
/// `add` reports whether the record fit; the caller finishes the block and
/// starts a new one when it did not.
pub(crate) struct BlockWriter {
    typ: BlockType,
    buf: Vec<u8>,
    next: usize,
    block_size: usize,
    header_off: usize,
    restarts: Vec<u32>,
    restart_interval: usize,
    last_key: Vec<u8>,
    key_scratch: Vec<u8>,
    scratch: Vec<u8>,
    entries: usize,
    hash_size: usize,
}

impl BlockWriter {
    pub fn new(
        typ: BlockType,
        block_size: usize,
        header_off: usize,
        hash_size: usize,
        restart_interval: usize,
    ) -> Self {
        debug_assert!(header_off + 4 < block_size);

        let mut buf = vec![0; block_size];
        buf[header_off] = typ.tag();

        Self {
            typ,
            buf,
            next: header_off + 4,
            block_size,
            header_off,
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            last_key: Vec::new(),
            key_scratch: Vec::new(),
            scratch: Vec::new(),
            entries: 0,
            hash_size,
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.typ
    }

    pub fn header_off(&self) -> usize {
        self.header_off
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Key of the most recently added record.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Mutable view of the leading header region (table header of the very
    /// first block).
    pub fn header_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.header_off]
    }

    /// Adds a record. Returns `Ok(false)` if it does not fit into the
    /// remaining space.
    pub fn add(&mut self, rec: &Record) -> Result<bool> {
        let restart = self.entries % self.restart_interval == 0;
        if restart && self.restarts.len() >= MAX_RESTARTS {
            return Ok(false);
        }

        rec.key(&mut self.key_scratch);

        self.scratch.clear();
        let prev_key: &[u8] = if restart { &[] } else { &self.last_key };
        encode_key(
            &mut self.scratch,
            prev_key,
            &self.key_scratch,
            rec.value_type(),
        );
        rec.encode_value(&mut self.scratch, self.hash_size)?;

        let restart_len = self.restarts.len() + usize::from(restart);
        if 2 + 3 * restart_len + self.scratch.len() > self.block_size - self.next {
            return Ok(false);
        }

        if restart {
            self.restarts.push(self.next as u32);
        }

        self.buf[self.next..self.next + self.scratch.len()].copy_from_slice(&self.scratch);
        self.next += self.scratch.len();

        std::mem::swap(&mut self.last_key, &mut self.key_scratch);
        self.entries += 1;

        Ok(true)
    }

    /// Writes the restart table, patches the block length, and compresses log
    /// payloads. Returns the number of buffer bytes making up the block.
    pub fn finish(&mut self) -> Result<usize> {
        for restart in &self.restarts {
            put_u24(&mut self.buf[self.next..], *restart);
            self.next += 3;
        }

        self.buf[self.next..self.next + 2]
            .copy_from_slice(&(self.restarts.len() as u16).to_be_bytes());
        self.next += 2;

        put_u24(&mut self.buf[self.header_off + 1..], self.next as u32);

        if self.typ == BlockType::Log {
            let skip = self.header_off + 4;
            let compressed = compress::deflate(&self.buf[skip..self.next])?;

            // zlib can expand incompressible payloads slightly
            if skip + compressed.len() > self.buf.len() {
                self.buf.resize(skip + compressed.len(), 0);
            }

            self.buf[skip..skip + compressed.len()].copy_from_slice(&compressed);
            self.next = skip + compressed.len();
        }

        Ok(self.next)
    }

    /// The finished block's bytes; only valid after [`BlockWriter::finish`].
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.next]
    }
}

/// Parses one block's restart table and hands out iterators over it.
pub(crate) struct BlockReader {
    block: BlockData,
    typ: BlockType,
    header_off: usize,
    block_len: usize,
    restart_count: usize,
    restart_start: usize,
    full_block_size: usize,
    hash_size: usize,
}

impl BlockReader {
    /// `table_block_size` of 0 means the extent is taken from the block
    /// itself (used for index-of-index levels in unpadded tables).
    pub fn new(
        block: BlockData,
        header_off: usize,
        table_block_size: u32,
        hash_size: usize,
    ) -> Result<Self> {
        if block.len() < header_off + 4 {
            return Err(Error::Format("truncated block"));
        }

        let typ =
            BlockType::from_tag(block[header_off]).ok_or(Error::Format("unknown block type"))?;
        let sz = u24_at(&block, header_off + 1)? as usize;

        let mut full_block_size = table_block_size as usize;
        let block = if typ == BlockType::Log {
            let skip = header_off + 4;
            if sz < skip {
                return Err(Error::Format("log block too short"));
            }

            let (inflated, consumed) = compress::inflate(&block[skip..], sz - skip)?;
            if inflated.len() != sz - skip {
                return Err(Error::Format("log block inflates to wrong length"));
            }

            full_block_size = skip + consumed;

            let mut buf = Vec::with_capacity(sz);
            buf.extend_from_slice(&block[..skip]);
            buf.extend_from_slice(&inflated);
            buf.into()
        } else {
            if sz > block.len() {
                return Err(Error::Format("truncated block"));
            }

            if full_block_size == 0 {
                full_block_size = sz;
            } else if sz < full_block_size && sz < block.len() && block[sz] != 0 {
                // Smaller than the full block size and followed by
                // a non-zero byte: unpadded block, the next one starts
                // right behind it.
                full_block_size = sz;
            }

            block
        };

        let restart_count = usize::from(u16_at(&block, sz.wrapping_sub(2))?);
        let restart_start = sz
            .checked_sub(2 + 3 * restart_count)
            .filter(|start| *start >= header_off + 4)
            .ok_or(Error::Format("bad restart table"))?;

        Ok(Self {
            block,
            typ,
            header_off,
            block_len: restart_start,
            restart_count,
            restart_start,
            full_block_size,
            hash_size,
        })
    }

    pub fn block_type(&self) -> BlockType {
        self.typ
    }

    /// On-disk extent of this block, i.e. the distance to the next block.
    pub fn full_block_size(&self) -> usize {
        self.full_block_size
    }

    fn restart_offset(&self, idx: usize) -> Result<usize> {
        Ok(u24_at(&self.block, self.restart_start + 3 * idx)? as usize)
    }

    /// Decodes the key stored at a restart point (always a full key).
    fn restart_key(&self, idx: usize, out: &mut Vec<u8>) -> Result<()> {
        let off = self.restart_offset(idx)?;
        let mut reader = self
            .block
            .get(off..self.block_len)
            .ok_or(Error::Format("bad restart offset"))?;
        decode_key(out, &mut reader, &[])?;
        Ok(())
    }

    /// Decodes the first key of the block.
    pub fn first_key(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut reader = &self.block[self.header_off + 4..self.block_len];
        decode_key(out, &mut reader, &[])?;
        Ok(())
    }

    pub fn iter(self) -> BlockIter {
        let next_off = self.header_off + 4;
        BlockIter {
            reader: self,
            next_off,
            last_key: Vec::new(),
            key_scratch: Vec::new(),
        }
    }
}

/// Iterates the records of a single block.
pub(crate) struct BlockIter {
    reader: BlockReader,
    next_off: usize,
    last_key: Vec<u8>,
    key_scratch: Vec<u8>,
}

impl BlockIter {
    pub fn full_block_size(&self) -> usize {
        self.reader.full_block_size
    }

    /// Decodes the next record, or `None` at the end of the block.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.next_off >= self.reader.block_len {
            return Ok(None);
        }

        let mut reader = &self.reader.block[self.next_off..self.reader.block_len];
        let remaining = reader.len();

        let value_type = decode_key(&mut self.key_scratch, &mut reader, &self.last_key)?;
        let rec = Record::decode(
            self.reader.typ,
            &self.key_scratch,
            value_type,
            &mut reader,
            self.reader.hash_size,
        )?;

        self.next_off += remaining - reader.len();
        std::mem::swap(&mut self.last_key, &mut self.key_scratch);

        Ok(Some(rec))
    }

    /// Positions the iterator so the next record is the first whose key is
    /// `>= want`. Seeking past the last key leaves the iterator at the end.
    pub fn seek(&mut self, want: &[u8]) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.key_scratch);
        let mut seek_err = None;

        // first restart point whose key is >= want
        let idx = partition_point(self.reader.restart_count, |i| {
            match self.reader.restart_key(i, &mut scratch) {
                Ok(()) => scratch.as_slice() < want,
                Err(e) => {
                    seek_err.get_or_insert(e);
                    false
                }
            }
        });
        self.key_scratch = scratch;

        if let Some(e) = seek_err {
            return Err(e);
        }

        self.next_off = if idx > 0 {
            self.reader.restart_offset(idx - 1)?
        } else {
            self.reader.header_off + 4
        };
        self.last_key.clear();

        // walk forward to the first key >= want, keeping the iterator
        // positioned *before* it
        let mut saved_key = Vec::new();
        loop {
            let saved_off = self.next_off;
            saved_key.clone_from(&self.last_key);

            match self.next_record()? {
                None => break,
                Some(_) => {
                    // after next_record, last_key is the decoded key
                    if self.last_key.as_slice() >= want {
                        self.next_off = saved_off;
                        self.last_key.clone_from(&saved_key);
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
