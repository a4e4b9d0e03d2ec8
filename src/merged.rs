// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::config::HashId;
use crate::iter::{LogIterator, RefIterator};
use crate::reader::{Reader, TableIter};
use crate::record::{log_key, BlockType, LogValue, Record, RefValue, UpdateIndex};
use crate::{Error, Result};
use interval_heap::IntervalHeap;

/// A virtual table overlaying N physical tables with newest-wins reads.
///
/// Constituent tables must be ordered by strictly ascending, non-overlapping
/// update index ranges and share one hash identity.
pub struct MergedTable {
    tables: Vec<Reader>,
    hash_id: HashId,
    min: UpdateIndex,
    max: UpdateIndex,
}

impl MergedTable {
    /// Creates a merged view over `tables`, oldest first.
    pub fn new(tables: Vec<Reader>, hash_id: HashId) -> Result<Self> {
        let mut min = 0;
        let mut max = 0;

        for (i, reader) in tables.iter().enumerate() {
            if reader.hash_id() != hash_id {
                return Err(Error::Format("mixed hash ids in merged table"));
            }

            if i == 0 {
                min = reader.min_update_index();
            } else if reader.min_update_index() <= max {
                return Err(Error::Format("tables overlap in update indices"));
            }

            max = reader.max_update_index();
        }

        Ok(Self {
            tables,
            hash_id,
            min,
            max,
        })
    }

    /// The tables being overlaid, oldest first.
    #[must_use]
    pub(crate) fn readers(&self) -> &[Reader] {
        &self.tables
    }

    /// Number of overlaid tables.
    #[must_use]
    pub fn tables_len(&self) -> usize {
        self.tables.len()
    }

    /// Hash identity shared by all constituents.
    #[must_use]
    pub fn hash_id(&self) -> HashId {
        self.hash_id
    }

    /// Smallest update index covered.
    #[must_use]
    pub fn min_update_index(&self) -> UpdateIndex {
        self.min
    }

    /// Largest update index covered.
    #[must_use]
    pub fn max_update_index(&self) -> UpdateIndex {
        self.max
    }

    /// Returns a merged iterator positioned where `refname` would be
    /// inserted. Seek to `""` for the start of the table.
    pub fn seek_ref(&self, refname: &str) -> Result<RefIterator> {
        Ok(RefIterator::from_merged(self.seek_ref_internal(
            refname,
            false,
        )?))
    }

    /// Iterates all refs, including tombstones.
    pub fn ref_iter(&self) -> Result<RefIterator> {
        self.seek_ref("")
    }

    /// Seeks to the newest log entry for `refname`.
    pub fn seek_log(&self, refname: &str) -> Result<LogIterator> {
        self.seek_log_at(refname, u64::MAX)
    }

    /// Seeks to log entries for `refname` at or below `update_index`.
    pub fn seek_log_at(&self, refname: &str, update_index: UpdateIndex) -> Result<LogIterator> {
        Ok(LogIterator::from_merged(self.seek_log_internal(
            refname,
            update_index,
            false,
        )?))
    }

    /// Iterates all log entries.
    pub fn log_iter(&self) -> Result<LogIterator> {
        self.seek_log("")
    }

    pub(crate) fn seek_ref_internal(
        &self,
        refname: &str,
        suppress_deletions: bool,
    ) -> Result<MergedIter> {
        let mut subs = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            subs.push(table.seek(BlockType::Ref, refname.as_bytes())?);
        }
        MergedIter::new(subs, suppress_deletions)
    }

    pub(crate) fn seek_log_internal(
        &self,
        refname: &str,
        update_index: UpdateIndex,
        suppress_deletions: bool,
    ) -> Result<MergedIter> {
        let mut want = Vec::new();
        log_key(&mut want, refname, update_index);

        let mut subs = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            subs.push(table.seek(BlockType::Log, &want)?);
        }
        MergedIter::new(subs, suppress_deletions)
    }
}

struct HeapEntry {
    key: Vec<u8>,
    index: usize,
    rec: Record,
}

impl Eq for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // ties on the key are won by the newest table; sub-iterators are
        // pushed oldest first, so the higher index must sort smaller
        self.key
            .cmp(&other.key)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges N per-table iterators by (key, table index).
///
/// Popping the smallest entry and draining equal keys implements
/// newest-wins: for refs, duplicates from older tables are dropped; log keys
/// embed the update index, so the drain only removes exact cross-table
/// duplicates there.
pub(crate) struct MergedIter {
    subs: Vec<TableIter>,
    heap: IntervalHeap<HeapEntry>,
    suppress_deletions: bool,
}

impl MergedIter {
    fn new(subs: Vec<TableIter>, suppress_deletions: bool) -> Result<Self> {
        let heap = IntervalHeap::with_capacity(subs.len());

        let mut iter = Self {
            subs,
            heap,
            suppress_deletions,
        };
        for idx in 0..iter.subs.len() {
            iter.advance(idx)?;
        }

        Ok(iter)
    }

    /// Pulls the next record of sub-iterator `idx` into the heap.
    fn advance(&mut self, idx: usize) -> Result<()> {
        if let Some(rec) = self.subs[idx].next_record()? {
            let mut key = Vec::new();
            rec.key(&mut key);
            self.heap.push(HeapEntry { key, index: idx, rec });
        }
        Ok(())
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(entry) = self.heap.pop_min() else {
                return Ok(None);
            };
            self.advance(entry.index)?;

            // drop shadowed duplicates of the same key from older tables
            while let Some(top) = self.heap.pop_min() {
                if top.key != entry.key {
                    self.heap.push(top);
                    break;
                }
                self.advance(top.index)?;
            }

            if self.suppress_deletions && is_deletion(&entry.rec) {
                continue;
            }

            return Ok(Some(entry.rec));
        }
    }

    /// Re-seeks all sub-iterators and rebuilds the heap.
    pub fn seek(&mut self, want: &[u8]) -> Result<()> {
        self.heap = IntervalHeap::with_capacity(self.subs.len());

        for idx in 0..self.subs.len() {
            self.subs[idx].seek(want)?;
            self.advance(idx)?;
        }

        Ok(())
    }
}

fn is_deletion(rec: &Record) -> bool {
    match rec {
        Record::Ref(r) => matches!(r.value, RefValue::Deletion),
        Record::Log(l) => matches!(l.value, LogValue::Deletion),
        Record::Obj(_) | Record::Index(_) => false,
    }
}
