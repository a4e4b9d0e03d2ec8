// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::blocksource::FileSource;
use crate::config::{LogExpiry, WriteOptions};
use crate::file::{apply_permissions, fsync_directory, LOCK_SUFFIX, TABLES_LIST};
use crate::merged::MergedTable;
use crate::reader::Reader;
use crate::record::{LogRecord, LogValue, Record, RefRecord, UpdateIndex};
use crate::writer::{footer_size, header_size, Writer};
use crate::{Error, Result};
use rand::Rng;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Writer type handed to [`Stack::add`] and [`Addition::add`] callbacks.
pub type FileWriter = Writer<BufWriter<File>>;

/// Statistics on past compactions.
#[derive(Copy, Clone, Debug, Default)]
pub struct CompactionStats {
    /// Total number of input bytes processed
    pub bytes: u64,

    /// Total number of records written into compacted tables
    pub entries_written: u64,

    /// How often compaction was attempted
    pub attempts: usize,

    /// Attempts that failed on concurrent updates
    pub failures: usize,
}

/// Flags for [`Stack::new_addition`].
#[derive(Copy, Clone, Debug, Default)]
pub struct AdditionFlags {
    /// Reload and retry once instead of failing with
    /// [`Error::Outdated`] when the manifest changed since the stack was
    /// loaded.
    pub reload: bool,
}

/// An exclusively created sentinel file, removed on drop unless persisted.
struct LockFile {
    path: PathBuf,
    file: Option<File>,
    armed: bool,
}

impl LockFile {
    /// Creates the lock file, failing with [`Error::Lock`] if it already
    /// exists.
    fn acquire(path: PathBuf, mode: Option<u32>) -> Result<Self> {
        let file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Lock);
            }
            Err(e) => return Err(e.into()),
        };

        apply_permissions(&path, mode)?;

        Ok(Self {
            path,
            file: Some(file),
            armed: true,
        })
    }

    fn write_all(&mut self, content: &[u8]) -> Result<()> {
        self.file
            .as_mut()
            .ok_or(Error::Api("lock file already persisted"))?
            .write_all(content)?;
        Ok(())
    }

    /// Syncs and atomically renames the lock file onto `target`.
    fn persist(mut self, target: &Path) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        std::fs::rename(&self.path, target)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.file.take();
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A directory of immutable tables plus the `tables.list` manifest,
/// presenting a mutable ref database.
///
/// Concurrency is between processes only and goes through exclusively
/// created lock files; a single `Stack` instance is meant to be driven by
/// one caller at a time.
pub struct Stack {
    dir: PathBuf,
    list_path: PathBuf,
    opts: WriteOptions,
    merged: MergedTable,
    stats: CompactionStats,
}

impl Stack {
    /// Opens (or initializes) the stack in `dir`.
    pub fn new(dir: &Path, opts: WriteOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut stack = Self {
            dir: dir.to_owned(),
            list_path: dir.join(TABLES_LIST),
            merged: MergedTable::new(Vec::new(), opts.hash_id)?,
            opts,
            stats: CompactionStats::default(),
        };
        stack.reload()?;

        Ok(stack)
    }

    /// The merged view over the currently loaded tables.
    ///
    /// Valid until the next reload; iterators obtained from it stay usable
    /// beyond that.
    #[must_use]
    pub fn merged(&self) -> &MergedTable {
        &self.merged
    }

    /// Statistics on compactions performed by this instance.
    #[must_use]
    pub fn compaction_stats(&self) -> CompactionStats {
        self.stats
    }

    /// The update index at which the next table should be written.
    #[must_use]
    pub fn next_update_index(&self) -> UpdateIndex {
        self.merged
            .readers()
            .last()
            .map_or(1, |r| r.max_update_index() + 1)
    }

    fn list_lock_path(&self) -> PathBuf {
        self.dir.join(format!("{TABLES_LIST}{LOCK_SUFFIX}"))
    }

    fn read_names(&self) -> Result<Vec<String>> {
        let content = match std::fs::read_to_string(&self.list_path) {
            Ok(content) => content,

            // a missing manifest means the stack is empty
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn is_up_to_date(&self) -> Result<bool> {
        let names = self.read_names()?;
        let loaded = self.merged.readers();

        Ok(names.len() == loaded.len()
            && names
                .iter()
                .zip(loaded.iter())
                .all(|(name, reader)| name == reader.name()))
    }

    /// Re-reads `tables.list` and swaps in the listed tables, reusing
    /// already open readers by name.
    pub fn reload(&mut self) -> Result<()> {
        self.reload_maybe_reuse(true)
    }

    fn reload_once(&mut self, names: &[String], reuse: bool) -> Result<()> {
        let mut current: Vec<Option<Reader>> =
            self.merged.readers().iter().cloned().map(Some).collect();

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let mut reader = None;

            if reuse {
                for slot in &mut current {
                    if slot.as_ref().is_some_and(|r| r.name() == name) {
                        reader = slot.take();
                        break;
                    }
                }
            }

            let reader = match reader {
                Some(reader) => reader,
                None => {
                    let src = FileSource::open(&self.dir.join(name))?;
                    Reader::new(Box::new(src), name)?
                }
            };
            tables.push(reader);
        }

        self.merged = MergedTable::new(tables, self.opts.hash_id)?;
        Ok(())
    }

    /// Reload with retries: a concurrent compaction may unlink a table
    /// between us reading the manifest and opening the file, in which case
    /// the manifest has changed and we try again with jittered backoff,
    /// bounded by a deadline.
    fn reload_maybe_reuse(&mut self, reuse: bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut delay = Duration::ZERO;
        let mut tries = 0;

        loop {
            tries += 1;
            if tries > 3 && Instant::now() >= deadline {
                return Err(Error::NotExist);
            }

            let names = self.read_names()?;
            match self.reload_once(&names, reuse) {
                Ok(()) => return Ok(()),
                Err(Error::NotExist) => {
                    let names_after = self.read_names()?;
                    if names_after == names {
                        // stable manifest pointing at a missing table:
                        // retrying will not help
                        return Err(Error::NotExist);
                    }
                }
                Err(e) => return Err(e),
            }

            let jitter = rand::rng().random_range(0..=delay.as_millis().max(1) as u64);
            delay += Duration::from_millis(jitter + 1);
            std::thread::sleep(delay);
        }
    }

    /// Starts a transaction that appends tables to the stack. Takes the
    /// manifest lock; concurrent writers see [`Error::Lock`].
    pub fn new_addition(&mut self, flags: AdditionFlags) -> Result<Addition<'_>> {
        let perms = self.opts.default_permissions;

        for attempt in 0..2 {
            let lock = LockFile::acquire(self.list_lock_path(), perms)?;

            if self.is_up_to_date()? {
                let next_update_index = self.next_update_index();
                return Ok(Addition {
                    stack: self,
                    lock: Some(lock),
                    new_tables: Vec::new(),
                    next_update_index,
                });
            }

            drop(lock);
            if !flags.reload || attempt > 0 {
                return Err(Error::Outdated);
            }
            self.reload()?;
        }

        Err(Error::Outdated)
    }

    /// Convenience wrapper: one writer callback, committed immediately.
    ///
    /// On [`Error::Lock`] the stack is reloaded so the caller can retry
    /// against fresh state.
    pub fn add<F>(&mut self, write_fn: F) -> Result<()>
    where
        F: FnOnce(&mut FileWriter) -> Result<()>,
    {
        let result = self.try_add(write_fn);
        if matches!(result, Err(Error::Lock)) {
            if let Err(e) = self.reload() {
                log::debug!("reload after lock collision failed: {e}");
            }
        }
        result
    }

    fn try_add<F>(&mut self, write_fn: F) -> Result<()>
    where
        F: FnOnce(&mut FileWriter) -> Result<()>,
    {
        let mut addition = self.new_addition(AdditionFlags::default())?;
        addition.add(write_fn)?;
        addition.commit()
    }

    /// Reads the current value of a single ref; `None` if it does not exist
    /// or its newest record is a deletion.
    pub fn read_ref(&self, refname: &str) -> Result<Option<RefRecord>> {
        let mut iter = self.merged.seek_ref(refname)?;

        match iter.next() {
            None => Ok(None),
            Some(rec) => {
                let rec = rec?;
                if rec.refname == refname && !rec.is_deletion() {
                    Ok(Some(rec))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Reads the newest log entry of a single ref.
    pub fn read_log(&self, refname: &str) -> Result<Option<LogRecord>> {
        let mut iter = self.merged.seek_log(refname)?;

        match iter.next() {
            None => Ok(None),
            Some(rec) => {
                let rec = rec?;
                if rec.refname == refname && !rec.is_deletion() {
                    Ok(Some(rec))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Compacts the whole stack into a single table, optionally expiring
    /// old log records.
    pub fn compact_all(&mut self, expiry: Option<LogExpiry>) -> Result<usize> {
        let len = self.merged.tables_len();
        if len == 0 || (len == 1 && expiry.is_none()) {
            return Ok(0);
        }

        self.compact_range(0, len - 1, expiry, false)
    }

    /// Compacts the geometric suffix of the stack, if any. Best-effort:
    /// concurrent lock holders shrink the range or skip the pass entirely.
    pub fn auto_compact(&mut self) -> Result<usize> {
        let factor = self.opts.auto_compaction_factor.max(2);
        let overhead =
            (header_size(self.opts.hash_id.format_version())
                + footer_size(self.opts.hash_id.format_version())) as u64
                - 1;

        let sizes: Vec<u64> = self
            .merged
            .readers()
            .iter()
            .map(|r| r.size().saturating_sub(overhead).max(1))
            .collect();

        let Some((first, last)) = suggest_compaction_segment(factor, &sizes) else {
            return Ok(0);
        };

        match self.compact_range(first, last, None, true) {
            Ok(n) => Ok(n),
            Err(Error::Lock | Error::Outdated) => {
                self.stats.failures += 1;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Compacts tables `[first, last]` into one.
    ///
    /// Holds the manifest lock only while validating and while swapping the
    /// manifest; the merge itself runs under per-table lock sentinels so
    /// non-conflicting additions can proceed concurrently.
    fn compact_range(
        &mut self,
        first: usize,
        last: usize,
        expiry: Option<LogExpiry>,
        best_effort: bool,
    ) -> Result<usize> {
        if first > last {
            return Ok(0);
        }

        self.stats.attempts += 1;
        let perms = self.opts.default_permissions;

        let names: Vec<String> = self
            .merged
            .readers()
            .iter()
            .map(|r| r.name().to_owned())
            .collect();

        let list_lock = LockFile::acquire(self.list_lock_path(), perms)?;
        if !self.is_up_to_date()? {
            return Err(Error::Outdated);
        }

        // lock the tables newest to oldest; under best effort, a held lock
        // shrinks the range to the suffix behind it
        let mut first = first;
        let mut table_locks = Vec::with_capacity(last - first + 1);
        let mut idx = last as isize;
        while idx >= first as isize {
            let lock_path = self
                .dir
                .join(format!("{}{LOCK_SUFFIX}", names[idx as usize]));

            match LockFile::acquire(lock_path, perms) {
                Ok(lock) => table_locks.push(lock),
                Err(Error::Lock) if best_effort && last as isize - idx >= 2 => {
                    first = (idx + 1) as usize;
                    break;
                }
                Err(e) => return Err(e),
            }

            idx -= 1;
        }

        // let non-conflicting additions through while we merge
        drop(list_lock);

        log::debug!(
            "compacting tables [{first}, {last}] of {} in {:?}",
            names.len(),
            self.dir,
        );

        let readers = self.merged.readers()[first..=last].to_vec();
        for reader in &readers {
            self.stats.bytes += reader.size();
        }

        let min = readers[0].min_update_index();
        let max = readers[readers.len() - 1].max_update_index();
        let sub_merged = MergedTable::new(readers, self.opts.hash_id)?;

        let temp = tempfile::Builder::new()
            .prefix(&format!("{min:012x}-{max:012x}.ref.tmp."))
            .tempfile_in(&self.dir)?;
        let (file, temp_path) = temp.into_parts();

        let mut writer = Writer::new(BufWriter::new(file), &self.opts)?;
        writer.set_limits(min, max)?;

        // compacting the base of the stack drops tombstones: there is no
        // older table left to shadow
        let suppress_deletions = first == 0;
        let mut entries: u64 = 0;

        let mut refs = sub_merged.seek_ref_internal("", suppress_deletions)?;
        while let Some(rec) = refs.next_record()? {
            let Record::Ref(rec) = rec else {
                return Err(Error::Format("unexpected record type in merged refs"));
            };
            writer.add_ref(&rec)?;
            entries += 1;
        }

        let mut logs = sub_merged.seek_log_internal("", u64::MAX, suppress_deletions)?;
        while let Some(rec) = logs.next_record()? {
            let Record::Log(rec) = rec else {
                return Err(Error::Format("unexpected record type in merged logs"));
            };

            if let Some(expiry) = &expiry {
                let time = match &rec.value {
                    LogValue::Update(update) => update.time,
                    LogValue::Deletion => 0,
                };
                if expiry.time > 0 && time < expiry.time {
                    continue;
                }
                if expiry.min_update_index > 0 && rec.update_index < expiry.min_update_index {
                    continue;
                }
            }

            writer.add_log(&rec)?;
            entries += 1;
        }

        // tombstone-only inputs can compact into nothing at all
        let is_empty_table = match writer.finish() {
            Ok(_) => false,
            Err(Error::EmptyTable) => true,
            Err(e) => return Err(e),
        };

        if !is_empty_table {
            let buffered = writer.into_inner();
            let file = buffered
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?;
            file.sync_all()?;
        }
        self.stats.entries_written += entries;

        let mut list_lock = LockFile::acquire(self.list_lock_path(), perms)?;
        if !self.is_up_to_date()? {
            return Err(Error::Outdated);
        }

        let suffix: u32 = rand::rng().random();
        let new_name = format!("{min:012x}-{max:012x}-{suffix:08x}.ref");

        if !is_empty_table {
            let dest = self.dir.join(&new_name);
            temp_path.persist(&dest).map_err(|e| Error::Io(e.error))?;
            apply_permissions(&dest, perms)?;
        }

        let mut content = String::new();
        for name in &names[..first] {
            content.push_str(name);
            content.push('\n');
        }
        if !is_empty_table {
            content.push_str(&new_name);
            content.push('\n');
        }
        for name in &names[last + 1..] {
            content.push_str(name);
            content.push('\n');
        }

        list_lock.write_all(content.as_bytes())?;
        list_lock.persist(&self.list_path)?;
        if let Err(e) = fsync_directory(&self.dir) {
            log::debug!("directory fsync failed: {e}");
        }

        // unlink the replaced tables, but never a name the new manifest
        // still references
        let keep: HashSet<&str> = content.lines().collect();
        for name in &names[first..=last] {
            if !keep.contains(name.as_str()) {
                let _ = std::fs::remove_file(self.dir.join(name));
            }
        }

        drop(table_locks);
        self.reload()?;

        Ok(last - first + 1)
    }

    /// Removes stale `*.ref` files that are not listed in the manifest and
    /// not locked by a concurrent compaction. Returns the number of files
    /// removed.
    pub fn clean(&mut self) -> Result<usize> {
        let _lock = LockFile::acquire(self.list_lock_path(), self.opts.default_permissions)?;

        let keep: HashSet<String> = self.read_names()?.into_iter().collect();
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if !name.ends_with(".ref") || keep.contains(&name) {
                continue;
            }
            if self.dir.join(format!("{name}{LOCK_SUFFIX}")).exists() {
                continue;
            }

            log::debug!("removing stale table {name}");
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }

        Ok(removed)
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stack({:?}, {} tables)",
            self.dir,
            self.merged.tables_len()
        )
    }
}

/// A held transaction appending tables to a stack.
///
/// Dropping an uncommitted addition unlinks its queued tables and releases
/// the manifest lock.
pub struct Addition<'s> {
    stack: &'s mut Stack,
    lock: Option<LockFile>,
    new_tables: Vec<String>,
    next_update_index: UpdateIndex,
}

impl Addition<'_> {
    /// The update index the writer callback must use as its lower limit.
    #[must_use]
    pub fn next_update_index(&self) -> UpdateIndex {
        self.next_update_index
    }

    /// Writes one new table via `write_fn`, which must call
    /// [`Writer::set_limits`] before adding records. A table that ends up
    /// empty is dropped silently.
    pub fn add<F>(&mut self, write_fn: F) -> Result<()>
    where
        F: FnOnce(&mut FileWriter) -> Result<()>,
    {
        let next = self.next_update_index;

        let temp = tempfile::Builder::new()
            .prefix(&format!("{next:012x}-{next:012x}.ref.tmp."))
            .tempfile_in(&self.stack.dir)?;
        let (file, temp_path) = temp.into_parts();

        let mut writer = Writer::new(BufWriter::new(file), &self.stack.opts)?;
        write_fn(&mut writer)?;

        let min = writer.min_update_index();
        let max = writer.max_update_index();

        match writer.finish() {
            Ok(_) => {}
            Err(Error::EmptyTable) => return Ok(()),
            Err(e) => return Err(e),
        }

        let buffered = writer.into_inner();
        let file = buffered
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        if min < next {
            return Err(Error::Api("new table starts before the stack's next update index"));
        }

        let suffix: u32 = rand::rng().random();
        let name = format!("{min:012x}-{max:012x}-{suffix:08x}.ref");

        let dest = self.stack.dir.join(&name);
        temp_path.persist(&dest).map_err(|e| Error::Io(e.error))?;
        apply_permissions(&dest, self.stack.opts.default_permissions)?;

        self.new_tables.push(name);

        // tables queued later in the same transaction must not overlap
        self.next_update_index = max + 1;

        Ok(())
    }

    /// Atomically publishes the queued tables: the manifest is rewritten
    /// through the held lock file and renamed into place.
    pub fn commit(mut self) -> Result<()> {
        if self.new_tables.is_empty() {
            return Ok(());
        }

        let mut content = String::new();
        for reader in self.stack.merged.readers() {
            content.push_str(reader.name());
            content.push('\n');
        }
        for name in &self.new_tables {
            content.push_str(name);
            content.push('\n');
        }

        let mut lock = self
            .lock
            .take()
            .ok_or(Error::Api("addition already committed"))?;
        lock.write_all(content.as_bytes())?;
        lock.persist(&self.stack.list_path)?;

        if let Err(e) = fsync_directory(&self.stack.dir) {
            log::debug!("directory fsync failed: {e}");
        }

        log::debug!(
            "committed {} new table(s) to {:?}",
            self.new_tables.len(),
            self.stack.dir,
        );

        // from here on the tables are published; nothing left to roll back
        self.new_tables.clear();

        self.stack.reload()?;

        if !self.stack.opts.disable_auto_compact {
            self.stack.auto_compact()?;
        }

        Ok(())
    }
}

impl Drop for Addition<'_> {
    fn drop(&mut self) {
        for name in &self.new_tables {
            let _ = std::fs::remove_file(self.stack.dir.join(name));
        }
    }
}

/// Floor of the base-`factor` logarithm.
fn fastlog(factor: u64, mut size: u64) -> u64 {
    debug_assert!(factor >= 2);
    debug_assert!(size > 0);

    let mut log = 0;
    while size >= factor {
        size /= factor;
        log += 1;
    }
    log
}

#[derive(Clone, Copy, Debug, Default)]
struct Segment {
    start: usize,
    end: usize,
    log: u64,
    bytes: u64,
}

/// Groups adjacent tables whose sizes share a magnitude.
fn sizes_to_segments(factor: u64, sizes: &[u64]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cur = Segment::default();

    for (i, size) in sizes.iter().enumerate() {
        let log = fastlog(factor, *size);
        if cur.log != log && cur.bytes > 0 {
            segments.push(cur);
            cur = Segment {
                start: i,
                ..Default::default()
            };
        }

        cur.log = log;
        cur.end = i + 1;
        cur.bytes += size;
    }

    if cur.bytes > 0 {
        segments.push(cur);
    }
    segments
}

/// Picks the segment to compact: the lowest-magnitude run of at least two
/// tables, extended to the left while the accumulated bytes reach the
/// magnitude of the preceding table. Returns `(first, last)` inclusive.
fn suggest_compaction_segment(factor: u64, sizes: &[u64]) -> Option<(usize, usize)> {
    let segments = sizes_to_segments(factor, sizes);

    let mut min_seg: Option<Segment> = None;
    for seg in segments {
        if seg.end - seg.start == 1 {
            continue;
        }

        if min_seg.is_none_or(|min| seg.log < min.log) {
            min_seg = Some(seg);
        }
    }

    let mut seg = min_seg?;
    while seg.start > 0 {
        let prev = seg.start - 1;
        if fastlog(factor, seg.bytes) < fastlog(factor, sizes[prev]) {
            break;
        }

        seg.start = prev;
        seg.bytes += sizes[prev];
    }

    Some((seg.start, seg.end - 1))
}
