// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::merged::MergedIter;
use crate::reader::{IndexedRefIter, TableIter};
use crate::record::{log_key, LogRecord, Record, RefRecord, UpdateIndex};
use crate::{Error, Result};

/// Iterator over [`RefRecord`]s, from a single table or a merged view.
///
/// Yields records in ascending refname order. May be re-seeked any number of
/// times via [`RefIterator::seek`].
pub struct RefIterator {
    inner: RefIterInner,
}

enum RefIterInner {
    Table(TableIter),
    Merged(MergedIter),
    Indexed(IndexedRefIter),
    Filtered {
        inner: Box<RefIterator>,
        oid: Vec<u8>,
    },
}

impl RefIterator {
    pub(crate) fn from_table(iter: TableIter) -> Self {
        Self {
            inner: RefIterInner::Table(iter),
        }
    }

    pub(crate) fn from_merged(iter: MergedIter) -> Self {
        Self {
            inner: RefIterInner::Merged(iter),
        }
    }

    pub(crate) fn from_indexed(iter: IndexedRefIter) -> Self {
        Self {
            inner: RefIterInner::Indexed(iter),
        }
    }

    pub(crate) fn filtered(inner: Self, oid: Vec<u8>) -> Self {
        Self {
            inner: RefIterInner::Filtered {
                inner: Box::new(inner),
                oid,
            },
        }
    }

    /// Repositions the iterator where `refname` would be inserted.
    ///
    /// For oid-filtered iterators this restarts the filtered walk.
    pub fn seek(&mut self, refname: &str) -> Result<()> {
        match &mut self.inner {
            RefIterInner::Table(iter) => iter.seek(refname.as_bytes()),
            RefIterInner::Merged(iter) => iter.seek(refname.as_bytes()),
            RefIterInner::Indexed(iter) => {
                iter.rewind();
                Ok(())
            }
            RefIterInner::Filtered { inner, .. } => inner.seek(refname),
        }
    }

    fn next_inner(&mut self) -> Result<Option<RefRecord>> {
        match &mut self.inner {
            RefIterInner::Table(iter) => match iter.next_record()? {
                None => Ok(None),
                Some(Record::Ref(rec)) => Ok(Some(rec)),
                Some(_) => Err(Error::Format("unexpected record type in ref section")),
            },

            RefIterInner::Merged(iter) => match iter.next_record()? {
                None => Ok(None),
                Some(Record::Ref(rec)) => Ok(Some(rec)),
                Some(_) => Err(Error::Format("unexpected record type in merged refs")),
            },

            RefIterInner::Indexed(iter) => iter.next_record(),

            RefIterInner::Filtered { inner, oid } => loop {
                match inner.next_inner()? {
                    None => return Ok(None),
                    Some(rec) if IndexedRefIter::matches(&rec.value, oid) => {
                        return Ok(Some(rec));
                    }
                    Some(_) => {}
                }
            },
        }
    }
}

impl Iterator for RefIterator {
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        fail_iter!(self.next_inner()).map(Ok)
    }
}

/// Iterator over [`LogRecord`]s, from a single table or a merged view.
///
/// Yields records in ascending `(refname, descending update_index)` order,
/// i.e. newest entry first per ref.
pub struct LogIterator {
    inner: LogIterInner,
}

enum LogIterInner {
    Table(TableIter),
    Merged(MergedIter),
}

impl LogIterator {
    pub(crate) fn from_table(iter: TableIter) -> Self {
        Self {
            inner: LogIterInner::Table(iter),
        }
    }

    pub(crate) fn from_merged(iter: MergedIter) -> Self {
        Self {
            inner: LogIterInner::Merged(iter),
        }
    }

    /// Repositions at the newest entry for `refname`.
    pub fn seek(&mut self, refname: &str) -> Result<()> {
        self.seek_at(refname, u64::MAX)
    }

    /// Repositions at the entry for `refname` with the given update index,
    /// or the next older one.
    pub fn seek_at(&mut self, refname: &str, update_index: UpdateIndex) -> Result<()> {
        let mut want = Vec::new();
        log_key(&mut want, refname, update_index);

        match &mut self.inner {
            LogIterInner::Table(iter) => iter.seek(&want),
            LogIterInner::Merged(iter) => iter.seek(&want),
        }
    }

    fn next_inner(&mut self) -> Result<Option<LogRecord>> {
        let rec = match &mut self.inner {
            LogIterInner::Table(iter) => iter.next_record()?,
            LogIterInner::Merged(iter) => iter.next_record()?,
        };

        match rec {
            None => Ok(None),
            Some(Record::Log(rec)) => Ok(Some(rec)),
            Some(_) => Err(Error::Format("unexpected record type in log section")),
        }
    }
}

impl Iterator for LogIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        fail_iter!(self.next_inner()).map(Ok)
    }
}
