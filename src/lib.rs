// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An implementation of the reftable format: a binary, block-based file format
//! for storing a large number of reference records (name → object id) together
//! with their reflog entries.
//!
//! A ref database is a [`Stack`]: a directory holding an ordered list of
//! immutable tables and a `tables.list` manifest. Writes append new tables
//! through a locked transaction ([`Addition`]), reads go through a
//! [`MergedTable`] that overlays all tables with newest-wins semantics, and
//! maintenance merges runs of small tables back into larger ones
//! (auto-compaction).
//!
//! Inside a table, records are grouped into fixed-size blocks with
//! prefix-compressed keys and restart points, so a single lookup costs
//! O(log N) block reads via a multi-level index.
//!
//! # Example usage
//!
//! ```
//! use reftable::{RefRecord, RefValue, Stack, WriteOptions};
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! let mut stack = Stack::new(dir.path(), WriteOptions::default())?;
//!
//! let update_index = stack.next_update_index();
//! stack.add(|writer| {
//!     writer.set_limits(update_index, update_index)?;
//!     writer.add_ref(&RefRecord {
//!         refname: "refs/heads/main".into(),
//!         update_index,
//!         value: RefValue::Symref("refs/heads/trunk".into()),
//!     })
//! })?;
//!
//! let ref_record = stack.read_ref("refs/heads/main")?;
//! assert!(ref_record.is_some());
//! #
//! # Ok::<(), reftable::Error>(())
//! ```

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod basics;
mod block;
mod blocksource;
mod compress;
mod config;
mod error;

#[doc(hidden)]
pub mod file;

mod iter;
mod merged;
mod reader;
mod record;
mod stack;
mod writer;

pub use {
    blocksource::{BlockData, BlockSource, FileSource, MemorySource},
    config::{HashId, LogExpiry, WriteOptions},
    error::{Error, Result},
    iter::{LogIterator, RefIterator},
    merged::MergedTable,
    reader::Reader,
    record::{LogRecord, LogUpdate, LogValue, RefRecord, RefValue, UpdateIndex},
    stack::{Addition, AdditionFlags, CompactionStats, FileWriter, Stack},
    writer::{BlockStats, Stats, Writer},
};

#[cfg(feature = "mmap")]
pub use blocksource::MmapSource;
