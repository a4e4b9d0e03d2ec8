// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur when reading or mutating a ref database
#[derive(Debug)]
pub enum Error {
    /// Unexpected file system or kernel behavior
    Io(std::io::Error),

    /// Format inconsistency on reading data (bad magic, version, checksum,
    /// truncated or malformed block)
    Format(&'static str),

    /// A file was absent where one was expected.
    ///
    /// Kept separate from [`Error::Io`] because a missing `tables.list`
    /// means "empty stack", and a missing table during reload means the
    /// manifest changed under us.
    NotExist,

    /// A lock file already exists; a concurrent writer holds the database
    Lock,

    /// The stack's manifest changed since it was last loaded; reload and retry
    Outdated,

    /// Misuse of the API (unordered insert, out-of-range update index,
    /// multi-line log message, reusing a finished writer, ...)
    Api(&'static str),

    /// Compression or decompression of a log block failed
    Zlib,

    /// The writer was closed without any records added; no file is left behind
    EmptyTable,

    /// A single record does not fit into an empty block
    EntryTooBig,

    /// A ref name was rejected during write
    RefName(&'static str),

    /// A new ref path conflicts with an existing directory-shaped ref.
    ///
    /// Only surfaced by layers above this crate; present so callers share
    /// one taxonomy.
    NameConflict,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReftableError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Self::NotExist
        } else {
            Self::Io(value)
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
