// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Identity of the object hash used by a table.
///
/// All object ids inside a table have this hash's width, and a merged view
/// requires all constituents to agree on it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum HashId {
    /// SHA-1, 20 byte object ids (version 1 tables)
    #[default]
    Sha1,

    /// SHA-256, 32 byte object ids (version 2 tables)
    Sha256,
}

impl HashId {
    /// Width of an object id in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// 4-byte identity tag as stored in version 2 headers.
    #[must_use]
    pub fn tag(self) -> [u8; 4] {
        match self {
            Self::Sha1 => *b"sha1",
            Self::Sha256 => *b"s256",
        }
    }

    /// Format version of tables carrying this hash.
    #[must_use]
    pub fn format_version(self) -> u8 {
        match self {
            Self::Sha1 => 1,
            Self::Sha256 => 2,
        }
    }

    pub(crate) fn from_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"sha1" => Some(Self::Sha1),
            b"s256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// Options for writing tables and managing a stack.
#[derive(Clone, Debug)]
pub struct WriteOptions {
    /// Block size in bytes. Must be less than 2²⁴.
    pub block_size: u32,

    /// How often to store a complete key in each block.
    pub restart_interval: u16,

    /// Hash identity for all object ids.
    pub hash_id: HashId,

    /// Do not generate the object id → ref block index.
    pub skip_index_objects: bool,

    /// Do not pad blocks out to the block size.
    pub unpadded: bool,

    /// Copy log messages exactly. If unset, messages must be single-line and
    /// get a trailing newline appended if missing.
    pub exact_log_message: bool,

    /// Unix mode for newly created files. `None` leaves the process umask in
    /// charge; ignored on platforms without POSIX modes.
    pub default_permissions: Option<u32>,

    /// Prevent auto-compaction after commits.
    pub disable_auto_compact: bool,

    /// Geometric factor used by auto-compaction to group table sizes.
    pub auto_compaction_factor: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            block_size: 4_096,
            restart_interval: 16,
            hash_id: HashId::Sha1,
            skip_index_objects: false,
            unpadded: false,
            exact_log_message: false,
            default_permissions: None,
            disable_auto_compact: false,
            auto_compaction_factor: 2,
        }
    }
}

/// Policy for expiring reflog entries during [`crate::Stack::compact_all`].
#[derive(Copy, Clone, Debug, Default)]
pub struct LogExpiry {
    /// Drop log entries older than this timestamp (seconds); 0 disables.
    pub time: u64,

    /// Drop log entries below this update index; 0 disables.
    pub min_update_index: u64,
}
