// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::basics::{common_prefix_length, read_varint, take, write_varint};
use crate::{Error, Result};

/// Logical timestamp of a transactional update.
///
/// Monotonically non-decreasing across a stack; a record with a higher
/// update index shadows a record with the same ref name and a lower one.
pub type UpdateIndex = u64;

/// Block type tags as stored on disk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum BlockType {
    Ref,
    Obj,
    Index,
    Log,
}

impl BlockType {
    pub fn tag(self) -> u8 {
        match self {
            Self::Ref => b'r',
            Self::Obj => b'o',
            Self::Index => b'i',
            Self::Log => b'g',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'r' => Some(Self::Ref),
            b'o' => Some(Self::Obj),
            b'i' => Some(Self::Index),
            b'g' => Some(Self::Log),
            _ => None,
        }
    }
}

/// State of a single ref at one point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefRecord {
    /// Name of the ref. Keys tables by byte order.
    pub refname: String,

    /// Logical timestamp at which this value was written.
    pub update_index: UpdateIndex,

    /// The stored value.
    pub value: RefValue,
}

/// Value carried by a [`RefRecord`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RefValue {
    /// The ref was deleted; shadows values in older tables.
    Deletion,

    /// Direct value: a single object id.
    Val1(Vec<u8>),

    /// Annotated tag: the object id plus the id it peels to.
    Val2 {
        /// Object id of the tag itself
        value: Vec<u8>,

        /// Object id the annotated tag points at
        target_value: Vec<u8>,
    },

    /// Symbolic ref naming its target ref.
    Symref(String),
}

pub(crate) const REF_VALUE_DELETION: u8 = 0;
pub(crate) const REF_VALUE_VAL1: u8 = 1;
pub(crate) const REF_VALUE_VAL2: u8 = 2;
pub(crate) const REF_VALUE_SYMREF: u8 = 3;

const LOG_VALUE_DELETION: u8 = 0;
const LOG_VALUE_UPDATE: u8 = 1;

impl RefRecord {
    /// Whether this record represents a deletion.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        matches!(self.value, RefValue::Deletion)
    }

    pub(crate) fn value_type(&self) -> u8 {
        match &self.value {
            RefValue::Deletion => REF_VALUE_DELETION,
            RefValue::Val1(_) => REF_VALUE_VAL1,
            RefValue::Val2 { .. } => REF_VALUE_VAL2,
            RefValue::Symref(_) => REF_VALUE_SYMREF,
        }
    }
}

/// A single reflog entry.
///
/// Log records are keyed by `(refname, inverted update_index)` so that newer
/// entries for a given ref sort first.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Name of the ref this entry belongs to.
    pub refname: String,

    /// Logical timestamp of the update.
    pub update_index: UpdateIndex,

    /// The stored entry.
    pub value: LogValue,
}

/// Value carried by a [`LogRecord`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogValue {
    /// The log entry was deleted.
    Deletion,

    /// A recorded ref update.
    Update(LogUpdate),
}

/// The payload of a non-deleted reflog entry.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogUpdate {
    /// Object id before the update
    pub old_hash: Vec<u8>,

    /// Object id after the update
    pub new_hash: Vec<u8>,

    /// Committer name
    pub name: String,

    /// Committer email
    pub email: String,

    /// Commit time in seconds
    pub time: u64,

    /// Timezone offset in minutes
    pub tz_offset: i16,

    /// Log message
    pub message: String,
}

impl LogRecord {
    /// Whether this record represents the deletion of a log entry.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        matches!(self.value, LogValue::Deletion)
    }

    pub(crate) fn value_type(&self) -> u8 {
        match &self.value {
            LogValue::Deletion => LOG_VALUE_DELETION,
            LogValue::Update(_) => LOG_VALUE_UPDATE,
        }
    }
}

/// Maps a shortened object id to the ref blocks containing refs that point
/// at it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ObjRecord {
    /// Disambiguated prefix of the object id (2 bytes minimum)
    pub hash_prefix: Vec<u8>,

    /// Ascending file offsets of ref blocks
    pub offsets: Vec<u64>,
}

/// Points an index block at a child block via the child's last key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct IndexRecord {
    pub last_key: Vec<u8>,
    pub offset: u64,
}

/// Any record that can live in a block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Record {
    Ref(RefRecord),
    Log(LogRecord),
    Obj(ObjRecord),
    Index(IndexRecord),
}

/// Builds the sort key of a log record.
pub(crate) fn log_key(out: &mut Vec<u8>, refname: &str, update_index: UpdateIndex) {
    out.extend_from_slice(refname.as_bytes());
    out.push(0);
    out.extend_from_slice(&(u64::MAX - update_index).to_be_bytes());
}

fn parse_log_key(key: &[u8]) -> Result<(String, UpdateIndex)> {
    if key.len() < 10 {
        return Err(Error::Format("log key too short"));
    }

    let (name, tail) = key.split_at(key.len() - 9);
    if tail[0] != 0 {
        return Err(Error::Format("log key misses separator"));
    }

    let mut inverted = [0u8; 8];
    inverted.copy_from_slice(&tail[1..]);

    let refname = String::from_utf8(name.to_vec())
        .map_err(|_| Error::Format("ref name is not valid utf-8"))?;

    Ok((refname, u64::MAX - u64::from_be_bytes(inverted)))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Format("string is not valid utf-8"))
}

fn check_hash(hash: &[u8], hash_size: usize) -> Result<()> {
    if hash.len() == hash_size {
        Ok(())
    } else {
        Err(Error::Api("object id has wrong length"))
    }
}

impl Record {
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Ref(_) => BlockType::Ref,
            Self::Log(_) => BlockType::Log,
            Self::Obj(_) => BlockType::Obj,
            Self::Index(_) => BlockType::Index,
        }
    }

    /// Builds the record's sort key into `out` (cleared first).
    pub fn key(&self, out: &mut Vec<u8>) {
        out.clear();
        match self {
            Self::Ref(r) => out.extend_from_slice(r.refname.as_bytes()),
            Self::Log(l) => log_key(out, &l.refname, l.update_index),
            Self::Obj(o) => out.extend_from_slice(&o.hash_prefix),
            Self::Index(i) => out.extend_from_slice(&i.last_key),
        }
    }

    pub fn value_type(&self) -> u8 {
        match self {
            Self::Ref(r) => r.value_type(),
            Self::Log(l) => l.value_type(),
            Self::Obj(o) => {
                if o.offsets.is_empty() || o.offsets.len() >= 8 {
                    0
                } else {
                    o.offsets.len() as u8
                }
            }
            Self::Index(_) => 0,
        }
    }

    /// Appends the value payload.
    ///
    /// Ref update indices are stored relative to the table's minimum; the
    /// writer rebases them before encoding, the reader after decoding.
    pub fn encode_value(&self, out: &mut Vec<u8>, hash_size: usize) -> Result<()> {
        match self {
            Self::Ref(r) => {
                write_varint(out, r.update_index);

                match &r.value {
                    RefValue::Deletion => {}
                    RefValue::Val1(hash) => {
                        check_hash(hash, hash_size)?;
                        out.extend_from_slice(hash);
                    }
                    RefValue::Val2 {
                        value,
                        target_value,
                    } => {
                        check_hash(value, hash_size)?;
                        check_hash(target_value, hash_size)?;
                        out.extend_from_slice(value);
                        out.extend_from_slice(target_value);
                    }
                    RefValue::Symref(target) => {
                        write_varint(out, target.len() as u64);
                        out.extend_from_slice(target.as_bytes());
                    }
                }
            }

            Self::Log(l) => match &l.value {
                LogValue::Deletion => {}
                LogValue::Update(update) => {
                    check_hash(&update.old_hash, hash_size)?;
                    check_hash(&update.new_hash, hash_size)?;
                    out.extend_from_slice(&update.old_hash);
                    out.extend_from_slice(&update.new_hash);

                    write_varint(out, update.name.len() as u64);
                    out.extend_from_slice(update.name.as_bytes());
                    write_varint(out, update.email.len() as u64);
                    out.extend_from_slice(update.email.as_bytes());

                    write_varint(out, update.time);
                    out.extend_from_slice(&update.tz_offset.to_be_bytes());

                    write_varint(out, update.message.len() as u64);
                    out.extend_from_slice(update.message.as_bytes());
                }
            },

            Self::Obj(o) => {
                if o.offsets.is_empty() || o.offsets.len() >= 8 {
                    write_varint(out, o.offsets.len() as u64);
                }

                if let Some((first, rest)) = o.offsets.split_first() {
                    write_varint(out, *first);

                    let mut prev = *first;
                    for offset in rest {
                        // offsets are collected in ascending order
                        write_varint(out, offset - prev);
                        prev = *offset;
                    }
                }
            }

            Self::Index(i) => write_varint(out, i.offset),
        }

        Ok(())
    }

    /// Decodes one record given its reconstructed key and value type.
    pub fn decode(
        block_type: BlockType,
        key: &[u8],
        value_type: u8,
        reader: &mut &[u8],
        hash_size: usize,
    ) -> Result<Self> {
        match block_type {
            BlockType::Ref => {
                let refname = utf8(key)?;
                let update_index = read_varint(reader)?;

                let value = match value_type {
                    REF_VALUE_DELETION => RefValue::Deletion,
                    REF_VALUE_VAL1 => RefValue::Val1(take(reader, hash_size)?.to_vec()),
                    REF_VALUE_VAL2 => RefValue::Val2 {
                        value: take(reader, hash_size)?.to_vec(),
                        target_value: take(reader, hash_size)?.to_vec(),
                    },
                    REF_VALUE_SYMREF => {
                        let len = read_varint(reader)? as usize;
                        RefValue::Symref(utf8(take(reader, len)?)?)
                    }
                    _ => return Err(Error::Format("unknown ref value type")),
                };

                Ok(Self::Ref(RefRecord {
                    refname,
                    update_index,
                    value,
                }))
            }

            BlockType::Log => {
                let (refname, update_index) = parse_log_key(key)?;

                let value = match value_type {
                    LOG_VALUE_DELETION => LogValue::Deletion,
                    LOG_VALUE_UPDATE => {
                        let old_hash = take(reader, hash_size)?.to_vec();
                        let new_hash = take(reader, hash_size)?.to_vec();

                        let name_len = read_varint(reader)? as usize;
                        let name = utf8(take(reader, name_len)?)?;
                        let email_len = read_varint(reader)? as usize;
                        let email = utf8(take(reader, email_len)?)?;

                        let time = read_varint(reader)?;

                        let mut tz = [0u8; 2];
                        tz.copy_from_slice(take(reader, 2)?);
                        let tz_offset = i16::from_be_bytes(tz);

                        let message_len = read_varint(reader)? as usize;
                        let message = utf8(take(reader, message_len)?)?;

                        LogValue::Update(LogUpdate {
                            old_hash,
                            new_hash,
                            name,
                            email,
                            time,
                            tz_offset,
                            message,
                        })
                    }
                    _ => return Err(Error::Format("unknown log value type")),
                };

                Ok(Self::Log(LogRecord {
                    refname,
                    update_index,
                    value,
                }))
            }

            BlockType::Obj => {
                let count = if value_type == 0 {
                    read_varint(reader)? as usize
                } else {
                    usize::from(value_type)
                };

                // every position takes at least one byte
                if count > reader.len() {
                    return Err(Error::Format("obj record count exceeds block"));
                }

                let mut offsets = Vec::with_capacity(count);
                if count > 0 {
                    let mut cur = read_varint(reader)?;
                    offsets.push(cur);

                    for _ in 1..count {
                        cur += read_varint(reader)?;
                        offsets.push(cur);
                    }
                }

                Ok(Self::Obj(ObjRecord {
                    hash_prefix: key.to_vec(),
                    offsets,
                }))
            }

            BlockType::Index => Ok(Self::Index(IndexRecord {
                last_key: key.to_vec(),
                offset: read_varint(reader)?,
            })),
        }
    }
}

/// Encodes a prefix-compressed key plus its value-type bits.
///
/// At restart points, callers pass an empty `prev_key` so the full key is
/// stored.
pub(crate) fn encode_key(out: &mut Vec<u8>, prev_key: &[u8], key: &[u8], value_type: u8) {
    let prefix_len = common_prefix_length(prev_key, key);
    let suffix_len = key.len() - prefix_len;

    write_varint(out, prefix_len as u64);
    write_varint(out, ((suffix_len as u64) << 3) | u64::from(value_type & 7));
    out.extend_from_slice(&key[prefix_len..]);
}

/// Decodes a prefix-compressed key into `key`, returning the value type.
pub(crate) fn decode_key(key: &mut Vec<u8>, reader: &mut &[u8], last_key: &[u8]) -> Result<u8> {
    let prefix_len = read_varint(reader)? as usize;
    let packed = read_varint(reader)?;

    let value_type = (packed & 7) as u8;
    let suffix_len = (packed >> 3) as usize;

    if prefix_len > last_key.len() {
        return Err(Error::Format("key prefix exceeds previous key"));
    }

    key.clear();
    key.extend_from_slice(&last_key[..prefix_len]);
    key.extend_from_slice(take(reader, suffix_len)?);

    Ok(value_type)
}
