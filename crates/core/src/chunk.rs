//! Chunked payload codecs and reassembly
//!
//! Chat messages travel over the room data channel as JSON slices:
//! `{"id": <group>, "last": <bool>, "payload": <text slice>}`.
//!
//! Attachments travel over the main channel as binary frames with a
//! three byte header:
//!
//! ```text
//! [command: u8][slot id: u8][end flag: u8][payload ...]
//! ```
//!
//! Slices of one group arrive in send order, so the receiver appends them as
//! they come and concatenates once the last slice is seen.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default slice size for chat text, in bytes
pub const DEFAULT_CHAT_CHUNK_SIZE: usize = 16 * 1024;

/// Default slice size for attachment data, in bytes
pub const DEFAULT_ATTACHMENT_CHUNK_SIZE: usize = 64 * 1024;

/// Size of the binary attachment header
pub const ATTACHMENT_HEADER_LEN: usize = 3;

/// One slice of a chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub last: bool,
    pub payload: String,
}

impl ChatChunk {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Split `text` into slices of at most `chunk_size` bytes.
///
/// Slices end on character boundaries. A slice holds at least one character
/// even when that character is wider than `chunk_size`. Empty text yields a
/// single empty last slice.
pub fn split_text(group_id: &str, text: &str, chunk_size: usize) -> Vec<ChatChunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(text.len() / chunk_size + 1);
    let mut rest = text;
    loop {
        let mut end = rest.len().min(chunk_size);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 && !rest.is_empty() {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(ChatChunk {
            id: group_id.to_string(),
            last: tail.is_empty(),
            payload: head.to_string(),
        });
        if tail.is_empty() {
            break;
        }
        rest = tail;
    }
    chunks
}

/// Attachment frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttachmentCommand {
    /// A slice of attachment data
    Data = 1,
    /// Abort the transfer on this slot and drop buffered data
    Cancel = 2,
}

impl TryFrom<u8> for AttachmentCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AttachmentCommand::Data),
            2 => Ok(AttachmentCommand::Cancel),
            other => Err(Error::Chunk(format!("unknown attachment command {}", other))),
        }
    }
}

/// One binary attachment frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentChunk {
    pub command: AttachmentCommand,
    pub slot_id: u8,
    pub last: bool,
    pub payload: Vec<u8>,
}

impl AttachmentChunk {
    pub fn cancel(slot_id: u8) -> Self {
        Self {
            command: AttachmentCommand::Cancel,
            slot_id,
            last: true,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ATTACHMENT_HEADER_LEN + self.payload.len());
        out.push(self.command as u8);
        out.push(self.slot_id);
        out.push(u8::from(self.last));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ATTACHMENT_HEADER_LEN {
            return Err(Error::Chunk(format!(
                "attachment frame too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            command: AttachmentCommand::try_from(bytes[0])?,
            slot_id: bytes[1],
            last: bytes[2] != 0,
            payload: bytes[ATTACHMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Split attachment `data` into DATA frames for `slot_id`
pub fn split_bytes(slot_id: u8, data: &[u8], chunk_size: usize) -> Vec<AttachmentChunk> {
    let chunk_size = chunk_size.max(1);
    if data.is_empty() {
        return vec![AttachmentChunk {
            command: AttachmentCommand::Data,
            slot_id,
            last: true,
            payload: Vec::new(),
        }];
    }
    let count = data.len().div_ceil(chunk_size);
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, slice)| AttachmentChunk {
            command: AttachmentCommand::Data,
            slot_id,
            last: i + 1 == count,
            payload: slice.to_vec(),
        })
        .collect()
}

/// Slices received so far for one group
#[derive(Debug, Default)]
struct ChunkGroup {
    slices: Vec<Vec<u8>>,
    last_seen: bool,
    /// Arrival order of the group's first slice
    seq: u64,
}

impl ChunkGroup {
    fn concat(self) -> Vec<u8> {
        debug_assert!(self.last_seen, "group concatenated before its last slice");
        let total = self.slices.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for slice in self.slices {
            out.extend_from_slice(&slice);
        }
        out
    }
}

/// Buffers slices per group until the last one arrives
#[derive(Debug)]
pub struct Reassembler<K> {
    groups: HashMap<K, ChunkGroup>,
    /// Most groups buffered at once; the oldest is evicted past it
    limit: Option<usize>,
    next_seq: u64,
}

impl<K> Reassembler<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            limit: None,
            next_seq: 0,
        }
    }

    /// A reassembler that keeps at most `limit` unfinished groups
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit.max(1)),
            ..Self::new()
        }
    }

    /// Append a slice. Returns the whole payload when `last` is set, and
    /// forgets the group.
    pub fn push(&mut self, group: K, slice: impl Into<Vec<u8>>, last: bool) -> Option<Vec<u8>> {
        if last {
            let mut buffered = self.groups.remove(&group).unwrap_or_default();
            buffered.slices.push(slice.into());
            buffered.last_seen = true;
            return Some(buffered.concat());
        }
        if !self.groups.contains_key(&group) {
            self.evict_oldest();
        }
        let next_seq = &mut self.next_seq;
        let buffered = self.groups.entry(group).or_insert_with(|| {
            let seq = *next_seq;
            *next_seq += 1;
            ChunkGroup {
                seq,
                ..ChunkGroup::default()
            }
        });
        buffered.slices.push(slice.into());
        None
    }

    /// Make room for one more group when at the limit
    fn evict_oldest(&mut self) {
        let Some(limit) = self.limit else {
            return;
        };
        if self.groups.len() < limit {
            return;
        }
        if let Some(oldest) = self.groups.values().map(|g| g.seq).min() {
            self.groups.retain(|_, g| g.seq != oldest);
            tracing::debug!(limit, "Evicted oldest unfinished chunk group");
        }
    }

    /// Drop everything buffered for `group`. Returns whether it existed.
    pub fn cancel(&mut self, group: &K) -> bool {
        self.groups.remove(group).is_some()
    }

    /// Bytes buffered for `group`
    pub fn buffered(&self, group: &K) -> usize {
        self.groups
            .get(group)
            .map_or(0, |g| g.slices.iter().map(Vec::len).sum())
    }

    /// Number of groups still waiting for their last slice
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

impl<K> Default for Reassembler<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
