//! Fragmentation and reassembly.
//!
//! A message of `size` bytes travels as `ceil(size / part_size)` parts. Part
//! `i` covers `[i * part_size, min((i + 1) * part_size, size))`, so the
//! receiver can place every part directly at its offset and arrival order
//! does not matter.
//!
//! The receive buffer is allocated once, to the size announced by the sender,
//! and is only written through [`ReassemblyBuffer::write`], which rejects any
//! part whose index or length does not match that announcement.

use bytes::Bytes;
use warren_core::wire::part_count;

/// Largest message a transfer may announce. Bounds the allocation a remote
/// peer can trigger with one DataHeader.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Split a payload into parts of `part_size` bytes (the last may be shorter).
/// Slicing `Bytes` shares the allocation.
pub fn split(payload: &Bytes, part_size: usize) -> Vec<Bytes> {
    (0..part_count(payload.len(), part_size))
        .map(|i| {
            let start = i * part_size;
            let end = (start + part_size).min(payload.len());
            payload.slice(start..end)
        })
        .collect()
}

// ── PartSet ───────────────────────────────────────────────────────────────────

/// Fixed-size bitset over part indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSet {
    words: Vec<u64>,
    len: usize,
    count: usize,
}

impl PartSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            count: 0,
        }
    }

    /// Number of indices the set covers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of indices currently set.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Set `index`. Returns true if it was not set before.
    /// Out-of-range indices are ignored.
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / 64];
        let bit = 1u64 << (index % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.count += 1;
        true
    }

    /// Lowest index not yet set (`len` when full). Every index below it is set.
    pub fn first_missing(&self) -> usize {
        for (w, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let idx = w * 64 + word.trailing_ones() as usize;
                return idx.min(self.len);
            }
        }
        self.len
    }

    /// Indices not yet set, ascending.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| !self.contains(i))
    }

    // ── Acknowledgment encoding ──────────────────────────────────────────────

    /// Encode as `(base, bitmap)`: every index below `base` is set, and bit
    /// `j` of the bitmap (LSB first within each byte) reports `base + j`.
    /// The bitmap is truncated to `max_bytes` and has no trailing zero bytes.
    pub fn to_ack(&self, max_bytes: usize) -> (u32, Vec<u8>) {
        let base = self.first_missing();
        let span = (self.len - base).min(max_bytes * 8);
        let mut bitmap = vec![0u8; span.div_ceil(8)];
        for j in 0..span {
            if self.contains(base + j) {
                bitmap[j / 8] |= 1 << (j % 8);
            }
        }
        while bitmap.last() == Some(&0) {
            bitmap.pop();
        }
        (base as u32, bitmap)
    }

    /// Merge an acknowledgment produced by [`to_ack`](Self::to_ack).
    /// Returns how many indices became set.
    pub fn apply_ack(&mut self, base: u32, bitmap: &[u8]) -> usize {
        let before = self.count;
        let base = (base as usize).min(self.len);
        for i in 0..base {
            self.insert(i);
        }
        for (byte_idx, byte) in bitmap.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    self.insert(base + byte_idx * 8 + bit);
                }
            }
        }
        self.count - before
    }
}

// ── ReassemblyBuffer ──────────────────────────────────────────────────────────

/// Why a part was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("announced size {0} exceeds the message limit")]
    TooLarge(usize),

    #[error("part {index} is out of range for {parts} parts")]
    IndexOutOfRange { index: usize, parts: usize },

    #[error("part {index} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Outcome of writing one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartWrite {
    /// First arrival of this index.
    New,
    /// Index was already complete; bytes were overwritten in place.
    Duplicate,
}

/// Pre-sized receive buffer plus completion bitset.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
    part_size: usize,
    parts: PartSet,
}

impl ReassemblyBuffer {
    pub fn new(total_size: usize, part_size: usize) -> Result<Self, FragmentError> {
        if total_size > MAX_MESSAGE_SIZE {
            return Err(FragmentError::TooLarge(total_size));
        }
        Ok(Self {
            buf: vec![0; total_size],
            part_size,
            parts: PartSet::new(part_count(total_size, part_size)),
        })
    }

    pub fn total_size(&self) -> usize {
        self.buf.len()
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn parts(&self) -> &PartSet {
        &self.parts
    }

    /// Expected byte length of part `index`.
    fn expected_len(&self, index: usize) -> usize {
        let start = index * self.part_size;
        (self.buf.len() - start).min(self.part_size)
    }

    /// Copy `data` to the offset of part `index` and mark it complete.
    pub fn write(&mut self, index: usize, data: &[u8]) -> Result<PartWrite, FragmentError> {
        let parts = self.parts.len();
        if index >= parts {
            return Err(FragmentError::IndexOutOfRange { index, parts });
        }
        let expected = self.expected_len(index);
        if data.len() != expected {
            return Err(FragmentError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        let start = index * self.part_size;
        self.buf[start..start + expected].copy_from_slice(data);
        Ok(if self.parts.insert(index) {
            PartWrite::New
        } else {
            PartWrite::Duplicate
        })
    }

    pub fn is_complete(&self) -> bool {
        self.parts.is_full()
    }

    /// The reassembled message, only once every part has arrived.
    pub fn into_payload(self) -> Option<Bytes> {
        self.is_complete().then(|| Bytes::from(self.buf))
    }
}
