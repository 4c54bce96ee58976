//! Bounded replay buffer of raw terminal output.
//!
//! Bytes are stored exactly as the terminal produced them, escape sequences
//! included; nothing is line-parsed. Chunks are kept as `Bytes` so appending
//! the chunk that is also travelling through the output pipeline shares its
//! allocation instead of copying it.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub data: Bytes,
    /// Sequence number of the newest chunk contained in `data` (0 when empty).
    pub last_seq: u64,
}

#[derive(Debug)]
pub struct SnapshotBuffer {
    capacity: usize,
    inner: Mutex<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    chunks: VecDeque<Bytes>,
    len: usize,
    last_seq: u64,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Ring::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `chunk`, evicting the oldest bytes once over capacity.
    pub fn push(&self, seq: u64, chunk: &Bytes) {
        let mut guard = self.inner.lock();
        let ring = &mut *guard;
        ring.last_seq = ring.last_seq.max(seq);
        if chunk.is_empty() {
            return;
        }

        if chunk.len() >= self.capacity {
            ring.chunks.clear();
            ring.chunks
                .push_back(chunk.slice(chunk.len() - self.capacity..));
            ring.len = self.capacity;
            return;
        }

        ring.chunks.push_back(chunk.clone());
        ring.len += chunk.len();

        let mut excess = ring.len.saturating_sub(self.capacity);
        while excess > 0 {
            let Some(front) = ring.chunks.front_mut() else {
                break;
            };
            if front.len() <= excess {
                excess -= front.len();
                ring.len -= front.len();
                ring.chunks.pop_front();
            } else {
                *front = front.slice(excess..);
                ring.len -= excess;
                excess = 0;
            }
        }
    }

    /// Copies the current contents; the buffer itself is left untouched.
    pub fn snapshot(&self) -> Snapshot {
        let ring = self.inner.lock();
        let mut data = BytesMut::with_capacity(ring.len);
        for chunk in &ring.chunks {
            data.extend_from_slice(chunk);
        }
        Snapshot {
            data: data.freeze(),
            last_seq: ring.last_seq,
        }
    }
}
