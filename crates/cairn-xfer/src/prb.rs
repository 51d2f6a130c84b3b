//! Partially received bulk — the shared block buffer for one transfer.
//!
//! The sender wraps the whole payload in one of these; the receiver starts
//! from an empty buffer of the same geometry and fills it as packets land.
//! Several transmitters may share one buffer to send the same payload to
//! different peers, so subscribers are weak back-references: the buffer
//! fans events out to whoever is still alive and forgets the rest.

use std::sync::{Mutex, Weak};

use bitvec::prelude::{bitvec, BitVec};
use bytes::Bytes;

/// Events a transfer endpoint receives from the buffer it subscribes to.
///
/// `on_block_received` is invoked with the buffer's lock held; an
/// implementation must not call back into the buffer, only update its own
/// state and wake its own task.
pub trait BulkSubscriber: Send + Sync {
    fn on_block_received(&self, block: u32);
    fn on_aborted(&self);
}

struct PrbInner {
    present: BitVec,
    data: Vec<u8>,
    aborted: Option<String>,
    subscribers: Vec<(u64, Weak<dyn BulkSubscriber>)>,
    next_sub: u64,
}

pub struct PartiallyReceivedBulk {
    block_size: usize,
    size: u64,
    blocks: usize,
    inner: Mutex<PrbInner>,
}

impl PartiallyReceivedBulk {
    /// A buffer with the whole payload already present (the sending side).
    pub fn from_bytes(data: Bytes, block_size: usize) -> Self {
        let blocks = data.len().div_ceil(block_size);
        Self {
            block_size,
            size: data.len() as u64,
            blocks,
            inner: Mutex::new(PrbInner {
                present: bitvec![1; blocks],
                data: data.to_vec(),
                aborted: None,
                subscribers: Vec::new(),
                next_sub: 0,
            }),
        }
    }

    /// An empty buffer awaiting `size` bytes (the receiving side).
    pub fn empty(size: u64, block_size: usize) -> Self {
        let blocks = (size as usize).div_ceil(block_size);
        Self {
            block_size,
            size,
            blocks,
            inner: Mutex::new(PrbInner {
                present: bitvec![0; blocks],
                data: vec![0; size as usize],
                aborted: None,
                subscribers: Vec::new(),
                next_sub: 0,
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_count(&self) -> usize {
        self.blocks
    }

    /// Length of block `n`; only the final block may be short.
    pub fn block_len(&self, block: u32) -> usize {
        let start = block as usize * self.block_size;
        (self.size as usize - start).min(self.block_size)
    }

    // ── Subscription ─────────────────────────────────────────────────────────

    /// Snapshot the presence bitmap and subscribe in one step. Holding the
    /// lock across both means the subscriber either sees a block in the
    /// snapshot or gets its `on_block_received` — exactly one of the two.
    pub fn subscribe_with_snapshot(&self, sub: Weak<dyn BulkSubscriber>) -> (u64, BitVec) {
        let mut inner = self.inner.lock().expect("prb lock poisoned");
        let id = inner.next_sub;
        inner.next_sub += 1;
        let snapshot = inner.present.clone();
        inner.subscribers.push((id, sub));
        (id, snapshot)
    }

    pub fn subscribe(&self, sub: Weak<dyn BulkSubscriber>) -> u64 {
        self.subscribe_with_snapshot(sub).0
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("prb lock poisoned");
        inner.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("prb lock poisoned")
            .subscribers
            .len()
    }

    // ── Blocks ───────────────────────────────────────────────────────────────

    /// Snapshot of which blocks are present.
    pub fn clone_blocks_received(&self) -> BitVec {
        self.inner.lock().expect("prb lock poisoned").present.clone()
    }

    /// Store one block and fan it out to the subscribers. Duplicate and
    /// malformed blocks are dropped.
    pub fn block_received(&self, block: u32, data: &[u8]) {
        let mut inner = self.inner.lock().expect("prb lock poisoned");
        if inner.aborted.is_some() {
            tracing::trace!(block, "block after abort, dropping");
            return;
        }
        let n = block as usize;
        if n >= self.blocks {
            tracing::warn!(block, blocks = self.blocks, "block index out of range");
            return;
        }
        if inner.present[n] {
            tracing::trace!(block, "duplicate block, dropping");
            return;
        }
        if data.len() != self.block_len(block) {
            tracing::warn!(
                block,
                got = data.len(),
                want = self.block_len(block),
                "block length mismatch, dropping"
            );
            return;
        }
        let start = n * self.block_size;
        inner.data[start..start + data.len()].copy_from_slice(data);
        inner.present.set(n, true);
        // Fan out under the lock: anyone subscribing concurrently sees the
        // block in their snapshot instead.
        inner.subscribers.retain(|(_, sub)| match sub.upgrade() {
            Some(sub) => {
                sub.on_block_received(block);
                true
            }
            None => false,
        });
    }

    /// The bytes of block `n`, or None once aborted or while still absent.
    pub fn block_data(&self, block: u32) -> Option<Bytes> {
        let inner = self.inner.lock().expect("prb lock poisoned");
        let n = block as usize;
        if inner.aborted.is_some() || n >= self.blocks || !inner.present[n] {
            return None;
        }
        let start = n * self.block_size;
        Some(Bytes::copy_from_slice(
            &inner.data[start..start + self.block_len(block)],
        ))
    }

    pub fn has_whole_file(&self) -> bool {
        self.inner.lock().expect("prb lock poisoned").present.all()
    }

    pub fn received_count(&self) -> usize {
        self.inner
            .lock()
            .expect("prb lock poisoned")
            .present
            .count_ones()
    }

    /// The complete payload, once every block is present.
    pub fn whole_file(&self) -> Option<Bytes> {
        let inner = self.inner.lock().expect("prb lock poisoned");
        if inner.aborted.is_some() || !inner.present.all() {
            return None;
        }
        Some(Bytes::copy_from_slice(&inner.data))
    }

    // ── Abort ────────────────────────────────────────────────────────────────

    /// Mark the transfer dead and tell the subscribers. Idempotent; only
    /// the first reason sticks.
    pub fn abort(&self, reason: &str) {
        let subscribers: Vec<_> = {
            let mut inner = self.inner.lock().expect("prb lock poisoned");
            if inner.aborted.is_some() {
                return;
            }
            inner.aborted = Some(reason.to_string());
            inner
                .subscribers
                .iter()
                .filter_map(|(_, sub)| sub.upgrade())
                .collect()
        };
        tracing::debug!(reason, "bulk buffer aborted");
        for sub in subscribers {
            sub.on_aborted();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner
            .lock()
            .expect("prb lock poisoned")
            .aborted
            .is_some()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("prb lock poisoned")
            .aborted
            .clone()
    }
}
