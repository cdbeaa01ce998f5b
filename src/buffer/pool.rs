// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-worker, size-bucketed buffer pool.
//!
//! Every [`Worker`](crate::worker::Worker) owns exactly one `BufferPool`.
//! Acquire and release are O(1), non-blocking, and thread-local: a pool is
//! never shared or accessed from more than one thread.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::{Buffer, BucketSize, Provenance};

/// How many buffers of each bucket size to pre-allocate when the pool is
/// constructed, matching spec §4.2's "pre-allocated backing store".
const PREWARM_PER_BUCKET: usize = 4;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A size-bucketed free-list pool of reusable [`Buffer`]s.
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    free_lists: [Vec<Buffer>; 4],
}

impl BufferPool {
    /// Creates a new pool with a pre-warmed free list in each bucket.
    pub fn new() -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free_lists = BucketSize::ALL.map(|bucket| {
            (0..PREWARM_PER_BUCKET)
                .map(|_| Buffer::allocate(bucket.capacity(), Provenance::Pooled { bucket, pool_id: id }))
                .collect()
        });
        BufferPool { id, free_lists }
    }

    /// This pool's identity, stamped into every `Buffer` it loans.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquires a buffer able to hold at least `requested` bytes.
    ///
    /// Never blocks. If `requested` exceeds the largest bucket, or the
    /// bucket's free list is empty and a fresh allocation fails, this
    /// surfaces as a fallback allocation (whose own failure is reported to
    /// the caller as [`AuroraError::PoolOom`](crate::error::AuroraError::PoolOom)
    /// by the caller, since allocation here cannot itself fail without
    /// aborting the process per Rust's global allocator contract).
    pub fn acquire(&mut self, requested: usize) -> Buffer {
        match BucketSize::smallest_fit(requested) {
            Some(bucket) => {
                let list = &mut self.free_lists[bucket.index()];
                list.pop().unwrap_or_else(|| {
                    Buffer::allocate(bucket.capacity(), Provenance::Pooled { bucket, pool_id: self.id })
                })
            }
            None => Buffer::allocate(requested, Provenance::Fallback { size: requested }),
        }
    }

    /// Returns a loaned buffer to its bucket's free list.
    ///
    /// # Panics
    ///
    /// Panics (in debug *and* release builds — a silent `debug_assert!` is
    /// not sufficient per spec §4.2, which calls this a programmer error
    /// that must be refused, not merely flagged in development) if `buffer`
    /// is a [`Provenance::Pooled`] buffer stamped with a different pool's
    /// id. A [`Provenance::Fallback`] buffer is simply dropped, freeing it.
    pub fn release(&mut self, buffer: Buffer) {
        match buffer.provenance() {
            Provenance::Pooled { bucket, pool_id } => {
                assert_eq!(
                    pool_id, self.id,
                    "released a pooled buffer to a pool that does not own it"
                );
                self.free_lists[bucket.index()].push(buffer);
            }
            Provenance::Fallback { .. } => {
                // Dropping frees it via the global allocator.
            }
        }
    }

    /// Total number of buffers currently sitting idle across every bucket,
    /// used by tests to assert buffer conservation (spec §8 invariant 1).
    pub fn idle_count(&self) -> usize {
        self.free_lists.iter().map(Vec::len).sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_prefers_free_list_over_fresh_allocation() {
        let mut pool = BufferPool::new();
        let before = pool.idle_count();
        let buf = pool.acquire(100);
        assert_eq!(buf.capacity(), BucketSize::Tiny.capacity());
        assert_eq!(pool.idle_count(), before - 1);
    }

    #[test]
    fn release_returns_to_free_list() {
        let mut pool = BufferPool::new();
        let buf = pool.acquire(100);
        let before = pool.idle_count();
        pool.release(buf);
        assert_eq!(pool.idle_count(), before + 1);
    }

    #[test]
    fn oversized_request_falls_back() {
        let mut pool = BufferPool::new();
        let buf = pool.acquire(1_000_000);
        assert_eq!(buf.provenance(), Provenance::Fallback { size: 1_000_000 });
        assert_eq!(buf.capacity(), 1_000_000);
    }

    #[test]
    #[should_panic(expected = "does not own it")]
    fn release_to_wrong_pool_panics() {
        let mut pool_a = BufferPool::new();
        let mut pool_b = BufferPool::new();
        let buf = pool_a.acquire(100);
        pool_b.release(buf);
    }

    #[test]
    fn conservation_across_acquire_release_cycles() {
        let mut pool = BufferPool::new();
        let baseline = pool.idle_count();
        for _ in 0..50 {
            let buf = pool.acquire(4000);
            pool.release(buf);
        }
        assert_eq!(pool.idle_count(), baseline);
    }
}
