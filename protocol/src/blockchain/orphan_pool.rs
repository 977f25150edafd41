//! # Orphan Pool
//!
//! Blocks that are not (yet) on the canonical chain, held in arrival
//! order. The organizer builds fork candidates out of this pool: a block's
//! ancestors are traced backwards through it, its descendants forwards.
//!
//! The pool is bounded. When full, the oldest block is evicted to make
//! room. Hashes the organizer found invalid are remembered (up to
//! [`MAX_INVALID_HASHES`](crate::config::MAX_INVALID_HASHES)) so neither
//! they nor their children can be re-added.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::chain::Block;
use crate::config::MAX_INVALID_HASHES;
use crate::crypto::Hash;

#[derive(Debug)]
struct PoolEntry {
    hash: Hash,
    block: Arc<Block>,
    /// Already considered by the organizer.
    processed: bool,
    /// Arrival order. Never reused, so it survives removals.
    sequence: u64,
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Oldest first.
    entries: VecDeque<PoolEntry>,
    next_sequence: u64,
    invalid: HashSet<Hash>,
    invalid_order: VecDeque<Hash>,
}

impl PoolInner {
    fn position(&self, hash: &Hash) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.hash == hash)
    }

    fn remember_invalid(&mut self, hash: Hash) {
        if self.invalid.insert(hash) {
            self.invalid_order.push_back(hash);
            if self.invalid_order.len() > MAX_INVALID_HASHES {
                if let Some(oldest) = self.invalid_order.pop_front() {
                    self.invalid.remove(&oldest);
                }
            }
        }
    }

    fn insert(&mut self, block: Arc<Block>, processed: bool, capacity: usize) -> bool {
        let hash = block.hash();
        if self.position(&hash).is_some()
            || self.invalid.contains(&hash)
            || self.invalid.contains(&block.header.previous_block_hash)
        {
            return false;
        }
        while capacity > 0 && self.entries.len() >= capacity {
            if let Some(evicted) = self.entries.pop_front() {
                debug!(hash = %hex::encode(evicted.hash), "evicted oldest orphan");
            }
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push_back(PoolEntry {
            hash,
            block,
            processed,
            sequence,
        });
        true
    }
}

pub struct OrphanPool {
    inner: RwLock<PoolInner>,
    capacity: usize,
}

impl fmt::Debug for OrphanPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanPool")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            capacity,
        }
    }

    /// Add an unprocessed block. `false` if it is already pooled or known
    /// to be invalid (directly or through its parent).
    pub fn add(&self, block: Arc<Block>) -> bool {
        let added = self.inner.write().insert(block, false, self.capacity);
        if added {
            debug!(len = self.len(), "orphan added");
        }
        added
    }

    /// Add a block the organizer has already seen, typically one just
    /// replaced by a reorganization. It stays available as a fork base but
    /// is not a candidate on its own.
    pub fn add_processed(&self, block: Arc<Block>) -> bool {
        self.inner.write().insert(block, true, self.capacity)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().position(hash).is_some()
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Block>> {
        let inner = self.inner.read();
        inner.position(hash).map(|i| Arc::clone(&inner.entries[i].block))
    }

    pub fn is_invalid(&self, hash: &Hash) -> bool {
        self.inner.read().invalid.contains(hash)
    }

    /// Pooled blocks whose parent is `hash`, in arrival order.
    pub fn children(&self, hash: &Hash) -> Vec<Arc<Block>> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|entry| &entry.block.header.previous_block_hash == hash)
            .map(|entry| Arc::clone(&entry.block))
            .collect()
    }

    /// The block `hash` and its pooled ancestors, oldest first. Empty if
    /// `hash` is not pooled.
    pub fn trace(&self, hash: &Hash) -> Vec<Arc<Block>> {
        let inner = self.inner.read();
        let mut chain = Vec::new();
        let mut cursor = *hash;
        while let Some(index) = inner.position(&cursor) {
            let block = Arc::clone(&inner.entries[index].block);
            cursor = block.header.previous_block_hash;
            chain.push(block);
            // A pool is acyclic unless hashes collide; stop regardless.
            if chain.len() > inner.entries.len() {
                break;
            }
        }
        chain.reverse();
        chain
    }

    /// Blocks the organizer has not looked at, in arrival order.
    pub fn unprocessed(&self) -> Vec<Arc<Block>> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|entry| !entry.processed)
            .map(|entry| Arc::clone(&entry.block))
            .collect()
    }

    /// Arrival sequence of `hash`, lower is older.
    pub fn arrival(&self, hash: &Hash) -> Option<u64> {
        let inner = self.inner.read();
        inner.position(hash).map(|i| inner.entries[i].sequence)
    }

    pub fn mark_processed(&self, hash: &Hash) {
        let mut inner = self.inner.write();
        if let Some(index) = inner.position(hash) {
            inner.entries[index].processed = true;
        }
    }

    pub fn remove(&self, hash: &Hash) -> Option<Arc<Block>> {
        let mut inner = self.inner.write();
        let index = inner.position(hash)?;
        inner.entries.remove(index).map(|entry| entry.block)
    }

    /// Remove `hash` and every pooled descendant, and refuse them from now
    /// on. Returns the number of blocks dropped from the pool.
    pub fn invalidate(&self, hash: &Hash) -> usize {
        let mut inner = self.inner.write();
        let mut pending = vec![*hash];
        let mut dropped = 0;
        while let Some(current) = pending.pop() {
            inner.remember_invalid(current);
            if let Some(index) = inner.position(&current) {
                inner.entries.remove(index);
                dropped += 1;
            }
            pending.extend(
                inner
                    .entries
                    .iter()
                    .filter(|entry| entry.block.header.previous_block_hash == current)
                    .map(|entry| entry.hash),
            );
        }
        dropped
    }

    /// Drop from `inventory` every hash already pooled.
    pub fn filter(&self, inventory: &mut Vec<Hash>) {
        let inner = self.inner.read();
        inventory.retain(|hash| inner.position(hash).is_none());
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Header;

    fn block(parent: Hash, nonce: u64) -> Arc<Block> {
        Arc::new(Block::new(
            Header {
                version: 1,
                previous_block_hash: parent,
                merkle: [0u8; 32],
                timestamp: 0,
                bits: 0x207fffff,
                nonce,
                number: 0,
            },
            vec![],
        ))
    }

    #[test]
    fn duplicates_are_rejected() {
        let pool = OrphanPool::new(10);
        let a = block([0u8; 32], 1);
        assert!(pool.add(Arc::clone(&a)));
        assert!(!pool.add(a));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn oldest_is_evicted_at_capacity() {
        let pool = OrphanPool::new(2);
        let a = block([0u8; 32], 1);
        let b = block([0u8; 32], 2);
        let c = block([0u8; 32], 3);
        pool.add(Arc::clone(&a));
        pool.add(Arc::clone(&b));
        pool.add(Arc::clone(&c));
        assert!(!pool.contains(&a.hash()));
        assert!(pool.contains(&b.hash()));
        assert!(pool.contains(&c.hash()));
    }

    #[test]
    fn trace_and_children() {
        let pool = OrphanPool::new(10);
        let a = block([9u8; 32], 1);
        let b = block(a.hash(), 2);
        let c = block(b.hash(), 3);
        let c2 = block(b.hash(), 4);
        for blk in [&c, &a, &c2, &b] {
            pool.add(Arc::clone(blk));
        }

        let traced: Vec<Hash> = pool.trace(&c.hash()).iter().map(|b| b.hash()).collect();
        assert_eq!(traced, vec![a.hash(), b.hash(), c.hash()]);
        let children: Vec<Hash> = pool.children(&b.hash()).iter().map(|b| b.hash()).collect();
        assert_eq!(children, vec![c.hash(), c2.hash()]);
        assert!(pool.trace(&[1u8; 32]).is_empty());
    }

    #[test]
    fn processed_blocks_are_not_candidates() {
        let pool = OrphanPool::new(10);
        let a = block([0u8; 32], 1);
        let b = block([0u8; 32], 2);
        pool.add(Arc::clone(&a));
        pool.add_processed(Arc::clone(&b));
        pool.mark_processed(&a.hash());
        assert!(pool.unprocessed().is_empty());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn invalidation_clips_descendants_and_sticks() {
        let pool = OrphanPool::new(10);
        let a = block([0u8; 32], 1);
        let b = block(a.hash(), 2);
        let c = block(b.hash(), 3);
        let other = block([0u8; 32], 4);
        for blk in [&a, &b, &c, &other] {
            pool.add(Arc::clone(blk));
        }

        assert_eq!(pool.invalidate(&b.hash()), 2);
        assert_eq!(pool.len(), 2);
        assert!(pool.is_invalid(&c.hash()));
        assert!(!pool.add(Arc::clone(&b)));
        assert!(!pool.add(block(b.hash(), 5)));
        assert!(pool.add(block(a.hash(), 6)));
    }

    #[test]
    fn arrival_order_is_stable_across_removals() {
        let pool = OrphanPool::new(2);
        let a = block([0u8; 32], 1);
        let b = block([0u8; 32], 2);
        let c = block([0u8; 32], 3);
        pool.add(Arc::clone(&a));
        pool.add(Arc::clone(&b));
        let before = pool.arrival(&b.hash()).unwrap();

        pool.remove(&a.hash());
        assert_eq!(pool.arrival(&b.hash()), Some(before));

        // Evicts `b`; the newcomer still ranks after everything seen so far.
        pool.add(Arc::clone(&a));
        pool.add(Arc::clone(&c));
        assert!(pool.arrival(&b.hash()).is_none());
        assert!(pool.arrival(&a.hash()).unwrap() > before);
        assert!(pool.arrival(&c.hash()) > pool.arrival(&a.hash()));
    }

    #[test]
    fn filter_removes_known_hashes() {
        let pool = OrphanPool::new(10);
        let a = block([0u8; 32], 1);
        pool.add(Arc::clone(&a));
        let mut inventory = vec![a.hash(), [5u8; 32]];
        pool.filter(&mut inventory);
        assert_eq!(inventory, vec![[5u8; 32]]);
    }
}
