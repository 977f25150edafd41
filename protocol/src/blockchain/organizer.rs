//! # Block Organizer
//!
//! Turns a stream of blocks in arbitrary order into one canonical chain.
//!
//! ## How it works
//!
//! 1. [`add`](Organizer::add) drops a block into the orphan pool. Any
//!    number of threads may call it.
//! 2. [`organize`](Organizer::organize) runs one writer pass. For every
//!    unprocessed block it builds a fork candidate: the block's ancestors
//!    traced back through the pool to a parent on the canonical chain,
//!    extended forward through its strongest line of pooled descendants.
//! 3. The strongest candidate is validated block by block from its fork
//!    point. The first invalid block and all its descendants are dropped
//!    from the pool for good. A block failing only in bytes its hash does
//!    not cover is dropped alone, so an intact copy can still arrive.
//! 4. If the valid prefix is strictly stronger than the canonical blocks
//!    above the fork point, the chain is reorganized: the replaced blocks
//!    are popped, the fork is pushed in order, the replaced blocks go back
//!    into the pool, and subscribers are told.
//!
//! Ties go to whatever was there first: the canonical chain beats an
//! equally strong fork, and between equal candidates the one whose last
//! block arrived earliest wins.
//!
//! ## Failure
//!
//! A storage error, whether reading during validation or writing during a
//! reorganization, stops the organizer. Pops and
//! pushes are each synced before the next begins, so the persisted chain
//! is always the old tip, the fork point, or a prefix of the new fork.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use primitive_types::U256;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::simple_chain::SimpleChain;
use super::strength::{CumulativeWork, ForkStrength};
use super::subscriber::{Reorganization, ReorganizeEvent, Subscriber, Subscription, SubscriptionId};
use super::validate::{BlockError, BlockValidator, ChainContext};
use super::OrphanPool;
use crate::chain::{Block, Header, OutPoint, Transaction};
use crate::config::Settings;
use crate::crypto::Hash;
use crate::database::DbError;

// ---------------------------------------------------------------------------
// Error & Outcome Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrganizerError {
    /// The chain store failed. The organizer has stopped.
    #[error("chain store failure: {0}")]
    Store(#[from] DbError),

    #[error("organizer is stopped")]
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Queued for the next `organize` pass.
    Pooled,
    /// Already pooled or already canonical.
    Duplicate,
    /// The block, or its parent, was found invalid earlier.
    Invalid,
}

/// What happened to one fork candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decision {
    Reorganized,
    Kept,
    Pending,
}

struct Candidate {
    fork_height: u64,
    /// Oldest first, starting right above the fork point.
    blocks: Vec<Arc<Block>>,
    strength: U256,
    /// Arrival sequence of the candidate's newest block.
    completed: u64,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        self.strength > other.strength
            || (self.strength == other.strength && self.completed < other.completed)
    }
}

// ---------------------------------------------------------------------------
// Fork Context
// ---------------------------------------------------------------------------

/// The chain as it would look with `fork` applied on top of `fork_height`.
struct ForkContext<'a, C: SimpleChain> {
    chain: &'a C,
    fork_height: u64,
    fork: &'a [Arc<Block>],
}

impl<C: SimpleChain> ChainContext for ForkContext<'_, C> {
    fn fetch_header(&self, height: u64) -> Result<Option<Header>, DbError> {
        if height <= self.fork_height {
            return self.chain.fetch_header(height);
        }
        let index = (height - self.fork_height - 1) as usize;
        Ok(self.fork.get(index).map(|block| block.header))
    }

    fn fetch_transaction(&self, hash: &Hash) -> Result<Option<(Transaction, u64)>, DbError> {
        for (index, block) in self.fork.iter().enumerate().rev() {
            if let Some(tx) = block.transactions.iter().find(|tx| &tx.hash() == hash) {
                return Ok(Some((tx.clone(), self.fork_height + 1 + index as u64)));
            }
        }
        Ok(self
            .chain
            .fetch_transaction(hash)?
            .filter(|confirmed| confirmed.height <= self.fork_height)
            .map(|confirmed| (confirmed.transaction, confirmed.height)))
    }

    fn is_output_spent(&self, outpoint: &OutPoint) -> Result<bool, DbError> {
        let spent_in_fork = self.fork.iter().any(|block| {
            block
                .transactions
                .iter()
                .filter(|tx| !tx.is_coinbase())
                .flat_map(|tx| tx.inputs.iter())
                .any(|input| &input.previous_output == outpoint)
        });
        if spent_in_fork {
            return Ok(true);
        }
        Ok(self
            .chain
            .fetch_spender_height(outpoint)?
            .is_some_and(|height| height <= self.fork_height))
    }
}

// ---------------------------------------------------------------------------
// Organizer
// ---------------------------------------------------------------------------

pub struct Organizer<C: SimpleChain> {
    chain: Arc<C>,
    settings: Settings,
    pool: OrphanPool,
    strength: Box<dyn ForkStrength>,
    subscriber: Subscriber,
    stopped: AtomicBool,
    /// Held for the length of an `organize` pass.
    organizing: Mutex<()>,
}

impl<C: SimpleChain> std::fmt::Debug for Organizer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Organizer")
            .field("pool", &self.pool)
            .field("subscriber", &self.subscriber)
            .field("stopped", &self.stopped())
            .finish()
    }
}

impl<C: SimpleChain> Organizer<C> {
    /// An organizer comparing forks by cumulative work. Call
    /// [`start`](Self::start) before adding blocks.
    pub fn new(chain: Arc<C>, settings: Settings) -> Self {
        Self::with_strength(chain, settings, Box::new(CumulativeWork))
    }

    pub fn with_strength(chain: Arc<C>, settings: Settings, strength: Box<dyn ForkStrength>) -> Self {
        Self {
            pool: OrphanPool::new(settings.block_pool_capacity),
            chain,
            settings,
            strength,
            subscriber: Subscriber::new(),
            stopped: AtomicBool::new(true),
            organizing: Mutex::new(()),
        }
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        info!("organizer started");
    }

    /// Stop accepting work and tell every subscriber. A pass in progress
    /// finishes its current candidate.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.subscriber.stop();
            info!("organizer stopped");
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn pool(&self) -> &OrphanPool {
        &self.pool
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe_reorganize<F>(&self, handler: F) -> SubscriptionId
    where
        F: FnMut(&ReorganizeEvent) -> Subscription + Send + 'static,
    {
        self.subscriber.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriber.unsubscribe(id)
    }

    /// Queue `block` for the next pass.
    pub fn add(&self, block: Block) -> Result<AddOutcome, OrganizerError> {
        if self.stopped() {
            return Err(OrganizerError::Stopped);
        }
        let hash = block.hash();
        if self.pool.is_invalid(&hash) || self.pool.is_invalid(&block.header.previous_block_hash) {
            return Ok(AddOutcome::Invalid);
        }
        if self.chain.fetch_height(&hash)?.is_some() {
            return Ok(AddOutcome::Duplicate);
        }
        if self.pool.add(Arc::new(block)) {
            Ok(AddOutcome::Pooled)
        } else {
            Ok(AddOutcome::Duplicate)
        }
    }

    /// Drop from `inventory` every hash already pooled, so it is not
    /// requested again.
    pub fn filter_orphans(&self, inventory: &mut Vec<Hash>) {
        self.pool.filter(inventory);
    }

    /// Process every queued block. Returns the number of
    /// reorganizations performed.
    pub fn organize(&self) -> Result<usize, OrganizerError> {
        let _pass = self.organizing.lock();
        if self.stopped() {
            return Err(OrganizerError::Stopped);
        }
        match self.organize_pass() {
            Err(OrganizerError::Store(e)) => {
                error!(error = %e, "chain store failed during organize, stopping");
                self.stop();
                Err(OrganizerError::Store(e))
            }
            other => other,
        }
    }

    fn organize_pass(&self) -> Result<usize, OrganizerError> {
        let mut reorganizations = 0;
        while !self.stopped() {
            let queue = self.pool.unprocessed();
            if queue.is_empty() {
                break;
            }

            let mut best: Option<Candidate> = None;
            for block in &queue {
                match self.candidate(block)? {
                    Some(candidate) => {
                        if best.as_ref().map_or(true, |current| candidate.beats(current)) {
                            best = Some(candidate);
                        }
                    }
                    // Not connected yet. A later parent picks it up as a
                    // descendant.
                    None => self.pool.mark_processed(&block.hash()),
                }
            }

            let Some(candidate) = best else {
                continue;
            };
            let blocks = candidate.blocks.clone();
            match self.replace_chain(candidate)? {
                Decision::Reorganized => reorganizations += 1,
                Decision::Kept => {}
                Decision::Pending => break,
            }
            for block in &blocks {
                self.pool.mark_processed(&block.hash());
            }
        }
        Ok(reorganizations)
    }

    /// The fork through `block`, if its pooled ancestry reaches the
    /// canonical chain.
    fn candidate(&self, block: &Arc<Block>) -> Result<Option<Candidate>, OrganizerError> {
        let hash = block.hash();
        let mut blocks = self.pool.trace(&hash);
        let Some(root) = blocks.first() else {
            return Ok(None);
        };
        let Some(fork_height) = self.chain.fetch_height(&root.header.previous_block_hash)? else {
            return Ok(None);
        };

        let (extension, _) = self.strongest_extension(&hash, self.pool.len());
        blocks.extend(extension);

        let headers: Vec<Header> = blocks.iter().map(|block| block.header).collect();
        let completed = blocks
            .iter()
            .filter_map(|block| self.pool.arrival(&block.hash()))
            .max()
            .unwrap_or(0);
        Ok(Some(Candidate {
            fork_height,
            strength: self.strength.strength(&headers),
            blocks,
            completed,
        }))
    }

    /// The strongest line of pooled descendants of `hash`. Equal lines
    /// resolve to the earliest arrival.
    fn strongest_extension(&self, hash: &Hash, depth: usize) -> (Vec<Arc<Block>>, U256) {
        if depth == 0 {
            return (Vec::new(), U256::zero());
        }
        let mut best: (Vec<Arc<Block>>, U256) = (Vec::new(), U256::zero());
        for child in self.pool.children(hash) {
            let (mut line, strength) = self.strongest_extension(&child.hash(), depth - 1);
            let total = strength.saturating_add(self.strength.block_strength(&child.header));
            if best.0.is_empty() || total > best.1 {
                line.insert(0, child);
                best = (line, total);
            }
        }
        best
    }

    /// Whether `connect_block` runs for forks from `fork_height`. Blocks
    /// below the last checkpoint are pinned by hash instead.
    fn strict(&self, fork_height: u64) -> bool {
        self.settings.checkpoints.is_empty()
            || fork_height >= self.settings.last_checkpoint_height()
    }

    fn verify(
        &self,
        fork_height: u64,
        blocks: &[Arc<Block>],
        index: usize,
    ) -> Result<(), BlockError> {
        let block = &blocks[index];
        let height = fork_height + 1 + index as u64;
        let context = ForkContext {
            chain: self.chain.as_ref(),
            fork_height,
            fork: &blocks[..index],
        };

        let mut validator = BlockValidator::new(&context, &self.settings, block, height);
        validator.check_block()?;
        validator.initialize_context()?;
        validator.accept_block()?;

        if !self.strict(fork_height) {
            return Ok(());
        }

        let inputs: usize = block.transactions.iter().map(|tx| tx.inputs.len()).sum();
        let started = Instant::now();
        let result = validator.connect_block();
        let elapsed = started.elapsed();
        info!(
            height,
            transactions = block.transactions.len(),
            inputs,
            verified = result.is_ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "block verify"
        );
        result
    }

    /// Strength of the canonical blocks above `fork_height`.
    fn main_strength(&self, fork_height: u64) -> Result<U256, DbError> {
        let top = self.chain.top()?.unwrap_or(0);
        let mut headers = Vec::new();
        for height in fork_height + 1..=top {
            let header = self.chain.fetch_header(height)?.ok_or_else(|| {
                DbError::Corrupt(format!("canonical height {height} has no header"))
            })?;
            headers.push(header);
        }
        Ok(self.strength.strength(&headers))
    }

    fn replace_chain(&self, candidate: Candidate) -> Result<Decision, OrganizerError> {
        let fork_height = candidate.fork_height;
        let mut valid = Vec::with_capacity(candidate.blocks.len());

        for (index, block) in candidate.blocks.iter().enumerate() {
            match self.verify(fork_height, &candidate.blocks, index) {
                Ok(()) => valid.push(Arc::clone(block)),
                Err(BlockError::Store(e)) => return Err(OrganizerError::Store(e)),
                Err(BlockError::Invalid(e)) if e.is_transient() => {
                    debug!(hash = %block.hash_hex(), error = %e, "block left pending");
                    return Ok(Decision::Pending);
                }
                Err(BlockError::Invalid(e)) if e.is_malleable() => {
                    self.pool.remove(&block.hash());
                    warn!(
                        hash = %block.hash_hex(),
                        code = e.code(),
                        error = %e,
                        "dropped malformed copy of block"
                    );
                    break;
                }
                Err(BlockError::Invalid(e)) => {
                    let clipped = self.pool.invalidate(&block.hash());
                    warn!(
                        hash = %block.hash_hex(),
                        code = e.code(),
                        error = %e,
                        clipped,
                        "invalid block"
                    );
                    break;
                }
            }
        }

        if valid.is_empty() {
            return Ok(Decision::Kept);
        }

        let headers: Vec<Header> = valid.iter().map(|block| block.header).collect();
        let fork_strength = self.strength.strength(&headers);
        let main_strength = self.main_strength(fork_height)?;
        if fork_strength <= main_strength {
            debug!(fork_height, "insufficient strength to reorganize");
            return Ok(Decision::Kept);
        }

        let replaced = self.chain.pop_from(fork_height)?;
        if !replaced.is_empty() {
            warn!(
                fork_height,
                replaced = replaced.len(),
                arriving = valid.len(),
                "reorganizing chain"
            );
        }

        for (offset, block) in valid.iter().enumerate() {
            self.pool.remove(&block.hash());
            self.chain.push(block, fork_height + 1 + offset as u64)?;
        }

        let replaced: Vec<Arc<Block>> = replaced.into_iter().map(Arc::new).collect();
        for block in &replaced {
            self.pool.add_processed(Arc::clone(block));
        }

        info!(
            fork_height,
            top = fork_height + valid.len() as u64,
            arrivals = valid.len(),
            replaced = replaced.len(),
            "chain reorganized"
        );
        self.subscriber
            .relay(&ReorganizeEvent::Reorganized(Reorganization {
                fork_height,
                arrivals: valid,
                replaced,
            }));
        Ok(Decision::Reorganized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(strength: u64, completed: u64) -> Candidate {
        Candidate {
            fork_height: 0,
            blocks: Vec::new(),
            strength: U256::from(strength),
            completed,
        }
    }

    #[test]
    fn stronger_then_earlier_wins() {
        assert!(candidate(3, 9).beats(&candidate(2, 0)));
        assert!(candidate(2, 1).beats(&candidate(2, 4)));
        assert!(!candidate(2, 4).beats(&candidate(2, 4)));
        assert!(!candidate(1, 0).beats(&candidate(2, 9)));
    }
}
