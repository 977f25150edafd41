//! # Canonical Chain View
//!
//! [`SimpleChain`] is everything the organizer needs from storage: read
//! the canonical chain, push a block on top, pop the top block off.
//! [`BlockChain`] implements it over a [`DataBase`].
//!
//! The database keeps entries that are no longer canonical (a popped block
//! stays reachable by hash when `retain_unlinked_blocks` is set, and a
//! crash between pop steps can strand transaction rows). Every lookup here
//! therefore confirms against the height index before answering.

use std::path::Path;

use tracing::info;

use crate::chain::{Block, Header, OutPoint, Transaction};
use crate::config::Settings;
use crate::crypto::Hash;
use crate::database::{DataBase, DataBaseStats, DbError, DbResult};

/// A confirmed transaction and where it sits in the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTransaction {
    pub transaction: Transaction,
    pub height: u64,
    pub position: u32,
}

pub trait SimpleChain: Send + Sync {
    /// Height of the highest block, `None` for an empty chain.
    fn top(&self) -> DbResult<Option<u64>>;

    fn fetch_header(&self, height: u64) -> DbResult<Option<Header>>;

    fn fetch_block(&self, height: u64) -> DbResult<Option<Block>>;

    /// The block and its height, if `hash` is on the canonical chain.
    fn fetch_block_by_hash(&self, hash: &Hash) -> DbResult<Option<(Block, u64)>>;

    /// Height of `hash`, if it is on the canonical chain.
    fn fetch_height(&self, hash: &Hash) -> DbResult<Option<u64>>;

    fn fetch_transaction(&self, hash: &Hash) -> DbResult<Option<ChainTransaction>>;

    /// Height of the canonical transaction spending `outpoint`.
    fn fetch_spender_height(&self, outpoint: &OutPoint) -> DbResult<Option<u64>>;

    fn push(&self, block: &Block, height: u64) -> DbResult<()>;

    fn pop(&self) -> DbResult<Block>;

    /// Pop every block above `fork_height`. Returned oldest first.
    fn pop_from(&self, fork_height: u64) -> DbResult<Vec<Block>> {
        let mut popped = Vec::new();
        while let Some(top) = self.top()? {
            if top <= fork_height {
                break;
            }
            popped.push(self.pop()?);
        }
        popped.reverse();
        Ok(popped)
    }
}

// ---------------------------------------------------------------------------
// BlockChain
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BlockChain {
    db: DataBase,
}

impl BlockChain {
    /// Create a database in `directory` holding only the genesis block.
    pub fn create<P: AsRef<Path>>(directory: P, settings: &Settings) -> DbResult<Self> {
        let db = DataBase::create(directory, settings)?;
        let genesis = settings.genesis_block();
        db.push(&genesis, 0)?;
        info!(hash = %genesis.hash_hex(), network = %settings.network, "stored genesis block");
        Ok(Self { db })
    }

    pub fn open<P: AsRef<Path>>(directory: P, settings: &Settings) -> DbResult<Self> {
        let db = DataBase::open(directory, settings)?;
        if db.blocks.top()?.is_none() {
            return Err(DbError::Empty);
        }
        Ok(Self { db })
    }

    pub fn database(&self) -> &DataBase {
        &self.db
    }

    /// Whether the index entry at `height` is the block stored at `offset`.
    fn is_canonical_at(&self, height: u64, offset: u64) -> DbResult<bool> {
        Ok(self
            .db
            .blocks
            .get_by_height(height)?
            .is_some_and(|result| result.offset() == offset))
    }

    pub fn stop(&self) {
        self.db.stop()
    }

    pub fn close(&self) -> DbResult<()> {
        self.db.close()
    }

    pub fn statinfo(&self) -> DataBaseStats {
        self.db.statinfo()
    }
}

impl SimpleChain for BlockChain {
    fn top(&self) -> DbResult<Option<u64>> {
        self.db.blocks.top()
    }

    fn fetch_header(&self, height: u64) -> DbResult<Option<Header>> {
        match self.db.blocks.get_by_height(height)? {
            Some(result) => Ok(Some(result.header()?)),
            None => Ok(None),
        }
    }

    fn fetch_block(&self, height: u64) -> DbResult<Option<Block>> {
        let Some(result) = self.db.blocks.get_by_height(height)? else {
            return Ok(None);
        };
        let mut transactions = Vec::with_capacity(result.transaction_count()?);
        for hash in result.transaction_hashes()? {
            let tx = self.db.transactions.get(&hash)?.ok_or_else(|| {
                DbError::Corrupt(format!(
                    "block {height} lists missing transaction {}",
                    hex::encode(hash)
                ))
            })?;
            transactions.push(tx.transaction()?);
        }
        Ok(Some(Block {
            header: result.header()?,
            transactions,
            signature: result.signature()?,
        }))
    }

    fn fetch_block_by_hash(&self, hash: &Hash) -> DbResult<Option<(Block, u64)>> {
        match self.fetch_height(hash)? {
            Some(height) => Ok(self.fetch_block(height)?.map(|block| (block, height))),
            None => Ok(None),
        }
    }

    fn fetch_height(&self, hash: &Hash) -> DbResult<Option<u64>> {
        let Some(result) = self.db.blocks.get_by_hash(hash)? else {
            return Ok(None);
        };
        let height = result.height()?;
        if self.is_canonical_at(height, result.offset())? {
            Ok(Some(height))
        } else {
            Ok(None)
        }
    }

    fn fetch_transaction(&self, hash: &Hash) -> DbResult<Option<ChainTransaction>> {
        let Some(result) = self.db.transactions.get(hash)? else {
            return Ok(None);
        };
        let height = result.height()?;
        let position = result.position()?;
        let confirmed = match self.db.blocks.get_by_height(height)? {
            Some(block) => block.transaction_hash(position as usize)?.as_ref() == Some(hash),
            None => false,
        };
        if !confirmed {
            return Ok(None);
        }
        Ok(Some(ChainTransaction {
            transaction: result.transaction()?,
            height,
            position,
        }))
    }

    fn fetch_spender_height(&self, outpoint: &OutPoint) -> DbResult<Option<u64>> {
        match self.db.spends.get(outpoint)? {
            Some(spender) => Ok(self
                .fetch_transaction(&spender.hash)?
                .map(|confirmed| confirmed.height)),
            None => Ok(None),
        }
    }

    fn push(&self, block: &Block, height: u64) -> DbResult<()> {
        self.db.push(block, height)
    }

    fn pop(&self) -> DbResult<Block> {
        self.db.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Script, TxInput, TxOutput};

    fn child(parent: &Block, height: u64, transactions: Vec<Transaction>) -> Block {
        let mut block = Block::new(
            Header {
                version: 1,
                previous_block_hash: parent.hash(),
                merkle: [0u8; 32],
                timestamp: parent.header.timestamp + 1,
                bits: parent.header.bits,
                nonce: height,
                number: height,
            },
            transactions,
        );
        block.header.merkle = block.generate_merkle_root();
        block
    }

    fn coinbase(height: u64) -> Transaction {
        Transaction::coinbase(height, b"", vec![TxOutput::new(10, Script::empty())])
    }

    #[test]
    fn create_stores_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::regtest();
        let chain = BlockChain::create(dir.path(), &settings).unwrap();
        let genesis = settings.genesis_block();
        assert_eq!(chain.top().unwrap(), Some(0));
        assert_eq!(chain.fetch_block(0).unwrap(), Some(genesis.clone()));
        assert_eq!(chain.fetch_height(&genesis.hash()).unwrap(), Some(0));
    }

    #[test]
    fn popped_blocks_are_not_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::regtest();
        let chain = BlockChain::create(dir.path(), &settings).unwrap();
        let genesis = settings.genesis_block();
        let first_cb = coinbase(1);
        let one = child(&genesis, 1, vec![first_cb.clone()]);
        let spend = Transaction::new(
            vec![TxInput::new(OutPoint::new(first_cb.hash(), 0))],
            vec![TxOutput::new(10, Script::empty())],
        );
        let two = child(&one, 2, vec![coinbase(2), spend.clone()]);
        chain.push(&one, 1).unwrap();
        chain.push(&two, 2).unwrap();

        let spent = OutPoint::new(first_cb.hash(), 0);
        assert_eq!(chain.fetch_spender_height(&spent).unwrap(), Some(2));
        assert_eq!(chain.fetch_transaction(&spend.hash()).unwrap().unwrap().position, 1);

        let popped = chain.pop_from(1).unwrap();
        assert_eq!(popped, vec![two.clone()]);
        assert_eq!(chain.fetch_height(&two.hash()).unwrap(), None);
        assert!(chain.fetch_block_by_hash(&two.hash()).unwrap().is_none());
        assert!(chain.fetch_transaction(&spend.hash()).unwrap().is_none());
        assert_eq!(chain.fetch_spender_height(&spent).unwrap(), None);

        // Still retrievable from the raw table for a later reorg back.
        assert!(chain.database().blocks.get_by_hash(&two.hash()).unwrap().is_some());
    }

    #[test]
    fn open_requires_a_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::regtest();
        let db = DataBase::create(dir.path(), &settings).unwrap();
        db.close().unwrap();
        drop(db);
        assert!(matches!(
            BlockChain::open(dir.path(), &settings),
            Err(DbError::Empty)
        ));
    }
}
