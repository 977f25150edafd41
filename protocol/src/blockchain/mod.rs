//! # Blockchain
//!
//! Everything above the databases: the chain abstraction the organizer
//! writes through, the pool of blocks waiting for a parent, consensus
//! validation, fork comparison, and the organizer itself.
//!
//! ```text
//! simple_chain.rs  — SimpleChain trait + BlockChain over DataBase
//! orphan_pool.rs   — bounded, arrival-ordered pool of unlinked blocks
//! validate.rs      — check / accept / connect a block against a context
//! strength.rs      — pluggable fork strength (default: cumulative work)
//! subscriber.rs    — reorganization notifications
//! organizer.rs     — fork choice and reorganization
//! ```

pub mod organizer;
pub mod orphan_pool;
pub mod simple_chain;
pub mod strength;
pub mod subscriber;
pub mod validate;

pub use organizer::{AddOutcome, Organizer, OrganizerError};
pub use orphan_pool::OrphanPool;
pub use simple_chain::{BlockChain, ChainTransaction, SimpleChain};
pub use strength::{ChainLength, CumulativeWork, ForkStrength};
pub use subscriber::{Reorganization, ReorganizeEvent, Subscriber, Subscription, SubscriptionId};
pub use validate::{check_transaction, BlockError, BlockValidator, ChainContext, ValidationError};
