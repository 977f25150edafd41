// Copyright (c) 2026 Keel Contributors. MIT License.
// See LICENSE for details.

//! # Keel — Core Library
//!
//! A full-node chain store and block organizer. Blocks arrive in any order
//! from any number of producers; the organizer validates them, picks the
//! strongest fork, and reorganizes a crash-consistent on-disk chain to
//! match.
//!
//! ## Architecture
//!
//! Layers, leaves first:
//!
//! - **storage** — memory-mapped files, record/slab allocators, persistent
//!   hash tables and multimaps. Knows nothing about blocks.
//! - **chain** — blocks, transactions, scripts, canonical encoding and
//!   proof-of-work arithmetic.
//! - **crypto** — hashing and Ed25519 keys.
//! - **database** — block, transaction, spend, history, account, asset and
//!   DID tables, and the `DataBase` that writes them in a fixed order.
//! - **blockchain** — the `SimpleChain` abstraction, orphan pool, block
//!   validation and the organizer.
//! - **config** — consensus constants and per-network `Settings`.
//!
//! ## Design Philosophy
//!
//! 1. The disk is the source of truth. Every step that matters is synced
//!    before the next one starts.
//! 2. One writer. Any thread may add blocks, only the organizer mutates
//!    the chain.
//! 3. Not-found is `None`, never an error.

pub mod blockchain;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod database;
pub mod storage;
