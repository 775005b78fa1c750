//! *A chain-sync engine for shielded Zcash light clients.*
//!
//! This crate implements the client-side synchronization pipeline for wallets
//! that scan the chain via a lightwalletd-style block source: it schedules
//! prioritized scan ranges, drives compact block download into a durable
//! cache, invokes an external scanning backend over each range, detects and
//! recovers from chain reorganizations, and publishes unified sync status and
//! progress to observers.
//!
//! The engine is deliberately agnostic to the three expensive collaborators it
//! coordinates, each of which is modeled as a trait in [`data_api`]:
//!
//! - [`data_api::BlockSource`]: the remote light wallet server.
//! - [`data_api::BlockCache`]: durable storage for compact blocks awaiting
//!   scanning (see the `zcash_client_fsblockdb` crate for a filesystem-backed
//!   implementation).
//! - [`data_api::WalletBackend`]: the native trial-decryption and witness
//!   management engine that owns the wallet database.
//!
//! The top-level entry point is [`sync::SyncEngine`].

#![deny(rustdoc::broken_intra_doc_links)]

pub mod block;
pub mod checkpoint;
pub mod consensus;
pub mod data_api;
pub mod error;
pub mod progress;
pub mod retry;
pub mod scanning;
pub mod sync;

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing;

/// A value pool in the Zcash protocol to which shielded note commitments belong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShieldedProtocol {
    /// The Sapling protocol
    Sapling,
    /// The Orchard protocol
    Orchard,
}
