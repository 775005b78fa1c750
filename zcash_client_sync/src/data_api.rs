//! Interfaces to the sync engine's external collaborators.
//!
//! Three seams are defined here:
//!
//! - [`BlockSource`]: the remote light wallet server from which compact
//!   blocks and auxiliary chain state are fetched.
//! - [`BlockCache`]: durable local storage for compact blocks between
//!   download and scanning.
//! - [`WalletBackend`]: the native scanning engine that owns the wallet
//!   database, performs trial decryption, and maintains note commitment tree
//!   state.
//!
//! The engine never assumes the wallet backend is async-safe: its methods
//! have synchronous, blocking call semantics and are invoked one at a time
//! from the sync loop.

use std::fmt;
use std::ops::Range;

use crate::block::{CompactBlock, SubtreeRoot};
use crate::checkpoint::TreeState;
use crate::consensus::BlockHeight;
use crate::progress::WalletSummary;
use crate::scanning::{ScanError, ScanRange};
use crate::ShieldedProtocol;

/// The note commitment tree states at a given block height, as attested by
/// the block source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTreeState {
    /// The height at which the tree states were taken.
    pub height: BlockHeight,
    /// The serialized Sapling note commitment tree state.
    pub sapling_tree: TreeState,
    /// The serialized Orchard note commitment tree state.
    pub orchard_tree: TreeState,
}

/// The result of submitting a transaction to the network via the block
/// source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    /// The transaction was accepted into the server's mempool.
    Accepted,
    /// The server rejected the transaction.
    Rejected {
        /// The server-reported error code.
        code: i32,
        /// The server-reported reason for rejection.
        reason: String,
    },
}

/// Errors produced by the remote block source.
#[derive(Debug)]
pub enum SourceError {
    /// The underlying transport failed (connection reset, DNS failure, ...).
    /// Transport errors are transient and eligible for retry.
    Transport(String),
    /// A request did not complete within its allotted time. Eligible for
    /// retry.
    TimedOut,
    /// The server reported an error for the request. Server errors are
    /// kind-specific and not retried.
    Server {
        /// The server-reported error code.
        code: i32,
        /// The server-reported error message.
        reason: String,
    },
}

impl SourceError {
    /// Returns whether the failed call may be retried with a fresh request.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transport(_) => true,
            SourceError::TimedOut => true,
            SourceError::Server { .. } => false,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Transport(e) => write!(f, "Block source transport error: {}", e),
            SourceError::TimedOut => write!(f, "Block source request timed out"),
            SourceError::Server { code, reason } => {
                write!(f, "Block source server error {}: {}", code, reason)
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// A remote source of compact blocks and auxiliary chain state.
///
/// Implementations typically wrap a lightwalletd gRPC client; the engine only
/// depends on this contract. Calls are made one at a time from the sync loop
/// and retried by the engine's retry policy when they fail transiently.
#[async_trait::async_trait]
pub trait BlockSource: Send {
    /// Returns the height of the latest block known to the server.
    async fn get_latest_height(&mut self) -> Result<BlockHeight, SourceError>;

    /// Fetches the compact blocks with heights in the given range, in
    /// ascending height order.
    ///
    /// The engine bounds the ranges it requests, so the entire batch is
    /// returned at once rather than streamed. The range is taken by value so
    /// that a fresh request can be issued on each retry attempt.
    async fn get_block_range(
        &mut self,
        range: Range<BlockHeight>,
    ) -> Result<Vec<CompactBlock>, SourceError>;

    /// Fetches the note commitment tree states as of the given height.
    async fn get_tree_state(&mut self, height: BlockHeight)
        -> Result<ChainTreeState, SourceError>;

    /// Fetches the note commitment subtree roots for the given pool,
    /// beginning at `start_index`.
    async fn get_subtree_roots(
        &mut self,
        start_index: u64,
        protocol: ShieldedProtocol,
    ) -> Result<Vec<SubtreeRoot>, SourceError>;

    /// Submits a serialized transaction to the network.
    async fn submit_transaction(&mut self, tx_bytes: &[u8]) -> Result<SubmitResult, SourceError>;

    /// Fetches the raw bytes of the transaction with the given ID.
    async fn fetch_transaction(&mut self, txid: [u8; 32]) -> Result<Vec<u8>, SourceError>;
}

/// Durable storage for compact blocks awaiting scanning.
///
/// Records are keyed by height; writing a record at a height that already
/// holds one replaces it (reorg recovery re-downloads and re-writes ranges).
/// Writes are atomic per record: a crash mid-write must never leave a
/// partially-readable record visible to readers. Resources held by an
/// implementation are released when it is dropped.
#[async_trait::async_trait]
pub trait BlockCache: Send {
    /// The type of errors produced by the cache.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the maximum height among stored records, or `None` if the
    /// cache is empty.
    fn get_max_cached_height(&self) -> Result<Option<BlockHeight>, Self::Error>;

    /// Returns the stored record for the given height, if any.
    fn find_block(&self, height: BlockHeight) -> Result<Option<CompactBlock>, Self::Error>;

    /// Persists the given records, returning the number committed.
    async fn write_blocks(&mut self, blocks: Vec<CompactBlock>) -> Result<usize, Self::Error>;

    /// Deletes every record with height strictly greater than `height`.
    ///
    /// Implementations must refuse to truncate below the checkpoint height
    /// they were constructed with, since wallet state below the checkpoint
    /// is unrecoverable.
    async fn truncate_to_height(&mut self, height: BlockHeight) -> Result<(), Self::Error>;

    /// Removes the records with heights in the given range, freeing space
    /// once a range has been fully scanned. Heights without records are
    /// skipped.
    async fn remove_range(&mut self, range: &Range<BlockHeight>) -> Result<(), Self::Error>;
}

/// Errors produced when driving the scanning backend over a block range.
#[derive(Debug)]
pub enum BackendError<WalletError> {
    /// An error that was produced by wallet operations in the course of
    /// scanning.
    Wallet(WalletError),
    /// The block range violated chain continuity or could not be reconciled
    /// with the note commitment tree(s) maintained by the wallet.
    Scan(ScanError),
}

impl<WE: fmt::Display> fmt::Display for BackendError<WE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Wallet(e) => {
                write!(f, "The wallet backend produced the following error: {}", e)
            }
            BackendError::Scan(e) => write!(f, "Scanning produced the following error: {}", e),
        }
    }
}

impl<WE> std::error::Error for BackendError<WE>
where
    WE: fmt::Debug + fmt::Display + std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Wallet(e) => Some(e),
            BackendError::Scan(e) => Some(e),
        }
    }
}

impl<WE> From<ScanError> for BackendError<WE> {
    fn from(e: ScanError) -> Self {
        BackendError::Scan(e)
    }
}

/// The external scanning engine that owns the wallet database.
///
/// Invocations are expensive (native trial-decryption over every shielded
/// output in a range) and must be minimized and batched; the engine calls
/// these methods synchronously, one range at a time.
pub trait WalletBackend {
    /// The type of errors produced by the wallet backend outside of
    /// scanning-specific failures.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The type used to track unique account identifiers.
    type AccountId: Clone + Send + PartialEq + Eq + std::hash::Hash;

    /// Scans the cached blocks with heights in the given range, verifying
    /// chain continuity (including continuity with the last block already
    /// accepted into wallet state) and absorbing any notes found.
    ///
    /// A continuity failure is reported as
    /// [`BackendError::Scan`] with an error identifying the violating
    /// height.
    fn scan_blocks(
        &mut self,
        range: &Range<BlockHeight>,
    ) -> Result<(), BackendError<Self::Error>>;

    /// Returns the set of block ranges that still require scanning, each
    /// tagged with a priority, in no particular order.
    fn suggest_scan_ranges(&self) -> Result<Vec<ScanRange>, Self::Error>;

    /// Notifies the wallet of the updated chain tip, extending or
    /// re-prioritizing its suggested scan ranges.
    fn update_chain_tip(&mut self, height: BlockHeight) -> Result<(), Self::Error>;

    /// Rewinds derived wallet state to the given height, discarding
    /// everything above it.
    fn truncate_to_height(&mut self, height: BlockHeight) -> Result<(), Self::Error>;

    /// Returns a snapshot of the wallet's sync state, or `None` if the
    /// wallet has not yet observed the chain.
    fn get_wallet_summary(&self) -> Result<Option<WalletSummary<Self::AccountId>>, Self::Error>;

    /// Provides note commitment subtree roots obtained from the block
    /// source, against which witnesses built from partially-scanned ranges
    /// are validated.
    fn put_subtree_roots(
        &mut self,
        protocol: ShieldedProtocol,
        start_index: u64,
        roots: &[SubtreeRoot],
    ) -> Result<(), Self::Error>;

    /// Checks whether the given candidate chain tip extends the wallet's
    /// accepted view of the chain.
    fn validate_chain_tip(&self, candidate: &CompactBlock) -> Result<bool, Self::Error>;
}
