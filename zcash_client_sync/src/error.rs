//! Error types for synchronization.

use std::fmt;

use crate::checkpoint::CheckpointError;
use crate::consensus::BlockHeight;
use crate::data_api::SourceError;
use crate::scanning::ScanError;

/// Errors that terminate a sync pass.
///
/// Errors local to a single batch (a transient network failure, a recoverable
/// continuity error) are handled inside the sync loop and never surface here;
/// every variant of this type indicates that the pass has stopped and will
/// not be retried automatically.
#[derive(Debug)]
pub enum SyncError<WalletError, CacheError> {
    /// The wallet's checkpoint could not be loaded or is malformed.
    Checkpoint(CheckpointError),
    /// A block source call failed after exhausting its retry budget, or
    /// failed with a non-retryable server error.
    Source(SourceError),
    /// The scanning backend reported an error that is not recoverable by
    /// rewinding.
    Scan(ScanError),
    /// An error produced by wallet backend operations.
    Wallet(WalletError),
    /// An error produced by the block cache.
    Cache(CacheError),
    /// Chain continuity failures recurred past the escalated rewind
    /// distance; the reorganization is deeper than the engine is willing to
    /// recover from automatically, and a full rescan is required.
    DeepReorg {
        /// The height at which the last continuity failure was observed.
        at_height: BlockHeight,
    },
    /// A rewind was requested to a height below the wallet's checkpoint.
    /// State below the checkpoint is unrecoverable, so this indicates
    /// misconfiguration rather than a transient condition.
    SubCheckpointRewind {
        /// The requested rewind height.
        requested: BlockHeight,
        /// The checkpoint height, which bounds all rewinds from below.
        checkpoint: BlockHeight,
    },
}

impl<WE: fmt::Display, CE: fmt::Display> fmt::Display for SyncError<WE, CE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Checkpoint(e) => write!(f, "Checkpoint error: {}", e),
            SyncError::Source(e) => write!(f, "Block source error: {}", e),
            SyncError::Scan(e) => write!(f, "Scan error: {}", e),
            SyncError::Wallet(e) => write!(f, "Wallet backend error: {}", e),
            SyncError::Cache(e) => write!(f, "Block cache error: {}", e),
            SyncError::DeepReorg { at_height } => write!(
                f,
                "Chain reorganization at height {} exceeds the maximum rewind distance; a full rescan is required",
                at_height,
            ),
            SyncError::SubCheckpointRewind {
                requested,
                checkpoint,
            } => write!(
                f,
                "Requested rewind to height {} is below the checkpoint at height {}",
                requested, checkpoint,
            ),
        }
    }
}

impl<WE, CE> std::error::Error for SyncError<WE, CE>
where
    WE: fmt::Debug + fmt::Display + std::error::Error + 'static,
    CE: fmt::Debug + fmt::Display + std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Checkpoint(e) => Some(e),
            SyncError::Source(e) => Some(e),
            SyncError::Scan(e) => Some(e),
            SyncError::Wallet(e) => Some(e),
            SyncError::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl<WE, CE> From<CheckpointError> for SyncError<WE, CE> {
    fn from(e: CheckpointError) -> Self {
        SyncError::Checkpoint(e)
    }
}

impl<WE, CE> From<SourceError> for SyncError<WE, CE> {
    fn from(e: SourceError) -> Self {
        SyncError::Source(e)
    }
}
