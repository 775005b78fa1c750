//! Implementation of the synchronization flow described in the crate root.
//!
//! A [`SyncEngine`] owns its block source, block cache, and wallet backend
//! for the duration of a run; the `&mut self` receiver on [`SyncEngine::run`]
//! makes a second concurrent pass over the same wallet unrepresentable.
//! Observers follow a run through the engine's [`watch`] channels rather
//! than by polling it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::consensus::BlockHeight;
use crate::data_api::{BackendError, BlockCache, BlockSource, SourceError, WalletBackend};
use crate::error::SyncError;
use crate::progress::{ScanProgress, WalletSummary};
use crate::retry::{with_retry, RetryPolicy};
use crate::scanning::{ScanPriority, ScanQueue, ScanRange};
use crate::ShieldedProtocol;

/// Default limit on the number of blocks scanned in a single backend
/// invocation.
pub const DEFAULT_BATCH_SIZE: u32 = 1_000;

/// Default number of blocks rewound below a continuity failure before
/// re-verification.
pub const DEFAULT_REWIND_DISTANCE: u32 = 10;

/// Default cap on the rewind distance after escalation.
pub const DEFAULT_MAX_REORG_SIZE: u32 = 100;

/// Default age at which chain state obtained during preparation is considered
/// stale and refreshed before the next batch.
pub const DEFAULT_PREPARATION_RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// Tuning parameters for a [`SyncEngine`].
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// The maximum number of blocks scanned per backend invocation.
    /// Must be nonzero.
    pub batch_size: u32,
    /// The number of blocks rewound below a continuity failure.
    pub rewind_distance: u32,
    /// The deepest rewind the engine will perform automatically. Reorgs
    /// deeper than this surface as [`SyncError::DeepReorg`].
    pub max_reorg_size: u32,
    /// Chain state older than this is refreshed before scanning continues.
    pub preparation_restart_timeout: Duration,
    /// The retry policy applied to transient block source failures.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: DEFAULT_MAX_REORG_SIZE,
            preparation_restart_timeout: DEFAULT_PREPARATION_RESTART_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// The externally-observable state of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No pass is running and none has been started.
    Disconnected,
    /// Chain state and scan-range suggestions are being refreshed.
    Preparing,
    /// Compact blocks for the current batch are being fetched.
    Downloading,
    /// The scanning backend is processing the current batch.
    Scanning,
    /// The wallet has scanned to the chain tip.
    Synced,
    /// The pass observed a stop request and exited cleanly.
    Stopped,
    /// The pass terminated with an unrecoverable error.
    Failed(FailureKind),
}

/// A coarse classification of the error that terminated a sync pass,
/// suitable for publication on a status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Checkpoint or rewind-target misconfiguration.
    Configuration,
    /// The block source failed past its retry budget.
    Network,
    /// The block cache failed.
    Storage,
    /// The scanning backend failed in a way rewinding cannot recover.
    Scan,
    /// A chain reorganization deeper than the maximum rewind distance.
    DeepReorg,
}

impl FailureKind {
    fn for_error<WE, CE>(error: &SyncError<WE, CE>) -> Self {
        match error {
            SyncError::Checkpoint(_) => FailureKind::Configuration,
            SyncError::SubCheckpointRewind { .. } => FailureKind::Configuration,
            SyncError::Source(_) => FailureKind::Network,
            SyncError::Cache(_) => FailureKind::Storage,
            SyncError::Scan(_) => FailureKind::Scan,
            SyncError::Wallet(_) => FailureKind::Scan,
            SyncError::DeepReorg { .. } => FailureKind::DeepReorg,
        }
    }
}

/// Returns whether chain state prepared at `last_preparation_millis` is stale
/// at `now_millis` under the given limit.
///
/// The comparison is inclusive: state exactly `limit_millis` old is stale.
/// A clock running backwards never produces a negative age.
pub fn should_refresh_preparation(
    last_preparation_millis: u64,
    now_millis: u64,
    limit_millis: u64,
) -> bool {
    now_millis.saturating_sub(last_preparation_millis) >= limit_millis
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A handle that requests cooperative cancellation of a running sync pass.
///
/// Stopping is observed at batch boundaries; an in-flight batch completes
/// first. Once a stop has been requested the engine stays stopped, so
/// subsequent calls to [`SyncEngine::run`] return immediately.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests that the sync pass stop at the next batch boundary.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

enum SyncExit {
    Synced,
    Stopped,
}

/// Scans the chain until the wallet has fully scanned the chain tip,
/// recovering from chain reorganizations along the way.
pub struct SyncEngine<Client, Cache, Wallet>
where
    Wallet: WalletBackend,
{
    client: Client,
    cache: Cache,
    wallet: Wallet,
    checkpoint: Checkpoint,
    config: SyncConfig,
    queue: ScanQueue,
    stop: Arc<AtomicBool>,
    status_tx: watch::Sender<SyncStatus>,
    progress_tx: watch::Sender<ScanProgress>,
    summary_tx: watch::Sender<Option<WalletSummary<Wallet::AccountId>>>,
}

impl<Client, Cache, Wallet> SyncEngine<Client, Cache, Wallet>
where
    Client: BlockSource,
    Cache: BlockCache,
    Wallet: WalletBackend,
{
    /// Constructs a sync engine over the given collaborators.
    ///
    /// `checkpoint` establishes the floor below which the engine will never
    /// rewind; it should be the checkpoint the wallet was initialized from.
    pub fn new(
        client: Client,
        cache: Cache,
        wallet: Wallet,
        checkpoint: Checkpoint,
        config: SyncConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Disconnected);
        let (progress_tx, _) = watch::channel(ScanProgress::zero());
        let (summary_tx, _) = watch::channel(None);
        SyncEngine {
            client,
            cache,
            wallet,
            checkpoint,
            config,
            queue: ScanQueue::new(),
            stop: Arc::new(AtomicBool::new(false)),
            status_tx,
            progress_tx,
            summary_tx,
        }
    }

    /// Returns a receiver for the engine's status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Returns a receiver for scan progress updates. Progress may regress
    /// after a reorg rewind.
    pub fn subscribe_progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Returns a receiver for wallet summary snapshots, published after each
    /// scanned batch.
    pub fn subscribe_summary(&self) -> watch::Receiver<Option<WalletSummary<Wallet::AccountId>>> {
        self.summary_tx.subscribe()
    }

    /// Returns a handle with which the running pass may be stopped.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Returns a reference to the wallet backend.
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    /// Returns a reference to the block cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Runs the sync loop to convergence.
    ///
    /// Returns `Ok(())` once the wallet has scanned to the chain tip or a
    /// stop request was observed; the terminal condition is distinguishable
    /// on the status channel. On error the corresponding
    /// [`SyncStatus::Failed`] status is published before the error is
    /// returned.
    pub async fn run(&mut self) -> Result<(), SyncError<Wallet::Error, Cache::Error>> {
        let result = self.sync_to_tip().await;
        match &result {
            Ok(SyncExit::Synced) => {
                info!("Sync complete");
                self.status_tx.send_replace(SyncStatus::Synced);
            }
            Ok(SyncExit::Stopped) => {
                info!("Sync stopped by request");
                self.status_tx.send_replace(SyncStatus::Stopped);
            }
            Err(e) => {
                warn!("Sync failed: {}", e);
                self.status_tx
                    .send_replace(SyncStatus::Failed(FailureKind::for_error(e)));
            }
        }
        result.map(|_| ())
    }

    /// Rewinds wallet and cache state to the given height and schedules
    /// re-verification of everything above it.
    ///
    /// Rewinding below the checkpoint height is refused: state below the
    /// checkpoint cannot be rebuilt from local data.
    pub async fn rewind_to_height(
        &mut self,
        height: BlockHeight,
    ) -> Result<(), SyncError<Wallet::Error, Cache::Error>> {
        if height < self.checkpoint.height() {
            return Err(SyncError::SubCheckpointRewind {
                requested: height,
                checkpoint: self.checkpoint.height(),
            });
        }
        self.rewind(height).await?;
        if let Some(summary) = self.wallet.get_wallet_summary().map_err(SyncError::Wallet)? {
            let tip = summary.chain_tip_height();
            if height < tip {
                self.queue
                    .requeue(ScanRange::from_parts(height..tip + 1, ScanPriority::Verify));
            }
        }
        Ok(())
    }

    async fn sync_to_tip(&mut self) -> Result<SyncExit, SyncError<Wallet::Error, Cache::Error>> {
        let limit_millis = self.config.preparation_restart_timeout.as_millis() as u64;
        let mut chain_tip = self.prepare().await?;
        let mut last_preparation = now_millis();
        // Consecutive continuity failures with no intervening successful
        // scan; governs rewind escalation.
        let mut consecutive_failures: u32 = 0;
        let mut confirmed_empty_queue = false;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(SyncExit::Stopped);
            }

            if should_refresh_preparation(last_preparation, now_millis(), limit_millis) {
                debug!("Prepared chain state is stale; refreshing");
                chain_tip = self.prepare().await?;
                last_preparation = now_millis();
            }

            let selected = match self.queue.next_range() {
                Some(range) => range.clone(),
                None => {
                    // The pending set is empty. Confirm against the source
                    // and the wallet before declaring convergence: blocks
                    // may have arrived while the last batches were scanned.
                    let tip = self.fetch_latest_height().await?;
                    let summary = self.publish_summary()?;
                    let caught_up = summary
                        .as_ref()
                        .map(|s| s.fully_scanned_height() >= tip)
                        .unwrap_or(true);
                    if caught_up || confirmed_empty_queue {
                        return Ok(SyncExit::Synced);
                    }
                    confirmed_empty_queue = true;
                    chain_tip = self.prepare().await?;
                    last_preparation = now_millis();
                    continue;
                }
            };
            confirmed_empty_queue = false;

            let batch = selected
                .truncate_end(selected.block_range().start + self.config.batch_size)
                .unwrap_or_else(|| selected.clone());

            self.status_tx.send_replace(SyncStatus::Downloading);
            self.download_blocks(&batch).await?;

            self.status_tx.send_replace(SyncStatus::Scanning);
            info!("Scanning {}", batch);
            match self.wallet.scan_blocks(batch.block_range()) {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.queue.mark_scanned(&selected, batch.block_range().end);
                    // Scanned blocks are no longer needed locally.
                    self.cache
                        .remove_range(batch.block_range())
                        .await
                        .map_err(SyncError::Cache)?;
                    self.publish_summary()?;

                    // Scanning may surface higher-priority work, e.g. a
                    // found note promoting surrounding ranges. Adopt the
                    // backend's updated suggestions when that happens.
                    let suggestions =
                        self.wallet.suggest_scan_ranges().map_err(SyncError::Wallet)?;
                    let promoted = suggestions
                        .iter()
                        .map(|r| r.priority())
                        .max()
                        .map(|p| p > batch.priority())
                        .unwrap_or(false);
                    if promoted {
                        debug!("Scan surfaced higher-priority ranges; replacing queue");
                        self.queue.replace(suggestions);
                    }
                }
                Err(BackendError::Scan(e)) if e.is_continuity_error() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= 3 {
                        return Err(SyncError::DeepReorg {
                            at_height: e.at_height(),
                        });
                    }
                    let distance = self
                        .config
                        .rewind_distance
                        .saturating_mul(1 << (consecutive_failures - 1))
                        .min(self.config.max_reorg_size);
                    let rewind_target = std::cmp::max(
                        self.checkpoint.height(),
                        e.at_height().saturating_sub(distance),
                    );
                    warn!(
                        "Chain continuity failure at height {}; rewinding to {}",
                        e.at_height(),
                        rewind_target,
                    );
                    self.rewind(rewind_target).await?;
                    self.queue.requeue(ScanRange::from_parts(
                        rewind_target..chain_tip,
                        ScanPriority::Verify,
                    ));
                }
                Err(BackendError::Scan(e)) => return Err(SyncError::Scan(e)),
                Err(BackendError::Wallet(e)) => return Err(SyncError::Wallet(e)),
            }
        }
    }

    /// Refreshes chain state: pushes subtree roots to the wallet, advances
    /// its view of the chain tip, and replaces the scan queue with the
    /// backend's current suggestions. Returns the observed tip height.
    async fn prepare(&mut self) -> Result<BlockHeight, SyncError<Wallet::Error, Cache::Error>> {
        self.status_tx.send_replace(SyncStatus::Preparing);
        info!("Preparing: refreshing chain state and scan-range suggestions");

        self.update_subtree_roots().await?;

        let tip = self.fetch_latest_height().await?;
        info!("Latest block height is {}", tip);
        self.wallet
            .update_chain_tip(tip)
            .map_err(SyncError::Wallet)?;

        // Cheap early reorg signal: if the new tip does not extend the
        // wallet's accepted chain, scanning will detect and recover from it,
        // but the operator gets warned up front.
        if self
            .wallet
            .get_wallet_summary()
            .map_err(SyncError::Wallet)?
            .is_some()
        {
            let policy = self.config.retry;
            let range = tip..tip + 1;
            let blocks = with_retry(
                &policy,
                &mut self.client,
                SourceError::is_transient,
                move |client| client.get_block_range(range.clone()),
            )
            .await?;
            if let Some(tip_block) = blocks.into_iter().next() {
                if !self
                    .wallet
                    .validate_chain_tip(&tip_block)
                    .map_err(SyncError::Wallet)?
                {
                    warn!(
                        "Chain tip at height {} does not extend the wallet's view of the chain",
                        tip,
                    );
                }
            }
        }

        let suggestions = self.wallet.suggest_scan_ranges().map_err(SyncError::Wallet)?;
        debug!("Suggested scan ranges: {:?}", suggestions);
        self.queue.replace(suggestions);

        Ok(tip)
    }

    async fn update_subtree_roots(
        &mut self,
    ) -> Result<(), SyncError<Wallet::Error, Cache::Error>> {
        for protocol in [ShieldedProtocol::Sapling, ShieldedProtocol::Orchard] {
            let policy = self.config.retry;
            let roots = with_retry(
                &policy,
                &mut self.client,
                SourceError::is_transient,
                move |client| client.get_subtree_roots(0, protocol),
            )
            .await?;
            debug!("Fetched {} {:?} subtree roots", roots.len(), protocol);
            self.wallet
                .put_subtree_roots(protocol, 0, &roots)
                .map_err(SyncError::Wallet)?;
        }
        Ok(())
    }

    async fn fetch_latest_height(
        &mut self,
    ) -> Result<BlockHeight, SyncError<Wallet::Error, Cache::Error>> {
        let policy = self.config.retry;
        let tip = with_retry(
            &policy,
            &mut self.client,
            SourceError::is_transient,
            |client| client.get_latest_height(),
        )
        .await?;
        Ok(tip)
    }

    /// Ensures the blocks for `batch` are present in the cache, fetching
    /// from the source when they are not. Verification batches always
    /// re-fetch, so that stale pre-reorg records are overwritten.
    async fn download_blocks(
        &mut self,
        batch: &ScanRange,
    ) -> Result<(), SyncError<Wallet::Error, Cache::Error>> {
        if batch.priority() != ScanPriority::Verify && self.is_cached(batch)? {
            debug!("Serving {} from cache", batch);
            return Ok(());
        }

        info!("Fetching {}", batch);
        let policy = self.config.retry;
        let range = batch.block_range().clone();
        let blocks = with_retry(
            &policy,
            &mut self.client,
            SourceError::is_transient,
            move |client| client.get_block_range(range.clone()),
        )
        .await?;
        let committed = self
            .cache
            .write_blocks(blocks)
            .await
            .map_err(SyncError::Cache)?;
        debug!("Cached {} blocks for {}", committed, batch);
        Ok(())
    }

    fn is_cached(
        &self,
        batch: &ScanRange,
    ) -> Result<bool, SyncError<Wallet::Error, Cache::Error>> {
        let mut height = batch.block_range().start;
        while height < batch.block_range().end {
            if self
                .cache
                .find_block(height)
                .map_err(SyncError::Cache)?
                .is_none()
            {
                return Ok(false);
            }
            height = height + 1;
        }
        Ok(true)
    }

    async fn rewind(
        &mut self,
        height: BlockHeight,
    ) -> Result<(), SyncError<Wallet::Error, Cache::Error>> {
        self.cache
            .truncate_to_height(height)
            .await
            .map_err(SyncError::Cache)?;
        self.wallet
            .truncate_to_height(height)
            .map_err(SyncError::Wallet)?;
        Ok(())
    }

    fn publish_summary(
        &mut self,
    ) -> Result<Option<WalletSummary<Wallet::AccountId>>, SyncError<Wallet::Error, Cache::Error>>
    {
        let summary = self.wallet.get_wallet_summary().map_err(SyncError::Wallet)?;
        if let Some(s) = &summary {
            let progress = s
                .scan_progress()
                .map(|p| ScanProgress::clamped(p.numerator(), p.denominator()))
                .unwrap_or_else(ScanProgress::zero);
            self.progress_tx.send_replace(progress);
        }
        self.summary_tx.send_replace(summary.clone());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::{
        should_refresh_preparation, FailureKind, SyncConfig, SyncEngine, SyncStatus,
    };
    use crate::checkpoint::{Checkpoint, TreeState};
    use crate::consensus::BlockHeight;
    use crate::error::SyncError;
    use crate::retry::RetryPolicy;
    use crate::testing::{MemoryBlockCache, MockBlockSource, MockWalletBackend};

    const BIRTHDAY: u32 = 1_000_000;

    fn test_checkpoint() -> Checkpoint {
        Checkpoint::from_parts(
            BlockHeight::from_u32(BIRTHDAY),
            "0000000000a1b2c3".to_string(),
            1_687_000_000,
            TreeState::empty(),
            TreeState::empty(),
        )
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            batch_size: 25,
            retry: RetryPolicy::new(3, Duration::from_millis(1), 2),
            ..SyncConfig::default()
        }
    }

    fn test_engine(
        chain_len: u32,
    ) -> SyncEngine<MockBlockSource, MemoryBlockCache, MockWalletBackend> {
        let source = MockBlockSource::new(BlockHeight::from_u32(BIRTHDAY), chain_len);
        let cache = MemoryBlockCache::new(BlockHeight::from_u32(BIRTHDAY));
        let wallet = MockWalletBackend::new(BlockHeight::from_u32(BIRTHDAY), cache.store());
        SyncEngine::new(source, cache, wallet, test_checkpoint(), test_config())
    }

    #[tokio::test]
    async fn syncs_to_chain_tip() {
        let mut engine = test_engine(61);
        let status = engine.subscribe_status();
        let progress = engine.subscribe_progress();
        let summary = engine.subscribe_summary();

        engine.run().await.unwrap();

        assert_eq!(*status.borrow(), SyncStatus::Synced);
        assert_eq!(progress.borrow().ratio(), 1.0);
        let summary = summary.borrow().clone().unwrap();
        assert!(summary.is_synced());
        assert_eq!(
            summary.fully_scanned_height(),
            BlockHeight::from_u32(BIRTHDAY + 60)
        );
        // Scanned blocks are evicted from the cache as ranges complete.
        assert_eq!(engine.cache().block_count(), 0);
    }

    #[tokio::test]
    async fn recovers_from_shallow_reorg() {
        let mut engine = test_engine(61);
        engine.run().await.unwrap();

        // Replace the top of the chain from height +45 and extend by two
        // blocks, then sync again.
        engine.client.reorg_at(BlockHeight::from_u32(BIRTHDAY + 45));
        engine.client.extend(2);
        engine.run().await.unwrap();

        assert_eq!(*engine.subscribe_status().borrow(), SyncStatus::Synced);
        // The first continuity failure is observed at the first new block
        // (+61); the rewind lands REWIND_DISTANCE below it. The rewound
        // span still mismatches at +51, so a second, doubled rewind lands
        // at +31 and recovery succeeds from there.
        assert_eq!(
            engine.wallet().truncations(),
            &[
                BlockHeight::from_u32(BIRTHDAY + 51),
                BlockHeight::from_u32(BIRTHDAY + 31),
            ]
        );
        let accepted_tip = engine.wallet().accepted_tip().unwrap();
        assert_eq!(accepted_tip, BlockHeight::from_u32(BIRTHDAY + 62));
    }

    #[tokio::test]
    async fn rewind_target_never_drops_below_checkpoint() {
        // A reorg near the birthday would compute a rewind target below the
        // checkpoint; the target must clamp to the checkpoint height.
        let mut engine = test_engine(8);
        engine.run().await.unwrap();

        engine.client.reorg_at(BlockHeight::from_u32(BIRTHDAY + 3));
        engine.client.extend(1);
        engine.run().await.unwrap();

        assert_eq!(
            engine.wallet().truncations(),
            &[BlockHeight::from_u32(BIRTHDAY)]
        );
        assert_eq!(*engine.subscribe_status().borrow(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn deep_reorg_fails_after_escalation() {
        let mut engine = test_engine(61);
        engine.run().await.unwrap();

        // Rewrite the chain all the way down to the block above the
        // birthday. The escalated rewind (10 then 20 blocks) cannot reach
        // back past the divergence point, so the third consecutive failure
        // surfaces as a deep reorg.
        engine.client.reorg_at(BlockHeight::from_u32(BIRTHDAY + 1));
        engine.client.extend(1);
        let result = engine.run().await;

        assert_matches!(result, Err(SyncError::DeepReorg { .. }));
        assert_eq!(
            *engine.subscribe_status().borrow(),
            SyncStatus::Failed(FailureKind::DeepReorg)
        );
        // Two rewinds were attempted before giving up.
        assert_eq!(engine.wallet().truncations().len(), 2);
    }

    #[tokio::test]
    async fn transient_source_failures_are_retried() {
        let mut engine = test_engine(30);
        engine.client.fail_next_requests(2);

        engine.run().await.unwrap();
        assert_eq!(*engine.subscribe_status().borrow(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn stop_request_halts_the_pass() {
        let mut engine = test_engine(61);
        engine.stop_handle().stop();

        engine.run().await.unwrap();
        assert_eq!(*engine.subscribe_status().borrow(), SyncStatus::Stopped);
        // Nothing was scanned.
        assert!(engine.wallet().accepted_tip().is_none());
    }

    #[tokio::test]
    async fn stale_preparation_is_refreshed_between_batches() {
        let mut engine = test_engine(61);
        engine.config.preparation_restart_timeout = Duration::ZERO;

        engine.run().await.unwrap();

        // 61 blocks at batch size 25 is three batches; with a zero timeout
        // every batch boundary re-prepares in addition to the initial
        // preparation and the convergence check.
        assert!(engine.client.latest_height_calls() > 3);
        assert_eq!(*engine.subscribe_status().borrow(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn rewind_below_checkpoint_is_refused() {
        let mut engine = test_engine(61);
        let result = engine
            .rewind_to_height(BlockHeight::from_u32(BIRTHDAY - 1))
            .await;
        assert_matches!(
            result,
            Err(SyncError::SubCheckpointRewind { requested, checkpoint })
                if requested == BlockHeight::from_u32(BIRTHDAY - 1)
                    && checkpoint == BlockHeight::from_u32(BIRTHDAY)
        );
    }

    #[tokio::test]
    async fn manual_rewind_triggers_reverification() {
        let mut engine = test_engine(61);
        engine.run().await.unwrap();

        engine
            .rewind_to_height(BlockHeight::from_u32(BIRTHDAY + 40))
            .await
            .unwrap();
        assert_eq!(
            engine.wallet().truncations(),
            &[BlockHeight::from_u32(BIRTHDAY + 40)]
        );

        engine.run().await.unwrap();
        assert_eq!(*engine.subscribe_status().borrow(), SyncStatus::Synced);
        assert_eq!(
            engine.wallet().accepted_tip().unwrap(),
            BlockHeight::from_u32(BIRTHDAY + 60)
        );
    }

    #[test]
    fn preparation_gate_is_inclusive_of_the_limit() {
        assert!(should_refresh_preparation(1_000, 2_000, 1_000));
        assert!(should_refresh_preparation(1_000, 2_500, 1_000));
        assert!(!should_refresh_preparation(1_000, 1_999, 1_000));
        // A clock stepping backwards must not underflow.
        assert!(!should_refresh_preparation(2_000, 1_000, 1_000));
        assert!(should_refresh_preparation(2_000, 1_000, 0));
    }
}
