//! In-memory implementations of the engine's collaborator traits, for use in
//! testing.
//!
//! [`MockBlockSource`] serves a deterministic fake chain that tests can
//! extend or reorganize between sync passes. [`MemoryBlockCache`] and
//! [`MockWalletBackend`] share a block store, so that the wallet "scans"
//! exactly what the engine cached, verifying hash continuity the way a real
//! scanning backend would.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::block::{BlockHash, CompactBlock, SubtreeRoot};
use crate::checkpoint::TreeState;
use crate::consensus::BlockHeight;
use crate::data_api::{
    BackendError, BlockCache, BlockSource, ChainTreeState, SourceError, SubmitResult,
    WalletBackend,
};
use crate::progress::{AccountBalance, ScanProgress, WalletSummary};
use crate::scanning::{ScanError, ScanPriority, ScanRange};
use crate::ShieldedProtocol;

/// A block store shared between a [`MemoryBlockCache`] and a
/// [`MockWalletBackend`].
pub type SharedBlocks = Arc<Mutex<BTreeMap<BlockHeight, CompactBlock>>>;

fn fake_hash(height: BlockHeight, branch: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&u32::from(height).to_le_bytes());
    bytes[4] = branch;
    BlockHash(bytes)
}

/// Constructs a fake compact block at the given height, linked to the given
/// parent hash. Blocks on different branches of a reorganized fake chain
/// receive distinct hashes.
pub fn fake_compact_block(height: BlockHeight, prev_hash: BlockHash, branch: u8) -> CompactBlock {
    let hash = fake_hash(height, branch);
    CompactBlock {
        height,
        hash,
        prev_hash,
        time: u32::from(height),
        sapling_outputs_count: 2,
        orchard_actions_count: 2,
        data: hash.0.to_vec(),
    }
}

/// A deterministic fake chain served over the [`BlockSource`] contract.
pub struct MockBlockSource {
    start: BlockHeight,
    chain: Vec<CompactBlock>,
    branch: u8,
    failures_remaining: u32,
    latest_height_calls: u32,
}

impl MockBlockSource {
    /// Constructs a fake chain of `len` blocks beginning at `start`.
    pub fn new(start: BlockHeight, len: u32) -> Self {
        let mut source = MockBlockSource {
            start,
            chain: Vec::new(),
            branch: 0,
            failures_remaining: 0,
            latest_height_calls: 0,
        };
        source.extend(len);
        source
    }

    /// The height of the last block in the fake chain.
    pub fn tip_height(&self) -> BlockHeight {
        self.start + (self.chain.len() as u32 - 1)
    }

    /// Appends `n` blocks to the fake chain.
    pub fn extend(&mut self, n: u32) {
        for _ in 0..n {
            self.push_block();
        }
    }

    /// Reorganizes the fake chain: every block at or above `height` is
    /// replaced by a block on a new branch, preserving the tip height.
    pub fn reorg_at(&mut self, height: BlockHeight) {
        let old_len = self.chain.len();
        self.branch += 1;
        let keep = (u32::from(height) - u32::from(self.start)) as usize;
        self.chain.truncate(keep);
        while self.chain.len() < old_len {
            self.push_block();
        }
    }

    /// Causes the next `n` requests (of any kind) to fail with a transient
    /// transport error.
    pub fn fail_next_requests(&mut self, n: u32) {
        self.failures_remaining = n;
    }

    /// The number of `get_latest_height` requests served so far.
    pub fn latest_height_calls(&self) -> u32 {
        self.latest_height_calls
    }

    fn push_block(&mut self) {
        let height = self.start + self.chain.len() as u32;
        let prev_hash = self
            .chain
            .last()
            .map(|block| block.hash)
            .unwrap_or(BlockHash([0; 32]));
        self.chain
            .push(fake_compact_block(height, prev_hash, self.branch));
    }

    fn maybe_fail(&mut self) -> Result<(), SourceError> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            Err(SourceError::Transport("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl BlockSource for MockBlockSource {
    async fn get_latest_height(&mut self) -> Result<BlockHeight, SourceError> {
        self.maybe_fail()?;
        self.latest_height_calls += 1;
        Ok(self.tip_height())
    }

    async fn get_block_range(
        &mut self,
        range: Range<BlockHeight>,
    ) -> Result<Vec<CompactBlock>, SourceError> {
        self.maybe_fail()?;
        Ok(self
            .chain
            .iter()
            .filter(|block| range.contains(&block.height))
            .cloned()
            .collect())
    }

    async fn get_tree_state(
        &mut self,
        height: BlockHeight,
    ) -> Result<ChainTreeState, SourceError> {
        self.maybe_fail()?;
        Ok(ChainTreeState {
            height,
            sapling_tree: TreeState::empty(),
            orchard_tree: TreeState::empty(),
        })
    }

    async fn get_subtree_roots(
        &mut self,
        _start_index: u64,
        _protocol: ShieldedProtocol,
    ) -> Result<Vec<SubtreeRoot>, SourceError> {
        self.maybe_fail()?;
        Ok(Vec::new())
    }

    async fn submit_transaction(&mut self, _tx_bytes: &[u8]) -> Result<SubmitResult, SourceError> {
        self.maybe_fail()?;
        Ok(SubmitResult::Accepted)
    }

    async fn fetch_transaction(&mut self, _txid: [u8; 32]) -> Result<Vec<u8>, SourceError> {
        self.maybe_fail()?;
        Ok(Vec::new())
    }
}

/// Errors produced by [`MemoryBlockCache`].
#[derive(Debug, PartialEq, Eq)]
pub enum MemoryCacheError {
    /// A truncation below the cache's floor height was requested.
    TruncationBelowFloor {
        requested: BlockHeight,
        floor: BlockHeight,
    },
}

impl fmt::Display for MemoryCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryCacheError::TruncationBelowFloor { requested, floor } => write!(
                f,
                "Requested truncation to height {} below the cache floor {}",
                requested, floor,
            ),
        }
    }
}

impl std::error::Error for MemoryCacheError {}

/// A [`BlockCache`] backed by an in-memory map.
pub struct MemoryBlockCache {
    store: SharedBlocks,
    floor: BlockHeight,
}

impl MemoryBlockCache {
    /// Constructs an empty cache that refuses truncation below `floor`.
    pub fn new(floor: BlockHeight) -> Self {
        MemoryBlockCache {
            store: Arc::new(Mutex::new(BTreeMap::new())),
            floor,
        }
    }

    /// Returns a handle to the underlying block store, for sharing with a
    /// [`MockWalletBackend`].
    pub fn store(&self) -> SharedBlocks {
        Arc::clone(&self.store)
    }

    /// The number of records currently in the cache.
    pub fn block_count(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl BlockCache for MemoryBlockCache {
    type Error = MemoryCacheError;

    fn get_max_cached_height(&self) -> Result<Option<BlockHeight>, Self::Error> {
        Ok(self.store.lock().unwrap().keys().next_back().copied())
    }

    fn find_block(&self, height: BlockHeight) -> Result<Option<CompactBlock>, Self::Error> {
        Ok(self.store.lock().unwrap().get(&height).cloned())
    }

    async fn write_blocks(&mut self, blocks: Vec<CompactBlock>) -> Result<usize, Self::Error> {
        let mut store = self.store.lock().unwrap();
        let count = blocks.len();
        for block in blocks {
            store.insert(block.height, block);
        }
        Ok(count)
    }

    async fn truncate_to_height(&mut self, height: BlockHeight) -> Result<(), Self::Error> {
        if height < self.floor {
            return Err(MemoryCacheError::TruncationBelowFloor {
                requested: height,
                floor: self.floor,
            });
        }
        self.store.lock().unwrap().retain(|h, _| *h <= height);
        Ok(())
    }

    async fn remove_range(&mut self, range: &Range<BlockHeight>) -> Result<(), Self::Error> {
        self.store.lock().unwrap().retain(|h, _| !range.contains(h));
        Ok(())
    }
}

/// The error type produced by [`MockWalletBackend`].
#[derive(Debug)]
pub struct MockWalletError(pub String);

impl fmt::Display for MockWalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mock wallet error: {}", self.0)
    }
}

impl std::error::Error for MockWalletError {}

/// A [`WalletBackend`] that records the hashes of the blocks it "scans" and
/// verifies chain continuity against them, without any cryptography.
pub struct MockWalletBackend {
    birthday: BlockHeight,
    cache: SharedBlocks,
    accepted: BTreeMap<BlockHeight, BlockHash>,
    chain_tip: Option<BlockHeight>,
    truncations: Vec<BlockHeight>,
    subtree_root_updates: HashMap<ShieldedProtocol, usize>,
}

impl MockWalletBackend {
    /// Constructs a wallet backend with the given birthday height, reading
    /// blocks to scan from the given shared store.
    pub fn new(birthday: BlockHeight, cache: SharedBlocks) -> Self {
        MockWalletBackend {
            birthday,
            cache,
            accepted: BTreeMap::new(),
            chain_tip: None,
            truncations: Vec::new(),
            subtree_root_updates: HashMap::new(),
        }
    }

    /// The heights passed to `truncate_to_height`, in call order.
    pub fn truncations(&self) -> &[BlockHeight] {
        &self.truncations
    }

    /// The height of the highest block accepted into wallet state, if any.
    pub fn accepted_tip(&self) -> Option<BlockHeight> {
        self.accepted.keys().next_back().copied()
    }

    /// The number of `put_subtree_roots` calls observed for the given pool.
    pub fn subtree_root_updates(&self, protocol: ShieldedProtocol) -> usize {
        self.subtree_root_updates
            .get(&protocol)
            .copied()
            .unwrap_or(0)
    }

    fn fully_scanned(&self) -> BlockHeight {
        let mut height = self.birthday;
        while self.accepted.contains_key(&(height + 1)) {
            height = height + 1;
        }
        height
    }
}

impl WalletBackend for MockWalletBackend {
    type Error = MockWalletError;
    type AccountId = u32;

    fn scan_blocks(&mut self, range: &Range<BlockHeight>) -> Result<(), BackendError<Self::Error>> {
        let store = self.cache.lock().unwrap();
        let mut height = range.start;
        while height < range.end {
            let block = store.get(&height).ok_or_else(|| {
                BackendError::Wallet(MockWalletError(format!(
                    "block at height {} is not in the cache",
                    height
                )))
            })?;
            if let Some(parent) = self.accepted.get(&height.saturating_sub(1)) {
                if *parent != block.prev_hash {
                    return Err(BackendError::Scan(ScanError::PrevHashMismatch {
                        at_height: height,
                    }));
                }
            }
            self.accepted.insert(height, block.hash);
            height = height + 1;
        }
        Ok(())
    }

    fn suggest_scan_ranges(&self) -> Result<Vec<ScanRange>, Self::Error> {
        match self.chain_tip {
            None => Ok(Vec::new()),
            Some(tip) => {
                let fully_scanned = self.fully_scanned();
                if fully_scanned >= tip {
                    Ok(Vec::new())
                } else {
                    Ok(vec![ScanRange::from_parts(
                        fully_scanned + 1..tip + 1,
                        ScanPriority::Historic,
                    )])
                }
            }
        }
    }

    fn update_chain_tip(&mut self, height: BlockHeight) -> Result<(), Self::Error> {
        self.chain_tip = Some(height);
        Ok(())
    }

    fn truncate_to_height(&mut self, height: BlockHeight) -> Result<(), Self::Error> {
        self.accepted.retain(|h, _| *h <= height);
        self.truncations.push(height);
        Ok(())
    }

    fn get_wallet_summary(&self) -> Result<Option<WalletSummary<Self::AccountId>>, Self::Error> {
        match self.chain_tip {
            None => Ok(None),
            Some(tip) => {
                let numerator = self.accepted.len() as u64;
                let denominator = u64::from(u32::from(tip) - u32::from(self.birthday));
                Ok(Some(WalletSummary::new(
                    HashMap::from([(0, AccountBalance::from_parts(0, 0))]),
                    tip,
                    self.fully_scanned(),
                    Some(ScanProgress::clamped(numerator, denominator)),
                )))
            }
        }
    }

    fn put_subtree_roots(
        &mut self,
        protocol: ShieldedProtocol,
        _start_index: u64,
        _roots: &[SubtreeRoot],
    ) -> Result<(), Self::Error> {
        *self.subtree_root_updates.entry(protocol).or_insert(0) += 1;
        Ok(())
    }

    fn validate_chain_tip(&self, candidate: &CompactBlock) -> Result<bool, Self::Error> {
        match self.accepted.get(&candidate.height.saturating_sub(1)) {
            Some(parent) => Ok(*parent == candidate.prev_hash),
            None => Ok(true),
        }
    }
}
