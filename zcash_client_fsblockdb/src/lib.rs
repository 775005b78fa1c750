//! *A filesystem-backed compact block cache for Zcash light clients.*
//!
//! [`FsBlockCache`] stores each compact block as a flat file under a
//! `blocks/` directory, with an accompanying `blockmeta.json` index holding
//! the header metadata the sync engine needs without re-reading block files.
//! Writes are atomic per record: block files are written to a `.tmp` path and
//! renamed into place, and the index is replaced the same way, so a crash
//! mid-write never leaves a partially-readable record visible.
//!
//! [`checkpoints::FsCheckpointStore`] loads wallet birthday checkpoints from
//! a directory of `{height}.json` files, as shipped in mobile wallet app
//! bundles.

#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use zcash_client_sync::block::{BlockHash, CompactBlock};
use zcash_client_sync::consensus::BlockHeight;
use zcash_client_sync::data_api::BlockCache;

pub mod checkpoints;

const BLOCKS_DIR: &str = "blocks";
const META_FILE: &str = "blockmeta.json";

/// Errors produced by the filesystem block cache.
#[derive(Debug)]
pub enum FsBlockCacheError {
    /// A filesystem operation failed.
    Io(io::Error),
    /// The metadata index could not be encoded or decoded.
    Meta(serde_json::Error),
    /// The metadata index contains a record that cannot be interpreted.
    Corrupt(String),
    /// A truncation below the checkpoint height was requested. State below
    /// the checkpoint is unrecoverable, so the cache refuses to discard it.
    TruncationBelowCheckpoint {
        /// The requested truncation height.
        requested: BlockHeight,
        /// The checkpoint height the cache was opened with.
        checkpoint: BlockHeight,
    },
}

impl fmt::Display for FsBlockCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsBlockCacheError::Io(e) => write!(f, "Block cache I/O error: {}", e),
            FsBlockCacheError::Meta(e) => write!(f, "Block cache metadata error: {}", e),
            FsBlockCacheError::Corrupt(msg) => {
                write!(f, "Block cache metadata is corrupt: {}", msg)
            }
            FsBlockCacheError::TruncationBelowCheckpoint {
                requested,
                checkpoint,
            } => write!(
                f,
                "Requested truncation to height {} below the checkpoint at height {}",
                requested, checkpoint,
            ),
        }
    }
}

impl std::error::Error for FsBlockCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsBlockCacheError::Io(e) => Some(e),
            FsBlockCacheError::Meta(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FsBlockCacheError {
    fn from(e: io::Error) -> Self {
        FsBlockCacheError::Io(e)
    }
}

impl From<serde_json::Error> for FsBlockCacheError {
    fn from(e: serde_json::Error) -> Self {
        FsBlockCacheError::Meta(e)
    }
}

/// Header metadata for a cached compact block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// The height of the cached block.
    pub height: BlockHeight,
    /// The hash of the cached block.
    pub hash: BlockHash,
    /// The hash of the cached block's parent.
    pub prev_hash: BlockHash,
    /// The declared block time, in seconds since the epoch.
    pub time: u32,
    /// The number of Sapling outputs in the block.
    pub sapling_outputs_count: u32,
    /// The number of Orchard actions in the block.
    pub orchard_actions_count: u32,
}

impl BlockMeta {
    fn for_block(block: &CompactBlock) -> Self {
        BlockMeta {
            height: block.height,
            hash: block.hash,
            prev_hash: block.prev_hash,
            time: block.time,
            sapling_outputs_count: block.sapling_outputs_count,
            orchard_actions_count: block.orchard_actions_count,
        }
    }

    /// Returns the name of the file holding the block's serialized bytes.
    ///
    /// The hash rendered into the name disambiguates records written on
    /// different sides of a chain reorganization.
    pub fn block_file_name(&self) -> String {
        format!("{}-{}-compactblock", self.height, self.hash)
    }
}

/// The on-disk representation of a [`BlockMeta`]. Hashes are stored as hex
/// in file byte order, not the display order used in file names.
#[derive(Serialize, Deserialize)]
struct BlockMetaRecord {
    height: u32,
    hash: String,
    prev_hash: String,
    time: u32,
    sapling_outputs_count: u32,
    orchard_actions_count: u32,
}

impl From<&BlockMeta> for BlockMetaRecord {
    fn from(meta: &BlockMeta) -> Self {
        BlockMetaRecord {
            height: meta.height.into(),
            hash: hex::encode(meta.hash.0),
            prev_hash: hex::encode(meta.prev_hash.0),
            time: meta.time,
            sapling_outputs_count: meta.sapling_outputs_count,
            orchard_actions_count: meta.orchard_actions_count,
        }
    }
}

impl TryFrom<BlockMetaRecord> for BlockMeta {
    type Error = FsBlockCacheError;

    fn try_from(record: BlockMetaRecord) -> Result<Self, Self::Error> {
        Ok(BlockMeta {
            height: record.height.into(),
            hash: decode_hash(&record.hash)?,
            prev_hash: decode_hash(&record.prev_hash)?,
            time: record.time,
            sapling_outputs_count: record.sapling_outputs_count,
            orchard_actions_count: record.orchard_actions_count,
        })
    }
}

fn decode_hash(encoded: &str) -> Result<BlockHash, FsBlockCacheError> {
    let bytes = hex::decode(encoded)
        .map_err(|e| FsBlockCacheError::Corrupt(format!("invalid block hash hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(FsBlockCacheError::Corrupt(format!(
            "block hash is {} bytes, expected 32",
            bytes.len()
        )));
    }
    Ok(BlockHash::from_slice(&bytes))
}

/// A compact block cache backed by flat files.
///
/// Each block lives in its own file under `<root>/blocks/`, named
/// `{height}-{hash}-compactblock`; the metadata index lives at
/// `<root>/blockmeta.json`. Files in the blocks directory that the index does
/// not reference (interrupted `.tmp` writes, records from a replaced chain
/// branch) are deleted when the cache is opened.
pub struct FsBlockCache {
    blocks_dir: PathBuf,
    meta_path: PathBuf,
    checkpoint_height: BlockHeight,
    index: BTreeMap<BlockHeight, BlockMeta>,
}

impl FsBlockCache {
    /// Opens (creating if necessary) the block cache rooted at the given
    /// directory.
    ///
    /// `checkpoint_height` establishes the floor below which
    /// [`BlockCache::truncate_to_height`] is refused; it should be the height
    /// of the checkpoint the wallet was initialized from.
    pub fn for_path(
        root: impl AsRef<Path>,
        checkpoint_height: BlockHeight,
    ) -> Result<Self, FsBlockCacheError> {
        let root = root.as_ref();
        let blocks_dir = root.join(BLOCKS_DIR);
        fs::create_dir_all(&blocks_dir)?;
        let meta_path = root.join(META_FILE);

        let index = match fs::read_to_string(&meta_path) {
            Ok(contents) => {
                let records: Vec<BlockMetaRecord> = serde_json::from_str(&contents)?;
                records
                    .into_iter()
                    .map(|record| {
                        let meta = BlockMeta::try_from(record)?;
                        Ok((meta.height, meta))
                    })
                    .collect::<Result<BTreeMap<_, _>, FsBlockCacheError>>()?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let cache = FsBlockCache {
            blocks_dir,
            meta_path,
            checkpoint_height,
            index,
        };
        cache.clean_blocks_dir()?;
        Ok(cache)
    }

    /// The number of records currently in the cache.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Deletes block-directory entries the index does not reference:
    /// interrupted `.tmp` writes and records orphaned by a rewrite at the
    /// same height.
    fn clean_blocks_dir(&self) -> Result<(), FsBlockCacheError> {
        let expected: HashSet<OsString> = self
            .index
            .values()
            .map(|meta| OsString::from(meta.block_file_name()))
            .collect();
        for entry in fs::read_dir(&self.blocks_dir)? {
            let entry = entry?;
            if !expected.contains(&entry.file_name()) {
                debug!("Removing unindexed cache file {:?}", entry.file_name());
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    async fn persist_index(&self) -> Result<(), FsBlockCacheError> {
        let records: Vec<BlockMetaRecord> =
            self.index.values().map(BlockMetaRecord::from).collect();
        let encoded = serde_json::to_vec(&records)?;
        let tmp_path = self.meta_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &encoded).await?;
        tokio::fs::rename(&tmp_path, &self.meta_path).await?;
        Ok(())
    }

    async fn remove_block_file(&self, meta: &BlockMeta) -> Result<(), FsBlockCacheError> {
        match tokio::fs::remove_file(self.blocks_dir.join(meta.block_file_name())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl BlockCache for FsBlockCache {
    type Error = FsBlockCacheError;

    fn get_max_cached_height(&self) -> Result<Option<BlockHeight>, Self::Error> {
        Ok(self.index.keys().next_back().copied())
    }

    fn find_block(&self, height: BlockHeight) -> Result<Option<CompactBlock>, Self::Error> {
        let meta = match self.index.get(&height) {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let data = fs::read(self.blocks_dir.join(meta.block_file_name()))?;
        Ok(Some(CompactBlock {
            height: meta.height,
            hash: meta.hash,
            prev_hash: meta.prev_hash,
            time: meta.time,
            sapling_outputs_count: meta.sapling_outputs_count,
            orchard_actions_count: meta.orchard_actions_count,
            data,
        }))
    }

    async fn write_blocks(&mut self, blocks: Vec<CompactBlock>) -> Result<usize, Self::Error> {
        let count = blocks.len();
        for block in blocks {
            let meta = BlockMeta::for_block(&block);
            let file_name = meta.block_file_name();
            let final_path = self.blocks_dir.join(&file_name);
            let tmp_path = self.blocks_dir.join(format!("{}.tmp", file_name));

            tokio::fs::write(&tmp_path, &block.data).await?;
            tokio::fs::rename(&tmp_path, &final_path).await?;

            if let Some(replaced) = self.index.insert(block.height, meta) {
                if replaced.block_file_name() != file_name {
                    self.remove_block_file(&replaced).await?;
                }
            }
        }
        self.persist_index().await?;
        Ok(count)
    }

    async fn truncate_to_height(&mut self, height: BlockHeight) -> Result<(), Self::Error> {
        if height < self.checkpoint_height {
            return Err(FsBlockCacheError::TruncationBelowCheckpoint {
                requested: height,
                checkpoint: self.checkpoint_height,
            });
        }
        let discarded: Vec<BlockMeta> = self
            .index
            .split_off(&(height + 1))
            .into_values()
            .collect();
        for meta in &discarded {
            self.remove_block_file(meta).await?;
        }
        if !discarded.is_empty() {
            debug!(
                "Truncated {} cached blocks above height {}",
                discarded.len(),
                height,
            );
        }
        self.persist_index().await?;
        Ok(())
    }

    async fn remove_range(&mut self, range: &Range<BlockHeight>) -> Result<(), Self::Error> {
        let discarded: Vec<BlockMeta> = {
            let heights: Vec<BlockHeight> = self
                .index
                .range(range.start..range.end)
                .map(|(height, _)| *height)
                .collect();
            heights
                .into_iter()
                .filter_map(|height| self.index.remove(&height))
                .collect()
        };
        for meta in &discarded {
            self.remove_block_file(meta).await?;
        }
        self.persist_index().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    use zcash_client_sync::block::{BlockHash, CompactBlock};
    use zcash_client_sync::consensus::BlockHeight;
    use zcash_client_sync::data_api::BlockCache;
    use zcash_client_sync::testing::fake_compact_block;

    use super::{FsBlockCache, FsBlockCacheError};

    const FLOOR: u32 = 500_000;

    fn fake_chain(start: u32, len: u32) -> Vec<CompactBlock> {
        let mut prev_hash = BlockHash([0; 32]);
        (0..len)
            .map(|i| {
                let block = fake_compact_block(BlockHeight::from_u32(start + i), prev_hash, 0);
                prev_hash = block.hash;
                block
            })
            .collect()
    }

    fn open(root: &std::path::Path) -> FsBlockCache {
        FsBlockCache::for_path(root, BlockHeight::from_u32(FLOOR)).unwrap()
    }

    #[tokio::test]
    async fn write_and_find_round_trip() {
        let dir = tempdir().unwrap();
        let mut cache = open(dir.path());
        let blocks = fake_chain(500_001, 3);
        let expected = blocks[1].clone();

        assert_eq!(cache.write_blocks(blocks).await.unwrap(), 3);
        let found = cache
            .find_block(BlockHeight::from_u32(500_002))
            .unwrap()
            .unwrap();
        assert_eq!(found, expected);
        assert_eq!(
            cache.get_max_cached_height().unwrap(),
            Some(BlockHeight::from_u32(500_003))
        );
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let blocks = fake_chain(500_001, 3);
        let expected = blocks[2].clone();
        {
            let mut cache = open(dir.path());
            cache.write_blocks(blocks).await.unwrap();
        }

        let cache = open(dir.path());
        assert_eq!(cache.block_count(), 3);
        let found = cache
            .find_block(BlockHeight::from_u32(500_003))
            .unwrap()
            .unwrap();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn rewrite_at_height_replaces_the_record() {
        let dir = tempdir().unwrap();
        let mut cache = open(dir.path());
        let height = BlockHeight::from_u32(500_001);
        let parent = BlockHash([9; 32]);
        let original = fake_compact_block(height, parent, 0);
        let replacement = fake_compact_block(height, parent, 1);
        assert_ne!(original.hash, replacement.hash);

        cache.write_blocks(vec![original]).await.unwrap();
        cache.write_blocks(vec![replacement.clone()]).await.unwrap();

        assert_eq!(cache.find_block(height).unwrap().unwrap(), replacement);
        // The replaced branch's file is gone: one record, one file.
        let files = std::fs::read_dir(dir.path().join("blocks")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn truncate_discards_blocks_above_the_target() {
        let dir = tempdir().unwrap();
        let mut cache = open(dir.path());
        cache.write_blocks(fake_chain(500_001, 10)).await.unwrap();

        cache
            .truncate_to_height(BlockHeight::from_u32(500_005))
            .await
            .unwrap();
        assert_eq!(
            cache.get_max_cached_height().unwrap(),
            Some(BlockHeight::from_u32(500_005))
        );
        assert_matches!(cache.find_block(BlockHeight::from_u32(500_006)), Ok(None));
        assert_matches!(cache.find_block(BlockHeight::from_u32(500_005)), Ok(Some(_)));

        // Truncating to the same height again is a no-op.
        cache
            .truncate_to_height(BlockHeight::from_u32(500_005))
            .await
            .unwrap();
        assert_eq!(cache.block_count(), 5);
    }

    #[tokio::test]
    async fn truncate_below_checkpoint_is_refused() {
        let dir = tempdir().unwrap();
        let mut cache = open(dir.path());
        cache.write_blocks(fake_chain(500_001, 3)).await.unwrap();

        let result = cache
            .truncate_to_height(BlockHeight::from_u32(FLOOR - 1))
            .await;
        assert_matches!(
            result,
            Err(FsBlockCacheError::TruncationBelowCheckpoint { requested, checkpoint })
                if requested == BlockHeight::from_u32(FLOOR - 1)
                    && checkpoint == BlockHeight::from_u32(FLOOR)
        );
        assert_eq!(cache.block_count(), 3);
    }

    #[tokio::test]
    async fn remove_range_frees_scanned_blocks() {
        let dir = tempdir().unwrap();
        let mut cache = open(dir.path());
        cache.write_blocks(fake_chain(500_001, 10)).await.unwrap();

        cache
            .remove_range(&(BlockHeight::from_u32(500_001)..BlockHeight::from_u32(500_006)))
            .await
            .unwrap();
        assert_matches!(cache.find_block(BlockHeight::from_u32(500_003)), Ok(None));
        assert_matches!(cache.find_block(BlockHeight::from_u32(500_007)), Ok(Some(_)));
        assert_eq!(cache.block_count(), 5);
        assert_eq!(
            cache.get_max_cached_height().unwrap(),
            Some(BlockHeight::from_u32(500_010))
        );
    }

    #[tokio::test]
    async fn unindexed_files_are_cleaned_on_open() {
        let dir = tempdir().unwrap();
        let blocks_dir = dir.path().join("blocks");
        {
            let mut cache = open(dir.path());
            cache.write_blocks(fake_chain(500_001, 2)).await.unwrap();
        }
        // Simulate an interrupted write and a stray file.
        std::fs::write(blocks_dir.join("500003-deadbeef-compactblock.tmp"), b"junk").unwrap();
        std::fs::write(blocks_dir.join("notablock"), b"junk").unwrap();

        let cache = open(dir.path());
        assert_eq!(cache.block_count(), 2);
        assert_eq!(std::fs::read_dir(&blocks_dir).unwrap().count(), 2);
        assert_matches!(cache.find_block(BlockHeight::from_u32(500_001)), Ok(Some(_)));
    }
}
