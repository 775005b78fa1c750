//! A directory-backed store of wallet birthday checkpoints.
//!
//! Checkpoint files are named `{height}.json` and hold the JSON document
//! understood by [`Checkpoint::from_json`]. Wallet apps ship one directory
//! per network, so the store is rooted at a single network's directory; use
//! [`FsCheckpointStore::for_network`] to derive that directory from a
//! network-neutral root.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zcash_client_sync::checkpoint::{Checkpoint, CheckpointError};
use zcash_client_sync::consensus::{BlockHeight, Network, Parameters};

/// Errors produced while locating or loading a checkpoint file.
#[derive(Debug)]
pub enum FsCheckpointStoreError {
    /// A filesystem operation failed.
    Io(io::Error),
    /// The checkpoint was absent or its contents could not be interpreted.
    Checkpoint(CheckpointError),
}

impl fmt::Display for FsCheckpointStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsCheckpointStoreError::Io(e) => write!(f, "Checkpoint store I/O error: {}", e),
            FsCheckpointStoreError::Checkpoint(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for FsCheckpointStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsCheckpointStoreError::Io(e) => Some(e),
            FsCheckpointStoreError::Checkpoint(e) => Some(e),
        }
    }
}

impl From<io::Error> for FsCheckpointStoreError {
    fn from(e: io::Error) -> Self {
        FsCheckpointStoreError::Io(e)
    }
}

impl From<CheckpointError> for FsCheckpointStoreError {
    fn from(e: CheckpointError) -> Self {
        FsCheckpointStoreError::Checkpoint(e)
    }
}

/// A read-only store of checkpoint files for a single network.
pub struct FsCheckpointStore<P: Parameters> {
    dir: PathBuf,
    params: P,
}

impl<P: Parameters> FsCheckpointStore<P> {
    /// Constructs a store over the given directory of `{height}.json` files.
    pub fn for_path(dir: impl AsRef<Path>, params: P) -> Self {
        FsCheckpointStore {
            dir: dir.as_ref().to_path_buf(),
            params,
        }
    }

    /// Loads the checkpoint at exactly the given height.
    pub fn load_at(&self, height: BlockHeight) -> Result<Checkpoint, FsCheckpointStoreError> {
        let path = self.dir.join(format!("{}.json", u32::from(height)));
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound { birthday: height }.into());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Checkpoint::from_json(&self.params, &contents)?)
    }

    /// Loads the nearest checkpoint at or below the given wallet birthday.
    ///
    /// This is the checkpoint a wallet restoring from a seed phrase should
    /// be initialized from: scanning begins at the checkpoint rather than
    /// the genesis block. Files whose names are not a plain block height are
    /// ignored.
    pub fn checkpoint_for_birthday(
        &self,
        birthday: BlockHeight,
    ) -> Result<Checkpoint, FsCheckpointStoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound { birthday }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<u32> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let height = match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                Some(height) => height,
                None => continue,
            };
            if BlockHeight::from_u32(height) <= birthday {
                best = Some(best.map_or(height, |b| b.max(height)));
            }
        }

        match best {
            Some(height) => self.load_at(BlockHeight::from_u32(height)),
            None => Err(CheckpointError::NotFound { birthday }.into()),
        }
    }
}

impl FsCheckpointStore<Network> {
    /// Constructs a store over the per-network subdirectory (`mainnet/`,
    /// `testnet/`) of the given root.
    pub fn for_network(root: impl AsRef<Path>, network: Network) -> Self {
        Self::for_path(root.as_ref().join(network.name()), network)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    use zcash_client_sync::checkpoint::CheckpointError;
    use zcash_client_sync::consensus::{BlockHeight, Network};

    use super::{FsCheckpointStore, FsCheckpointStoreError};

    const CHECKPOINT_500000: &str = r#"{
        "network": "main",
        "height": 500000,
        "hash": "00000000011b5cbb2dbb74bc5b3e4e6e55b90a1188e539f9f5e9f1a63e2d8fb1",
        "time": 1560012345,
        "saplingTree": "000000"
    }"#;

    const CHECKPOINT_600000: &str = r#"{
        "network": "main",
        "height": 600000,
        "hash": "00000000019c4e6e55b90a1188e539f9f5e9f1a63e2d8fb12dbb74bc5b3e4e6e",
        "time": 1570012345,
        "saplingTree": "000000"
    }"#;

    fn populated_store(dir: &std::path::Path) -> FsCheckpointStore<Network> {
        std::fs::write(dir.join("500000.json"), CHECKPOINT_500000).unwrap();
        std::fs::write(dir.join("600000.json"), CHECKPOINT_600000).unwrap();
        std::fs::write(dir.join("README.txt"), "not a checkpoint").unwrap();
        FsCheckpointStore::for_path(dir, Network::MainNetwork)
    }

    #[test]
    fn loads_exact_height() {
        let dir = tempdir().unwrap();
        let store = populated_store(dir.path());
        let checkpoint = store.load_at(BlockHeight::from_u32(500_000)).unwrap();
        assert_eq!(checkpoint.height(), BlockHeight::from_u32(500_000));
        assert_eq!(checkpoint.epoch_seconds(), 1_560_012_345);
    }

    #[test]
    fn birthday_lookup_selects_nearest_at_or_below() {
        let dir = tempdir().unwrap();
        let store = populated_store(dir.path());

        let checkpoint = store
            .checkpoint_for_birthday(BlockHeight::from_u32(650_000))
            .unwrap();
        assert_eq!(checkpoint.height(), BlockHeight::from_u32(600_000));

        let checkpoint = store
            .checkpoint_for_birthday(BlockHeight::from_u32(550_000))
            .unwrap();
        assert_eq!(checkpoint.height(), BlockHeight::from_u32(500_000));

        // A birthday exactly at a checkpoint height selects that checkpoint.
        let checkpoint = store
            .checkpoint_for_birthday(BlockHeight::from_u32(600_000))
            .unwrap();
        assert_eq!(checkpoint.height(), BlockHeight::from_u32(600_000));
    }

    #[test]
    fn birthday_below_all_checkpoints_is_not_found() {
        let dir = tempdir().unwrap();
        let store = populated_store(dir.path());
        assert_matches!(
            store.checkpoint_for_birthday(BlockHeight::from_u32(400_000)),
            Err(FsCheckpointStoreError::Checkpoint(
                CheckpointError::NotFound { birthday }
            )) if birthday == BlockHeight::from_u32(400_000)
        );
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FsCheckpointStore::for_path(dir.path().join("absent"), Network::MainNetwork);
        assert_matches!(
            store.checkpoint_for_birthday(BlockHeight::from_u32(500_000)),
            Err(FsCheckpointStoreError::Checkpoint(
                CheckpointError::NotFound { .. }
            ))
        );
    }

    #[test]
    fn malformed_checkpoint_surfaces_parse_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("700000.json"), "not json").unwrap();
        let store = FsCheckpointStore::for_path(dir.path(), Network::MainNetwork);
        assert_matches!(
            store.load_at(BlockHeight::from_u32(700_000)),
            Err(FsCheckpointStoreError::Checkpoint(CheckpointError::Parse(_)))
        );
    }

    #[test]
    fn network_subdirectories_are_segregated() {
        let dir = tempdir().unwrap();
        let mainnet_dir = dir.path().join("mainnet");
        std::fs::create_dir_all(&mainnet_dir).unwrap();
        std::fs::write(mainnet_dir.join("500000.json"), CHECKPOINT_500000).unwrap();

        let mainnet = FsCheckpointStore::for_network(dir.path(), Network::MainNetwork);
        assert!(mainnet.load_at(BlockHeight::from_u32(500_000)).is_ok());

        let testnet = FsCheckpointStore::for_network(dir.path(), Network::TestNetwork);
        assert_matches!(
            testnet.load_at(BlockHeight::from_u32(500_000)),
            Err(FsCheckpointStoreError::Checkpoint(
                CheckpointError::NotFound { .. }
            ))
        );
    }
}
