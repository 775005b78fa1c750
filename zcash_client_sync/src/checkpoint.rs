//! Trusted chain checkpoints.
//!
//! A checkpoint is the immutable starting point for a wallet's relationship
//! with the chain: it records a height, the hash and time of the block at that
//! height, and the note commitment tree states as of that block. The wallet
//! never needs to scan below its checkpoint, and the sync engine refuses to
//! rewind below it (doing so would discard tree state that cannot be
//! recovered without a full rescan).

use std::fmt;

use crate::consensus::{BlockHeight, NetworkUpgrade, Parameters};

/// The serialized form of an empty note commitment tree frontier.
const EMPTY_TREE_STATE: &str = "000000";

/// The current (and only) supported checkpoint file version.
///
/// Version is not present in files produced by early checkpoint exports, so
/// version 1 is implied when the field is absent.
const VERSION_1: u64 = 1;

const KEY_VERSION: &str = "version";
const KEY_HEIGHT: &str = "height";
const KEY_HASH: &str = "hash";
const KEY_EPOCH_SECONDS: &str = "time";
const KEY_SAPLING_TREE: &str = "saplingTree";
const KEY_ORCHARD_TREE: &str = "orchardTree";

/// The serialized state of a note commitment tree frontier at some block
/// height, as embedded in a checkpoint file or returned by the block source.
///
/// The contents are opaque to the sync engine; only the scanning backend
/// parses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeState(String);

impl TreeState {
    /// Constructs a tree state from its serialized hex form.
    pub fn new(encoded: impl Into<String>) -> Self {
        TreeState(encoded.into())
    }

    /// The state of an empty note commitment tree.
    pub fn empty() -> Self {
        TreeState(EMPTY_TREE_STATE.into())
    }

    /// Returns the serialized form of the tree state.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A trusted starting point for scanning, loaded once at wallet
/// initialization and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    version: u64,
    height: BlockHeight,
    hash: String,
    epoch_seconds: u64,
    sapling_tree: TreeState,
    orchard_tree: TreeState,
}

impl Checkpoint {
    /// Constructs a checkpoint from its constituent parts.
    pub fn from_parts(
        height: BlockHeight,
        hash: String,
        epoch_seconds: u64,
        sapling_tree: TreeState,
        orchard_tree: TreeState,
    ) -> Self {
        Checkpoint {
            version: VERSION_1,
            height,
            hash,
            epoch_seconds,
            sapling_tree,
            orchard_tree,
        }
    }

    /// Parses a checkpoint from the JSON text of a checkpoint file.
    ///
    /// The `height`, `hash`, `time` and `saplingTree` fields are required. The
    /// `orchardTree` field may be absent from checkpoints exported before
    /// Orchard activation; in that case the empty tree state is synthesized,
    /// but only if the checkpoint height is provably below the Orchard
    /// activation height for `params`. A post-activation checkpoint without an
    /// Orchard tree state is a configuration error, not a recoverable one.
    pub fn from_json<P: Parameters>(params: &P, json: &str) -> Result<Self, CheckpointError> {
        let value: serde_json::Value = serde_json::from_str(json)?;

        let version = value
            .get(KEY_VERSION)
            .map(|v| v.as_u64().ok_or(CheckpointError::MissingField(KEY_VERSION)))
            .transpose()?
            .unwrap_or(VERSION_1);
        if version != VERSION_1 {
            return Err(CheckpointError::UnsupportedVersion(version));
        }

        let get_u64 = |key: &'static str| {
            value
                .get(key)
                .and_then(|v| v.as_u64())
                .ok_or(CheckpointError::MissingField(key))
        };
        let get_str = |key: &'static str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .ok_or(CheckpointError::MissingField(key))
        };

        let height = BlockHeight::try_from(get_u64(KEY_HEIGHT)?)
            .map_err(|_| CheckpointError::MissingField(KEY_HEIGHT))?;
        let hash = get_str(KEY_HASH)?.to_owned();
        let epoch_seconds = get_u64(KEY_EPOCH_SECONDS)?;
        let sapling_tree = TreeState::new(get_str(KEY_SAPLING_TREE)?);

        let orchard_tree = match value.get(KEY_ORCHARD_TREE).and_then(|v| v.as_str()) {
            Some(encoded) => TreeState::new(encoded),
            None => {
                // A checkpoint may only omit the Orchard tree state if it
                // predates Orchard activation.
                let activation = params.activation_height(NetworkUpgrade::Nu5);
                if activation.is_some_and(|h| height < h) {
                    tracing::warn!(
                        "Checkpoint at height {} does not contain an Orchard tree state",
                        height,
                    );
                    TreeState::empty()
                } else {
                    return Err(CheckpointError::OrchardTreeRequired { height });
                }
            }
        };

        Ok(Checkpoint {
            version,
            height,
            hash,
            epoch_seconds,
            sapling_tree,
            orchard_tree,
        })
    }

    /// Returns the checkpoint file version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the height of the checkpointed block.
    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// Returns the hex-encoded hash of the checkpointed block.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Returns the time of the checkpointed block, in seconds since the epoch.
    pub fn epoch_seconds(&self) -> u64 {
        self.epoch_seconds
    }

    /// Returns the Sapling note commitment tree state as of the checkpointed
    /// block.
    pub fn sapling_tree(&self) -> &TreeState {
        &self.sapling_tree
    }

    /// Returns the Orchard note commitment tree state as of the checkpointed
    /// block.
    pub fn orchard_tree(&self) -> &TreeState {
        &self.orchard_tree
    }
}

/// Errors that can occur while locating or parsing a checkpoint.
#[derive(Debug)]
pub enum CheckpointError {
    /// No checkpoint file exists at or below the requested height.
    NotFound {
        /// The height at or below which a checkpoint was requested.
        birthday: BlockHeight,
    },
    /// The checkpoint file was not valid JSON.
    Parse(serde_json::Error),
    /// A required field was absent or of the wrong type.
    MissingField(&'static str),
    /// The checkpoint file declares a version this build does not understand.
    UnsupportedVersion(u64),
    /// A checkpoint at or above Orchard activation omitted its Orchard tree
    /// state.
    OrchardTreeRequired {
        /// The height of the offending checkpoint.
        height: BlockHeight,
    },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::NotFound { birthday } => {
                write!(f, "No checkpoint found at or below height {}", birthday)
            }
            CheckpointError::Parse(e) => write!(f, "Checkpoint file is not valid JSON: {}", e),
            CheckpointError::MissingField(key) => {
                write!(f, "Checkpoint field `{}` is missing or malformed", key)
            }
            CheckpointError::UnsupportedVersion(version) => {
                write!(f, "Unsupported checkpoint version {}", version)
            }
            CheckpointError::OrchardTreeRequired { height } => write!(
                f,
                "Post-Nu5 checkpoint at height {} is missing its orchardTree field",
                height,
            ),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Parse(e)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Checkpoint, CheckpointError, TreeState};
    use crate::consensus::Network;

    const SAPLING_TREE: &str = "01a9f5bd8e3e1b5a2c7e9d4f6a8b0c2d4e6f8a0b1c3d5e7f9a1b3c5d7e9f0a2b01";

    fn checkpoint_json(height: u64, orchard: Option<&str>) -> String {
        let orchard_field = orchard
            .map(|t| format!(r#","orchardTree":"{}""#, t))
            .unwrap_or_default();
        format!(
            r#"{{"network":"main","height":{},"hash":"0000000001a0d0a4cbb8e596d5ecbd5f1a86b89dc3313ffa7f9b4b4a2bfac2a8","time":1656499365,"saplingTree":"{}"{}}}"#,
            height, SAPLING_TREE, orchard_field,
        )
    }

    #[test]
    fn parses_complete_checkpoint() {
        let cp = Checkpoint::from_json(
            &Network::MainNetwork,
            &checkpoint_json(1_700_000, Some("0100aa")),
        )
        .unwrap();
        assert_eq!(cp.height(), 1_700_000.into());
        assert_eq!(cp.version(), 1);
        assert_eq!(cp.orchard_tree(), &TreeState::new("0100aa"));
        assert_eq!(cp.epoch_seconds(), 1_656_499_365);
    }

    #[test]
    fn synthesizes_orchard_tree_before_activation() {
        let cp =
            Checkpoint::from_json(&Network::MainNetwork, &checkpoint_json(1_000_000, None)).unwrap();
        assert_eq!(cp.orchard_tree(), &TreeState::empty());
    }

    #[test]
    fn rejects_missing_orchard_tree_after_activation() {
        assert_matches!(
            Checkpoint::from_json(&Network::MainNetwork, &checkpoint_json(1_700_000, None)),
            Err(CheckpointError::OrchardTreeRequired { height }) if height == 1_700_000.into()
        );
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert_matches!(
            Checkpoint::from_json(&Network::MainNetwork, r#"{"height":1000000}"#),
            Err(CheckpointError::MissingField("hash"))
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        assert_matches!(
            Checkpoint::from_json(
                &Network::MainNetwork,
                r#"{"version":7,"height":1000000,"hash":"00","time":0,"saplingTree":"000000"}"#,
            ),
            Err(CheckpointError::UnsupportedVersion(7))
        );
    }

    #[test]
    fn rejects_malformed_json() {
        assert_matches!(
            Checkpoint::from_json(&Network::MainNetwork, "not json"),
            Err(CheckpointError::Parse(_))
        );
    }
}
