//! Structs for handling compact block data as it moves between the remote
//! block source, the local block cache, and the scanning backend.

use std::fmt;

use crate::consensus::BlockHeight;

/// The identifier for a Zcash block, as produced by the block's proof of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Constructs a [`BlockHash`] from the given slice.
    ///
    /// # Panics
    ///
    /// Panics if the slice is not 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), 32);
        let mut hash = [0; 32];
        hash.copy_from_slice(bytes);
        BlockHash(hash)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut data = self.0;
        data.reverse();
        formatter.write_str(&hex::encode(data))
    }
}

/// A compact block summary, as fetched from the remote block source and held
/// in the local block cache until the range containing it has been scanned.
///
/// The `data` field carries the block's full serialized compact
/// representation; the remaining fields are the header metadata the sync
/// engine needs without re-parsing that encoding. The scanning backend parses
/// `data` itself and is the authority for its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    /// The height of the block in the chain.
    pub height: BlockHeight,
    /// The block's hash.
    pub hash: BlockHash,
    /// The hash of the block this block claims as its parent.
    pub prev_hash: BlockHash,
    /// The declared block time, in seconds since the epoch.
    pub time: u32,
    /// The number of Sapling outputs in the block.
    pub sapling_outputs_count: u32,
    /// The number of Orchard actions in the block.
    pub orchard_actions_count: u32,
    /// The serialized compact block, as received from the block source.
    pub data: Vec<u8>,
}

impl CompactBlock {
    /// Returns the total number of shielded outputs (Sapling outputs plus
    /// Orchard actions) in the block.
    pub fn shielded_output_count(&self) -> u32 {
        self.sapling_outputs_count + self.orchard_actions_count
    }
}

/// A struct containing metadata about a subtree root of a note commitment
/// tree.
///
/// This stores the block height at which the leaf that completed the subtree
/// was added, and the root hash of the complete subtree. Subtree roots are
/// passed to the scanning backend ahead of scanning so that witnesses built
/// from a partially-scanned range can be validated against the remote
/// source's claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeRoot {
    completing_block_height: BlockHeight,
    root_hash: Vec<u8>,
}

impl SubtreeRoot {
    /// Constructs a new `SubtreeRoot` from its constituent parts.
    pub fn from_parts(completing_block_height: BlockHeight, root_hash: Vec<u8>) -> Self {
        Self {
            completing_block_height,
            root_hash,
        }
    }

    /// Returns the block height at which the leaf that completed the subtree
    /// was added.
    pub fn completing_block_height(&self) -> BlockHeight {
        self.completing_block_height
    }

    /// Returns the root of the complete subtree.
    pub fn root_hash(&self) -> &[u8] {
        &self.root_hash
    }
}

#[cfg(test)]
mod tests {
    use super::BlockHash;

    #[test]
    fn block_hash_display_is_byte_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        assert_eq!(
            BlockHash(bytes).to_string(),
            format!("{}ab", "00".repeat(31)),
        );
    }
}
