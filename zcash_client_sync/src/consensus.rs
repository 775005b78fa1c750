//! Consensus parameters needed by the sync engine: block heights and the
//! network upgrades that bound what a checkpoint may omit.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// A wrapper type representing blockchain heights.
///
/// Safe conversion from various integer types, as well as addition and
/// subtraction, are provided.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHeight(u32);

/// The height of the genesis block on a network.
pub const H0: BlockHeight = BlockHeight(0);

impl BlockHeight {
    /// Constructs a block height from its integer representation.
    pub const fn from_u32(v: u32) -> BlockHeight {
        BlockHeight(v)
    }

    /// Subtracts the provided value from this height, returning `H0` if this
    /// would result in underflow of the wrapped `u32`.
    pub fn saturating_sub(self, v: u32) -> BlockHeight {
        BlockHeight(self.0.saturating_sub(v))
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl Ord for BlockHeight {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for BlockHeight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u32> for BlockHeight {
    fn from(value: u32) -> Self {
        BlockHeight(value)
    }
}

impl From<BlockHeight> for u32 {
    fn from(value: BlockHeight) -> u32 {
        value.0
    }
}

impl From<BlockHeight> for u64 {
    fn from(value: BlockHeight) -> u64 {
        value.0 as u64
    }
}

impl TryFrom<u64> for BlockHeight {
    type Error = std::num::TryFromIntError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value).map(BlockHeight)
    }
}

impl Add<u32> for BlockHeight {
    type Output = Self;

    fn add(self, other: u32) -> Self {
        BlockHeight(self.0 + other)
    }
}

impl Sub<u32> for BlockHeight {
    type Output = Self;

    fn sub(self, other: u32) -> Self {
        if other > self.0 {
            panic!("Subtraction resulted in negative block height.");
        }

        BlockHeight(self.0 - other)
    }
}

/// An event that occurs at a specified height on the Zcash chain, at which
/// point the consensus rules enforced by the network are altered.
///
/// Only the upgrades that affect sync-engine behavior are enumerated here:
/// Sapling bounds the lowest height at which scanning is meaningful, and Nu5
/// bounds the heights at which a checkpoint may legitimately omit an Orchard
/// tree state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkUpgrade {
    /// The [Sapling] network upgrade.
    ///
    /// [Sapling]: https://z.cash/upgrade/sapling/
    Sapling,
    /// The [Nu5] network upgrade, which activated the Orchard protocol.
    ///
    /// [Nu5]: https://z.cash/upgrade/nu5/
    Nu5,
}

impl fmt::Display for NetworkUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkUpgrade::Sapling => write!(f, "Sapling"),
            NetworkUpgrade::Nu5 => write!(f, "Nu5"),
        }
    }
}

/// Zcash consensus parameters.
pub trait Parameters: Clone {
    /// Returns the activation height for a particular network upgrade, if an
    /// activation height has been set.
    fn activation_height(&self, nu: NetworkUpgrade) -> Option<BlockHeight>;

    /// Determines whether the specified network upgrade is active as of the
    /// provided block height on the network to which this `Parameters` value
    /// applies.
    fn is_nu_active(&self, nu: NetworkUpgrade, height: BlockHeight) -> bool {
        self.activation_height(nu).is_some_and(|h| h <= height)
    }
}

/// The enumeration of known Zcash networks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    /// Zcash Mainnet.
    MainNetwork,
    /// Zcash Testnet.
    TestNetwork,
}

impl Network {
    /// The canonical name of the network, used to segregate per-network data
    /// (checkpoint directories, block cache roots) on disk.
    pub fn name(&self) -> &'static str {
        match self {
            Network::MainNetwork => "mainnet",
            Network::TestNetwork => "testnet",
        }
    }
}

impl Parameters for Network {
    fn activation_height(&self, nu: NetworkUpgrade) -> Option<BlockHeight> {
        match self {
            Network::MainNetwork => match nu {
                NetworkUpgrade::Sapling => Some(BlockHeight(419_200)),
                NetworkUpgrade::Nu5 => Some(BlockHeight(1_687_104)),
            },
            Network::TestNetwork => match nu {
                NetworkUpgrade::Sapling => Some(BlockHeight(280_000)),
                NetworkUpgrade::Nu5 => Some(BlockHeight(1_842_420)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockHeight, Network, NetworkUpgrade, Parameters, H0};

    #[test]
    fn height_saturating_sub() {
        assert_eq!(BlockHeight::from_u32(5).saturating_sub(3), 2.into());
        assert_eq!(BlockHeight::from_u32(5).saturating_sub(5), H0);
        assert_eq!(BlockHeight::from_u32(5).saturating_sub(6), H0);
    }

    #[test]
    fn nu_activation() {
        let params = Network::MainNetwork;
        let nu5 = params.activation_height(NetworkUpgrade::Nu5).unwrap();
        assert!(!params.is_nu_active(NetworkUpgrade::Nu5, nu5 - 1));
        assert!(params.is_nu_active(NetworkUpgrade::Nu5, nu5));
        assert!(params.is_nu_active(NetworkUpgrade::Sapling, nu5));
    }
}
