//! Types for managing the queue of block ranges awaiting scanning.
//!
//! The wallet's view of the chain above its checkpoint is covered by a set of
//! disjoint [`ScanRange`]s, each tagged with a [`ScanPriority`]. The scanning
//! backend is the authority for which ranges exist and at what priority (it
//! derives them from wallet state plus the chain tip); the [`ScanQueue`] holds
//! the engine's working copy of that suggestion set and decides what to scan
//! next.

use std::fmt;
use std::ops::Range;

use crate::consensus::BlockHeight;

/// Scanning range priority levels.
///
/// The variants are declared in ascending order so that the derived [`Ord`]
/// impl provides the total order the scheduler relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanPriority {
    /// Block ranges that are ignored have lowest priority.
    Ignored,
    /// Block ranges that have already been scanned will not be re-scanned.
    Scanned,
    /// Block ranges to be scanned to advance the fully-scanned height.
    Historic,
    /// Block ranges adjacent to heights at which the user opened the wallet.
    OpenAdjacent,
    /// Blocks that must be scanned to complete note commitment tree shards adjacent to found notes.
    FoundNote,
    /// Blocks that must be scanned to complete the latest note commitment tree shard.
    ChainTip,
    /// A previously scanned range that must be verified to check it is still in the
    /// main chain, has highest priority.
    Verify,
}

/// A range of blocks to be scanned, along with its associated priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    block_range: Range<BlockHeight>,
    priority: ScanPriority,
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({}..{})",
            self.priority, self.block_range.start, self.block_range.end,
        )
    }
}

impl ScanRange {
    /// Constructs a scan range from its constituent parts.
    pub fn from_parts(block_range: Range<BlockHeight>, priority: ScanPriority) -> Self {
        assert!(
            block_range.end >= block_range.start,
            "{:?} is invalid for ScanRange({:?})",
            block_range,
            priority,
        );
        ScanRange {
            block_range,
            priority,
        }
    }

    /// Returns the range of block heights to be scanned.
    pub fn block_range(&self) -> &Range<BlockHeight> {
        &self.block_range
    }

    /// Returns the priority with which the scan range should be scanned.
    pub fn priority(&self) -> ScanPriority {
        self.priority
    }

    /// Returns whether or not the scan range is empty.
    pub fn is_empty(&self) -> bool {
        self.block_range.is_empty()
    }

    /// Returns the number of blocks in the scan range.
    pub fn len(&self) -> usize {
        usize::try_from(u32::from(self.block_range.end) - u32::from(self.block_range.start))
            .unwrap()
    }

    /// Shifts the start of the block range to the right if `block_height >
    /// self.block_range().start`. Returns `None` if the resulting range would
    /// be empty (or the range was already empty).
    pub fn truncate_start(&self, block_height: BlockHeight) -> Option<Self> {
        if block_height >= self.block_range.end || self.is_empty() {
            None
        } else {
            Some(ScanRange {
                block_range: self.block_range.start.max(block_height)..self.block_range.end,
                priority: self.priority,
            })
        }
    }

    /// Shifts the end of the block range to the left if `block_height <
    /// self.block_range().end`. Returns `None` if the resulting range would
    /// be empty (or the range was already empty).
    pub fn truncate_end(&self, block_height: BlockHeight) -> Option<Self> {
        if block_height <= self.block_range.start || self.is_empty() {
            None
        } else {
            Some(ScanRange {
                block_range: self.block_range.start..self.block_range.end.min(block_height),
                priority: self.priority,
            })
        }
    }

    /// Splits this scan range at the specified height, such that the provided height becomes the
    /// end of the first range returned and the start of the second. Returns `None` if
    /// `p <= self.block_range().start || p >= self.block_range().end`.
    pub fn split_at(&self, p: BlockHeight) -> Option<(Self, Self)> {
        (p > self.block_range.start && p < self.block_range.end).then_some((
            ScanRange {
                block_range: self.block_range.start..p,
                priority: self.priority,
            },
            ScanRange {
                block_range: p..self.block_range.end,
                priority: self.priority,
            },
        ))
    }
}

/// Errors that the scanning backend reports when a block range cannot be
/// reconciled with the wallet's accepted view of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The hash of the parent block given by a proposed new chain tip does not match the hash of
    /// the current chain tip.
    PrevHashMismatch {
        /// The height at which the mismatch was observed.
        at_height: BlockHeight,
    },
    /// The block height field of the proposed new block is not equal to the height of the previous
    /// block + 1.
    BlockHeightDiscontinuity {
        /// The height of the previous accepted block.
        prev_height: BlockHeight,
        /// The height of the block being added.
        new_height: BlockHeight,
    },
}

impl ScanError {
    /// Returns whether this error is the result of a failed continuity check.
    pub fn is_continuity_error(&self) -> bool {
        match self {
            ScanError::PrevHashMismatch { .. } => true,
            ScanError::BlockHeightDiscontinuity { .. } => true,
        }
    }

    /// Returns the block height at which the scan error occurred.
    pub fn at_height(&self) -> BlockHeight {
        match self {
            ScanError::PrevHashMismatch { at_height } => *at_height,
            ScanError::BlockHeightDiscontinuity { new_height, .. } => *new_height,
        }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::PrevHashMismatch { at_height } => write!(
                f,
                "The parent hash of proposed block does not correspond to the block hash at height {}.",
                at_height,
            ),
            ScanError::BlockHeightDiscontinuity { prev_height, new_height } => write!(
                f,
                "Block height discontinuity at height {}; next height is {}.",
                prev_height, new_height,
            ),
        }
    }
}

impl std::error::Error for ScanError {}

/// The engine's working copy of the suggested scan range set.
///
/// Ranges are held disjoint and sorted by start height. The queue is a pure
/// in-memory structure: its operations cannot fail at runtime, and a
/// malformed range passed to [`ScanRange::from_parts`] is a programmer error
/// surfaced by the constructor's assertion.
#[derive(Debug, Clone, Default)]
pub struct ScanQueue {
    ranges: Vec<ScanRange>,
}

impl ScanQueue {
    /// Constructs an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current range set, sorted by start height.
    pub fn ranges(&self) -> &[ScanRange] {
        &self.ranges
    }

    /// Replaces the queue contents wholesale with a fresh suggestion list
    /// obtained from the scanning backend. Empty ranges are dropped.
    pub fn replace(&mut self, suggestions: impl IntoIterator<Item = ScanRange>) {
        self.ranges = suggestions
            .into_iter()
            .filter(|range| !range.is_empty())
            .collect();
        self.ranges.sort_by_key(|range| range.block_range().start);
    }

    /// Returns the range that should be scanned next: the pending range with
    /// the highest priority, ties broken by the lowest start height so that
    /// historical gaps close oldest-first within a priority tier.
    ///
    /// Ranges at `Scanned` or `Ignored` priority are never returned. Returns
    /// `None` when no pending work remains.
    pub fn next_range(&self) -> Option<&ScanRange> {
        self.ranges
            .iter()
            .filter(|range| range.priority() > ScanPriority::Scanned)
            .max_by(|a, b| {
                (a.priority().cmp(&b.priority()))
                    .then_with(|| b.block_range().start.cmp(&a.block_range().start))
            })
    }

    /// Records that `range` has been scanned up to (but excluding)
    /// `scanned_to`. The matching queue entry is shrunk to retain the
    /// unscanned remainder at its existing priority, or removed entirely once
    /// nothing remains.
    pub fn mark_scanned(&mut self, range: &ScanRange, scanned_to: BlockHeight) {
        if let Some(index) = self
            .ranges
            .iter()
            .position(|entry| entry.block_range() == range.block_range())
        {
            match self.ranges[index].truncate_start(scanned_to) {
                Some(remainder) => self.ranges[index] = remainder,
                None => {
                    self.ranges.remove(index);
                }
            }
        }
    }

    /// Reinserts a range, carving away any overlapping portions of existing
    /// entries so that the new range's priority governs the whole span it
    /// covers. Used after reorg recovery to schedule re-verification of the
    /// rewound span ahead of all lower-priority work.
    pub fn requeue(&mut self, range: ScanRange) {
        if range.is_empty() {
            return;
        }

        let mut replacement = Vec::with_capacity(self.ranges.len() + 1);
        for entry in self.ranges.drain(..) {
            if entry.block_range().end <= range.block_range().start
                || entry.block_range().start >= range.block_range().end
            {
                replacement.push(entry);
            } else {
                if let Some(left) = entry.truncate_end(range.block_range().start) {
                    replacement.push(left);
                }
                if let Some(right) = entry.truncate_start(range.block_range().end) {
                    replacement.push(right);
                }
            }
        }
        replacement.push(range);
        replacement.sort_by_key(|entry| entry.block_range().start);
        self.ranges = replacement;
    }

    /// Returns `true` if no pending (scannable) ranges remain.
    pub fn is_complete(&self) -> bool {
        self.next_range().is_none()
    }
}
