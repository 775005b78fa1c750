//! Scan progress reporting types.
//!
//! The scanning backend is the authority for combined scan progress (it
//! tracks per-note-commitment-tree-position progress across all accounts);
//! the types here exist to clamp whatever it reports into something safe to
//! publish. Observers may see progress regress immediately after a reorg
//! rewind; that is an expected transition, not an error.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::consensus::BlockHeight;

/// The ratio of scanned note commitments to the total number of note
/// commitments added to the chain since the wallet birthday.
///
/// Invariant: the denominator is nonzero. Use [`ScanProgress::clamped`] when
/// ingesting values from an untrusted reporter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanProgress {
    numerator: u64,
    denominator: u64,
}

impl ScanProgress {
    /// The zero progress value.
    pub const fn zero() -> Self {
        ScanProgress {
            numerator: 0,
            denominator: 1,
        }
    }

    /// Constructs a progress value from a numerator and a denominator.
    ///
    /// A zero denominator is an invalid construction and is rejected rather
    /// than coerced.
    pub fn from_parts(numerator: u64, denominator: u64) -> Result<Self, ProgressError> {
        if denominator == 0 {
            Err(ProgressError::ZeroDenominator)
        } else {
            Ok(ScanProgress {
                numerator,
                denominator,
            })
        }
    }

    /// Constructs a progress value from untrusted parts, substituting zero
    /// progress for a zero denominator and clamping the numerator to the
    /// denominator.
    pub fn clamped(numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            ScanProgress::zero()
        } else {
            ScanProgress {
                numerator: numerator.min(denominator),
                denominator,
            }
        }
    }

    /// Returns the numerator of the ratio.
    pub fn numerator(&self) -> u64 {
        self.numerator
    }

    /// Returns the denominator of the ratio.
    pub fn denominator(&self) -> u64 {
        self.denominator
    }

    /// Returns the progress ratio in `[0, 1]`.
    ///
    /// This never divides by zero: a zero denominator observed at evaluation
    /// time yields `0`, and the numerator is clamped to the denominator
    /// before division.
    pub fn ratio(&self) -> f64 {
        if self.denominator == 0 {
            0.0
        } else {
            self.numerator.min(self.denominator) as f64 / self.denominator as f64
        }
    }
}

/// Errors in the construction of progress values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressError {
    /// A zero denominator was provided.
    ZeroDenominator,
}

impl fmt::Display for ProgressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressError::ZeroDenominator => {
                write!(f, "Scan progress denominator must be nonzero")
            }
        }
    }
}

impl std::error::Error for ProgressError {}

/// The balance of an account, in zatoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountBalance {
    total: u64,
    spendable: u64,
}

impl AccountBalance {
    /// Constructs an account balance from its constituent parts.
    pub fn from_parts(total: u64, spendable: u64) -> Self {
        Self { total, spendable }
    }

    /// Returns the total value of funds belonging to the account.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the value of funds that may immediately be spent.
    pub fn spendable(&self) -> u64 {
        self.spendable
    }
}

/// A snapshot of the wallet's sync state, as reported by the scanning
/// backend.
///
/// The embedded [`ScanProgress`] is the combined ratio across all accounts;
/// it is the source of truth for overall progress, not an average computed by
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSummary<AccountId: Eq + Hash> {
    account_balances: HashMap<AccountId, AccountBalance>,
    chain_tip_height: BlockHeight,
    fully_scanned_height: BlockHeight,
    scan_progress: Option<ScanProgress>,
}

impl<AccountId: Eq + Hash> WalletSummary<AccountId> {
    /// Constructs a new [`WalletSummary`] from its constituent parts.
    pub fn new(
        account_balances: HashMap<AccountId, AccountBalance>,
        chain_tip_height: BlockHeight,
        fully_scanned_height: BlockHeight,
        scan_progress: Option<ScanProgress>,
    ) -> Self {
        Self {
            account_balances,
            chain_tip_height,
            fully_scanned_height,
            scan_progress,
        }
    }

    /// Returns the balances of accounts in the wallet, keyed by account ID.
    pub fn account_balances(&self) -> &HashMap<AccountId, AccountBalance> {
        &self.account_balances
    }

    /// Returns the height of the current chain tip, as far as the wallet
    /// knows it.
    pub fn chain_tip_height(&self) -> BlockHeight {
        self.chain_tip_height
    }

    /// Returns the height below which all blocks have been scanned by the
    /// wallet, ignoring blocks below the wallet birthday.
    pub fn fully_scanned_height(&self) -> BlockHeight {
        self.fully_scanned_height
    }

    /// Returns the progress of scanning shielded outputs since the wallet
    /// birthday.
    ///
    /// This ratio should only be used to compute progress percentages; the
    /// numerator and denominator are not authoritative note counts. Returns
    /// `None` if the wallet is unable to determine the size of the note
    /// commitment tree.
    pub fn scan_progress(&self) -> Option<ScanProgress> {
        self.scan_progress
    }

    /// Returns whether or not wallet scanning is complete.
    pub fn is_synced(&self) -> bool {
        self.chain_tip_height == self.fully_scanned_height
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::{ProgressError, ScanProgress};

    #[test]
    fn zero_denominator_rejected_at_construction() {
        assert_matches!(
            ScanProgress::from_parts(5, 0),
            Err(ProgressError::ZeroDenominator)
        );
    }

    #[test]
    fn clamped_substitutes_zero_for_zero_denominator() {
        assert_eq!(ScanProgress::clamped(5, 0), ScanProgress::zero());
        assert_eq!(ScanProgress::clamped(5, 0).ratio(), 0.0);
    }

    #[test]
    fn clamped_bounds_numerator() {
        let progress = ScanProgress::clamped(15, 10);
        assert_eq!(progress.numerator(), 10);
        assert_eq!(progress.ratio(), 1.0);
    }

    proptest! {
        #[test]
        fn ratio_is_bounded_and_total(n in any::<u64>(), d in any::<u64>()) {
            let ratio = ScanProgress::clamped(n, d).ratio();
            prop_assert!((0.0..=1.0).contains(&ratio));
        }
    }
}
