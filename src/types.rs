//! Types shared across the crate.
//!
//! This module defines the core identifiers used throughout the finality
//! implementation:
//!
//! - [`Height`]: The position of a block in the chain. Heights are contiguous and
//!   monotonically increasing; each height is produced exactly once.
//!
//! - [`Generation`]: The version of a finalizer policy. A generation increments each
//!   time a new policy is promoted to active, providing a reconfiguration boundary
//!   for vote validation.
//!
//! - [`Weight`]: Voting weight used for quorum-threshold arithmetic.
//!
//! # Type Conversions
//!
//! Explicit type constructors (`Height::new()`, `Generation::new()`) are required to
//! create instances from raw integers. Implicit conversions via, e.g. `From<u64>` are
//! intentionally not provided to prevent accidental type misuse.

use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_utils::union;
use std::fmt::{self, Display, Formatter};

/// Voting weight of a finalizer.
///
/// Weights are summed during vote aggregation and compared against a policy's
/// quorum threshold.
pub type Weight = u64;

/// The position of a block in the chain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Height(u64);

impl Height {
    /// Returns height zero (the genesis block).
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Creates a new height from a u64 value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying u64 value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true if this is the genesis height.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the next height.
    ///
    /// # Panics
    ///
    /// Panics if the height would overflow u64::MAX. In practice, this is extremely
    /// unlikely to occur during normal operation.
    pub const fn next(self) -> Self {
        Self(self.0.checked_add(1).expect("height overflow"))
    }

    /// Returns the previous height, or `None` if this is the genesis height.
    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Read for Height {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _cfg: &Self::Cfg) -> Result<Self, CodecError> {
        let value: u64 = UInt::read(buf)?.into();
        Ok(Self(value))
    }
}

impl Write for Height {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.0).write(buf);
    }
}

impl EncodeSize for Height {
    fn encode_size(&self) -> usize {
        UInt(self.0).encode_size()
    }
}

/// The version of a finalizer policy.
///
/// Generations order policies totally: a pending policy always carries a higher
/// generation than the active one, and promotion never decreases the active
/// generation. Generation zero is reserved to mean "no policy" and is never a
/// valid policy version.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Returns generation zero (no policy).
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Creates a new generation from a u64 value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying u64 value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true if this is generation zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the next generation.
    ///
    /// # Panics
    ///
    /// Panics if the generation would overflow u64::MAX. In practice, this is
    /// extremely unlikely to occur during normal operation.
    pub const fn next(self) -> Self {
        Self(self.0.checked_add(1).expect("generation overflow"))
    }

    /// Returns the previous generation, or `None` if this is generation zero.
    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Read for Generation {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _cfg: &Self::Cfg) -> Result<Self, CodecError> {
        let value: u64 = UInt::read(buf)?.into();
        Ok(Self(value))
    }
}

impl Write for Generation {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.0).write(buf);
    }
}

impl EncodeSize for Generation {
    fn encode_size(&self) -> usize {
        UInt(self.0).encode_size()
    }
}

/// Error that may be encountered when interacting with the finality engine.
///
/// None of these errors is fatal to the process: policy-store misuse surfaces to
/// the caller, per-vote rejections are logged and the vote dropped, and journal
/// errors bubble up from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Policy Errors
    /// The policy itself is malformed (empty, zero weight, bad threshold).
    #[error("invalid policy: {0}")]
    InvalidPolicy(&'static str),
    /// The policy store was asked to perform an impossible transition.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),
    /// A pending policy is already installed; only one change may be in flight.
    #[error("pending policy exists at generation {0}")]
    PendingPolicyExists(Generation),
    /// The referenced policy generation is not in the store's history.
    #[error("unknown generation {0}")]
    UnknownGeneration(Generation),
    /// No block header is recorded at the referenced height.
    #[error("unknown height {0}")]
    UnknownHeight(Height),

    // Vote Errors
    /// The vote's signature does not verify against the digest recomputed for
    /// the (block, generation-in-effect) pair.
    #[error("stale digest for height {0} (generation {1})")]
    StaleDigest(Height, Generation),
    /// The voter is not a member of the referenced policy generation.
    #[error("unknown voter {0} in generation {1}")]
    UnknownVoter(u32, Generation),
    /// The voter already contributed to the tally for this height.
    #[error("duplicate vote from {0} for height {1}")]
    DuplicateVote(u32, Height),
    /// A quorum certificate already exists for this height.
    #[error("height {0} already finalized")]
    AlreadyFinalized(Height),

    // Storage Errors
    /// The journal backing the engine failed.
    #[error("journal error: {0}")]
    Journal(#[from] commonware_storage::journal::Error),
}

/// Suffix used to identify the vote namespace for domain separation.
/// Used when signing and verifying votes to prevent signature reuse across
/// different message types.
const VOTE_SUFFIX: &[u8] = b"_FIN_VOTE";

/// Returns a suffixed namespace for signing a finality vote.
#[inline]
pub(crate) fn vote_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, VOTE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};

    #[test]
    fn test_height_arithmetic() {
        let h = Height::new(41);
        assert_eq!(h.next(), Height::new(42));
        assert_eq!(h.previous(), Some(Height::new(40)));
        assert_eq!(Height::zero().previous(), None);
        assert!(Height::zero().is_zero());
    }

    #[test]
    fn test_generation_ordering() {
        assert!(Generation::new(2) > Generation::new(1));
        assert_eq!(Generation::new(1).next(), Generation::new(2));
        assert!(Generation::zero().is_zero());
    }

    #[test]
    fn test_codec() {
        let h = Height::new(123_456);
        let restored = Height::decode(h.encode()).unwrap();
        assert_eq!(h, restored);

        let g = Generation::new(7);
        let restored = Generation::decode(g.encode()).unwrap();
        assert_eq!(g, restored);
    }

    #[test]
    fn test_vote_namespace() {
        let namespace = b"test_namespace";
        let expected = [namespace.as_slice(), VOTE_SUFFIX].concat();
        assert_eq!(vote_namespace(namespace), expected);
    }
}
