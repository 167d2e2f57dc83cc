//! Finalizer policies: the versioned sets of finalizers authorized to vote on
//! block finality.
//!
//! A [FinalizerPolicy] is immutable once created and compared by generation. The
//! [crate::store::PolicyStore] tracks which policy is active at each height; this
//! module only defines the policy itself, its validation rules, and the
//! [Signers] bitmap used to record quorum-certificate participation.

use crate::types::{vote_namespace, Error, Generation, Weight};
use crate::keys::FinalizerKey;
use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::bls12381::primitives::{
    ops::{aggregate_verify_multiple_public_keys, verify_proof_of_possession},
    variant::Variant,
};
use commonware_utils::bitmap::BitMap;

/// Upper bound on the number of finalizers in a single policy, enforced when
/// decoding untrusted bytes.
pub const MAX_FINALIZERS: usize = 1_000;

/// A single participant in a finalizer policy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Finalizer<V: Variant> {
    /// Externally visible identity (a BLS public key).
    pub public_key: V::Public,
    /// Voting weight used for quorum-threshold arithmetic. Always >= 1.
    pub weight: Weight,
}

impl<V: Variant> Write for Finalizer<V> {
    fn write(&self, writer: &mut impl BufMut) {
        self.public_key.write(writer);
        UInt(self.weight).write(writer);
    }
}

impl<V: Variant> Read for Finalizer<V> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let public_key = V::Public::read(reader)?;
        let weight = UInt::read(reader)?.into();
        Ok(Self { public_key, weight })
    }
}

impl<V: Variant> EncodeSize for Finalizer<V> {
    fn encode_size(&self) -> usize {
        self.public_key.encode_size() + UInt(self.weight).encode_size()
    }
}

/// A versioned set of finalizers and the weighted threshold required to finalize
/// a block.
///
/// Immutable once created. The ordering of `finalizers` is significant: votes and
/// certificates reference members by position.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FinalizerPolicy<V: Variant> {
    /// Monotonically increasing policy version. Never zero.
    pub generation: Generation,
    /// Ordered finalizer set.
    pub finalizers: Vec<Finalizer<V>>,
    /// Accumulated vote weight required to form a quorum certificate.
    pub threshold: Weight,
}

impl<V: Variant> FinalizerPolicy<V> {
    /// Creates a policy and validates it.
    pub fn new(
        generation: Generation,
        finalizers: Vec<Finalizer<V>>,
        threshold: Weight,
    ) -> Result<Self, Error> {
        let policy = Self {
            generation,
            finalizers,
            threshold,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Builds a policy from registry keys, verifying each key's proof of
    /// possession. The threshold defaults to [quorum_weight] of the total.
    pub fn from_keys(
        generation: Generation,
        keys: &[(&FinalizerKey<V>, Weight)],
    ) -> Result<Self, Error> {
        let mut finalizers = Vec::with_capacity(keys.len());
        for (key, weight) in keys {
            if !key.verify() {
                return Err(Error::InvalidPolicy("invalid proof of possession"));
            }
            finalizers.push(Finalizer {
                public_key: key.public,
                weight: *weight,
            });
        }
        let total = finalizers.iter().map(|f| f.weight).sum();
        Self::new(generation, finalizers, quorum_weight(total))
    }

    /// Checks the policy invariants: a nonzero generation, a non-empty set of
    /// unique finalizers with nonzero weights, and a threshold that is reachable
    /// but larger than half the total weight.
    pub fn validate(&self) -> Result<(), Error> {
        if self.generation.is_zero() {
            return Err(Error::InvalidPolicy("generation zero"));
        }
        if self.finalizers.is_empty() {
            return Err(Error::InvalidPolicy("no finalizers"));
        }
        if self.finalizers.len() > MAX_FINALIZERS {
            return Err(Error::InvalidPolicy("too many finalizers"));
        }
        let mut total: Weight = 0;
        for (i, finalizer) in self.finalizers.iter().enumerate() {
            if finalizer.weight == 0 {
                return Err(Error::InvalidPolicy("zero weight"));
            }
            if self.finalizers[..i]
                .iter()
                .any(|other| other.public_key == finalizer.public_key)
            {
                return Err(Error::InvalidPolicy("duplicate finalizer"));
            }
            total = total
                .checked_add(finalizer.weight)
                .ok_or(Error::InvalidPolicy("weight overflow"))?;
        }
        if self.threshold > total || self.threshold <= total / 2 {
            return Err(Error::InvalidPolicy("unreachable threshold"));
        }
        Ok(())
    }

    /// Returns the finalizer at the given position.
    pub fn finalizer(&self, index: u32) -> Option<&Finalizer<V>> {
        self.finalizers.get(index as usize)
    }

    /// Returns the position of the given public key in this policy.
    pub fn index_of(&self, public_key: &V::Public) -> Option<u32> {
        self.finalizers
            .iter()
            .position(|f| &f.public_key == public_key)
            .map(|index| index as u32)
    }

    /// Sum of all finalizer weights.
    pub fn total_weight(&self) -> Weight {
        self.finalizers.iter().map(|f| f.weight).sum()
    }

    /// Number of finalizers in the policy.
    pub fn len(&self) -> usize {
        self.finalizers.len()
    }

    /// Returns true if the policy has no finalizers (never true for a validated
    /// policy).
    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    /// Accumulated weight of the given signers.
    pub fn weight_of(&self, signers: &Signers) -> Weight {
        signers
            .iter()
            .filter_map(|index| self.finalizer(index))
            .map(|f| f.weight)
            .sum()
    }

    /// Verifies an aggregated signature over `message` from the given signers of
    /// this policy, enforcing the weighted quorum threshold.
    pub fn verify_quorum(
        &self,
        namespace: &[u8],
        message: &[u8],
        signers: &Signers,
        signature: &V::Signature,
    ) -> bool {
        if signers.len() != self.finalizers.len() {
            return false;
        }
        if self.weight_of(signers) < self.threshold {
            return false;
        }
        let mut publics = Vec::with_capacity(signers.count());
        for index in signers.iter() {
            let Some(finalizer) = self.finalizer(index) else {
                return false;
            };
            publics.push(finalizer.public_key);
        }
        aggregate_verify_multiple_public_keys::<V, _>(
            publics.iter(),
            Some(vote_namespace(namespace).as_ref()),
            message,
            signature,
        )
        .is_ok()
    }

    /// Verifies the proofs of possession accompanying a candidate policy's keys.
    ///
    /// Policies received from the outside (e.g. via a policy-change action) must
    /// carry one proof per finalizer, in policy order.
    pub fn verify_proofs(&self, proofs: &[V::Signature]) -> Result<(), Error> {
        if proofs.len() != self.finalizers.len() {
            return Err(Error::InvalidPolicy("missing proof of possession"));
        }
        for (finalizer, proof) in self.finalizers.iter().zip(proofs) {
            verify_proof_of_possession::<V>(&finalizer.public_key, proof)
                .map_err(|_| Error::InvalidPolicy("invalid proof of possession"))?;
        }
        Ok(())
    }
}

impl<V: Variant> Write for FinalizerPolicy<V> {
    fn write(&self, writer: &mut impl BufMut) {
        self.generation.write(writer);
        self.finalizers.write(writer);
        UInt(self.threshold).write(writer);
    }
}

impl<V: Variant> Read for FinalizerPolicy<V> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let generation = Generation::read(reader)?;
        let finalizers =
            Vec::<Finalizer<V>>::read_cfg(reader, &((1..=MAX_FINALIZERS).into(), ()))?;
        let threshold = UInt::read(reader)?.into();
        Ok(Self {
            generation,
            finalizers,
            threshold,
        })
    }
}

impl<V: Variant> EncodeSize for FinalizerPolicy<V> {
    fn encode_size(&self) -> usize {
        self.generation.encode_size()
            + self.finalizers.encode_size()
            + UInt(self.threshold).encode_size()
    }
}

/// Default weighted quorum: the smallest weight strictly greater than two thirds
/// of the total (2f+1 when all weights are equal and `total = 3f+1`).
pub fn quorum_weight(total: Weight) -> Weight {
    total - total.saturating_sub(1) / 3
}

/// Bitmap over a policy's finalizer positions, recording who contributed to a
/// certificate.
///
/// One bit per finalizer, in policy order. Duplicate indices collapse to a
/// single set bit, matching how the aggregator tallies each voter at most
/// once.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signers {
    bitmap: BitMap<1>,
}

impl Signers {
    /// Builds [Signers] over a finalizer set of the given size from an
    /// iterator of signer indices.
    ///
    /// # Panics
    ///
    /// Panics if an index is outside the finalizer set.
    pub fn from(finalizers: usize, signers: impl IntoIterator<Item = u32>) -> Self {
        let mut bitmap = BitMap::zeroes(finalizers as u64);
        for signer in signers.into_iter() {
            bitmap.set(signer as u64, true);
        }
        Self { bitmap }
    }

    /// Returns the size of the finalizer set this bitmap covers.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.bitmap.len() as usize
    }

    /// Returns how many finalizers are marked as signers.
    pub fn count(&self) -> usize {
        self.bitmap.count_ones() as usize
    }

    /// Returns whether the finalizer at the given position signed.
    pub fn contains(&self, index: u32) -> bool {
        (index as usize) < self.len() && self.bitmap.get(index as u64)
    }

    /// Iterates over signer indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bitmap
            .iter()
            .enumerate()
            .filter_map(|(index, bit)| bit.then_some(index as u32))
    }
}

impl Write for Signers {
    fn write(&self, writer: &mut impl BufMut) {
        self.bitmap.write(writer);
    }
}

impl EncodeSize for Signers {
    fn encode_size(&self) -> usize {
        self.bitmap.encode_size()
    }
}

impl Read for Signers {
    type Cfg = usize;

    fn read_cfg(reader: &mut impl Buf, max_finalizers: &usize) -> Result<Self, CodecError> {
        // The finalizer count is treated as an upper bound for decoding
        // flexibility; exact length validation is enforced at verification time
        // against the actual policy.
        let bitmap = BitMap::read_cfg(reader, &(*max_finalizers as u64))?;
        Ok(Self { bitmap })
    }
}
