//! Finality digest derivation and votes.
//!
//! The finality digest is the exact byte sequence a finalizer signs when voting
//! for a block. It is a pure function of the block header, which embeds the
//! policy generation in effect at the height the block was produced. Identical
//! inputs always yield identical output regardless of process restarts, clock
//! time, or call order: nothing here reads transient in-memory counters.
//!
//! Verifiers never trust a voter's claimed digest. They recompute it from the
//! recorded header and the height-indexed generation (see
//! [crate::store::PolicyStore::policy_for_height]) and reject the vote if the
//! signature does not match.

use crate::types::{vote_namespace, Generation, Height};
use bytes::{Buf, BufMut};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{
    bls12381::primitives::{
        group,
        ops::{sign_message, verify_message},
        variant::Variant,
    },
    sha256, Hasher, Sha256,
};

/// Digest type used for parents, payloads, and finality digests.
pub type Digest = sha256::Digest;

/// An immutable block header.
///
/// `generation` records the policy generation that was active (not pending) when
/// the block was produced. It is part of the header precisely so that the
/// finality digest can be re-derived from persisted chain data alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    /// Position of the block in the chain.
    pub height: Height,
    /// Finality digest of the parent block (zero digest at genesis).
    pub parent: Digest,
    /// Digest of the block payload.
    pub payload: Digest,
    /// Policy generation in effect when this block was produced.
    pub generation: Generation,
}

impl BlockHeader {
    /// Computes the finality digest finalizers must sign for this block.
    ///
    /// Deterministic and pure: the digest covers the canonical encoding of the
    /// header, including the height-indexed policy generation.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(self.encode().as_ref());
        hasher.finalize()
    }
}

impl Write for BlockHeader {
    fn write(&self, writer: &mut impl BufMut) {
        self.height.write(writer);
        self.parent.write(writer);
        self.payload.write(writer);
        self.generation.write(writer);
    }
}

impl Read for BlockHeader {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let height = Height::read(reader)?;
        let parent = Digest::read(reader)?;
        let payload = Digest::read(reader)?;
        let generation = Generation::read(reader)?;
        Ok(Self {
            height,
            parent,
            payload,
            generation,
        })
    }
}

impl EncodeSize for BlockHeader {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.parent.encode_size()
            + self.payload.encode_size()
            + self.generation.encode_size()
    }
}

/// A finalizer's signature over the finality digest of a block.
///
/// The vote carries the digest and generation it was cast under, but verifiers
/// treat both as claims: validity is judged against the digest recomputed for
/// the (block, generation-in-effect) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vote<V: Variant> {
    /// Height of the block the vote targets.
    pub height: Height,
    /// Finality digest the voter signed.
    pub digest: Digest,
    /// Policy generation the vote was cast under.
    pub generation: Generation,
    /// Position of the voter in the referenced policy's finalizer set.
    pub signer: u32,
    /// BLS signature over the digest.
    pub signature: V::Signature,
}

impl<V: Variant> Vote<V> {
    /// Creates a vote by signing the header's finality digest.
    ///
    /// # Determinism
    ///
    /// Signatures produced by this function are deterministic and safe for
    /// consensus.
    pub fn sign(
        namespace: &[u8],
        header: &BlockHeader,
        signer: u32,
        private: &group::Private,
    ) -> Self {
        let digest = header.digest();
        let signature = sign_message::<V>(
            private,
            Some(vote_namespace(namespace).as_ref()),
            digest.as_ref(),
        );
        Self {
            height: header.height,
            digest,
            generation: header.generation,
            signer,
            signature,
        }
    }

    /// Verifies the signature against an independently recomputed digest.
    ///
    /// Callers pass the digest they derived from persisted chain data, not the
    /// digest carried by the vote.
    pub fn verify(&self, namespace: &[u8], expected: &Digest, public: &V::Public) -> bool {
        if self.digest != *expected {
            return false;
        }
        verify_message::<V>(
            public,
            Some(vote_namespace(namespace).as_ref()),
            expected.as_ref(),
            &self.signature,
        )
        .is_ok()
    }
}

impl<V: Variant> Write for Vote<V> {
    fn write(&self, writer: &mut impl BufMut) {
        self.height.write(writer);
        self.digest.write(writer);
        self.generation.write(writer);
        self.signer.write(writer);
        self.signature.write(writer);
    }
}

impl<V: Variant> Read for Vote<V> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let height = Height::read(reader)?;
        let digest = Digest::read(reader)?;
        let generation = Generation::read(reader)?;
        let signer = u32::read(reader)?;
        let signature = V::Signature::read(reader)?;
        Ok(Self {
            height,
            digest,
            generation,
            signer,
            signature,
        })
    }
}

impl<V: Variant> EncodeSize for Vote<V> {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.digest.encode_size()
            + self.generation.encode_size()
            + self.signer.encode_size()
            + self.signature.encode_size()
    }
}
