//! Vote collection and quorum certificate formation.
//!
//! The aggregator serializes all votes for a given height through a single
//! check-then-accumulate step: a vote is verified against the digest recomputed
//! from persisted chain state and tallied exactly once per voter. Once the
//! accumulated weight reaches the referenced policy's threshold, the tally is
//! folded into a [QuorumCertificate]. No interleaving can let two votes both
//! observe "quorum not yet reached" and both append past the threshold.
//!
//! In-flight tallies are intentionally transient: a restart drops them (votes
//! for unfinalized heights must be re-received) while finalized QCs are
//! reconstructed from the journal by [crate::engine::Engine].

use crate::digest::{Digest, Vote};
use crate::policy::{FinalizerPolicy, Signers, MAX_FINALIZERS};
use crate::store::PolicyStore;
use crate::types::{Error, Generation, Height, Weight};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::bls12381::primitives::{
    ops::aggregate_signatures, variant::Variant,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Aggregated proof that a weighted quorum of a policy's finalizers voted for a
/// block. Immutable once formed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuorumCertificate<V: Variant> {
    /// Height of the finalized block.
    pub height: Height,
    /// Finality digest the quorum signed.
    pub digest: Digest,
    /// Policy generation the votes were cast under.
    pub generation: Generation,
    /// Bitmap of contributing finalizer indices.
    pub signers: Signers,
    /// Aggregated BLS signature covering all votes in this certificate.
    pub signature: V::Signature,
}

impl<V: Variant> QuorumCertificate<V> {
    /// Verifies the certificate against the policy it references and an
    /// independently recomputed digest.
    pub fn verify(
        &self,
        namespace: &[u8],
        policy: &FinalizerPolicy<V>,
        expected: &Digest,
    ) -> bool {
        if self.generation != policy.generation {
            return false;
        }
        if self.digest != *expected {
            return false;
        }
        policy.verify_quorum(namespace, expected.as_ref(), &self.signers, &self.signature)
    }
}

impl<V: Variant> Write for QuorumCertificate<V> {
    fn write(&self, writer: &mut impl BufMut) {
        self.height.write(writer);
        self.digest.write(writer);
        self.generation.write(writer);
        self.signers.write(writer);
        self.signature.write(writer);
    }
}

impl<V: Variant> Read for QuorumCertificate<V> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let height = Height::read(reader)?;
        let digest = Digest::read(reader)?;
        let generation = Generation::read(reader)?;
        let signers = Signers::read_cfg(reader, &MAX_FINALIZERS)?;
        if signers.count() == 0 {
            return Err(CodecError::Invalid(
                "finality::aggregator::QuorumCertificate",
                "Certificate contains no signers",
            ));
        }
        let signature = V::Signature::read(reader)?;
        Ok(Self {
            height,
            digest,
            generation,
            signers,
            signature,
        })
    }
}

impl<V: Variant> EncodeSize for QuorumCertificate<V> {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.digest.encode_size()
            + self.generation.encode_size()
            + self.signers.encode_size()
            + self.signature.encode_size()
    }
}

/// Result of submitting a valid vote.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<V: Variant> {
    /// The vote was tallied; the accumulated weight has not reached quorum.
    Accepted(Weight),
    /// The vote completed a quorum and a certificate was formed.
    Quorum(QuorumCertificate<V>),
}

/// In-progress tally for a single height.
#[derive(Clone, Debug)]
struct Tally<V: Variant> {
    votes: BTreeMap<u32, V::Signature>,
    weight: Weight,
}

impl<V: Variant> Tally<V> {
    fn new() -> Self {
        Self {
            votes: BTreeMap::new(),
            weight: 0,
        }
    }
}

/// Collects votes per height and forms quorum certificates.
#[derive(Clone, Debug)]
pub struct Aggregator<V: Variant> {
    namespace: Vec<u8>,
    tallies: BTreeMap<Height, Tally<V>>,
}

impl<V: Variant> Aggregator<V> {
    /// Creates an aggregator signing/verifying under the given application
    /// namespace.
    pub fn new(namespace: &[u8]) -> Self {
        Self {
            namespace: namespace.to_vec(),
            tallies: BTreeMap::new(),
        }
    }

    /// Submits a vote for tallying.
    ///
    /// The digest is recomputed from the store's recorded header and the
    /// height-indexed policy generation; the vote's own claims are never
    /// trusted. Rejection reasons:
    ///
    /// - [Error::AlreadyFinalized]: a QC already exists for the height.
    /// - [Error::UnknownHeight]: no header is recorded at the height.
    /// - [Error::StaleDigest]: the claimed generation disagrees with the
    ///   recorded one, or the signature fails against the recomputed digest.
    /// - [Error::UnknownVoter]: the signer is not in the referenced policy.
    /// - [Error::DuplicateVote]: the signer already contributed to this tally.
    pub fn submit(
        &mut self,
        store: &PolicyStore<V>,
        vote: Vote<V>,
    ) -> Result<Outcome<V>, Error> {
        if store.finalized(vote.height).is_some() {
            return Err(Error::AlreadyFinalized(vote.height));
        }
        let header = store.header(vote.height)?;
        let generation = header.generation;
        if vote.generation != generation {
            warn!(
                height = %vote.height,
                claimed = %vote.generation,
                recorded = %generation,
                "vote cast under wrong generation"
            );
            return Err(Error::StaleDigest(vote.height, generation));
        }
        let policy = store.policy(generation)?;
        let Some(finalizer) = policy.finalizer(vote.signer) else {
            return Err(Error::UnknownVoter(vote.signer, generation));
        };
        let expected = header.digest();
        if !vote.verify(&self.namespace, &expected, &finalizer.public_key) {
            warn!(
                height = %vote.height,
                generation = %generation,
                signer = vote.signer,
                "vote signature does not match recomputed digest"
            );
            return Err(Error::StaleDigest(vote.height, generation));
        }

        // Check-then-accumulate as one atomic step.
        let tally = self
            .tallies
            .entry(vote.height)
            .or_insert_with(Tally::new);
        if tally.votes.contains_key(&vote.signer) {
            return Err(Error::DuplicateVote(vote.signer, vote.height));
        }
        tally.votes.insert(vote.signer, vote.signature);
        tally.weight += finalizer.weight;
        debug!(
            height = %vote.height,
            generation = %generation,
            signer = vote.signer,
            weight = tally.weight,
            threshold = policy.threshold,
            "vote accepted"
        );
        if tally.weight < policy.threshold {
            return Ok(Outcome::Accepted(tally.weight));
        }

        // Quorum reached: fold the tally into a certificate.
        let tally = self
            .tallies
            .remove(&vote.height)
            .expect("tally exists after insert");
        let signers = Signers::from(policy.len(), tally.votes.keys().copied());
        let signature = aggregate_signatures::<V, _>(tally.votes.values());
        Ok(Outcome::Quorum(QuorumCertificate {
            height: vote.height,
            digest: expected,
            generation,
            signers,
            signature,
        }))
    }

    /// Drops all in-progress tallies.
    ///
    /// Restart is a cancellation point for unfinalized heights: votes must be
    /// re-received after recovery.
    pub fn clear(&mut self) {
        self.tallies.clear();
    }

    /// Number of heights with an in-progress tally.
    pub fn pending_tallies(&self) -> usize {
        self.tallies.len()
    }
}
