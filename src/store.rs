//! Finalizer policy store and transition state machine.
//!
//! The store holds the policy history, the recorded block headers, and the
//! finalized quorum certificates. It is a synchronous state core with no
//! transient inputs: applying the same sequence of [Record]s always yields the
//! same state, which is what makes restart recovery byte-identical (the
//! journal-owning [crate::engine::Engine] replays records through the same code
//! paths used during live operation).
//!
//! # Transition state machine
//!
//! The store is always in one of two states:
//!
//! - `Stable`: no pending policy. A policy-change action moves the store to
//!   `PendingInstalled`.
//! - `PendingInstalled`: exactly one pending policy is recorded, awaiting a
//!   finalizing QC over a block produced at or after its installation height.
//!   Such a QC promotes the pending policy to active and returns to `Stable`.
//!
//! Neither transition is reversible and at most one policy change is in flight
//! at a time. Generation lookups are height-indexed (each recorded header embeds
//! the generation in effect when it was produced); no lookup consults a
//! process-local "current" pointer, so a restarted node cannot mis-derive a
//! digest for an old block.

use crate::aggregator::QuorumCertificate;
use crate::digest::BlockHeader;
use crate::policy::FinalizerPolicy;
use crate::types::{Error, Generation, Height};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::bls12381::primitives::variant::Variant;
use std::collections::BTreeMap;

/// State of the policy transition machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// No pending policy.
    Stable,
    /// A pending policy is installed and awaiting a finalizing QC.
    PendingInstalled,
}

/// A persisted state change, appended to the engine's journal and replayed on
/// startup to reconstruct the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Record<V: Variant> {
    /// A pending policy was installed at the given height.
    Policy(FinalizerPolicy<V>, Height),
    /// A block header was appended to the chain.
    Block(BlockHeader),
    /// A quorum certificate reached finality.
    Finalized(QuorumCertificate<V>),
}

impl<V: Variant> Write for Record<V> {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Record::Policy(policy, height) => {
                0u8.write(writer);
                policy.write(writer);
                height.write(writer);
            }
            Record::Block(header) => {
                1u8.write(writer);
                header.write(writer);
            }
            Record::Finalized(qc) => {
                2u8.write(writer);
                qc.write(writer);
            }
        }
    }
}

impl<V: Variant> Read for Record<V> {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(reader)? {
            0 => {
                let policy = FinalizerPolicy::read(reader)?;
                let height = Height::read(reader)?;
                Ok(Record::Policy(policy, height))
            }
            1 => Ok(Record::Block(BlockHeader::read(reader)?)),
            2 => Ok(Record::Finalized(QuorumCertificate::read(reader)?)),
            _ => Err(CodecError::Invalid("finality::store::Record", "Invalid type")),
        }
    }
}

impl<V: Variant> EncodeSize for Record<V> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Record::Policy(policy, height) => policy.encode_size() + height.encode_size(),
            Record::Block(header) => header.encode_size(),
            Record::Finalized(qc) => qc.encode_size(),
        }
    }
}

/// Pending policy bookkeeping.
#[derive(Clone, Debug)]
struct Pending {
    generation: Generation,
    installed_at: Height,
}

/// Holds the active policy, at most one pending policy, the policy history, and
/// the finalized chain state.
///
/// Old policies are retained after promotion so the digest of an already
/// finalized block can always be recomputed.
#[derive(Clone, Debug)]
pub struct PolicyStore<V: Variant> {
    /// All known policies keyed by generation, including superseded ones.
    policies: BTreeMap<Generation, FinalizerPolicy<V>>,
    /// Generation of the currently active policy.
    active: Generation,
    /// The in-flight policy change, if any.
    pending: Option<Pending>,
    /// Recorded block headers keyed by height.
    headers: BTreeMap<Height, BlockHeader>,
    /// Finalized quorum certificates keyed by height.
    finalized: BTreeMap<Height, QuorumCertificate<V>>,
    /// Highest finalized height.
    last_final: Option<Height>,
}

impl<V: Variant> PolicyStore<V> {
    /// Creates a store with the given genesis policy active.
    pub fn new(genesis: FinalizerPolicy<V>) -> Result<Self, Error> {
        genesis.validate()?;
        let active = genesis.generation;
        let mut policies = BTreeMap::new();
        policies.insert(active, genesis);
        Ok(Self {
            policies,
            active,
            pending: None,
            headers: BTreeMap::new(),
            finalized: BTreeMap::new(),
            last_final: None,
        })
    }

    /// Returns the current transition state.
    pub fn transition(&self) -> Transition {
        if self.pending.is_some() {
            Transition::PendingInstalled
        } else {
            Transition::Stable
        }
    }

    /// Returns the active policy.
    pub fn active(&self) -> &FinalizerPolicy<V> {
        // The active generation is inserted at construction and only ever
        // replaced by a recorded pending policy.
        &self.policies[&self.active]
    }

    /// Returns the pending policy and its installation height, if any.
    pub fn pending(&self) -> Option<(&FinalizerPolicy<V>, Height)> {
        self.pending
            .as_ref()
            .map(|pending| (&self.policies[&pending.generation], pending.installed_at))
    }

    /// Returns the policy at the given generation.
    pub fn policy(&self, generation: Generation) -> Result<&FinalizerPolicy<V>, Error> {
        self.policies
            .get(&generation)
            .ok_or(Error::UnknownGeneration(generation))
    }

    /// Returns the recorded header at the given height.
    pub fn header(&self, height: Height) -> Result<&BlockHeader, Error> {
        self.headers.get(&height).ok_or(Error::UnknownHeight(height))
    }

    /// Returns the policy generation that was in effect when block `height` was
    /// produced.
    ///
    /// Read-only and derived solely from recorded headers: the result is
    /// identical before and after a restart for any previously seen height.
    pub fn policy_for_height(&self, height: Height) -> Result<Generation, Error> {
        self.header(height).map(|header| header.generation)
    }

    /// Returns the finalized QC at the given height, if any.
    pub fn finalized(&self, height: Height) -> Option<&QuorumCertificate<V>> {
        self.finalized.get(&height)
    }

    /// Highest finalized height (the LIB), if any block has finalized.
    pub fn last_final(&self) -> Option<Height> {
        self.last_final
    }

    /// Height the next appended block must carry.
    pub fn next_height(&self) -> Height {
        self.headers
            .last_key_value()
            .map(|(height, _)| height.next())
            .unwrap_or(Height::zero())
    }

    /// Checks whether a candidate policy could be installed as pending.
    ///
    /// Fails with [Error::PendingPolicyExists] if a policy change is already in
    /// flight and [Error::InvalidTransition] if the candidate's generation does
    /// not exceed the active one. Read-only: once this passes, the matching
    /// [Self::install_pending] cannot fail.
    pub fn check_install(&self, policy: &FinalizerPolicy<V>) -> Result<(), Error> {
        if let Some(pending) = &self.pending {
            return Err(Error::PendingPolicyExists(pending.generation));
        }
        policy.validate()?;
        if policy.generation <= self.active {
            return Err(Error::InvalidTransition("generation not above active"));
        }
        Ok(())
    }

    /// Installs a new pending policy recorded at `height`.
    ///
    /// Returns synchronously once the installation is recorded; callers need
    /// not poll for it.
    pub fn install_pending(
        &mut self,
        policy: FinalizerPolicy<V>,
        height: Height,
    ) -> Result<(), Error> {
        self.check_install(&policy)?;
        self.pending = Some(Pending {
            generation: policy.generation,
            installed_at: height,
        });
        self.policies.insert(policy.generation, policy);
        Ok(())
    }

    /// Checks whether a header could be appended to the chain.
    ///
    /// The header must extend the chain contiguously, link to its parent's
    /// finality digest, and carry the active (never the pending) generation.
    /// Read-only: once this passes, the matching [Self::append_block] cannot
    /// fail.
    pub fn check_block(&self, header: &BlockHeader) -> Result<(), Error> {
        let expected = self.next_height();
        if header.height != expected {
            return Err(Error::InvalidTransition("non-contiguous height"));
        }
        if let Some(previous) = header.height.previous() {
            // Contiguity was already checked, so the parent must be recorded.
            let parent = self.header(previous)?;
            if header.parent != parent.digest() {
                return Err(Error::InvalidTransition("parent digest mismatch"));
            }
        }
        if header.generation != self.active {
            return Err(Error::InvalidTransition("generation not in effect"));
        }
        Ok(())
    }

    /// Appends a block header to the chain.
    pub fn append_block(&mut self, header: BlockHeader) -> Result<(), Error> {
        self.check_block(&header)?;
        self.headers.insert(header.height, header);
        Ok(())
    }

    /// Checks whether a QC could be recorded.
    ///
    /// The QC must target a recorded block and carry that block's generation;
    /// callers are expected to have verified the aggregate signature already.
    /// Read-only: once this passes, the matching [Self::finalize] cannot fail.
    pub fn check_finalize(&self, qc: &QuorumCertificate<V>) -> Result<(), Error> {
        if self.finalized.contains_key(&qc.height) {
            return Err(Error::AlreadyFinalized(qc.height));
        }
        let header = self.header(qc.height)?;
        if qc.generation != header.generation {
            return Err(Error::InvalidTransition("generation mismatch"));
        }
        Ok(())
    }

    /// Records a finalized QC and promotes the pending policy if the QC
    /// qualifies.
    ///
    /// Returns `true` if a promotion occurred.
    pub fn finalize(&mut self, qc: QuorumCertificate<V>) -> Result<bool, Error> {
        self.check_finalize(&qc)?;
        let height = qc.height;
        self.finalized.insert(height, qc);
        self.last_final = Some(self.last_final.map_or(height, |last| last.max(height)));
        Ok(self.promote_pending_if_final(height))
    }

    /// Promotes the pending policy to active if a QC finalized a block produced
    /// at or after the pending policy's installation height.
    ///
    /// The swap is atomic: the store moves from `PendingInstalled` directly to
    /// `Stable` with the new active generation, and subsequent digest lookups
    /// for new blocks use the new policy. The superseded policy remains in the
    /// history for recomputing digests of already finalized blocks.
    fn promote_pending_if_final(&mut self, finalized: Height) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        if finalized < pending.installed_at {
            return false;
        }
        self.active = pending.generation;
        self.pending = None;
        true
    }

    /// Applies a replayed journal record.
    ///
    /// Records pass through the same code paths as live operations, so a replay
    /// of the journal reconstructs exactly the state that produced it.
    pub fn replay(&mut self, record: Record<V>) -> Result<(), Error> {
        match record {
            Record::Policy(policy, height) => self.install_pending(policy, height),
            Record::Block(header) => self.append_block(header),
            Record::Finalized(qc) => self.finalize(qc).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::keys::FinalizerKey;
    use crate::policy::{Finalizer, Signers};
    use commonware_cryptography::bls12381::primitives::variant::{MinPk, MinSig, Variant};
    use commonware_cryptography::{Hasher, Sha256};
    use rand::{rngs::StdRng, SeedableRng};

    fn policy<V: Variant>(generation: u64, n: usize, seed: u64) -> FinalizerPolicy<V> {
        let mut rng = StdRng::seed_from_u64(seed);
        let finalizers = (0..n)
            .map(|_| Finalizer {
                public_key: FinalizerKey::<V>::generate(&mut rng).public,
                weight: 1,
            })
            .collect();
        FinalizerPolicy::new(Generation::new(generation), finalizers, (n * 2 / 3 + 1) as u64)
            .unwrap()
    }

    fn append<V: Variant>(store: &mut PolicyStore<V>) -> BlockHeader {
        let height = store.next_height();
        let parent = height
            .previous()
            .map(|previous| store.header(previous).unwrap().digest())
            .unwrap_or_else(|| Sha256::hash(b"genesis"));
        let header = BlockHeader {
            height,
            parent,
            payload: Sha256::hash(height.to_string().as_bytes()),
            generation: store.active().generation,
        };
        store.append_block(header.clone()).unwrap();
        header
    }

    fn qc_for<V: Variant>(store: &PolicyStore<V>, height: Height) -> QuorumCertificate<V> {
        // Store-level tests exercise bookkeeping only; the signature is not
        // checked here (see aggregator tests for cryptographic validation).
        let header = store.header(height).unwrap();
        QuorumCertificate {
            height,
            digest: header.digest(),
            generation: header.generation,
            signers: Signers::from(store.policy(header.generation).unwrap().len(), [0, 1, 2]),
            signature: sample_signature::<V>(),
        }
    }

    fn sample_signature<V: Variant>() -> V::Signature {
        use commonware_cryptography::bls12381::primitives::ops::sign_message;
        let mut rng = StdRng::seed_from_u64(9);
        let key = FinalizerKey::<V>::generate(&mut rng);
        sign_message::<V>(&key.private, None, b"sample")
    }

    fn install_and_promote<V: Variant>() {
        let mut store = PolicyStore::new(policy::<V>(1, 4, 0)).unwrap();
        assert_eq!(store.transition(), Transition::Stable);
        assert_eq!(store.active().generation, Generation::new(1));
        assert!(store.pending().is_none());

        append(&mut store); // height 0
        append(&mut store); // height 1

        // Install pending at height 2.
        store
            .install_pending(policy::<V>(2, 4, 1), Height::new(2))
            .unwrap();
        assert_eq!(store.transition(), Transition::PendingInstalled);
        assert_eq!(store.active().generation, Generation::new(1));
        let (pending, installed_at) = store.pending().unwrap();
        assert_eq!(pending.generation, Generation::new(2));
        assert_eq!(installed_at, Height::new(2));

        // A QC over a block before installation does not promote.
        let qc = qc_for(&store, Height::new(0));
        assert!(!store.finalize(qc).unwrap());
        assert_eq!(store.transition(), Transition::PendingInstalled);

        // New blocks still carry the old active generation until promotion.
        let header = append(&mut store); // height 2
        assert_eq!(header.generation, Generation::new(1));

        // A QC at the installation height promotes atomically.
        let qc = qc_for(&store, Height::new(2));
        assert!(store.finalize(qc).unwrap());
        assert_eq!(store.transition(), Transition::Stable);
        assert_eq!(store.active().generation, Generation::new(2));
        assert!(store.pending().is_none());
        assert_eq!(store.last_final(), Some(Height::new(2)));

        // Blocks appended after promotion carry the new generation, while old
        // heights still resolve to the generation recorded against them.
        let header = append(&mut store); // height 3
        assert_eq!(header.generation, Generation::new(2));
        assert_eq!(
            store.policy_for_height(Height::new(1)).unwrap(),
            Generation::new(1)
        );
        assert_eq!(
            store.policy_for_height(Height::new(3)).unwrap(),
            Generation::new(2)
        );
    }

    #[test]
    fn test_install_and_promote() {
        install_and_promote::<MinPk>();
        install_and_promote::<MinSig>();
    }

    fn rejects_bad_transitions<V: Variant>() {
        let mut store = PolicyStore::new(policy::<V>(3, 4, 0)).unwrap();

        // Generation must exceed active.
        assert!(matches!(
            store.install_pending(policy::<V>(3, 4, 1), Height::zero()),
            Err(Error::InvalidTransition("generation not above active"))
        ));
        assert!(matches!(
            store.install_pending(policy::<V>(2, 4, 1), Height::zero()),
            Err(Error::InvalidTransition("generation not above active"))
        ));

        // Only one change in flight.
        store
            .install_pending(policy::<V>(4, 4, 1), Height::zero())
            .unwrap();
        assert!(matches!(
            store.install_pending(policy::<V>(5, 4, 2), Height::zero()),
            Err(Error::PendingPolicyExists(g)) if g == Generation::new(4)
        ));
    }

    #[test]
    fn test_rejects_bad_transitions() {
        rejects_bad_transitions::<MinPk>();
        rejects_bad_transitions::<MinSig>();
    }

    fn rejects_bad_blocks<V: Variant>() {
        let mut store = PolicyStore::new(policy::<V>(1, 4, 0)).unwrap();
        let genesis = append(&mut store);

        // Skipped height.
        let skipped = BlockHeader {
            height: Height::new(2),
            parent: genesis.digest(),
            payload: Sha256::hash(b"p"),
            generation: Generation::new(1),
        };
        assert!(matches!(
            store.append_block(skipped),
            Err(Error::InvalidTransition("non-contiguous height"))
        ));

        // Broken parent link.
        let unlinked = BlockHeader {
            height: Height::new(1),
            parent: Sha256::hash(b"wrong"),
            payload: Sha256::hash(b"p"),
            generation: Generation::new(1),
        };
        assert!(matches!(
            store.append_block(unlinked),
            Err(Error::InvalidTransition("parent digest mismatch"))
        ));

        // Pending generation never appears on produced blocks.
        store
            .install_pending(policy::<V>(2, 4, 1), Height::new(1))
            .unwrap();
        let premature = BlockHeader {
            height: Height::new(1),
            parent: genesis.digest(),
            payload: Sha256::hash(b"p"),
            generation: Generation::new(2),
        };
        assert!(matches!(
            store.append_block(premature),
            Err(Error::InvalidTransition("generation not in effect"))
        ));
    }

    #[test]
    fn test_rejects_bad_blocks() {
        rejects_bad_blocks::<MinPk>();
        rejects_bad_blocks::<MinSig>();
    }

    fn finalize_is_idempotent<V: Variant>() {
        let mut store = PolicyStore::new(policy::<V>(1, 4, 0)).unwrap();
        append(&mut store);
        let qc = qc_for(&store, Height::zero());
        store.finalize(qc.clone()).unwrap();
        assert!(matches!(
            store.finalize(qc),
            Err(Error::AlreadyFinalized(h)) if h == Height::zero()
        ));
        assert_eq!(store.last_final(), Some(Height::zero()));
    }

    #[test]
    fn test_finalize_is_idempotent() {
        finalize_is_idempotent::<MinPk>();
        finalize_is_idempotent::<MinSig>();
    }

    fn replay_reconstructs<V: Variant>() {
        // Drive a store through a full transition while collecting records, then
        // replay them into a fresh store and compare observable state.
        let genesis = policy::<V>(1, 4, 0);
        let mut store = PolicyStore::new(genesis.clone()).unwrap();
        let mut records = Vec::new();

        for _ in 0..2 {
            let header = append(&mut store);
            records.push(Record::Block(header));
        }
        let upgrade = policy::<V>(2, 4, 1);
        store
            .install_pending(upgrade.clone(), Height::new(2))
            .unwrap();
        records.push(Record::Policy(upgrade, Height::new(2)));
        let header = append(&mut store);
        records.push(Record::Block(header));
        let qc = qc_for(&store, Height::new(2));
        store.finalize(qc.clone()).unwrap();
        records.push(Record::Finalized(qc));

        let mut replayed = PolicyStore::new(genesis).unwrap();
        for record in records {
            replayed.replay(record).unwrap();
        }
        assert_eq!(replayed.active().generation, store.active().generation);
        assert_eq!(replayed.transition(), store.transition());
        assert_eq!(replayed.last_final(), store.last_final());
        for height in 0..3u64 {
            let height = Height::new(height);
            assert_eq!(
                replayed.policy_for_height(height).unwrap(),
                store.policy_for_height(height).unwrap()
            );
            assert_eq!(
                replayed.header(height).unwrap().digest(),
                store.header(height).unwrap().digest()
            );
        }
    }

    #[test]
    fn test_replay_reconstructs() {
        replay_reconstructs::<MinPk>();
        replay_reconstructs::<MinSig>();
    }

    fn checks_do_not_mutate<V: Variant>() {
        let mut store = PolicyStore::new(policy::<V>(1, 4, 0)).unwrap();
        append(&mut store);

        // A passing check leaves the store untouched and guarantees the
        // matching mutation succeeds.
        let candidate = policy::<V>(2, 4, 1);
        store.check_install(&candidate).unwrap();
        assert_eq!(store.transition(), Transition::Stable);

        let qc = qc_for(&store, Height::zero());
        store.check_finalize(&qc).unwrap();
        assert!(store.finalized(Height::zero()).is_none());

        let header = BlockHeader {
            height: Height::new(1),
            parent: store.header(Height::zero()).unwrap().digest(),
            payload: Sha256::hash(b"p"),
            generation: Generation::new(1),
        };
        store.check_block(&header).unwrap();
        assert_eq!(store.next_height(), Height::new(1));

        store.install_pending(candidate, Height::new(1)).unwrap();
        store.append_block(header).unwrap();
        store.finalize(qc).unwrap();
    }

    #[test]
    fn test_checks_do_not_mutate() {
        checks_do_not_mutate::<MinPk>();
        checks_do_not_mutate::<MinSig>();
    }

    fn genesis_parent_unchecked<V: Variant>() {
        // The genesis block may carry any parent digest.
        let mut store = PolicyStore::new(policy::<V>(1, 4, 0)).unwrap();
        let header = BlockHeader {
            height: Height::zero(),
            parent: Digest::from([7u8; 32]),
            payload: Sha256::hash(b"p"),
            generation: Generation::new(1),
        };
        store.append_block(header).unwrap();
    }

    #[test]
    fn test_genesis_parent_unchecked() {
        genesis_parent_unchecked::<MinPk>();
        genesis_parent_unchecked::<MinSig>();
    }
}
