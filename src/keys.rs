//! Per-node registry of BLS finalizer keys.
//!
//! Each node owns a set of BLS12-381 keys, addressed by slot index. The public key
//! is the finalizer's externally visible identity; the private key never leaves the
//! registry. Every key carries a proof of possession so that a policy built from
//! registry keys cannot include a rogue public key.

use crate::types::Error;
use commonware_cryptography::bls12381::primitives::{
    group,
    ops::{keypair, sign_proof_of_possession, verify_proof_of_possession},
    variant::Variant,
};
use rand::{CryptoRng, RngCore};
use std::collections::BTreeMap;

/// A finalizer's BLS key material.
///
/// Owned exclusively by the node that generated it. Only the public key and proof
/// of possession are shared externally (e.g. when building a policy).
#[derive(Clone, Debug)]
pub struct FinalizerKey<V: Variant> {
    /// Private signing key. Never serialized by this crate.
    pub private: group::Private,
    /// Public identity used in finalizer policies.
    pub public: V::Public,
    /// Proof of possession over the public key.
    pub proof_of_possession: V::Signature,
}

impl<V: Variant> FinalizerKey<V> {
    /// Generates a fresh key with a proof of possession.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (private, public) = keypair::<_, V>(rng);
        let proof_of_possession = sign_proof_of_possession::<V>(&private);
        Self {
            private,
            public,
            proof_of_possession,
        }
    }

    /// Verifies the proof of possession against the public key.
    pub fn verify(&self) -> bool {
        verify_proof_of_possession::<V>(&self.public, &self.proof_of_possession).is_ok()
    }
}

/// Slot-indexed collection of [FinalizerKey]s owned by a single node.
#[derive(Clone, Debug, Default)]
pub struct Registry<V: Variant> {
    keys: BTreeMap<u64, FinalizerKey<V>>,
}

impl<V: Variant> Registry<V> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
        }
    }

    /// Generates (or replaces) the key at the given slot and returns a reference
    /// to it.
    pub fn register<R: RngCore + CryptoRng>(&mut self, slot: u64, rng: &mut R) -> &FinalizerKey<V> {
        let key = FinalizerKey::generate(rng);
        self.keys.insert(slot, key);
        &self.keys[&slot]
    }

    /// Returns the key at the given slot, if one was registered.
    pub fn get(&self, slot: u64) -> Option<&FinalizerKey<V>> {
        self.keys.get(&slot)
    }

    /// Returns the public key at the given slot, failing if the slot is empty.
    pub fn public(&self, slot: u64) -> Result<V::Public, Error> {
        self.keys
            .get(&slot)
            .map(|key| key.public)
            .ok_or(Error::InvalidPolicy("unregistered key slot"))
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
