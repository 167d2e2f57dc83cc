//! Track finalizer policies and validate finality votes in a Byzantine environment.
//!
//! Block finality is granted by a weighted quorum of BLS finalizers. The set of
//! finalizers (a [policy::FinalizerPolicy]) changes over time through a
//! two-phase transition: a new policy is first installed as _pending_ and only
//! becomes _active_ once a quorum certificate finalizes a block produced at or
//! after its installation. At most one transition is in flight at a time and
//! neither phase is reversible.
//!
//! Every vote is validated against a finality digest recomputed from persisted
//! chain data: the block header embeds the policy generation that was active
//! when the block was produced, so the digest for a given height is the same on
//! every node and across restarts of the same node. The [engine::Engine]
//! persists all state changes to a journal and replays them on startup through
//! the same code paths used during live operation.
//!
//! # Components
//!
//! - [keys]: per-node registry of BLS key material with proofs of possession.
//! - [policy]: versioned finalizer sets, quorum arithmetic, and the signer
//!   bitmap used in certificates.
//! - [digest]: finality digest derivation and vote signing/verification.
//! - [aggregator]: per-height vote tallies and quorum certificate formation.
//! - [store]: the policy transition state machine and recorded chain state.
//! - [engine]: the journal-backed wrapper providing durability and restart
//!   recovery.

pub mod aggregator;
pub mod digest;
pub mod engine;
pub mod keys;
pub mod metrics;
pub mod policy;
pub mod store;
pub mod types;

pub use aggregator::{Aggregator, Outcome, QuorumCertificate};
pub use digest::{BlockHeader, Digest, Vote};
pub use engine::{Config, Engine, PolicyStatus};
pub use keys::{FinalizerKey, Registry};
pub use policy::{Finalizer, FinalizerPolicy, Signers};
pub use store::{PolicyStore, Transition};
pub use types::{Error, Generation, Height, Weight};
