//! Journal-backed finality engine.
//!
//! The engine wraps the [PolicyStore] and [Aggregator] with durable storage:
//! every accepted state change (policy installation, block append, finalized
//! QC) is appended to a segmented journal and synced before the operation
//! returns. On startup the journal is replayed through the same code paths used
//! during live operation, so a restarted engine derives exactly the digests and
//! generation lookups it would have derived without the restart. Unfinalized
//! vote tallies are not journaled: a restart drops them and votes must be
//! re-received.

use crate::aggregator::{Aggregator, Outcome, QuorumCertificate};
use crate::digest::{BlockHeader, Digest, Vote};
use crate::metrics::Metrics;
use crate::policy::FinalizerPolicy;
use crate::store::{PolicyStore, Record, Transition};
use crate::types::{Error, Height};
use commonware_codec::Encode;
use commonware_cryptography::bls12381::primitives::variant::Variant;
use commonware_runtime::{buffer::PoolRef, Metrics as RuntimeMetrics, Storage};
use commonware_storage::journal::segmented::variable::{Config as JConfig, Journal};
use commonware_utils::hex;
use futures::{pin_mut, StreamExt};
use serde::Serialize;
use std::num::NonZeroUsize;
use tracing::{debug, info};

/// Number of journal records per section.
const RECORDS_PER_SECTION: u64 = 256;

/// Configuration for the [Engine].
#[derive(Clone)]
pub struct Config<V: Variant> {
    /// Application namespace used to domain-separate vote signatures.
    pub namespace: Vec<u8>,

    /// Policy active at startup before any journaled installation.
    pub genesis: FinalizerPolicy<V>,

    /// The `commonware-runtime::Storage` partition to use
    /// for storing journal blobs.
    pub partition: String,

    /// Optional compression level (using `zstd`) to apply to data before storing.
    pub compression: Option<u8>,

    /// The buffer pool to use for caching journal data.
    pub buffer_pool: PoolRef,

    /// The size of the write buffer to use for each journal blob.
    pub write_buffer: NonZeroUsize,

    /// The size of the read buffer to use when replaying the journal.
    pub replay_buffer: NonZeroUsize,
}

/// Serializable snapshot of a policy's finalizer set.
#[derive(Clone, Debug, Serialize)]
pub struct PolicyInfo {
    /// Policy generation.
    pub generation: u64,
    /// Weighted quorum threshold.
    pub threshold: u64,
    /// Finalizer set in policy order.
    pub finalizers: Vec<FinalizerInfo>,
}

/// Serializable view of a single finalizer.
#[derive(Clone, Debug, Serialize)]
pub struct FinalizerInfo {
    /// Hex-encoded BLS public key.
    pub public_key: String,
    /// Voting weight.
    pub weight: u64,
}

/// Serializable view of an in-flight policy change.
#[derive(Clone, Debug, Serialize)]
pub struct PendingInfo {
    /// The pending policy.
    #[serde(flatten)]
    pub policy: PolicyInfo,
    /// Height at which the installation was recorded.
    pub installed_at: u64,
}

/// Serializable summary of the engine's policy state, suitable for operator
/// inspection. `pending` is `null` when no policy change is in flight.
#[derive(Clone, Debug, Serialize)]
pub struct PolicyStatus {
    /// The active policy.
    pub active: PolicyInfo,
    /// The pending policy, if any.
    pub pending: Option<PendingInfo>,
    /// Highest finalized height, if any block has finalized.
    pub last_final: Option<u64>,
}

fn policy_info<V: Variant>(policy: &FinalizerPolicy<V>) -> PolicyInfo {
    PolicyInfo {
        generation: policy.generation.get(),
        threshold: policy.threshold,
        finalizers: policy
            .finalizers
            .iter()
            .map(|finalizer| FinalizerInfo {
                public_key: hex(&finalizer.public_key.encode()),
                weight: finalizer.weight,
            })
            .collect(),
    }
}

/// Durable finality engine: policy transitions, block records, vote tallying,
/// and restart recovery.
pub struct Engine<E: Storage + RuntimeMetrics, V: Variant> {
    journal: Journal<E, Record<V>>,
    store: PolicyStore<V>,
    aggregator: Aggregator<V>,
    metrics: Metrics,
    appended: u64,
}

impl<E: Storage + RuntimeMetrics, V: Variant> Engine<E, V> {
    /// Opens the journal, replays all records into a fresh [PolicyStore], and
    /// returns the recovered engine.
    ///
    /// Replay routes each record through the same store methods used during
    /// live operation, so recovered state (active generation, transition state,
    /// headers, finalized QCs) is identical to the state that produced the
    /// journal. Vote tallies for unfinalized heights are intentionally not
    /// recovered.
    pub async fn init(context: E, cfg: Config<V>) -> Result<Self, Error> {
        let mut store = PolicyStore::new(cfg.genesis)?;
        let journal = Journal::<E, Record<V>>::init(
            context.with_label("journal"),
            JConfig {
                partition: cfg.partition,
                compression: cfg.compression,
                codec_config: (),
                buffer_pool: cfg.buffer_pool,
                write_buffer: cfg.write_buffer,
            },
        )
        .await?;

        // Rebuild from journal
        let mut appended: u64 = 0;
        {
            let stream = journal.replay(0, 0, cfg.replay_buffer).await?;
            pin_mut!(stream);
            while let Some(record) = stream.next().await {
                let (_, _, _, record) = record?;
                store.replay(record)?;
                appended += 1;
            }
        }

        let metrics = Metrics::init(&context);
        metrics
            .active_generation
            .set(store.active().generation.get() as i64);
        if let Some(last) = store.last_final() {
            metrics.last_final.set(last.get() as i64);
        }
        info!(
            active = %store.active().generation,
            records = appended,
            last_final = ?store.last_final(),
            "recovered finality state"
        );

        Ok(Self {
            journal,
            store,
            aggregator: Aggregator::new(&cfg.namespace),
            metrics,
            appended,
        })
    }

    /// Appends a record to the journal and syncs it to disk before returning.
    async fn record(&mut self, record: Record<V>) -> Result<(), Error> {
        let section = self.appended / RECORDS_PER_SECTION;
        self.journal.append(section, record).await?;
        self.journal.sync(section).await?;
        self.appended += 1;
        Ok(())
    }

    /// Installs a new pending policy recorded at `height`.
    ///
    /// The installation is validated, journaled, and synced before the store
    /// is updated: on a journal error the in-memory state is unchanged and the
    /// caller may retry.
    pub async fn install_policy(
        &mut self,
        policy: FinalizerPolicy<V>,
        height: Height,
    ) -> Result<(), Error> {
        let generation = policy.generation;
        self.store.check_install(&policy)?;
        self.record(Record::Policy(policy.clone(), height)).await?;
        self.store.install_pending(policy, height)?;
        info!(%generation, %height, "installed pending policy");
        Ok(())
    }

    /// Builds the next block header extending the recorded chain, carrying the
    /// active generation.
    pub fn build_next(&self, payload: Digest) -> Result<BlockHeader, Error> {
        let height = self.store.next_height();
        let parent = match height.previous() {
            Some(previous) => self.store.header(previous)?.digest(),
            None => Digest::from([0u8; 32]),
        };
        Ok(BlockHeader {
            height,
            parent,
            payload,
            generation: self.store.active().generation,
        })
    }

    /// Records a block header.
    ///
    /// Journaled and synced before the store is updated, so a journal error
    /// leaves the in-memory state unchanged.
    pub async fn append_block(&mut self, header: BlockHeader) -> Result<(), Error> {
        self.store.check_block(&header)?;
        self.record(Record::Block(header.clone())).await?;
        debug!(height = %header.height, generation = %header.generation, "recorded block");
        self.store.append_block(header)?;
        Ok(())
    }

    /// Submits a vote for tallying.
    ///
    /// If the vote completes a quorum, the resulting certificate is recorded
    /// and synced (and the pending policy promoted if the certificate
    /// qualifies) before the outcome is returned.
    pub async fn submit_vote(&mut self, vote: Vote<V>) -> Result<Outcome<V>, Error> {
        let outcome = match self.aggregator.submit(&self.store, vote) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics.votes_rejected.inc();
                return Err(err);
            }
        };
        self.metrics.votes_accepted.inc();
        let Outcome::Quorum(qc) = outcome else {
            return Ok(outcome);
        };

        let height = qc.height;
        self.store.check_finalize(&qc)?;
        self.record(Record::Finalized(qc.clone())).await?;
        let promoted = self.store.finalize(qc.clone())?;
        self.metrics.certificates.inc();
        self.metrics
            .last_final
            .set(self.store.last_final().map_or(0, |last| last.get()) as i64);
        info!(%height, generation = %qc.generation, "finalized block");
        if promoted {
            let active = self.store.active().generation;
            self.metrics.promotions.inc();
            self.metrics.active_generation.set(active.get() as i64);
            info!(generation = %active, "promoted pending policy");
        }
        Ok(Outcome::Quorum(qc))
    }

    /// Read access to the recovered chain and policy state.
    pub fn store(&self) -> &PolicyStore<V> {
        &self.store
    }

    /// Returns the current transition state.
    pub fn transition(&self) -> Transition {
        self.store.transition()
    }

    /// Returns the active policy.
    pub fn active(&self) -> &FinalizerPolicy<V> {
        self.store.active()
    }

    /// Returns the pending policy and its installation height, if any.
    pub fn pending(&self) -> Option<(&FinalizerPolicy<V>, Height)> {
        self.store.pending()
    }

    /// Highest finalized height, if any block has finalized.
    pub fn last_final(&self) -> Option<Height> {
        self.store.last_final()
    }

    /// Returns the finalized QC at the given height, if any.
    pub fn finalized(&self, height: Height) -> Option<&QuorumCertificate<V>> {
        self.store.finalized(height)
    }

    /// Builds a serializable summary of the active and pending policies.
    pub fn status(&self) -> PolicyStatus {
        PolicyStatus {
            active: policy_info(self.store.active()),
            pending: self.store.pending().map(|(policy, installed_at)| PendingInfo {
                policy: policy_info(policy),
                installed_at: installed_at.get(),
            }),
            last_final: self.store.last_final().map(|height| height.get()),
        }
    }
}
