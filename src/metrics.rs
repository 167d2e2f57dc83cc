use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [`Engine`](super::Engine).
#[derive(Default)]
pub struct Metrics {
    /// Number of votes accepted into a tally
    pub votes_accepted: Counter,
    /// Number of votes rejected
    pub votes_rejected: Counter,
    /// Number of quorum certificates formed
    pub certificates: Counter,
    /// Number of policy promotions
    pub promotions: Counter,
    /// Generation of the active policy
    pub active_generation: Gauge,
    /// Highest finalized height
    pub last_final: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "votes_accepted",
            "Number of votes accepted into a tally",
            metrics.votes_accepted.clone(),
        );
        context.register(
            "votes_rejected",
            "Number of votes rejected",
            metrics.votes_rejected.clone(),
        );
        context.register(
            "certificates",
            "Number of quorum certificates formed",
            metrics.certificates.clone(),
        );
        context.register(
            "promotions",
            "Number of policy promotions",
            metrics.promotions.clone(),
        );
        context.register(
            "active_generation",
            "Generation of the active policy",
            metrics.active_generation.clone(),
        );
        context.register(
            "last_final",
            "Highest finalized height",
            metrics.last_final.clone(),
        );
        metrics
    }
}
