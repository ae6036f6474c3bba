use crate::backend::GcStats;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Garbage-collection counters, recorded once per cycle.
#[derive(Clone, Debug, Default)]
pub struct GcMetrics {
    alive: Gauge,
    deleted: Counter,
    cycles: Counter,
}

// === impl GcMetrics ===

impl GcMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "identity_gc_entries_alive",
            "The number of identity master keys alive after the most recent garbage-collection cycle",
            metrics.alive.clone(),
        );
        registry.register(
            "identity_gc_entries_deleted",
            "The number of identity master keys deleted by garbage collection",
            metrics.deleted.clone(),
        );
        registry.register(
            "identity_gc_cycles",
            "The number of completed identity garbage-collection cycles",
            metrics.cycles.clone(),
        );
        metrics
    }

    pub(crate) fn record(&self, stats: GcStats) {
        self.alive.set(stats.alive as i64);
        self.deleted.inc_by(stats.deleted as u64);
        self.cycles.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_cycle_statistics() {
        let mut registry = Registry::default();
        let metrics = GcMetrics::register(&mut registry);
        metrics.record(GcStats {
            alive: 3,
            deleted: 2,
        });
        metrics.record(GcStats {
            alive: 1,
            deleted: 0,
        });
        assert_eq!(metrics.alive.get(), 1);
        assert_eq!(metrics.deleted.get(), 2);
        assert_eq!(metrics.cycles.get(), 2);
    }
}
