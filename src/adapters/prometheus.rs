//! Prometheus Statistics Exporter
//!
//! Mirrors a [`StatisticsSnapshot`] into gauges of a private
//! `prometheus::Registry` and renders them in the text exposition format.

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

use crate::error::Result;
use crate::near::StatisticsSnapshot;

const NAMESPACE: &str = "nearcache";

/// Exports near cache statistics as Prometheus gauges
pub struct StatisticsExporter {
    registry: Registry,
    front_hits: IntGauge,
    front_misses: IntGauge,
    invalidation_hits: IntGauge,
    invalidation_misses: IntGauge,
    listener_registrations: IntGauge,
    back_fetches: IntGauge,
    back_bulk_fetches: IntGauge,
    direct_writes: IntGauge,
    populate_discards: IntGauge,
    lock_timeouts: IntGauge,
    abandoned_locks: IntGauge,
    front_size: IntGauge,
}

impl StatisticsExporter {
    /// Create an exporter whose metrics carry a `cache` const label.
    pub fn new(cache: &str) -> Result<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let opts = Opts::new(name, help)
                .namespace(NAMESPACE)
                .const_label("cache", cache);
            let gauge = IntGauge::with_opts(opts)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            front_hits: gauge("front_hits", "Reads served by the front store")?,
            front_misses: gauge("front_misses", "Reads that missed the front store")?,
            invalidation_hits: gauge(
                "invalidation_hits",
                "Invalidations for keys present in the front store",
            )?,
            invalidation_misses: gauge(
                "invalidation_misses",
                "Invalidations for keys absent from the front store",
            )?,
            listener_registrations: gauge(
                "listener_registrations",
                "Back-store subscriptions registered",
            )?,
            back_fetches: gauge("back_fetches", "Single-key back-store reads")?,
            back_bulk_fetches: gauge("back_bulk_fetches", "Batched back-store reads")?,
            direct_writes: gauge("direct_writes", "Writes issued to the back store")?,
            populate_discards: gauge(
                "populate_discards",
                "Values not stored because an invalidation raced them",
            )?,
            lock_timeouts: gauge("lock_timeouts", "Key lock waits that timed out")?,
            abandoned_locks: gauge(
                "abandoned_locks",
                "Locks reclaimed from terminated threads",
            )?,
            front_size: gauge("front_size", "Entries held by the front store")?,
            registry,
        })
    }

    /// Refresh every gauge from `snapshot`.
    pub fn update(&self, snapshot: &StatisticsSnapshot, front_size: usize) {
        self.front_hits.set(snapshot.front_hits as i64);
        self.front_misses.set(snapshot.front_misses as i64);
        self.invalidation_hits.set(snapshot.invalidation_hits as i64);
        self.invalidation_misses.set(snapshot.invalidation_misses as i64);
        self.listener_registrations
            .set(snapshot.listener_registrations as i64);
        self.back_fetches.set(snapshot.back_fetches as i64);
        self.back_bulk_fetches.set(snapshot.back_bulk_fetches as i64);
        self.direct_writes.set(snapshot.direct_writes as i64);
        self.populate_discards.set(snapshot.populate_discards as i64);
        self.lock_timeouts.set(snapshot.lock_timeouts as i64);
        self.abandoned_locks.set(snapshot.abandoned_locks as i64);
        self.front_size.set(front_size as i64);
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for StatisticsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsExporter")
            .field("metrics", &self.registry.gather().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::near::CacheStatistics;

    #[test]
    fn test_render_contains_counters() {
        let stats = CacheStatistics::new();
        stats.record_front_hit();
        stats.record_front_hit();
        stats.record_front_miss();

        let exporter = StatisticsExporter::new("orders").unwrap();
        exporter.update(&stats.snapshot(1), 7);

        let text = exporter.render().unwrap();
        assert!(text.contains("nearcache_front_hits{cache=\"orders\"} 2"));
        assert!(text.contains("nearcache_front_misses{cache=\"orders\"} 1"));
        assert!(text.contains("nearcache_abandoned_locks{cache=\"orders\"} 1"));
        assert!(text.contains("nearcache_front_size{cache=\"orders\"} 7"));
    }

    #[test]
    fn test_exporters_are_independent() {
        let a = StatisticsExporter::new("a").unwrap();
        let b = StatisticsExporter::new("b").unwrap();
        assert_eq!(a.registry().gather().len(), 12);
        assert_eq!(b.registry().gather().len(), 12);
    }
}
