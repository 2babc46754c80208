use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use turnstile_core::ids::CompanyId;
use turnstile_core::{derive, GateStatus};
use turnstile_store::{CompanyRepo, CompanyRow, StoreError};
use turnstile_telemetry::MetricsRecorder;

/// Where the gate reads committed company snapshots from. Abstracted so
/// tests can inject store failures; production wires in `CompanyRepo`.
pub trait SnapshotSource: Send + Sync {
    fn load(&self, id: &CompanyId) -> Result<CompanyRow, StoreError>;
}

impl SnapshotSource for CompanyRepo {
    fn load(&self, id: &CompanyId) -> Result<CompanyRow, StoreError> {
        self.get(id)
    }
}

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Upper bound on how stale a served snapshot may be.
    pub max_staleness: Duration,
    /// Per-company query ceiling within `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_staleness: Duration::from_secs(3),
            rate_limit: 30,
            rate_window: Duration::from_secs(1),
        }
    }
}

struct CacheEntry {
    status: GateStatus,
    fetched_at: Instant,
    window_start: Instant,
    hits_in_window: u32,
}

/// Answers "may this widget render?" at widget-polling frequency.
///
/// Fail closed: unknown company, unreachable store, or a stale entry that
/// cannot be refreshed all resolve to a denial. Ledger reads happen only
/// on cache miss, staleness expiry, or explicit invalidation.
pub struct GateService {
    source: Arc<dyn SnapshotSource>,
    config: GateConfig,
    cache: DashMap<String, CacheEntry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl GateService {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        config: GateConfig,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            source,
            config,
            cache: DashMap::new(),
            metrics,
        }
    }

    /// Decide whether the company's widget may initialize.
    pub fn check(&self, id: &CompanyId) -> GateStatus {
        let started = Instant::now();
        let status = self.check_inner(id, started);

        if let Some(m) = &self.metrics {
            let result = if status.active { "allowed" } else { "denied" };
            m.counter_inc("gate.checks.total", &[("result", result)], 1);
            m.histogram_observe(
                "gate.check.duration_ms",
                &[],
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        status
    }

    fn check_inner(&self, id: &CompanyId, now: Instant) -> GateStatus {
        if let Some(mut entry) = self.cache.get_mut(id.as_str()) {
            if now.duration_since(entry.window_start) >= self.config.rate_window {
                entry.window_start = now;
                entry.hits_in_window = 0;
            }
            entry.hits_in_window += 1;
            let over_ceiling = entry.hits_in_window > self.config.rate_limit;
            let fresh = now.duration_since(entry.fetched_at) <= self.config.max_staleness;

            if fresh {
                if let Some(m) = &self.metrics {
                    m.counter_inc("gate.cache.hits", &[], 1);
                }
                return entry.status;
            }
            if over_ceiling {
                // Polling storm on a stale entry: protect the store and
                // fail closed rather than serve beyond the staleness bound.
                if let Some(m) = &self.metrics {
                    m.counter_inc("gate.throttled", &[], 1);
                }
                return GateStatus::denied();
            }
        }

        self.refresh(id, now)
    }

    fn refresh(&self, id: &CompanyId, now: Instant) -> GateStatus {
        let status = match self.source.load(id) {
            Ok(row) => GateStatus {
                active: derive(row.subscription, row.token_balance).is_active(),
                tokens: row.token_balance,
            },
            Err(e) => {
                // Denials are cached like any snapshot, so a polling storm
                // on an unknown or broken company stays off the store.
                warn!(company_id = %id, error = %e, "gate check failed closed");
                GateStatus::denied()
            }
        };

        let mut entry = self
            .cache
            .entry(id.as_str().to_string())
            .or_insert_with(|| CacheEntry {
                status,
                fetched_at: now,
                window_start: now,
                hits_in_window: 0,
            });
        entry.status = status;
        entry.fetched_at = now;
        status
    }

    /// Drop the cached snapshot so the next query observes the latest
    /// committed state. Called synchronously by the recharge coordinator
    /// before it returns (read-your-writes).
    pub fn invalidate(&self, id: &CompanyId) {
        self.cache.remove(id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use turnstile_core::SubscriptionState;

    /// Snapshot source with a failure switch and a load counter.
    struct FlakySource {
        company: CompanyRow,
        fail: AtomicBool,
        loads: AtomicUsize,
    }

    impl FlakySource {
        fn new(company: CompanyRow) -> Self {
            Self {
                company,
                fail: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl SnapshotSource for FlakySource {
        fn load(&self, id: &CompanyId) -> Result<CompanyRow, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Database("ledger unreachable".into()));
            }
            if id != &self.company.id {
                return Err(StoreError::NotFound(format!("company {id}")));
            }
            Ok(self.company.clone())
        }
    }

    fn active_company() -> CompanyRow {
        CompanyRow {
            id: CompanyId::new(),
            name: "Acme".into(),
            email: "ops@acme.io".into(),
            plan: "starter".into(),
            token_balance: 500,
            max_tokens: 1000,
            subscription: SubscriptionState::Active,
            version: 3,
            created_at: "2026-08-01T00:00:00Z".into(),
            updated_at: "2026-08-01T00:00:00Z".into(),
        }
    }

    fn gate_with(source: Arc<FlakySource>, config: GateConfig) -> GateService {
        GateService::new(source, config, None)
    }

    #[test]
    fn allows_active_company() {
        let company = active_company();
        let id = company.id.clone();
        let gate = gate_with(Arc::new(FlakySource::new(company)), GateConfig::default());

        let status = gate.check(&id);
        assert!(status.active);
        assert_eq!(status.tokens, 500);
    }

    #[test]
    fn denies_unknown_company() {
        let gate = gate_with(
            Arc::new(FlakySource::new(active_company())),
            GateConfig::default(),
        );
        let status = gate.check(&CompanyId::from_raw("co_unknown"));
        assert_eq!(status, GateStatus::denied());
    }

    #[test]
    fn denies_exhausted_or_inactive_company() {
        let mut company = active_company();
        company.token_balance = 0;
        let id = company.id.clone();
        let gate = gate_with(Arc::new(FlakySource::new(company)), GateConfig::default());
        assert!(!gate.check(&id).active);

        let mut company = active_company();
        company.subscription = SubscriptionState::Inactive;
        let id = company.id.clone();
        let gate = gate_with(Arc::new(FlakySource::new(company)), GateConfig::default());
        assert!(!gate.check(&id).active);
    }

    #[test]
    fn cache_hit_skips_store_read() {
        let source = Arc::new(FlakySource::new(active_company()));
        let id = source.company.id.clone();
        let gate = gate_with(source.clone(), GateConfig::default());

        assert!(gate.check(&id).active);
        assert!(gate.check(&id).active);
        assert!(gate.check(&id).active);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fails_closed_once_entry_exceeds_staleness() {
        let source = Arc::new(FlakySource::new(active_company()));
        let id = source.company.id.clone();
        let config = GateConfig {
            max_staleness: Duration::ZERO,
            ..Default::default()
        };
        let gate = gate_with(source.clone(), config);

        assert!(gate.check(&id).active);

        // Store goes down; the cached value is past its bound and must
        // not be served.
        source.fail.store(true, Ordering::SeqCst);
        assert_eq!(gate.check(&id), GateStatus::denied());
    }

    #[test]
    fn over_ceiling_serves_cached_value_without_store_reads() {
        let source = Arc::new(FlakySource::new(active_company()));
        let id = source.company.id.clone();
        let config = GateConfig {
            rate_limit: 2,
            rate_window: Duration::from_secs(60),
            ..Default::default()
        };
        let gate = gate_with(source.clone(), config);

        for _ in 0..20 {
            assert!(gate.check(&id).active);
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn over_ceiling_with_stale_entry_denies_without_store_reads() {
        let source = Arc::new(FlakySource::new(active_company()));
        let id = source.company.id.clone();
        let config = GateConfig {
            max_staleness: Duration::ZERO,
            rate_limit: 1,
            rate_window: Duration::from_secs(60),
            ..Default::default()
        };
        let gate = gate_with(source.clone(), config);

        gate.check(&id); // miss, load 1
        gate.check(&id); // stale, within ceiling, load 2
        let before = source.loads.load(Ordering::SeqCst);
        assert_eq!(gate.check(&id), GateStatus::denied());
        assert_eq!(source.loads.load(Ordering::SeqCst), before);
    }

    #[test]
    fn unknown_company_storm_keeps_store_reads_bounded() {
        let source = Arc::new(FlakySource::new(active_company()));
        let gate = gate_with(source.clone(), GateConfig::default());
        let id = CompanyId::from_raw("co_unknown");

        for _ in 0..50 {
            assert_eq!(gate.check(&id), GateStatus::denied());
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_recovery_visible_after_staleness_expires() {
        let source = Arc::new(FlakySource::new(active_company()));
        let id = source.company.id.clone();
        let config = GateConfig {
            max_staleness: Duration::ZERO,
            ..Default::default()
        };
        let gate = gate_with(source.clone(), config);

        source.fail.store(true, Ordering::SeqCst);
        assert_eq!(gate.check(&id), GateStatus::denied());

        // The cached denial has expired; the next check re-reads.
        source.fail.store(false, Ordering::SeqCst);
        assert!(gate.check(&id).active);
    }

    #[test]
    fn invalidate_forces_reread() {
        let source = Arc::new(FlakySource::new(active_company()));
        let id = source.company.id.clone();
        let gate = gate_with(source.clone(), GateConfig::default());

        gate.check(&id);
        gate.invalidate(&id);
        gate.check(&id);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }
}
