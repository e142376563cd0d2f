//! Tiered data gathering under a wall-clock deadline.
//!
//! `gather_all` walks the registry tier by tier, merging every source into
//! one [`SessionHealth`]:
//!
//! - **Tier 1** runs synchronously in registration order
//! - **Tier 2** runs in parallel threads, each raced against
//!   `min(timeout, deadline - now)`
//! - **Tier 3** reads the global cache first. Fresh entries merge directly.
//!   Stale ones are refreshed only by whichever process wins the single-flight
//!   lock; everyone else merges what the cache holds. A source with no cache
//!   entry at all gets one uncoordinated fetch so a cold start still shows data.
//!
//! A failing, panicking or late source only loses its own merge.

mod cache;
mod context;
mod lock;
mod registry;
pub mod sources;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

pub use cache::{CacheEntry, CacheFile, GlobalDataCache, GLOBAL_CACHE_VERSION};
pub use context::{GatherContext, ANONYMOUS_SESSION};
pub use lock::{get_process_start_time, is_pid_alive, LockRecord, SingleFlightCoordinator};
pub use registry::{DataSource, DataSourceDescriptor, DataSourceRegistry, FetchFn, MergeFn, Tier};

use crate::error::FetchError;
use crate::freshness::{self, Freshness};
use crate::health::{SessionHealth, SourceState, SourceStatus, HEALTH_VERSION};
use crate::storage::StorageConfig;

type Outcome = Result<Value, FetchError>;

pub struct UnifiedDataBroker {
    registry: DataSourceRegistry,
    storage: StorageConfig,
}

impl UnifiedDataBroker {
    pub fn new(registry: DataSourceRegistry, storage: StorageConfig) -> Self {
        Self { registry, storage }
    }

    pub fn registry(&self) -> &DataSourceRegistry {
        &self.registry
    }

    /// Runs every tier and returns the merged record. Never fails: the worst
    /// case is a record whose fields are stale or absent.
    pub fn gather_all(&self, ctx: GatherContext) -> SessionHealth {
        let started = Instant::now();
        let ctx = Arc::new(ctx);

        let mut health = ctx
            .existing_health
            .clone()
            .filter(|h| h.session_id == ctx.session_id)
            .unwrap_or_default();
        health.version = HEALTH_VERSION;
        health.session_id = ctx.session_id.clone();
        health.sources.clear();

        self.run_instant(&ctx, &mut health);
        self.run_session(&ctx, &mut health);
        self.run_global(&ctx, &mut health);

        health.gathered_at = crate::now_ms();
        tracing::debug!(
            session = %ctx.session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            sources = health.sources.len(),
            "Gather finished"
        );
        health
    }

    fn runnable(&self, tier: Tier, health: &mut SessionHealth) -> Vec<Arc<dyn DataSource>> {
        let mut runnable = Vec::new();
        for source in self.registry.get_by_tier(tier) {
            let missing = source
                .dependencies()
                .iter()
                .find(|dep| !health.sources.get(dep.as_str()).is_some_and(|s| s.state.has_value()))
                .cloned();
            match missing {
                Some(dep) => {
                    tracing::debug!(source = %source.id(), dependency = %dep, "Skipping source; dependency has no value");
                    health.mark(
                        source.id(),
                        SourceStatus::failed(SourceState::Skipped, format!("dependency {} unavailable", dep)),
                    );
                }
                None => runnable.push(source),
            }
        }
        runnable
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Tier 1
    // ═══════════════════════════════════════════════════════════════════════════

    fn run_instant(&self, ctx: &Arc<GatherContext>, health: &mut SessionHealth) {
        for source in self.runnable(Tier::Instant, health) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| source.fetch(ctx)))
                .unwrap_or_else(|_| Err(FetchError::Failed("fetch panicked".to_string())));
            apply(health, source.as_ref(), outcome, SourceState::Fetched);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Tier 2
    // ═══════════════════════════════════════════════════════════════════════════

    fn run_session(&self, ctx: &Arc<GatherContext>, health: &mut SessionHealth) {
        let sources = self.runnable(Tier::Session, health);
        let outcomes = fan_out(&sources, ctx);
        for (source, outcome) in sources.iter().zip(outcomes) {
            apply(health, source.as_ref(), outcome, SourceState::Fetched);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Tier 3
    // ═══════════════════════════════════════════════════════════════════════════

    fn run_global(&self, ctx: &Arc<GatherContext>, health: &mut SessionHealth) {
        let sources = self.runnable(Tier::Global, health);
        if sources.is_empty() {
            return;
        }

        let cache = GlobalDataCache::new(&self.storage);
        let snapshot = cache.read();
        let now = crate::now_ms();
        let mut stale = Vec::new();
        for source in sources {
            match snapshot.sources.get(source.id()) {
                Some(entry) if is_fresh(entry, source.as_ref(), now) => {
                    merge_cached(health, source.as_ref(), entry, now, None);
                }
                _ => stale.push(source),
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut coordinator = SingleFlightCoordinator::new(&self.storage)
            .with_timeout_override(ctx.config.lock_timeout_secs.map(Duration::from_secs));
        for source in &stale {
            coordinator =
                coordinator.with_lock_timeout(source.id(), source.freshness().policy().lock_timeout);
        }

        let (mut fetched, mut errors) = self.refresh_owned(ctx, &cache, &coordinator, &stale);

        // Merge what the cache holds now, whoever wrote it.
        let latest = cache.read();
        let now = crate::now_ms();
        let mut cold = Vec::new();
        for source in stale {
            let id = source.id();
            if let Some(value) = fetched.remove(id) {
                apply(health, source.as_ref(), Ok(value), SourceState::Fetched);
            } else if let Some(entry) = latest.sources.get(id) {
                merge_cached(health, source.as_ref(), entry, now, errors.remove(id));
            } else if let Some(err) = errors.remove(id) {
                apply(health, source.as_ref(), Err(err), SourceState::Fetched);
            } else {
                cold.push(source);
            }
        }

        if !cold.is_empty() {
            tracing::debug!(count = cold.len(), "No cached value; fetching directly");
            let outcomes = fan_out(&cold, ctx);
            for (source, outcome) in cold.iter().zip(outcomes) {
                apply(health, source.as_ref(), outcome, SourceState::Fallback);
            }
        }
    }

    /// Fetches the stale sources this process wins locks for, publishes the
    /// successes, and releases every lock it took.
    fn refresh_owned(
        &self,
        ctx: &Arc<GatherContext>,
        cache: &GlobalDataCache,
        coordinator: &SingleFlightCoordinator,
        stale: &[Arc<dyn DataSource>],
    ) -> (HashMap<String, Value>, HashMap<String, FetchError>) {
        let mut fetched = HashMap::new();
        let mut errors = HashMap::new();

        let ids: Vec<&str> = stale.iter().map(|s| s.id()).collect();
        let acquired = coordinator.try_acquire_many(&ids);
        if acquired.is_empty() {
            return (fetched, errors);
        }

        // A sibling may have published between our snapshot and the acquire.
        let recheck = cache.read();
        let now = crate::now_ms();
        let mut owned = Vec::new();
        for source in stale.iter().filter(|s| acquired.iter().any(|id| id == s.id())) {
            match recheck.sources.get(source.id()) {
                Some(entry) if is_fresh(entry, source.as_ref(), now) => {
                    coordinator.release(source.id(), true);
                }
                _ => owned.push(Arc::clone(source)),
            }
        }

        let outcomes = fan_out(&owned, ctx);
        let mut to_write = Vec::new();
        for (source, outcome) in owned.iter().zip(outcomes) {
            match outcome {
                Ok(value) => to_write.push((source.id().to_string(), value)),
                Err(err) => {
                    tracing::warn!(source = %source.id(), error = %err, "Global refresh failed");
                    coordinator.release(source.id(), false);
                    errors.insert(source.id().to_string(), err);
                }
            }
        }

        let published = match cache.write_entries(to_write.clone()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to publish global cache entries");
                false
            }
        };
        for (id, value) in to_write {
            coordinator.release(&id, published);
            fetched.insert(id, value);
        }
        (fetched, errors)
    }
}

fn is_fresh(entry: &CacheEntry, source: &dyn DataSource, now_ms: i64) -> bool {
    freshness::classify_at(entry.fetched_at, source.freshness(), now_ms) == Freshness::Fresh
}

fn merge_cached(
    health: &mut SessionHealth,
    source: &dyn DataSource,
    entry: &CacheEntry,
    now_ms: i64,
    refresh_error: Option<FetchError>,
) {
    let age_ms = freshness::age(entry.fetched_at, now_ms).as_millis() as u64;
    let state = if is_fresh(entry, source, now_ms) {
        SourceState::Fresh
    } else {
        SourceState::Stale
    };
    match source.merge(health, entry.data.clone()) {
        Ok(()) => {
            let mut status = SourceStatus::with_age(state, age_ms);
            status.error = refresh_error.map(|e| e.to_string());
            health.mark(source.id(), status);
        }
        Err(err) => {
            tracing::warn!(source = %source.id(), error = %err, "Cached value has the wrong shape");
            health.mark(source.id(), SourceStatus::failed(SourceState::Failed, err));
        }
    }
}

/// Merges one outcome and records how the source fared.
fn apply(health: &mut SessionHealth, source: &dyn DataSource, outcome: Outcome, ok_state: SourceState) {
    let result = outcome.and_then(|value| source.merge(health, value));
    let status = match result {
        Ok(()) => SourceStatus::new(ok_state),
        Err(err) => {
            let state = match err {
                FetchError::Timeout { .. } => SourceState::TimedOut,
                FetchError::DeadlineExceeded => SourceState::Skipped,
                FetchError::Failed(_) | FetchError::Shape(_) => SourceState::Failed,
            };
            tracing::debug!(source = %source.id(), error = %err, "Source contributed nothing");
            SourceStatus::failed(state, err)
        }
    };
    health.mark(source.id(), status);
}

/// Fetches every source on its own thread. Each is raced against
/// `min(timeout, deadline - now)`; a late source's thread is abandoned and its
/// outcome is `Timeout`. Outcomes come back in input order.
fn fan_out(sources: &[Arc<dyn DataSource>], ctx: &Arc<GatherContext>) -> Vec<Outcome> {
    let mut outcomes: Vec<Option<Outcome>> = (0..sources.len()).map(|_| None).collect();
    let (tx, rx) = mpsc::channel::<(usize, Outcome)>();
    let start = Instant::now();
    let mut pending: Vec<(usize, Instant, Duration)> = Vec::new();

    for (idx, source) in sources.iter().enumerate() {
        let budget = source
            .timeout()
            .min(ctx.deadline.saturating_duration_since(start));
        if budget.is_zero() {
            outcomes[idx] = Some(Err(FetchError::DeadlineExceeded));
            continue;
        }

        let worker_source = Arc::clone(source);
        let worker_ctx = Arc::clone(ctx);
        let worker_tx = tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("source-{}", source.id()))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker_source.fetch(&worker_ctx)))
                    .unwrap_or_else(|_| Err(FetchError::Failed("fetch panicked".to_string())));
                let _ = worker_tx.send((idx, outcome));
            });
        match spawned {
            Ok(_) => pending.push((idx, start + budget, budget)),
            Err(e) => outcomes[idx] = Some(Err(FetchError::Failed(format!("spawn: {}", e)))),
        }
    }
    drop(tx);

    while !pending.is_empty() {
        let now = Instant::now();
        pending.retain(|(idx, cutoff, budget)| {
            if now >= *cutoff {
                outcomes[*idx] = Some(Err(FetchError::Timeout {
                    after_ms: budget.as_millis() as u64,
                }));
                false
            } else {
                true
            }
        });
        let Some(next_cutoff) = pending.iter().map(|(_, cutoff, _)| *cutoff).min() else {
            break;
        };
        match rx.recv_timeout(next_cutoff.saturating_duration_since(now)) {
            Ok((idx, outcome)) => {
                if let Some(pos) = pending.iter().position(|(i, _, _)| *i == idx) {
                    pending.remove(pos);
                    outcomes[idx] = Some(outcome);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| Err(FetchError::Failed("no outcome".to_string()))))
        .collect()
}
