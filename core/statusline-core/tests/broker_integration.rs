//! Multi-process style coordination tests. Threads stand in for concurrent
//! status line processes: each builds its own coordinator and broker over a
//! shared storage root.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use statusline_core::broker::{CacheEntry, CacheFile, LockRecord};
use statusline_core::freshness::{classify_at, Freshness};
use statusline_core::health::SourceState;
use statusline_core::{
    Config, DataSourceDescriptor, DataSourceRegistry, FreshnessCategory, GatherContext,
    GlobalDataCache, SingleFlightCoordinator, StorageConfig, Tier, UnifiedDataBroker,
};
use tempfile::tempdir;

const DEAD_PID: u32 = 99_999_999;
const WORKERS: usize = 8;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Registry with one global "quota" source that counts its fetches.
fn counting_registry(fetches: Arc<AtomicUsize>, delay: Duration) -> DataSourceRegistry {
    let mut registry = DataSourceRegistry::new();
    registry
        .register(
            DataSourceDescriptor::new(
                "quota",
                Tier::Global,
                move |_ctx: &GatherContext| {
                    let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
                    thread::sleep(delay);
                    Ok(json!({ "remaining": 100, "fetch": n }))
                },
                |health, value| health.quota = Some(value),
            )
            .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();
    registry
}

fn seed_cache(storage: &StorageConfig, id: &str, data: serde_json::Value, age: Duration) {
    let mut file = CacheFile::default();
    file.sources.insert(
        id.to_string(),
        CacheEntry {
            data,
            fetched_at: now_ms() - age.as_millis() as i64,
            fetched_by: DEAD_PID,
        },
    );
    let path = storage.global_cache_file();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec(&file).unwrap()).unwrap();
}

fn context(storage: &StorageConfig, session: &str) -> GatherContext {
    GatherContext::new(session, storage.clone(), Config::default())
        .with_deadline(Instant::now() + Duration::from_secs(10))
}

#[test]
fn test_exactly_one_contender_acquires() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());

    for _round in 0..2 {
        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let storage = storage.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let coordinator = SingleFlightCoordinator::new(&storage);
                    barrier.wait();
                    let won = coordinator.try_acquire("billing");
                    // Hold until everyone has tried.
                    barrier.wait();
                    if won {
                        coordinator.release("billing", true);
                    }
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(!storage.lock_file("billing").exists());
    }
}

#[test]
fn test_lock_of_dead_process_is_taken_over() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    let record = LockRecord {
        pid: DEAD_PID,
        acquired_at: now_ms(),
        proc_started: None,
        token: "01HZZZZZZZZZZZZZZZZZZZZZZZ".to_string(),
    };
    std::fs::create_dir_all(storage.locks_dir()).unwrap();
    std::fs::write(storage.lock_file("quota"), serde_json::to_vec(&record).unwrap()).unwrap();

    let coordinator = SingleFlightCoordinator::new(&storage);
    assert!(coordinator.try_acquire("quota"));

    let current: LockRecord =
        serde_json::from_slice(&std::fs::read(storage.lock_file("quota")).unwrap()).unwrap();
    assert_eq!(current.pid, std::process::id());
    coordinator.release("quota", true);
}

#[test]
fn test_concurrent_gathers_refresh_stale_entry_once() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    seed_cache(&storage, "quota", json!({ "remaining": 1 }), Duration::from_secs(3600));

    let fetches = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let storage = storage.clone();
            let barrier = Arc::clone(&barrier);
            let registry = counting_registry(Arc::clone(&fetches), Duration::from_millis(100));
            thread::spawn(move || {
                let broker = UnifiedDataBroker::new(registry, storage.clone());
                let ctx = context(&storage, &format!("session-{}", i));
                barrier.wait();
                broker.gather_all(ctx)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    for health in &results {
        let status = &health.sources["quota"];
        assert!(
            matches!(
                status.state,
                SourceState::Fetched | SourceState::Stale | SourceState::Fresh
            ),
            "unexpected state {:?}",
            status.state
        );
        assert!(health.quota.is_some());
    }
    let fetched = results
        .iter()
        .filter(|h| h.sources["quota"].state == SourceState::Fetched)
        .count();
    assert_eq!(fetched, 1);

    let entry = GlobalDataCache::new(&storage).get("quota").unwrap();
    assert_eq!(entry.data["fetch"], 1);
    assert_eq!(entry.fetched_by, std::process::id());
    assert!(!storage.lock_file("quota").exists());
}

#[test]
fn test_fresh_entry_is_served_without_fetching() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    seed_cache(&storage, "quota", json!({ "remaining": 7 }), Duration::from_secs(1));

    let fetches = Arc::new(AtomicUsize::new(0));
    let broker = UnifiedDataBroker::new(
        counting_registry(Arc::clone(&fetches), Duration::ZERO),
        storage.clone(),
    );
    let health = broker.gather_all(context(&storage, "s1"));

    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert_eq!(health.sources["quota"].state, SourceState::Fresh);
    assert_eq!(health.quota, Some(json!({ "remaining": 7 })));
}

#[test]
fn test_cold_start_falls_back_when_lock_is_held_elsewhere() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());

    let other = SingleFlightCoordinator::new(&storage);
    assert!(other.try_acquire("quota"));

    let fetches = Arc::new(AtomicUsize::new(0));
    let broker = UnifiedDataBroker::new(
        counting_registry(Arc::clone(&fetches), Duration::ZERO),
        storage.clone(),
    );
    let health = broker.gather_all(context(&storage, "s1"));

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(health.sources["quota"].state, SourceState::Fallback);
    assert!(health.quota.is_some());
    // The fallback fetch is not published; the lock holder owns that.
    assert!(GlobalDataCache::new(&storage).get("quota").is_none());
    assert!(other.holds("quota"));
    other.release("quota", true);
}

#[test]
fn test_failed_refresh_keeps_serving_stale_value() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());
    seed_cache(&storage, "quota", json!({ "remaining": 3 }), Duration::from_secs(3600));

    let mut registry = DataSourceRegistry::new();
    registry
        .register(DataSourceDescriptor::new(
            "quota",
            Tier::Global,
            |_ctx: &GatherContext| -> Result<serde_json::Value, statusline_core::FetchError> {
                Err(statusline_core::FetchError::Failed("upstream down".to_string()))
            },
            |health, value| health.quota = Some(value),
        ))
        .unwrap();
    let broker = UnifiedDataBroker::new(registry, storage.clone());
    let health = broker.gather_all(context(&storage, "s1"));

    let status = &health.sources["quota"];
    assert_eq!(status.state, SourceState::Stale);
    assert!(status.error.as_deref().unwrap_or("").contains("upstream down"));
    assert_eq!(health.quota, Some(json!({ "remaining": 3 })));
    // Failure still frees the lock for the next process.
    assert!(!storage.lock_file("quota").exists());
}

#[test]
fn test_freshness_boundaries_follow_category_policy() {
    let now = now_ms();
    for category in [
        FreshnessCategory::Billing,
        FreshnessCategory::Quota,
        FreshnessCategory::Git,
        FreshnessCategory::Transcript,
    ] {
        let policy = category.policy();
        let ttl = policy.ttl.as_millis() as i64;
        let critical = policy.critical_after.as_millis() as i64;
        assert_eq!(classify_at(now - ttl, &category, now), Freshness::Fresh);
        assert_eq!(classify_at(now - ttl - 1, &category, now), Freshness::Stale);
        assert_eq!(classify_at(now - critical - 1, &category, now), Freshness::Critical);
        // Clock skew: a timestamp from the future is fresh, never negative age.
        assert_eq!(classify_at(now + 5_000, &category, now), Freshness::Fresh);
    }
}

#[test]
fn test_slow_session_source_times_out_without_blocking_others() {
    let temp = tempdir().unwrap();
    let storage = StorageConfig::with_root(temp.path().to_path_buf());

    let mut registry = DataSourceRegistry::new();
    registry
        .register(DataSourceDescriptor::new(
            "model",
            Tier::Instant,
            |ctx: &GatherContext| Ok(ctx.input_str(&["model", "display_name"]).map(str::to_string)),
            |health, name: Option<String>| {
                health.model = Some(statusline_core::health::ModelInfo {
                    id: None,
                    display_name: name,
                })
            },
        ))
        .unwrap();
    registry
        .register(
            DataSourceDescriptor::new(
                "slow",
                Tier::Session,
                |_ctx: &GatherContext| {
                    thread::sleep(Duration::from_secs(2));
                    Ok(json!("late"))
                },
                |health, value| health.quota = Some(value),
            )
            .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    registry
        .register(DataSourceDescriptor::new(
            "quick",
            Tier::Session,
            |_ctx: &GatherContext| Ok(3u32),
            |health, staged| {
                health.git = Some(statusline_core::health::GitStatus {
                    staged,
                    ..Default::default()
                })
            },
        ))
        .unwrap();

    let broker = UnifiedDataBroker::new(registry, storage.clone());
    let ctx = context(&storage, "s1").with_raw_input(json!({"model": {"display_name": "Opus"}}));
    let started = Instant::now();
    let health = broker.gather_all(ctx);

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(health.sources["model"].state, SourceState::Fetched);
    assert_eq!(health.sources["quick"].state, SourceState::Fetched);
    assert_eq!(health.sources["slow"].state, SourceState::TimedOut);
    assert_eq!(
        health.model.and_then(|m| m.display_name).as_deref(),
        Some("Opus")
    );
    assert_eq!(health.git.map(|g| g.staged), Some(3));
    assert!(health.quota.is_none());
}
