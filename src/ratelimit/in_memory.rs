use std::collections::HashMap;

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::{StoreError, StoreResult},
    ratelimit::{BlockStatus, Increment, Policy, Store, WINDOW},
};

/// Single-lock store. Every operation on every key is linearized by one mutex,
/// which makes it exact under contention but unsuited to heavy production load.
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    fail_on_call: bool,
}

#[derive(Default)]
struct StoreState {
    counts: HashMap<String, Counter>,
    blocks: HashMap<String, Instant>,
}

struct Counter {
    count: u64,
    window_ends: Instant,
}

impl StoreState {
    fn sweep(&mut self, now: Instant) {
        self.blocks.retain(|_, until| *until > now);
        self.counts.retain(|_, counter| counter.window_ends > now);
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            fail_on_call: false,
        }
    }

    /// A store whose every operation fails, for exercising fail-closed paths.
    pub fn unavailable() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            fail_on_call: true,
        }
    }

    /// Drops the key's counter. An active block is left in place.
    pub async fn reset_counter(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.state.lock().await.counts.remove(key);
        Ok(())
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.fail_on_call {
            return Err(StoreError::StorageFailure(
                "in-memory store configured to fail".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn increment(&self, key: &str, policy: &Policy) -> StoreResult<Increment> {
        self.ensure_available()?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        state.sweep(now);

        if let Some(until) = state.blocks.get(key) {
            return Ok(Increment {
                allowed: false,
                ttl: until.saturating_duration_since(now),
            });
        }

        let counter = state
            .counts
            .entry(key.to_string())
            .or_insert_with(|| Counter {
                count: 0,
                window_ends: now + WINDOW,
            });
        counter.count += 1;

        if counter.count > policy.limit {
            let block = policy.block_duration();
            state.blocks.insert(key.to_string(), now + block);
            return Ok(Increment {
                allowed: false,
                ttl: block,
            });
        }

        Ok(Increment {
            allowed: true,
            ttl: counter.window_ends.saturating_duration_since(now),
        })
    }

    async fn is_blocked(&self, key: &str) -> StoreResult<BlockStatus> {
        self.ensure_available()?;

        let mut state = self.state.lock().await;
        let now = Instant::now();

        match state.blocks.get(key).copied() {
            Some(until) if until > now => Ok(BlockStatus {
                blocked: true,
                ttl: until.saturating_duration_since(now),
            }),
            Some(_) => {
                state.blocks.remove(key);
                Ok(BlockStatus::default())
            }
            None => Ok(BlockStatus::default()),
        }
    }

    async fn get_request_count(&self, key: &str) -> StoreResult<u64> {
        self.ensure_available()?;

        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .counts
            .get(key)
            .filter(|counter| counter.window_ends > now)
            .map(|counter| counter.count)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::task::JoinSet;

    use super::InMemoryStore;
    use crate::{
        error::StoreError,
        ratelimit::{MAX_BLOCK_SECONDS, Policy, Store, WINDOW},
    };

    #[tokio::test(start_paused = true)]
    async fn blocks_the_request_after_the_limit() {
        let store = InMemoryStore::new();
        let policy = Policy::new(5, 10);

        for _ in 0..5 {
            let outcome = store.increment("test-key", &policy).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.ttl, WINDOW);
        }
        assert_eq!(store.get_request_count("test-key").await.unwrap(), 5);

        let outcome = store.increment("test-key", &policy).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.ttl, Duration::from_secs(10));

        let status = store.is_blocked("test-key").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.ttl, Duration::from_secs(10));
        assert_eq!(store.get_request_count("test-key").await.unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn denies_while_blocked_without_counting() {
        let store = InMemoryStore::new();
        let policy = Policy::new(1, 10);

        store.increment("k", &policy).await.unwrap();
        store.increment("k", &policy).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;

        let outcome = store.increment("k", &policy).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.ttl, Duration::from_millis(9_500));
        assert_eq!(store.get_request_count("k").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn block_ttl_counts_down_and_expires() {
        let store = InMemoryStore::new();
        let policy = Policy::new(3, 1);

        for _ in 0..=3 {
            store.increment("expiring", &policy).await.unwrap();
        }
        assert!(store.is_blocked("expiring").await.unwrap().blocked);

        tokio::time::advance(Duration::from_millis(400)).await;
        let status = store.is_blocked("expiring").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.ttl, Duration::from_millis(600));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.is_blocked("expiring").await.unwrap().blocked);
        assert!(store.state.lock().await.blocks.is_empty());

        let outcome = store.increment("expiring", &policy).await.unwrap();
        assert!(outcome.allowed, "fresh window after the block expired");
        assert_eq!(store.get_request_count("expiring").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_every_window() {
        let store = InMemoryStore::new();
        let policy = Policy::new(2, 30);

        assert!(store.increment("w", &policy).await.unwrap().allowed);
        tokio::time::advance(Duration::from_millis(300)).await;
        let outcome = store.increment("w", &policy).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.ttl, Duration::from_millis(700));

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(store.get_request_count("w").await.unwrap(), 0);
        assert!(store.increment("w", &policy).await.unwrap().allowed);
        assert!(store.increment("w", &policy).await.unwrap().allowed);
        assert!(!store.increment("w", &policy).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_counted_independently() {
        let store = InMemoryStore::new();
        let policy = Policy::new(5, 10);

        for i in 0..10 {
            let key = format!("key-{i}");
            for _ in 0..5 {
                assert!(store.increment(&key, &policy).await.unwrap().allowed);
            }
            assert!(!store.increment(&key, &policy).await.unwrap().allowed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn increment_sweeps_expired_blocks_of_other_keys() {
        let store = InMemoryStore::new();
        let policy = Policy::new(0, 1);

        store.increment("a", &policy).await.unwrap();
        store.increment("b", &policy).await.unwrap();
        assert_eq!(store.state.lock().await.blocks.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        store.increment("c", &policy).await.unwrap();

        let state = store.state.lock().await;
        assert_eq!(state.blocks.len(), 1);
        assert!(state.blocks.contains_key("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_counter_starts_a_fresh_count() {
        let store = InMemoryStore::new();
        let policy = Policy::new(3, 10);

        for _ in 0..3 {
            store.increment("r", &policy).await.unwrap();
        }
        store.reset_counter("r").await.unwrap();
        assert_eq!(store.get_request_count("r").await.unwrap(), 0);

        for _ in 0..3 {
            assert!(store.increment("r", &policy).await.unwrap().allowed);
        }
        assert!(!store.increment("r", &policy).await.unwrap().allowed);

        store.reset_counter("r").await.unwrap();
        assert!(
            !store.increment("r", &policy).await.unwrap().allowed,
            "reset leaves an active block in place"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_block_durations_do_not_overflow() {
        let store = InMemoryStore::new();
        let policy = Policy::new(0, u64::MAX);

        let outcome = store.increment("forever", &policy).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.ttl, Duration::from_secs(MAX_BLOCK_SECONDS));

        tokio::time::advance(Duration::from_secs(3_600)).await;
        let status = store.is_blocked("forever").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.ttl, Duration::from_secs(MAX_BLOCK_SECONDS - 3_600));
    }

    #[tokio::test]
    async fn failing_store_reports_storage_failure() {
        let store = InMemoryStore::unavailable();
        let policy = Policy::new(5, 10);

        assert!(matches!(
            store.increment("error-key", &policy).await,
            Err(StoreError::StorageFailure(_))
        ));
        assert!(matches!(
            store.is_blocked("error-key").await,
            Err(StoreError::StorageFailure(_))
        ));
        assert!(matches!(
            store.get_request_count("error-key").await,
            Err(StoreError::StorageFailure(_))
        ));
        assert!(store.reset_counter("error-key").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_allow_exactly_the_limit() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Policy::new(100, 5);

        let mut tasks = JoinSet::new();
        for _ in 0..200 {
            let store = store.clone();
            tasks.spawn(async move { store.increment("high-traffic", &policy).await });
        }

        let mut allowed = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 100);
        let status = store.is_blocked("high-traffic").await.unwrap();
        assert!(status.blocked);
        assert!(status.ttl > Duration::ZERO);
    }

    async fn wave(store: &Arc<InMemoryStore>, key: &'static str, policy: Policy, size: u64) -> u64 {
        let mut tasks = JoinSet::new();
        for _ in 0..size {
            let store = store.clone();
            tasks.spawn(async move { store.increment(key, &policy).await });
        }

        let mut allowed = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }
        allowed
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_waves_stay_blocked_until_the_block_expires() {
        let store = Arc::new(InMemoryStore::new());
        let policy = Policy::new(50, 1);
        let burst = policy.limit * 2;

        assert_eq!(wave(&store, "burst", policy, burst).await, 50);
        assert_eq!(
            wave(&store, "burst", policy, burst).await,
            0,
            "a wave inside the block allows nothing"
        );
        assert_eq!(store.get_request_count("burst").await.unwrap(), 51);

        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert_eq!(wave(&store, "burst", policy, burst).await, 50);
        assert_eq!(wave(&store, "burst", policy, burst).await, 0);
        assert!(store.is_blocked("burst").await.unwrap().blocked);
    }
}
