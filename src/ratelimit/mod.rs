pub mod in_memory;
pub mod redis_backend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::http::StatusCode;

use crate::error::StoreResult;

/// Counting window. Fixed from the first increment of a key and never configurable.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Longest block a policy imposes. Larger configured durations are clamped to it so
/// block expiries stay representable as an `Instant` and as a Redis `PX` argument.
pub const MAX_BLOCK_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

const LIMITED_MESSAGE: &str = "you have reached the maximum number of requests or actions allowed within a certain time frame";
const UNAVAILABLE_MESSAGE: &str = "internal error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub limit: u64,
    pub block_seconds: u64,
}

impl Policy {
    pub fn new(limit: u64, block_seconds: u64) -> Self {
        Self {
            limit,
            block_seconds: block_seconds.min(MAX_BLOCK_SECONDS),
        }
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_seconds.min(MAX_BLOCK_SECONDS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    pub allowed: bool,
    /// Remaining window time when allowed, remaining block time when denied.
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStatus {
    pub blocked: bool,
    pub ttl: Duration,
}

/// Counting backend shared by every request task.
///
/// Implementations own both the per-key counters and the block records. A
/// non-expired block always wins over the counter, and establishing a block must
/// be set-if-absent so racing callers agree on a single expiry.
#[async_trait]
pub trait Store: Send + Sync {
    async fn increment(&self, key: &str, policy: &Policy) -> StoreResult<Increment>;

    async fn is_blocked(&self, key: &str) -> StoreResult<BlockStatus>;

    async fn get_request_count(&self, key: &str) -> StoreResult<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after_secs: u64 },
    /// The store failed; the request is denied rather than let through.
    Unavailable,
}

impl Decision {
    fn limited(ttl: Duration) -> Self {
        let retry_after_secs = ttl
            .as_secs()
            .saturating_add(u64::from(ttl.subsec_nanos() > 0));
        Self::Limited { retry_after_secs }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Allowed => StatusCode::OK,
            Self::Limited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Allowed => "",
            Self::Limited { .. } => LIMITED_MESSAGE,
            Self::Unavailable => UNAVAILABLE_MESSAGE,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
    anonymous: Policy,
    credentialed: Policy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, anonymous: Policy, credentialed: Policy) -> Self {
        Self {
            store,
            anonymous,
            credentialed,
        }
    }

    pub fn policy(&self, credentialed: bool) -> &Policy {
        if credentialed {
            &self.credentialed
        } else {
            &self.anonymous
        }
    }

    pub async fn allow(&self, key: &str, credentialed: bool) -> Decision {
        let policy = self.policy(credentialed);

        let status = match self.store.is_blocked(key).await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(key, error = %err, "block lookup failed; denying request");
                return Decision::Unavailable;
            }
        };
        if status.blocked {
            return Decision::limited(status.ttl);
        }

        match self.store.increment(key, policy).await {
            Ok(outcome) if outcome.allowed => Decision::Allowed,
            Ok(outcome) => {
                tracing::info!(
                    key,
                    limit = policy.limit,
                    block_seconds = policy.block_seconds,
                    "limit exceeded"
                );
                Decision::limited(outcome.ttl)
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "counter increment failed; denying request");
                Decision::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::http::StatusCode;

    use super::{
        Decision, MAX_BLOCK_SECONDS, Policy, RateLimiter, Store, in_memory::InMemoryStore,
    };

    fn limiter(store: Arc<InMemoryStore>) -> RateLimiter {
        RateLimiter::new(store, Policy::new(5, 300), Policy::new(10, 300))
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_keys_use_the_address_policy() {
        let limiter = limiter(Arc::new(InMemoryStore::new()));

        for _ in 0..5 {
            assert_eq!(limiter.allow("ip:10.0.0.1", false).await, Decision::Allowed);
        }
        let denied = limiter.allow("ip:10.0.0.1", false).await;
        assert_eq!(denied, Decision::Limited { retry_after_secs: 300 });
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(denied.message().starts_with("you have reached the maximum"));
    }

    #[tokio::test(start_paused = true)]
    async fn credentialed_keys_use_the_token_policy() {
        let limiter = limiter(Arc::new(InMemoryStore::new()));

        for _ in 0..10 {
            assert!(limiter.allow("token:abc", true).await.is_allowed());
        }
        assert!(!limiter.allow("token:abc", true).await.is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_keys_are_denied_without_counting() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store.clone());

        for _ in 0..6 {
            limiter.allow("ip:10.0.0.2", false).await;
        }
        assert_eq!(store.get_request_count("ip:10.0.0.2").await, Ok(6));

        tokio::time::advance(Duration::from_secs(10)).await;
        let decision = limiter.allow("ip:10.0.0.2", false).await;
        assert_eq!(decision, Decision::Limited { retry_after_secs: 290 });
        assert_eq!(store.get_request_count("ip:10.0.0.2").await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_recover_after_the_block_expires() {
        let limiter = limiter(Arc::new(InMemoryStore::new()));

        for _ in 0..6 {
            limiter.allow("ip:10.0.0.3", false).await;
        }
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(limiter.allow("ip:10.0.0.3", false).await.is_allowed());
    }

    #[tokio::test]
    async fn storage_failures_fail_closed() {
        let limiter = limiter(Arc::new(InMemoryStore::unavailable()));

        let decision = limiter.allow("ip:10.0.0.4", false).await;
        assert_eq!(decision, Decision::Unavailable);
        assert!(!decision.is_allowed());
        assert_eq!(decision.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(decision.message(), "internal error");
    }

    #[test]
    fn oversized_block_durations_are_clamped() {
        let policy = Policy::new(0, u64::MAX);
        assert_eq!(policy.block_seconds, MAX_BLOCK_SECONDS);
        assert_eq!(policy.block_duration(), Duration::from_secs(MAX_BLOCK_SECONDS));

        let built_by_hand = Policy {
            limit: 0,
            block_seconds: u64::MAX,
        };
        assert_eq!(
            built_by_hand.block_duration(),
            Duration::from_secs(MAX_BLOCK_SECONDS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_block_durations_deny_without_panicking() {
        let limiter = RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            Policy::new(5, u64::MAX),
            Policy::new(10, 300),
        );

        for _ in 0..5 {
            assert!(limiter.allow("ip:10.0.0.5", false).await.is_allowed());
        }
        assert_eq!(
            limiter.allow("ip:10.0.0.5", false).await,
            Decision::Limited {
                retry_after_secs: MAX_BLOCK_SECONDS
            }
        );
        assert_eq!(
            limiter.allow("ip:10.0.0.5", false).await,
            Decision::Limited {
                retry_after_secs: MAX_BLOCK_SECONDS
            }
        );
    }

    #[test]
    fn retry_after_rounds_partial_seconds_up() {
        assert_eq!(
            Decision::limited(Duration::from_millis(1_200)),
            Decision::Limited { retry_after_secs: 2 }
        );
        assert_eq!(
            Decision::limited(Duration::from_secs(3)),
            Decision::Limited { retry_after_secs: 3 }
        );
        assert_eq!(
            Decision::limited(Duration::MAX),
            Decision::Limited {
                retry_after_secs: u64::MAX
            }
        );
    }
}
