use chrono::{DateTime, Duration, Utc};
use maestro_core::{MaestroError, MaestroResult};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identifies one admission bucket: an integration plus the endpoint it is
/// calling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The integration making requests.
    pub integration_id: Uuid,
    /// The endpoint being requested.
    pub endpoint: String,
}

impl RateLimitKey {
    /// Creates a key for an integration and endpoint.
    pub fn new(integration_id: Uuid, endpoint: impl Into<String>) -> Self {
        Self {
            integration_id,
            endpoint: endpoint.into(),
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.integration_id, self.endpoint)
    }
}

/// One fixed admission window for a key.
#[derive(Debug, Clone)]
struct Bucket {
    requests_made: u32,
    requests_limit: u32,
    window_start: DateTime<Utc>,
    window_duration: Duration,
}

/// Fixed-window request admission control, one bucket per key.
///
/// The check-reset-increment sequence runs under one mutex hold per call,
/// so concurrent callers can never over-admit a window.
pub struct RateLimiter {
    default_limit: u32,
    default_window: Duration,
    buckets: Mutex<HashMap<RateLimitKey, Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter with the given per-window defaults.
    pub fn new(default_limit: u32, default_window: Duration) -> Self {
        Self {
            default_limit,
            default_window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the limit for one key. Takes effect at the next window.
    pub async fn set_limit(&self, key: RateLimitKey, limit: u32, window: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Utc::now();
        let bucket = buckets.entry(key).or_insert(Bucket {
            requests_made: 0,
            requests_limit: limit,
            window_start: now,
            window_duration: window,
        });
        bucket.requests_limit = limit;
        bucket.window_duration = window;
    }

    /// Admits or rejects one request for the key.
    ///
    /// A missing bucket is created (and the request admitted); an elapsed
    /// window resets the counter; otherwise the request is admitted iff the
    /// counter is below the limit, incrementing on admission.
    pub async fn allow(&self, key: &RateLimitKey, now: DateTime<Utc>) -> bool {
        let mut buckets = self.buckets.lock().await;

        let bucket = buckets.entry(key.clone()).or_insert(Bucket {
            requests_made: 0,
            requests_limit: self.default_limit,
            window_start: now,
            window_duration: self.default_window,
        });

        if now - bucket.window_start >= bucket.window_duration {
            bucket.requests_made = 0;
            bucket.window_start = now;
        }

        if bucket.requests_made < bucket.requests_limit {
            bucket.requests_made += 1;
            true
        } else {
            false
        }
    }

    /// Error-typed form of [`RateLimiter::allow`]: a rejection carries the
    /// instant the current window elapses.
    pub async fn admit(&self, key: &RateLimitKey, now: DateTime<Utc>) -> MaestroResult<()> {
        if self.allow(key, now).await {
            return Ok(());
        }
        let retry_at = self
            .retry_at(key)
            .await
            .unwrap_or_else(|| now + self.default_window);
        Err(MaestroError::RateLimitExceeded {
            key: key.to_string(),
            retry_at,
        })
    }

    /// When the key's current window elapses, if a bucket exists.
    pub async fn retry_at(&self, key: &RateLimitKey) -> Option<DateTime<Utc>> {
        let buckets = self.buckets.lock().await;
        buckets
            .get(key)
            .map(|b| b.window_start + b.window_duration)
    }

    /// Drops buckets whose window ended before `idle_since`.
    pub async fn cleanup(&self, idle_since: DateTime<Utc>) {
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, b| b.window_start + b.window_duration >= idle_since);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_exactly_the_limit_per_window() {
        let limiter = RateLimiter::new(5, Duration::seconds(60));
        let key = RateLimitKey::new(Uuid::new_v4(), "webhook");
        let now = Utc::now();

        let mut admitted = Vec::new();
        for _ in 0..6 {
            admitted.push(limiter.allow(&key, now).await);
        }
        assert_eq!(admitted, vec![true, true, true, true, true, false]);

        // After the window elapses the next call is admitted again.
        assert!(limiter.allow(&key, now + Duration::seconds(61)).await);
    }

    #[tokio::test]
    async fn test_window_reset_restores_full_budget() {
        let limiter = RateLimiter::new(2, Duration::seconds(10));
        let key = RateLimitKey::new(Uuid::new_v4(), "webhook");
        let now = Utc::now();

        assert!(limiter.allow(&key, now).await);
        assert!(limiter.allow(&key, now).await);
        assert!(!limiter.allow(&key, now).await);

        let later = now + Duration::seconds(10);
        assert!(limiter.allow(&key, later).await);
        assert!(limiter.allow(&key, later).await);
        assert!(!limiter.allow(&key, later).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::seconds(60));
        let integration = Uuid::new_v4();
        let now = Utc::now();

        let webhook = RateLimitKey::new(integration, "webhook");
        let api = RateLimitKey::new(integration, "api");

        assert!(limiter.allow(&webhook, now).await);
        assert!(!limiter.allow(&webhook, now).await);
        assert!(limiter.allow(&api, now).await);
    }

    #[tokio::test]
    async fn test_admit_reports_retry_time() {
        let limiter = RateLimiter::new(1, Duration::seconds(60));
        let key = RateLimitKey::new(Uuid::new_v4(), "webhook");
        let now = Utc::now();

        limiter.admit(&key, now).await.unwrap();
        let err = limiter.admit(&key, now).await.unwrap_err();
        match err {
            MaestroError::RateLimitExceeded { retry_at, .. } => {
                assert_eq!(retry_at, now + Duration::seconds(60));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_per_key_override() {
        let limiter = RateLimiter::new(100, Duration::seconds(60));
        let key = RateLimitKey::new(Uuid::new_v4(), "webhook");
        limiter.set_limit(key.clone(), 1, Duration::seconds(60)).await;

        let now = Utc::now();
        assert!(limiter.allow(&key, now).await);
        assert!(!limiter.allow(&key, now).await);
    }

    #[tokio::test]
    async fn test_cleanup_drops_stale_buckets() {
        let limiter = RateLimiter::new(1, Duration::seconds(10));
        let key = RateLimitKey::new(Uuid::new_v4(), "webhook");
        let now = Utc::now();

        limiter.allow(&key, now).await;
        limiter.cleanup(now + Duration::seconds(300)).await;
        assert!(limiter.retry_at(&key).await.is_none());
    }
}
