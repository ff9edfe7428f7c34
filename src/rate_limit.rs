//! Token-bucket rate limiting by identity class (spec §4.8, §5).
//!
//! Four classes — `auth, push, pull, other` — each with an independent
//! per-identity bucket refilled continuously at the class's configured
//! requests-per-minute. Identity is `(api_key_id OR client_ip)`. Admin
//! endpoints are exempt from gating but still counted for audit via
//! [`RateLimiter::record_admin_usage`].

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::config::RateLimits;
use crate::control::ControlStore;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityClass {
    Auth,
    Push,
    Pull,
    Other,
}

impl IdentityClass {
    fn as_str(self) -> &'static str {
        match self {
            IdentityClass::Auth => "auth",
            IdentityClass::Push => "push",
            IdentityClass::Pull => "pull",
            IdentityClass::Other => "other",
        }
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    limits: RateLimits,
    buckets: Mutex<HashMap<(String, IdentityClass), Bucket>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn capacity_for(&self, class: IdentityClass) -> u32 {
        match class {
            IdentityClass::Auth => self.limits.auth,
            IdentityClass::Push => self.limits.push,
            IdentityClass::Pull => self.limits.pull,
            IdentityClass::Other => self.limits.other,
        }
    }

    /// Checks and consumes one token for `(identity, class)`. On exhaustion,
    /// records a `RateLimitEvent` and returns `429 rate_limited`.
    pub async fn check(
        &self,
        control: &ControlStore,
        identity: &str,
        class: IdentityClass,
    ) -> Result<(), ApiError> {
        let allowed = {
            let mut buckets = self.buckets.lock().await;
            let capacity = self.capacity_for(class);
            let bucket = buckets
                .entry((identity.to_string(), class))
                .or_insert_with(|| Bucket::new(capacity));
            bucket.try_consume()
        };

        if allowed {
            Ok(())
        } else {
            let _ = control.append_rate_limit_event(identity, class.as_str()).await;
            Err(ApiError::rate_limited(60 / self.capacity_for(class).max(1) as u64))
        }
    }

    /// Admin endpoints never get rejected by this limiter, but usage is still
    /// recorded for the audit trail (spec §4.8: "still counted for audit").
    pub async fn record_admin_usage(&self, control: &ControlStore, identity: &str) {
        let _ = control.append_rate_limit_event(identity, "admin").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn control() -> (TempDir, ControlStore) {
        let dir = TempDir::new().unwrap();
        let store = ControlStore::new(&dir.path().join("server.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn exhausts_then_rejects() {
        let (_dir, control_store) = control().await;
        let limiter = RateLimiter::new(RateLimits {
            auth: 2,
            push: 600,
            pull: 1200,
            other: 300,
        });
        assert!(limiter.check(&control_store, "key:1", IdentityClass::Auth).await.is_ok());
        assert!(limiter.check(&control_store, "key:1", IdentityClass::Auth).await.is_ok());
        let err = limiter
            .check(&control_store, "key:1", IdentityClass::Auth)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn separate_identities_have_independent_buckets() {
        let (_dir, control_store) = control().await;
        let limiter = RateLimiter::new(RateLimits {
            auth: 1,
            push: 600,
            pull: 1200,
            other: 300,
        });
        assert!(limiter.check(&control_store, "key:1", IdentityClass::Auth).await.is_ok());
        assert!(limiter.check(&control_store, "key:2", IdentityClass::Auth).await.is_ok());
    }
}
