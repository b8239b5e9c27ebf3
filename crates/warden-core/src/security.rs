use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::domain::UserId;

// ============== Roles ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Full control over every panel.
    Sudo,
    /// Owns at least one panel; may only look at their own.
    Operator,
    Stranger,
}

/// Classify a chat user. `owns_panels` is only consulted for non-sudo users.
pub fn role_of(user_id: Option<UserId>, sudo_admins: &[i64], owns_panels: bool) -> Role {
    if is_authorized(user_id, sudo_admins) {
        return Role::Sudo;
    }
    if user_id.is_some() && owns_panels {
        return Role::Operator;
    }
    Role::Stranger
}

pub fn is_authorized(user_id: Option<UserId>, allowed_users: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    allowed_users.contains(&user_id.0)
}

// ============== Command rate limiter (token bucket) ==============

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Per-user token bucket guarding commands that hit the remote service.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    max_tokens: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, window: Duration) -> Self {
        let max_tokens = max_tokens.max(1) as f64;
        Self {
            max_tokens,
            refill_per_sec: max_tokens / window.as_secs_f64().max(1e-9),
            buckets: HashMap::new(),
        }
    }

    /// `Ok(())` when allowed, otherwise how long until the next token.
    pub fn check(&mut self, user_id: UserId) -> Result<(), Duration> {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> Result<(), Duration> {
        let bucket = self.buckets.entry(user_id).or_insert_with(|| Bucket {
            tokens: self.max_tokens,
            last_update: now,
        });

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        Err(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles() {
        let sudo = [1, 2];
        assert_eq!(role_of(Some(UserId(1)), &sudo, false), Role::Sudo);
        assert_eq!(role_of(Some(UserId(9)), &sudo, true), Role::Operator);
        assert_eq!(role_of(Some(UserId(9)), &sudo, false), Role::Stranger);
        assert_eq!(role_of(None, &sudo, true), Role::Stranger);
    }

    #[test]
    fn bucket_empties_and_refills() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        let u = UserId(5);
        assert!(rl.check_at(u, t0).is_ok());
        assert!(rl.check_at(u, t0).is_ok());
        let wait = rl.check_at(u, t0).unwrap_err();
        assert!(wait > Duration::from_secs(25) && wait <= Duration::from_secs(30));

        assert!(rl.check_at(u, t0 + Duration::from_secs(31)).is_ok());
        // Other users have their own bucket.
        assert!(rl.check_at(UserId(6), t0).is_ok());
    }
}
