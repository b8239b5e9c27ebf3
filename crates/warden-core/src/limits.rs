//! Pure quota evaluation. No I/O: callers supply usage and the current time.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::{
    domain::{Panel, SECONDS_PER_DAY},
    formatting::{format_bytes, format_duration},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Users,
    Traffic,
    Time,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Traffic => "traffic",
            Self::Time => "time",
        }
    }

    fn render(self, value: u64) -> String {
        match self {
            Self::Users => value.to_string(),
            Self::Traffic => format_bytes(value),
            Self::Time => format_duration(value as i64),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breach {
    pub dimension: Dimension,
    pub used: u64,
    pub limit: u64,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} > {}",
            self.dimension.as_str(),
            self.dimension.render(self.used),
            self.dimension.render(self.limit)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Warning {
    pub dimension: Dimension,
    pub ratio: f64,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {:.0}%",
            self.dimension.as_str(),
            self.ratio * 100.0
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LimitCheckResult {
    pub expired: bool,
    /// In evaluation order; the first entry is the reported cause.
    pub breaches: Vec<Breach>,
    pub warnings: Vec<Warning>,
    pub remaining_days: i64,
    pub user_count: u32,
    pub effective_traffic: u64,
    pub elapsed_seconds: u64,
}

impl LimitCheckResult {
    pub fn is_breached(&self) -> bool {
        self.expired || !self.breaches.is_empty()
    }

    pub fn cause(&self) -> Option<String> {
        if self.expired {
            return Some("validity period ended".to_string());
        }
        self.breaches.first().map(|b| b.to_string())
    }

    pub fn breached(&self, dimension: Dimension) -> bool {
        self.breaches.iter().any(|b| b.dimension == dimension)
    }
}

pub fn expires_at(panel: &Panel) -> DateTime<Utc> {
    panel.created_at + Duration::seconds(panel.quotas.validity_days as i64 * SECONDS_PER_DAY)
}

pub fn is_expired(panel: &Panel, now: DateTime<Utc>) -> bool {
    now > expires_at(panel)
}

/// Whole days left in the validity window, rounded up, never negative.
pub fn remaining_days(panel: &Panel, now: DateTime<Utc>) -> i64 {
    let secs = (expires_at(panel) - now).num_seconds();
    if secs <= 0 {
        return 0;
    }
    (secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

pub fn elapsed_seconds(panel: &Panel, now: DateTime<Utc>) -> u64 {
    (now - panel.created_at).num_seconds().max(0) as u64
}

/// Decide whether `panel` breached any quota or its validity window.
///
/// Expiration is checked first and short-circuits. Otherwise users, traffic
/// and elapsed time are checked in that order and every breach is recorded.
/// Dimensions at or above `warning_threshold` of their limit without
/// breaching produce warnings.
pub fn evaluate(
    panel: &Panel,
    effective_traffic: u64,
    user_count: u32,
    now: DateTime<Utc>,
    warning_threshold: f64,
) -> LimitCheckResult {
    let elapsed = elapsed_seconds(panel, now);
    let mut result = LimitCheckResult {
        expired: false,
        breaches: Vec::new(),
        warnings: Vec::new(),
        remaining_days: remaining_days(panel, now),
        user_count,
        effective_traffic,
        elapsed_seconds: elapsed,
    };

    if is_expired(panel, now) {
        result.expired = true;
        result.breaches.push(Breach {
            dimension: Dimension::Time,
            used: elapsed,
            limit: panel.quotas.validity_days as u64 * SECONDS_PER_DAY as u64,
        });
        return result;
    }

    let q = &panel.quotas;
    let checks = [
        (Dimension::Users, user_count as u64, q.max_users as u64),
        (Dimension::Traffic, effective_traffic, q.max_traffic),
        (Dimension::Time, elapsed, q.max_total_time),
    ];

    for (dimension, used, limit) in checks {
        if limit == 0 {
            continue; // unlimited
        }
        if used > limit {
            result.breaches.push(Breach {
                dimension,
                used,
                limit,
            });
            continue;
        }
        let ratio = used as f64 / limit as f64;
        if ratio >= warning_threshold {
            result.warnings.push(Warning { dimension, ratio });
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PanelId, PanelState, Quotas, Secret, UserId, GIB};
    use chrono::TimeZone;

    fn panel_at(created_at: DateTime<Utc>, quotas: Quotas) -> Panel {
        Panel {
            id: PanelId(1),
            operator: UserId(100),
            display_name: None,
            username: "shop".to_string(),
            password: Secret::new("pw"),
            original_password: None,
            pending_password: None,
            quotas,
            state: PanelState::Active,
            deactivation: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn quotas(days: u32) -> Quotas {
        Quotas {
            max_users: 10,
            max_traffic: 100 * GIB,
            max_total_time: 0,
            validity_days: days,
        }
    }

    #[test]
    fn expiration_boundaries() {
        let d = 30;
        let p = panel_at(t0(), quotas(d));

        let before = t0() + Duration::days(d as i64 - 1);
        assert!(!is_expired(&p, before));
        assert_eq!(remaining_days(&p, before), 1);

        let after = t0() + Duration::days(d as i64 + 1);
        assert!(is_expired(&p, after));
        assert_eq!(remaining_days(&p, after), 0);

        assert_eq!(remaining_days(&p, t0()), d as i64);
    }

    #[test]
    fn remaining_days_rounds_partial_days_up() {
        let p = panel_at(t0(), quotas(30));
        let now = t0() + Duration::days(10) + Duration::hours(1);
        assert_eq!(remaining_days(&p, now), 20);
    }

    #[test]
    fn expiration_short_circuits_other_checks() {
        let p = panel_at(t0(), quotas(1));
        let r = evaluate(&p, 500 * GIB, 50, t0() + Duration::days(2), 0.8);
        assert!(r.expired);
        assert_eq!(r.breaches.len(), 1);
        assert_eq!(r.breaches[0].dimension, Dimension::Time);
        assert!(r.warnings.is_empty());
        assert_eq!(r.cause().as_deref(), Some("validity period ended"));
    }

    #[test]
    fn traffic_breach_and_warning() {
        let p = panel_at(t0(), quotas(30));
        let now = t0() + Duration::days(1);

        let ok = evaluate(&p, 65 * GIB, 3, now, 0.8);
        assert!(!ok.is_breached());
        assert!(ok.warnings.is_empty());

        let warn = evaluate(&p, 90 * GIB, 3, now, 0.8);
        assert!(!warn.is_breached());
        assert_eq!(warn.warnings.len(), 1);
        assert_eq!(warn.warnings[0].dimension, Dimension::Traffic);
        assert!((warn.warnings[0].ratio - 0.9).abs() < 1e-9);

        let over = evaluate(&p, 110 * GIB, 3, now, 0.8);
        assert!(over.is_breached());
        assert!(over.breached(Dimension::Traffic));
        assert!(over.cause().unwrap().starts_with("traffic"));
    }

    #[test]
    fn limits_are_strictly_greater_than() {
        let p = panel_at(t0(), quotas(30));
        let now = t0() + Duration::hours(1);
        let at_limit = evaluate(&p, 100 * GIB, 10, now, 0.8);
        assert!(!at_limit.is_breached());
        assert_eq!(at_limit.warnings.len(), 2);
    }

    #[test]
    fn all_breaches_recorded_first_is_cause() {
        let mut q = quotas(30);
        q.max_total_time = 3600;
        let p = panel_at(t0(), q);
        let r = evaluate(&p, 200 * GIB, 11, t0() + Duration::days(2), 0.8);
        let dims: Vec<_> = r.breaches.iter().map(|b| b.dimension).collect();
        assert_eq!(dims, vec![Dimension::Users, Dimension::Traffic, Dimension::Time]);
        assert_eq!(r.cause().as_deref(), Some("users 11 > 10"));
    }

    #[test]
    fn zero_limits_are_unlimited() {
        let q = Quotas {
            max_users: 0,
            max_traffic: 0,
            max_total_time: 0,
            validity_days: 30,
        };
        let p = panel_at(t0(), q);
        let r = evaluate(&p, u64::MAX, u32::MAX, t0() + Duration::days(1), 0.8);
        assert!(!r.is_breached());
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn evaluation_before_creation_does_not_underflow() {
        let p = panel_at(t0(), quotas(30));
        let r = evaluate(&p, 0, 0, t0() - Duration::hours(3), 0.8);
        assert_eq!(r.elapsed_seconds, 0);
        assert!(!r.is_breached());
    }
}
