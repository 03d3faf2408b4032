use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use thiserror::Error;

use snap_core::Clock;

use crate::credits::{CreditLedger, LedgerError};
use crate::plans::{PlanCache, PlanError, PlanProvider};

/// Which admission gate is being consulted. Screenshot traffic is subject to
/// the windowed caps; analysis traffic only passes the monthly credit gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Screenshot,
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    HourlyCapReached,
    MinuteCapReached,
    MonthlyCreditsExhausted,
}

impl DenyReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            DenyReason::HourlyCapReached => "hourly_cap",
            DenyReason::MinuteCapReached => "minute_cap",
            DenyReason::MonthlyCreditsExhausted => "monthly_credits",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied {
        retry_after: Duration,
        reason: DenyReason,
    },
}

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Short-window counters, anchored to the wall-clock hour and minute the
/// first request of the window arrived in. A stale anchor means the window
/// rolled over and the counter resets.
struct Buckets {
    hour_anchor: DateTime<Utc>,
    hour_count: u32,
    minute_anchor: DateTime<Utc>,
    minute_count: u32,
}

impl Buckets {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            hour_anchor: truncate(now, 3600),
            hour_count: 0,
            minute_anchor: truncate(now, 60),
            minute_count: 0,
        }
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        let hour = truncate(now, 3600);
        if self.hour_anchor != hour {
            self.hour_anchor = hour;
            self.hour_count = 0;
        }
        let minute = truncate(now, 60);
        if self.minute_anchor != minute {
            self.minute_anchor = minute;
            self.minute_count = 0;
        }
    }
}

fn truncate(now: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
    let secs = now.timestamp() - now.timestamp().rem_euclid(window_secs);
    DateTime::from_timestamp(secs, 0).unwrap_or(now)
}

/// Plan-aware admission gate. `check` is the single source of truth for the
/// short-term counters: a permitted call increments them as a side effect, a
/// denied call never does, and admission calls it exactly once per attempt.
pub struct RateLimiter {
    provider: Arc<dyn PlanProvider>,
    ledger: Arc<dyn CreditLedger>,
    clock: Arc<dyn Clock>,
    plans: PlanCache,
    buckets: Mutex<HashMap<(String, OperationType), Buckets>>,
}

const PLAN_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

impl RateLimiter {
    pub fn new(
        provider: Arc<dyn PlanProvider>,
        ledger: Arc<dyn CreditLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            ledger,
            clock,
            plans: PlanCache::new(PLAN_CACHE_TTL),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(
        &self,
        user_id: &str,
        op: OperationType,
    ) -> Result<RateDecision, LimiterError> {
        let now = self.clock.now();
        let plan = self.plans.get(self.provider.as_ref(), user_id, now).await?;

        // Monthly gate first: with no credits left, the window counters are
        // irrelevant and must not move.
        if self.ledger.balance(user_id).await? <= 0 {
            return Ok(self.deny(DenyReason::MonthlyCreditsExhausted, until_next_month(now)));
        }

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((user_id.to_string(), op))
            .or_insert_with(|| Buckets::new(now));
        bucket.refresh(now);

        if op == OperationType::Screenshot {
            if bucket.hour_count >= plan.hourly_limit {
                return Ok(self.deny(DenyReason::HourlyCapReached, until_next_window(now, 3600)));
            }
            if bucket.minute_count >= plan.minute_limit {
                return Ok(self.deny(DenyReason::MinuteCapReached, until_next_window(now, 60)));
            }
        }

        bucket.hour_count += 1;
        bucket.minute_count += 1;
        metrics::counter!("rate_limit_decisions_total", &[("decision", "allowed")]).increment(1);
        Ok(RateDecision::Allowed)
    }

    fn deny(&self, reason: DenyReason, retry_after: Duration) -> RateDecision {
        metrics::counter!("rate_limit_decisions_total", &[("decision", reason.as_tag())])
            .increment(1);
        RateDecision::Denied {
            retry_after,
            reason,
        }
    }
}

fn until_next_window(now: DateTime<Utc>, window_secs: i64) -> Duration {
    let next = truncate(now, window_secs).timestamp() + window_secs;
    Duration::from_secs((next - now.timestamp()).max(1) as u64)
}

fn until_next_month(now: DateTime<Utc>) -> Duration {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let rollover = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now + chrono::Duration::days(31));
    (rollover - now).to_std().unwrap_or(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::MemoryCreditLedger;
    use crate::plans::{Plan, StaticPlanProvider};
    use snap_core::TestClock;

    fn limiter_with(plan: Plan, credits: i64) -> (Arc<TestClock>, Arc<MemoryCreditLedger>, RateLimiter) {
        let clock = Arc::new(TestClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 30).single().unwrap(),
        ));
        let ledger = Arc::new(MemoryCreditLedger::new());
        ledger.grant("u1", credits);
        let limiter = RateLimiter::new(
            Arc::new(StaticPlanProvider::new(plan)),
            ledger.clone(),
            clock.clone(),
        );
        (clock, ledger, limiter)
    }

    fn plan(hourly: u32, minute: u32) -> Plan {
        Plan {
            id: "test".to_string(),
            hourly_limit: hourly,
            minute_limit: minute,
            max_concurrency: 3,
        }
    }

    #[tokio::test]
    async fn hourly_cap_boundary() {
        let (_, _, limiter) = limiter_with(plan(2, 100), 100);

        assert_eq!(
            limiter.check("u1", OperationType::Screenshot).await.unwrap(),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.check("u1", OperationType::Screenshot).await.unwrap(),
            RateDecision::Allowed
        );

        match limiter.check("u1", OperationType::Screenshot).await.unwrap() {
            RateDecision::Denied {
                retry_after,
                reason,
            } => {
                assert_eq!(reason, DenyReason::HourlyCapReached);
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(3600));
            }
            RateDecision::Allowed => panic!("expected denial at the cap"),
        }
    }

    #[tokio::test]
    async fn minute_cap_resets_at_the_window_edge() {
        let (clock, _, limiter) = limiter_with(plan(100, 1), 100);

        assert_eq!(
            limiter.check("u1", OperationType::Screenshot).await.unwrap(),
            RateDecision::Allowed
        );
        assert!(matches!(
            limiter.check("u1", OperationType::Screenshot).await.unwrap(),
            RateDecision::Denied {
                reason: DenyReason::MinuteCapReached,
                ..
            }
        ));

        clock.advance(Duration::from_secs(60));
        assert_eq!(
            limiter.check("u1", OperationType::Screenshot).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn denial_does_not_consume_a_slot() {
        let (clock, _, limiter) = limiter_with(plan(100, 1), 100);

        limiter.check("u1", OperationType::Screenshot).await.unwrap();
        // Two denials in the same minute...
        for _ in 0..2 {
            assert!(matches!(
                limiter.check("u1", OperationType::Screenshot).await.unwrap(),
                RateDecision::Denied { .. }
            ));
        }
        // ...leave the next minute's budget untouched.
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            limiter.check("u1", OperationType::Screenshot).await.unwrap(),
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn analysis_skips_windowed_caps() {
        let (_, _, limiter) = limiter_with(plan(1, 1), 100);

        for _ in 0..5 {
            assert_eq!(
                limiter.check("u1", OperationType::Analysis).await.unwrap(),
                RateDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn exhausted_credits_deny_until_next_month() {
        let (_, _, limiter) = limiter_with(plan(100, 100), 0);

        match limiter.check("u1", OperationType::Screenshot).await.unwrap() {
            RateDecision::Denied {
                retry_after,
                reason,
            } => {
                assert_eq!(reason, DenyReason::MonthlyCreditsExhausted);
                // 2025-03-10 12:00:30 UTC -> rollover at April 1st.
                let expected = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single().unwrap()
                    - Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 30).single().unwrap();
                assert_eq!(retry_after, expected.to_std().unwrap());
            }
            RateDecision::Allowed => panic!("expected monthly gate denial"),
        }
    }

    #[tokio::test]
    async fn december_rolls_over_into_january() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 0, 0).single().unwrap();
        assert_eq!(until_next_month(now), Duration::from_secs(3600));
    }
}
