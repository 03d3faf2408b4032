use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The rate-limit ceilings a user's subscription grants. Read-mostly: looked
/// up through a small TTL cache owned by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub hourly_limit: u32,
    pub minute_limit: u32,
    pub max_concurrency: u32,
}

impl Plan {
    pub fn free() -> Self {
        Self {
            id: "free".to_string(),
            hourly_limit: 100,
            minute_limit: 10,
            max_concurrency: 3,
        }
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("plan lookup failed: {0}")]
    Lookup(String),
}

/// Where plans come from. Billing and plan management live outside the core;
/// this port only resolves a user to their current ceilings.
#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn plan_for(&self, user_id: &str) -> Result<Plan, PlanError>;
}

/// Fixed plan table, used in tests and in deployments where plans are
/// configuration rather than data.
pub struct StaticPlanProvider {
    default_plan: Plan,
    overrides: HashMap<String, Plan>,
}

impl StaticPlanProvider {
    pub fn new(default_plan: Plan) -> Self {
        Self {
            default_plan,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, user_id: &str, plan: Plan) -> Self {
        self.overrides.insert(user_id.to_string(), plan);
        self
    }
}

#[async_trait]
impl PlanProvider for StaticPlanProvider {
    async fn plan_for(&self, user_id: &str) -> Result<Plan, PlanError> {
        Ok(self
            .overrides
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_plan.clone()))
    }
}

/// Per-user plan cache with a TTL. Entries are refreshed on read once they
/// age out; a stale read never blocks admission longer than one provider
/// call.
pub struct PlanCache {
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, (Plan, DateTime<Utc>)>>,
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).expect("plan cache ttl out of range"),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        provider: &dyn PlanProvider,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Plan, PlanError> {
        {
            let entries = self.entries.lock().unwrap();
            if let Some((plan, fetched_at)) = entries.get(user_id) {
                if now - *fetched_at < self.ttl {
                    return Ok(plan.clone());
                }
            }
        }

        let plan = provider.plan_for(user_id).await?;
        self.entries
            .lock()
            .unwrap()
            .insert(user_id.to_string(), (plan.clone(), now));
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PlanProvider for CountingProvider {
        async fn plan_for(&self, _user_id: &str) -> Result<Plan, PlanError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Plan::free())
        }
    }

    #[tokio::test]
    async fn cache_serves_fresh_entries_without_a_lookup() {
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
        };
        let cache = PlanCache::new(Duration::from_secs(300));
        let now = Utc::now();

        cache.get(&provider, "u1", now).await.unwrap();
        cache.get(&provider, "u1", now + chrono::Duration::seconds(299)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        cache.get(&provider, "u1", now + chrono::Duration::seconds(301)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overrides_beat_the_default_plan() {
        let premium = Plan {
            id: "premium".to_string(),
            hourly_limit: 1000,
            minute_limit: 100,
            max_concurrency: 10,
        };
        let provider =
            StaticPlanProvider::new(Plan::free()).with_override("u-premium", premium.clone());

        assert_eq!(provider.plan_for("u-premium").await.unwrap(), premium);
        assert_eq!(provider.plan_for("u-free").await.unwrap(), Plan::free());
    }
}
