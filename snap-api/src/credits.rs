use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: u32, available: i64 },
    #[error("{command} query failed with: {error}")]
    Database {
        command: String,
        #[source]
        error: sqlx::Error,
    },
}

/// Per-user integer balance with atomic check-and-deduct.
///
/// Credits are deducted once at admission and refunded at most once per job
/// when the job terminally fails; refunds are idempotent at this layer so a
/// worker and a scanner racing on the same terminal transition can't refund
/// twice. Manual retries deduct again.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError>;

    /// Non-reserving affordability check, used where a denial must leave no
    /// side effects.
    async fn has_credits(&self, user_id: &str, amount: u32) -> Result<bool, LedgerError> {
        Ok(self.balance(user_id).await? >= i64::from(amount))
    }

    /// Atomically deduct `amount` or fail with `InsufficientCredits` without
    /// touching the balance.
    async fn deduct(
        &self,
        user_id: &str,
        amount: u32,
        reason: &str,
        job_id: &str,
    ) -> Result<i64, LedgerError>;

    /// Return `amount` to the user. A repeated refund for the same job is a
    /// no-op and returns the current balance.
    async fn refund(
        &self,
        user_id: &str,
        amount: u32,
        reason: &str,
        job_id: &str,
    ) -> Result<i64, LedgerError>;
}

/// Ledger backed by the `snap_user_credits` table. The balance guard lives in
/// the UPDATE's WHERE clause, so concurrent deducts can't oversubscribe.
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn db_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> LedgerError {
        move |error| LedgerError::Database {
            command: command.to_owned(),
            error,
        }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT credits FROM snap_user_credits WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Self::db_error("SELECT"))?;
        Ok(balance.unwrap_or(0))
    }

    async fn deduct(
        &self,
        user_id: &str,
        amount: u32,
        reason: &str,
        job_id: &str,
    ) -> Result<i64, LedgerError> {
        let new_balance: Option<i64> = sqlx::query_scalar(
            r#"
UPDATE snap_user_credits
SET credits = credits - $2, updated_at = NOW()
WHERE user_id = $1 AND credits >= $2
RETURNING credits
            "#,
        )
        .bind(user_id)
        .bind(i64::from(amount))
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_error("UPDATE"))?;

        let Some(new_balance) = new_balance else {
            let available = self.balance(user_id).await?;
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available,
            });
        };

        sqlx::query(
            r#"
INSERT INTO snap_credit_entries (user_id, job_id, kind, amount, reason)
VALUES ($1, $2, 'deduction'::snap_credit_entry_kind, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(job_id)
        .bind(i64::from(amount))
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Self::db_error("INSERT"))?;

        Ok(new_balance)
    }

    async fn refund(
        &self,
        user_id: &str,
        amount: u32,
        reason: &str,
        job_id: &str,
    ) -> Result<i64, LedgerError> {
        // The partial unique index on (job_id, kind='refund') makes this
        // insert the idempotency gate: only the first refund lands.
        let inserted = sqlx::query(
            r#"
INSERT INTO snap_credit_entries (user_id, job_id, kind, amount, reason)
VALUES ($1, $2, 'refund'::snap_credit_entry_kind, $3, $4)
ON CONFLICT (job_id, kind) WHERE kind = 'refund'::snap_credit_entry_kind DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(job_id)
        .bind(i64::from(amount))
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Self::db_error("INSERT"))?;

        if inserted.rows_affected() == 0 {
            return self.balance(user_id).await;
        }

        let new_balance: i64 = sqlx::query_scalar(
            r#"
UPDATE snap_user_credits
SET credits = credits + $2, updated_at = NOW()
WHERE user_id = $1
RETURNING credits
            "#,
        )
        .bind(user_id)
        .bind(i64::from(amount))
        .fetch_one(&self.pool)
        .await
        .map_err(Self::db_error("UPDATE"))?;

        Ok(new_balance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub user_id: String,
    pub job_id: String,
    pub amount: i64,
    pub reason: String,
}

#[derive(Default)]
struct MemoryLedgerInner {
    balances: HashMap<String, i64>,
    refunded_jobs: HashSet<String>,
    entries: Vec<LedgerEntry>,
}

/// In-memory ledger for tests and single-node use.
#[derive(Default)]
pub struct MemoryCreditLedger {
    inner: Mutex<MemoryLedgerInner>,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: &str, amount: i64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.balances.entry(user_id.to_string()).or_default() += amount;
    }

    pub fn entries_for(&self, user_id: &str) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn deduct(
        &self,
        user_id: &str,
        amount: u32,
        reason: &str,
        job_id: &str,
    ) -> Result<i64, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let balance = inner.balances.entry(user_id.to_string()).or_default();
        if *balance < i64::from(amount) {
            return Err(LedgerError::InsufficientCredits {
                required: amount,
                available: *balance,
            });
        }
        *balance -= i64::from(amount);
        let new_balance = *balance;
        inner.entries.push(LedgerEntry {
            user_id: user_id.to_string(),
            job_id: job_id.to_string(),
            amount: -i64::from(amount),
            reason: reason.to_string(),
        });
        Ok(new_balance)
    }

    async fn refund(
        &self,
        user_id: &str,
        amount: u32,
        reason: &str,
        job_id: &str,
    ) -> Result<i64, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.refunded_jobs.insert(job_id.to_string()) {
            return Ok(inner.balances.get(user_id).copied().unwrap_or(0));
        }
        let balance = inner.balances.entry(user_id.to_string()).or_default();
        *balance += i64::from(amount);
        let new_balance = *balance;
        inner.entries.push(LedgerEntry {
            user_id: user_id.to_string(),
            job_id: job_id.to_string(),
            amount: i64::from(amount),
            reason: reason.to_string(),
        });
        Ok(new_balance)
    }
}
