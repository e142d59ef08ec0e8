//! PostgreSQL storage implementation.
//!
//! Every ledger mutation runs in a database transaction that locks the
//! balance row (`SELECT … FOR UPDATE`), so concurrent writes to the same
//! (user, key) pair serialize at the store while other pairs proceed
//! unblocked. The idempotency-key uniqueness constraint rejects replays at
//! the insert itself; there is no separate check-then-insert step to race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tally_core::{
    BalanceKey, BalanceRecord, CreditTransaction, DeclineType, LedgerWrite, PaymentMethodId,
    TopUpFailure, TransactionId, UserId,
};

use crate::error::{Result, StoreError};
use crate::{compute_delta, resolve_currency, Store};

/// Embedded schema migrations (see `migrations/`).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Unique index enforcing at-most-once application of idempotency keys.
const IDEMPOTENCY_INDEX: &str = "ledger_transactions_idempotency_idx";

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_balance(row: &PgRow) -> Result<BalanceRecord> {
    let user_id: Uuid = row.try_get("user_id")?;
    let key: String = row.try_get("balance_key")?;
    Ok(BalanceRecord {
        user_id: UserId::from_uuid(user_id),
        key: key
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("balance_key {key:?}: {e}")))?,
        balance: row.try_get("balance")?,
        currency: row.try_get("currency")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decode_transaction(row: &PgRow) -> Result<CreditTransaction> {
    let id: String = row.try_get("id")?;
    let user_id: Uuid = row.try_get("user_id")?;
    let key: String = row.try_get("balance_key")?;
    let transaction_type: String = row.try_get("transaction_type")?;
    let source: String = row.try_get("source")?;
    Ok(CreditTransaction {
        id: id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("transaction id {id:?}: {e}")))?,
        user_id: UserId::from_uuid(user_id),
        key: key
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("balance_key {key:?}: {e}")))?,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        transaction_type: transaction_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("transaction_type: {e}")))?,
        source: source
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("source: {e}")))?,
        source_id: row.try_get("source_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn decode_failure(row: &PgRow) -> Result<TopUpFailure> {
    let user_id: Uuid = row.try_get("user_id")?;
    let key: String = row.try_get("balance_key")?;
    let failure_count: i32 = row.try_get("failure_count")?;
    let decline_type: String = row.try_get("decline_type")?;
    let payment_method_id: Option<String> = row.try_get("payment_method_id")?;
    Ok(TopUpFailure {
        user_id: UserId::from_uuid(user_id),
        key: key
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("balance_key {key:?}: {e}")))?,
        failure_count: u32::try_from(failure_count).unwrap_or(0),
        last_failure_at: row.try_get("last_failure_at")?,
        decline_type: decline_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("decline_type: {e}")))?,
        decline_code: row.try_get("decline_code")?,
        payment_method_id: payment_method_id
            .map(|pm| {
                pm.parse()
                    .map_err(|e| StoreError::Corrupt(format!("payment_method_id: {e}")))
            })
            .transpose()?,
        disabled: row.try_get("disabled")?,
    })
}

fn is_idempotency_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if db.is_unique_violation() && db.constraint() == Some(IDEMPOTENCY_INDEX)
    )
}

#[async_trait]
impl Store for PgStore {
    async fn balance(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
    ) -> Result<Option<BalanceRecord>> {
        let row = sqlx::query(
            "SELECT user_id, balance_key, balance, currency, created_at, updated_at \
             FROM balances WHERE user_id = $1 AND balance_key = $2",
        )
        .bind(*user_id.as_uuid())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_balance).transpose()
    }

    async fn balances(&self, user_id: &UserId) -> Result<Vec<BalanceRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, balance_key, balance, currency, created_at, updated_at \
             FROM balances WHERE user_id = $1 ORDER BY balance_key",
        )
        .bind(*user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_balance).collect()
    }

    async fn apply(&self, write: &LedgerWrite) -> Result<CreditTransaction> {
        let user = *write.user_id.as_uuid();
        let key = write.key.as_str();

        let mut tx = self.pool.begin().await?;

        // Ensure the row exists so FOR UPDATE has something to lock.
        sqlx::query(
            "INSERT INTO balances (user_id, balance_key) VALUES ($1, $2) \
             ON CONFLICT (user_id, balance_key) DO NOTHING",
        )
        .bind(user)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT balance, currency FROM balances \
             WHERE user_id = $1 AND balance_key = $2 FOR UPDATE",
        )
        .bind(user)
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;
        let current: i64 = row.try_get("balance")?;
        let pinned: Option<String> = row.try_get("currency")?;

        let delta = compute_delta(current, write.mode)?;
        let currency = resolve_currency(pinned.as_deref(), write.currency.as_deref())?;
        let new_balance = current + delta;

        sqlx::query(
            "UPDATE balances SET balance = $3, currency = $4, updated_at = now() \
             WHERE user_id = $1 AND balance_key = $2",
        )
        .bind(user)
        .bind(key)
        .bind(new_balance)
        .bind(currency.as_deref())
        .execute(&mut *tx)
        .await?;

        let id = TransactionId::generate();
        let created_at = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO ledger_transactions \
             (id, user_id, balance_key, amount, balance_after, transaction_type, source, \
              source_id, idempotency_key, description, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(id.to_string())
        .bind(user)
        .bind(key)
        .bind(delta)
        .bind(new_balance)
        .bind(write.transaction_type.as_str())
        .bind(write.source.as_str())
        .bind(write.source_id.as_deref())
        .bind(write.idempotency_key.as_deref())
        .bind(write.description.as_deref())
        .bind(created_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            // The transaction rolls back on drop; no partial balance survives.
            if is_idempotency_violation(&err) {
                return Err(StoreError::IdempotencyConflict {
                    key: write.idempotency_key.clone().unwrap_or_default(),
                });
            }
            return Err(err.into());
        }

        tx.commit().await?;

        Ok(CreditTransaction {
            id,
            user_id: write.user_id,
            key: write.key.clone(),
            amount: delta,
            balance_after: new_balance,
            transaction_type: write.transaction_type,
            source: write.source,
            source_id: write.source_id.clone(),
            idempotency_key: write.idempotency_key.clone(),
            description: write.description.clone(),
            created_at,
        })
    }

    async fn history(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query(
            "SELECT id, user_id, balance_key, amount, balance_after, transaction_type, \
                    source, source_id, idempotency_key, description, created_at \
             FROM ledger_transactions \
             WHERE user_id = $1 AND balance_key = $2 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3 OFFSET $4",
        )
        .bind(*user_id.as_uuid())
        .bind(key.as_str())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_transaction).collect()
    }

    async fn count_auto_top_ups_since(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM ledger_transactions \
             WHERE user_id = $1 AND balance_key = $2 AND source = 'auto_topup' \
               AND created_at >= $3",
        )
        .bind(*user_id.as_uuid())
        .bind(key.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    async fn failure(&self, user_id: &UserId, key: &BalanceKey) -> Result<Option<TopUpFailure>> {
        let row = sqlx::query(
            "SELECT user_id, balance_key, failure_count, last_failure_at, decline_type, \
                    decline_code, payment_method_id, disabled \
             FROM top_up_failures WHERE user_id = $1 AND balance_key = $2",
        )
        .bind(*user_id.as_uuid())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_failure).transpose()
    }

    async fn record_failure(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        payment_method_id: Option<&PaymentMethodId>,
        decline_type: DeclineType,
        decline_code: Option<&str>,
    ) -> Result<TopUpFailure> {
        let row = sqlx::query(
            "INSERT INTO top_up_failures \
             (user_id, balance_key, failure_count, last_failure_at, decline_type, \
              decline_code, payment_method_id, disabled) \
             VALUES ($1, $2, 1, now(), $3, $4, $5, FALSE) \
             ON CONFLICT (user_id, balance_key) DO UPDATE SET \
                 failure_count = top_up_failures.failure_count + 1, \
                 last_failure_at = now(), \
                 decline_type = EXCLUDED.decline_type, \
                 decline_code = EXCLUDED.decline_code, \
                 payment_method_id = EXCLUDED.payment_method_id \
             RETURNING user_id, balance_key, failure_count, last_failure_at, decline_type, \
                       decline_code, payment_method_id, disabled",
        )
        .bind(*user_id.as_uuid())
        .bind(key.as_str())
        .bind(decline_type.as_str())
        .bind(decline_code)
        .bind(payment_method_id.map(PaymentMethodId::as_str))
        .fetch_one(&self.pool)
        .await?;
        decode_failure(&row)
    }

    async fn clear_failures(&self, user_id: &UserId, key: &BalanceKey) -> Result<()> {
        sqlx::query("DELETE FROM top_up_failures WHERE user_id = $1 AND balance_key = $2")
            .bind(*user_id.as_uuid())
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_all_failures(&self, user_id: &UserId) -> Result<()> {
        sqlx::query("DELETE FROM top_up_failures WHERE user_id = $1")
            .bind(*user_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
