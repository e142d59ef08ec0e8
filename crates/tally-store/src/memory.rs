//! In-memory storage implementation for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tally_core::{
    BalanceKey, BalanceRecord, CreditTransaction, DeclineType, LedgerWrite, PaymentMethodId,
    TopUpFailure, TransactionId, TransactionSource, UserId,
};

use crate::error::{Result, StoreError};
use crate::{compute_delta, resolve_currency, Store};

type Pair = (UserId, BalanceKey);

#[derive(Default)]
struct State {
    balances: HashMap<Pair, BalanceRecord>,
    transactions: Vec<CreditTransaction>,
    failures: HashMap<Pair, TopUpFailure>,
    idempotency: HashSet<(UserId, BalanceKey, String)>,
}

/// HashMap-backed [`Store`] used by the test suites.
///
/// A single mutex serializes every mutation, which trivially satisfies the
/// per-(user, key) linearizability contract.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a failure record directly, bypassing [`Store::record_failure`].
    ///
    /// Tests use this to stage cooldown and blocked states with timestamps in
    /// the past.
    pub fn seed_failure(&self, failure: TopUpFailure) {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state
            .failures
            .insert((failure.user_id, failure.key.clone()), failure);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn balance(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
    ) -> Result<Option<BalanceRecord>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state.balances.get(&(*user_id, key.clone())).cloned())
    }

    async fn balances(&self, user_id: &UserId) -> Result<Vec<BalanceRecord>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        let mut rows: Vec<BalanceRecord> = state
            .balances
            .values()
            .filter(|r| r.user_id == *user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        Ok(rows)
    }

    async fn apply(&self, write: &LedgerWrite) -> Result<CreditTransaction> {
        let mut state = self.state.lock().expect("memory store lock poisoned");

        if let Some(idem) = &write.idempotency_key {
            let slot = (write.user_id, write.key.clone(), idem.clone());
            if state.idempotency.contains(&slot) {
                return Err(StoreError::IdempotencyConflict { key: idem.clone() });
            }
        }

        let pair = (write.user_id, write.key.clone());
        let current = state.balances.get(&pair).map_or(0, |r| r.balance);
        let pinned = state
            .balances
            .get(&pair)
            .and_then(|r| r.currency.clone());

        let delta = compute_delta(current, write.mode)?;
        let currency = resolve_currency(pinned.as_deref(), write.currency.as_deref())?;

        let now = Utc::now();
        let new_balance = current + delta;

        let record = state
            .balances
            .entry(pair)
            .or_insert_with(|| BalanceRecord::empty(write.user_id, write.key.clone()));
        record.balance = new_balance;
        record.currency = currency;
        record.updated_at = now;

        let tx = CreditTransaction {
            id: TransactionId::generate(),
            user_id: write.user_id,
            key: write.key.clone(),
            amount: delta,
            balance_after: new_balance,
            transaction_type: write.transaction_type,
            source: write.source,
            source_id: write.source_id.clone(),
            idempotency_key: write.idempotency_key.clone(),
            description: write.description.clone(),
            created_at: now,
        };

        if let Some(idem) = &write.idempotency_key {
            state
                .idempotency
                .insert((write.user_id, write.key.clone(), idem.clone()));
        }
        state.transactions.push(tx.clone());

        Ok(tx)
    }

    async fn history(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<CreditTransaction>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == *user_id && tx.key == *key)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_auto_top_ups_since(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        let state = self.state.lock().expect("memory store lock poisoned");
        let count = state
            .transactions
            .iter()
            .filter(|tx| {
                tx.user_id == *user_id
                    && tx.key == *key
                    && tx.source == TransactionSource::AutoTopUp
                    && tx.created_at >= since
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn failure(&self, user_id: &UserId, key: &BalanceKey) -> Result<Option<TopUpFailure>> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state.failures.get(&(*user_id, key.clone())).cloned())
    }

    async fn record_failure(
        &self,
        user_id: &UserId,
        key: &BalanceKey,
        payment_method_id: Option<&PaymentMethodId>,
        decline_type: DeclineType,
        decline_code: Option<&str>,
    ) -> Result<TopUpFailure> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let entry = state
            .failures
            .entry((*user_id, key.clone()))
            .and_modify(|f| f.failure_count += 1)
            .or_insert_with(|| TopUpFailure {
                user_id: *user_id,
                key: key.clone(),
                failure_count: 1,
                last_failure_at: Utc::now(),
                decline_type,
                decline_code: None,
                payment_method_id: None,
                disabled: false,
            });
        entry.last_failure_at = Utc::now();
        entry.decline_type = decline_type;
        entry.decline_code = decline_code.map(String::from);
        entry.payment_method_id = payment_method_id.cloned();
        Ok(entry.clone())
    }

    async fn clear_failures(&self, user_id: &UserId, key: &BalanceKey) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.failures.remove(&(*user_id, key.clone()));
        Ok(())
    }

    async fn clear_all_failures(&self, user_id: &UserId) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.failures.retain(|(user, _), _| user != user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{TransactionType, WriteMode};

    fn add(user_id: UserId, key: &BalanceKey, amount: i64) -> LedgerWrite {
        LedgerWrite {
            user_id,
            key: key.clone(),
            mode: WriteMode::Add { amount },
            transaction_type: TransactionType::Grant,
            source: TransactionSource::Manual,
            source_id: None,
            idempotency_key: None,
            description: None,
            currency: None,
        }
    }

    #[tokio::test]
    async fn absent_balance_reads_as_none() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        let key: BalanceKey = "api_calls".parse().unwrap();
        assert!(store.balance(&user, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_chains_balance_after() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        let key: BalanceKey = "api_calls".parse().unwrap();

        let tx1 = store.apply(&add(user, &key, 100)).await.unwrap();
        assert_eq!(tx1.balance_after, 100);

        let mut consume = add(user, &key, 0);
        consume.mode = WriteMode::Subtract {
            amount: 30,
            allow_negative: false,
        };
        consume.transaction_type = TransactionType::Consume;
        consume.source = TransactionSource::Usage;
        let tx2 = store.apply(&consume).await.unwrap();
        assert_eq!(tx2.amount, -30);
        assert_eq!(tx2.balance_after, 70);
    }

    #[tokio::test]
    async fn idempotency_key_replay_is_rejected() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        let key: BalanceKey = "api_calls".parse().unwrap();

        let mut write = add(user, &key, 100);
        write.idempotency_key = Some("grant-1".into());
        store.apply(&write).await.unwrap();

        let err = store.apply(&write).await.unwrap_err();
        assert!(matches!(err, StoreError::IdempotencyConflict { .. }));
        assert_eq!(
            store.balance(&user, &key).await.unwrap().unwrap().balance,
            100
        );
    }

    #[tokio::test]
    async fn history_is_newest_first_and_pageable() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        let key: BalanceKey = "api_calls".parse().unwrap();

        for amount in [10, 20, 30] {
            store.apply(&add(user, &key, amount)).await.unwrap();
        }

        let page = store.history(&user, &key, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].amount, 30);
        assert_eq!(page[1].amount, 20);

        let rest = store.history(&user, &key, 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].amount, 10);
    }

    #[tokio::test]
    async fn record_failure_initializes_then_increments() {
        let store = MemoryStore::new();
        let user = UserId::generate();
        let key = BalanceKey::wallet();

        let first = store
            .record_failure(&user, &key, None, DeclineType::Soft, Some("insufficient_funds"))
            .await
            .unwrap();
        assert_eq!(first.failure_count, 1);

        let second = store
            .record_failure(&user, &key, None, DeclineType::Soft, Some("try_again_later"))
            .await
            .unwrap();
        assert_eq!(second.failure_count, 2);
        assert_eq!(second.decline_code.as_deref(), Some("try_again_later"));

        store.clear_failures(&user, &key).await.unwrap();
        assert!(store.failure(&user, &key).await.unwrap().is_none());
    }
}
