//! Balance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BalanceKey, UserId};

/// A running balance for one (user, key) pair.
///
/// Balances are stored in the smallest indivisible unit: whole credits for
/// credit types, milli-cents (1/1000 of a cent) for the wallet key, so that
/// sub-cent per-unit pricing stays exact in integer arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// The user this balance belongs to.
    pub user_id: UserId,

    /// The balance key partitioning the user's ledger.
    pub key: BalanceKey,

    /// Current balance in the key's unit.
    pub balance: i64,

    /// ISO currency code, pinned by the first wallet write. `None` for
    /// credit-type keys and for wallet rows that have never been written.
    pub currency: Option<String>,

    /// When the balance row was created.
    pub created_at: DateTime<Utc>,

    /// When the balance row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    /// An empty balance for a pair that has no rows yet.
    ///
    /// Reading an absent balance is not an error; it reads as zero.
    #[must_use]
    pub fn empty(user_id: UserId, key: BalanceKey) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            key,
            balance: 0,
            currency: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_balance_reads_as_zero() {
        let record = BalanceRecord::empty(UserId::generate(), BalanceKey::wallet());
        assert_eq!(record.balance, 0);
        assert!(record.currency.is_none());
    }
}
