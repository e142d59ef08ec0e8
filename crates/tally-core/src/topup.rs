//! Top-up failure tracking types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{BalanceKey, DeclineType, PaymentMethodId, UserId};

/// Consecutive soft failures after which automatic top-ups stop until the
/// card changes.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Cooldown between automatic attempts after a soft decline.
pub const RETRY_COOLDOWN_HOURS: i64 = 24;

/// Persistent record of consecutive automatic top-up failures for one
/// (user, key) pair.
///
/// Created on the first failed automatic attempt, incremented on each
/// subsequent failure, and deleted on a successful charge, a webhook-confirmed
/// payment, or a detected payment-method change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpFailure {
    /// The user whose top-ups are failing.
    pub user_id: UserId,

    /// The balance key being topped up.
    pub key: BalanceKey,

    /// Consecutive failures since the last success.
    pub failure_count: u32,

    /// When the most recent failure happened.
    pub last_failure_at: DateTime<Utc>,

    /// Classification of the most recent decline.
    pub decline_type: DeclineType,

    /// Raw decline code of the most recent failure, if the network sent one.
    pub decline_code: Option<String>,

    /// Payment method that was charged when the failure happened.
    pub payment_method_id: Option<PaymentMethodId>,

    /// Operator kill-switch; blocks automatic attempts regardless of state.
    pub disabled: bool,
}

impl TopUpFailure {
    /// Whether automatic attempts are blocked until the card is updated.
    ///
    /// A record blocks either because the decline was hard, or because soft
    /// declines have accumulated to [`MAX_CONSECUTIVE_FAILURES`] — the stored
    /// decline type stays `soft`, but the effective state is hard-blocked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.disabled
            || self.decline_type == DeclineType::Hard
            || self.failure_count >= MAX_CONSECUTIVE_FAILURES
    }

    /// End of the retry cooldown after the most recent soft failure.
    #[must_use]
    pub fn cooldown_until(&self) -> DateTime<Utc> {
        self.last_failure_at + Duration::hours(RETRY_COOLDOWN_HOURS)
    }

    /// Whether the cooldown window is still running at `now`.
    #[must_use]
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        now < self.cooldown_until()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(count: u32, decline_type: DeclineType) -> TopUpFailure {
        TopUpFailure {
            user_id: UserId::generate(),
            key: BalanceKey::wallet(),
            failure_count: count,
            last_failure_at: Utc::now(),
            decline_type,
            decline_code: None,
            payment_method_id: None,
            disabled: false,
        }
    }

    #[test]
    fn hard_decline_blocks_immediately() {
        assert!(failure(1, DeclineType::Hard).is_blocked());
    }

    #[test]
    fn soft_declines_block_at_threshold() {
        assert!(!failure(2, DeclineType::Soft).is_blocked());
        assert!(failure(3, DeclineType::Soft).is_blocked());
    }

    #[test]
    fn disabled_flag_blocks() {
        let mut f = failure(1, DeclineType::Soft);
        f.disabled = true;
        assert!(f.is_blocked());
    }

    #[test]
    fn cooldown_window_is_24_hours() {
        let f = failure(1, DeclineType::Soft);
        assert!(f.in_cooldown(f.last_failure_at + Duration::hours(23)));
        assert!(!f.in_cooldown(f.last_failure_at + Duration::hours(25)));
    }
}
