//! Decline-code classification.
//!
//! Card networks report a decline code with most failed charges. The code
//! decides whether a retry can ever succeed: a hard decline means the payment
//! method is permanently unusable, a soft decline (insufficient funds, generic
//! processing errors) may clear on its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ledger::UnknownVariant;

/// Decline codes for which the card is permanently unusable.
const HARD_DECLINE_CODES: &[&str] = &[
    "expired_card",
    "lost_card",
    "stolen_card",
    "pickup_card",
    "fraudulent",
    "incorrect_number",
    "invalid_number",
    "incorrect_cvc",
    "invalid_cvc",
    "invalid_expiry_month",
    "invalid_expiry_year",
    "restricted_card",
];

/// Classification of a payment decline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineType {
    /// The payment method is permanently unusable; retrying is pointless.
    Hard,

    /// Possibly transient (insufficient funds, processing errors); a retry
    /// after a cooldown may succeed.
    Soft,
}

impl DeclineType {
    /// Stable string form used by the persistence layer.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }
}

impl FromStr for DeclineType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard" => Ok(Self::Hard),
            "soft" => Ok(Self::Soft),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

impl fmt::Display for DeclineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a decline code.
///
/// An absent code classifies as soft: without evidence the card is dead, the
/// failure is treated as transient.
#[must_use]
pub fn classify_decline(code: Option<&str>) -> DeclineType {
    match code {
        Some(code) if HARD_DECLINE_CODES.contains(&code) => DeclineType::Hard,
        _ => DeclineType::Soft,
    }
}
