//! Stripe gateway implementation.
//!
//! Production implementation of [`crate::gateway::ChargeGateway`] and
//! [`crate::gateway::SubscriptionGateway`] against the Stripe REST API.

pub mod client;
pub mod types;

pub use client::{StripeClient, StripeError};
