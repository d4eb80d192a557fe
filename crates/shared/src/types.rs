//! Common types used across Subtrack

use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// The type of billing plan
///
/// Exactly one `FreeDefault` plan exists system-wide; it is the plan every
/// customer starts on and the plan lapsed customers degrade to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// The free plan all customers start on
    FreeDefault,
    /// Staff/comped plans, not purchasable
    FreePrivate,
    /// Publicly subscribable paid plan
    PaidPublic,
}

impl Default for PlanType {
    fn default() -> Self {
        Self::FreeDefault
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanType::FreeDefault => write!(f, "free_default"),
            PlanType::FreePrivate => write!(f, "free_private"),
            PlanType::PaidPublic => write!(f, "paid_public"),
        }
    }
}

/// Whether payments are flowing for a customer
///
/// `Off` means no active billing relationship is being pursued. Any state
/// other than `Off` implies a subscription id is present on the customer
/// (enforced by a CHECK constraint at the storage layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Off,
    Ok,
    Error,
    RequiresPaymentMethod,
}

impl Default for PaymentState {
    fn default() -> Self {
        Self::Off
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentState::Off => write!(f, "off"),
            PaymentState::Ok => write!(f, "ok"),
            PaymentState::Error => write!(f, "error"),
            PaymentState::RequiresPaymentMethod => write!(f, "requires_payment_method"),
        }
    }
}

/// Processing status of a stored payment-processor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Received, not yet picked up
    New,
    /// Picked up for dispatch (durability checkpoint)
    Pending,
    /// Dispatch completed
    Processed,
    /// Dispatch failed or the event kind is not actionable
    Error,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::New => write!(f, "new"),
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Processed => write!(f, "processed"),
            EventStatus::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Card summary
// =============================================================================

/// Display-only summary of the customer's last-known card.
/// Never used for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSummary {
    pub brand: String,
    pub last4: String,
    pub exp_month: i32,
    pub exp_year: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_type_display() {
        assert_eq!(PlanType::FreeDefault.to_string(), "free_default");
        assert_eq!(PlanType::FreePrivate.to_string(), "free_private");
        assert_eq!(PlanType::PaidPublic.to_string(), "paid_public");
    }

    #[test]
    fn test_payment_state_display() {
        assert_eq!(PaymentState::Off.to_string(), "off");
        assert_eq!(PaymentState::Ok.to_string(), "ok");
        assert_eq!(
            PaymentState::RequiresPaymentMethod.to_string(),
            "requires_payment_method"
        );
    }

    #[test]
    fn test_event_status_display() {
        assert_eq!(EventStatus::New.to_string(), "new");
        assert_eq!(EventStatus::Pending.to_string(), "pending");
        assert_eq!(EventStatus::Processed.to_string(), "processed");
        assert_eq!(EventStatus::Error.to_string(), "error");
    }
}
