//! Subscription state derivation
//!
//! Maps a customer's stored billing attributes into one lifecycle state
//! label. This answers the question: "where in the subscription lifecycle is
//! this customer right now?"
//!
//! ## Design Principles
//!
//! 1. **Pure**: no I/O, no side effects; same inputs always produce the
//!    same label
//! 2. **Total**: every attribute combination maps to exactly one label, with
//!    `Unknown` as the catch-all for combinations that should not occur
//! 3. **Recomputed on demand**: the label is a display/gating artifact, never
//!    stored; the raw attributes are the state of record, so there is nothing
//!    to drift out of sync

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use subtrack_shared::{PaymentState, PlanType};

use crate::store::CustomerRecord;

/// Derived lifecycle state of a customer.
///
/// Serialized labels are hierarchical dotted tags: base bucket, sub-phase,
/// qualifier. Consumers treat the label as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Never had any billing relationship
    #[serde(rename = "free_default.new")]
    FreeDefaultNew,
    /// Paid or free-private plan that lapsed with no more payments coming
    #[serde(rename = "free_default.canceled")]
    FreeDefaultCanceled,
    /// Signup whose payment never succeeded and whose incomplete
    /// subscription has since expired remotely; there is no period end to
    /// test against, so this is distinct from `FreeDefaultCanceled`
    #[serde(rename = "free_default.canceled.incomplete")]
    FreeDefaultCanceledIncomplete,
    /// Initial signup attempt whose payment failed; no paid period was ever
    /// confirmed
    #[serde(rename = "free_default.incomplete.requires_payment_method")]
    FreeDefaultIncompleteRequiresPaymentMethod,
    /// Renewal payment failing and the paid period has already lapsed;
    /// treated as expired even though the processor is still retrying
    #[serde(rename = "free_default.past_due.requires_payment_method")]
    FreeDefaultPastDueRequiresPaymentMethod,
    /// Paid plan in good standing
    #[serde(rename = "paid.paying")]
    PaidPaying,
    /// Canceled but paid through the end of the period; can be reactivated
    #[serde(rename = "paid.will_cancel")]
    PaidWillCancel,
    /// Remote subscription is gone but the period end has not quite passed.
    /// Only reachable transiently: the processor's cancellation webhook
    /// lands slightly before the period end it was scheduled for.
    #[serde(rename = "paid.canceled")]
    PaidCanceled,
    /// Renewal payment failing but paid time remains; access continues while
    /// the processor retries
    #[serde(rename = "paid.past_due.requires_payment_method")]
    PaidPastDueRequiresPaymentMethod,
    /// Free-private plan with no expiration
    #[serde(rename = "free_private.indefinite")]
    FreePrivateIndefinite,
    /// Free-private plan with an expiration date in the future
    #[serde(rename = "free_private.will_expire")]
    FreePrivateWillExpire,
    /// Attributes match no known combination; upstream shows a
    /// contact-support message
    #[serde(rename = "unknown")]
    Unknown,
}

impl SubscriptionState {
    /// The dotted label, identical to the serialized form.
    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionState::FreeDefaultNew => "free_default.new",
            SubscriptionState::FreeDefaultCanceled => "free_default.canceled",
            SubscriptionState::FreeDefaultCanceledIncomplete => "free_default.canceled.incomplete",
            SubscriptionState::FreeDefaultIncompleteRequiresPaymentMethod => {
                "free_default.incomplete.requires_payment_method"
            }
            SubscriptionState::FreeDefaultPastDueRequiresPaymentMethod => {
                "free_default.past_due.requires_payment_method"
            }
            SubscriptionState::PaidPaying => "paid.paying",
            SubscriptionState::PaidWillCancel => "paid.will_cancel",
            SubscriptionState::PaidCanceled => "paid.canceled",
            SubscriptionState::PaidPastDueRequiresPaymentMethod => {
                "paid.past_due.requires_payment_method"
            }
            SubscriptionState::FreePrivateIndefinite => "free_private.indefinite",
            SubscriptionState::FreePrivateWillExpire => "free_private.will_expire",
            SubscriptionState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A period has expired once its end is at or before `now`. The boundary is
/// inclusive of `now`, uniformly across all rules; `state::tests` pins this
/// convention.
pub(crate) fn period_expired(period_end: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    matches!(period_end, Some(end) if end <= now)
}

/// Derive the lifecycle state from a customer's stored billing attributes.
///
/// Rules are evaluated most specific first. The raw attributes remain the
/// state of record; the label is recomputed on every read.
pub fn derive_state(customer: &CustomerRecord, now: OffsetDateTime) -> SubscriptionState {
    let plan = customer.plan_type;
    let payment = customer.payment_state;
    let has_period = customer.current_period_end.is_some();
    let expired = period_expired(customer.current_period_end, now);
    let active_period = has_period && !expired;
    let has_subscription = customer.subscription_id.is_some();

    if plan == PlanType::FreeDefault
        && payment == PaymentState::Off
        && !has_period
        && !has_subscription
    {
        return SubscriptionState::FreeDefaultNew;
    }

    if plan != PlanType::FreeDefault && expired && payment == PaymentState::Off {
        // A paid or free-private plan lapsed with no more payments coming.
        // subscription_id should already be cleared, but is deliberately not
        // checked: if a cancellation webhook was missed, the plan is still
        // treated as expired rather than unknown.
        return SubscriptionState::FreeDefaultCanceled;
    }

    if plan == PlanType::PaidPublic && !has_period && payment == PaymentState::Off {
        // Signup whose payment failed, then the incomplete subscription
        // expired remotely. current_period_end was never set, so the
        // expired-plan rule above cannot match.
        return SubscriptionState::FreeDefaultCanceledIncomplete;
    }

    if plan == PlanType::PaidPublic
        && active_period
        && payment == PaymentState::Ok
        && has_subscription
    {
        return SubscriptionState::PaidPaying;
    }

    if plan == PlanType::PaidPublic
        && active_period
        && payment == PaymentState::Off
        && has_subscription
    {
        // No more payments coming, but paid through period end.
        return SubscriptionState::PaidWillCancel;
    }

    if plan == PlanType::PaidPublic
        && active_period
        && payment == PaymentState::Off
        && !has_subscription
    {
        return SubscriptionState::PaidCanceled;
    }

    if plan == PlanType::FreePrivate
        && !has_period
        && payment == PaymentState::Off
        && !has_subscription
    {
        return SubscriptionState::FreePrivateIndefinite;
    }

    if plan == PlanType::FreePrivate
        && active_period
        && payment == PaymentState::Off
        && !has_subscription
    {
        // An expiration date in the past yields FreeDefaultCanceled above.
        return SubscriptionState::FreePrivateWillExpire;
    }

    if plan == PlanType::PaidPublic
        && payment == PaymentState::RequiresPaymentMethod
        && !has_period
        && has_subscription
    {
        // No period end means an initial signup attempt that failed, not a
        // past-due renewal.
        return SubscriptionState::FreeDefaultIncompleteRequiresPaymentMethod;
    }

    if plan == PlanType::PaidPublic
        && payment == PaymentState::RequiresPaymentMethod
        && expired
        && has_subscription
    {
        // The processor is still retrying payment, but the paid period has
        // lapsed, so access degrades to the free tier in the meantime.
        return SubscriptionState::FreeDefaultPastDueRequiresPaymentMethod;
    }

    if plan == PlanType::PaidPublic
        && payment == PaymentState::RequiresPaymentMethod
        && active_period
        && has_subscription
    {
        // Still retrying, but paid time remains.
        return SubscriptionState::PaidPastDueRequiresPaymentMethod;
    }

    tracing::error!(
        customer_id = %customer.id,
        plan_type = %plan,
        payment_state = %payment,
        "Customer attributes match no known state combination"
    );
    SubscriptionState::Unknown
}
