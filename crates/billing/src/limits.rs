//! Effective limit resolution
//!
//! Resolves a named numeric limit for a customer. The assigned plan only
//! counts while it is actually paid for: a lapsed plan resolves against the
//! free-default plan instead, without rewriting the customer row.

use time::OffsetDateTime;

use subtrack_shared::PlanType;

use crate::error::{BillingError, BillingResult};
use crate::state::period_expired;
use crate::store::{BillingStore, CustomerRecord, PlanRecord};

/// Whether the customer's assigned plan no longer grants its limits.
///
/// True when the paid-for period has lapsed, or when a paid plan never had a
/// confirmed period at all (a signup whose payment never succeeded).
/// Free-default plans are never lapsed; free-private plans with no expiration
/// run indefinitely.
fn plan_is_lapsed(customer: &CustomerRecord, now: OffsetDateTime) -> bool {
    if customer.plan_type == PlanType::FreeDefault {
        return false;
    }
    if period_expired(customer.current_period_end, now) {
        return true;
    }
    customer.plan_type == PlanType::PaidPublic && customer.current_period_end.is_none()
}

/// The plan whose limits actually apply to the customer right now: the
/// assigned plan, or the free-default plan if the assigned one has lapsed.
pub async fn effective_plan<S: BillingStore>(
    store: &S,
    customer: &CustomerRecord,
    now: OffsetDateTime,
) -> BillingResult<PlanRecord> {
    if plan_is_lapsed(customer, now) {
        return store.free_default_plan().await;
    }
    store.plan(customer.plan_id).await?.ok_or_else(|| {
        BillingError::Internal(format!(
            "Customer {} references missing plan {}",
            customer.id, customer.plan_id
        ))
    })
}

/// Resolve a named limit for a customer: the effective plan's override if one
/// exists, otherwise the limit's global default.
pub async fn get_limit<S: BillingStore>(
    store: &S,
    customer: &CustomerRecord,
    name: &str,
    now: OffsetDateTime,
) -> BillingResult<i64> {
    let plan = effective_plan(store, customer, now).await?;

    if let Some(value) = store.plan_limit(plan.id, name).await? {
        return Ok(value);
    }

    store
        .limit_default(name)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Limit '{name}' does not exist")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use time::Duration;
    use uuid::Uuid;

    use subtrack_shared::PaymentState;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn store_with_plans() -> (MemoryStore, Uuid, Uuid) {
        let store = MemoryStore::new();
        let free_id = Uuid::new_v4();
        let paid_id = Uuid::new_v4();
        store.add_plan(PlanRecord {
            id: free_id,
            name: "Default (Free)".to_string(),
            plan_type: PlanType::FreeDefault,
            display_price: 0,
            price_id: None,
            created_at: OffsetDateTime::now_utc(),
        });
        store.add_plan(PlanRecord {
            id: paid_id,
            name: "Pro".to_string(),
            plan_type: PlanType::PaidPublic,
            display_price: 20,
            price_id: Some("price_pro".to_string()),
            created_at: OffsetDateTime::now_utc(),
        });
        store.set_limit_default("max_projects", 3);
        store.set_plan_limit(paid_id, "max_projects", 50);
        (store, free_id, paid_id)
    }

    fn paid_customer(plan_id: Uuid, period_end: Option<OffsetDateTime>) -> CustomerRecord {
        CustomerRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            processor_customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            payment_state: PaymentState::Ok,
            current_period_end: period_end,
            cc_info: None,
            plan_id,
            plan_type: PlanType::PaidPublic,
        }
    }

    #[tokio::test]
    async fn test_override_applies_while_plan_active() {
        let (store, _, paid_id) = store_with_plans();
        let now = OffsetDateTime::now_utc();
        let customer = paid_customer(paid_id, Some(now + Duration::days(10)));

        let value = get_limit(&store, &customer, "max_projects", now).await.unwrap();
        assert_eq!(value, 50);
    }

    #[tokio::test]
    async fn test_expired_plan_resolves_as_free_default() {
        let (store, _, paid_id) = store_with_plans();
        let now = OffsetDateTime::now_utc();
        let customer = paid_customer(paid_id, Some(now - Duration::days(1)));

        let value = get_limit(&store, &customer, "max_projects", now).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_paid_plan_with_no_period_resolves_as_free_default() {
        // A signup whose payment never succeeded grants nothing.
        let (store, _, paid_id) = store_with_plans();
        let now = OffsetDateTime::now_utc();
        let mut customer = paid_customer(paid_id, None);
        customer.payment_state = PaymentState::RequiresPaymentMethod;

        let value = get_limit(&store, &customer, "max_projects", now).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_default_when_no_override() {
        let (store, free_id, _) = store_with_plans();
        let now = OffsetDateTime::now_utc();
        let customer = CustomerRecord {
            subscription_id: None,
            processor_customer_id: None,
            payment_state: PaymentState::Off,
            plan_type: PlanType::FreeDefault,
            ..paid_customer(free_id, None)
        };

        let value = get_limit(&store, &customer, "max_projects", now).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_unknown_limit_name() {
        let (store, _, paid_id) = store_with_plans();
        let now = OffsetDateTime::now_utc();
        let customer = paid_customer(paid_id, Some(now + Duration::days(10)));

        let err = get_limit(&store, &customer, "no_such_limit", now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_free_private_without_expiration_is_not_lapsed() {
        let (store, _, _) = store_with_plans();
        let private_id = Uuid::new_v4();
        store.add_plan(PlanRecord {
            id: private_id,
            name: "Internal".to_string(),
            plan_type: PlanType::FreePrivate,
            display_price: 0,
            price_id: None,
            created_at: OffsetDateTime::now_utc(),
        });
        store.set_plan_limit(private_id, "max_projects", 100);

        let now = OffsetDateTime::now_utc();
        let customer = CustomerRecord {
            subscription_id: None,
            processor_customer_id: None,
            payment_state: PaymentState::Off,
            plan_type: PlanType::FreePrivate,
            ..paid_customer(private_id, None)
        };

        let value = get_limit(&store, &customer, "max_projects", now).await.unwrap();
        assert_eq!(value, 100);
    }
}
