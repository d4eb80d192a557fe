//! Customer billing summary
//!
//! The read-side view handed to API consumers: derived state, payment
//! attributes, and the effective plan with its fully-resolved limit set.

use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;

use subtrack_shared::{CardSummary, PaymentState, PlanType};

use crate::error::BillingResult;
use crate::limits::effective_plan;
use crate::state::{derive_state, SubscriptionState};
use crate::store::{BillingStore, CustomerRecord};

#[derive(Debug, Serialize)]
pub struct PlanView {
    pub name: String,
    pub display_price: i32,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    /// Every known limit, plan overrides applied over the global defaults
    pub limits: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct CustomerView {
    pub state: SubscriptionState,
    pub payment_state: PaymentState,
    pub current_period_end: Option<OffsetDateTime>,
    pub cc_info: Option<CardSummary>,
    /// The effective plan, which is the free-default plan when the assigned
    /// one has lapsed
    pub plan: PlanView,
}

pub async fn customer_view<S: BillingStore>(
    store: &S,
    customer: &CustomerRecord,
    now: OffsetDateTime,
) -> BillingResult<CustomerView> {
    let plan = effective_plan(store, customer, now).await?;

    let mut limits: BTreeMap<String, i64> = store.limit_defaults().await?.into_iter().collect();
    for (name, value) in store.plan_limits(plan.id).await? {
        limits.insert(name, value);
    }

    Ok(CustomerView {
        state: derive_state(customer, now),
        payment_state: customer.payment_state,
        current_period_end: customer.current_period_end,
        cc_info: customer.cc_info.clone(),
        plan: PlanView {
            name: plan.name,
            display_price: plan.display_price,
            plan_type: plan.plan_type,
            limits,
        },
    })
}
