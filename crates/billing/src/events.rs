//! Processor event handling
//!
//! Applies stored payment-processor events to customer records. Events are
//! persisted verbatim at ingestion with status `new`; this module owns the
//! rest of the lifecycle: `new` -> `pending` -> `processed` or `error`. Events
//! that fail stay stored with their payload and a diagnostic for manual
//! inspection; there is no automated retry.
//!
//! Handlers are idempotent, so an at-least-once delivery replayed by the
//! processor converges on the same customer attributes.

use serde_json::Value;
use time::OffsetDateTime;

use subtrack_shared::{CardSummary, EventStatus, PaymentState};

use crate::error::{BillingError, BillingResult};
use crate::state::{derive_state, SubscriptionState};
use crate::store::{BillingStore, StripeEventRecord};

/// Outcome of dispatching one event.
struct Disposition {
    status: EventStatus,
    info: Option<String>,
}

impl Disposition {
    fn processed() -> Self {
        Self {
            status: EventStatus::Processed,
            info: None,
        }
    }

    fn processed_with(info: &str) -> Self {
        Self {
            status: EventStatus::Processed,
            info: Some(info.to_string()),
        }
    }
}

/// Applies stored processor events to customer records.
pub struct EventProcessor<S> {
    store: S,
}

impl<S: BillingStore> EventProcessor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Run one event through its handler and persist the terminal status.
    ///
    /// The `pending` status is persisted before dispatch so a crash
    /// mid-handler leaves a visible in-flight marker rather than a
    /// silently-requeued event. Handler failures of any kind park the event
    /// in `error` with the failure text as info; only a failure to persist
    /// the event record itself propagates.
    pub async fn process(&self, event: &mut StripeEventRecord) -> BillingResult<()> {
        tracing::info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing stored event"
        );

        event.status = EventStatus::Pending;
        event.info = None;
        self.store.update_event(event).await?;

        let disposition = match self.dispatch(event).await {
            Ok(disposition) => disposition,
            Err(err) => {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %err,
                    "Event handler failed"
                );
                Disposition {
                    status: EventStatus::Error,
                    info: Some(err.to_string()),
                }
            }
        };

        event.status = disposition.status;
        event.info = disposition.info;
        self.store.update_event(event).await
    }

    async fn dispatch(&self, event: &StripeEventRecord) -> BillingResult<Disposition> {
        match event.event_type.as_str() {
            "invoice.paid" => self.handle_invoice_paid(event).await,
            "customer.subscription.updated" | "customer.subscription.deleted" => {
                self.handle_subscription_change(event).await
            }
            "payment_method.automatically_updated" => self.handle_card_updated(event).await,
            other => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %other,
                    "Event type not recognized"
                );
                Ok(Disposition {
                    status: EventStatus::Error,
                    info: Some(format!("StripeEvent type '{other}' not recognized.")),
                })
            }
        }
    }

    /// Successful renewal webhook. A `billing_reason` of `subscription_cycle`
    /// distinguishes a renewal from the invoice issued at subscription
    /// creation, which the signup flow already accounted for.
    async fn handle_invoice_paid(&self, event: &StripeEventRecord) -> BillingResult<Disposition> {
        let invoice = payload_object(&event.payload)?;

        if str_field(invoice, "billing_reason")? != "subscription_cycle" {
            tracing::info!(
                event_id = %event.event_id,
                "Taking no action because billing_reason is not subscription_cycle"
            );
            return Ok(Disposition::processed_with(
                "Subscription creation webhook. No action was taken.",
            ));
        }

        let subscription_id = str_field(invoice, "subscription")?;
        let mut customer = self.store.customer_by_subscription(subscription_id).await?;

        // The invoice's first line item carries the period the payment
        // covers; the customer is paid up through its end.
        let period_end = invoice
            .pointer("/lines/data/0/period/end")
            .and_then(unix_timestamp)
            .ok_or_else(|| {
                BillingError::Internal("Invoice payload has no line item period end".to_string())
            })?;

        tracing::info!(
            event_id = %event.event_id,
            customer_id = %customer.id,
            period_end = %period_end,
            "Processing renewal"
        );
        customer.current_period_end = Some(period_end);
        self.store.update_customer(&customer).await?;

        Ok(Disposition::processed())
    }

    /// Payment failure and cancellation webhooks. Only the statuses below
    /// are actionable; everything else (`active`, `trialing`, ...) is
    /// recorded as a no-op so the event trail shows it arrived.
    async fn handle_subscription_change(
        &self,
        event: &StripeEventRecord,
    ) -> BillingResult<Disposition> {
        let subscription = payload_object(&event.payload)?;
        let subscription_id = str_field(subscription, "id")?;
        let mut customer = self.store.customer_by_subscription(subscription_id).await?;

        match str_field(subscription, "status")? {
            "past_due" => {
                customer.payment_state = PaymentState::RequiresPaymentMethod;
                self.store.update_customer(&customer).await?;
            }
            "canceled" => {
                customer.subscription_id = None;
                customer.payment_state = PaymentState::Off;
                self.store.update_customer(&customer).await?;
            }
            "incomplete_expired" => {
                // Expected only for a signup whose payment never succeeded.
                let state = derive_state(&customer, OffsetDateTime::now_utc());
                if state != SubscriptionState::FreeDefaultIncompleteRequiresPaymentMethod {
                    tracing::error!(
                        event_id = %event.event_id,
                        customer_id = %customer.id,
                        state = %state,
                        "Received incomplete_expired for a customer not in the expected state"
                    );
                }
                customer.subscription_id = None;
                customer.payment_state = PaymentState::Off;
                self.store.update_customer(&customer).await?;
            }
            other => {
                tracing::info!(
                    event_id = %event.event_id,
                    status = %other,
                    "Taking no action because subscription status is not actionable"
                );
                return Ok(Disposition::processed_with(
                    "Payload 'status' is not actionable. No action was taken.",
                ));
            }
        }

        Ok(Disposition::processed())
    }

    /// Card network silently rotated the stored payment method; refresh the
    /// display-only card summary.
    async fn handle_card_updated(&self, event: &StripeEventRecord) -> BillingResult<Disposition> {
        let payment_method = payload_object(&event.payload)?;
        let processor_customer_id = str_field(payment_method, "customer")?;
        let mut customer = self
            .store
            .customer_by_processor_id(processor_customer_id)
            .await?;

        let card = payment_method.get("card").ok_or_else(|| {
            BillingError::Internal("Payment method payload has no card".to_string())
        })?;
        customer.cc_info = Some(card_summary(card)?);
        self.store.update_customer(&customer).await?;

        Ok(Disposition::processed())
    }
}

/// The event's subject, at `data.object` in every processor payload.
fn payload_object(payload: &Value) -> BillingResult<&Value> {
    payload
        .pointer("/data/object")
        .ok_or_else(|| BillingError::Internal("Event payload has no data.object".to_string()))
}

fn str_field<'a>(object: &'a Value, name: &str) -> BillingResult<&'a str> {
    object
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::Internal(format!("Event payload field '{name}' is missing")))
}

/// Unix seconds, tolerating the float form some payloads carry.
fn unix_timestamp(value: &Value) -> Option<OffsetDateTime> {
    let seconds = value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))?;
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

fn card_summary(card: &Value) -> BillingResult<CardSummary> {
    let int_field = |name: &str| -> BillingResult<i32> {
        card.get(name)
            .and_then(Value::as_i64)
            .map(|v| v as i32)
            .ok_or_else(|| BillingError::Internal(format!("Card payload field '{name}' is missing")))
    };
    // last4 arrives as a string but has shown up as a bare number.
    let last4 = match card.get("last4") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(BillingError::Internal(
                "Card payload field 'last4' is missing".to_string(),
            ))
        }
    };
    Ok(CardSummary {
        brand: str_field(card, "brand")?.to_string(),
        last4,
        exp_month: int_field("exp_month")?,
        exp_year: int_field("exp_year")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use time::Duration;
    use uuid::Uuid;

    use subtrack_shared::PlanType;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{CustomerRecord, PlanRecord};

    struct Fixture {
        store: MemoryStore,
        user_id: Uuid,
    }

    fn fixture() -> Fixture {
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

        let user_id = Uuid::new_v4();
        store.add_customer(CustomerRecord {
            id: Uuid::new_v4(),
            user_id,
            processor_customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            payment_state: PaymentState::Ok,
            current_period_end: Some(OffsetDateTime::now_utc() + Duration::days(10)),
            cc_info: None,
            plan_id: paid_id,
            plan_type: PlanType::PaidPublic,
        });

        Fixture { store, user_id }
    }

    fn event(event_type: &str, payload: Value) -> StripeEventRecord {
        StripeEventRecord {
            id: Uuid::new_v4(),
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: event_type.to_string(),
            payload,
            status: EventStatus::New,
            info: None,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    fn renewal_payload(subscription_id: &str, period_end: i64) -> Value {
        json!({
            "data": {
                "object": {
                    "billing_reason": "subscription_cycle",
                    "subscription": subscription_id,
                    "lines": {
                        "data": [{"period": {"start": period_end - 2_592_000, "end": period_end}}]
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_renewal_extends_period() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());
        let new_end = (OffsetDateTime::now_utc() + Duration::days(40)).unix_timestamp();

        let mut e = event("invoice.paid", renewal_payload("sub_1", new_end));
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        assert_eq!(e.info, None);
        let customer = f.store.customer_snapshot(f.user_id);
        assert_eq!(
            customer.current_period_end.map(|t| t.unix_timestamp()),
            Some(new_end)
        );
    }

    #[tokio::test]
    async fn test_renewal_replay_is_idempotent() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());
        let new_end = (OffsetDateTime::now_utc() + Duration::days(40)).unix_timestamp();

        let mut e = event("invoice.paid", renewal_payload("sub_1", new_end));
        processor.process(&mut e).await.unwrap();
        let first = f.store.customer_snapshot(f.user_id);

        let mut replay = event("invoice.paid", renewal_payload("sub_1", new_end));
        processor.process(&mut replay).await.unwrap();

        assert_eq!(replay.status, EventStatus::Processed);
        let second = f.store.customer_snapshot(f.user_id);
        assert_eq!(first.current_period_end, second.current_period_end);
        assert_eq!(first.payment_state, second.payment_state);
    }

    #[tokio::test]
    async fn test_invoice_paid_at_creation_takes_no_action() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());
        let before = f.store.customer_snapshot(f.user_id);

        let mut e = event(
            "invoice.paid",
            json!({
                "data": {
                    "object": {
                        "billing_reason": "subscription_create",
                        "subscription": "sub_1"
                    }
                }
            }),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        assert_eq!(
            e.info.as_deref(),
            Some("Subscription creation webhook. No action was taken.")
        );
        let after = f.store.customer_snapshot(f.user_id);
        assert_eq!(before.current_period_end, after.current_period_end);
    }

    #[tokio::test]
    async fn test_past_due_flags_payment_failure() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());

        let mut e = event(
            "customer.subscription.updated",
            json!({"data": {"object": {"id": "sub_1", "status": "past_due"}}}),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        let customer = f.store.customer_snapshot(f.user_id);
        assert_eq!(customer.payment_state, PaymentState::RequiresPaymentMethod);
        assert_eq!(customer.subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_canceled_clears_subscription() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());

        let mut e = event(
            "customer.subscription.deleted",
            json!({"data": {"object": {"id": "sub_1", "status": "canceled"}}}),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        let customer = f.store.customer_snapshot(f.user_id);
        assert_eq!(customer.subscription_id, None);
        assert_eq!(customer.payment_state, PaymentState::Off);
        // Paid time already purchased is kept until it runs out.
        assert!(customer.current_period_end.is_some());
    }

    #[tokio::test]
    async fn test_incomplete_expired_clears_subscription() {
        let f = fixture();
        {
            // Put the customer into the failed-signup shape.
            let mut c = f.store.customer_snapshot(f.user_id);
            c.payment_state = PaymentState::RequiresPaymentMethod;
            c.current_period_end = None;
            f.store.update_customer(&c).await.unwrap();
        }
        let processor = EventProcessor::new(f.store.clone());

        let mut e = event(
            "customer.subscription.deleted",
            json!({"data": {"object": {"id": "sub_1", "status": "incomplete_expired"}}}),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        let customer = f.store.customer_snapshot(f.user_id);
        assert_eq!(customer.subscription_id, None);
        assert_eq!(customer.payment_state, PaymentState::Off);
    }

    #[tokio::test]
    async fn test_unactionable_status_is_recorded() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());
        let before = f.store.customer_snapshot(f.user_id);

        let mut e = event(
            "customer.subscription.updated",
            json!({"data": {"object": {"id": "sub_1", "status": "trialing"}}}),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        assert_eq!(
            e.info.as_deref(),
            Some("Payload 'status' is not actionable. No action was taken.")
        );
        let after = f.store.customer_snapshot(f.user_id);
        assert_eq!(before.payment_state, after.payment_state);
        assert_eq!(before.subscription_id, after.subscription_id);
    }

    #[tokio::test]
    async fn test_card_update_refreshes_summary() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());

        let mut e = event(
            "payment_method.automatically_updated",
            json!({
                "data": {
                    "object": {
                        "customer": "cus_1",
                        "card": {
                            "brand": "visa",
                            "last4": "4242",
                            "exp_month": 12,
                            "exp_year": 2030,
                            "fingerprint": "ignored"
                        }
                    }
                }
            }),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Processed);
        let customer = f.store.customer_snapshot(f.user_id);
        let card = customer.cc_info.unwrap();
        assert_eq!(card.brand, "visa");
        assert_eq!(card.last4, "4242");
        assert_eq!(card.exp_month, 12);
        assert_eq!(card.exp_year, 2030);
    }

    #[tokio::test]
    async fn test_unrecognized_type_parks_in_error() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());
        let before = f.store.customer_snapshot(f.user_id);

        let mut e = event("charge.succeeded", json!({"data": {"object": {}}}));
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Error);
        assert_eq!(
            e.info.as_deref(),
            Some("StripeEvent type 'charge.succeeded' not recognized.")
        );
        let after = f.store.customer_snapshot(f.user_id);
        assert_eq!(before.payment_state, after.payment_state);

        // The terminal status was also persisted.
        let stored = f.store.event_snapshot(e.id).unwrap();
        assert_eq!(stored.status, EventStatus::Error);
    }

    #[tokio::test]
    async fn test_unknown_subscription_parks_in_error() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());

        let mut e = event(
            "customer.subscription.updated",
            json!({"data": {"object": {"id": "sub_missing", "status": "past_due"}}}),
        );
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Error);
        assert!(e.info.unwrap().contains("sub_missing"));
    }

    #[tokio::test]
    async fn test_malformed_payload_parks_in_error() {
        let f = fixture();
        let processor = EventProcessor::new(f.store.clone());

        let mut e = event("invoice.paid", json!({"unexpected": true}));
        processor.process(&mut e).await.unwrap();

        assert_eq!(e.status, EventStatus::Error);
        assert!(e.info.is_some());
    }
}
