//! Subscription command handlers
//!
//! User-initiated lifecycle operations: sign up, cure a failed card, cancel,
//! reactivate, replace a card. Each handler validates the customer's derived
//! state, performs remote processor calls, then persists the local attribute
//! changes. Remote calls come first, so a remote failure leaves local state
//! untouched; a local write failing after a remote success is reconciled by
//! the processor's webhooks.
//!
//! Validation failures carry the exact message shown to the user.

use time::OffsetDateTime;
use uuid::Uuid;

use subtrack_shared::PaymentState;

use crate::client::{PaymentProcessor, UserProfile};
use crate::error::{BillingError, BillingResult};
use crate::state::{derive_state, SubscriptionState};
use crate::store::BillingStore;

/// A declined card on a user-initiated operation is the user's problem to
/// fix, not a system fault.
fn card_declined(err: BillingError) -> BillingError {
    match err {
        BillingError::Card(message) => BillingError::Validation(message),
        other => other,
    }
}

pub struct SubscriptionService<S, P> {
    store: S,
    processor: P,
}

impl<S: BillingStore, P: PaymentProcessor> SubscriptionService<S, P> {
    pub fn new(store: S, processor: P) -> Self {
        Self { store, processor }
    }

    /// Sign the user up for a paid plan.
    ///
    /// Only customers with no active billing plan may sign up; switching
    /// between paid plans goes through the processor's own portal instead.
    /// If the remote subscription comes back in any status other than
    /// `active`, the signup is recorded as a failed payment awaiting cure.
    pub async fn create_subscription(
        &self,
        user: &UserProfile,
        plan_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let plan = self
            .store
            .plan(plan_id)
            .await?
            .filter(|p| p.plan_type == subtrack_shared::PlanType::PaidPublic)
            .ok_or_else(|| BillingError::Validation("Billing plan does not exist.".to_string()))?;
        let price_id = plan.price_id.clone().ok_or_else(|| {
            BillingError::Internal(format!("Paid plan {} has no price id", plan.id))
        })?;

        let mut customer = self.store.customer_for_user(user.id).await?;
        let now = OffsetDateTime::now_utc();
        let state = derive_state(&customer, now);
        if !matches!(
            state,
            SubscriptionState::FreeDefaultNew | SubscriptionState::FreeDefaultCanceled
        ) {
            return Err(BillingError::Validation(
                "User already has a subscription.".to_string(),
            ));
        }

        // Reuse the remote customer from a previous signup if one exists.
        if customer.processor_customer_id.is_none() {
            let remote = match self.processor.find_customer(user).await? {
                Some(found) => found,
                None => self.processor.create_customer(user).await?,
            };
            customer.processor_customer_id = Some(remote.id);
            self.store.update_customer(&customer).await?;
        }
        let processor_customer_id = customer
            .processor_customer_id
            .clone()
            .unwrap_or_default();

        let outcome = self
            .processor
            .create_subscription(&processor_customer_id, payment_method_id, &price_id)
            .await
            .map_err(card_declined)?;

        customer.subscription_id = Some(outcome.id);
        customer.plan_id = plan.id;
        customer.plan_type = plan.plan_type;
        if let Some(card) = outcome.card {
            customer.cc_info = Some(card);
        }
        self.processor
            .sync_customer(user, &processor_customer_id)
            .await?;

        if outcome.status == "active" {
            customer.current_period_end = outcome.current_period_end;
            customer.payment_state = PaymentState::Ok;
            self.store.update_customer(&customer).await?;
            tracing::info!(user_id = %user.id, plan_id = %plan.id, "Subscription created");
            Ok(())
        } else {
            tracing::info!(
                user_id = %user.id,
                status = %outcome.status,
                "Payment failed during subscription creation"
            );
            customer.current_period_end = None;
            customer.payment_state = PaymentState::RequiresPaymentMethod;
            self.store.update_customer(&customer).await?;
            Err(BillingError::Validation(
                "Payment could not be processed. Please try again or use another card.".to_string(),
            ))
        }
    }

    /// Replace the failing card and immediately retry the open invoice.
    /// Only valid while a payment failure is outstanding.
    pub async fn cure_failed_card(
        &self,
        user: &UserProfile,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let mut customer = self.store.customer_for_user(user.id).await?;
        let (Some(subscription_id), PaymentState::RequiresPaymentMethod) = (
            customer.subscription_id.clone(),
            customer.payment_state,
        ) else {
            return Err(BillingError::Validation(
                "You cannot cure a failed payment for this customer.".to_string(),
            ));
        };
        let processor_customer_id = customer.processor_customer_id.clone().ok_or_else(|| {
            BillingError::Internal(format!(
                "Customer {} has a subscription but no processor customer id",
                customer.id
            ))
        })?;

        let card = self
            .processor
            .replace_card(&processor_customer_id, &subscription_id, payment_method_id)
            .await
            .map_err(card_declined)?;
        if let Some(card) = card {
            customer.cc_info = Some(card);
        }
        self.store.update_customer(&customer).await?;

        // The retried charge can itself be declined.
        let invoice = self
            .processor
            .retry_latest_invoice(&processor_customer_id)
            .await
            .map_err(card_declined)?;

        if let Some(invoice) = invoice {
            if invoice.status == "paid" {
                customer.current_period_end = invoice.period_end;
                customer.payment_state = PaymentState::Ok;
                self.store.update_customer(&customer).await?;
                tracing::info!(user_id = %user.id, "Failed payment cured");
            }
        }
        Ok(())
    }

    /// Stop renewal at the end of the paid period. Paid time already
    /// purchased is kept; the processor's end-of-period webhook does the
    /// final teardown.
    pub async fn cancel_subscription(&self, user: &UserProfile) -> BillingResult<()> {
        let mut customer = self.store.customer_for_user(user.id).await?;
        let subscription_id = match customer.subscription_id.clone() {
            Some(id) if customer.payment_state != PaymentState::Off => id,
            _ => {
                return Err(BillingError::Validation(
                    "No active subscription to cancel.".to_string(),
                ))
            }
        };

        self.processor
            .set_cancel_at_period_end(&subscription_id, true)
            .await?;

        customer.payment_state = PaymentState::Off;
        self.store.update_customer(&customer).await?;
        tracing::info!(user_id = %user.id, "Subscription will cancel at period end");
        Ok(())
    }

    /// Undo a pending cancellation before the period runs out.
    pub async fn reactivate_subscription(&self, user: &UserProfile) -> BillingResult<()> {
        let mut customer = self.store.customer_for_user(user.id).await?;
        let now = OffsetDateTime::now_utc();
        if derive_state(&customer, now) != SubscriptionState::PaidWillCancel {
            return Err(BillingError::Validation(
                "You cannot reactivate this subscription.".to_string(),
            ));
        }
        let subscription_id = customer.subscription_id.clone().unwrap_or_default();

        self.processor
            .set_cancel_at_period_end(&subscription_id, false)
            .await?;

        customer.payment_state = PaymentState::Ok;
        self.store.update_customer(&customer).await?;
        tracing::info!(user_id = %user.id, "Subscription reactivated");
        Ok(())
    }

    /// Swap the payment method on a live subscription without retrying any
    /// invoice.
    pub async fn replace_card(
        &self,
        user: &UserProfile,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let mut customer = self.store.customer_for_user(user.id).await?;
        let subscription_id = match customer.subscription_id.clone() {
            Some(id) if customer.payment_state != PaymentState::Off => id,
            _ => {
                return Err(BillingError::Validation(
                    "You cannot replace card for this customer.".to_string(),
                ))
            }
        };
        let processor_customer_id = customer.processor_customer_id.clone().ok_or_else(|| {
            BillingError::Internal(format!(
                "Customer {} has a subscription but no processor customer id",
                customer.id
            ))
        })?;

        let card = self
            .processor
            .replace_card(&processor_customer_id, &subscription_id, payment_method_id)
            .await
            .map_err(card_declined)?;
        if let Some(card) = card {
            customer.cc_info = Some(card);
        }
        self.store.update_customer(&customer).await?;
        tracing::info!(user_id = %user.id, "Payment card replaced");
        Ok(())
    }

    /// Tear down billing when the account itself is being deleted: cancel
    /// remotely with immediate effect, forfeiting any paid time left. A no-op
    /// for customers with no subscription.
    pub async fn cancel_for_account_deletion(&self, user: &UserProfile) -> BillingResult<()> {
        let mut customer = self.store.customer_for_user(user.id).await?;
        let Some(subscription_id) = customer.subscription_id.clone() else {
            return Ok(());
        };

        self.processor.cancel_now(&subscription_id).await?;

        customer.subscription_id = None;
        customer.payment_state = PaymentState::Off;
        self.store.update_customer(&customer).await?;
        tracing::info!(user_id = %user.id, "Subscription canceled for account deletion");
        Ok(())
    }
}
