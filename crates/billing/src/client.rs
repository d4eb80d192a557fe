//! Payment processor integration
//!
//! The `PaymentProcessor` trait is the seam between subscription command
//! handling and the remote billing provider; `StripeGateway` is the Stripe
//! implementation. Remote calls are made before local rows are touched, so a
//! remote failure leaves local state unchanged.

use std::collections::HashMap;

use stripe::Client;
use time::OffsetDateTime;
use uuid::Uuid;

use subtrack_shared::CardSummary;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key
    pub secret_key: String,
    /// Namespaces the user-reference metadata key on remote customers, so
    /// multiple deployments can share one Stripe account
    pub application_name: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY is not set".to_string()))?;
        let application_name =
            std::env::var("BILLING_APPLICATION_NAME").unwrap_or_else(|_| "subtrack".to_string());
        Ok(Self {
            secret_key,
            application_name,
        })
    }

    /// Metadata key carrying our user id on remote customers.
    fn user_pk_key(&self) -> String {
        format!("{}_user_pk", self.application_name)
    }
}

/// The account the billing operation is on behalf of.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub name: String,
}

/// A customer object on the remote processor.
#[derive(Debug, Clone)]
pub struct ProcessorCustomer {
    pub id: String,
}

/// Result of creating a remote subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOutcome {
    pub id: String,
    /// Processor's subscription status string ("active", "incomplete", ...)
    pub status: String,
    pub current_period_end: Option<OffsetDateTime>,
    /// Summary of the attached card, when the payment method was a card
    pub card: Option<CardSummary>,
}

/// Result of retrying a customer's latest invoice.
#[derive(Debug, Clone)]
pub struct InvoiceOutcome {
    /// Processor's invoice status string ("paid", "open", ...)
    pub status: String,
    /// End of the period the invoice's first line item covers
    pub period_end: Option<OffsetDateTime>,
}

/// Remote operations the subscription command handlers need.
pub trait PaymentProcessor {
    /// Look for an existing remote customer for this user. Used before
    /// creating one, so a re-signup reuses the original remote customer.
    async fn find_customer(&self, user: &UserProfile) -> BillingResult<Option<ProcessorCustomer>>;

    async fn create_customer(&self, user: &UserProfile) -> BillingResult<ProcessorCustomer>;

    /// Reconcile the remote customer's metadata and email with our records.
    async fn sync_customer(&self, user: &UserProfile, customer_id: &str) -> BillingResult<()>;

    /// Attach the payment method and start a subscription on the given
    /// price. A declined card surfaces as `BillingError::Card`.
    async fn create_subscription(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        price_id: &str,
    ) -> BillingResult<SubscriptionOutcome>;

    /// Attach a new payment method and make it the subscription's default.
    async fn replace_card(
        &self,
        customer_id: &str,
        subscription_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<Option<CardSummary>>;

    /// Re-attempt payment of the customer's latest invoice. Returns `None`
    /// if there is no invoice in a retryable state.
    async fn retry_latest_invoice(&self, customer_id: &str)
        -> BillingResult<Option<InvoiceOutcome>>;

    /// Schedule or unschedule cancellation at the end of the paid period.
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()>;

    /// Cancel immediately, forfeiting the rest of the paid period.
    async fn cancel_now(&self, subscription_id: &str) -> BillingResult<()>;
}

/// Stripe-backed payment processor
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> BillingResult<T> {
    raw.parse()
        .map_err(|_| BillingError::Internal(format!("Invalid processor id '{raw}'")))
}

fn timestamp(seconds: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

fn card_details_summary(card: &stripe::CardDetails) -> CardSummary {
    CardSummary {
        brand: card.brand.clone(),
        last4: card.last4.clone(),
        exp_month: card.exp_month as i32,
        exp_year: card.exp_year as i32,
    }
}

fn subscription_status(status: stripe::SubscriptionStatus) -> String {
    match status {
        stripe::SubscriptionStatus::Active => "active",
        stripe::SubscriptionStatus::Canceled => "canceled",
        stripe::SubscriptionStatus::Incomplete => "incomplete",
        stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        stripe::SubscriptionStatus::PastDue => "past_due",
        stripe::SubscriptionStatus::Paused => "paused",
        stripe::SubscriptionStatus::Trialing => "trialing",
        stripe::SubscriptionStatus::Unpaid => "unpaid",
    }
    .to_string()
}

fn invoice_status(status: stripe::InvoiceStatus) -> String {
    match status {
        stripe::InvoiceStatus::Draft => "draft",
        stripe::InvoiceStatus::Open => "open",
        stripe::InvoiceStatus::Paid => "paid",
        stripe::InvoiceStatus::Uncollectible => "uncollectible",
        stripe::InvoiceStatus::Void => "void",
    }
    .to_string()
}

impl PaymentProcessor for StripeGateway {
    async fn find_customer(&self, user: &UserProfile) -> BillingResult<Option<ProcessorCustomer>> {
        let params = stripe::ListCustomers {
            email: Some(&user.email),
            ..Default::default()
        };
        // A lookup failure is not fatal to signup; a fresh remote customer
        // gets created instead.
        let customers = match stripe::Customer::list(&self.client, &params).await {
            Ok(customers) => customers,
            Err(err) => {
                tracing::error!(email = %user.email, error = %err, "Error listing processor customers");
                return Ok(None);
            }
        };

        if customers.data.is_empty() {
            return Ok(None);
        }
        if customers.data.len() > 1 {
            tracing::error!(email = %user.email, "More than one processor customer found");
        }

        let key = self.config.user_pk_key();
        let user_pk = user.id.to_string();
        for customer in &customers.data {
            let matches = customer
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.get(&key))
                .is_some_and(|value| *value == user_pk);
            if matches {
                return Ok(Some(ProcessorCustomer {
                    id: customer.id.to_string(),
                }));
            }
        }

        tracing::error!(
            email = %user.email,
            "Found processor customer by email but user id does not match"
        );
        Ok(None)
    }

    async fn create_customer(&self, user: &UserProfile) -> BillingResult<ProcessorCustomer> {
        let mut metadata = HashMap::new();
        metadata.insert(self.config.user_pk_key(), user.id.to_string());

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(&user.email);
        params.name = Some(&user.name);
        params.metadata = Some(metadata);

        let customer = stripe::Customer::create(&self.client, params).await?;
        tracing::info!(user_id = %user.id, customer_id = %customer.id, "Created processor customer");
        Ok(ProcessorCustomer {
            id: customer.id.to_string(),
        })
    }

    async fn sync_customer(&self, user: &UserProfile, customer_id: &str) -> BillingResult<()> {
        let id: stripe::CustomerId = parse_id(customer_id)?;
        let customer = stripe::Customer::retrieve(&self.client, &id, &[]).await?;

        let key = self.config.user_pk_key();
        let user_pk = user.id.to_string();
        let mut params = stripe::UpdateCustomer::new();
        let mut metadata_update: Option<HashMap<String, String>> = None;

        match customer
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get(&key))
        {
            None => {
                metadata_update = Some(HashMap::from([(key, user_pk)]));
            }
            Some(value) if *value != user_pk => {
                // The remote customer belongs to someone else; do not touch it.
                tracing::error!(
                    user_id = %user.id,
                    remote_user_pk = %value,
                    "User id does not match processor customer metadata"
                );
                return Ok(());
            }
            Some(_) => {}
        }

        let email_changed = customer.email.as_deref() != Some(user.email.as_str());
        if email_changed {
            tracing::warn!(
                user_id = %user.id,
                "Processor customer email diverged from our records. Reverting."
            );
            params.email = Some(&user.email);
        }

        if metadata_update.is_some() || email_changed {
            params.metadata = metadata_update;
            stripe::Customer::update(&self.client, &id, params).await?;
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        price_id: &str,
    ) -> BillingResult<SubscriptionOutcome> {
        let customer: stripe::CustomerId = parse_id(customer_id)?;
        let payment_method: stripe::PaymentMethodId = parse_id(payment_method_id)?;

        let attached = stripe::PaymentMethod::attach(
            &self.client,
            &payment_method,
            stripe::AttachPaymentMethod {
                customer: customer.clone(),
            },
        )
        .await?;

        let mut params = stripe::CreateSubscription::new(customer);
        params.items = Some(vec![stripe::CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.default_payment_method = Some(payment_method_id);

        let subscription = stripe::Subscription::create(&self.client, params).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Created processor subscription"
        );

        Ok(SubscriptionOutcome {
            id: subscription.id.to_string(),
            status: subscription_status(subscription.status),
            current_period_end: timestamp(subscription.current_period_end),
            card: attached.card.as_ref().map(card_details_summary),
        })
    }

    async fn replace_card(
        &self,
        customer_id: &str,
        subscription_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<Option<CardSummary>> {
        let customer: stripe::CustomerId = parse_id(customer_id)?;
        let payment_method: stripe::PaymentMethodId = parse_id(payment_method_id)?;
        let subscription: stripe::SubscriptionId = parse_id(subscription_id)?;

        let attached = stripe::PaymentMethod::attach(
            &self.client,
            &payment_method,
            stripe::AttachPaymentMethod { customer },
        )
        .await?;

        let mut params = stripe::UpdateSubscription::new();
        params.default_payment_method = Some(payment_method_id);
        stripe::Subscription::update(&self.client, &subscription, params).await?;

        Ok(attached.card.as_ref().map(card_details_summary))
    }

    async fn retry_latest_invoice(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<InvoiceOutcome>> {
        let customer: stripe::CustomerId = parse_id(customer_id)?;
        let params = stripe::ListInvoices {
            customer: Some(customer),
            limit: Some(1),
            ..Default::default()
        };
        let invoices = stripe::Invoice::list(&self.client, &params).await?;

        let Some(invoice) = invoices.data.into_iter().next() else {
            tracing::error!(
                customer_id = %customer_id,
                "Customer has no invoices but an invoice retry was requested"
            );
            return Ok(None);
        };

        if invoice.status != Some(stripe::InvoiceStatus::Open) {
            tracing::error!(
                customer_id = %customer_id,
                invoice_id = %invoice.id,
                status = ?invoice.status,
                "Latest invoice is not open; nothing to retry"
            );
            return Ok(None);
        }

        // Raises a card error if the charge is declined again.
        let paid = stripe::Invoice::pay(&self.client, &invoice.id).await?;

        let period_end = paid
            .lines
            .as_ref()
            .and_then(|lines| lines.data.first())
            .and_then(|line| line.period.as_ref())
            .and_then(|period| period.end)
            .and_then(timestamp);
        let status = paid
            .status
            .map(invoice_status)
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Some(InvoiceOutcome { status, period_end }))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()> {
        let id: stripe::SubscriptionId = parse_id(subscription_id)?;
        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel);
        stripe::Subscription::update(&self.client, &id, params).await?;
        tracing::info!(subscription_id = %subscription_id, cancel_at_period_end = cancel, "Updated subscription");
        Ok(())
    }

    async fn cancel_now(&self, subscription_id: &str) -> BillingResult<()> {
        let id: stripe::SubscriptionId = parse_id(subscription_id)?;
        stripe::Subscription::cancel(&self.client, &id, stripe::CancelSubscription::default())
            .await?;
        tracing::info!(subscription_id = %subscription_id, "Canceled subscription immediately");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_pk_key_is_namespaced() {
        let config = StripeConfig {
            secret_key: "sk_test_1".to_string(),
            application_name: "subtrack".to_string(),
        };
        assert_eq!(config.user_pk_key(), "subtrack_user_pk");
    }

    #[test]
    fn test_subscription_status_strings() {
        assert_eq!(
            subscription_status(stripe::SubscriptionStatus::Active),
            "active"
        );
        assert_eq!(
            subscription_status(stripe::SubscriptionStatus::IncompleteExpired),
            "incomplete_expired"
        );
        assert_eq!(
            subscription_status(stripe::SubscriptionStatus::PastDue),
            "past_due"
        );
    }

    #[test]
    fn test_invoice_status_strings() {
        assert_eq!(invoice_status(stripe::InvoiceStatus::Paid), "paid");
        assert_eq!(invoice_status(stripe::InvoiceStatus::Open), "open");
    }

    #[test]
    fn test_bad_processor_id_is_rejected() {
        let err = parse_id::<stripe::CustomerId>("not a customer id").unwrap_err();
        assert!(matches!(err, BillingError::Internal(_)));
    }
}
