//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// User-correctable request misuse. Surfaced to the caller verbatim,
    /// never logged as a system fault.
    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Card declined or otherwise refused by the payment processor,
    /// carrying the processor's human-readable message.
    #[error("Card error: {0}")]
    Card(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(request_err)
                if matches!(request_err.error_type, stripe::ErrorType::Card) =>
            {
                let message = request_err
                    .message
                    .clone()
                    .unwrap_or_else(|| "Your card was declined.".to_string());
                BillingError::Card(message)
            }
            _ => BillingError::StripeApi(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
