//! Subscription billing core
//!
//! Customer lifecycle state derivation, effective limit resolution,
//! processor event handling, and the user-initiated subscription commands,
//! backed by Postgres and a Stripe-like payment processor.
//!
//! The stored customer attributes (plan, payment state, period end,
//! subscription reference) are the state of record; the lifecycle label is
//! derived from them on demand and never persisted.

pub mod client;
pub mod error;
pub mod events;
pub mod limits;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod summary;

pub use client::{PaymentProcessor, StripeConfig, StripeGateway, UserProfile};
pub use error::{BillingError, BillingResult};
pub use events::EventProcessor;
pub use limits::get_limit;
pub use state::{derive_state, SubscriptionState};
pub use store::{BillingStore, CustomerRecord, PgStore, PlanRecord, StripeEventRecord};
pub use subscriptions::SubscriptionService;
pub use summary::{customer_view, CustomerView, PlanView};
