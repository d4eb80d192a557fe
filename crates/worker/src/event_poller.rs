//! Stored event polling
//!
//! Claims batches of unprocessed events and runs them through the event
//! processor. Claiming uses `FOR UPDATE SKIP LOCKED`, so multiple workers
//! never pick up the same event.

use subtrack_billing::{EventProcessor, PgStore};

const BATCH_SIZE: i64 = 10;

/// Claim and process one batch. Failures are logged and never kill the
/// worker loop; an event whose handler failed is already parked in `error`
/// with a diagnostic.
pub async fn run_once(store: &PgStore) {
    let events = match store.claim_new_events(BATCH_SIZE).await {
        Ok(events) => events,
        Err(err) => {
            tracing::error!(error = %err, "Failed to fetch stored events");
            return;
        }
    };
    if events.is_empty() {
        return;
    }

    tracing::info!(count = events.len(), "Processing stored events");
    let processor = EventProcessor::new(store.clone());
    for mut event in events {
        if let Err(err) = processor.process(&mut event).await {
            tracing::error!(
                event_id = %event.event_id,
                error = %err,
                "Failed to persist event status"
            );
        }
    }
}
