//! Handlers registered by the stock binary.
//!
//! Deployments embedding the service as a library register their own
//! handlers on the [`EventRouter`] passed to [`build_state`](crate::build_state).

use std::sync::Arc;

use async_trait::async_trait;
use hook_dispatch_core::routing::RouterError;
use hook_dispatch_core::{EventRouter, HandlerContext, HandlerError, WebhookHandler};
use tracing::info;

/// Logs every delivery it sees. Never fails.
#[derive(Debug, Default)]
pub struct DeliveryLogHandler;

#[async_trait]
impl WebhookHandler for DeliveryLogHandler {
    fn name(&self) -> &str {
        "delivery-log"
    }

    async fn handle(&self, context: &HandlerContext) -> Result<(), HandlerError> {
        let delivery = &context.delivery;
        info!(
            delivery_id = %delivery.id,
            event = %delivery.event_name,
            action = delivery.action.as_deref().unwrap_or(""),
            installation_id = delivery.installation_id.map(|id| id.as_u64()),
            attempt = context.attempt,
            payload_bytes = delivery.raw_payload.len(),
            has_token = context.token.is_some(),
            "Received delivery"
        );
        Ok(())
    }
}

/// Routing table of the stock binary: the log handler for every event.
pub fn default_router() -> Result<EventRouter, RouterError> {
    let mut router = EventRouter::new();
    router.register("*", Some("*"), Arc::new(DeliveryLogHandler))?;
    Ok(router)
}
