//! Pattern-based event routing with multi-dispatch.
//!
//! Handlers are registered at startup against an `(event, action)` pattern
//! pair. Every registration whose patterns match an incoming delivery is
//! invoked, in registration order. A handler that fails, panics or gets
//! cancelled is recorded in the [`DispatchReport`] and never stops the
//! handlers after it.
//!
//! # Matching rules
//!
//! | event pattern | action pattern | matches                                   |
//! |---------------|----------------|-------------------------------------------|
//! | `"issues"`    | `"opened"`     | `issues` with action `opened`             |
//! | `"issues"`    | `"*"`          | `issues` with any action, or none         |
//! | `"*"`         | `None`         | any event that carries no action (`push`) |
//! | `"*"`         | `"*"`          | everything                                |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::InstallationAccessToken;
use crate::delivery::Delivery;

/// The literal that matches any event or any action.
pub const WILDCARD: &str = "*";

/// Failure reason recorded for handlers stopped by the dispatch deadline or shutdown.
pub const CANCELLED_REASON: &str = "cancelled";

// ============================================================================
// Patterns
// ============================================================================

/// Event half of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    Any,
    Named(String),
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Result<Self, RouterError> {
        match pattern {
            "" => Err(RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "event pattern cannot be empty".to_string(),
            }),
            WILDCARD => Ok(Self::Any),
            name => Ok(Self::Named(name.to_string())),
        }
    }

    pub fn matches(&self, event_name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => name == event_name,
        }
    }
}

/// Action half of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPattern {
    /// `"*"`: any action, including none.
    Any,
    /// A literal action name.
    Named(String),
    /// Only deliveries without an `action` field.
    NoAction,
}

impl ActionPattern {
    pub fn parse(pattern: Option<&str>) -> Result<Self, RouterError> {
        match pattern {
            None => Ok(Self::NoAction),
            Some("") => Err(RouterError::InvalidPattern {
                pattern: String::new(),
                reason: "action pattern cannot be empty; use None for action-less events"
                    .to_string(),
            }),
            Some(WILDCARD) => Ok(Self::Any),
            Some(name) => Ok(Self::Named(name.to_string())),
        }
    }

    pub fn matches(&self, action: Option<&str>) -> bool {
        match (self, action) {
            (Self::Any, _) => true,
            (Self::Named(name), Some(action)) => name == action,
            (Self::Named(_), None) => false,
            (Self::NoAction, action) => action.is_none(),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Everything a handler gets to see for one invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub delivery: Arc<Delivery>,
    /// Token for the delivery's installation, if it names one and the service
    /// runs with App credentials.
    pub token: Option<InstallationAccessToken>,
    /// 0 for the inline dispatch, 1.. for pipeline retries.
    pub attempt: u32,
    /// Cancelled when the dispatch deadline passes or the service shuts down.
    pub cancellation: CancellationToken,
}

/// Error returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{message}")]
    Failed { message: String },

    #[error("handler cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Application logic invoked for matching deliveries.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use hook_dispatch_core::routing::{HandlerContext, HandlerError, WebhookHandler};
///
/// struct LabelNewIssues;
///
/// #[async_trait]
/// impl WebhookHandler for LabelNewIssues {
///     fn name(&self) -> &str {
///         "label-new-issues"
///     }
///
///     async fn handle(&self, context: &HandlerContext) -> Result<(), HandlerError> {
///         let _token = context.token.as_ref().ok_or_else(|| HandlerError::failed("no token"))?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Stable name used in logs and dispatch reports.
    fn name(&self) -> &str;

    async fn handle(&self, context: &HandlerContext) -> Result<(), HandlerError>;
}

/// One `(event, action, handler)` row of the routing table.
#[derive(Clone)]
pub struct HandlerRegistration {
    event: EventPattern,
    action: ActionPattern,
    handler: Arc<dyn WebhookHandler>,
}

impl HandlerRegistration {
    pub fn new(
        event_pattern: &str,
        action_pattern: Option<&str>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Self, RouterError> {
        Ok(Self {
            event: EventPattern::parse(event_pattern)?,
            action: ActionPattern::parse(action_pattern)?,
            handler,
        })
    }

    pub fn matches(&self, event_name: &str, action: Option<&str>) -> bool {
        self.event.matches(event_name) && self.action.matches(action)
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("event", &self.event)
            .field("action", &self.action)
            .field("handler", &self.handler.name())
            .finish()
    }
}

// ============================================================================
// Dispatch Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub handler: String,
    pub outcome: HandlerOutcome,
    pub elapsed: Duration,
}

impl HandlerResult {
    pub fn is_success(&self) -> bool {
        self.outcome == HandlerOutcome::Succeeded
    }
}

/// When a dispatch as a whole counts as failed and goes to the retry pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchFailurePolicy {
    /// Failed if at least one matched handler failed.
    #[default]
    #[serde(rename = "any_failed")]
    AnyHandlerFailed,
    /// Failed only if every matched handler failed.
    #[serde(rename = "all_failed")]
    AllHandlersFailed,
}

/// Per-handler results of one dispatch, in invocation order.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub results: Vec<HandlerResult>,
}

impl DispatchReport {
    pub fn matched(&self) -> usize {
        self.results.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    /// A dispatch that matched no handler is always a success.
    pub fn is_success(&self, policy: DispatchFailurePolicy) -> bool {
        let failed = self.failed_count();
        match policy {
            DispatchFailurePolicy::AnyHandlerFailed => failed == 0,
            DispatchFailurePolicy::AllHandlersFailed => failed == 0 || failed < self.matched(),
        }
    }

    /// `handler: reason` pairs of every failed handler, joined with `; `.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|r| match &r.outcome {
                HandlerOutcome::Failed { reason } => format!("{}: {}", r.handler, reason),
                HandlerOutcome::Succeeded => r.handler.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// Router
// ============================================================================

/// Failures building the routing table. These are programmer errors and
/// surface at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("Invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Ordered routing table. Built once at startup, then shared read-only.
#[derive(Debug, Default)]
pub struct EventRouter {
    registrations: Vec<HandlerRegistration>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router from a declarative list of registrations.
    pub fn from_registrations(registrations: impl IntoIterator<Item = HandlerRegistration>) -> Self {
        Self {
            registrations: registrations.into_iter().collect(),
        }
    }

    pub fn register(
        &mut self,
        event_pattern: &str,
        action_pattern: Option<&str>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<(), RouterError> {
        let registration = HandlerRegistration::new(event_pattern, action_pattern, handler)?;
        debug!(
            event_pattern,
            action_pattern = action_pattern.unwrap_or("<none>"),
            handler = registration.handler_name(),
            "Registered webhook handler"
        );
        self.registrations.push(registration);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registrations matching `(event_name, action)`, in registration order.
    pub fn matching<'a>(
        &'a self,
        event_name: &'a str,
        action: Option<&'a str>,
    ) -> impl Iterator<Item = &'a HandlerRegistration> + 'a {
        self.registrations
            .iter()
            .filter(move |r| r.matches(event_name, action))
    }

    /// Invoke every matching handler in order and collect their outcomes.
    ///
    /// Once `context.cancellation` fires, the running handler is abandoned and
    /// it and all remaining handlers are recorded as failed with
    /// [`CANCELLED_REASON`].
    pub async fn dispatch(&self, context: &HandlerContext) -> DispatchReport {
        let delivery = &context.delivery;
        let mut report = DispatchReport::default();

        for registration in self.matching(&delivery.event_name, delivery.action.as_deref()) {
            let handler = registration.handler_name().to_string();
            let started = Instant::now();

            let outcome = if context.cancellation.is_cancelled() {
                HandlerOutcome::Failed {
                    reason: CANCELLED_REASON.to_string(),
                }
            } else {
                let invocation = AssertUnwindSafe(registration.handler.handle(context)).catch_unwind();
                tokio::select! {
                    biased;
                    result = invocation => match result {
                        Ok(Ok(())) => HandlerOutcome::Succeeded,
                        Ok(Err(e)) => HandlerOutcome::Failed { reason: e.to_string() },
                        Err(panic) => HandlerOutcome::Failed {
                            reason: format!("handler panicked: {}", panic_message(panic.as_ref())),
                        },
                    },
                    _ = context.cancellation.cancelled() => HandlerOutcome::Failed {
                        reason: CANCELLED_REASON.to_string(),
                    },
                }
            };

            let elapsed = started.elapsed();
            match &outcome {
                HandlerOutcome::Succeeded => info!(
                    delivery_id = %delivery.id,
                    event = %delivery.event_name,
                    action = delivery.action.as_deref().unwrap_or(""),
                    handler = %handler,
                    attempt = context.attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Handler completed"
                ),
                HandlerOutcome::Failed { reason } => warn!(
                    delivery_id = %delivery.id,
                    event = %delivery.event_name,
                    action = delivery.action.as_deref().unwrap_or(""),
                    handler = %handler,
                    attempt = context.attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %reason,
                    "Handler failed"
                ),
            }

            report.results.push(HandlerResult {
                handler,
                outcome,
                elapsed,
            });
        }

        if report.matched() == 0 {
            debug!(
                delivery_id = %delivery.id,
                event = %delivery.event_name,
                "No handler registered for delivery"
            );
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
