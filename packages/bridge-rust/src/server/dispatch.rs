//! Dispatch request and error types shared by the router and middleware.

use courier_core::ActionContext;
use serde_json::Value;

/// A parsed request on its way to an action handler.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub ctx: ActionContext,
    pub data: Value,
}

impl ActionRequest {
    #[must_use]
    pub fn new(ctx: ActionContext, data: Value) -> Self {
        Self { ctx, data }
    }

    /// Request outside of any broker delivery.
    #[must_use]
    pub fn local(action: impl Into<String>, data: Value) -> Self {
        Self::new(ActionContext::local(action), data)
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.ctx.action
    }
}

/// Why a request did not produce a handler result.
///
/// The `Display` form is what the caller receives as the `error` field of an
/// `ok: false` reply.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },
    #[error("{0:#}")]
    Handler(anyhow::Error),
    #[error("handler for `{action}` timed out after {timeout_ms}ms")]
    Timeout { action: String, timeout_ms: u64 },
    #[error("handler for `{action}` panicked")]
    Panicked { action: String },
}

impl DispatchError {
    /// Metric label for this failure.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::UnknownAction { .. } => "unknown_action",
            Self::Handler(_) => "handler_error",
            Self::Timeout { .. } => "timeout",
            Self::Panicked { .. } => "panicked",
        }
    }
}

/// Rejected router registrations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("action name must not be empty")]
    EmptyActionName,
    #[error("action `{0}` is already registered")]
    DuplicateAction(String),
    #[error("required actions are not registered: {}", .0.join(", "))]
    MissingActions(Vec<String>),
}
