use crate::correlation::CorrelationId;

/// Per-message context handed to an action handler alongside its payload.
/// Carries routing metadata only; handlers must not rely on it for business rules.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Name of the action being dispatched.
    pub action: String,
    /// Request queue the message was consumed from.
    pub queue: String,
    /// Correlation id of the request, if the sender attached one.
    pub correlation_id: Option<CorrelationId>,
    /// Reply address of the request. `None` for one-way events.
    pub reply_to: Option<String>,
}

impl ActionContext {
    /// Context for a dispatch outside of any broker delivery (tests, local calls).
    #[must_use]
    pub fn local(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            queue: String::new(),
            correlation_id: None,
            reply_to: None,
        }
    }
}
