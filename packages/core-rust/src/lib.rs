//! Courier Core: correlation ids, message envelopes, and the action handler contract.

pub mod context;
pub mod correlation;
pub mod envelope;
pub mod message;
pub mod traits;

pub use context::ActionContext;
pub use correlation::CorrelationId;
pub use envelope::{EnvelopeError, RequestEnvelope, ResponseEnvelope};
pub use message::MessageProperties;
pub use traits::{handler_fn, typed, ActionHandler, FnHandler, TypedHandler};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
