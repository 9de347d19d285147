//! Action routing: dispatches `ActionRequest` to handlers by action name.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::ActionHandler;
use futures_util::FutureExt;
use serde_json::Value;
use tower::Service;
use tracing::error;

use super::dispatch::{ActionRequest, DispatchError, RouterError};

type BoxedFuture = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

// ---------------------------------------------------------------------------
// ActionRouter
// ---------------------------------------------------------------------------

/// Routes `ActionRequest` values to the handler registered for their action.
///
/// The handler table is fixed once built; clones share it. Requests for an
/// unregistered action return `DispatchError::UnknownAction`.
#[derive(Clone)]
pub struct ActionRouter {
    handlers: Arc<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRouter {
    #[must_use]
    pub fn builder() -> ActionRouterBuilder {
        ActionRouterBuilder::default()
    }

    /// Returns `true` if a handler is registered for `action`.
    #[must_use]
    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRouter")
            .field("actions", &self.actions())
            .finish()
    }
}

impl Service<ActionRequest> for ActionRouter {
    type Response = Value;
    type Error = DispatchError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ActionRequest) -> Self::Future {
        let Some(handler) = self.handlers.get(req.action()).map(Arc::clone) else {
            let action = req.ctx.action;
            return Box::pin(async move { Err(DispatchError::UnknownAction { action }) });
        };

        Box::pin(async move {
            let ActionRequest { ctx, data } = req;
            let outcome = AssertUnwindSafe(handler.handle(&ctx, data))
                .catch_unwind()
                .await;
            match outcome {
                Ok(result) => result.map_err(DispatchError::Handler),
                Err(_panic) => {
                    error!(action = %ctx.action, queue = %ctx.queue, "action handler panicked");
                    Err(DispatchError::Panicked { action: ctx.action })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// ActionRouterBuilder
// ---------------------------------------------------------------------------

/// Collects handlers and validates the table before it is frozen.
#[derive(Default)]
pub struct ActionRouterBuilder {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRouterBuilder {
    /// Registers `handler` under `action`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::EmptyActionName`] for an empty or blank name and
    /// [`RouterError::DuplicateAction`] if `action` is already taken.
    pub fn register<H>(mut self, action: impl Into<String>, handler: H) -> Result<Self, RouterError>
    where
        H: ActionHandler,
    {
        let action = action.into();
        if action.trim().is_empty() {
            return Err(RouterError::EmptyActionName);
        }
        if self.handlers.contains_key(&action) {
            return Err(RouterError::DuplicateAction(action));
        }
        self.handlers.insert(action, Arc::new(handler));
        Ok(self)
    }

    /// Asserts that every name in `actions` has been registered.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::MissingActions`] listing the absent names.
    pub fn require(self, actions: &[&str]) -> Result<Self, RouterError> {
        let missing: Vec<String> = actions
            .iter()
            .filter(|name| !self.handlers.contains_key(**name))
            .map(|name| (*name).to_string())
            .collect();
        if missing.is_empty() {
            Ok(self)
        } else {
            Err(RouterError::MissingActions(missing))
        }
    }

    #[must_use]
    pub fn build(self) -> ActionRouter {
        ActionRouter {
            handlers: Arc::new(self.handlers),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
