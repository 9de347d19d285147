use std::future::Future;
use std::marker::PhantomData;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::ActionContext;

/// Async handler for a single named action.
///
/// The returned value becomes the `data` of an `ok: true` reply; an error
/// becomes the `error` message of an `ok: false` reply. Handlers own all
/// business validation of their payload.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &ActionContext, data: Value) -> anyhow::Result<Value>;
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Handler backed by an async closure over the raw JSON payload.
pub struct FnHandler<F>(F);

/// Wraps an async closure `Fn(Value) -> Future<Output = anyhow::Result<Value>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, _ctx: &ActionContext, data: Value) -> anyhow::Result<Value> {
        (self.0)(data).await
    }
}

/// Handler whose payload and result are serde types.
///
/// The payload is deserialized into `Req` before the closure runs; a payload
/// that does not fit `Req` fails the call with a descriptive error instead of
/// reaching the closure.
pub struct TypedHandler<F, Req, Resp> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// Wraps an async closure `Fn(Req) -> Future<Output = anyhow::Result<Resp>>`.
pub fn typed<Req, Resp, F, Fut>(f: F) -> TypedHandler<F, Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Req, Resp, Fut> ActionHandler for TypedHandler<F, Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    async fn handle(&self, ctx: &ActionContext, data: Value) -> anyhow::Result<Value> {
        let req: Req = serde_json::from_value(data)
            .with_context(|| format!("invalid data for action `{}`", ctx.action))?;
        let resp = (self.f)(req).await?;
        Ok(serde_json::to_value(resp)?)
    }
}
