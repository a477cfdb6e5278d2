use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;

/// Invocable job code: one context in, a result or an error out.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, ctx: ExecutionContext) -> anyhow::Result<Value>;
}

pub type SharedHandler = Arc<dyn Handler>;

/// Any `Fn(ExecutionContext) -> impl Future<Output = anyhow::Result<Value>>` is a handler.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, ctx: ExecutionContext) -> anyhow::Result<Value> {
        (self)(ctx).await
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(f)
}
