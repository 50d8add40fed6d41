// src/context.rs
use std::sync::Arc;
use tracing::Span;

/// One delivery attempt of a queue item.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: String,
    /// Zero-based attempt number for this item on this instance.
    pub attempt: u32,
    pub instance_id: String,
    pub span: Span,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        payload: impl Into<String>,
        attempt: u32,
        instance_id: impl Into<String>,
    ) -> Self {
        let queue = queue.into();
        let instance_id = instance_id.into();
        let span = tracing::info_span!(
            "delivery",
            queue = %queue,
            instance = %instance_id,
            attempt,
        );

        Self {
            queue,
            payload: payload.into(),
            attempt,
            instance_id,
            span,
        }
    }
}

/// External processor receiving dispatched items.
///
/// An `Err` counts as a failed attempt and is retried per the queue's
/// schedule. The engine enforces the processor timeout itself.
#[async_trait::async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<T: Processor + ?Sized> Processor for Arc<T> {
    async fn process(&self, delivery: &Delivery) -> anyhow::Result<()> {
        self.as_ref().process(delivery).await
    }
}

/// Adapts an async closure into a [`Processor`].
pub struct FnProcessor<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, delivery: &Delivery) -> anyhow::Result<()> {
        (self.0)(delivery.clone()).await
    }
}
