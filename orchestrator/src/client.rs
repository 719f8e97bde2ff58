use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::Instrument;

use crate::backend::{StreamBackend, StreamId};
use crate::job::JobEvent;
use crate::queue::StreamQueue;
use rsq_config::RsqSettings;

/// Producer side: turns function calls into job events on the stream.
#[derive(Clone)]
pub struct Client {
    queue: StreamQueue,
}

impl Client {
    pub fn new(queue: StreamQueue) -> Self {
        Self { queue }
    }

    pub fn from_settings(backend: Arc<dyn StreamBackend>, settings: &RsqSettings) -> Self {
        Self::new(StreamQueue::from_settings(backend, settings))
    }

    pub fn queue(&self) -> &StreamQueue {
        &self.queue
    }

    pub async fn enqueue(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> Result<StreamId> {
        let span = tracing::info_span!("rsq.enqueue", function_name = %func);
        let event = JobEvent::new(func).with_args(args).with_kwargs(kwargs);
        self.enqueue_event(&event).instrument(span).await
    }

    pub async fn enqueue_event(&self, event: &JobEvent) -> Result<StreamId> {
        let payload = event
            .to_bytes()
            .with_context(|| format!("failed to encode job event for {}", event.func))?;
        self.queue.put(&payload).await
    }

    /// Handle whose `delay` enqueues calls to `func`.
    pub fn handle(&self, func: impl Into<String>) -> JobHandle {
        JobHandle {
            func: func.into(),
            client: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JobHandle {
    func: String,
    client: Client,
}

impl JobHandle {
    pub fn func(&self) -> &str {
        &self.func
    }

    /// Enqueues a call instead of running it inline.
    pub async fn delay(
        &self,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> Result<StreamId> {
        self.client.enqueue(&self.func, args, kwargs).await
    }
}
