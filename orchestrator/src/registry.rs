use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::Instrument;

use crate::cron::{CronError, CronExpr};
use crate::job::{JobError, JobEvent, JobOutcome};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: JobEvent) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, event: JobEvent) -> Result<Value> {
        (self.0)(event).await
    }
}

/// A handler name bound to the cron expression that triggers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub func: String,
    pub expr: CronExpr,
}

/// Handlers by name plus the schedules that enqueue them.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    schedules: Vec<ScheduledJob>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, optionally with a schedule. A second
    /// registration under the same name replaces the first.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        schedule: Option<&str>,
        handler: F,
    ) -> Result<(), CronError>
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let expr = schedule.map(CronExpr::parse).transpose()?;
        let name = name.into();
        self.handlers
            .insert(name.clone(), Arc::new(FnHandler(handler)) as Arc<dyn Handler>);
        match expr {
            Some(expr) => self.set_schedule(name, expr),
            None => self.schedules.retain(|job| job.func != name),
        }
        Ok(())
    }

    pub fn job<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        self.handlers
            .insert(name.clone(), Arc::new(FnHandler(handler)) as Arc<dyn Handler>);
        self.schedules.retain(|job| job.func != name);
    }

    pub fn schedule<F, Fut>(
        &mut self,
        name: impl Into<String>,
        expr: &str,
        handler: F,
    ) -> Result<(), CronError>
    where
        F: Fn(JobEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Some(expr), handler)
    }

    /// Attaches a schedule to an already registered handler.
    pub fn bind_schedule(&mut self, name: &str, expr: &str) -> Result<()> {
        if !self.handlers.contains_key(name) {
            anyhow::bail!("cannot schedule {name}: no handler registered under that name");
        }
        let expr = CronExpr::parse(expr)?;
        self.set_schedule(name.to_string(), expr);
        Ok(())
    }

    fn set_schedule(&mut self, func: String, expr: CronExpr) {
        match self.schedules.iter_mut().find(|job| job.func == func) {
            Some(existing) => existing.expr = expr,
            None => self.schedules.push(ScheduledJob { func, expr }),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn schedules(&self) -> &[ScheduledJob] {
        &self.schedules
    }

    /// Decodes a stream payload and runs the matching handler.
    ///
    /// Payloads that decode to a JSON object without `func` are skipped.
    /// Handlers run on their own task so a panic surfaces as
    /// [`JobError::Panicked`] instead of unwinding the caller.
    pub async fn dispatch(&self, payload: &[u8]) -> Result<JobOutcome, JobError> {
        let value: Value = serde_json::from_slice(payload)?;
        if value.get("func").is_none() {
            return Ok(JobOutcome::Skipped("message has no func".to_string()));
        }
        let event: JobEvent = serde_json::from_value(value)?;
        let func = event.func.clone();
        let handler = self
            .resolve(&func)
            .ok_or_else(|| JobError::UnknownFunction(func.clone()))?;

        let span = tracing::info_span!(
            "rsq.job",
            rsq.function = %func,
            rsq.duration_ms = tracing::field::Empty,
            rsq.outcome = tracing::field::Empty,
        );
        let start = Instant::now();
        let task = async move { handler.handle(event).await }.instrument(span.clone());
        let joined = tokio::spawn(task).await;
        span.record("rsq.duration_ms", start.elapsed().as_secs_f64() * 1000.0);
        match joined {
            Ok(Ok(value)) => {
                span.record("rsq.outcome", "success");
                Ok(JobOutcome::Completed(value))
            }
            Ok(Err(err)) => {
                span.record("rsq.outcome", "error");
                Err(JobError::Handler {
                    func,
                    message: format!("{err:#}"),
                })
            }
            Err(_) => {
                span.record("rsq.outcome", "panic");
                Err(JobError::Panicked { func })
            }
        }
    }
}
