use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Payload carried on the stream for scheduled and ad-hoc invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub func: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,
}

impl JobEvent {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: serde_json::Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    /// The message carried no `func`; nothing was dispatched.
    Skipped(String),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no handler registered for {0}")]
    UnknownFunction(String),
    #[error("malformed job event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("handler {func} failed: {message}")]
    Handler { func: String, message: String },
    #[error("handler {func} panicked")]
    Panicked { func: String },
}

impl JobError {
    pub fn func(&self) -> Option<&str> {
        match self {
            JobError::UnknownFunction(func)
            | JobError::Handler { func, .. }
            | JobError::Panicked { func } => Some(func),
            JobError::Malformed(_) => None,
        }
    }
}

/// What lands on the dead-letter stream when a dispatch fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The original message, or its lossy UTF-8 text when it was not JSON.
    pub event: Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(payload: &[u8], error: &JobError, failed_at: DateTime<Utc>) -> Self {
        let event = serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        Self {
            event,
            error: error.to_string(),
            failed_at,
        }
    }
}
