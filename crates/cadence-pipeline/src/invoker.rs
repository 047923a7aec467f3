//! The stage invocation boundary: the single point where external model calls
//! happen.

use async_trait::async_trait;
use serde_json::Value;

use cadence_types::{Result, SharedState};

/// Everything an invoker needs for one attempt of one stage.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: String,
    /// Base instruction plus any retry feedback.
    pub instruction: String,
    /// Read-only projection of the stage's required keys.
    pub inputs: SharedState,
    pub tools: Vec<String>,
    /// Zero-based attempt index.
    pub attempt: u32,
}

#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, request: &StageRequest) -> Result<Value>;
}

/// Adapts a synchronous closure into a [`StageInvoker`].
pub struct FnInvoker<F> {
    f: F,
}

impl<F> FnInvoker<F>
where
    F: Fn(&StageRequest) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> StageInvoker for FnInvoker<F>
where
    F: Fn(&StageRequest) -> Result<Value> + Send + Sync,
{
    async fn invoke(&self, request: &StageRequest) -> Result<Value> {
        (self.f)(request)
    }
}
