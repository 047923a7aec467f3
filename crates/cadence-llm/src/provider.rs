use async_trait::async_trait;

use cadence_types::Result;

use crate::{Request, Response};

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

/// A chat-completion backend. Implementations translate the provider-neutral
/// [`Request`] into their wire format and map HTTP failures onto
/// [`cadence_types::CadenceError`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Response>;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
