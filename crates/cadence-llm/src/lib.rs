//! Chat-completion types and provider adapters backing Cadence stage invocations.
//!
//! Provides the `ProviderAdapter` trait, a provider-neutral `Request`/`Response`
//! model, and the Anthropic messages API adapter.

mod anthropic;
mod provider;
mod types;

pub use anthropic::AnthropicAdapter;
pub use provider::ProviderAdapter;
pub use types::*;
