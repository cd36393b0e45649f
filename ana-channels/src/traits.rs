use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

/// Outbound delivery seam. Implementations own their own bounded retry policy;
/// callers treat a returned error as final and never re-retry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unique transport identifier: "evolution", "noop".
    fn transport_id(&self) -> &str;

    /// Deliver a text message to a provider address.
    async fn send(&self, address: &str, message: OutboundMessage) -> Result<()>;
}
