//! Telephony transport traits

use async_trait::async_trait;

use crate::telephony::{CallStart, InboundMessage, OutboundMessage};
use crate::Result;

/// Read half of a telephony connection
///
/// Implementations decode the provider wire format exactly once and hand
/// out [`InboundMessage`] values.
#[async_trait]
pub trait TelephonySource: Send + 'static {
    /// Next decoded message, or `None` once the connection is closed
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn recv(&mut self) -> Option<Result<InboundMessage>>;
}

/// Write half of a telephony connection
#[async_trait]
pub trait TelephonySink: Send + 'static {
    /// Encode and write one message
    async fn send(&mut self, message: OutboundMessage) -> Result<()>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;

    /// Attach provider stream metadata once the call has started
    fn bind_call(&mut self, _call: &CallStart) {}
}
