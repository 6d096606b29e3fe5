//! Error types for event bus operations

/// Error types for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// The bus was closed before or during the operation
    #[error("event bus shutdown")]
    Shutdown,

    /// Waiting for listeners to settle exceeded the allowed time
    #[error("timed out waiting for {pending} listener task(s) to complete")]
    ListenerDrainTimeout { pending: usize },
}
