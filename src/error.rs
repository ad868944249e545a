//! Error types shared by the link core.
//!
//! The variants follow the failure taxonomy the orchestration code relies on:
//! transient errors are consumed by retry loops, race-lost outcomes are never
//! errors at all (they are silent aborts), terminal peer errors stop retries,
//! and precondition violations are returned synchronously to the caller.
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`crate::transport::TransportLink`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Transport has never seen this device.
    #[error("device {0} not found")]
    NotFound(String),

    /// Connect attempt failed or the link dropped immediately afterwards.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Another connect is already in progress on the transport.
    #[error("transport busy")]
    Busy,

    /// The peripheral has forgotten the bond; re-pairing is required.
    #[error("pairing invalidated for {0}")]
    PairingInvalidated(String),

    /// Scan could not be started (adapter off, permissions, ...).
    #[error("scan failed: {0}")]
    ScanFailed(String),
}

impl LinkError {
    /// Terminal errors must never be retried by background loops.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkError::PairingInvalidated(_))
    }
}

/// Errors raised by a [`crate::protocol::ProtocolSession`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    /// Operation requires a completed handshake.
    #[error("session not ready")]
    NotReady,
}

/// Errors surfaced by region apply requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// Precondition violation: no live session with the radio.
    #[error("radio not connected")]
    NotConnected,

    /// A different region value is already being applied.
    #[error("region apply already in progress for {0}")]
    Busy(String),

    #[error("region write rejected: {0}")]
    WriteRejected(#[from] ProtocolError),

    /// Radio came back as a different device than the one the write was sent to.
    #[error("reconnected to {found} instead of {expected}")]
    DeviceMismatch { expected: String, found: String },

    #[error("pairing invalidated while applying region")]
    PairingInvalidated,

    /// The radio was given up on before the reboot cycle completed.
    #[error("link lost during reboot cycle")]
    LinkLost,

    #[error("no confirmation within {0:?}")]
    Timeout(Duration),
}

/// Errors from a [`crate::storage::PairingStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by [`crate::link::LinkManager`] entry points.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// No device has been paired yet, nothing to reconnect to.
    #[error("no paired device")]
    NoTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalidation_is_terminal() {
        assert!(LinkError::PairingInvalidated("AA".into()).is_terminal());
        assert!(!LinkError::ConnectFailed("gatt 133".into()).is_terminal());
        assert!(!LinkError::NotFound("AA".into()).is_terminal());
        assert!(!LinkError::Busy.is_terminal());
        assert!(!LinkError::ScanFailed("adapter off".into()).is_terminal());
    }

    #[test]
    fn region_timeout_keeps_sub_second_precision() {
        let err = RegionError::Timeout(Duration::from_millis(150));
        assert_eq!(err.to_string(), "no confirmation within 150ms");
    }

    #[test]
    fn region_error_wraps_protocol() {
        let err: RegionError = ProtocolError::NotReady.into();
        assert_eq!(err, RegionError::WriteRejected(ProtocolError::NotReady));
        assert_eq!(err.to_string(), "region write rejected: session not ready");
    }
}
