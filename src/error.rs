use thiserror::Error;

use crate::transport::GattTarget;
use crate::types::SessionState;

/// Failures reported by the platform BLE stack or the link itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("not connected")]
    NotConnected,

    #[error("{target} failed with GATT status 0x{status:02x}")]
    Gatt { target: GattTarget, status: u8 },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Backend(String),
}

/// Error type for every session operation.
///
/// Cloneable so that a single link loss can be delivered to every pending
/// operation and notification waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BandError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("operation already in progress on {0}")]
    OperationInProgress(GattTarget),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed (wrong key?)")]
    AuthenticationFailed,

    #[error("required {0} not found on device")]
    ServiceNotFound(String),

    #[error("session busy: another operation is in flight")]
    SessionBusy,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid session state: expected {expected}, was {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("invalid pairing key: {0}")]
    InvalidKey(String),
}

impl BandError {
    /// `true` when the error means the link is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            BandError::Transport(TransportError::ConnectionLost | TransportError::NotConnected)
        )
    }
}

pub type Result<T, E = BandError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AUTH_CHARACTERISTIC, CLIENT_CHARACTERISTIC_CONFIG};

    #[test]
    fn test_band_error_display() {
        let err = BandError::from(TransportError::ConnectionLost);
        assert_eq!(err.to_string(), "transport error: connection lost");

        let err = BandError::Protocol("unexpected marker".to_string());
        assert_eq!(err.to_string(), "protocol error: unexpected marker");

        let err = BandError::InvalidState {
            expected: SessionState::Ready,
            actual: SessionState::Disconnected,
        };
        assert_eq!(
            err.to_string(),
            "invalid session state: expected ready, was disconnected"
        );
    }

    #[test]
    fn test_gatt_error_names_target() {
        let err = TransportError::Gatt {
            target: GattTarget::Descriptor {
                characteristic: AUTH_CHARACTERISTIC,
                descriptor: CLIENT_CHARACTERISTIC_CONFIG,
            },
            status: 0x85,
        };
        assert_eq!(
            err.to_string(),
            "descriptor 00002902-0000-1000-8000-00805f9b34fb of \
             00000009-0000-3512-2118-0009af100700 failed with GATT status 0x85"
        );
    }

    #[test]
    fn test_connection_lost_classification() {
        assert!(BandError::from(TransportError::ConnectionLost).is_connection_lost());
        assert!(!BandError::AuthenticationFailed.is_connection_lost());
    }
}
