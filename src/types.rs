use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{BandError, Result};

/// Radio address plus the pre-shared AES key used to authenticate.
///
/// Immutable for the lifetime of a session.
#[derive(Clone)]
pub struct DeviceIdentity {
    /// Platform BLE identifier.
    /// • Linux / Windows: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    /// • macOS: the CoreBluetooth peripheral UUID
    pub address: String,
    key: [u8; 16],
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, key: [u8; 16]) -> Self {
        Self {
            address: address.into(),
            key,
        }
    }

    /// Build an identity from a 32-character hex key, as exported by the
    /// vendor app.  An optional `0x` prefix is accepted.
    pub fn from_hex(address: impl Into<String>, key_hex: &str) -> Result<Self> {
        let trimmed = key_hex.trim();
        let trimmed = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(trimmed).map_err(|e| BandError::InvalidKey(e.to_string()))?;
        let key: [u8; 16] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| BandError::InvalidKey(format!("expected 16 bytes, got {}", b.len())))?;
        Ok(Self::new(address, key))
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }
}

// The key never ends up in logs.
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Lifecycle state of a [`crate::session::Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    DiscoveringServices,
    Authenticating,
    Ready,
    Fetching,
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::DiscoveringServices => "discovering services",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Fetching => "fetching",
            SessionState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// One minute of historical activity decoded during a history fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Start of the minute this sample covers (device local time).
    pub time: NaiveDateTime,
    /// Steps taken during the minute.
    pub steps: u8,
    /// Heart rate in bpm, or [`crate::protocol::NO_HEART_RATE`] when the band
    /// took no reading.
    pub heart_rate: u8,
}

impl ActivityRecord {
    /// Heart rate, if the band recorded one for this minute.
    pub fn heart_rate(&self) -> Option<u8> {
        (self.heart_rate != crate::protocol::NO_HEART_RATE).then_some(self.heart_rate)
    }
}

/// A live heart-rate reading produced while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeatSample {
    /// Host local time the notification was decoded.
    pub time: NaiveDateTime,
    pub bpm: u8,
}

/// What to do when the notification queue of a characteristic is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued payload to make room.
    #[default]
    DropOldest,
    /// Discard the incoming payload and keep the queue as it is.
    RejectNewest,
}

/// How history fetch treats a minute with no steps and no heart-rate reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyChunkPolicy {
    /// Drop the minute; only minutes with activity become records.
    #[default]
    Skip,
    /// Emit an explicit record with `steps = 0` and `heart_rate = 0xFF`.
    Record,
}

/// Tuning knobs for a [`crate::session::Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on a single request/response step: link establishment,
    /// a write completion, or a direct device reply.
    ///
    /// Bulk activity transfer and live streaming are not bounded by this.
    /// Default: 10 s.
    pub response_timeout: Duration,
    /// Period of the keep-alive ping during heart-rate streaming.
    /// The band silently stops continuous mode after ~15 s without one.
    /// Default: 12 s.
    pub keepalive_interval: Duration,
    /// Maximum number of unread notifications buffered per characteristic.
    /// Default: `256`.
    pub queue_capacity: usize,
    /// Behaviour once `queue_capacity` is reached.
    pub overflow_policy: OverflowPolicy,
    /// Whether idle minutes become records during history fetch.
    pub empty_chunk_policy: EmptyChunkPolicy,
    /// Buffered heart-rate samples between the session and the consumer.
    /// Default: `64`.
    pub stream_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(12),
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::default(),
            empty_chunk_policy: EmptyChunkPolicy::default(),
            stream_buffer: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_hex() {
        let id = DeviceIdentity::from_hex("AA:BB", "0x000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(id.key()[15], 0x0f);
        assert_eq!(id.address, "AA:BB");
    }

    #[test]
    fn test_identity_rejects_short_key() {
        let err = DeviceIdentity::from_hex("AA:BB", "0011").unwrap_err();
        assert!(matches!(err, BandError::InvalidKey(_)));
    }

    #[test]
    fn test_identity_debug_hides_key() {
        let id = DeviceIdentity::new("AA:BB", [0x42; 16]);
        assert!(!format!("{id:?}").contains("42"));
    }

    #[test]
    fn test_record_heart_rate_accessor() {
        let time = chrono::NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let record = ActivityRecord {
            time,
            steps: 3,
            heart_rate: 0xFF,
        };
        assert_eq!(record.heart_rate(), None);
        let record = ActivityRecord {
            heart_rate: 72,
            ..record
        };
        assert_eq!(record.heart_rate(), Some(72));
    }
}
