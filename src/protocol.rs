//! GATT UUIDs and fixed wire commands for Mi Band 2/3 class trackers.
//!
//! The band splits its surface over three services.  Vendor characteristics
//! live in the Huami namespace `0000XXXX-0000-3512-2118-0009af100700`; the
//! services themselves and the heart-rate characteristics use the Bluetooth
//! base UUID `0000XXXX-0000-1000-8000-00805f9b34fb`.

use uuid::Uuid;

/// Expand a 16-bit Bluetooth SIG short id into a full 128-bit UUID.
const fn short_uuid(id: u16) -> Uuid {
    Uuid::from_u128(((id as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Expand a Huami vendor short id into a full 128-bit UUID.
const fn huami_uuid(id: u16) -> Uuid {
    Uuid::from_u128(((id as u128) << 96) | 0x0000_0000_0000_3512_2118_0009_af10_0700)
}

// ── Services ─────────────────────────────────────────────────────────────────

/// Band-primary service (`fee0`): activity fetch and activity data.
pub const BAND_PRIMARY_SERVICE: Uuid = short_uuid(0xfee0);

/// Band-secondary service (`fee1`): authentication.
pub const BAND_SECONDARY_SERVICE: Uuid = short_uuid(0xfee1);

/// Standard Heart Rate service (`180d`).
pub const HEART_RATE_SERVICE: Uuid = short_uuid(0x180d);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Challenge-response authentication channel (band-secondary).
pub const AUTH_CHARACTERISTIC: Uuid = huami_uuid(0x0009);

/// Activity fetch control channel (band-primary).
///
/// Receives the fetch trigger and the confirm command; notifies the
/// start-time acknowledgement and the end-of-transfer marker.
pub const FETCH_CHARACTERISTIC: Uuid = huami_uuid(0x0004);

/// Bulk activity data channel (band-primary).
///
/// Each notification is one index byte followed by 4-byte per-minute chunks.
pub const ACTIVITY_DATA_CHARACTERISTIC: Uuid = huami_uuid(0x0005);

/// Heart Rate Control Point (`2a39`).
pub const HEART_RATE_CONTROL_CHARACTERISTIC: Uuid = short_uuid(0x2a39);

/// Heart Rate Measurement (`2a37`).
pub const HEART_RATE_MEASUREMENT_CHARACTERISTIC: Uuid = short_uuid(0x2a37);

/// Client Characteristic Configuration descriptor (`2902`).
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = short_uuid(0x2902);

// ── Authentication ────────────────────────────────────────────────────────────

/// Ask the band for a fresh 16-byte challenge.
pub const AUTH_CMD_REQUEST_CHALLENGE: [u8; 2] = [0x02, 0x00];

/// Prefix of the encrypted challenge reply.
pub const AUTH_CMD_CHALLENGE_RESPONSE: [u8; 2] = [0x03, 0x00];

/// Marker heading the challenge notification; 16 challenge bytes follow.
pub const AUTH_RESP_CHALLENGE: [u8; 3] = [0x10, 0x02, 0x01];

/// Exact notification the band sends when the reply decrypted correctly.
pub const AUTH_RESP_AUTH_OK: [u8; 3] = [0x10, 0x03, 0x01];

/// Length of the AES challenge and of the encrypted response.
pub const CHALLENGE_LEN: usize = 16;

// ── Activity fetch ────────────────────────────────────────────────────────────

/// Fetch trigger header, followed by the 6-byte start timestamp.
pub const FETCH_CMD_TRIGGER_HEADER: [u8; 2] = [0x01, 0x01];

/// Fetch trigger trailer.
pub const FETCH_CMD_TRIGGER_TRAILER: [u8; 2] = [0x00, 0x17];

/// Confirm the server-chosen start time and begin the transfer.
pub const FETCH_CMD_CONFIRM: [u8; 1] = [0x02];

/// Marker heading the start-time acknowledgement.
pub const FETCH_RESP_START_TIME: [u8; 3] = [0x10, 0x01, 0x01];

/// Exact length of the start-time acknowledgement.
///
/// Marker (3) + sample count (4) + timestamp (6) + seconds and time-zone (2).
pub const FETCH_START_TIME_RESP_LEN: usize = 15;

/// Offset of the 6-byte timestamp inside the start-time acknowledgement.
pub const FETCH_START_TIME_OFFSET: usize = 7;

/// Usual end-of-transfer marker.
pub const FETCH_RESP_FINISHED: [u8; 3] = [0x10, 0x02, 0x01];

/// Sent instead of a start-time acknowledgement when nothing is stored.
pub const FETCH_RESP_NO_DATA: [u8; 3] = [0x10, 0x02, 0x04];

/// Bytes per one-minute activity sample.
pub const ACTIVITY_CHUNK_LEN: usize = 4;

/// Heart-rate byte meaning "no reading for this minute".
pub const NO_HEART_RATE: u8 = 0xFF;

// ── Heart rate ────────────────────────────────────────────────────────────────

/// Stop continuous measurement.
pub const HR_CMD_STOP_CONTINUOUS: [u8; 3] = [0x15, 0x01, 0x00];

/// Stop a one-shot manual measurement.
pub const HR_CMD_STOP_MANUAL: [u8; 3] = [0x15, 0x02, 0x00];

/// Start continuous measurement.
pub const HR_CMD_START_CONTINUOUS: [u8; 3] = [0x15, 0x01, 0x01];

/// Keep continuous measurement alive; the band stops it without this.
pub const HR_CMD_PING: [u8; 1] = [0x16];

/// Measurement status byte for a plain 8-bit bpm value.
pub const HR_MEASUREMENT_STATUS_OK: u8 = 0x00;

/// Opcode shared by the measurement-mode commands; `15 00 xx` toggles the
/// background monitor.
pub const HR_CMD_MODE: u8 = 0x15;

/// Opcode of the periodic measurement interval command, `14 <minutes>`.
///
/// The interval has its own opcode. [`HR_CMD_MODE`] carries only the
/// mode toggles, so `15 <minutes>` does not set an interval.
pub const HR_CMD_SET_INTERVAL: u8 = 0x14;

/// Build the background-monitor enable/disable command.
pub fn background_monitor_command(enabled: bool) -> [u8; 3] {
    [HR_CMD_MODE, 0x00, u8::from(enabled)]
}

/// Build the background-monitor sampling interval command.
pub fn background_interval_command(interval_minutes: u8) -> [u8; 2] {
    [HR_CMD_SET_INTERVAL, interval_minutes]
}
