//! Binary encoders and decoders for band payloads.
//!
//! All functions here are pure and safe to call from any context.
//!
//! | Function | Direction | Format |
//! |---|---|---|
//! | [`encode_timestamp`] / [`decode_timestamp`] | both | u16 LE year, month, day, hour, minute |
//! | [`encode_fetch_trigger`] | host → band | `01 01` + timestamp + `00 17` |
//! | [`decode_start_time`] | band → host | `10 01 01` + count (4) + timestamp + 2 |
//! | [`activity_chunks`] | band → host | index byte + N × 4-byte chunks |
//! | [`decode_heart_rate`] | band → host | status byte + bpm |
//! | [`parse_challenge`] / [`encode_challenge_response`] | both | auth handshake frames |

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use log::debug;

use crate::error::{BandError, Result};
use crate::protocol::{
    ACTIVITY_CHUNK_LEN, AUTH_CMD_CHALLENGE_RESPONSE, AUTH_RESP_CHALLENGE, CHALLENGE_LEN,
    FETCH_CMD_TRIGGER_HEADER, FETCH_CMD_TRIGGER_TRAILER, FETCH_RESP_START_TIME,
    FETCH_START_TIME_OFFSET, FETCH_START_TIME_RESP_LEN, HR_MEASUREMENT_STATUS_OK, NO_HEART_RATE,
};
use crate::types::{ActivityRecord, EmptyChunkPolicy};

/// Length of an encoded device timestamp.
pub const TIMESTAMP_LEN: usize = 6;

// ── Timestamps ────────────────────────────────────────────────────────────────

/// Encode a minute-resolution timestamp in the band's 6-byte layout.
///
/// ```
/// # use miband_rs::codec::encode_timestamp;
/// let t = chrono::NaiveDate::from_ymd_opt(2021, 5, 1).unwrap().and_hms_opt(13, 7, 0).unwrap();
/// assert_eq!(encode_timestamp(t), [0xE5, 0x07, 5, 1, 13, 7]);
/// ```
pub fn encode_timestamp(time: NaiveDateTime) -> [u8; TIMESTAMP_LEN] {
    let year = (time.year() as u16).to_le_bytes();
    [
        year[0],
        year[1],
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
    ]
}

/// Decode the band's 6-byte timestamp.  Seconds are always zero.
pub fn decode_timestamp(bytes: &[u8]) -> Result<NaiveDateTime> {
    if bytes.len() != TIMESTAMP_LEN {
        return Err(BandError::Protocol(format!(
            "timestamp must be {TIMESTAMP_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let year = u16::from_le_bytes([bytes[0], bytes[1]]) as i32;
    let (month, day, hour, minute) = (bytes[2], bytes[3], bytes[4], bytes[5]);
    NaiveDate::from_ymd_opt(year, month.into(), day.into())
        .and_then(|d| d.and_hms_opt(hour.into(), minute.into(), 0))
        .ok_or_else(|| {
            BandError::Protocol(format!(
                "invalid timestamp {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}"
            ))
        })
}

// ── History fetch ─────────────────────────────────────────────────────────────

/// Build the packet that asks the band for activity recorded since `since`.
pub fn encode_fetch_trigger(since: NaiveDateTime) -> [u8; 10] {
    let mut packet = [0u8; 10];
    packet[..2].copy_from_slice(&FETCH_CMD_TRIGGER_HEADER);
    packet[2..8].copy_from_slice(&encode_timestamp(since));
    packet[8..].copy_from_slice(&FETCH_CMD_TRIGGER_TRAILER);
    packet
}

/// Decode the start-time acknowledgement into the server-chosen start time.
///
/// The band may start earlier or later than requested; records are stamped
/// from this value, not from the request.
pub fn decode_start_time(resp: &[u8]) -> Result<NaiveDateTime> {
    if !resp.starts_with(&FETCH_RESP_START_TIME) || resp.len() != FETCH_START_TIME_RESP_LEN {
        return Err(BandError::Protocol(format!(
            "expected start-time acknowledgement, got {resp:02x?}"
        )));
    }
    decode_timestamp(&resp[FETCH_START_TIME_OFFSET..FETCH_START_TIME_OFFSET + TIMESTAMP_LEN])
}

/// One minute of raw activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityChunk {
    pub steps: u8,
    pub heart_rate: u8,
}

impl ActivityChunk {
    /// No steps and no heart-rate reading.
    pub fn is_empty(&self) -> bool {
        self.steps == 0 && self.heart_rate == NO_HEART_RATE
    }
}

/// Split an activity-data notification into its per-minute chunks.
///
/// The first byte is a rolling packet index and is skipped.  A trailing
/// partial chunk is ignored.
pub fn activity_chunks(data: &[u8]) -> impl Iterator<Item = ActivityChunk> + '_ {
    let body = data.get(1..).unwrap_or_default();
    let rest = body.len() % ACTIVITY_CHUNK_LEN;
    if rest != 0 {
        debug!("activity packet has {rest} trailing byte(s), ignored");
    }
    body.chunks_exact(ACTIVITY_CHUNK_LEN).map(|c| ActivityChunk {
        steps: c[2],
        heart_rate: c[3],
    })
}

/// Stateful decoder that stamps activity chunks with consecutive minutes.
///
/// Every chunk advances the clock by one minute, including chunks dropped by
/// [`EmptyChunkPolicy::Skip`].
#[derive(Debug)]
pub struct ActivityDecoder {
    cursor: NaiveDateTime,
    policy: EmptyChunkPolicy,
    records: Vec<ActivityRecord>,
}

impl ActivityDecoder {
    pub fn new(start: NaiveDateTime, policy: EmptyChunkPolicy) -> Self {
        Self {
            cursor: start,
            policy,
            records: Vec::new(),
        }
    }

    /// Decode one activity-data notification.
    pub fn feed(&mut self, data: &[u8]) {
        for chunk in activity_chunks(data) {
            if !chunk.is_empty() || self.policy == EmptyChunkPolicy::Record {
                debug!(
                    "{} steps {} heart rate {}",
                    self.cursor, chunk.steps, chunk.heart_rate
                );
                self.records.push(ActivityRecord {
                    time: self.cursor,
                    steps: chunk.steps,
                    heart_rate: chunk.heart_rate,
                });
            }
            self.cursor += Duration::minutes(1);
        }
    }

    /// Timestamp the next chunk will receive.
    pub fn cursor(&self) -> NaiveDateTime {
        self.cursor
    }

    pub fn into_records(self) -> Vec<ActivityRecord> {
        self.records
    }
}

// ── Heart rate ────────────────────────────────────────────────────────────────

/// Decode a heart-rate measurement notification into bpm.
///
/// ```
/// # use miband_rs::codec::decode_heart_rate;
/// assert_eq!(decode_heart_rate(&[0x00, 72]).unwrap(), 72);
/// assert!(decode_heart_rate(&[0x01, 72]).is_err());
/// ```
pub fn decode_heart_rate(data: &[u8]) -> Result<u8> {
    match data {
        [HR_MEASUREMENT_STATUS_OK, bpm, ..] => Ok(*bpm),
        _ => Err(BandError::Protocol(format!(
            "unexpected heart-rate measurement {data:02x?}"
        ))),
    }
}

// ── Authentication ────────────────────────────────────────────────────────────

/// Extract the 16-byte challenge from the band's challenge notification.
pub fn parse_challenge(resp: &[u8]) -> Result<[u8; CHALLENGE_LEN]> {
    if !resp.starts_with(&AUTH_RESP_CHALLENGE) {
        return Err(BandError::Protocol(format!(
            "expected challenge, got {resp:02x?}"
        )));
    }
    resp[AUTH_RESP_CHALLENGE.len()..].try_into().map_err(|_| {
        BandError::Protocol(format!("wrong size of challenge: {}", resp.len()))
    })
}

/// Frame the encrypted challenge for writing back to the band.
pub fn encode_challenge_response(encrypted: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(AUTH_CMD_CHALLENGE_RESPONSE.len() + CHALLENGE_LEN);
    packet.extend_from_slice(&AUTH_CMD_CHALLENGE_RESPONSE);
    packet.extend_from_slice(encrypted);
    packet
}
