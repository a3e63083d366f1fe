//! A scripted band that speaks the session protocol over the transport seam.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use miband_rs::auth::encrypt_challenge;
use miband_rs::codec::encode_timestamp;
use miband_rs::error::TransportError;
use miband_rs::protocol::*;
use miband_rs::session::Session;
use miband_rs::transport::{
    GattService, GattTarget, Transport, TransportEvent, GATT_ERROR, GATT_SUCCESS,
};
use miband_rs::types::{DeviceIdentity, SessionConfig};

pub const ADDRESS: &str = "C8:0F:10:AA:BB:CC";

pub fn band_key() -> [u8; 16] {
    core::array::from_fn(|i| 0x30 + i as u8)
}

/// Start-time acknowledgement announcing `start`.
pub fn start_ack(start: NaiveDateTime) -> Vec<u8> {
    let mut ack = vec![0u8; FETCH_START_TIME_RESP_LEN];
    ack[..3].copy_from_slice(&FETCH_RESP_START_TIME);
    ack[FETCH_START_TIME_OFFSET..FETCH_START_TIME_OFFSET + 6]
        .copy_from_slice(&encode_timestamp(start));
    ack
}

/// Activity-data packet with the given `(steps, heart_rate)` minutes.
pub fn activity_packet(index: u8, minutes: &[(u8, u8)]) -> Vec<u8> {
    let mut packet = vec![index];
    for &(steps, hr) in minutes {
        packet.extend_from_slice(&[0x01, 0x00, steps, hr]);
    }
    packet
}

#[derive(Debug)]
struct BandState {
    events: Option<mpsc::Sender<TransportEvent>>,
    key: [u8; 16],
    challenge: [u8; 16],
    missing_service: Option<Uuid>,
    start_ack: Vec<u8>,
    activity: Vec<Vec<u8>>,
    end_marker: Option<Vec<u8>>,
    hold_writes: bool,
    failing: Vec<(Uuid, Option<Vec<u8>>)>,
    writes: Vec<(Uuid, Vec<u8>)>,
    subscriptions: Vec<(Uuid, bool)>,
    connects: usize,
    disconnects: usize,
}

#[derive(Debug)]
pub struct SimulatedBand {
    state: Mutex<BandState>,
}

impl SimulatedBand {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BandState {
                events: None,
                key: band_key(),
                challenge: core::array::from_fn(|i| 0xA0 ^ i as u8),
                missing_service: None,
                start_ack: FETCH_RESP_NO_DATA.to_vec(),
                activity: Vec::new(),
                end_marker: Some(FETCH_RESP_FINISHED.to_vec()),
                hold_writes: false,
                failing: Vec::new(),
                writes: Vec::new(),
                subscriptions: Vec::new(),
                connects: 0,
                disconnects: 0,
            }),
        }
    }

    pub fn without_service(self, service: Uuid) -> Self {
        self.state.lock().unwrap().missing_service = Some(service);
        self
    }

    /// History the band serves on the next fetch.
    pub fn with_history(self, ack: Vec<u8>, activity: Vec<Vec<u8>>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.start_ack = ack;
            state.activity = activity;
        }
        self
    }

    /// Never send the end-of-transfer marker.
    pub fn stall_transfer(self) -> Self {
        self.state.lock().unwrap().end_marker = None;
        self
    }

    /// Close the transfer with `marker` instead of the usual `10 02 01`.
    pub fn with_end_marker(self, marker: Vec<u8>) -> Self {
        self.state.lock().unwrap().end_marker = Some(marker);
        self
    }

    /// Stop acknowledging writes.
    pub fn hold_writes(&self) {
        self.state.lock().unwrap().hold_writes = true;
    }

    /// Report GATT failure for every write to `characteristic`.
    pub fn fail_writes_to(&self, characteristic: Uuid) {
        self.state.lock().unwrap().failing.push((characteristic, None));
    }

    /// Report GATT failure only for writes of `value` to `characteristic`.
    pub fn fail_write(&self, characteristic: Uuid, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .failing
            .push((characteristic, Some(value.to_vec())));
    }

    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(TransportEvent::Notification {
            characteristic,
            value,
        });
    }

    /// Simulate the band walking out of range.
    pub fn drop_link(&self) {
        let events = self.state.lock().unwrap().events.take();
        if let Some(events) = events {
            let _ = events.try_send(TransportEvent::Disconnected);
        }
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(Uuid, bool)> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    /// Whether the last CCCD write left notifications on for `characteristic`.
    pub fn notifying(&self, characteristic: Uuid) -> bool {
        self.subscriptions()
            .into_iter()
            .rev()
            .find(|(c, _)| *c == characteristic)
            .map_or(false, |(_, enabled)| enabled)
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    fn emit(&self, event: TransportEvent) {
        let events = self.state.lock().unwrap().events.clone();
        if let Some(events) = events {
            let _ = events.try_send(event);
        }
    }

    fn complete(&self, target: GattTarget, characteristic: Uuid, value: Option<&[u8]>) -> bool {
        let (hold, failed) = {
            let state = self.state.lock().unwrap();
            let failed = state.failing.iter().any(|(c, v)| {
                *c == characteristic
                    && match v {
                        None => true,
                        Some(v) => value == Some(v.as_slice()),
                    }
            });
            (state.hold_writes, failed)
        };
        if hold {
            return false;
        }
        let status = if failed {
            GATT_ERROR
        } else {
            GATT_SUCCESS
        };
        self.emit(TransportEvent::WriteCompleted { target, status });
        status == GATT_SUCCESS
    }

    fn respond(&self, characteristic: Uuid, value: &[u8]) {
        let mut replies = Vec::new();
        {
            let state = self.state.lock().unwrap();
            if characteristic == AUTH_CHARACTERISTIC {
                if value == AUTH_CMD_REQUEST_CHALLENGE {
                    let mut reply = AUTH_RESP_CHALLENGE.to_vec();
                    reply.extend_from_slice(&state.challenge);
                    replies.push((AUTH_CHARACTERISTIC, reply));
                } else if value.starts_with(&AUTH_CMD_CHALLENGE_RESPONSE) {
                    let expected = encrypt_challenge(&state.key, &state.challenge);
                    let reply = if value[2..] == expected {
                        AUTH_RESP_AUTH_OK.to_vec()
                    } else {
                        vec![0x10, 0x03, 0x04]
                    };
                    replies.push((AUTH_CHARACTERISTIC, reply));
                }
            } else if characteristic == FETCH_CHARACTERISTIC {
                if value.starts_with(&FETCH_CMD_TRIGGER_HEADER) {
                    replies.push((FETCH_CHARACTERISTIC, state.start_ack.clone()));
                } else if value == FETCH_CMD_CONFIRM {
                    for packet in &state.activity {
                        replies.push((ACTIVITY_DATA_CHARACTERISTIC, packet.clone()));
                    }
                    if let Some(marker) = &state.end_marker {
                        replies.push((FETCH_CHARACTERISTIC, marker.clone()));
                    }
                }
            }
        }
        for (characteristic, value) in replies {
            self.notify(characteristic, value);
        }
    }
}

#[async_trait]
impl Transport for SimulatedBand {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        let _ = tx.try_send(TransportEvent::Connected);
        let mut state = self.state.lock().unwrap();
        state.events = Some(tx);
        state.connects += 1;
        Ok(rx)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        let missing = self.state.lock().unwrap().missing_service;
        let profile = vec![
            GattService {
                uuid: BAND_PRIMARY_SERVICE,
                characteristics: vec![FETCH_CHARACTERISTIC, ACTIVITY_DATA_CHARACTERISTIC],
            },
            GattService {
                uuid: BAND_SECONDARY_SERVICE,
                characteristics: vec![AUTH_CHARACTERISTIC],
            },
            GattService {
                uuid: HEART_RATE_SERVICE,
                characteristics: vec![
                    HEART_RATE_CONTROL_CHARACTERISTIC,
                    HEART_RATE_MEASUREMENT_CHARACTERISTIC,
                ],
            },
        ];
        Ok(profile
            .into_iter()
            .filter(|s| Some(s.uuid) != missing)
            .collect())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.events.is_none() {
                return Err(TransportError::NotConnected);
            }
            state.writes.push((characteristic, value.to_vec()));
        }
        if self.complete(GattTarget::Characteristic(characteristic), characteristic, Some(value)) {
            self.respond(characteristic, value);
        }
        Ok(())
    }

    async fn set_notifications(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.events.is_none() {
                return Err(TransportError::NotConnected);
            }
            state.subscriptions.push((characteristic, enabled));
        }
        self.complete(GattTarget::cccd(characteristic), characteristic, None);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.events = None;
        state.disconnects += 1;
        Ok(())
    }
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new(ADDRESS, band_key())
}

pub fn session_with(band: SimulatedBand, config: SessionConfig) -> (Arc<SimulatedBand>, Session<Arc<SimulatedBand>>) {
    let band = Arc::new(band);
    let session = Session::new(Arc::clone(&band), identity(), config);
    (band, session)
}

/// A session that has already authenticated against `band`.
pub async fn connected(band: SimulatedBand) -> (Arc<SimulatedBand>, Session<Arc<SimulatedBand>>) {
    let (band, session) = session_with(band, SessionConfig::default());
    session.connect().await.unwrap();
    (band, session)
}
