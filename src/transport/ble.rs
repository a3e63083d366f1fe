//! [`Transport`] implementation on top of `btleplug`.
//!
//! btleplug's write and subscribe calls are awaited to completion, so each one
//! runs on its own task and reports back through the event channel as a
//! `WriteCompleted`, the same shape a callback-driven stack produces.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CharPropFlags, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    GattService, GattTarget, Transport, TransportEvent, EVENT_CHANNEL_CAPACITY, GATT_ERROR,
    GATT_SUCCESS,
};
use crate::error::TransportError;
use crate::lock;

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// Timeouts for the btleplug adapter.
#[derive(Debug, Clone)]
pub struct BtleplugConfig {
    /// How long to scan for the band before giving up. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Hard limit on the link-layer connect. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Hard limit on GATT service discovery. Default: `15`.
    pub discovery_timeout_secs: u64,
}

impl Default for BtleplugConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            connect_timeout_secs: 10,
            discovery_timeout_secs: 15,
        }
    }
}

/// Background pieces of one live connection.
struct Link {
    events: mpsc::Sender<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

/// A band located by [`BtleplugTransport::find`].
pub struct BtleplugTransport {
    peripheral: Peripheral,
    adapter: Adapter,
    name: String,
    config: BtleplugConfig,
    link: Mutex<Option<Link>>,
}

impl BtleplugTransport {
    /// Scan until a peripheral whose address (or, on macOS, platform id)
    /// matches `address` shows up.
    pub async fn find(address: &str, config: BtleplugConfig) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Backend("no Bluetooth adapter found".into()))?;

        // ── macOS: wait for the CoreBluetooth manager to reach poweredOn ─────
        // Scanning before CBCentralManager is ready is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                            break;
                        }
                        debug!("macOS: adapter state = {state:?}, waiting…");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        info!(
            "scanning for {address} (timeout: {} s) …",
            config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let found = find_first(&adapter, address, config.scan_timeout_secs).await;
        adapter.stop_scan().await.ok();
        let (peripheral, name) = found?;
        info!("found {name}");

        Ok(Self {
            peripheral,
            adapter,
            name,
            config,
            link: Mutex::new(None),
        })
    }

    /// Advertised name, or the address when the band does not advertise one.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> Result<mpsc::Sender<TransportEvent>, TransportError> {
        lock(&self.link)
            .as_ref()
            .map(|link| link.events.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::Backend(format!("characteristic {uuid} not discovered")))
    }

    /// Run `op` on its own task and report its outcome as a completion for
    /// `target`.
    fn complete_in_background<F>(&self, target: GattTarget, op: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = btleplug::Result<()>> + Send + 'static,
    {
        let events = self.events()?;
        tokio::spawn(async move {
            let status = match op.await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!("{target}: {e}");
                    GATT_ERROR
                }
            };
            let _ = events
                .send(TransportEvent::WriteCompleted { target, status })
                .await;
        });
        Ok(())
    }
}

/// Poll until a matching peripheral appears or the timeout expires.
async fn find_first(
    adapter: &Adapter,
    address: &str,
    timeout_secs: u64,
) -> Result<(Peripheral, String), TransportError> {
    use tokio::time::{sleep, timeout};

    let result = timeout(Duration::from_secs(timeout_secs), async {
        loop {
            let peripherals = adapter.peripherals().await.unwrap_or_default();
            for p in peripherals {
                let id = format!("{:?}", p.id());
                if let Ok(Some(props)) = p.properties().await {
                    let mac = props.address.to_string();
                    if mac.eq_ignore_ascii_case(address)
                        || id.to_lowercase().contains(&address.to_lowercase())
                    {
                        let name = props.local_name.unwrap_or(mac);
                        return (p, name);
                    }
                }
            }
            sleep(Duration::from_millis(250)).await;
        }
    })
    .await;

    result.map_err(|_| {
        TransportError::Timeout(format!("device {address} after {timeout_secs} s of scanning"))
    })
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let secs = self.config.connect_timeout_secs;
        // BlueZ's Device1.Connect can block forever when the band is out of
        // range.
        tokio::time::timeout(Duration::from_secs(secs), self.peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout(format!("BLE connect after {secs} s")))??;

        // BlueZ reports the connection before its GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(2);

        // ── Disconnect watcher ──────────────────────────────────────────────
        // Usually fires before the notification stream closes.
        let disconnect_tx = tx.clone();
        let peripheral_id = self.peripheral.id();
        let adapter = self.adapter.clone();
        tasks.push(tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("disconnect watcher: device {id:?} disconnected");
                                let _ = disconnect_tx.send(TransportEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("disconnect watcher: could not subscribe to adapter events: {e}");
                }
            }
        }));

        // ── Notification pump ───────────────────────────────────────────────
        let notify_tx = tx.clone();
        let peripheral = self.peripheral.clone();
        tasks.push(tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("could not get notification stream: {e}");
                    let _ = notify_tx.send(TransportEvent::Disconnected).await;
                    return;
                }
            };
            while let Some(n) = notifications.next().await {
                let event = TransportEvent::Notification {
                    characteristic: n.uuid,
                    value: n.value,
                };
                if notify_tx.send(event).await.is_err() {
                    return;
                }
            }
            debug!("notification stream ended");
            let _ = notify_tx.send(TransportEvent::Disconnected).await;
        }));

        let _ = tx.send(TransportEvent::Connected).await;
        if let Some(old) = lock(&self.link).replace(Link { events: tx, tasks }) {
            old.tasks.iter().for_each(JoinHandle::abort);
        }
        info!("connected: {}", self.name);
        Ok(rx)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        let secs = self.config.discovery_timeout_secs;
        tokio::time::timeout(Duration::from_secs(secs), self.peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout(format!("service discovery after {secs} s")))??;

        let services: BTreeSet<_> = self.peripheral.services();
        debug!("{}: {} service(s) discovered", self.name, services.len());
        Ok(services
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.into_iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let peripheral = self.peripheral.clone();
        let value = value.to_vec();
        self.complete_in_background(GattTarget::Characteristic(characteristic), async move {
            peripheral.write(&target, &value, write_type).await
        })
    }

    async fn set_notifications(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        self.complete_in_background(GattTarget::cccd(characteristic), async move {
            if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            }
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.tasks.iter().for_each(JoinHandle::abort);
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
            info!("disconnected: {}", self.name);
        }
        Ok(())
    }
}
