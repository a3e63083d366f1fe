//! Transport seam between the session engine and a platform BLE stack.
//!
//! A [`Transport`] is callback-shaped on purpose: `write` and
//! `set_notifications` only *start* an operation and the stack reports its
//! completion later as a [`TransportEvent::WriteCompleted`] on the event
//! channel returned by [`Transport::connect`].  The session correlates the two
//! through [`crate::registry::PendingRegistry`].

pub mod ble;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::CLIENT_CHARACTERISTIC_CONFIG;

/// GATT status reported for a successful write.
pub const GATT_SUCCESS: u8 = 0x00;

/// Generic failure status (Android's `GATT_ERROR`).
pub const GATT_ERROR: u8 = 0x85;

/// Capacity of the event channel between a transport and its session.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something a GATT operation can be pending on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattTarget {
    /// The link itself; completed by [`TransportEvent::Connected`].
    Link,
    Characteristic(Uuid),
    Descriptor { characteristic: Uuid, descriptor: Uuid },
}

impl GattTarget {
    /// The notification configuration descriptor of `characteristic`.
    pub fn cccd(characteristic: Uuid) -> Self {
        GattTarget::Descriptor {
            characteristic,
            descriptor: CLIENT_CHARACTERISTIC_CONFIG,
        }
    }
}

impl fmt::Display for GattTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattTarget::Link => f.write_str("link"),
            GattTarget::Characteristic(uuid) => write!(f, "characteristic {uuid}"),
            GattTarget::Descriptor {
                characteristic,
                descriptor,
            } => write!(f, "descriptor {descriptor} of {characteristic}"),
        }
    }
}

/// Events a transport emits, in the order the stack produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    WriteCompleted { target: GattTarget, status: u8 },
    Notification { characteristic: Uuid, value: Vec<u8> },
}

/// A discovered GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Platform BLE stack bound to a single peripheral.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link.
    ///
    /// Returns the event channel for this connection.  `Connected` is sent on
    /// it once the link is up; `Disconnected` (or the channel closing) marks
    /// the end of the connection.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Discover services on the connected peripheral.
    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError>;

    /// Start a write to `characteristic`.
    ///
    /// Completion is reported by `WriteCompleted` for
    /// [`GattTarget::Characteristic`].  An `Err` means the stack refused to
    /// start the write and no completion will follow.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError>;

    /// Start writing the CCCD of `characteristic`.
    ///
    /// Completion is reported by `WriteCompleted` for [`GattTarget::cccd`].
    async fn set_notifications(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Tear the link down.  Must be idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        (**self).connect().await
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        (**self).discover_services().await
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        (**self).write(characteristic, value).await
    }

    async fn set_notifications(
        &self,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        (**self).set_notifications(characteristic, enabled).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        (**self).disconnect().await
    }
}
