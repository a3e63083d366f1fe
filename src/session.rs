//! Connection lifecycle and the per-connection event dispatcher.
//!
//! A [`Session`] owns one [`Transport`].  On [`Session::connect`] it spawns a
//! dispatcher task that turns the transport's event stream into registry
//! completions and queued notifications; every protocol step then awaits
//! either a [`PendingOperation`] or [`queue::next_notification`].
//!
//! ```text
//! Disconnected → Connecting → DiscoveringServices → Authenticating → Ready
//!                                                          Ready ⇄ Fetching
//!                                                          Ready ⇄ Streaming
//! any state ── link lost / disconnect() ──► Disconnected
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth;
use crate::error::{BandError, Result, TransportError};
use crate::lock;
use crate::protocol::{
    ACTIVITY_DATA_CHARACTERISTIC, AUTH_CHARACTERISTIC, BAND_PRIMARY_SERVICE,
    BAND_SECONDARY_SERVICE, FETCH_CHARACTERISTIC, HEART_RATE_CONTROL_CHARACTERISTIC,
    HEART_RATE_MEASUREMENT_CHARACTERISTIC, HEART_RATE_SERVICE,
};
use crate::queue::{self, NotificationQueues};
use crate::registry::{PendingOperation, PendingRegistry};
use crate::transport::{GattService, GattTarget, Transport, TransportEvent, GATT_SUCCESS};
use crate::types::{DeviceIdentity, SessionConfig, SessionState};

// ── BandServices ──────────────────────────────────────────────────────────────

/// Characteristics resolved from the band's three services at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandServices {
    pub auth: Uuid,
    pub fetch: Uuid,
    pub activity_data: Uuid,
    pub heart_rate_control: Uuid,
    pub heart_rate_measurement: Uuid,
}

impl BandServices {
    /// Check that every required service and characteristic is present.
    pub fn resolve(services: &[GattService]) -> Result<Self> {
        let find = |uuid: Uuid, name: &str| {
            services
                .iter()
                .find(|s| s.uuid == uuid)
                .ok_or_else(|| BandError::ServiceNotFound(format!("{name} service {uuid}")))
        };
        let require = |service: &GattService, name: &str, uuid: Uuid| {
            if service.characteristics.contains(&uuid) {
                Ok(uuid)
            } else {
                Err(BandError::ServiceNotFound(format!(
                    "characteristic {uuid} in {name} service"
                )))
            }
        };

        let primary = find(BAND_PRIMARY_SERVICE, "band-primary")?;
        let secondary = find(BAND_SECONDARY_SERVICE, "band-secondary")?;
        let heart = find(HEART_RATE_SERVICE, "heart-rate")?;

        Ok(Self {
            auth: require(secondary, "band-secondary", AUTH_CHARACTERISTIC)?,
            fetch: require(primary, "band-primary", FETCH_CHARACTERISTIC)?,
            activity_data: require(primary, "band-primary", ACTIVITY_DATA_CHARACTERISTIC)?,
            heart_rate_control: require(heart, "heart-rate", HEART_RATE_CONTROL_CHARACTERISTIC)?,
            heart_rate_measurement: require(
                heart,
                "heart-rate",
                HEART_RATE_MEASUREMENT_CHARACTERISTIC,
            )?,
        })
    }
}

// ── Shared ────────────────────────────────────────────────────────────────────

/// State shared between the session handle, its dispatcher and any running
/// stream task.
pub(crate) struct Shared<T> {
    pub(crate) transport: T,
    pub(crate) identity: DeviceIdentity,
    pub(crate) config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    registry: Arc<Mutex<PendingRegistry>>,
    queues: Arc<Mutex<NotificationQueues>>,
    services: Mutex<Option<BandServices>>,
    busy: Arc<tokio::sync::Mutex<()>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("session state {} → {state}", *current);
            *current = state;
        }
    }

    /// Write `value` to `characteristic` and wait for the stack to confirm it.
    pub(crate) async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let op = PendingOperation::begin(
            &self.registry,
            GattTarget::Characteristic(characteristic),
        )?;
        debug!("write {characteristic} {value:02x?}");
        self.transport.write(characteristic, value).await?;
        self.bounded(op.wait(), || format!("write to {characteristic}"))
            .await
    }

    /// Enable or disable notifications and wait for the CCCD write to land.
    pub(crate) async fn set_notifications(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
        let target = GattTarget::cccd(characteristic);
        let op = PendingOperation::begin(&self.registry, target)?;
        debug!(
            "{} notifications on {characteristic}",
            if enabled { "enable" } else { "disable" }
        );
        self.transport
            .set_notifications(characteristic, enabled)
            .await?;
        self.bounded(op.wait(), || format!("{target}")).await
    }

    /// Next notification on `characteristic`, however long it takes.
    pub(crate) async fn next_notification(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        queue::next_notification(&self.queues, characteristic).await
    }

    /// Next notification on `characteristic`, bounded by the response timeout.
    pub(crate) async fn expect_notification(
        &self,
        characteristic: Uuid,
        what: &str,
    ) -> Result<Vec<u8>> {
        self.bounded(self.next_notification(characteristic), || what.to_string())
            .await
    }

    /// Take an already queued notification without waiting.
    pub(crate) fn try_notification(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        lock(&self.queues).try_pop(characteristic)
    }

    pub(crate) fn clear_queue(&self, characteristic: Uuid) {
        let stale = lock(&self.queues).clear(characteristic);
        if stale > 0 {
            debug!("discarded {stale} stale notification(s) on {characteristic}");
        }
    }

    async fn bounded<R>(
        &self,
        fut: impl Future<Output = Result<R>>,
        what: impl FnOnce() -> String,
    ) -> Result<R> {
        tokio::time::timeout(self.config.response_timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout(what()))?
    }

    fn abort_dispatcher(&self) {
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }
    }

    /// Abort the previous connection's dispatcher and wait until it has
    /// exited, so a stale link loss cannot reach the new connection.
    async fn stop_dispatcher(&self) {
        let task = lock(&self.dispatcher).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    fn mark_lost(&self) {
        mark_lost(&self.state, &self.registry, &self.queues);
    }
}

/// Fail everything outstanding with `ConnectionLost` and mark the session
/// disconnected.  Safe to call more than once per connection.
fn mark_lost(
    state: &Mutex<SessionState>,
    registry: &Mutex<PendingRegistry>,
    queues: &Mutex<NotificationQueues>,
) {
    *lock(state) = SessionState::Disconnected;
    let lost = BandError::from(TransportError::ConnectionLost);
    let failed = lock(registry).fail_all(lost.clone());
    lock(queues).fail_all(lost);
    if failed > 0 {
        debug!("failed {failed} pending operation(s) after link loss");
    }
}

/// Route transport events until the link goes away.
async fn dispatch(
    mut events: mpsc::Receiver<TransportEvent>,
    state: Arc<Mutex<SessionState>>,
    registry: Arc<Mutex<PendingRegistry>>,
    queues: Arc<Mutex<NotificationQueues>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                debug!("link established");
                lock(&registry).complete(GattTarget::Link, Ok(()));
            }
            TransportEvent::WriteCompleted { target, status } => {
                let result = if status == GATT_SUCCESS {
                    Ok(())
                } else {
                    Err(TransportError::Gatt { target, status }.into())
                };
                lock(&registry).complete(target, result);
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => {
                debug!("notification {characteristic} {value:02x?}");
                lock(&queues).push(characteristic, value);
            }
            TransportEvent::Disconnected => break,
        }
    }
    info!("link lost");
    mark_lost(&state, &registry, &queues);
}

// ── OperationGuard ────────────────────────────────────────────────────────────

/// Held for the duration of one protocol operation.
///
/// Owns the session's operation lock; on drop it returns the session to
/// `Ready` unless the link was lost in the meantime.
pub(crate) struct OperationGuard {
    _busy: OwnedMutexGuard<()>,
    state: Arc<Mutex<SessionState>>,
    active: Option<SessionState>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(active) = self.active {
            let mut state = lock(&self.state);
            if *state == active {
                *state = SessionState::Ready;
            }
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Snapshot of a session's bookkeeping, mostly useful in tests and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDiagnostics {
    pub state: SessionState,
    /// Targets with an outstanding write or descriptor write.
    pub pending: Vec<GattTarget>,
    /// Characteristics with a registered notification reader.
    pub waiters: Vec<Uuid>,
}

/// An authenticated connection to one band.
///
/// Operations are serialized: while one is running, any other returns
/// [`BandError::SessionBusy`].  Dropping a connected session tears the link
/// down.
pub struct Session<T: Transport> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, identity: DeviceIdentity, config: SessionConfig) -> Self {
        let queues = NotificationQueues::new(config.queue_capacity, config.overflow_policy);
        Self {
            shared: Arc::new(Shared {
                transport,
                identity,
                config,
                state: Arc::new(Mutex::new(SessionState::Disconnected)),
                registry: Arc::new(Mutex::new(PendingRegistry::new())),
                queues: Arc::new(Mutex::new(queues)),
                services: Mutex::new(None),
                busy: Arc::new(tokio::sync::Mutex::new(())),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.shared.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            state: self.state(),
            pending: lock(&self.shared.registry).pending(),
            waiters: lock(&self.shared.queues).waiters(),
        }
    }

    /// Connect, discover the band's services and authenticate.
    ///
    /// Any failure leaves the session `Disconnected` with the link released.
    pub async fn connect(&self) -> Result<()> {
        let actual = self.state();
        if actual != SessionState::Disconnected {
            return Err(BandError::InvalidState {
                expected: SessionState::Disconnected,
                actual,
            });
        }
        let _busy = Arc::clone(&self.shared.busy)
            .try_lock_owned()
            .map_err(|_| BandError::SessionBusy)?;

        info!("connecting to {}", self.shared.identity.address);
        self.shared.stop_dispatcher().await;
        self.shared.set_state(SessionState::Connecting);
        lock(&self.shared.registry).reopen();
        lock(&self.shared.queues).reopen();

        match self.establish().await {
            Ok(()) => {
                self.shared.set_state(SessionState::Ready);
                info!("{} authenticated and ready", self.shared.identity.address);
                Ok(())
            }
            Err(e) => {
                warn!("connect to {} failed: {e}", self.shared.identity.address);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let shared = &self.shared;
        let link = PendingOperation::begin(&shared.registry, GattTarget::Link)?;
        let events = shared.transport.connect().await?;

        let task = tokio::spawn(dispatch(
            events,
            Arc::clone(&shared.state),
            Arc::clone(&shared.registry),
            Arc::clone(&shared.queues),
        ));
        *lock(&shared.dispatcher) = Some(task);

        shared
            .bounded(link.wait(), || "connection".to_string())
            .await?;

        shared.set_state(SessionState::DiscoveringServices);
        let discovered = shared.transport.discover_services().await?;
        let services = BandServices::resolve(&discovered)?;
        *lock(&shared.services) = Some(services);

        shared.set_state(SessionState::Authenticating);
        auth::authenticate(shared, services.auth).await
    }

    /// Release the link and fail everything outstanding.  Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        info!("disconnecting from {}", self.shared.identity.address);
        self.shared.stop_dispatcher().await;
        self.shared.mark_lost();
        self.shared.transport.disconnect().await?;
        Ok(())
    }

    async fn teardown(&self) {
        self.shared.stop_dispatcher().await;
        self.shared.mark_lost();
        if let Err(e) = self.shared.transport.disconnect().await {
            warn!("disconnect after failure: {e}");
        }
    }

    /// Claim the operation lock; the session must be `Ready`.
    ///
    /// `active` is the state the session shows while the operation runs.
    pub(crate) fn begin_operation(&self, active: Option<SessionState>) -> Result<OperationGuard> {
        let busy = Arc::clone(&self.shared.busy)
            .try_lock_owned()
            .map_err(|_| BandError::SessionBusy)?;
        let mut state = lock(&self.shared.state);
        match *state {
            SessionState::Ready => {}
            SessionState::Disconnected => return Err(TransportError::NotConnected.into()),
            SessionState::Fetching | SessionState::Streaming => return Err(BandError::SessionBusy),
            actual => {
                return Err(BandError::InvalidState {
                    expected: SessionState::Ready,
                    actual,
                })
            }
        }
        if let Some(active) = active {
            *state = active;
        }
        Ok(OperationGuard {
            _busy: busy,
            state: Arc::clone(&self.shared.state),
            active,
        })
    }

    pub(crate) fn services(&self) -> Result<BandServices> {
        lock(&self.shared.services).ok_or_else(|| TransportError::NotConnected.into())
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.state() == SessionState::Disconnected {
            self.shared.abort_dispatcher();
            return;
        }
        debug!("session dropped while connected, tearing down");
        self.shared.abort_dispatcher();
        self.shared.mark_lost();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move {
                if let Err(e) = shared.transport.disconnect().await {
                    warn!("disconnect on drop: {e}");
                }
            });
        }
    }
}
