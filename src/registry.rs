//! Correlates in-flight GATT operations with the event that completes them.
//!
//! The band's transport allows one outstanding operation per characteristic
//! or descriptor and delivers completions asynchronously with no request id.
//! The registry holds exactly one completion slot per [`GattTarget`];
//! starting a second operation on a busy target is an error, never a queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::error::{BandError, Result, TransportError};
use crate::lock;
use crate::transport::GattTarget;

type Completion = oneshot::Sender<Result<()>>;

#[derive(Debug)]
struct Entry {
    id: u64,
    tx: Completion,
}

/// A registered slot: the caller awaits `rx`.
#[derive(Debug)]
pub struct Ticket {
    pub key: GattTarget,
    pub id: u64,
    pub rx: oneshot::Receiver<Result<()>>,
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: HashMap<GattTarget, Entry>,
    next_id: u64,
    /// Set by [`fail_all`](Self::fail_all); new operations fail with it.
    closed: Option<BandError>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation on `key`.
    pub fn begin(&mut self, key: GattTarget) -> Result<Ticket> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        if self.entries.contains_key(&key) {
            return Err(BandError::OperationInProgress(key));
        }
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(key, Entry { id, tx });
        Ok(Ticket { key, id, rx })
    }

    /// Resolve and remove the entry for `key`.
    ///
    /// Returns `false` when nothing was pending (unsolicited completion).
    pub fn complete(&mut self, key: GattTarget, result: Result<()>) -> bool {
        match self.entries.remove(&key) {
            Some(entry) => {
                if entry.tx.send(result).is_err() {
                    debug!("completion for {key} arrived after its caller gave up");
                }
                true
            }
            None => {
                warn!("unsolicited completion for {key}, dropped");
                false
            }
        }
    }

    /// Resolve every outstanding entry with `err` and refuse new ones.
    ///
    /// Only the first call has an effect; returns the number of entries failed.
    pub fn fail_all(&mut self, err: BandError) -> usize {
        if self.closed.is_some() {
            return 0;
        }
        let failed = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(err.clone()));
        }
        self.closed = Some(err);
        failed
    }

    /// Remove the entry for `key` if it still belongs to ticket `id`.
    pub fn abandon(&mut self, key: GattTarget, id: u64) -> bool {
        match self.entries.get(&key) {
            Some(entry) if entry.id == id => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Accept operations again after a fresh connection.
    pub fn reopen(&mut self) {
        self.entries.clear();
        self.closed = None;
    }

    pub fn is_pending(&self, key: &GattTarget) -> bool {
        self.entries.contains_key(key)
    }

    pub fn pending(&self) -> Vec<GattTarget> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Awaitable handle to a registered operation.
///
/// Dropping it before completion unregisters the slot, so a cancelled caller
/// never leaves its target busy.
#[derive(Debug)]
pub struct PendingOperation {
    registry: Arc<Mutex<PendingRegistry>>,
    key: GattTarget,
    id: u64,
    rx: oneshot::Receiver<Result<()>>,
}

impl PendingOperation {
    pub fn begin(registry: &Arc<Mutex<PendingRegistry>>, key: GattTarget) -> Result<Self> {
        let ticket = lock(registry).begin(key)?;
        Ok(Self {
            registry: Arc::clone(registry),
            key: ticket.key,
            id: ticket.id,
            rx: ticket.rx,
        })
    }

    pub fn key(&self) -> GattTarget {
        self.key
    }

    /// Wait for the completion event.
    pub async fn wait(mut self) -> Result<()> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionLost.into()),
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        lock(&self.registry).abandon(self.key, self.id);
    }
}
