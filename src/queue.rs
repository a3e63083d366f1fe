//! Per-characteristic notification buffering.
//!
//! Notifications can arrive before the code that wants them is listening, so
//! every payload with no registered waiter is queued.  When a waiter is
//! registered the payload is handed over directly; at any instant a
//! characteristic has either queued payloads or a waiter, never both.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{BandError, Result, TransportError};
use crate::lock;
use crate::transport::GattTarget;
use crate::types::OverflowPolicy;

/// What [`NotificationQueues::push`] did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed straight to a waiting reader.
    Delivered,
    /// Appended to the queue.
    Queued,
    /// Queue was full; the oldest payload was evicted to make room.
    DroppedOldest,
    /// Queue was full; the new payload was discarded.
    Rejected,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct CharQueue {
    items: VecDeque<Vec<u8>>,
    waiter: Option<Waiter>,
    dropped: u64,
}

/// Result of [`NotificationQueues::pop_or_wait`].
#[derive(Debug)]
pub enum Pop {
    Ready(Vec<u8>),
    Wait { id: u64, rx: oneshot::Receiver<Result<Vec<u8>>> },
}

#[derive(Debug)]
pub struct NotificationQueues {
    queues: HashMap<Uuid, CharQueue>,
    capacity: usize,
    policy: OverflowPolicy,
    next_id: u64,
    closed: Option<BandError>,
}

impl NotificationQueues {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queues: HashMap::new(),
            capacity: capacity.max(1),
            policy,
            next_id: 0,
            closed: None,
        }
    }

    /// Deliver a notification payload for `characteristic`.
    pub fn push(&mut self, characteristic: Uuid, value: Vec<u8>) -> PushOutcome {
        let queue = self.queues.entry(characteristic).or_default();

        let value = match queue.waiter.take() {
            Some(waiter) => match waiter.tx.send(Ok(value)) {
                Ok(()) => return PushOutcome::Delivered,
                // The reader was cancelled between registering and now.
                Err(returned) => match returned {
                    Ok(value) => value,
                    Err(_) => return PushOutcome::Delivered,
                },
            },
            None => value,
        };

        if queue.items.len() < self.capacity {
            queue.items.push_back(value);
            return PushOutcome::Queued;
        }

        queue.dropped += 1;
        match self.policy {
            OverflowPolicy::DropOldest => {
                queue.items.pop_front();
                queue.items.push_back(value);
                warn!(
                    "notification queue for {characteristic} full ({}), dropped oldest ({} dropped so far)",
                    self.capacity, queue.dropped
                );
                PushOutcome::DroppedOldest
            }
            OverflowPolicy::RejectNewest => {
                warn!(
                    "notification queue for {characteristic} full ({}), rejected payload ({} dropped so far)",
                    self.capacity, queue.dropped
                );
                PushOutcome::Rejected
            }
        }
    }

    /// Take the oldest queued payload, or register as the single waiter.
    pub fn pop_or_wait(&mut self, characteristic: Uuid) -> Result<Pop> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        let queue = self.queues.entry(characteristic).or_default();
        if let Some(value) = queue.items.pop_front() {
            return Ok(Pop::Ready(value));
        }
        if queue.waiter.is_some() {
            return Err(BandError::OperationInProgress(GattTarget::Characteristic(
                characteristic,
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        queue.waiter = Some(Waiter { id, tx });
        Ok(Pop::Wait { id, rx })
    }

    /// Take the oldest queued payload without waiting.
    pub fn try_pop(&mut self, characteristic: Uuid) -> Option<Vec<u8>> {
        self.queues
            .get_mut(&characteristic)
            .and_then(|q| q.items.pop_front())
    }

    /// Put a payload whose reader was cancelled back at the head of the queue.
    ///
    /// May leave the queue one over capacity until the next pop.
    pub fn requeue(&mut self, characteristic: Uuid, value: Vec<u8>) {
        if self.closed.is_some() {
            return;
        }
        debug!("requeued undelivered notification on {characteristic}");
        self.queues
            .entry(characteristic)
            .or_default()
            .items
            .push_front(value);
    }

    /// Unregister waiter `id` if it is still the registered one.
    pub fn cancel_waiter(&mut self, characteristic: Uuid, id: u64) -> bool {
        match self.queues.get_mut(&characteristic) {
            Some(queue) if queue.waiter.as_ref().is_some_and(|w| w.id == id) => {
                queue.waiter = None;
                true
            }
            _ => false,
        }
    }

    /// Discard stale payloads for `characteristic`; returns how many.
    pub fn clear(&mut self, characteristic: Uuid) -> usize {
        self.queues
            .get_mut(&characteristic)
            .map(|q| {
                let n = q.items.len();
                q.items.clear();
                n
            })
            .unwrap_or(0)
    }

    /// Resolve every waiter with `err`, drop all payloads and refuse new reads.
    pub fn fail_all(&mut self, err: BandError) {
        if self.closed.is_some() {
            return;
        }
        for (_, queue) in self.queues.drain() {
            if let Some(waiter) = queue.waiter {
                let _ = waiter.tx.send(Err(err.clone()));
            }
        }
        self.closed = Some(err);
    }

    /// Accept reads again after a fresh connection.
    pub fn reopen(&mut self) {
        self.queues.clear();
        self.closed = None;
    }

    pub fn len(&self, characteristic: Uuid) -> usize {
        self.queues
            .get(&characteristic)
            .map_or(0, |q| q.items.len())
    }

    pub fn has_waiter(&self, characteristic: Uuid) -> bool {
        self.queues
            .get(&characteristic)
            .is_some_and(|q| q.waiter.is_some())
    }

    pub fn waiters(&self) -> Vec<Uuid> {
        self.queues
            .iter()
            .filter(|(_, q)| q.waiter.is_some())
            .map(|(uuid, _)| *uuid)
            .collect()
    }

    /// Total payloads lost to overflow on `characteristic`.
    pub fn dropped(&self, characteristic: Uuid) -> u64 {
        self.queues.get(&characteristic).map_or(0, |q| q.dropped)
    }
}

/// Wait for the next notification on `characteristic`.
///
/// Cancel-safe: dropping the returned future unregisters the waiter, and a
/// payload handed over but not yet read goes back to the head of the queue.
pub async fn next_notification(
    queues: &Arc<Mutex<NotificationQueues>>,
    characteristic: Uuid,
) -> Result<Vec<u8>> {
    let (id, rx) = match lock(queues).pop_or_wait(characteristic)? {
        Pop::Ready(value) => return Ok(value),
        Pop::Wait { id, rx } => (id, rx),
    };
    let mut guard = WaiterGuard {
        queues,
        characteristic,
        id,
        rx,
        finished: false,
    };
    let received = (&mut guard.rx).await;
    guard.finished = true;
    match received {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectionLost.into()),
    }
}

struct WaiterGuard<'a> {
    queues: &'a Arc<Mutex<NotificationQueues>>,
    characteristic: Uuid,
    id: u64,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    finished: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Same lock as `push`, so nothing can be delivered in between.
        let mut queues = lock(self.queues);
        if !queues.cancel_waiter(self.characteristic, self.id) {
            if let Ok(Ok(value)) = self.rx.try_recv() {
                queues.requeue(self.characteristic, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;
    use crate::protocol::{ACTIVITY_DATA_CHARACTERISTIC, FETCH_CHARACTERISTIC};

    const FETCH: Uuid = FETCH_CHARACTERISTIC;
    const ACTIVITY: Uuid = ACTIVITY_DATA_CHARACTERISTIC;

    fn shared(capacity: usize, policy: OverflowPolicy) -> Arc<Mutex<NotificationQueues>> {
        Arc::new(Mutex::new(NotificationQueues::new(capacity, policy)))
    }

    #[tokio::test]
    async fn test_fifo_then_suspend_until_push() {
        let queues = shared(8, OverflowPolicy::DropOldest);
        for i in 1..=3u8 {
            assert_eq!(lock(&queues).push(FETCH, vec![i]), PushOutcome::Queued);
        }
        for i in 1..=3u8 {
            assert_eq!(next_notification(&queues, FETCH).await.unwrap(), vec![i]);
        }

        let reader = {
            let queues = Arc::clone(&queues);
            tokio::spawn(async move { next_notification(&queues, FETCH).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());
        assert!(lock(&queues).has_waiter(FETCH));

        assert_eq!(lock(&queues).push(FETCH, vec![4]), PushOutcome::Delivered);
        assert_eq!(reader.await.unwrap().unwrap(), vec![4]);
        assert!(!lock(&queues).has_waiter(FETCH));
    }

    #[test]
    fn test_second_waiter_is_rejected() {
        let mut queues = NotificationQueues::new(8, OverflowPolicy::DropOldest);
        let _first = queues.pop_or_wait(FETCH).unwrap();
        assert!(matches!(
            queues.pop_or_wait(FETCH),
            Err(BandError::OperationInProgress(GattTarget::Characteristic(c))) if c == FETCH
        ));
        // Another characteristic has its own waiter slot.
        assert!(queues.pop_or_wait(ACTIVITY).is_ok());
    }

    #[test]
    fn test_cancelled_wait_unregisters_and_keeps_payload() {
        let queues = shared(8, OverflowPolicy::DropOldest);
        {
            let fut = next_notification(&queues, FETCH);
            futures::pin_mut!(fut);
            assert!(fut.as_mut().now_or_never().is_none());
            assert!(lock(&queues).has_waiter(FETCH));
        }
        assert!(!lock(&queues).has_waiter(FETCH));
        assert_eq!(lock(&queues).push(FETCH, vec![9]), PushOutcome::Queued);
        assert_eq!(lock(&queues).try_pop(FETCH), Some(vec![9]));
    }

    #[test]
    fn test_payload_delivered_to_cancelled_reader_is_requeued() {
        let queues = shared(8, OverflowPolicy::DropOldest);
        {
            let fut = next_notification(&queues, ACTIVITY);
            futures::pin_mut!(fut);
            assert!(fut.as_mut().now_or_never().is_none());
            // Handed to the registered reader, which is dropped unpolled.
            assert_eq!(lock(&queues).push(ACTIVITY, vec![1]), PushOutcome::Delivered);
            lock(&queues).push(ACTIVITY, vec![3]);
        }
        assert!(!lock(&queues).has_waiter(ACTIVITY));
        assert_eq!(lock(&queues).try_pop(ACTIVITY), Some(vec![1]));
        assert_eq!(lock(&queues).try_pop(ACTIVITY), Some(vec![3]));
    }

    #[test]
    fn test_payload_for_dropped_receiver_is_queued() {
        let mut queues = NotificationQueues::new(8, OverflowPolicy::DropOldest);
        let pop = queues.pop_or_wait(FETCH).unwrap();
        drop(pop);
        assert_eq!(queues.push(FETCH, vec![1]), PushOutcome::Queued);
        assert_eq!(queues.len(FETCH), 1);
    }

    #[test]
    fn test_overflow_drop_oldest() {
        let mut queues = NotificationQueues::new(2, OverflowPolicy::DropOldest);
        queues.push(FETCH, vec![1]);
        queues.push(FETCH, vec![2]);
        assert_eq!(queues.push(FETCH, vec![3]), PushOutcome::DroppedOldest);
        assert_eq!(queues.dropped(FETCH), 1);
        assert_eq!(queues.try_pop(FETCH), Some(vec![2]));
        assert_eq!(queues.try_pop(FETCH), Some(vec![3]));
    }

    #[test]
    fn test_overflow_reject_newest() {
        let mut queues = NotificationQueues::new(1, OverflowPolicy::RejectNewest);
        queues.push(FETCH, vec![1]);
        assert_eq!(queues.push(FETCH, vec![2]), PushOutcome::Rejected);
        assert_eq!(queues.try_pop(FETCH), Some(vec![1]));
        assert_eq!(queues.try_pop(FETCH), None);
    }

    #[test]
    fn test_clear_discards_stale_payloads() {
        let mut queues = NotificationQueues::new(8, OverflowPolicy::DropOldest);
        queues.push(ACTIVITY, vec![1]);
        queues.push(ACTIVITY, vec![2]);
        assert_eq!(queues.clear(ACTIVITY), 2);
        assert_eq!(queues.len(ACTIVITY), 0);
        assert_eq!(queues.clear(FETCH), 0);
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiter_with_error() {
        let queues = shared(8, OverflowPolicy::DropOldest);
        let reader = {
            let queues = Arc::clone(&queues);
            tokio::spawn(async move { next_notification(&queues, ACTIVITY).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let lost = BandError::from(TransportError::ConnectionLost);
        lock(&queues).fail_all(lost.clone());
        assert_eq!(reader.await.unwrap(), Err(lost.clone()));
        assert!(lock(&queues).waiters().is_empty());
        assert_eq!(next_notification(&queues, ACTIVITY).await, Err(lost));

        lock(&queues).reopen();
        lock(&queues).push(ACTIVITY, vec![7]);
        assert_eq!(next_notification(&queues, ACTIVITY).await.unwrap(), vec![7]);
    }
}
