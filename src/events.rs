//! Observer fan-out.
//!
//! `EventHub<T>` delivers each published value to every subscriber without blocking the
//! publisher. Each subscriber owns a queue drained by its own worker thread, so a slow
//! consumer delays only itself. Values reach a given subscriber in publish order.
//!
//! A hub built with `EventHub::bounded` caps every subscriber queue; values published
//! while a queue is full are dropped for that subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Mutex;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum Queue<T> {
    Unbounded(Sender<T>),
    Bounded(SyncSender<T>),
}

enum Delivery {
    Queued,
    Full,
    Disconnected,
}

impl<T> Queue<T> {
    fn deliver(&self, value: T) -> Delivery {
        match self {
            Queue::Unbounded(tx) => match tx.send(value) {
                Ok(()) => Delivery::Queued,
                Err(_) => Delivery::Disconnected,
            },
            Queue::Bounded(tx) => match tx.try_send(value) {
                Ok(()) => Delivery::Queued,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Disconnected(_)) => Delivery::Disconnected,
            },
        }
    }
}

struct Subscriber<T> {
    id: SubscriptionId,
    queue: Queue<T>,
}

/// Multi-subscriber event with fire-and-forget delivery.
pub struct EventHub<T> {
    name: &'static str,
    capacity: Option<usize>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new(name: &'static str) -> Self {
        Self::build(name, None)
    }

    /// Hub whose subscriber queues hold at most `capacity` pending values.
    pub fn bounded(name: &'static str, capacity: usize) -> Self {
        Self::build(name, Some(capacity.max(1)))
    }

    fn build(name: &'static str, capacity: Option<usize>) -> Self {
        Self {
            name,
            capacity,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a handler. It runs on a dedicated worker thread, never on the publisher's.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(T) + Send + 'static,
    {
        let (queue, rx) = self.queue();
        let name = self.name;
        let spawned = std::thread::Builder::new()
            .name(format!("{}-subscriber", name))
            .spawn(move || {
                for value in rx {
                    handler(value);
                }
            });
        if let Err(err) = spawned {
            log::error!("EventHub[{}]: failed to spawn subscriber worker: {}", name, err);
        }
        self.attach(queue)
    }

    /// Register a channel subscriber. The caller drains the receiver on its own schedule.
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<T>) {
        let (queue, rx) = self.queue();
        (self.attach(queue), rx)
    }

    /// Remove a subscriber. Values already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Queue `value` for every subscriber and return immediately.
    ///
    /// Subscribers whose worker has gone away are dropped.
    pub fn publish(&self, value: T) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let name = self.name;
        let dropped = &self.dropped;
        subscribers.retain(|s| match s.queue.deliver(value.clone()) {
            Delivery::Queued => true,
            Delivery::Full => {
                dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("EventHub[{}]: subscriber {:?} is full, value dropped", name, s.id);
                true
            }
            Delivery::Disconnected => {
                log::warn!("EventHub[{}]: dropping disconnected subscriber {:?}", name, s.id);
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Values not delivered because a bounded subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn queue(&self) -> (Queue<T>, Receiver<T>) {
        match self.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::sync_channel(capacity);
                (Queue::Bounded(tx), rx)
            }
            None => {
                let (tx, rx) = mpsc::channel();
                (Queue::Unbounded(tx), rx)
            }
        }
    }

    fn attach(&self, queue: Queue<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, queue });
        id
    }
}
