//! Ordered multicast event streams
//!
//! # Architecture
//!
//! ```text
//!                          ┌──> Unbounded Channel ──> Subscription (caller polls)
//! Read Loop ──publish──> EventStream
//!                          └──> Unbounded Channel ──> Observer thread ──> callback
//! ```
//!
//! Every subscriber owns its own unbounded crossbeam channel, so a slow
//! subscriber never holds up the read loop or its siblings. Publishing
//! takes a shared lock on the observer list; subscribing and dropping a
//! subscription take the exclusive lock only long enough to push or
//! remove one entry. There is no history: a subscriber sees exactly the
//! events published after `subscribe` returned.

use crossbeam_channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

struct StreamInner<T> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Sender<T>)>>,
}

impl<T> StreamInner<T> {
    fn remove(&self, id: u64) {
        self.subscribers.write().retain(|(sid, _)| *sid != id);
    }
}

/// A named, ordered, multi-subscriber event source
pub struct EventStream<T> {
    inner: Arc<StreamInner<T>>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.subscribers.read().len())
            .finish()
    }
}

impl<T> EventStream<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                name,
                next_id: AtomicU64::new(0),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    fn register(&self) -> (u64, Receiver<T>) {
        let (tx, rx) = unbounded();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, tx));
        (id, rx)
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription<T> {
        let (id, rx) = self.register();
        Subscription {
            id,
            rx,
            stream: Arc::downgrade(&self.inner),
        }
    }

    /// Run `callback` for every event on a dedicated thread
    ///
    /// The thread exits when the observer is cancelled or the stream is
    /// dropped. Calling [`Observer::cancel`] from inside the callback
    /// would join the thread from itself; drop the observer instead.
    pub fn observe<F>(&self, mut callback: F) -> Observer<T>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (id, rx) = self.register();
        let name = self.inner.name;

        let handle = std::thread::spawn(move || {
            for event in rx.iter() {
                callback(event);
            }
            debug!("Observer thread for '{}' stream exiting", name);
        });

        Observer {
            id,
            stream: Arc::downgrade(&self.inner),
            handle: Some(handle),
        }
    }

    /// Number of live subscriptions and observers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Deliver `event` to every current subscriber, in registration order
    ///
    /// Subscribers whose receiving end is gone are pruned. Returns the
    /// number of subscribers that received the event.
    pub(crate) fn publish(&self, event: T) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (id, tx) in subscribers.iter() {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            self.inner
                .subscribers
                .write()
                .retain(|(id, _)| !dead.contains(id));
        }
        delivered
    }
}

/// A caller's registration on an [`EventStream`]
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    id: u64,
    rx: Receiver<T>,
    stream: Weak<StreamInner<T>>,
}

impl<T> Subscription<T> {
    /// Block until the next event; errors once the stream is gone and drained
    pub fn recv(&self) -> Result<T, RecvError> {
        self.rx.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Next event if one is already queued
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain every queued event without blocking
    pub fn try_iter(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.try_iter()
    }

    /// Number of events waiting to be received
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.remove(self.id);
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.rx.len())
            .finish()
    }
}

/// Handle for a callback registered with [`EventStream::observe`]
pub struct Observer<T> {
    id: u64,
    stream: Weak<StreamInner<T>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl<T> Observer<T> {
    /// Stop delivering events and wait for queued ones to be handled
    pub fn cancel(mut self) {
        self.detach();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn detach(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.remove(self.id);
        }
    }
}

impl<T> Drop for Observer<T> {
    fn drop(&mut self) {
        // Without a join: the thread finishes the queue on its own
        self.detach();
    }
}
