//! Notification fan-out — delivers table changes on a dedicated thread.
//!
//! Producers (the bridge worker, OS callback threads) push stamped changes
//! into a bounded channel. Changes are re-ordered by sequence number before
//! delivery: two producers may enqueue in a different order than the table
//! lock stamped them.
//!
//! Registrations never travel on the data channel. They are parked in a
//! shared list that the dispatch thread takes between deliveries, so a
//! subscriber may register or unsubscribe from inside a callback even when
//! the channel is full. Flush waits on a delivered-sequence counter.
//!
//! For each change, payload subscribers run first, then payload-free ones.
//! A panicking subscriber is caught, logged, and counted; the rest still run.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::device::DeviceDescriptor;
use crate::table::{DeviceEvent, TableChange};

/// Token returned by the `on_*` registration methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Arrived,
    Departed,
}

pub(crate) type PayloadHandler = Box<dyn FnMut(&DeviceDescriptor) + Send>;
pub(crate) type SignalHandler = Box<dyn FnMut() + Send>;

pub(crate) enum Handler {
    Payload(EventKind, PayloadHandler),
    Signal(EventKind, SignalHandler),
}

enum Message {
    Change(TableChange),
    Shutdown,
}

enum Registration {
    Add(SubscriptionId, Handler),
    Remove(SubscriptionId),
}

#[derive(Default)]
struct Progress {
    /// Every change with `seq < delivered` has been handed to subscribers.
    delivered: u64,
    stopped: bool,
}

/// State shared between the dispatch thread and its owner.
#[derive(Default)]
struct Shared {
    registrations: Mutex<Vec<Registration>>,
    progress: Mutex<Progress>,
    progressed: Condvar,
    failures: AtomicU64,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap handle producers use to enqueue changes.
#[derive(Clone)]
pub(crate) struct Publisher {
    tx: SyncSender<Message>,
}

impl Publisher {
    /// Enqueue a change. Blocks while the channel is full.
    pub(crate) fn publish(&self, change: TableChange) {
        let seq = change.seq;
        if self.tx.send(Message::Change(change)).is_err() {
            log::debug!("dispatcher gone, dropping change #{seq}");
        }
    }
}

/// Owner of the dispatch thread.
pub(crate) struct Dispatcher {
    tx: SyncSender<Message>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the dispatch thread with a channel of `capacity` changes.
    pub(crate) fn spawn(capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("hidmon-dispatch".into())
            .spawn(move || run(rx, &worker_shared))?;
        Ok(Dispatcher {
            tx,
            next_id: AtomicU64::new(1),
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn publisher(&self) -> Publisher {
        Publisher {
            tx: self.tx.clone(),
        }
    }

    /// Register `handler`. It sees every change delivered after this call.
    pub(crate) fn subscribe(&self, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        relock(&self.shared.registrations).push(Registration::Add(id, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        relock(&self.shared.registrations).push(Registration::Remove(id));
    }

    /// Block until every change stamped before `upto` has been delivered.
    ///
    /// Returns `false` on timeout or if the dispatcher has stopped.
    pub(crate) fn flush(&self, upto: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut progress = relock(&self.shared.progress);
        if progress.stopped {
            return false;
        }
        loop {
            if progress.delivered >= upto {
                return true;
            }
            if progress.stopped {
                return false;
            }
            progress = match deadline {
                None => self
                    .shared
                    .progressed
                    .wait(progress)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return false;
                    }
                    self.shared
                        .progressed
                        .wait_timeout(progress, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Subscriber panics caught so far.
    pub(crate) fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Deliver what is queued, then stop the thread.
    pub(crate) fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.tx.send(Message::Shutdown);
        if worker.join().is_err() {
            log::error!("dispatch thread panicked");
        }
        // Covers a panicked thread that never marked itself stopped.
        relock(&self.shared.progress).stopped = true;
        self.shared.progressed.notify_all();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<Message>, shared: &Shared) {
    let mut handlers: Vec<(SubscriptionId, Handler)> = Vec::new();
    let mut pending: BTreeMap<u64, DeviceEvent> = BTreeMap::new();
    let mut next_seq = 0u64;

    while let Ok(Message::Change(change)) = rx.recv() {
        pending.insert(change.seq, change.event);
        let before = next_seq;
        while let Some(event) = pending.remove(&next_seq) {
            apply_registrations(shared, &mut handlers);
            deliver(&mut handlers, &event, &shared.failures);
            next_seq += 1;
        }
        if next_seq != before {
            relock(&shared.progress).delivered = next_seq;
            shared.progressed.notify_all();
        }
    }

    if !pending.is_empty() {
        log::warn!(
            "dispatcher stopping with {} undelivered change(s)",
            pending.len()
        );
    }
    relock(&shared.progress).stopped = true;
    shared.progressed.notify_all();
}

fn apply_registrations(shared: &Shared, handlers: &mut Vec<(SubscriptionId, Handler)>) {
    let queued = std::mem::take(&mut *relock(&shared.registrations));
    for registration in queued {
        match registration {
            Registration::Add(id, handler) => handlers.push((id, handler)),
            Registration::Remove(id) => handlers.retain(|(h, _)| *h != id),
        }
    }
}

fn deliver(handlers: &mut [(SubscriptionId, Handler)], event: &DeviceEvent, failures: &AtomicU64) {
    let (kind, device) = match event {
        DeviceEvent::Arrived(d) => (EventKind::Arrived, d),
        DeviceEvent::Departed(d) => (EventKind::Departed, d),
    };
    for (id, handler) in handlers.iter_mut() {
        if let Handler::Payload(k, f) = handler
            && *k == kind
        {
            guarded(*id, failures, || f(device));
        }
    }
    for (id, handler) in handlers.iter_mut() {
        if let Handler::Signal(k, f) = handler
            && *k == kind
        {
            guarded(*id, failures, || f());
        }
    }
}

fn guarded(id: SubscriptionId, failures: &AtomicU64, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        failures.fetch_add(1, Ordering::Relaxed);
        log::error!("subscriber {} panicked: {}", id.0, panic_message(&*panic));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
