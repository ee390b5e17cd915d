//! Scripted bridge for tests.
//!
//! [`ScriptedBridge`] stands in for a platform bridge. Tests keep the
//! paired [`ScriptHandle`] and push arrivals and removals through it from
//! any thread; the bridge applies them on the monitor's worker thread, the
//! same way a socket or message-queue bridge would.
//!
//! [`ScriptHandle::callback_sink`] instead hands out a clone of the worker's
//! [`EventSink`], so test threads can report straight into the table the
//! way OS callback threads do.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{EventSink, HotplugBridge, Wake, not_subscribed};
use crate::device::{DeviceDescriptor, DeviceIdentity, PlatformHandle};
use crate::error::{MonitorError, Result};
use crate::signal::ShutdownSignal;

enum Step {
    Arrive(DeviceDescriptor),
    Depart(DeviceIdentity),
    DepartHandle(PlatformHandle),
    Spurious,
    Wake,
}

/// Test driver for a [`ScriptedBridge`].
#[derive(Clone)]
pub struct ScriptHandle {
    tx: Sender<Step>,
    attached: Arc<Mutex<Vec<DeviceDescriptor>>>,
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl ScriptHandle {
    pub fn arrive(&self, device: DeviceDescriptor) {
        let _ = self.tx.send(Step::Arrive(device));
    }

    pub fn depart(&self, identity: DeviceIdentity) {
        let _ = self.tx.send(Step::Depart(identity));
    }

    pub fn depart_handle(&self, handle: PlatformHandle) {
        let _ = self.tx.send(Step::DepartHandle(handle));
    }

    /// A readiness notification with nothing behind it.
    pub fn spurious(&self) {
        let _ = self.tx.send(Step::Spurious);
    }

    /// Replace what the next `enumerate_now` returns.
    pub fn set_attached(&self, devices: Vec<DeviceDescriptor>) {
        *self.attached.lock().unwrap_or_else(PoisonError::into_inner) = devices;
    }

    /// The worker's sink, once the bridge has started waiting.
    ///
    /// Returns `None` if the worker has not reached its first wait within
    /// `timeout` (or never subscribed).
    pub fn callback_sink(&self, timeout: Duration) -> Option<EventSink> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(sink) = self
                .sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                return Some(sink.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

/// In-memory [`HotplugBridge`].
pub struct ScriptedBridge {
    rx: Receiver<Step>,
    wake_tx: Sender<Step>,
    attached: Arc<Mutex<Vec<DeviceDescriptor>>>,
    sink: Arc<Mutex<Option<EventSink>>>,
    shutdown: Option<ShutdownSignal>,
    /// If true, `subscribe` fails like an OS refusing registration.
    pub fail_subscribe: bool,
    /// If true, `enumerate_now` fails.
    pub fail_enumeration: bool,
    /// Steps applied so far (including spurious ones).
    pub processed: Arc<Mutex<usize>>,
    /// Set once `unsubscribe` ran.
    pub unsubscribed: Arc<Mutex<bool>>,
}

impl ScriptedBridge {
    pub fn new() -> (Self, ScriptHandle) {
        let (tx, rx) = mpsc::channel();
        let attached = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(Mutex::new(None));
        let bridge = ScriptedBridge {
            rx,
            wake_tx: tx.clone(),
            attached: attached.clone(),
            sink: sink.clone(),
            shutdown: None,
            fail_subscribe: false,
            fail_enumeration: false,
            processed: Arc::new(Mutex::new(0)),
            unsubscribed: Arc::new(Mutex::new(false)),
        };
        (bridge, ScriptHandle { tx, attached, sink })
    }

    /// Devices reported by the initial enumeration.
    pub fn with_attached(self, devices: Vec<DeviceDescriptor>) -> Self {
        *self.attached.lock().unwrap_or_else(PoisonError::into_inner) = devices;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    pub fn failing_enumeration(mut self) -> Self {
        self.fail_enumeration = true;
        self
    }

    fn apply(&self, step: Step, sink: &EventSink) -> Wake {
        *self.processed.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        match step {
            Step::Arrive(device) => {
                sink.arrived(device);
            }
            Step::Depart(identity) => {
                sink.departed(&identity);
            }
            Step::DepartHandle(handle) => {
                sink.departed_handle(&handle);
            }
            Step::Spurious => {}
            Step::Wake => return Wake::Shutdown,
        }
        Wake::Events
    }
}

impl HotplugBridge for ScriptedBridge {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn enumerate_now(&mut self) -> Result<Vec<DeviceDescriptor>> {
        if self.fail_enumeration {
            return Err(MonitorError::Enumeration("scripted failure".into()));
        }
        Ok(self
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn subscribe(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        if self.fail_subscribe {
            return Err(MonitorError::Subscription("scripted refusal".into()));
        }
        let wake_tx = self.wake_tx.clone();
        shutdown.set_waker(move || {
            let _ = wake_tx.send(Step::Wake);
        });
        self.shutdown = Some(shutdown.clone());
        Ok(())
    }

    fn wait(&mut self, sink: &EventSink, timeout: Duration) -> Result<Wake> {
        if self.shutdown.is_none() {
            return Err(not_subscribed(self.name()));
        }
        {
            let mut slot = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(sink.clone());
            }
        }
        match self.rx.recv_timeout(timeout) {
            Ok(step) => Ok(self.apply(step, sink)),
            Err(RecvTimeoutError::Timeout) => Ok(Wake::Timeout),
            // Unreachable while `wake_tx` is alive.
            Err(RecvTimeoutError::Disconnected) => Ok(Wake::Shutdown),
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.clear_waker();
        }
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self
            .unsubscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }
}
