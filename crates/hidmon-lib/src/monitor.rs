//! Device monitor — owns the table, the fan-out, and the bridge worker.
//!
//! A [`DeviceMonitor`] is constructed explicitly and handed to whoever needs
//! it; there is no process-wide instance. [`DeviceMonitor::start`] moves a
//! bridge onto a worker thread which enumerates, subscribes, and then waits
//! for notifications until [`DeviceMonitor::stop`]. After stop the table is
//! frozen but still answers queries.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::bridge::{self, EventSink, HotplugBridge, Wake};
use crate::device::{DeviceDescriptor, DeviceFilter, VendorFilter};
use crate::dispatch::{Dispatcher, EventKind, Handler, SubscriptionId};
use crate::error::{MonitorError, Result};
use crate::signal::ShutdownSignal;
use crate::table::DeviceTable;

/// Default bounded fan-out queue length.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Longest time the worker blocks in one wait call.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(500);

/// Runtime options for a [`DeviceMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Vendor IDs the platform bridge reports.
    pub vendors: VendorFilter,
    /// Capacity of the notification channel. Producers block when full.
    pub queue_capacity: usize,
    /// Full re-enumeration interval; `None` disables rescans.
    pub rescan_interval: Option<Duration>,
    /// Upper bound for one blocking wait on the platform primitive.
    pub wait_slice: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            vendors: VendorFilter::new(vec![crate::models::VID_OPENPILOT]),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rescan_interval: None,
            wait_slice: DEFAULT_WAIT_SLICE,
        }
    }
}

/// Live-update state of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BridgeStatus {
    /// Not started yet.
    Idle,
    /// Subscribed; the table follows hot-plug events.
    Live { bridge: &'static str },
    /// Subscription failed or broke; the table keeps its last enumeration.
    Degraded { bridge: &'static str, reason: String },
    /// Stopped; the table is frozen.
    Stopped,
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeStatus::Idle => write!(f, "idle"),
            BridgeStatus::Live { bridge } => write!(f, "live ({bridge})"),
            BridgeStatus::Degraded { bridge, reason } => {
                write!(f, "degraded ({bridge}): {reason}")
            }
            BridgeStatus::Stopped => write!(f, "stopped"),
        }
    }
}

type SharedStatus = Arc<Mutex<BridgeStatus>>;

fn set_status(status: &SharedStatus, value: BridgeStatus) {
    *status.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

/// Hot-plug device monitor.
pub struct DeviceMonitor {
    options: MonitorOptions,
    table: Arc<DeviceTable>,
    dispatcher: Dispatcher,
    shutdown: ShutdownSignal,
    status: SharedStatus,
    worker: Option<JoinHandle<()>>,
    stopped: bool,
}

impl DeviceMonitor {
    /// Create a monitor and its dispatch thread. No bridge runs until
    /// [`start`](Self::start).
    pub fn new(options: MonitorOptions) -> Result<Self> {
        let dispatcher = Dispatcher::spawn(options.queue_capacity)?;
        Ok(DeviceMonitor {
            options,
            table: Arc::new(DeviceTable::new()),
            dispatcher,
            shutdown: ShutdownSignal::new(),
            status: Arc::new(Mutex::new(BridgeStatus::Idle)),
            worker: None,
            stopped: false,
        })
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Start the bridge for the current platform.
    pub fn start_platform(&mut self) -> Result<()> {
        let bridge = bridge::platform_bridge(self.options.vendors.clone());
        self.start(bridge)
    }

    /// Move `bridge` onto the worker thread and start monitoring.
    ///
    /// Returns once the initial enumeration is in the table and the
    /// subscription attempt has finished, so [`status`](Self::status) is
    /// `Live` or `Degraded` on return. A subscription failure is not an
    /// error here: the monitor keeps serving the enumerated table.
    pub fn start<B: HotplugBridge + 'static>(&mut self, bridge: B) -> Result<()> {
        if self.stopped {
            return Err(MonitorError::Stopped);
        }
        if self.worker.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let worker = Worker {
            sink: EventSink::new(self.table.clone(), self.dispatcher.publisher()),
            shutdown: self.shutdown.clone(),
            status: self.status.clone(),
            rescan_interval: self.options.rescan_interval,
            wait_slice: self.options.wait_slice,
        };
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("hidmon-bridge".into())
            .spawn(move || worker.run(bridge, ready_tx))?;
        self.worker = Some(handle);

        if ready_rx.recv().is_err() {
            // The worker dropped `ready_tx` without sending: it panicked.
            if let Some(handle) = self.worker.take() {
                let _ = handle.join();
            }
            return Err(MonitorError::Platform(
                "bridge thread exited during startup".into(),
            ));
        }
        Ok(())
    }

    /// Snapshot of every device currently in the table.
    pub fn all_devices(&self) -> Vec<DeviceDescriptor> {
        self.table.snapshot()
    }

    /// Snapshot filtered by `filter`. An empty result is not an error.
    pub fn devices_matching(&self, filter: &DeviceFilter) -> Vec<DeviceDescriptor> {
        filter.apply(self.table.snapshot())
    }

    pub fn status(&self) -> BridgeStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    // ── Subscriptions ──
    //
    // Registration never blocks on the fan-out queue, so subscribers may
    // register or unsubscribe from inside a callback.

    /// Call `f` with the descriptor of every arrival (new or refreshed).
    pub fn on_arrived(
        &self,
        f: impl FnMut(&DeviceDescriptor) + Send + 'static,
    ) -> SubscriptionId {
        self.dispatcher
            .subscribe(Handler::Payload(EventKind::Arrived, Box::new(f)))
    }

    /// Call `f` with the last known descriptor of every departure.
    pub fn on_departed(
        &self,
        f: impl FnMut(&DeviceDescriptor) + Send + 'static,
    ) -> SubscriptionId {
        self.dispatcher
            .subscribe(Handler::Payload(EventKind::Departed, Box::new(f)))
    }

    /// Call `f` after every arrival, without the descriptor.
    pub fn on_arrived_signal(&self, f: impl FnMut() + Send + 'static) -> SubscriptionId {
        self.dispatcher
            .subscribe(Handler::Signal(EventKind::Arrived, Box::new(f)))
    }

    /// Call `f` after every departure, without the descriptor.
    pub fn on_departed_signal(&self, f: impl FnMut() + Send + 'static) -> SubscriptionId {
        self.dispatcher
            .subscribe(Handler::Signal(EventKind::Departed, Box::new(f)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.dispatcher.unsubscribe(id);
    }

    /// Block until every change made so far has been delivered.
    ///
    /// Must not be called from inside a subscriber. Returns `false` if the
    /// dispatcher has already shut down.
    pub fn flush(&self) -> bool {
        self.dispatcher.flush(self.table.next_seq(), None)
    }

    /// [`flush`](Self::flush) with a deadline. Returns `false` if the
    /// deadline passes first, even when the fan-out queue is full.
    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        self.dispatcher.flush(self.table.next_seq(), Some(timeout))
    }

    /// Subscriber panics caught at the dispatch boundary.
    pub fn subscriber_failures(&self) -> u64 {
        self.dispatcher.failures()
    }

    /// Stop the bridge, freeze the table, and drain the fan-out.
    ///
    /// When this returns no subscriber will be called again. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.raise();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("bridge thread panicked");
        }
        self.table.freeze();
        self.dispatcher.shutdown();
        set_status(&self.status, BridgeStatus::Stopped);
        log::info!("monitor stopped with {} device(s) in table", self.table.len());
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the bridge thread.
struct Worker {
    sink: EventSink,
    shutdown: ShutdownSignal,
    status: SharedStatus,
    rescan_interval: Option<Duration>,
    wait_slice: Duration,
}

impl Worker {
    fn run<B: HotplugBridge>(self, mut bridge: B, ready: mpsc::Sender<()>) {
        let name = bridge.name();
        self.rescan(&mut bridge, "initial");

        let mut live = match bridge.subscribe(&self.shutdown) {
            Ok(()) => {
                log::info!("[{name}] subscribed to hot-plug notifications");
                set_status(&self.status, BridgeStatus::Live { bridge: name });
                true
            }
            Err(e) => {
                log::error!("[{name}] {e}; serving last enumeration only");
                set_status(
                    &self.status,
                    BridgeStatus::Degraded {
                        bridge: name,
                        reason: e.to_string(),
                    },
                );
                false
            }
        };
        let _ = ready.send(());

        let slice = match self.rescan_interval {
            Some(interval) => interval.min(self.wait_slice),
            None => self.wait_slice,
        };
        let mut last_scan = Instant::now();

        while !self.shutdown.is_raised() {
            if live {
                match bridge.wait(&self.sink, slice) {
                    Ok(Wake::Events) | Ok(Wake::Timeout) => {}
                    Ok(Wake::Shutdown) => break,
                    Err(e) => {
                        log::error!("[{name}] notification wait failed: {e}");
                        set_status(
                            &self.status,
                            BridgeStatus::Degraded {
                                bridge: name,
                                reason: e.to_string(),
                            },
                        );
                        live = false;
                    }
                }
            } else if self.shutdown.wait_timeout(slice) {
                break;
            }

            if let Some(interval) = self.rescan_interval
                && last_scan.elapsed() >= interval
                && !self.shutdown.is_raised()
            {
                self.rescan(&mut bridge, "periodic");
                last_scan = Instant::now();
            }
        }

        bridge.unsubscribe();
        log::info!("[{name}] unsubscribed");
    }

    fn rescan<B: HotplugBridge>(&self, bridge: &mut B, kind: &str) {
        let name = bridge.name();
        match bridge.enumerate_now() {
            Ok(devices) => {
                let found = devices.len();
                let changes = self.sink.reconcile(devices);
                log::info!("[{name}] {kind} enumeration: {found} device(s), {changes} change(s)");
            }
            Err(e) => log::warn!("[{name}] {kind} enumeration failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::ScriptedBridge;
    use crate::device::PlatformHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn board(path: &str, serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x20a0,
            product_id: 0x415a,
            serial_number: serial.into(),
            handle: PlatformHandle::Path(path.into()),
            ..Default::default()
        }
    }

    fn fast_options() -> MonitorOptions {
        MonitorOptions {
            wait_slice: Duration::from_millis(20),
            ..MonitorOptions::default()
        }
    }

    /// Poll until `cond` holds or a generous deadline passes.
    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn start_applies_initial_enumeration() {
        let (bridge, _h) = ScriptedBridge::new();
        let bridge = bridge.with_attached(vec![board("a", ""), board("b", "")]);
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        m.start(bridge).unwrap();
        assert_eq!(m.all_devices().len(), 2);
        assert_eq!(m.status(), BridgeStatus::Live { bridge: "scripted" });
    }

    #[test]
    fn start_twice_is_rejected() {
        let (b1, _h1) = ScriptedBridge::new();
        let (b2, _h2) = ScriptedBridge::new();
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        m.start(b1).unwrap();
        assert!(matches!(m.start(b2), Err(MonitorError::AlreadyRunning)));
    }

    #[test]
    fn start_after_stop_is_rejected() {
        let (b, _h) = ScriptedBridge::new();
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        m.stop();
        assert!(matches!(m.start(b), Err(MonitorError::Stopped)));
    }

    #[test]
    fn subscription_failure_degrades_but_keeps_table() {
        let (bridge, _h) = ScriptedBridge::new();
        let bridge = bridge
            .with_attached(vec![board("a", "")])
            .failing_subscribe();
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        m.start(bridge).unwrap();
        assert!(matches!(m.status(), BridgeStatus::Degraded { .. }));
        assert_eq!(m.all_devices().len(), 1);
        m.stop();
        assert_eq!(m.status(), BridgeStatus::Stopped);
        assert_eq!(m.all_devices().len(), 1);
    }

    #[test]
    fn enumeration_failure_still_subscribes() {
        let (bridge, h) = ScriptedBridge::new();
        let bridge = bridge.failing_enumeration();
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        m.start(bridge).unwrap();
        assert!(matches!(m.status(), BridgeStatus::Live { .. }));
        h.arrive(board("a", ""));
        assert!(eventually(|| m.all_devices().len() == 1));
    }

    #[test]
    fn stop_unsubscribes_and_freezes() {
        let (bridge, h) = ScriptedBridge::new();
        let unsubscribed = bridge.unsubscribed.clone();
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        m.start(bridge).unwrap();
        h.arrive(board("a", ""));
        assert!(eventually(|| m.all_devices().len() == 1));

        m.stop();
        assert!(*unsubscribed.lock().unwrap());
        assert!(!m.is_running());
        h.arrive(board("b", ""));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(m.all_devices().len(), 1);
    }

    #[test]
    fn no_callbacks_after_stop() {
        let (bridge, h) = ScriptedBridge::new();
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hc = hits.clone();
        m.on_arrived_signal(move || {
            hc.fetch_add(1, Ordering::SeqCst);
        });
        m.start(bridge).unwrap();
        h.arrive(board("a", ""));
        assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));
        m.stop();
        h.arrive(board("b", ""));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_prompt() {
        let (bridge, _h) = ScriptedBridge::new();
        let mut m = DeviceMonitor::new(MonitorOptions {
            wait_slice: Duration::from_secs(30),
            ..MonitorOptions::default()
        })
        .unwrap();
        m.start(bridge).unwrap();
        let started = Instant::now();
        m.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn periodic_rescan_reconciles() {
        let (bridge, h) = ScriptedBridge::new();
        let bridge = bridge.with_attached(vec![board("a", "")]);
        let mut m = DeviceMonitor::new(MonitorOptions {
            rescan_interval: Some(Duration::from_millis(30)),
            wait_slice: Duration::from_millis(10),
            ..MonitorOptions::default()
        })
        .unwrap();
        m.start(bridge).unwrap();
        assert_eq!(m.all_devices().len(), 1);

        h.set_attached(vec![board("b", ""), board("c", "")]);
        assert!(eventually(|| {
            let handles: Vec<String> = m
                .all_devices()
                .iter()
                .map(|d| d.handle.to_string())
                .collect();
            handles == ["b", "c"]
        }));
    }

    #[test]
    fn flush_delivers_initial_enumeration() {
        let (bridge, _h) = ScriptedBridge::new();
        let bridge = bridge.with_attached(vec![board("a", ""), board("b", "")]);
        let mut m = DeviceMonitor::new(fast_options()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        m.on_arrived(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        m.start(bridge).unwrap();
        assert!(m.flush());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_timeout_returns_while_subscriber_is_busy() {
        let (bridge, h) = ScriptedBridge::new();
        let mut m = DeviceMonitor::new(MonitorOptions {
            queue_capacity: 1,
            ..fast_options()
        })
        .unwrap();
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        m.on_arrived_signal(move || {
            let _ = entered_tx.send(());
            let _ = gate_rx.recv();
        });
        m.start(bridge).unwrap();
        h.arrive(board("a", ""));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        assert!(!m.flush_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));

        gate_tx.send(()).unwrap();
        assert!(m.flush_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn status_display() {
        assert_eq!(BridgeStatus::Idle.to_string(), "idle");
        assert_eq!(
            BridgeStatus::Live { bridge: "udev" }.to_string(),
            "live (udev)"
        );
        assert_eq!(
            BridgeStatus::Degraded {
                bridge: "udev",
                reason: "no socket".into()
            }
            .to_string(),
            "degraded (udev): no socket"
        );
    }

    #[test]
    fn default_options_track_openpilot_vendor() {
        let o = MonitorOptions::default();
        assert!(o.vendors.accepts(0x20a0));
        assert!(!o.vendors.accepts(0x046d));
        assert_eq!(o.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(o.rescan_interval, None);
    }
}
