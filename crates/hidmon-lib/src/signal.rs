//! Shutdown signal — countable wake for the bridge worker.
//!
//! Raising the signal bumps a counter, wakes anything blocked in
//! [`ShutdownSignal::wait_timeout`], and runs the waker a platform bridge
//! installed to interrupt its own wait primitive (poll, run loop, message
//! queue).

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

type Waker = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Inner {
    count: Mutex<u64>,
    cond: Condvar,
    waker: Mutex<Option<Waker>>,
}

/// Cloneable handle; all clones share one counter.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("count", &self.count())
            .finish()
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake the worker.
    pub fn raise(&self) {
        {
            let mut count = relock(&self.inner.count);
            *count += 1;
        }
        self.inner.cond.notify_all();
        if let Some(wake) = relock(&self.inner.waker).as_ref() {
            wake();
        }
    }

    /// Number of times the signal has been raised.
    pub fn count(&self) -> u64 {
        *relock(&self.inner.count)
    }

    pub fn is_raised(&self) -> bool {
        self.count() > 0
    }

    /// Block until raised or `timeout` elapses. Returns `true` if raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = relock(&self.inner.count);
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.inner.cond.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Install the hook that interrupts a bridge's wait primitive.
    ///
    /// Runs the hook immediately if the signal was raised before it was set.
    pub fn set_waker(&self, wake: impl Fn() + Send + 'static) {
        let mut slot = relock(&self.inner.waker);
        *slot = Some(Box::new(wake));
        if self.is_raised()
            && let Some(wake) = slot.as_ref()
        {
            wake();
        }
    }

    /// Drop the waker (and whatever platform resources it captured).
    pub fn clear_waker(&self) {
        relock(&self.inner.waker).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn starts_lowered() {
        let s = ShutdownSignal::new();
        assert!(!s.is_raised());
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn raise_is_counted() {
        let s = ShutdownSignal::new();
        s.raise();
        s.raise();
        assert!(s.is_raised());
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn clones_share_state() {
        let s = ShutdownSignal::new();
        let c = s.clone();
        c.raise();
        assert!(s.is_raised());
    }

    #[test]
    fn wait_timeout_expires() {
        let s = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!s.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_timeout_wakes_on_raise() {
        let s = ShutdownSignal::new();
        let c = s.clone();
        let t = std::thread::spawn(move || c.wait_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        s.raise();
        assert!(t.join().unwrap());
    }

    #[test]
    fn waker_runs_on_raise() {
        let s = ShutdownSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        s.set_waker(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        s.raise();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_waker_runs_immediately() {
        let s = ShutdownSignal::new();
        s.raise();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        s.set_waker(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleared_waker_is_not_called() {
        let s = ShutdownSignal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        s.set_waker(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        s.clear_waker();
        s.raise();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
