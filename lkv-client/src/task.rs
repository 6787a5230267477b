//! # Background Tasks
//!
//! Periodic worker threads with a stop signal that also interrupts their
//! sleep, so shutdown does not wait out a full period.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot stop flag that sleeping threads can wait on.
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Raises the flag. Returns false if it was already raised.
    pub(crate) fn stop(&self) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return false;
        }
        *stopped = true;
        drop(stopped);
        self.cond.notify_all();
        true
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for `period` or until stopped. Returns true when stopped.
    pub(crate) fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Spawns a named thread that runs `tick` once per `period` until stopped.
///
/// The first tick runs one period after spawning.
pub(crate) fn spawn_periodic<F>(
    name: &str,
    period: Duration,
    stop: Arc<StopSignal>,
    mut tick: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let period = if period.is_zero() {
        Duration::from_millis(1)
    } else {
        period
    };
    let name = name.to_string();
    std::thread::Builder::new().name(name.clone()).spawn(move || {
        tracing::debug!(task = %name, ?period, "background task started");
        while !stop.sleep(period) {
            tick();
        }
        tracing::debug!(task = %name, "background task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stop_interrupts_sleep() {
        let stop = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&stop);
        let started = Instant::now();
        let handle = std::thread::spawn(move || waiter.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(stop.stop());
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!stop.stop());
    }

    #[test]
    fn periodic_task_ticks_until_stopped() {
        let stop = Arc::new(StopSignal::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic("test-tick", Duration::from_millis(5), Arc::clone(&stop), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        stop.stop();
        handle.join().unwrap();
        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 2, "only {} ticks", seen);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::Relaxed), seen);
    }
}
