//! Single-shot / periodic timer with microsecond-granularity intervals.
//!
//! Each timer owns one worker thread. While disabled the worker parks on a
//! condvar; once started it sleeps until the next deadline, fires the
//! callback, and either re-arms (periodic) or disables itself (one-shot).
//! Deadlines are best-effort: a late callback simply runs late, and the next
//! deadline is measured from the real completion time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Callback invoked on each timer expiry.
pub type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerState {
    interval: Duration,
    oneshot: bool,
    callback: Option<TimerCallback>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    running: AtomicBool,
    enabled: AtomicBool,
}

/// A worker-thread timer.
///
/// All methods take `&self`; the timer can be shared freely between the
/// register models that arm it and the machinery that stops it.
pub struct Timer {
    shared: Arc<TimerShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval: Duration::from_millis(1),
                oneshot: false,
                callback: None,
            }),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(false),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("emu-timer".into())
                .spawn(move || Self::worker_loop(&shared))
                .ok()
        };
        Self { shared, worker }
    }

    fn worker_loop(shared: &TimerShared) {
        let mut now = Instant::now();
        while shared.running.load(Ordering::Acquire) {
            {
                let mut guard = shared.state.lock();
                if !shared.enabled.load(Ordering::Acquire) {
                    shared.wakeup.wait_while(&mut guard, |_| {
                        !shared.enabled.load(Ordering::Acquire)
                            && shared.running.load(Ordering::Acquire)
                    });
                    now = Instant::now();
                }
            }
            if !shared.enabled.load(Ordering::Acquire) {
                continue;
            }

            let interval = shared.state.lock().interval;
            let deadline = now + interval;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                thread::sleep(remaining);
            }
            now = Instant::now();

            if !shared.enabled.load(Ordering::Acquire) {
                continue;
            }

            // The callback runs without the state lock so it may re-arm or
            // reconfigure this same timer. It is put back afterwards unless
            // the expiry replaced it.
            let callback = shared.state.lock().callback.take();
            let oneshot = if let Some(mut cb) = callback {
                cb();
                let mut guard = shared.state.lock();
                if guard.callback.is_none() {
                    guard.callback = Some(cb);
                }
                guard.oneshot
            } else {
                shared.state.lock().oneshot
            };
            if oneshot {
                shared.enabled.store(false, Ordering::Release);
            }
        }
    }

    /// Replace the interval and callback. Takes effect from the next arming
    /// (or the next period of an already-running periodic timer).
    pub fn set_interval(&self, interval: Duration, callback: TimerCallback) {
        let mut guard = self.shared.state.lock();
        guard.interval = interval;
        guard.callback = Some(callback);
    }

    /// Select one-shot (true) or periodic (false) expiry.
    pub fn set_oneshot(&self, oneshot: bool) {
        self.shared.state.lock().oneshot = oneshot;
    }

    /// Enable the timer; the first expiry is one interval from now.
    pub fn start(&self) {
        // The lock pairs the enable with the worker's wait so the wakeup
        // cannot fall between its check and its sleep.
        let _guard = self.shared.state.lock();
        if !self.shared.enabled.swap(true, Ordering::AcqRel) {
            self.shared.wakeup.notify_all();
        }
    }

    /// Disable the timer. Does not wake the worker; an in-flight sleep still
    /// completes but the following expiry is suppressed by the re-check.
    pub fn stop(&self) {
        self.shared.enabled.store(false, Ordering::Release);
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let _guard = self.shared.state.lock();
            self.shared.running.store(false, Ordering::Release);
            self.shared.enabled.store(false, Ordering::Release);
            self.shared.wakeup.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
