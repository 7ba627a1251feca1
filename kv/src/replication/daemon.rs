//! A tiny periodic-looper daemon, standing in for an out-of-scope thread
//! manager's `create_daemon(looper, task, name)` / `destroy_daemon(d)`.
//! Every named daemon role in this crate (the master/slave group-complete
//! tickers, the control-channel's `check_alive` sweep) is built on top of
//! this one primitive rather than hand-rolling its own sleep loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A named background thread that calls `task` on a fixed interval until
/// stopped. Dropping the handle does not stop the thread -- call `stop()`
/// and then join explicitly, matching an explicit `destroy_daemon`
/// lifecycle rather than relying on `Drop` to do it implicitly.
pub struct Daemon {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Spawns `task` on its own thread, calling it every `interval` until
    /// `stop()` is called. `task` should be cheap relative to `interval` --
    /// this is a fixed-period looper, not a scheduler that compensates for
    /// slow iterations.
    pub fn spawn(name: impl Into<String>, interval: Duration, mut task: impl FnMut() + Send + 'static) -> Self {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    task();
                    thread::sleep(interval);
                }
            })
            .expect("failed to spawn daemon thread");
        Daemon { name, stop, handle: Some(handle) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the daemon to exit after its current iteration and blocks
    /// until it has. A no-op if already stopped.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[test]
    fn daemon_ticks_task_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_task = ticks.clone();
        let daemon = Daemon::spawn("test-daemon", StdDuration::from_millis(5), move || {
            ticks_task.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(StdDuration::from_millis(40));
        daemon.stop();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn dropping_without_explicit_stop_still_joins() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_task = ticks.clone();
        {
            let _daemon = Daemon::spawn("dropped-daemon", StdDuration::from_millis(5), move || {
                ticks_task.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(StdDuration::from_millis(20));
        }
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }
}
