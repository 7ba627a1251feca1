//! Master control channel manager (C8): tracks ack-reader daemons and their
//! channels, sweeps for dead ones, and tears down all senders once every
//! reader is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::replication::transfer::StreamAckSink;

/// One registered reader: its liveness flag (owned by the ack-reader thread
/// this entry stands for) and a stop handle to tear it down.
struct ReaderEntry {
    id: u64,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

/// Callback invoked when the control channel loses its last reader.
/// Modeled after `master_senders_manager::remove_all_senders()`.
pub trait SendersManager: Send + Sync {
    fn remove_all_senders(&self);
}

struct Inner {
    readers: Vec<ReaderEntry>,
    sink: Arc<dyn StreamAckSink>,
    next_id: u64,
}

/// Owns the list of `(ack_reader_daemon, channel)` pairs and the registered
/// `stream_ack` sink they all feed. A periodic sweep (`check_alive`)
/// reclaims dead readers; when the list empties as a result, the senders
/// manager is told to tear down every sender.
pub struct MasterControlChannel {
    inner: Mutex<Inner>,
    senders_manager: Arc<dyn SendersManager>,
}

impl MasterControlChannel {
    pub fn new(sink: Arc<dyn StreamAckSink>, senders_manager: Arc<dyn SendersManager>) -> Self {
        MasterControlChannel {
            inner: Mutex::new(Inner { readers: Vec::new(), sink, next_id: 1 }),
            senders_manager,
        }
    }

    /// Registers a new reader bound to the current sink, returning a
    /// liveness handle the caller's ack-reader thread should clear when its
    /// channel dies, and an id to `remove` it by.
    pub fn add(&self) -> (u64, Arc<AtomicBool>, Arc<AtomicBool>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        inner.readers.push(ReaderEntry { id, alive: alive.clone(), stop: stop.clone() });
        (id, alive, stop)
    }

    /// Removes a reader explicitly (e.g. on graceful disconnect).
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.readers.retain(|r| r.id != id);
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().unwrap().readers.len()
    }

    /// Sweeps the reader list, removing any whose channel is dead. If the
    /// list becomes empty and at least one reader was removed this sweep,
    /// instructs the senders manager to tear down every sender -- there is
    /// no audience left to fill the stream for.
    pub fn check_alive(&self) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.readers.len();
        inner.readers.retain(|r| r.alive.load(Ordering::SeqCst));
        let removed = before - inner.readers.len();
        let now_empty = inner.readers.is_empty();
        drop(inner);

        if removed > 0 && now_empty {
            info!("control channel: all readers lost, tearing down senders");
            self.senders_manager.remove_all_senders();
        }
    }

    /// Atomically swaps the registered `stream_ack` sink and tears down
    /// every existing reader under it -- they were forwarding acks to the
    /// old sink. Subsequent `add` calls register against the new sink.
    pub fn set_stream_ack(&self, sink: Arc<dyn StreamAckSink>) {
        let mut inner = self.inner.lock().unwrap();
        for reader in inner.readers.drain(..) {
            reader.stop.store(true, Ordering::SeqCst);
        }
        inner.sink = sink;
    }

    pub fn current_sink(&self) -> Arc<dyn StreamAckSink> {
        self.inner.lock().unwrap().sink.clone()
    }

    /// Starts the periodic `check_alive` sweep (one master control-channel
    /// manager daemon, a 10s looper by default).
    pub fn start_daemon(self: &Arc<Self>, interval: std::time::Duration) -> crate::replication::daemon::Daemon {
        let ctrl = self.clone();
        crate::replication::daemon::Daemon::spawn("control-channel-check-alive", interval, move || {
            ctrl.check_alive();
        })
    }
}
