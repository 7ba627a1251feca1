//! Slave log consumer (C5, first half): loops pulling stream entries and
//! pushing them to the dispatcher through a bounded FIFO queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, warn};

use crate::error::{CResult, Error};
use crate::replication::entry::StreamEntry;
use crate::replication::stream::Stream;

struct Queue {
    entries: VecDeque<StreamEntry>,
    capacity: usize,
}

/// The bounded FIFO between the consumer daemon and the dispatcher daemon.
/// `push_entry` wakes any waiting dispatcher; a full queue blocks the
/// consumer rather than growing without bound.
pub struct EntryQueue {
    inner: Mutex<Queue>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl EntryQueue {
    pub fn new(capacity: usize) -> Self {
        EntryQueue {
            inner: Mutex::new(Queue { entries: VecDeque::new(), capacity }),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn push_entry(&self, entry: StreamEntry) {
        let mut inner = self.inner.lock().unwrap();
        while inner.entries.len() >= inner.capacity && !self.stopped.load(Ordering::SeqCst) {
            inner = self.cond.wait(inner).unwrap();
        }
        inner.entries.push_back(entry);
        drop(inner);
        self.cond.notify_all();
    }

    /// Blocks until an entry is available or the queue is stopped. Returns
    /// `None` once stopped with nothing left to drain -- the dispatcher's
    /// signal to exit.
    pub fn pop_entry(&self) -> Option<StreamEntry> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.entries.pop_front() {
                drop(inner);
                self.cond.notify_all();
                return Some(entry);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn set_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// The consumer daemon: repeatedly calls `fetch_stream_entry` (prepare a
/// header at the read cursor, advance it past the body) and pushes
/// successful entries onto `queue`. Exits cleanly on `Error::StreamStopped`.
pub struct LogConsumer {
    stream: Stream,
    queue: Arc<EntryQueue>,
    read_position: Mutex<u64>,
}

impl LogConsumer {
    pub fn new(stream: Stream, queue: Arc<EntryQueue>, start_position: u64) -> Self {
        LogConsumer { stream, queue, read_position: Mutex::new(start_position) }
    }

    /// Prepares the entry at the current read cursor and advances it. Does
    /// not unpack the body -- that happens lazily once the dispatcher hands
    /// the entry to a worker.
    pub fn fetch_stream_entry(&self) -> CResult<StreamEntry> {
        let position = { *self.read_position.lock().unwrap() };
        let (entry, next_position) = StreamEntry::prepare(&self.stream, position)?;
        *self.read_position.lock().unwrap() = next_position;
        Ok(entry)
    }

    /// Runs until the stream is stopped. Intended to be spawned on its own
    /// thread by the caller.
    pub fn run(&self) {
        loop {
            match self.fetch_stream_entry() {
                Ok(entry) => {
                    debug!("log consumer: fetched entry at mvccid {}", entry.header.mvccid);
                    self.queue.push_entry(entry);
                }
                Err(Error::StreamStopped) => {
                    debug!("log consumer: stream stopped, exiting");
                    self.queue.set_stop();
                    return;
                }
                Err(e) => {
                    warn!("log consumer: fetch_stream_entry failed: {}", e);
                    self.queue.set_stop();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::entry::TranState;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fetch_stream_entry_advances_the_read_cursor() {
        let stream = Stream::new();
        let mut e1 = StreamEntry::new_active(1, 0);
        e1.pack(TranState::Committed, &stream).unwrap();
        StreamEntry::pack_group_commit(1, 0, &stream).unwrap();

        let queue = Arc::new(EntryQueue::new(8));
        let consumer = LogConsumer::new(stream, queue, 0);
        let first = consumer.fetch_stream_entry().unwrap();
        assert_eq!(first.header.tran_state, TranState::Committed);
        let second = consumer.fetch_stream_entry().unwrap();
        assert_eq!(second.header.tran_state, TranState::GroupCommit);
    }

    #[test]
    fn run_pushes_entries_and_stops_on_stream_stop() {
        let stream = Stream::new();
        let queue = Arc::new(EntryQueue::new(8));
        let consumer_stream = stream.clone();
        let consumer_queue = queue.clone();
        let handle = thread::spawn(move || {
            let consumer = LogConsumer::new(consumer_stream, consumer_queue, 0);
            consumer.run();
        });

        let mut e1 = StreamEntry::new_active(1, 0);
        e1.pack(TranState::Committed, &stream).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        stream.set_stop();
        handle.join().unwrap();
        assert!(queue.is_stopped());
    }

    #[test]
    fn queue_blocks_pop_until_an_entry_is_pushed() {
        let queue = Arc::new(EntryQueue::new(4));
        let popper = queue.clone();
        let handle = thread::spawn(move || popper.pop_entry());

        thread::sleep(Duration::from_millis(20));
        queue.push_entry(StreamEntry::new_active(1, 0));
        let popped = handle.join().unwrap();
        assert!(popped.is_some());
    }
}
