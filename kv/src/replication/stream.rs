//! The append-only byte stream (C1): a multi-writer, multi-reader ordered
//! byte log with position cursors and blocking reads.
//!
//! There is no random rewrite -- bytes at a position are immutable once
//! published. Concurrent writers are linearized by the internal mutex, each
//! getting back a contiguous, non-overlapping position range.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{CResult, Error};

struct Inner {
    buf: Vec<u8>,
    stopped: bool,
}

/// Shared append-only byte stream.
///
/// Cloning a `Stream` shares the same backing buffer (it is an `Arc` under
/// the hood), matching the process-wide `s_stream` pointer that is installed
/// once at boot and handed to every producer and consumer.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<Mutex<Inner>>,
    cond: Arc<Condvar>,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub fn new() -> Self {
        Stream {
            inner: Arc::new(Mutex::new(Inner { buf: Vec::new(), stopped: false })),
            cond: Arc::new(Condvar::new()),
        }
    }

    /// Appends `bytes` to the stream and returns the position at which they
    /// were written. Concurrent appends are linearized; each caller gets a
    /// distinct, contiguous range `[pos, pos + bytes.len())`.
    pub fn append(&self, bytes: &[u8]) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner.buf.len() as u64;
        inner.buf.extend_from_slice(bytes);
        drop(inner);
        self.cond.notify_all();
        pos
    }

    /// Current high-water mark: the number of bytes published so far.
    pub fn committed_len(&self) -> u64 {
        self.inner.lock().unwrap().buf.len() as u64
    }

    /// Blocks until `len` bytes starting at `position` are available, or the
    /// stream is stopped, then invokes `read_action` once per contiguous
    /// segment copied (here always a single segment, since the backing
    /// store is one contiguous buffer) and returns the number of bytes
    /// delivered.
    ///
    /// Returns `Error::StreamStopped` if `set_stop()` is called while a
    /// reader is blocked and the requested range still isn't available.
    pub fn read_at(
        &self,
        position: u64,
        len: usize,
        mut read_action: impl FnMut(&[u8]),
    ) -> CResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let avail = inner.buf.len() as u64;
            if avail >= position + len as u64 {
                let start = position as usize;
                let end = start + len;
                read_action(&inner.buf[start..end]);
                return Ok(len);
            }
            if inner.stopped {
                return Err(Error::StreamStopped);
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Reads up to `max_len` bytes starting at `position`, blocking until at
    /// least one byte is available or the stream is stopped. Used by the
    /// transfer sender, which chunks to MTU and does not require a full
    /// `max_len` to make progress.
    pub fn read_up_to(
        &self,
        position: u64,
        max_len: usize,
        mut read_action: impl FnMut(&[u8]),
    ) -> CResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let avail = inner.buf.len() as u64;
            if avail > position {
                let start = position as usize;
                let end = (start + max_len).min(inner.buf.len());
                read_action(&inner.buf[start..end]);
                return Ok(end - start);
            }
            if inner.stopped {
                return Err(Error::StreamStopped);
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Unblocks every reader currently waiting in `read_at`/`read_up_to`
    /// with `Error::StreamStopped`, and causes future calls to return the
    /// same error immediately unless the requested range is already
    /// available.
    pub fn set_stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }
}
