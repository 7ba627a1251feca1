//! Transfer sender and ack reader (C4): pushes stream bytes over a channel
//! and reads back slave acks (positions).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error};

use crate::error::{CResult, Error};
use crate::replication::stream::Stream;

/// A framed, byte-oriented duplex channel to a peer: `send`, `recv`,
/// `is_connection_alive`, `close_connection`.
pub trait Channel: Send {
    fn send(&mut self, buf: &[u8]) -> CResult<()>;
    fn recv(&mut self, buf: &mut [u8]) -> CResult<()>;
    fn is_connection_alive(&self) -> bool;
    fn close_connection(&mut self);
}

/// The sink a delivered ack position is forwarded to (`notify_stream_ack`).
pub trait StreamAckSink: Send + Sync {
    fn notify_stream_ack(&self, position: u64);
}

/// Pushes stream bytes to a peer, chunked to at most `mtu` bytes per
/// iteration, starting at `begin_sending_position`.
pub struct TransferSender<C: Channel> {
    channel: C,
    stream: Stream,
    mtu: usize,
    last_sent_position: u64,
    terminating: Arc<AtomicBool>,
}

impl<C: Channel> TransferSender<C> {
    pub fn new(channel: C, stream: Stream, mtu: usize, begin_sending_position: u64) -> Self {
        TransferSender {
            channel,
            stream,
            mtu,
            last_sent_position: begin_sending_position,
            terminating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that, when flipped, causes `run` to drain the currently
    /// buffered range and exit cleanly even though the stream itself is not
    /// stopped.
    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        self.terminating.clone()
    }

    pub fn enter_termination_phase(flag: &Arc<AtomicBool>) {
        flag.store(true, Ordering::SeqCst);
    }

    /// Runs the sender loop until the stream stops, the channel dies, or
    /// termination is requested and the buffered range has fully drained.
    pub fn run(&mut self) {
        loop {
            if self.terminating.load(Ordering::SeqCst)
                && self.last_sent_position >= self.stream.committed_len()
            {
                return;
            }

            let mut chunk = Vec::new();
            let read = self.stream.read_up_to(self.last_sent_position, self.mtu, |bytes| {
                chunk.extend_from_slice(bytes);
            });

            let n = match read {
                Ok(n) => n,
                Err(Error::StreamStopped) => return,
                Err(e) => {
                    error!("transfer sender: stream read failed: {}", e);
                    return;
                }
            };

            if let Err(e) = self.channel.send(&chunk) {
                error!("transfer sender: send failed, closing channel: {}", e);
                self.channel.close_connection();
                return;
            }
            self.last_sent_position += n as u64;
        }
    }

    pub fn last_sent_position(&self) -> u64 {
        self.last_sent_position
    }
}

/// Reads 8-byte big-endian stream positions from a channel and forwards
/// each to a registered `stream_ack` sink, until the channel dies or is
/// explicitly stopped.
pub struct AckReader<C: Channel> {
    channel: C,
    sink: Arc<dyn StreamAckSink>,
    stopped: Arc<AtomicBool>,
    last_position: AtomicU64,
}

impl<C: Channel> AckReader<C> {
    pub fn new(channel: C, sink: Arc<dyn StreamAckSink>) -> Self {
        AckReader { channel, sink, stopped: Arc::new(AtomicBool::new(false)), last_position: AtomicU64::new(0) }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    pub fn last_position(&self) -> u64 {
        self.last_position.load(Ordering::SeqCst)
    }

    pub fn is_connection_alive(&self) -> bool {
        self.channel.is_connection_alive()
    }

    /// Runs the ack-reader loop: reads one 8-byte position per iteration,
    /// forwards it to the sink, and repeats. Returns when the channel dies
    /// or `stop_flag()` is set.
    pub fn run(&mut self) {
        let mut buf = [0u8; 8];
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = self.channel.recv(&mut buf) {
                debug!("ack reader: recv failed, tearing down: {}", e);
                self.channel.close_connection();
                return;
            }
            let pos = match (&buf[..]).read_u64::<BigEndian>() {
                Ok(pos) => pos,
                Err(e) => {
                    error!("ack reader: malformed ack: {}", e);
                    continue;
                }
            };
            debug!("ack reader: decoded ack position {}", pos);
            self.last_position.store(pos, Ordering::SeqCst);
            self.sink.notify_stream_ack(pos);
        }
    }
}

/// Encodes a stream position as the 8-byte big-endian wire form sent by a
/// slave back to its master.
pub fn encode_ack(position: u64) -> CResult<Vec<u8>> {
    let mut out = Vec::with_capacity(8);
    out.write_u64::<BigEndian>(position)?;
    Ok(out)
}
