//! Transport channel abstraction.
//!
//! The engine never opens sockets itself. The surrounding application hands
//! it channel capability objects: boxed [`Sink`]/[`Stream`] pairs for frames
//! plus a watch signal mirroring the transport's buffered-amount counter.
//! This inverts the dependency between engine and transport, so the same
//! engine runs over WebRTC data channels in production and over simulated
//! lossy channels in tests.

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream};
use std::{fmt, io, pin::Pin, time::Duration};
use tokio::sync::watch;

/// Type-neutral frame sink of a channel.
pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send + 'static>>;

/// Type-neutral frame stream of a channel.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send + 'static>>;

/// Boxes a concrete sink into a [`FrameSink`].
pub fn sink_box<S>(sink: S) -> FrameSink
where
    S: Sink<Bytes, Error = io::Error> + Send + 'static,
{
    Box::pin(sink)
}

/// Boxes a concrete stream into a [`FrameStream`].
pub fn stream_box<S>(stream: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
    Box::pin(stream)
}

/// Sending half of one data channel.
///
/// `buffered` mirrors the transport's buffered-amount counter: its current
/// value is the number of queued-but-unsent bytes, and a change notification
/// doubles as the buffered-amount-low edge event.
pub struct DataChannelTx {
    index: usize,
    tx: FrameSink,
    buffered: watch::Receiver<usize>,
    closed: bool,
}

impl fmt::Debug for DataChannelTx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DataChannelTx")
            .field("index", &self.index)
            .field("buffered", &*self.buffered.borrow())
            .field("closed", &self.closed)
            .finish()
    }
}

impl DataChannelTx {
    /// Wraps the sending half of a transport channel.
    pub fn new(index: usize, tx: FrameSink, buffered: watch::Receiver<usize>) -> Self {
        Self { index, tx, buffered, closed: false }
    }

    /// Channel index within the session.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bytes currently queued in the transport.
    pub fn buffered(&self) -> usize {
        *self.buffered.borrow()
    }

    /// Whether the channel has failed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sends one frame. A failed send closes the channel.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), io::Error> {
        match self.tx.send(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.closed = true;
                Err(err)
            }
        }
    }
}

/// The parallel data channels of a session.
///
/// The sender walks the pool round-robin, skips channels that are closed or
/// above the high watermark, and among the eligible picks the one with the
/// least buffered bytes, ties broken by index. Ordering across sequence
/// numbers is not preserved by this; restoring it is the receiver's job.
pub struct ChannelPool {
    channels: Vec<DataChannelTx>,
    next: usize,
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChannelPool").field("channels", &self.channels).finish()
    }
}

impl ChannelPool {
    /// Creates the pool.
    pub fn new(channels: Vec<DataChannelTx>) -> Self {
        Self { channels, next: 0 }
    }

    /// Number of channels that have not failed.
    pub fn open_count(&self) -> usize {
        self.channels.iter().filter(|ch| !ch.is_closed()).count()
    }

    /// Whether every open channel is at or above the high watermark.
    pub fn all_backpressured(&self, max_buffer: usize) -> bool {
        self.channels.iter().filter(|ch| !ch.is_closed()).all(|ch| ch.buffered() >= max_buffer)
    }

    /// Picks the channel to send the next frame on, or `None` if every open
    /// channel is over the high watermark or the pool is dead.
    pub fn pick(&mut self, max_buffer: usize) -> Option<usize> {
        let n = self.channels.len();
        let mut best: Option<(usize, usize)> = None;
        for step in 0..n {
            let idx = (self.next + step) % n;
            let ch = &self.channels[idx];
            if ch.is_closed() || ch.buffered() >= max_buffer {
                continue;
            }
            let buffered = ch.buffered();
            match best {
                Some((_, best_buffered)) if buffered > best_buffered => (),
                Some((best_idx, best_buffered))
                    if buffered == best_buffered && self.channels[best_idx].index() < ch.index() => (),
                _ => best = Some((idx, buffered)),
            }
        }
        let (idx, _) = best?;
        self.next = (idx + 1) % n;
        Some(idx)
    }

    /// Sends one frame on the given channel.
    pub async fn send_on(&mut self, idx: usize, frame: Bytes) -> Result<(), io::Error> {
        self.channels[idx].send(frame).await
    }

    /// Waits until some open channel drains below the low watermark or the
    /// bounded fallback interval elapses, whichever first.
    pub async fn buffer_low(&mut self, low: usize, fallback: Duration) {
        let deadline = tokio::time::sleep(fallback);
        tokio::pin!(deadline);

        loop {
            if self.channels.iter().any(|ch| !ch.is_closed() && ch.buffered() < low) {
                return;
            }

            let edges: Vec<_> = self
                .channels
                .iter_mut()
                .filter(|ch| !ch.is_closed())
                .map(|ch| Box::pin(ch.buffered.changed()))
                .collect();
            if edges.is_empty() {
                return;
            }

            tokio::select! {
                () = &mut deadline => return,
                (result, _, _) = future::select_all(edges) => {
                    if result.is_err() {
                        // Transport dropped its side; the next send will surface the error.
                        return;
                    }
                }
            }
        }
    }
}
