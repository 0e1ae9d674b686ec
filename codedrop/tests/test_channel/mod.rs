//! Simulated datagram channel.
//!
//! Connects a frame sink to a frame stream through a relay task that can
//! drop, corrupt, reorder and delay messages, emulating the network profiles
//! the engine must survive. The sink side maintains a buffered-amount watch
//! mirroring what a WebRTC data channel exposes.
#![allow(dead_code)]

use bytes::Bytes;
use futures::{channel::mpsc, Sink, SinkExt, StreamExt};
use rand::{Rng, SeedableRng};
use rand_xoshiro::SplitMix64;
use std::{
    io::{Error, ErrorKind},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{sync::watch, time::sleep};
use tokio_stream::wrappers::ReceiverStream;

use codedrop::transport::{stream_box, FrameStream};

/// Test channel configuration.
#[derive(Clone, Debug)]
pub struct Cfg {
    /// One-way latency.
    pub latency: Option<Duration>,
    /// Uniform jitter added to the latency. Deliveries run concurrently when
    /// set, so jitter also reorders frames.
    pub jitter: Option<Duration>,
    /// Drop every nth frame (1-based count).
    pub drop_every: Option<u64>,
    /// Probability of dropping any frame.
    pub drop_probability: f64,
    /// Flip one payload byte in every nth frame.
    pub corrupt_every: Option<u64>,
    /// Deliver every nth frame twice.
    pub duplicate_every: Option<u64>,
    /// Swap every pair of adjacent frames.
    pub reorder_pairs: bool,
    /// Fail the channel after this many frames have been carried.
    pub disconnect_after: Option<u64>,
    /// Queue capacity in frames.
    pub queue: usize,
    /// Seed for the loss/corruption decisions.
    pub seed: u64,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            latency: None,
            jitter: None,
            drop_every: None,
            drop_probability: 0.0,
            corrupt_every: None,
            duplicate_every: None,
            reorder_pairs: false,
            disconnect_after: None,
            queue: 256,
            seed: 1,
        }
    }
}

/// Controls the test channel.
#[derive(Clone)]
pub struct Control {
    closed: Arc<AtomicBool>,
}

impl Control {
    /// Disconnects the channel: further sends fail and the receiving stream ends.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Sending half of the test channel.
pub struct Sender {
    tx: mpsc::Sender<Bytes>,
    buffered: Arc<AtomicUsize>,
    buffered_tx: Arc<watch::Sender<usize>>,
    closed: Arc<AtomicBool>,
}

impl Sink<Bytes> for Sender {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        let this = Pin::into_inner(self);
        if this.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(ErrorKind::BrokenPipe.into()));
        }
        this.tx.poll_ready(cx).map_err(|_| ErrorKind::BrokenPipe.into())
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let this = Pin::into_inner(self);
        if this.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::BrokenPipe.into());
        }
        let buffered = this.buffered.fetch_add(item.len(), Ordering::SeqCst) + item.len();
        this.buffered_tx.send_replace(buffered);
        this.tx.start_send_unpin(item).map_err(|_| ErrorKind::BrokenPipe.into())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        let this = Pin::into_inner(self);
        this.tx.poll_flush_unpin(cx).map_err(|_| ErrorKind::BrokenPipe.into())
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        let this = Pin::into_inner(self);
        this.tx.poll_close_unpin(cx).map_err(|_| ErrorKind::BrokenPipe.into())
    }
}

/// Creates a simulated one-directional channel.
///
/// Returns the frame sink, the frame stream of what survives the network,
/// the buffered-amount watch for the sink side, and the control handle.
pub fn channel(cfg: Cfg) -> (Sender, FrameStream, watch::Receiver<usize>, Control) {
    let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(cfg.queue);
    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<Bytes>(cfg.queue.max(1));

    let buffered = Arc::new(AtomicUsize::new(0));
    let (buffered_tx, buffered_rx) = watch::channel(0);
    let buffered_tx = Arc::new(buffered_tx);
    let closed = Arc::new(AtomicBool::new(false));

    let sender = Sender {
        tx: in_tx,
        buffered: buffered.clone(),
        buffered_tx: buffered_tx.clone(),
        closed: closed.clone(),
    };
    let control = Control { closed: closed.clone() };

    tokio::spawn(async move {
        let mut rng = SplitMix64::seed_from_u64(cfg.seed);
        let mut held: Option<Bytes> = None;
        let mut count = 0u64;

        while let Some(frame) = in_rx.next().await {
            let remaining = buffered.fetch_sub(frame.len(), Ordering::SeqCst) - frame.len();
            buffered_tx.send_replace(remaining);

            if closed.load(Ordering::SeqCst) {
                break;
            }

            count += 1;

            if cfg.disconnect_after.map(|n| count > n).unwrap_or(false) {
                closed.store(true, Ordering::SeqCst);
                break;
            }

            if cfg.drop_every.map(|n| count % n == 0).unwrap_or(false)
                || (cfg.drop_probability > 0.0 && rng.gen::<f64>() < cfg.drop_probability)
            {
                continue;
            }

            let frame = match cfg.corrupt_every {
                Some(n) if count % n == 0 => {
                    let mut bytes = frame.to_vec();
                    let at = bytes.len() / 2;
                    bytes[at] ^= 0x01;
                    Bytes::from(bytes)
                }
                _ => frame,
            };

            let mut to_deliver: Vec<Bytes> = if cfg.reorder_pairs {
                match held.take() {
                    None => {
                        held = Some(frame);
                        continue;
                    }
                    Some(first) => vec![frame, first],
                }
            } else {
                vec![frame]
            };

            if cfg.duplicate_every.map(|n| count % n == 0).unwrap_or(false) {
                to_deliver.extend(to_deliver.clone());
            }

            for frame in to_deliver {
                let delay = match (cfg.latency, cfg.jitter) {
                    (None, None) => None,
                    (latency, jitter) => {
                        let base = latency.unwrap_or(Duration::ZERO);
                        let extra = jitter
                            .map(|j| j.mul_f64(rng.gen::<f64>()))
                            .unwrap_or(Duration::ZERO);
                        Some(base + extra)
                    }
                };

                match delay {
                    Some(delay) if cfg.jitter.is_some() => {
                        // Concurrent deliveries: jitter reorders naturally.
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            sleep(delay).await;
                            let _ = out_tx.send(frame).await;
                        });
                    }
                    Some(delay) => {
                        sleep(delay).await;
                        if out_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        if out_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        if let Some(frame) = held {
            let _ = out_tx.send(frame).await;
        }
    });

    let stream = stream_box(ReceiverStream::new(out_rx).map(Ok));
    (sender, stream, buffered_rx, control)
}

/// A pair of lossless channels forming the bidirectional control channel.
///
/// Returns one `(sink, stream)` endpoint per peer.
pub fn control_pair() -> ((Sender, FrameStream), (Sender, FrameStream)) {
    let (a_tx, a_to_b, _, _) = channel(Cfg::default());
    let (b_tx, b_to_a, _, _) = channel(Cfg::default());
    ((a_tx, b_to_a), (b_tx, a_to_b))
}
