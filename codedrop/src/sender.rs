//! Sender engine.
//!
//! A single task owns all sender state and serializes every mutation through
//! one event loop: control messages, retransmission scans, keepalives, token
//! refills and backpressure edges all arrive as branches of the same
//! `select!`. Chunks are produced only while the sliding window, the token
//! bucket and the transport buffers all allow it.

use bytes::Bytes;
use std::{collections::BTreeMap, fmt, io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
    sync::mpsc,
    time::{interval, sleep, sleep_until, Instant},
};

use crate::{
    cfg::Cfg,
    crypto::{FileDigest, TransferCipher},
    flow::FlowController,
    frame::{Frame, Sack},
    msg::{ControlMsg, FileMeta},
    seq::{Seq, SeqExhausted},
    session::{Session, SessionError, TransferEvent},
    transport::{ChannelPool, FrameSink, FrameStream},
};

/// Error terminating a send.
#[derive(Debug)]
#[non_exhaustive]
pub enum SendError {
    /// Session state machine refused an operation.
    Session(SessionError),
    /// Reading the file or writing a channel failed.
    Io(io::Error),
    /// A chunk exceeded the hard retry limit.
    PeerUnresponsive {
        /// The sequence number that was never acknowledged.
        seq: Seq,
    },
    /// The peer reported a protocol error.
    Peer(String),
    /// Every data channel has failed.
    AllChannelsFailed,
    /// The control channel was closed before the transfer finished.
    ControlClosed,
    /// No activity within the session timeout.
    Timeout,
    /// The sequence number space was exhausted.
    SeqExhausted,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Session(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::PeerUnresponsive { seq } => write!(f, "peer unresponsive, seq {seq} exceeded retry limit"),
            Self::Peer(msg) => write!(f, "peer error: {msg}"),
            Self::AllChannelsFailed => write!(f, "all data channels failed"),
            Self::ControlClosed => write!(f, "control channel closed"),
            Self::Timeout => write!(f, "session timed out"),
            Self::SeqExhausted => write!(f, "{SeqExhausted}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<SessionError> for SendError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<SeqExhausted> for SendError {
    fn from(_: SeqExhausted) -> Self {
        Self::SeqExhausted
    }
}

/// A chunk sent but not yet acknowledged.
struct Inflight {
    /// Plaintext payload; released when the chunk is acknowledged.
    payload: Bytes,
    offset: u32,
    is_last: bool,
    first_sent: Instant,
    last_sent: Instant,
    retries: u32,
    warned: bool,
}

impl fmt::Debug for Inflight {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Inflight")
            .field("size", &self.payload.len())
            .field("offset", &self.offset)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Why chunk production stopped for the moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    /// Nothing blocks sending; the file is exhausted or the transfer has not started.
    Idle,
    /// The sliding window is full.
    Window,
    /// The token bucket is empty for the given duration.
    Tokens(Duration),
    /// Every data channel is over the high watermark.
    Backpressure,
}

/// Transfer phase of the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// METADATA sent, waiting for START_TRANSFER or RESUME_FROM.
    AwaitingOpen,
    /// Chunks are being produced and retired.
    Streaming,
}

/// The sending endpoint of a transfer.
///
/// Constructed in the `Ready` session state (shared key derived) and driven
/// to completion by [`run`](Self::run).
pub struct SenderEngine<F> {
    cfg: Cfg,
    session: Session,
    meta: FileMeta,
    file: F,
    cipher: TransferCipher,
    digest: Option<FileDigest>,
    flow: FlowController,
    pool: ChannelPool,
    control_tx: FrameSink,
    control_rx: FrameStream,
    events: mpsc::Sender<TransferEvent>,

    phase: Phase,
    window_base: Seq,
    next_seq: Seq,
    file_offset: u64,
    read_done: bool,
    inflight: BTreeMap<Seq, Inflight>,
    acked_bytes: u64,
    offer_sent: bool,
    deadline: Instant,
}

impl<F> fmt::Debug for SenderEngine<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SenderEngine")
            .field("session", &self.session)
            .field("phase", &self.phase)
            .field("window_base", &self.window_base)
            .field("next_seq", &self.next_seq)
            .field("file_offset", &self.file_offset)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

impl<F> SenderEngine<F>
where
    F: AsyncRead + Unpin + Send,
{
    /// Creates the engine.
    ///
    /// `session` must be `Ready` with the shared key installed; `file` yields
    /// the plaintext bytes described by `meta`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Cfg, session: Session, meta: FileMeta, file: F, pool: ChannelPool,
        control_tx: FrameSink, control_rx: FrameStream, events: mpsc::Sender<TransferEvent>,
    ) -> Result<Self, SendError> {
        if meta.size > u32::MAX as u64 {
            // Frame headers carry 32-bit byte offsets.
            return Err(SendError::Io(crate::protocol_err!(
                "file of {} bytes exceeds the 32-bit offset space",
                meta.size
            )));
        }
        let cipher = TransferCipher::new(session.key()?);
        let flow = FlowController::new(&cfg);
        let deadline = Instant::now() + cfg.session_timeout;
        Ok(Self {
            cfg,
            session,
            meta,
            file,
            cipher,
            digest: Some(FileDigest::new()),
            flow,
            pool,
            control_tx,
            control_rx,
            events,
            phase: Phase::AwaitingOpen,
            window_base: Seq::ZERO,
            next_seq: Seq::ZERO,
            file_offset: 0,
            read_done: false,
            inflight: BTreeMap::new(),
            acked_bytes: 0,
            offer_sent: false,
            deadline,
        })
    }

    /// Offers the file to the peer. Idempotent; refused in terminal states.
    async fn offer_file(&mut self) -> Result<(), SendError> {
        if self.session.state().is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: self.session.state(),
                attempted: "offer file",
            }
            .into());
        }
        if self.offer_sent {
            return Ok(());
        }
        ControlMsg::Metadata { file: self.meta.clone() }.send(&mut self.control_tx).await?;
        self.offer_sent = true;
        tracing::debug!(name = %self.meta.name, size = self.meta.size, "file offered");
        Ok(())
    }

    /// Runs the transfer to completion.
    #[tracing::instrument(level = "debug", skip_all, fields(code = %self.session.code()))]
    pub async fn run(mut self) -> Result<(), SendError> {
        self.offer_file().await?;

        let mut retransmit = interval(self.cfg.retransmit_interval);
        retransmit.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive = interval(self.cfg.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let stall = if self.phase == Phase::Streaming { self.pump().await? } else { Stall::Idle };

            if self.phase == Phase::Streaming && self.read_done && self.inflight.is_empty() {
                return self.finish().await;
            }

            let token_wait = match stall {
                Stall::Tokens(wait) => Some(wait),
                _ => None,
            };

            select! {
                msg = next_control(&mut self.control_rx) => {
                    let msg = msg?.ok_or(SendError::ControlClosed)?;
                    self.deadline = Instant::now() + self.cfg.session_timeout;
                    self.on_control(msg).await?;
                }
                _ = retransmit.tick() => {
                    self.scan_retransmits().await?;
                }
                _ = keepalive.tick() => {
                    ControlMsg::Ping.send(&mut self.control_tx).await?;
                }
                () = self.pool.buffer_low(self.cfg.buffer_low.get(), self.cfg.backpressure_poll),
                    if stall == Stall::Backpressure => {}
                () = sleep(token_wait.unwrap_or(Duration::from_secs(3600))),
                    if token_wait.is_some() => {}
                () = sleep_until(self.deadline) => {
                    self.fail("session timed out").await;
                    return Err(SendError::Timeout);
                }
            }
        }
    }

    /// Produces and sends new chunks while window, tokens and buffers allow.
    async fn pump(&mut self) -> Result<Stall, SendError> {
        loop {
            if self.read_done {
                return Ok(Stall::Idle);
            }
            if self.next_seq.since(self.window_base) as usize >= self.flow.window_size() {
                return Ok(Stall::Window);
            }

            let remaining = (self.meta.size - self.file_offset) as usize;
            if remaining == 0 {
                // Zero-length file: nothing to send, completion follows.
                self.read_done = true;
                return Ok(Stall::Idle);
            }

            let chunk_size = self
                .flow
                .optimal_chunk_size()
                .min(self.cfg.transport_chunk_limit())
                .min(remaining);

            let Some(channel) = self.pool.pick(self.cfg.max_buffer.get()) else {
                if self.pool.open_count() == 0 {
                    return Err(SendError::AllChannelsFailed);
                }
                return Ok(Stall::Backpressure);
            };
            if !self.flow.can_send(chunk_size) {
                return Ok(Stall::Tokens(self.flow.time_until(chunk_size)));
            }

            let mut buf = vec![0u8; chunk_size];
            self.file.read_exact(&mut buf).await?;
            let payload = Bytes::from(buf);

            if let Some(digest) = self.digest.as_mut() {
                digest.update(&payload);
            }

            let seq = self.next_seq;
            let offset = self.file_offset as u32;
            let is_last = self.file_offset + chunk_size as u64 == self.meta.size;

            self.next_seq = seq.checked_next()?;
            self.file_offset += chunk_size as u64;
            self.read_done = is_last;

            let now = Instant::now();
            self.inflight.insert(
                seq,
                Inflight {
                    payload: payload.clone(),
                    offset,
                    is_last,
                    first_sent: now,
                    last_sent: now,
                    retries: 0,
                    warned: false,
                },
            );

            let cipher = self.cipher.encrypt_chunk(seq, &payload);
            let frame = Frame::data(seq, offset, is_last, true, cipher);
            if let Err(err) = self.pool.send_on(channel, frame.encode()).await {
                tracing::debug!(%seq, channel, "send failed: {err}");
                if self.pool.open_count() == 0 {
                    return Err(SendError::AllChannelsFailed);
                }
                // The chunk stays inflight; the retransmission scan recovers it.
            } else {
                tracing::trace!(%seq, offset, size = chunk_size, channel, "chunk sent");
            }
        }
    }

    async fn on_control(&mut self, msg: ControlMsg) -> Result<(), SendError> {
        match msg {
            ControlMsg::StartTransfer => {
                self.session.transferring()?;
                self.phase = Phase::Streaming;
                tracing::debug!("transfer started from the beginning");
            }
            ControlMsg::ResumeFrom { byte_offset, received_chunks } => {
                self.session.transferring()?;
                self.resume_from(byte_offset, &received_chunks).await?;
                self.phase = Phase::Streaming;
                tracing::info!(byte_offset, chunks = received_chunks.len(), "transfer resumed");
            }
            ControlMsg::ChunkBatchAck { sequences, received_bytes } => {
                let sack = Sack::from_sequences(
                    self.window_base,
                    sequences.into_iter().map(Seq).collect(),
                );
                self.on_sack(&sack, received_bytes);
            }
            ControlMsg::RetransmitRequest { sequences } => {
                self.on_retransmit_request(sequences.into_iter().map(Seq)).await?;
            }
            ControlMsg::Ping => ControlMsg::Pong.send(&mut self.control_tx).await?,
            ControlMsg::Pong => {}
            ControlMsg::Error { message } => {
                self.session.failed();
                let _ = self.events.try_send(TransferEvent::Failed { reason: message.clone() });
                return Err(SendError::Peer(message));
            }
            other => {
                tracing::debug!(?other, "ignoring unexpected control message");
            }
        }
        Ok(())
    }

    /// Re-hashes the already-delivered prefix and positions the chunker
    /// behind it. The digest must cover the whole file even though the prefix
    /// is never resent.
    async fn resume_from(&mut self, byte_offset: u64, received: &[u32]) -> Result<(), SendError> {
        let mut skipped = 0u64;
        let mut buf = vec![0u8; self.cfg.chunk_size.get()];
        while skipped < byte_offset {
            let step = ((byte_offset - skipped) as usize).min(buf.len());
            self.file.read_exact(&mut buf[..step]).await?;
            if let Some(digest) = self.digest.as_mut() {
                digest.update(&buf[..step]);
            }
            skipped += step as u64;
        }

        let next = match received.iter().copied().max() {
            Some(highest) => highest.checked_add(1).ok_or(SendError::SeqExhausted)?,
            None => 0,
        };
        self.next_seq = Seq(next);
        self.window_base = Seq(next);
        self.file_offset = byte_offset;
        self.read_done = byte_offset == self.meta.size;
        Ok(())
    }

    /// Advances the window and releases acknowledged chunks.
    fn on_sack(&mut self, sack: &Sack, received_bytes: u64) {
        let now = Instant::now();

        let mut acked: Vec<Seq> = self
            .inflight
            .range(..sack.cumulative)
            .map(|(seq, _)| *seq)
            .collect();
        acked.extend(sack.sequences().filter(|seq| self.inflight.contains_key(seq)));

        for seq in acked {
            if let Some(entry) = self.inflight.remove(&seq) {
                self.acked_bytes += entry.payload.len() as u64;
                // Retransmitted chunks give ambiguous samples; skip them.
                if entry.retries == 0 {
                    self.flow.observe_rtt(now.duration_since(entry.first_sent));
                }
            }
        }

        self.window_base = self.inflight.keys().next().copied().unwrap_or(self.next_seq);

        let _ = self.events.try_send(TransferEvent::Progress {
            bytes: received_bytes.max(self.acked_bytes),
            total: self.meta.size,
        });
    }

    /// Resends explicitly requested chunks, bypassing the pacer.
    async fn on_retransmit_request(
        &mut self, seqs: impl Iterator<Item = Seq>,
    ) -> Result<(), SendError> {
        for seq in seqs {
            if self.inflight.contains_key(&seq) {
                self.resend(seq).await?;
            } else {
                // Below the cumulative ack the receiver promised persistence;
                // nothing to re-read.
                tracing::debug!(%seq, "retransmit request for retired chunk ignored");
            }
        }
        Ok(())
    }

    /// Periodic retransmission scan with exponential backoff.
    async fn scan_retransmits(&mut self) -> Result<(), SendError> {
        let now = Instant::now();
        let base = self.cfg.retransmit_interval;
        let cap = self.cfg.retransmit_interval_cap.get();

        let due: Vec<Seq> = self
            .inflight
            .iter()
            .filter(|(_, entry)| {
                let factor = 1u32 << entry.retries.min(self.cfg.retransmit_backoff_cap);
                let backoff = (base * factor).min(base * cap);
                now.duration_since(entry.last_sent) >= backoff
            })
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            self.resend(seq).await?;
        }
        Ok(())
    }

    /// Re-encrypts and resends one inflight chunk.
    ///
    /// The deterministic nonce makes this stateless: the ciphertext is
    /// identical to the first transmission.
    async fn resend(&mut self, seq: Seq) -> Result<(), SendError> {
        let Some(channel) = self.pool.pick(self.cfg.max_buffer.get()) else {
            if self.pool.open_count() == 0 {
                return Err(SendError::AllChannelsFailed);
            }
            // All channels backpressured; the next scan picks this up again.
            return Ok(());
        };

        let entry = match self.inflight.get_mut(&seq) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        entry.retries += 1;
        entry.last_sent = Instant::now();

        if entry.retries > self.cfg.retry_hard_limit {
            self.session.failed();
            let _ = self.events.try_send(TransferEvent::Failed {
                reason: format!("peer unresponsive, seq {seq}"),
            });
            return Err(SendError::PeerUnresponsive { seq });
        }
        if entry.retries > self.cfg.retry_soft_limit && !entry.warned {
            entry.warned = true;
            tracing::warn!(%seq, retries = entry.retries, "chunk exceeded soft retry limit");
            let _ = self.events.try_send(TransferEvent::RetryWarning {
                seq: seq.into(),
                retries: entry.retries,
            });
        }

        let cipher = self.cipher.encrypt_chunk(seq, &entry.payload);
        let frame = Frame::data(seq, entry.offset, entry.is_last, true, cipher);
        let retries = entry.retries;
        if let Err(err) = self.pool.send_on(channel, frame.encode()).await {
            tracing::debug!(%seq, channel, "resend failed: {err}");
            if self.pool.open_count() == 0 {
                return Err(SendError::AllChannelsFailed);
            }
        } else {
            tracing::debug!(%seq, retries, "chunk resent");
        }
        Ok(())
    }

    /// Sends the encrypted digest and END, then completes the session.
    async fn finish(mut self) -> Result<(), SendError> {
        let digest = self.digest.take().map(FileDigest::finalize).unwrap_or_default();
        let (nonce, cipher) = self.cipher.seal(&digest);
        ControlMsg::Hash { nonce, cipher }.send(&mut self.control_tx).await?;
        ControlMsg::End.send(&mut self.control_tx).await?;

        self.session.completed()?;
        let _ = self.events.try_send(TransferEvent::Completed);
        tracing::info!(bytes = self.meta.size, "transfer complete");
        Ok(())
    }

    async fn fail(&mut self, reason: &str) {
        self.session.failed();
        let _ = ControlMsg::Error { message: reason.to_string() }.send(&mut self.control_tx).await;
        let _ = self.events.try_send(TransferEvent::Failed { reason: reason.to_string() });
    }
}

/// Receives the next control message.
async fn next_control(rx: &mut FrameStream) -> Result<Option<ControlMsg>, SendError> {
    Ok(ControlMsg::recv(rx).await?)
}
