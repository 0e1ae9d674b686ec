//! Receiver engine.
//!
//! The receiver restores the ordering the parallel channels destroy. Frames
//! from every data channel funnel into one task; anything at or above the
//! next expected sequence is decrypted into the reorder buffer, contiguous
//! prefixes drain into the durable chunk store, and only then does the
//! sequence number enter the pending acknowledgement batch. An
//! acknowledgement therefore always refers to bytes that survive a crash.

use bytes::Bytes;
use futures::{stream::SelectAll, StreamExt};
use std::{collections::BTreeMap, fmt, io, path::PathBuf};
use tokio::{
    select,
    sync::mpsc,
    time::{interval, sleep_until, Instant},
};

use crate::{
    cfg::Cfg,
    crypto::{CryptoError, FileDigest, TransferCipher},
    frame::{Frame, FrameError, FrameKind},
    msg::{ControlMsg, FileMeta},
    seq::{Seq, SeqExhausted},
    session::{Session, SessionError, TransferEvent, TransferId},
    store::{ChunkStore, StoreError},
    transport::{FrameSink, FrameStream},
};

/// Error terminating a receive.
#[derive(Debug)]
#[non_exhaustive]
pub enum RecvError {
    /// Session state machine refused an operation.
    Session(SessionError),
    /// Channel IO failed.
    Io(io::Error),
    /// The chunk store failed.
    Store(StoreError),
    /// Too many consecutive decryption failures; the shared key is assumed wrong.
    KeyMismatch,
    /// The peer reported a protocol error.
    Peer(String),
    /// The control channel was closed before the transfer finished.
    ControlClosed,
    /// No activity within the session timeout.
    Timeout,
    /// The sequence number space was exhausted.
    SeqExhausted,
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Session(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::KeyMismatch => write!(f, "persistent decryption failures, key mismatch"),
            Self::Peer(msg) => write!(f, "peer error: {msg}"),
            Self::ControlClosed => write!(f, "control channel closed"),
            Self::Timeout => write!(f, "session timed out"),
            Self::SeqExhausted => write!(f, "{SeqExhausted}"),
        }
    }
}

impl std::error::Error for RecvError {}

impl From<SessionError> for RecvError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<io::Error> for RecvError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<StoreError> for RecvError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<SeqExhausted> for RecvError {
    fn from(_: SeqExhausted) -> Self {
        Self::SeqExhausted
    }
}

/// A decrypted chunk waiting for its predecessors.
struct Pending {
    offset: u32,
    is_last: bool,
    payload: Bytes,
}

/// State of the transfer announced by METADATA.
struct Active {
    meta: FileMeta,
    store: ChunkStore,
    next_expected: Seq,
    reorder: BTreeMap<Seq, Pending>,
    pending_ack: Vec<Seq>,
    received_bytes: u64,
    remote_hash: Option<[u8; 32]>,
    end_seen: bool,
    last_persisted: bool,
    decrypt_failures: usize,
}

/// The receiving endpoint of a transfer.
///
/// Constructed in the `Ready` session state (shared key derived) and driven
/// by [`run`](Self::run) until the file is delivered or the session fails.
pub struct ReceiverEngine {
    cfg: Cfg,
    session: Session,
    store_root: PathBuf,
    cipher: TransferCipher,
    data_rx: SelectAll<FrameStream>,
    control_tx: FrameSink,
    control_rx: FrameStream,
    events: mpsc::Sender<TransferEvent>,
    active: Option<Active>,
    deadline: Instant,
}

impl fmt::Debug for ReceiverEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReceiverEngine")
            .field("session", &self.session)
            .field("store_root", &self.store_root)
            .field("active", &self.active.is_some())
            .finish()
    }
}

impl ReceiverEngine {
    /// Creates the engine.
    ///
    /// `session` must be `Ready` with the shared key installed. `store_root`
    /// is the directory below which per-transfer chunk stores live; pointing
    /// a restarted process at the same root is what makes resume work.
    pub fn new(
        cfg: Cfg, session: Session, store_root: PathBuf, data_rx: Vec<FrameStream>,
        control_tx: FrameSink, control_rx: FrameStream, events: mpsc::Sender<TransferEvent>,
    ) -> Result<Self, RecvError> {
        let cipher = TransferCipher::new(session.key()?);
        let deadline = Instant::now() + cfg.session_timeout;
        let mut merged = SelectAll::new();
        for rx in data_rx {
            merged.push(rx);
        }
        Ok(Self {
            cfg,
            session,
            store_root,
            cipher,
            data_rx: merged,
            control_tx,
            control_rx,
            events,
            active: None,
            deadline,
        })
    }

    /// Runs until the file has been delivered.
    #[tracing::instrument(level = "debug", skip_all, fields(code = %self.session.code()))]
    pub async fn run(mut self) -> Result<(), RecvError> {
        let mut sack_flush = interval(self.cfg.sack_flush_interval);
        sack_flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                frame = self.data_rx.next() => {
                    match frame {
                        Some(Ok(buf)) => {
                            self.deadline = Instant::now() + self.cfg.session_timeout;
                            self.on_wire_frame(buf).await?;
                        }
                        Some(Err(err)) => {
                            tracing::debug!("data channel receive error: {err}");
                        }
                        None => {
                            // All data channels gone. Chunks already persisted are
                            // kept; the transfer resumes if the peer returns. Flush
                            // acknowledgements first so the sender learns what is
                            // already durable.
                            self.flush_acks().await?;
                            self.fail("all data channels closed").await;
                            return Err(RecvError::Io(io::ErrorKind::ConnectionReset.into()));
                        }
                    }
                }
                msg = ControlMsg::recv(&mut self.control_rx) => {
                    let msg = msg?.ok_or(RecvError::ControlClosed)?;
                    self.deadline = Instant::now() + self.cfg.session_timeout;
                    self.on_control(msg).await?;
                }
                _ = sack_flush.tick() => {
                    self.flush_acks().await?;
                }
                () = sleep_until(self.deadline) => {
                    self.fail("session timed out").await;
                    return Err(RecvError::Timeout);
                }
            }

            if self.session.state() == crate::session::SessionState::Completed {
                return Ok(());
            }
        }
    }

    /// Decodes and dispatches one message from a data channel.
    async fn on_wire_frame(&mut self, buf: Bytes) -> Result<(), RecvError> {
        let frame = match Frame::decode(buf) {
            Ok(frame) => frame,
            Err(FrameError::ChecksumMismatch { seq })
            | Err(FrameError::LengthMismatch { seq, .. }) => {
                tracing::debug!(%seq, "framing error, requesting retransmission");
                self.request_retransmit(vec![seq]).await?;
                return Ok(());
            }
            Err(err) => {
                tracing::debug!("undecodable frame dropped: {err}");
                return Ok(());
            }
        };

        match frame.header.kind {
            FrameKind::Data => self.on_data_frame(frame).await,
            FrameKind::Control => match ControlMsg::decode(&frame.payload) {
                Ok(msg) => self.on_control(msg).await,
                Err(err) => {
                    tracing::debug!("bad control record on data channel: {err}");
                    Ok(())
                }
            },
            FrameKind::VideoData => {
                tracing::warn!("ack-less streaming is not supported, frame dropped");
                Ok(())
            }
            FrameKind::Ack | FrameKind::Sack | FrameKind::Fec => {
                tracing::trace!(kind = ?frame.header.kind, "sender-bound frame ignored");
                Ok(())
            }
        }
    }

    /// Validates, decrypts and buffers one data frame, draining the
    /// contiguous prefix into the store.
    async fn on_data_frame(&mut self, frame: Frame) -> Result<(), RecvError> {
        let seq = frame.header.seq;
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(%seq, "data before metadata dropped");
            return Ok(());
        };

        // Monotonic progress: anything below the watermark is a duplicate of
        // persisted data, anything already buffered is a duplicate in flight.
        if seq < active.next_expected || active.reorder.contains_key(&seq) {
            tracing::trace!(%seq, "duplicate chunk ignored");
            return Ok(());
        }

        let reorder_cap = self.cfg.reorder_factor.get() * self.cfg.window_limit.get();
        if seq.since(active.next_expected) as usize >= reorder_cap {
            tracing::debug!(%seq, "chunk beyond reorder capacity dropped");
            return Ok(());
        }

        let payload = if frame.is_encrypted() {
            match self.cipher.decrypt_chunk(seq, &frame.payload) {
                Ok(plain) => plain,
                Err(CryptoError::Aead) => {
                    active.decrypt_failures += 1;
                    if active.decrypt_failures >= self.cfg.decrypt_failure_limit.get() {
                        self.fail("persistent decryption failures").await;
                        return Err(RecvError::KeyMismatch);
                    }
                    tracing::debug!(%seq, "decryption failed, requesting retransmission");
                    self.request_retransmit(vec![seq]).await?;
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(%seq, "chunk rejected: {err}");
                    return Ok(());
                }
            }
        } else {
            frame.payload.clone()
        };

        let active = self.active.as_mut().expect("active transfer checked above");
        active.decrypt_failures = 0;
        active.reorder.insert(
            seq,
            Pending { offset: frame.header.offset, is_last: frame.is_last(), payload },
        );

        self.drain_reorder().await?;

        let active = self.active.as_mut().expect("active transfer survives draining");
        if active.pending_ack.len() >= self.cfg.sack_batch.get() {
            self.flush_acks().await?;
        }

        self.maybe_assemble().await?;
        Ok(())
    }

    /// Moves the contiguous prefix of the reorder buffer into the store.
    async fn drain_reorder(&mut self) -> Result<(), RecvError> {
        let Some(active) = self.active.as_mut() else { return Ok(()) };

        while let Some(pending) = active.reorder.remove(&active.next_expected) {
            let seq = active.next_expected;
            active
                .store
                .put(seq, pending.offset as u64, pending.is_last, &pending.payload)
                .await?;
            active.next_expected = seq.checked_next()?;
            active.store.save_meta(active.next_expected, &active.meta).await?;

            active.received_bytes += pending.payload.len() as u64;
            active.last_persisted |= pending.is_last;
            active.pending_ack.push(seq);

            tracing::trace!(%seq, bytes = active.received_bytes, "chunk persisted");
        }

        let _ = self.events.try_send(TransferEvent::Progress {
            bytes: self.active.as_ref().map(|a| a.received_bytes).unwrap_or(0),
            total: self.active.as_ref().map(|a| a.meta.size).unwrap_or(0),
        });
        Ok(())
    }

    /// Sends the batched acknowledgement if anything is pending.
    async fn flush_acks(&mut self) -> Result<(), RecvError> {
        let Some(active) = self.active.as_mut() else { return Ok(()) };
        if active.pending_ack.is_empty() {
            return Ok(());
        }
        let sequences: Vec<u32> = active.pending_ack.drain(..).map(u32::from).collect();
        let received_bytes = active.received_bytes;
        tracing::trace!(count = sequences.len(), "acknowledgement batch flushed");
        ControlMsg::ChunkBatchAck { sequences, received_bytes }
            .send(&mut self.control_tx)
            .await?;
        Ok(())
    }

    async fn request_retransmit(&mut self, seqs: Vec<Seq>) -> Result<(), RecvError> {
        let sequences: Vec<u32> = seqs.into_iter().map(u32::from).collect();
        ControlMsg::RetransmitRequest { sequences }.send(&mut self.control_tx).await?;
        Ok(())
    }

    /// Handles a control message.
    async fn on_control(&mut self, msg: ControlMsg) -> Result<(), RecvError> {
        match msg {
            ControlMsg::Metadata { file } => {
                self.on_metadata(file).await?;
            }
            ControlMsg::Hash { nonce, cipher } => {
                let plain = self.cipher.open(&nonce, &cipher).map_err(|_| {
                    tracing::warn!("remote digest failed to open");
                    RecvError::KeyMismatch
                })?;
                let digest: [u8; 32] =
                    plain.try_into().map_err(|_| RecvError::Peer("malformed digest".into()))?;
                if let Some(active) = self.active.as_mut() {
                    active.remote_hash = Some(digest);
                }
            }
            ControlMsg::End => {
                if let Some(active) = self.active.as_mut() {
                    active.end_seen = true;
                }
                self.maybe_assemble().await?;
            }
            ControlMsg::Ping => ControlMsg::Pong.send(&mut self.control_tx).await?,
            ControlMsg::Pong => {}
            ControlMsg::Error { message } => {
                self.session.failed();
                let _ = self.events.try_send(TransferEvent::Failed { reason: message.clone() });
                return Err(RecvError::Peer(message));
            }
            other => {
                tracing::debug!(?other, "ignoring unexpected control message");
            }
        }
        Ok(())
    }

    /// Consults the chunk store and answers the offer with either a fresh
    /// start or a resume point.
    async fn on_metadata(&mut self, meta: FileMeta) -> Result<(), RecvError> {
        if let Some(active) = &self.active {
            if active.meta == meta {
                tracing::debug!("duplicate offer ignored");
                return Ok(());
            }
        }
        self.session.transferring()?;

        let id = TransferId::new(self.session.code(), &meta.name, meta.size);
        let store = ChunkStore::open(&self.store_root, &id).await?;

        let prior = store.load_meta().await.ok().flatten().filter(|m| m.file == meta);
        let seqs = store.seqs().await?;

        let (next_expected, received_bytes) = match prior {
            Some(prior) if !seqs.is_empty() => {
                let bytes = store.persisted_bytes().await?;
                let received_chunks: Vec<u32> = seqs.iter().copied().map(u32::from).collect();
                tracing::info!(byte_offset = bytes, chunks = received_chunks.len(), "resuming transfer");
                ControlMsg::ResumeFrom { byte_offset: bytes, received_chunks }
                    .send(&mut self.control_tx)
                    .await?;
                (Seq(prior.expected_seq), bytes)
            }
            _ => {
                // Stale or foreign state under the same id is discarded.
                store.delete_all().await?;
                let store = ChunkStore::open(&self.store_root, &id).await?;
                store.save_meta(Seq::ZERO, &meta).await?;
                ControlMsg::StartTransfer.send(&mut self.control_tx).await?;
                tracing::debug!(name = %meta.name, size = meta.size, "starting fresh transfer");
                (Seq::ZERO, 0)
            }
        };

        // Reopen to pick up the possibly recreated directory.
        let store = ChunkStore::open(&self.store_root, &id).await?;
        self.active = Some(Active {
            meta,
            store,
            next_expected,
            reorder: BTreeMap::new(),
            pending_ack: Vec::new(),
            received_bytes,
            remote_hash: None,
            end_seen: false,
            last_persisted: false,
            decrypt_failures: 0,
        });
        Ok(())
    }

    /// Assembles the file once END has arrived, or once the last chunk is
    /// durable and the remote digest is already known.
    ///
    /// Chunks still waiting in the reorder buffer imply holes below them;
    /// those are requested explicitly and the receiver stays in the
    /// receiving state until they are filled.
    async fn maybe_assemble(&mut self) -> Result<(), RecvError> {
        let ready = match self.active.as_ref() {
            Some(active) => {
                active.end_seen || (active.last_persisted && active.remote_hash.is_some())
            }
            None => false,
        };
        if !ready {
            return Ok(());
        }

        // Flush remaining acks so the sender can retire its window.
        self.flush_acks().await?;

        let active = self.active.as_mut().expect("active transfer checked above");

        // The store holds the gapless prefix below `next_expected` by
        // construction, so the only detectable holes lie between it and
        // whatever waits in the reorder buffer. Request those instead of
        // sitting out the sender's backoff.
        if let Some(highest) = active.reorder.keys().next_back().copied() {
            let missing: Vec<Seq> = (u32::from(active.next_expected)..=u32::from(highest))
                .map(Seq)
                .filter(|seq| !active.reorder.contains_key(seq))
                .collect();
            tracing::debug!(missing = missing.len(), "holes at assembly, back to receiving");
            self.request_retransmit(missing).await?;
            return Ok(());
        }

        let chunks = active.store.all_chunks().await?;
        let assembled: u64 = chunks.iter().map(|c| c.payload.len() as u64).sum();
        if assembled < active.meta.size {
            // The tail is still in flight; the sender's retransmission scan
            // delivers it without an explicit request.
            tracing::debug!(assembled, size = active.meta.size, "file incomplete, back to receiving");
            return Ok(());
        }

        let mut file = Vec::with_capacity(assembled as usize);
        for chunk in &chunks {
            debug_assert_eq!(chunk.offset, file.len() as u64);
            file.extend_from_slice(&chunk.payload);
        }
        let file = Bytes::from(file);

        if active.meta.size > self.cfg.verify_limit {
            tracing::info!("file exceeds verification cap, digest not checked");
            let _ = self.events.try_send(TransferEvent::IntegrityUnverified);
        } else if let Some(remote) = active.remote_hash {
            let mut digest = FileDigest::new();
            digest.update(&file);
            if digest.finalize() != remote {
                // Policy: warn and still deliver.
                tracing::warn!("integrity mismatch, delivering file anyway");
                let _ = self.events.try_send(TransferEvent::IntegrityMismatch);
            }
        }

        let name = active.meta.name.clone();
        active.store.delete_all().await?;
        self.active = None;

        let _ = self.events.try_send(TransferEvent::FileAssembled { name, bytes: file });
        self.session.completed()?;
        let _ = self.events.try_send(TransferEvent::Completed);
        tracing::info!("file assembled and delivered");
        Ok(())
    }

    async fn fail(&mut self, reason: &str) {
        self.session.failed();
        let _ = ControlMsg::Error { message: reason.to_string() }.send(&mut self.control_tx).await;
        let _ = self.events.try_send(TransferEvent::Failed { reason: reason.to_string() });
    }
}
