//! Deterministic test data and the paired-engine harness.
#![allow(dead_code)]

use bytes::Bytes;
use futures::StreamExt;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::SplitMix64;
use std::{
    io::Cursor,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

use codedrop::{
    crypto::KEY_LEN,
    msg::{ControlMsg, FileMeta},
    receiver::ReceiverEngine,
    sender::SenderEngine,
    transport::{sink_box, stream_box, ChannelPool, DataChannelTx, FrameStream},
    Cfg, PairingCode, RecvError, Role, SendError, Session, TransferEvent,
};

use crate::test_channel;

/// Shared test key; the handshake that derives it is out of scope.
pub const KEY: [u8; KEY_LEN] = [0xC0; KEY_LEN];

/// Deterministic pseudo-random file contents.
pub fn file_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = SplitMix64::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Builds the metadata record for a payload.
pub fn make_meta(cfg: &Cfg, name: &str, size: u64) -> FileMeta {
    let chunk = cfg.chunk_size.get() as u64;
    FileMeta {
        name: name.to_string(),
        size,
        mime: None,
        total_chunks: size.div_ceil(chunk) as u32,
        chunk_size: chunk as u32,
        encrypted: true,
    }
}

/// A sender/receiver session pair that has finished pairing and key exchange.
pub fn sessions(code: &str) -> (Session, Session) {
    sessions_with_keys(code, KEY, KEY)
}

/// A session pair whose key agreement silently diverged: both sides hold a
/// key, but not the same one.
pub fn mismatched_sessions(code: &str) -> (Session, Session) {
    sessions_with_keys(code, KEY, [0x0D; KEY_LEN])
}

fn sessions_with_keys(
    code: &str, sender_key: [u8; KEY_LEN], receiver_key: [u8; KEY_LEN],
) -> (Session, Session) {
    let code = PairingCode::parse(code).unwrap();

    let mut sender = Session::new(Role::Sender, code.clone());
    sender.offered().unwrap();
    sender.set_key(sender_key).unwrap();
    sender.peer_ready().unwrap();

    let mut receiver = Session::new(Role::Receiver, code);
    receiver.set_key(receiver_key).unwrap();
    receiver.peer_ready().unwrap();

    (sender, receiver)
}

/// Wraps a control stream, recording every decodable message passing through.
pub fn tap_control(rx: FrameStream, log: Arc<Mutex<Vec<ControlMsg>>>) -> FrameStream {
    stream_box(rx.inspect(move |frame| {
        if let Ok(buf) = frame {
            if let Ok(msg) = ControlMsg::decode(buf) {
                log.lock().unwrap().push(msg);
            }
        }
    }))
}

/// Everything observed during one paired transfer.
pub struct TransferOutcome {
    /// Sender engine result.
    pub sent: Result<(), SendError>,
    /// Receiver engine result.
    pub received: Result<(), RecvError>,
    /// The delivered file, if assembly happened.
    pub delivered: Option<Bytes>,
    /// Events emitted by the sender engine.
    pub sender_events: Vec<TransferEvent>,
    /// Events emitted by the receiver engine.
    pub receiver_events: Vec<TransferEvent>,
    /// Control messages that travelled receiver → sender.
    pub receiver_msgs: Vec<ControlMsg>,
}

impl TransferOutcome {
    /// The delivered bytes, panicking when assembly never happened.
    pub fn delivered(&self) -> &Bytes {
        self.delivered.as_ref().expect("no file was delivered")
    }

    /// Number of acknowledgement batches the receiver sent.
    pub fn ack_batches(&self) -> usize {
        self.receiver_msgs
            .iter()
            .filter(|msg| matches!(msg, ControlMsg::ChunkBatchAck { .. }))
            .count()
    }

    /// Number of retransmission requests the receiver sent.
    pub fn retransmit_requests(&self) -> usize {
        self.receiver_msgs
            .iter()
            .filter(|msg| matches!(msg, ControlMsg::RetransmitRequest { .. }))
            .count()
    }
}

/// Runs one transfer of `data` through the given per-channel network
/// profiles and collects everything observable.
pub async fn run_pair(
    cfg: Cfg, code: &str, data: Vec<u8>, data_cfgs: Vec<test_channel::Cfg>, store_root: PathBuf,
) -> TransferOutcome {
    let (sender_session, receiver_session) = sessions(code);
    run_engines(cfg, sender_session, receiver_session, data, data_cfgs, store_root).await
}

/// Like [`run_pair`], but over explicitly prepared sessions, for scenarios
/// where pairing itself went wrong.
pub async fn run_engines(
    cfg: Cfg, sender_session: Session, receiver_session: Session, data: Vec<u8>,
    data_cfgs: Vec<test_channel::Cfg>, store_root: PathBuf,
) -> TransferOutcome {
    let meta = make_meta(&cfg, "payload.bin", data.len() as u64);

    let mut channels = Vec::new();
    let mut data_streams = Vec::new();
    for (index, ch_cfg) in data_cfgs.into_iter().enumerate() {
        let (tx, rx, buffered, _control) = test_channel::channel(ch_cfg);
        channels.push(DataChannelTx::new(index, sink_box(tx), buffered));
        data_streams.push(rx);
    }

    let ((sender_ctl_tx, sender_ctl_rx), (receiver_ctl_tx, receiver_ctl_rx)) =
        test_channel::control_pair();

    let receiver_msgs = Arc::new(Mutex::new(Vec::new()));
    let sender_ctl_rx = tap_control(sender_ctl_rx, receiver_msgs.clone());

    let (sender_events_tx, mut sender_events_rx) = mpsc::channel(1024);
    let (receiver_events_tx, mut receiver_events_rx) = mpsc::channel(1024);

    let sender = SenderEngine::new(
        cfg.clone(),
        sender_session,
        meta,
        Cursor::new(data),
        ChannelPool::new(channels),
        sink_box(sender_ctl_tx),
        sender_ctl_rx,
        sender_events_tx,
    )
    .unwrap();

    let receiver = ReceiverEngine::new(
        cfg,
        receiver_session,
        store_root,
        data_streams,
        sink_box(receiver_ctl_tx),
        receiver_ctl_rx,
        receiver_events_tx,
    )
    .unwrap();

    let sender_task = tokio::spawn(sender.run());
    let receiver_task = tokio::spawn(receiver.run());

    let sent = sender_task.await.unwrap();
    let received = receiver_task.await.unwrap();

    let mut sender_events = Vec::new();
    while let Ok(event) = sender_events_rx.try_recv() {
        sender_events.push(event);
    }
    let mut receiver_events = Vec::new();
    while let Ok(event) = receiver_events_rx.try_recv() {
        receiver_events.push(event);
    }

    let delivered = receiver_events.iter().find_map(|event| match event {
        TransferEvent::FileAssembled { bytes, .. } => Some(bytes.clone()),
        _ => None,
    });

    let receiver_msgs = receiver_msgs.lock().unwrap().clone();
    TransferOutcome { sent, received, delivered, sender_events, receiver_events, receiver_msgs }
}

/// A store root unique to one test.
pub fn store_root(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("codedrop-test-{tag}-{}", std::process::id()))
}
