//! Control-channel messages.
//!
//! The control channel is ordered and reliable, so its records are small
//! self-describing JSON documents tagged by `type`, matching the signaling
//! vocabulary of the peers. Bulk data never travels here.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{fmt, io};

use crate::protocol_err;

/// Descriptor of the file being offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name as presented to the receiving user.
    pub name: String,
    /// File size in bytes.
    pub size: u64,
    /// MIME type, if known.
    pub mime: Option<String>,
    /// Advisory chunk count at the nominal chunk size.
    pub total_chunks: u32,
    /// Nominal chunk size in bytes.
    pub chunk_size: u32,
    /// Whether chunk payloads are encrypted.
    pub encrypted: bool,
}

/// A message on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMsg {
    /// File offer from the sender.
    #[serde(rename = "METADATA")]
    Metadata {
        /// File descriptor.
        #[serde(flatten)]
        file: FileMeta,
    },
    /// Receiver has no prior state; send from the beginning.
    #[serde(rename = "START_TRANSFER")]
    StartTransfer,
    /// Receiver holds persisted chunks; continue from the given offset.
    #[serde(rename = "RESUME_FROM")]
    ResumeFrom {
        /// Number of bytes already durably persisted.
        byte_offset: u64,
        /// Sequence numbers already persisted.
        received_chunks: Vec<u32>,
    },
    /// Batched acknowledgement of durably persisted chunks.
    #[serde(rename = "CHUNK_BATCH_ACK")]
    ChunkBatchAck {
        /// Acknowledged sequence numbers.
        sequences: Vec<u32>,
        /// Total bytes persisted so far.
        received_bytes: u64,
    },
    /// Request to resend the listed chunks.
    #[serde(rename = "RETRANSMIT_REQUEST")]
    RetransmitRequest {
        /// Sequence numbers to resend.
        sequences: Vec<u32>,
    },
    /// Opaque key-agreement material, relayed for the external handshake.
    #[serde(rename = "KEY")]
    Key {
        /// Key agreement payload.
        payload: Vec<u8>,
    },
    /// Peer is ready to transfer.
    #[serde(rename = "READY")]
    Ready,
    /// Encrypted SHA-256 digest of the full plaintext, sent after the last chunk.
    #[serde(rename = "HASH")]
    Hash {
        /// Fresh random AEAD nonce.
        nonce: Vec<u8>,
        /// Encrypted digest.
        cipher: Vec<u8>,
    },
    /// No more chunks will be sent.
    #[serde(rename = "END")]
    End,
    /// Protocol-level failure; the session terminates on both sides.
    #[serde(rename = "ERROR")]
    Error {
        /// Human-readable reason.
        message: String,
    },
    /// Keepalive request. Prevents NAT mappings from expiring while idle.
    #[serde(rename = "ping")]
    Ping,
    /// Keepalive response.
    #[serde(rename = "pong")]
    Pong,
}

/// A control message could not be decoded.
#[derive(Debug)]
pub struct MsgError(serde_json::Error);

impl fmt::Display for MsgError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid control message: {}", self.0)
    }
}

impl std::error::Error for MsgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<MsgError> for io::Error {
    fn from(err: MsgError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

impl ControlMsg {
    /// Encodes the message for the control channel.
    pub fn encode(&self) -> Bytes {
        serde_json::to_vec(self).expect("control message serialization cannot fail").into()
    }

    /// Decodes a control channel message.
    pub fn decode(src: &[u8]) -> Result<Self, MsgError> {
        serde_json::from_slice(src).map_err(MsgError)
    }

    /// Sends the message over a control channel sink.
    pub async fn send<S>(&self, tx: &mut S) -> Result<(), io::Error>
    where
        S: Sink<Bytes, Error = io::Error> + Unpin,
    {
        tx.send(self.encode()).await
    }

    /// Receives the next message from a control channel stream.
    ///
    /// Returns `None` when the channel has been closed by the peer.
    pub async fn recv<S>(rx: &mut S) -> Result<Option<Self>, io::Error>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        match rx.next().await {
            Some(buf) => {
                let buf = buf?;
                let msg =
                    Self::decode(&buf).map_err(|err| protocol_err!("control channel: {err}"))?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
