//
// Copyright 2025 codedrop contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Reliable, encrypted, resumable file transfer between two paired peers.
//!
//! Codedrop ships arbitrarily large files directly between two endpoints
//! that share a short pairing code. It layers a reliable, ordered,
//! authenticated byte stream over datagram-shaped transport channels that
//! may drop, duplicate and reorder messages: a sliding-window sender with
//! selective retransmission and exponential backoff on one side, a reorder
//! buffer with batched selective acknowledgements and durable persistence on
//! the other.
//!
//! Every chunk is sealed with AES-256-GCM under a nonce derived from its
//! sequence number, so retransmissions are stateless and nonces never travel
//! on the wire; a streaming SHA-256 digest over the whole plaintext closes
//! the transfer end to end. The receiver persists chunks before
//! acknowledging them, which lets a transfer survive a crash and resume from
//! the persisted byte offset when the same offer reappears.
//!
//! # Transport requirements
//!
//! The engine never opens sockets. The application provides:
//!
//! * one **control channel**: ordered, reliable, message-oriented, used for
//!   small JSON records (offers, acknowledgements, the encrypted digest);
//! * one or more **data channels**: message-oriented with no ordering or
//!   delivery guarantee required, each exposing a buffered-amount signal for
//!   backpressure.
//!
//! WebRTC data channels fit this shape directly; the integration tests run
//! the same engines over in-memory channels with configurable loss,
//! reordering and jitter.
//!
//! # Pairing and key agreement
//!
//! Rendezvous of the two peers and the Diffie-Hellman handshake are external
//! collaborators (see the `codedrop-signal` crate for the signaling client).
//! The engine consumes the derived 256-bit key as opaque bytes and refuses
//! to move data before it is installed; a fresh key per session is what
//! makes the deterministic nonce discipline sound.

pub mod cfg;
pub mod crypto;
pub mod flow;
pub mod frame;
pub mod msg;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod session;
pub mod store;
pub mod transport;

/// Transfer protocol error as [`std::io::Error`].
macro_rules! protocol_err {
    ($($t:tt)*) => {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!($($t)*))
    };
}

pub(crate) use protocol_err;

pub use cfg::Cfg;
pub use receiver::{ReceiverEngine, RecvError};
pub use sender::{SendError, SenderEngine};
pub use seq::Seq;
pub use session::{PairingCode, Role, Session, SessionState, TransferEvent, TransferId};
