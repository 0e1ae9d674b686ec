//! Session identity and state machine.
//!
//! A session pairs exactly two endpoints through a short code and carries at
//! most one transfer. The state machine gates the engines: data may not flow
//! before the shared key exists, and terminal states are final.

use rand::{rngs::OsRng, Rng};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::crypto::KEY_LEN;

/// Role of this endpoint within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Offers the file.
    Sender,
    /// Receives the file.
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

/// Number of characters in a pairing code.
pub const CODE_LEN: usize = 6;

/// The 6-character pairing code routed by the signaling service.
///
/// The code is opaque and case-sensitive; possession of it is the only
/// authentication between the peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    /// Generates a fresh numeric code.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let code: String = (0..CODE_LEN).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect();
        Self(code)
    }

    /// Validates a code entered by the user.
    pub fn parse(code: &str) -> Result<Self, SessionError> {
        if code.chars().count() != CODE_LEN || code.chars().any(char::is_whitespace) {
            return Err(SessionError::InvalidCode);
        }
        Ok(Self(code.to_string()))
    }

    /// The code as entered.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a resumable transfer: pairing code, file name and
/// file size concatenated.
///
/// The receiver keys its persisted chunks by this, so a transfer interrupted
/// by a crash is recognized when the same offer arrives again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferId(String);

impl TransferId {
    /// Builds the identifier from its components.
    pub fn new(code: &PairingCode, file_name: &str, file_size: u64) -> Self {
        Self(format!("{}{}{}", code.as_str(), file_name, file_size))
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe key for the store directory of this transfer.
    pub fn storage_key(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing has happened yet.
    Idle,
    /// The sender posted its offer and waits for a peer (sender only).
    Waiting,
    /// Both peers are paired and the shared key is derived.
    Ready,
    /// Chunks are flowing.
    Transferring,
    /// The transfer finished and was verified as far as policy allows.
    Completed,
    /// The session failed terminally.
    Failed,
}

impl SessionState {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Waiting => write!(f, "waiting"),
            Self::Ready => write!(f, "ready"),
            Self::Transferring => write!(f, "transferring"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A session-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    /// The pairing code is not a valid 6-character code.
    InvalidCode,
    /// The requested transition is not allowed from the current state.
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// Transition that was attempted.
        attempted: &'static str,
    },
    /// Data was about to flow before a shared key was derived.
    KeyMissing,
    /// A second key was offered within the same session.
    KeyAlreadySet,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidCode => write!(f, "pairing code must be {CODE_LEN} characters"),
            Self::InvalidTransition { from, attempted } => {
                write!(f, "cannot {attempted} while {from}")
            }
            Self::KeyMissing => write!(f, "no shared key for this session"),
            Self::KeyAlreadySet => write!(f, "session key must be fresh per session"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One transfer session.
///
/// Owned by the engine task of the endpoint; all mutation goes through the
/// transition methods, which reject anything the state machine forbids.
pub struct Session {
    role: Role,
    code: PairingCode,
    state: SessionState,
    key: Option<[u8; KEY_LEN]>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("code", &self.code)
            .field("state", &self.state)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl Session {
    /// Creates an idle session.
    pub fn new(role: Role, code: PairingCode) -> Self {
        Self { role, code, state: SessionState::Idle, key: None }
    }

    /// This endpoint's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The pairing code.
    pub fn code(&self) -> &PairingCode {
        &self.code
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Shared AEAD key, once derived.
    pub fn key(&self) -> Result<&[u8; KEY_LEN], SessionError> {
        self.key.as_ref().ok_or(SessionError::KeyMissing)
    }

    /// The sender posted its offer to the signaling service.
    pub fn offered(&mut self) -> Result<(), SessionError> {
        match (self.role, self.state) {
            (Role::Sender, SessionState::Idle) => {
                self.state = SessionState::Waiting;
                Ok(())
            }
            _ => Err(self.bad("offer")),
        }
    }

    /// Installs the freshly derived shared key. Exactly once per session.
    pub fn set_key(&mut self, key: [u8; KEY_LEN]) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(self.bad("set key"));
        }
        if self.key.is_some() {
            return Err(SessionError::KeyAlreadySet);
        }
        self.key = Some(key);
        Ok(())
    }

    /// The peer signalled readiness and the key exchange finished.
    pub fn peer_ready(&mut self) -> Result<(), SessionError> {
        let from_ok = match self.role {
            Role::Sender => self.state == SessionState::Waiting,
            Role::Receiver => self.state == SessionState::Idle,
        };
        if !from_ok {
            return Err(self.bad("become ready"));
        }
        if self.key.is_none() {
            return Err(SessionError::KeyMissing);
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Metadata was exchanged and chunks are about to flow.
    ///
    /// Refused while the shared key is missing; the nonce discipline depends
    /// on a fresh key per transfer.
    pub fn transferring(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(self.bad("start transferring"));
        }
        if self.key.is_none() {
            return Err(SessionError::KeyMissing);
        }
        self.state = SessionState::Transferring;
        Ok(())
    }

    /// The transfer finished.
    pub fn completed(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Transferring {
            return Err(self.bad("complete"));
        }
        self.state = SessionState::Completed;
        Ok(())
    }

    /// Any state may fail; failing is idempotent but cannot leave Completed.
    pub fn failed(&mut self) {
        if self.state != SessionState::Completed {
            self.state = SessionState::Failed;
        }
    }

    fn bad(&self, attempted: &'static str) -> SessionError {
        SessionError::InvalidTransition { from: self.state, attempted }
    }
}

/// User-visible events emitted by the engines.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransferEvent {
    /// Bytes acknowledged (sender) or persisted (receiver) so far.
    Progress {
        /// Bytes done.
        bytes: u64,
        /// File size.
        total: u64,
    },
    /// A chunk crossed the soft retry limit; the transfer continues.
    RetryWarning {
        /// Affected sequence number.
        seq: u32,
        /// Retries so far.
        retries: u32,
    },
    /// The receiver assembled the file.
    FileAssembled {
        /// File name from the metadata.
        name: String,
        /// The reconstructed bytes.
        bytes: bytes::Bytes,
    },
    /// Digest comparison failed; the file was still delivered.
    IntegrityMismatch,
    /// The file exceeded the verification cap, so the digest was not checked.
    IntegrityUnverified,
    /// The transfer completed.
    Completed,
    /// The transfer failed terminally.
    Failed {
        /// Reason.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_LEN] {
        [7; KEY_LEN]
    }

    #[test]
    fn code_validation() {
        assert!(PairingCode::parse("abc123").is_ok());
        assert!(PairingCode::parse("abc12").is_err());
        assert!(PairingCode::parse("abc 12").is_err());
        assert_eq!(PairingCode::generate().as_str().len(), CODE_LEN);
    }

    #[test]
    fn transfer_id_concatenates() {
        let code = PairingCode::parse("XY99zz").unwrap();
        let id = TransferId::new(&code, "report.pdf", 1024);
        assert_eq!(id.as_str(), "XY99zzreport.pdf1024");
        assert_eq!(id.storage_key().len(), 16);
    }

    #[test]
    fn sender_walks_the_happy_path() {
        let mut s = Session::new(Role::Sender, PairingCode::generate());
        s.offered().unwrap();
        s.set_key(key()).unwrap();
        s.peer_ready().unwrap();
        s.transferring().unwrap();
        s.completed().unwrap();
        assert!(s.state().is_terminal());
    }

    #[test]
    fn receiver_skips_waiting() {
        let mut s = Session::new(Role::Receiver, PairingCode::generate());
        assert!(s.offered().is_err());
        s.set_key(key()).unwrap();
        s.peer_ready().unwrap();
        assert_eq!(s.state(), SessionState::Ready);
    }

    #[test]
    fn data_is_refused_without_key() {
        let mut s = Session::new(Role::Sender, PairingCode::generate());
        s.offered().unwrap();
        assert_eq!(s.peer_ready(), Err(SessionError::KeyMissing));
        assert_eq!(s.key().err(), Some(SessionError::KeyMissing));
    }

    #[test]
    fn key_is_fresh_per_session() {
        let mut s = Session::new(Role::Receiver, PairingCode::generate());
        s.set_key(key()).unwrap();
        assert_eq!(s.set_key(key()), Err(SessionError::KeyAlreadySet));
    }

    #[test]
    fn failed_is_sticky_but_not_after_completed() {
        let mut s = Session::new(Role::Receiver, PairingCode::generate());
        s.set_key(key()).unwrap();
        s.peer_ready().unwrap();
        s.transferring().unwrap();
        s.completed().unwrap();
        s.failed();
        assert_eq!(s.state(), SessionState::Completed);
    }
}
