#![warn(missing_docs)]

//! Codedrop signaling client.
//!
//! The signaling service pairs two peers that share a code and relays their
//! SDP descriptions and ICE candidates; it never sees file data. This crate
//! implements the client side of that surface: the REST endpoints used for
//! the initial offer/answer exchange and the per-session WebSocket that
//! carries candidates, readiness and completion notifications.
//!
//! The server keeps a session alive across WebSocket drops until it is
//! completed or both peers disappear, so the socket connects with a bounded
//! retry budget; a transfer interrupted by a reconnect resumes from the
//! receiver's persisted state.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tokio::{net::TcpStream, time::sleep};
use tokio_tungstenite::{
    connect_async, tungstenite, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use codedrop::{PairingCode, Role};

/// A signaling operation failed.
#[derive(Debug)]
#[non_exhaustive]
pub enum SignalError {
    /// HTTP request failed.
    Http(reqwest::Error),
    /// WebSocket failure.
    Ws(tungstenite::Error),
    /// The server answered with an error message.
    Server(String),
    /// A URL could not be built from the configured base.
    InvalidUrl(url::ParseError),
    /// A message could not be encoded or decoded.
    Json(serde_json::Error),
    /// The socket was closed by the server.
    Closed,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "signaling HTTP error: {err}"),
            Self::Ws(err) => write!(f, "signaling socket error: {err}"),
            Self::Server(msg) => write!(f, "signaling server error: {msg}"),
            Self::InvalidUrl(err) => write!(f, "invalid signaling URL: {err}"),
            Self::Json(err) => write!(f, "invalid signaling message: {err}"),
            Self::Closed => write!(f, "signaling socket closed"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(err) => Some(err),
            Self::Ws(err) => Some(err),
            Self::InvalidUrl(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SignalError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err)
    }
}

impl From<tungstenite::Error> for SignalError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Ws(err)
    }
}

impl From<url::ParseError> for SignalError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err)
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// An SDP description exchanged through the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpDescription {
    /// The SDP body.
    pub sdp: String,
    /// `offer` or `answer`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Session information returned for a pairing code.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Server-side session status: `waiting`, `connecting`, `connected` or `completed`.
    pub status: String,
    /// The sender's offer, present while the session is `waiting`.
    pub offer: Option<SdpDescription>,
}

/// Result of the server liveness probe.
#[derive(Debug, Clone, Deserialize)]
pub struct Health {
    /// Reported status, `ok` when healthy.
    pub status: String,
    /// Number of sessions the server is tracking.
    #[serde(default)]
    pub active_sessions: u64,
}

/// A message on the signaling WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMsg {
    /// An ICE candidate from the other peer.
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        /// Opaque candidate payload, relayed verbatim.
        candidate: serde_json::Value,
    },
    /// The other peer is ready to transfer.
    #[serde(rename = "peer_ready")]
    PeerReady {
        /// Optional server-provided note.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// This peer announces readiness.
    #[serde(rename = "transfer_ready")]
    TransferReady,
    /// The transfer finished successfully.
    #[serde(rename = "transfer_complete")]
    TransferComplete,
    /// The transfer failed.
    #[serde(rename = "transfer_failed")]
    TransferFailed,
    /// The receiver's answer, pushed to the sender.
    #[serde(rename = "answer")]
    Answer {
        /// The SDP answer.
        answer: SdpDescription,
    },
    /// Server-side error.
    #[serde(rename = "error")]
    Error {
        /// Reason.
        message: String,
    },
    /// Keepalive request.
    #[serde(rename = "ping")]
    Ping,
    /// Keepalive response.
    #[serde(rename = "pong")]
    Pong,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Sender => "sender",
        Role::Receiver => "receiver",
    }
}

#[derive(Debug, Deserialize)]
struct ServerReply {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

impl ServerReply {
    fn check(self) -> Result<Self, SignalError> {
        match self.error {
            Some(error) => Err(SignalError::Server(error)),
            None => Ok(self),
        }
    }
}

/// REST client for the signaling service.
#[derive(Debug, Clone)]
pub struct SignalClient {
    http: reqwest::Client,
    base: Url,
}

impl SignalClient {
    /// Creates a client for the service at `base`, e.g. `https://drop.example.org`.
    pub fn new(base: &str) -> Result<Self, SignalError> {
        Ok(Self { http: reqwest::Client::new(), base: Url::parse(base)? })
    }

    fn api(&self, path: &str) -> Result<Url, SignalError> {
        Ok(self.base.join(path)?)
    }

    /// Probes server liveness before creating a session.
    pub async fn health(&self) -> Result<Health, SignalError> {
        Ok(self.http.get(self.api("/api/health")?).send().await?.json().await?)
    }

    /// Creates a session around the sender's offer.
    ///
    /// The server issues a fresh 6-digit code when none is supplied.
    pub async fn create_session(
        &self, offer: &SdpDescription, code: Option<&PairingCode>,
    ) -> Result<PairingCode, SignalError> {
        let body = serde_json::json!({
            "code": code.map(|c| c.as_str()),
            "sdp": offer.sdp,
            "type": offer.kind,
        });
        let reply: ServerReply = self
            .http
            .post(self.api("/api/session")?)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        let reply = reply.check()?;
        let code = reply.code.ok_or_else(|| SignalError::Server("no code issued".into()))?;
        PairingCode::parse(&code).map_err(|err| SignalError::Server(err.to_string()))
    }

    /// Fetches the session behind a code, yielding the sender's offer while
    /// the session is still waiting.
    pub async fn fetch_session(&self, code: &PairingCode) -> Result<SessionInfo, SignalError> {
        let url = self.api(&format!("/api/session/{}", code.as_str()))?;
        let value: serde_json::Value = self.http.get(url).send().await?.json().await?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(SignalError::Server(error.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Posts the receiver's answer.
    pub async fn post_answer(
        &self, code: &PairingCode, answer: &SdpDescription,
    ) -> Result<(), SignalError> {
        let url = self.api(&format!("/api/session/{}/answer", code.as_str()))?;
        let reply: ServerReply = self.http.post(url).json(answer).send().await?.json().await?;
        reply.check().map(|_| ())
    }

    /// Posts an ICE candidate over REST; the fallback path when the
    /// WebSocket is not yet connected.
    pub async fn post_ice(
        &self, code: &PairingCode, role: Role, candidate: &serde_json::Value,
    ) -> Result<(), SignalError> {
        let url = self.api(&format!("/api/session/{}/ice", code.as_str()))?;
        let body = serde_json::json!({ "candidate": candidate, "role": role_str(role) });
        let reply: ServerReply = self.http.post(url).json(&body).send().await?.json().await?;
        reply.check().map(|_| ())
    }
}

/// The per-session signaling WebSocket.
pub struct SignalSocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl fmt::Debug for SignalSocket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalSocket").finish_non_exhaustive()
    }
}

impl SignalSocket {
    /// Connects the socket for `code` in the given role.
    ///
    /// `base` is the WebSocket base URL, e.g. `wss://drop.example.org`.
    pub async fn connect(base: &str, code: &PairingCode, role: Role) -> Result<Self, SignalError> {
        let url = Url::parse(base)?.join(&format!("/ws/{}/{}", code.as_str(), role_str(role)))?;
        let (ws, _response) = connect_async(url.as_str()).await?;
        tracing::debug!(%url, "signaling socket connected");
        Ok(Self { ws })
    }

    /// Connects with a bounded retry budget, for reconnecting after a drop.
    pub async fn connect_with_retry(
        base: &str, code: &PairingCode, role: Role, attempts: usize, delay: Duration,
    ) -> Result<Self, SignalError> {
        let mut last = None;
        for attempt in 0..attempts.max(1) {
            match Self::connect(base, code, role).await {
                Ok(socket) => return Ok(socket),
                Err(err) => {
                    tracing::debug!(attempt, "signaling reconnect failed: {err}");
                    last = Some(err);
                    sleep(delay).await;
                }
            }
        }
        Err(last.unwrap_or(SignalError::Closed))
    }

    /// Sends one message.
    pub async fn send(&mut self, msg: &SignalMsg) -> Result<(), SignalError> {
        let text = serde_json::to_string(msg)?;
        self.ws.send(tungstenite::Message::Text(text)).await?;
        Ok(())
    }

    /// Sends a keepalive ping.
    ///
    /// The application drives this on its heartbeat interval; the server
    /// drops sessions that stay silent past its idle budget.
    pub async fn heartbeat(&mut self) -> Result<(), SignalError> {
        self.send(&SignalMsg::Ping).await
    }

    /// Receives the next message.
    ///
    /// Server keepalive pings are answered transparently and not surfaced;
    /// everything else is returned to the caller.
    pub async fn recv(&mut self) -> Result<SignalMsg, SignalError> {
        loop {
            let msg = self.ws.next().await.ok_or(SignalError::Closed)??;
            match msg {
                tungstenite::Message::Text(text) => {
                    let msg: SignalMsg = serde_json::from_str(&text)?;
                    if msg == SignalMsg::Ping {
                        self.send(&SignalMsg::Pong).await?;
                        continue;
                    }
                    return Ok(msg);
                }
                tungstenite::Message::Ping(payload) => {
                    self.ws.send(tungstenite::Message::Pong(payload)).await?;
                }
                tungstenite::Message::Close(_) => return Err(SignalError::Closed),
                _ => continue,
            }
        }
    }

    /// Closes the socket.
    pub async fn close(mut self) -> Result<(), SignalError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_wire_vocabulary() {
        let msg = SignalMsg::TransferReady;
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"type":"transfer_ready"}"#);

        let parsed: SignalMsg = serde_json::from_str(r#"{"type":"peer_ready","message":"Ready to transfer"}"#).unwrap();
        assert_eq!(parsed, SignalMsg::PeerReady { message: Some("Ready to transfer".into()) });

        let parsed: SignalMsg = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed, SignalMsg::Ping);
    }

    #[test]
    fn candidate_payload_is_opaque() {
        let candidate = serde_json::json!({"candidate": "candidate:1 1 UDP 2122", "sdpMid": "0"});
        let msg = SignalMsg::IceCandidate { candidate: candidate.clone() };
        let json = serde_json::to_string(&msg).unwrap();
        let back: SignalMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SignalMsg::IceCandidate { candidate });
    }

    #[test]
    fn server_error_reply_is_surfaced() {
        let reply: ServerReply = serde_json::from_str(r#"{"error":"Session not found"}"#).unwrap();
        match reply.check() {
            Err(SignalError::Server(msg)) => assert_eq!(msg, "Session not found"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn reply_fields_are_optional() {
        let reply: ServerReply =
            serde_json::from_str(r#"{"code":"123456","status":"created"}"#).unwrap();
        let reply = reply.check().unwrap();
        assert_eq!(reply.code.as_deref(), Some("123456"));
        assert_eq!(reply.status.as_deref(), Some("created"));
    }
}
