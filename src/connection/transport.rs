//! Transport-neutral view of an authenticated connection
//!
//! The russh bridge (and the in-memory fakes used by tests) produce these
//! types; the supervisor, gatekeeper and router only ever see them.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{HandshakeError, TransportError};

/// Byte stream of an accepted channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelIo for T {}

pub type ChannelStream = ReceiverStream<IncomingChannel>;
pub type GlobalRequestStream = ReceiverStream<GlobalRequest>;
pub type RequestStream = ReceiverStream<ChannelRequest>;

/// Performs the secure-transport handshake over a raw byte stream.
#[async_trait]
pub trait Negotiator<S: Send + 'static>: Send + Sync {
    async fn negotiate(&self, stream: S, peer: SocketAddr) -> Result<SecureSession, HandshakeError>;
}

/// Releases a transport resource (a whole session or a single channel).
#[async_trait]
pub trait Closer: Send {
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Runs a [`Closer`] at most once.
///
/// Dropping an unclosed guard schedules the close on the current runtime, so
/// early returns and panics still release the resource.
pub struct CloseGuard {
    what: String,
    closer: Option<Box<dyn Closer>>,
}

impl CloseGuard {
    pub fn new(what: impl Into<String>, closer: Box<dyn Closer>) -> Self {
        Self {
            what: what.into(),
            closer: Some(closer),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut closer) = self.closer.take() {
            if let Err(e) = closer.close().await {
                tracing::debug!("{} already gone: {}", self.what, e);
            }
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(mut closer) = self.closer.take() {
            let what = std::mem::take(&mut self.what);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = closer.close().await {
                            tracing::debug!("deferred close of {} failed: {}", what, e);
                        }
                    });
                }
                Err(_) => tracing::warn!("{} dropped outside a runtime, not closed", what),
            }
        }
    }
}

/// An authenticated, multiplexed connection.
pub struct SecureSession {
    pub remote: String,
    pub user: String,
    pub client_version: String,
    pub channels: ChannelStream,
    pub global_requests: GlobalRequestStream,
    guard: CloseGuard,
}

impl SecureSession {
    pub fn new(
        remote: String,
        user: String,
        client_version: String,
        channels: mpsc::Receiver<IncomingChannel>,
        global_requests: mpsc::Receiver<GlobalRequest>,
        closer: Box<dyn Closer>,
    ) -> Self {
        let guard = CloseGuard::new(format!("session {}", remote), closer);
        Self {
            remote,
            user,
            client_version,
            channels: ReceiverStream::new(channels),
            global_requests: ReceiverStream::new(global_requests),
            guard,
        }
    }

    /// Splits off the streams, keeping only the close guard.
    pub fn into_parts(self) -> (ChannelStream, GlobalRequestStream, SessionGuard) {
        let SecureSession {
            remote,
            channels,
            global_requests,
            guard,
            ..
        } = self;
        (channels, global_requests, SessionGuard { remote, guard })
    }
}

/// Close handle of a [`SecureSession`] whose streams have been split off.
pub struct SessionGuard {
    pub remote: String,
    guard: CloseGuard,
}

impl SessionGuard {
    pub async fn close(&mut self) {
        self.guard.close().await;
    }
}

/// SSH channel-open failure reasons (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownChannelType = 3,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::UnknownChannelType => "unknown channel type",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDecision {
    Accept,
    Reject { reason: RejectReason, message: String },
}

/// A channel the peer asked to open. Consumed by exactly one of
/// [`accept`](Self::accept) or [`reject`](Self::reject).
pub struct IncomingChannel {
    id: u32,
    channel_type: String,
    io: Box<dyn ChannelIo>,
    requests: mpsc::Receiver<ChannelRequest>,
    closer: Box<dyn Closer>,
    decision: oneshot::Sender<ChannelDecision>,
}

impl IncomingChannel {
    /// Returns the channel and the receiver the transport waits on for the
    /// accept/reject decision.
    pub fn new(
        id: u32,
        channel_type: impl Into<String>,
        io: Box<dyn ChannelIo>,
        requests: mpsc::Receiver<ChannelRequest>,
        closer: Box<dyn Closer>,
    ) -> (Self, oneshot::Receiver<ChannelDecision>) {
        let (decision, decided) = oneshot::channel();
        let channel = Self {
            id,
            channel_type: channel_type.into(),
            io,
            requests,
            closer,
            decision,
        };
        (channel, decided)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn accept(self) -> Result<Session, TransportError> {
        self.decision
            .send(ChannelDecision::Accept)
            .map_err(|_| TransportError::AcceptFailed)?;

        Ok(Session {
            id: self.id,
            io: Some(self.io),
            requests: Some(ReceiverStream::new(self.requests)),
            guard: CloseGuard::new(format!("channel {}", self.id), self.closer),
        })
    }

    /// Rejection never touches the parent session; a transport that already
    /// went away simply never sees it.
    pub fn reject(self, reason: RejectReason, message: &str) {
        let _ = self.decision.send(ChannelDecision::Reject {
            reason,
            message: message.to_string(),
        });
    }
}

/// An accepted channel.
pub struct Session {
    id: u32,
    io: Option<Box<dyn ChannelIo>>,
    requests: Option<RequestStream>,
    guard: CloseGuard,
}

impl Session {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn take_io(&mut self) -> Option<Box<dyn ChannelIo>> {
        self.io.take()
    }

    pub fn take_requests(&mut self) -> Option<RequestStream> {
        self.requests.take()
    }

    /// Idempotent.
    pub async fn close(&mut self) {
        self.io = None;
        self.guard.close().await;
    }
}

/// A channel-scoped request such as `subsystem` or `exec`.
pub struct ChannelRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>, payload: Bytes) -> (Self, oneshot::Receiver<bool>) {
        let (reply, replied) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            payload,
            reply: Some(reply),
        };
        (request, replied)
    }

    pub fn reply(mut self, ok: bool) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(ok);
        }
    }
}

impl Drop for ChannelRequest {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(false);
        }
    }
}

/// A connection-scoped request. Drained and discarded.
#[derive(Debug, Clone)]
pub struct GlobalRequest {
    pub kind: String,
}

#[cfg(test)]
impl CloseGuard {
    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }
}

#[cfg(test)]
impl Session {
    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_session_close_runs_once() {
        let (incoming, peer) = fake_channel(1, "session");
        let mut session = incoming.accept().unwrap();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert_eq!(peer.closes.count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_is_closed() {
        let (incoming, peer) = fake_channel(2, "session");
        let session = incoming.accept().unwrap();
        drop(session);
        for _ in 0..50 {
            if peer.closes.count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(peer.closes.count(), 1);
    }

    #[tokio::test]
    async fn test_accept_fails_when_transport_gone() {
        let (incoming, peer) = fake_channel(3, "session");
        drop(peer.decided);
        assert!(matches!(incoming.accept(), Err(TransportError::AcceptFailed)));
    }

    #[tokio::test]
    async fn test_dropped_request_answers_negatively() {
        let (request, replied) = ChannelRequest::new("exec", Bytes::new());
        drop(request);
        assert_eq!(replied.await, Ok(false));
    }

    #[test]
    fn test_reject_reason_code() {
        assert_eq!(RejectReason::UnknownChannelType as u32, 3);
        assert_eq!(RejectReason::UnknownChannelType.to_string(), "unknown channel type");
    }
}
