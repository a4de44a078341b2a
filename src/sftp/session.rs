//! SSH session handler
//!
//! Bridges russh's callback API onto the stream model of
//! [`crate::connection::transport`]: channel opens become [`IncomingChannel`]s,
//! channel requests become [`ChannelRequest`]s answered by the router, and
//! forwarding requests are drained as [`GlobalRequest`]s.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, Pty};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::credentials::CredentialVerifier;
use super::ident::IdentTap;
use crate::connection::transport::{
    ChannelDecision, ChannelRequest, Closer, GlobalRequest, IncomingChannel, Negotiator,
    SecureSession,
};
use crate::error::{HandshakeError, TransportError};

const CHANNEL_BACKLOG: usize = 16;
const REQUEST_BACKLOG: usize = 8;
const GLOBAL_BACKLOG: usize = 16;

/// How long a closed session may take to flush before its task is aborted.
const SESSION_DRAIN: Duration = Duration::from_secs(5);

/// Performs the SSH handshake with russh.
pub struct RusshNegotiator {
    config: Arc<russh::server::Config>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl RusshNegotiator {
    pub fn new(config: Arc<russh::server::Config>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { config, verifier }
    }
}

#[async_trait]
impl<S> Negotiator<S> for RusshNegotiator
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn negotiate(&self, stream: S, peer: SocketAddr) -> Result<SecureSession, HandshakeError> {
        let stream = IdentTap::new(stream);
        let client_version = stream.version();

        let (authenticated_tx, authenticated) = oneshot::channel();
        let (channel_tx, channel_rx) = mpsc::channel(CHANNEL_BACKLOG);
        let (global_tx, global_rx) = mpsc::channel(GLOBAL_BACKLOG);

        let handler = SftpSession {
            peer,
            verifier: self.verifier.clone(),
            authenticated: Some(authenticated_tx),
            channels: channel_tx,
            global_requests: global_tx,
            requests: HashMap::new(),
            channel_counter: 0,
        };

        let running = russh::server::run_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))?;
        let handle = running.handle();
        let mut join = tokio::spawn(running);

        tokio::select! {
            user = authenticated => match user {
                Ok(user) => Ok(SecureSession::new(
                    peer.to_string(),
                    user,
                    client_version.get().cloned().unwrap_or_default(),
                    channel_rx,
                    global_rx,
                    Box::new(SessionCloser { handle, join: Some(join) }),
                )),
                Err(_) => Err(session_end(join.await)),
            },
            ended = &mut join => Err(session_end(ended)),
        }
    }
}

/// Why a session that never authenticated went away.
fn session_end(
    ended: Result<Result<(), anyhow::Error>, tokio::task::JoinError>,
) -> HandshakeError {
    match ended {
        Ok(Ok(())) => HandshakeError::Unauthenticated,
        Ok(Err(e)) => HandshakeError::Transport(e.to_string()),
        Err(e) => HandshakeError::Transport(e.to_string()),
    }
}

struct SessionCloser {
    handle: Handle,
    join: Option<JoinHandle<Result<(), anyhow::Error>>>,
}

#[async_trait]
impl Closer for SessionCloser {
    async fn close(&mut self) -> Result<(), TransportError> {
        if self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed".to_string(), "en".to_string())
            .await
            .is_err()
        {
            tracing::debug!("SSH session already gone before disconnect");
        }

        if let Some(join) = self.join.take() {
            let abort = join.abort_handle();
            match tokio::time::timeout(SESSION_DRAIN, join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::debug!("SSH session ended with: {}", e),
                Ok(Err(e)) => tracing::debug!("SSH session task failed: {}", e),
                Err(_) => {
                    tracing::warn!("SSH session did not shut down in time, aborting");
                    abort.abort();
                }
            }
        }
        Ok(())
    }
}

struct ChannelCloser {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait]
impl Closer for ChannelCloser {
    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.handle.eof(self.channel).await;
        self.handle
            .close(self.channel)
            .await
            .map_err(|_| TransportError::Close {
                what: format!("channel {:?}", self.channel),
            })
    }
}

/// Per-connection russh handler.
pub struct SftpSession {
    peer: SocketAddr,
    verifier: Arc<dyn CredentialVerifier>,
    authenticated: Option<oneshot::Sender<String>>,
    channels: mpsc::Sender<IncomingChannel>,
    global_requests: mpsc::Sender<GlobalRequest>,
    requests: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
    channel_counter: u32,
}

impl SftpSession {
    /// Offers a newly opened channel to the supervisor and waits for its
    /// decision.
    async fn offer(
        &mut self,
        channel: Channel<Msg>,
        channel_type: &str,
        session: &mut Session,
    ) -> Result<bool, anyhow::Error> {
        let channel_id = channel.id();
        self.channel_counter += 1;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_BACKLOG);
        let closer = Box::new(ChannelCloser {
            handle: session.handle(),
            channel: channel_id,
        });
        let (incoming, decided) = IncomingChannel::new(
            self.channel_counter,
            channel_type,
            Box::new(channel.into_stream()),
            request_rx,
            closer,
        );

        if self.channels.send(incoming).await.is_err() {
            tracing::debug!("Connection is shutting down, refusing {} channel", channel_type);
            return Ok(false);
        }

        match decided.await {
            Ok(ChannelDecision::Accept) => {
                self.requests.insert(channel_id, request_tx);
                Ok(true)
            }
            Ok(ChannelDecision::Reject { reason, message }) => {
                // russh 0.44 answers every refused open with ADMINISTRATIVELY_PROHIBITED,
                // so the reason only reaches the log
                tracing::debug!("Refused {} channel: {} ({})", channel_type, message, reason);
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    /// Hands a channel request to the router and relays its answer.
    async fn forward(
        &mut self,
        channel: ChannelId,
        kind: &str,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let granted = match self.requests.get(&channel) {
            Some(requests) => {
                let (request, replied) = ChannelRequest::new(kind, payload);
                if requests.send(request).await.is_err() {
                    false
                } else {
                    replied.await.unwrap_or(false)
                }
            }
            None => false,
        };

        if granted {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    fn drain_global(&self, kind: &str) {
        let request = GlobalRequest {
            kind: kind.to_string(),
        };
        if self.global_requests.try_send(request).is_err() {
            tracing::debug!("Dropping global request {}", kind);
        }
    }
}

#[async_trait]
impl Handler for SftpSession {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.verifier.verify(user, password) {
            Ok(()) => {
                tracing::info!("SFTP auth successful for user: {}", user);
                if let Some(authenticated) = self.authenticated.take() {
                    let _ = authenticated.send(user.to_string());
                }
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!("SFTP auth failed from {}: {}", self.peer, e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer(channel, "session", session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("direct-tcpip to {}:{} requested", host_to_connect, port_to_connect);
        self.offer(channel, "direct-tcpip", session).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer(channel, "x11", session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        self.forward(channel, "subsystem", payload.freeze(), session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, data);
        self.forward(channel, "exec", payload.freeze(), session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, "shell", Bytes::new(), session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, variable_name.as_bytes());
        put_string(&mut payload, variable_value.as_bytes());
        self.forward(channel, "env", payload.freeze(), session).await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, term.as_bytes());
        payload.put_u32(col_width);
        payload.put_u32(row_height);
        payload.put_u32(pix_width);
        payload.put_u32(pix_height);
        // terminal modes are not carried: TTY_OP_END only
        put_string(&mut payload, &[0]);
        self.forward(channel, "pty-req", payload.freeze(), session).await
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Declining tcpip-forward for {}:{}", address, port);
        self.drain_global("tcpip-forward");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Declining cancel-tcpip-forward for {}:{}", address, port);
        self.drain_global("cancel-tcpip-forward");
        Ok(false)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel {:?} closed", channel);
        // ends the router for this channel
        self.requests.remove(&channel);
        Ok(())
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::supervisor::Supervisor;
    use crate::sftp::binder::SftpBinder;
    use crate::sftp::credentials::SharedSecret;
    use russh::client;
    use russh_keys::key;
    use tempdir::TempDir;

    struct TestClient;

    #[async_trait]
    impl client::Handler for TestClient {
        type Error = anyhow::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &key::PublicKey,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    fn server_config() -> Arc<russh::server::Config> {
        Arc::new(russh::server::Config {
            methods: russh::MethodSet::PASSWORD,
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key::KeyPair::generate_ed25519().unwrap()],
            ..Default::default()
        })
    }

    fn supervisor(root: &TempDir) -> Arc<Supervisor<RusshNegotiator, SftpBinder>> {
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(SharedSecret::new("secret"));
        let negotiator = RusshNegotiator::new(server_config(), verifier);
        Arc::new(Supervisor::new(negotiator, SftpBinder, root.path().to_path_buf()))
    }

    #[tokio::test]
    async fn test_sftp_over_ssh() {
        let root = TempDir::new("ssh_e2e").unwrap();
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let server = tokio::spawn(
            supervisor(&root).supervise(server_io, "127.0.0.1:50000".parse().unwrap()),
        );

        let config = Arc::new(client::Config::default());
        let mut ssh = client::connect_stream(config, client_io, TestClient).await.unwrap();
        assert!(ssh.authenticate_password("anyone", "secret").await.unwrap());

        // forwarding channels are refused, the connection stays usable
        let refused = ssh
            .channel_open_direct_tcpip("localhost", 80, "127.0.0.1", 5000)
            .await;
        assert!(matches!(
            refused,
            Err(russh::Error::ChannelOpenFailure(
                russh::ChannelOpenFailure::AdministrativelyProhibited
            ))
        ));

        let channel = ssh.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "sftp").await.unwrap();
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .unwrap();
        sftp.create_dir("/made-over-ssh").await.unwrap();
        assert!(root.path().join("made-over-ssh").is_dir());
        drop(sftp);

        ssh.disconnect(Disconnect::ByApplication, "", "en").await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert!(!report.handshake_failed);
        assert_eq!(report.channels, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.bound, 1);
    }

    #[tokio::test]
    async fn test_wrong_password_never_yields_a_session() {
        let root = TempDir::new("ssh_e2e").unwrap();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(
            supervisor(&root).supervise(server_io, "127.0.0.1:50001".parse().unwrap()),
        );

        let config = Arc::new(client::Config::default());
        let mut ssh = client::connect_stream(config, client_io, TestClient).await.unwrap();
        assert!(!ssh.authenticate_password("alice", "wrong").await.unwrap());
        let _ = ssh.disconnect(Disconnect::ByApplication, "", "en").await;
        drop(ssh);

        let report = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert!(report.handshake_failed);
        assert_eq!(report.channels, 0);
    }
}
