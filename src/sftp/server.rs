//! SFTP listener loop
//!
//! Accepts raw connections and hands each one to its own supervisor task.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;
use uuid::Uuid;

use crate::connection::subsystem::SubsystemBinder;
use crate::connection::supervisor::Supervisor;
use crate::connection::transport::Negotiator;
use crate::error::ServerError;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// errno values shared by Linux and the BSDs
const EBADF: i32 = 9;
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// Source of raw connections.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok((stream, peer))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Out of descriptors; retrying right away would spin.
    Exhausted,
    /// The listener itself is unusable.
    Fatal,
    /// Concerns only the connection being accepted.
    Transient,
}

fn classify(e: &io::Error) -> AcceptFailure {
    match e.raw_os_error() {
        Some(EMFILE) | Some(ENFILE) | Some(ENOBUFS) | Some(ENOMEM) => AcceptFailure::Exhausted,
        Some(EBADF) => AcceptFailure::Fatal,
        _ if e.kind() == io::ErrorKind::OutOfMemory => AcceptFailure::Exhausted,
        _ if e.kind() == io::ErrorKind::InvalidInput => AcceptFailure::Fatal,
        _ => AcceptFailure::Transient,
    }
}

/// Accepts connections until the listener becomes unusable.
pub async fn run<A, N, B>(
    mut acceptor: A,
    supervisor: Arc<Supervisor<N, B>>,
) -> Result<(), ServerError>
where
    A: Acceptor,
    N: Negotiator<A::Stream> + 'static,
    B: SubsystemBinder + 'static,
{
    let mut backoff: Option<Duration> = None;

    loop {
        let (stream, peer) = match acceptor.accept().await {
            Ok(accepted) => accepted,
            Err(e) => match classify(&e) {
                AcceptFailure::Fatal => {
                    tracing::error!("SFTP listener failed: {}", e);
                    return Err(ServerError::Listener(e));
                }
                AcceptFailure::Exhausted => {
                    let delay = backoff.map_or(MIN_BACKOFF, |d| (d * 2).min(MAX_BACKOFF));
                    backoff = Some(delay);
                    tracing::warn!("Failed to accept SFTP connection: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                AcceptFailure::Transient => {
                    tracing::error!("Failed to accept SFTP connection: {}", e);
                    continue;
                }
            },
        };
        backoff = None;

        let span = tracing::info_span!("conn", id = %Uuid::new_v4(), %peer);
        let supervisor = supervisor.clone();
        tokio::spawn(
            async move {
                tracing::info!("SFTP connection from: {}", peer);
                let report = supervisor.supervise(stream, peer).await;
                tracing::info!(
                    "SFTP session ended for {} ({} channels, {} served, {} failed)",
                    peer,
                    report.channels,
                    report.served,
                    report.failed
                );
            }
            .instrument(span),
        );
    }
}
