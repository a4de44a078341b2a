//! Connection supervisor
//!
//! Owns one accepted connection from handshake to teardown. Every channel gets
//! its own task; a channel's failure ends that task only.

use futures::StreamExt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;

use super::gatekeeper::{self, Admission};
use super::router;
use super::subsystem::{SubsystemBinder, SubsystemServer};
use super::transport::{GlobalRequestStream, IncomingChannel, Negotiator, Session};

/// How a single channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    Rejected,
    AcceptFailed,
    /// Accepted, but the request stream ended without a granted subsystem.
    Idle,
    BuildFailed,
    Served,
    ServeFailed,
}

/// Per-connection tally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionReport {
    pub handshake_failed: bool,
    pub channels: usize,
    pub rejected: usize,
    pub accept_failures: usize,
    pub idle: usize,
    pub build_failures: usize,
    pub bound: usize,
    pub served: usize,
    pub failed: usize,
}

impl ConnectionReport {
    fn record(&mut self, joined: Result<ChannelOutcome, JoinError>) {
        match joined {
            Ok(ChannelOutcome::Rejected) => self.rejected += 1,
            Ok(ChannelOutcome::AcceptFailed) => self.accept_failures += 1,
            Ok(ChannelOutcome::Idle) => self.idle += 1,
            Ok(ChannelOutcome::BuildFailed) => self.build_failures += 1,
            Ok(ChannelOutcome::Served) => {
                self.bound += 1;
                self.served += 1;
            }
            Ok(ChannelOutcome::ServeFailed) => {
                self.bound += 1;
                self.failed += 1;
            }
            Err(e) => {
                tracing::error!("Channel task aborted: {}", e);
                self.failed += 1;
            }
        }
    }
}

/// Read-only state shared by every connection.
pub struct Supervisor<N, B> {
    negotiator: N,
    binder: Arc<B>,
    root: Arc<PathBuf>,
}

impl<N, B> Supervisor<N, B>
where
    B: SubsystemBinder + 'static,
{
    pub fn new(negotiator: N, binder: B, root: PathBuf) -> Self {
        Self {
            negotiator,
            binder: Arc::new(binder),
            root: Arc::new(root),
        }
    }

    /// Runs one connection to completion.
    ///
    /// The raw stream is handed to the negotiator and dropped there when the
    /// handshake fails. Once a session exists it is closed exactly once, after
    /// the peer stops opening channels.
    pub async fn supervise<S>(self: Arc<Self>, stream: S, peer: SocketAddr) -> ConnectionReport
    where
        N: Negotiator<S>,
        S: Send + 'static,
    {
        let mut report = ConnectionReport::default();

        let secure = match self.negotiator.negotiate(stream, peer).await {
            Ok(secure) => secure,
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {}", peer, e);
                report.handshake_failed = true;
                return report;
            }
        };

        tracing::info!(
            "Connection from {} ({}) as {:?}",
            secure.remote,
            secure.client_version,
            secure.user
        );

        let (mut channels, global_requests, mut guard) = secure.into_parts();
        let drain = tokio::spawn(discard_global_requests(global_requests).in_current_span());
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                next = channels.next() => match next {
                    Some(incoming) => {
                        report.channels += 1;
                        let span = tracing::debug_span!("channel", id = incoming.id());
                        let task = handle_channel(incoming, self.binder.clone(), self.root.clone());
                        tasks.spawn(task.instrument(span));
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => report.record(joined),
            }
        }

        tracing::info!("Session with {} ended", guard.remote);
        guard.close().await;

        while let Some(joined) = tasks.join_next().await {
            report.record(joined);
        }
        drain.abort();

        report
    }
}

/// Global requests need no answer from us; the transport already refused them.
async fn discard_global_requests(mut requests: GlobalRequestStream) -> usize {
    let mut discarded = 0;
    while let Some(request) = requests.next().await {
        tracing::debug!("Discarding global request {}", request.kind);
        discarded += 1;
    }
    discarded
}

/// Admission, request routing and subsystem serving for one channel.
/// The session is closed before returning on every path past admission.
async fn handle_channel<B>(
    incoming: IncomingChannel,
    binder: Arc<B>,
    root: Arc<PathBuf>,
) -> ChannelOutcome
where
    B: SubsystemBinder,
{
    let mut session = match gatekeeper::admit(incoming) {
        Ok(Admission::Accepted(session)) => session,
        Ok(Admission::Rejected(reason)) => {
            tracing::debug!("Channel rejected: {}", reason);
            return ChannelOutcome::Rejected;
        }
        Err(e) => {
            tracing::warn!("Error accepting channel: {}", e);
            return ChannelOutcome::AcceptFailed;
        }
    };

    let Some(requests) = session.take_requests() else {
        session.close().await;
        return ChannelOutcome::Idle;
    };

    let (granted_tx, granted) = oneshot::channel();
    let router = tokio::spawn(router::route(requests, Some(granted_tx)).in_current_span());

    let outcome = match granted.await {
        Ok(()) => bind_subsystem(&mut session, binder.as_ref(), &root).await,
        Err(_) => {
            tracing::debug!("Channel {} ended without a subsystem", session.id());
            ChannelOutcome::Idle
        }
    };

    session.close().await;
    router.abort();

    outcome
}

async fn bind_subsystem<B>(session: &mut Session, binder: &B, root: &Path) -> ChannelOutcome
where
    B: SubsystemBinder,
{
    let mut server = match binder.build(root) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to create sftp server: {}", e);
            return ChannelOutcome::BuildFailed;
        }
    };

    let Some(io) = session.take_io() else {
        server.close().await;
        return ChannelOutcome::ServeFailed;
    };

    let result = server.serve(io).await;
    server.close().await;

    match result {
        Ok(()) => {
            tracing::info!("sftp client disconnected");
            ChannelOutcome::Served
        }
        Err(e) => {
            tracing::error!("sftp server on channel {} failed: {}", session.id(), e);
            ChannelOutcome::ServeFailed
        }
    }
}
