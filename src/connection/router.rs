//! Session request routing
//!
//! Answers every request on an accepted session channel. Only a
//! `subsystem` request naming `sftp` gets a positive reply; everything else is
//! refused without closing the channel.

use bytes::Buf;
use futures::StreamExt;
use tokio::sync::oneshot;

use super::transport::RequestStream;

pub const SUBSYSTEM_REQUEST: &str = "subsystem";
pub const SFTP_SUBSYSTEM: &[u8] = b"sftp";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteSummary {
    pub granted: usize,
    pub refused: usize,
}

/// Extracts the subsystem name from an SSH string payload
/// (`uint32 length || bytes`). Anything truncated or with trailing bytes
/// yields `None`.
pub fn subsystem_name(payload: &[u8]) -> Option<&[u8]> {
    let mut buf = payload;
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() != len {
        return None;
    }
    Some(buf)
}

/// Decides the reply for one request.
pub fn grants(kind: &str, payload: &[u8]) -> bool {
    kind == SUBSYSTEM_REQUEST && subsystem_name(payload) == Some(SFTP_SUBSYSTEM)
}

/// Serves the request stream until it ends. `on_subsystem` fires on the first
/// granted request.
pub async fn route(
    mut requests: RequestStream,
    mut on_subsystem: Option<oneshot::Sender<()>>,
) -> RouteSummary {
    let mut summary = RouteSummary::default();

    while let Some(request) = requests.next().await {
        let ok = grants(&request.kind, &request.payload);
        if ok {
            summary.granted += 1;
            tracing::info!("sftp subsystem requested");
        } else {
            summary.refused += 1;
            tracing::debug!("Refusing {} request", request.kind);
        }
        request.reply(ok);

        if ok {
            if let Some(signal) = on_subsystem.take() {
                let _ = signal.send(());
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::testing::subsystem_payload;
    use crate::connection::transport::{ChannelRequest, RequestStream};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn stream() -> (mpsc::Sender<ChannelRequest>, RequestStream) {
        let (tx, rx) = mpsc::channel(8);
        (tx, RequestStream::new(rx))
    }

    async fn ask(tx: &mpsc::Sender<ChannelRequest>, kind: &str, payload: Bytes) -> bool {
        let (request, replied) = ChannelRequest::new(kind, payload);
        tx.send(request).await.unwrap();
        replied.await.unwrap()
    }

    #[test]
    fn test_subsystem_name_parsing() {
        assert_eq!(subsystem_name(&subsystem_payload("sftp")), Some(&b"sftp"[..]));
        assert_eq!(subsystem_name(b""), None);
        assert_eq!(subsystem_name(b"\x00\x00\x00"), None);
        assert_eq!(subsystem_name(b"\x00\x00\x00\x09sftp"), None);
        assert_eq!(subsystem_name(b"\x00\x00\x00\x04sftpx"), None);
        assert_eq!(subsystem_name(b"\x00\x00\x00\x00"), Some(&b""[..]));
    }

    #[test]
    fn test_grants() {
        assert!(grants("subsystem", &subsystem_payload("sftp")));
        assert!(!grants("subsystem", &subsystem_payload("exec")));
        assert!(!grants("subsystem", &subsystem_payload("SFTP")));
        assert!(!grants("subsystem", b"sf"));
        assert!(!grants("pty-req", &subsystem_payload("sftp")));
        assert!(!grants("exec", &subsystem_payload("sftp")));
    }

    #[tokio::test]
    async fn test_keeps_serving_after_refusal() {
        let (tx, requests) = stream();
        let (signal, fired) = oneshot::channel();
        let router = tokio::spawn(route(requests, Some(signal)));

        assert!(!ask(&tx, "pty-req", Bytes::from_static(b"xterm")).await);
        assert!(!ask(&tx, "subsystem", subsystem_payload("exec")).await);
        assert!(!ask(&tx, "subsystem", Bytes::from_static(b"\x00")).await);
        assert!(ask(&tx, "subsystem", subsystem_payload("sftp")).await);
        fired.await.unwrap();
        assert!(!ask(&tx, "env", Bytes::new()).await);

        drop(tx);
        let summary = router.await.unwrap();
        assert_eq!(summary, RouteSummary { granted: 1, refused: 4 });
    }

    #[tokio::test]
    async fn test_signal_dropped_without_subsystem() {
        let (tx, requests) = stream();
        let (signal, fired) = oneshot::channel();
        let router = tokio::spawn(route(requests, Some(signal)));

        assert!(!ask(&tx, "shell", Bytes::new()).await);
        drop(tx);
        assert!(fired.await.is_err());
        assert_eq!(router.await.unwrap().granted, 0);
    }
}
