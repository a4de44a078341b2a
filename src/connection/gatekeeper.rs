//! Channel admission policy

use super::transport::{IncomingChannel, RejectReason, Session};
use crate::error::TransportError;

/// The only channel type this server serves.
pub const SESSION_CHANNEL: &str = "session";

pub enum Admission {
    Accepted(Session),
    Rejected(RejectReason),
}

/// Accepts `session` channels and rejects everything else.
///
/// An `Err` means the accept itself failed at the transport level; it only
/// concerns this channel.
pub fn admit(incoming: IncomingChannel) -> Result<Admission, TransportError> {
    if incoming.channel_type() != SESSION_CHANNEL {
        tracing::debug!(
            "Rejecting channel {} of type {:?}",
            incoming.id(),
            incoming.channel_type()
        );
        let reason = RejectReason::UnknownChannelType;
        incoming.reject(reason, "unknown channel type");
        return Ok(Admission::Rejected(reason));
    }

    let session = incoming.accept()?;
    tracing::debug!("Accepted session channel {}", session.id());
    Ok(Admission::Accepted(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::ChannelDecision;
    use crate::connection::transport::testing::fake_channel;

    #[tokio::test]
    async fn test_accept_session() {
        let (incoming, peer) = fake_channel(0, "session");
        let admission = admit(incoming).unwrap();
        assert!(matches!(admission, Admission::Accepted(_)));
        assert_eq!(peer.decided.await.unwrap(), ChannelDecision::Accept);
    }

    #[tokio::test]
    async fn test_reject_other_types() {
        for channel_type in ["direct-tcpip", "x11", "forwarded-tcpip", "Session", "session ", ""] {
            let (incoming, peer) = fake_channel(7, channel_type);
            match admit(incoming).unwrap() {
                Admission::Rejected(reason) => assert_eq!(reason, RejectReason::UnknownChannelType),
                Admission::Accepted(_) => panic!("{:?} must be rejected", channel_type),
            }
            match peer.decided.await.unwrap() {
                ChannelDecision::Reject { reason, .. } => {
                    assert_eq!(reason, RejectReason::UnknownChannelType)
                }
                ChannelDecision::Accept => panic!("{:?} must not be accepted", channel_type),
            }
            // a rejected channel never becomes a session, so nothing is closed
            assert_eq!(peer.closes.count(), 0);
        }
    }

    #[tokio::test]
    async fn test_accept_failure_is_an_error() {
        let (incoming, peer) = fake_channel(1, "session");
        drop(peer.decided);
        assert!(admit(incoming).is_err());
    }
}
