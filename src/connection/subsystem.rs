//! Seam between a granted session channel and the file-transfer server

use async_trait::async_trait;
use std::path::Path;

use super::transport::ChannelIo;
use crate::error::SubsystemError;

/// Builds one subsystem server per granted channel.
pub trait SubsystemBinder: Send + Sync {
    type Server: SubsystemServer;

    fn build(&self, root: &Path) -> Result<Self::Server, SubsystemError>;
}

#[async_trait]
pub trait SubsystemServer: Send {
    /// Serves until the peer ends the stream (`Ok`) or the stream fails.
    async fn serve(&mut self, io: Box<dyn ChannelIo>) -> Result<(), SubsystemError>;

    /// Releases everything the server still holds. Called on every path.
    async fn close(&mut self);
}
