//! SFTP subsystem binding
//!
//! Builds one [`SftpServer`] per granted channel and runs the packet loop
//! until the client ends the stream.

use async_trait::async_trait;
use bytes::Bytes;
use russh_sftp::protocol::StatusCode;
use std::io;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::protocol::SftpProtocol;
use super::wire::{self, Request, Response};
use crate::connection::subsystem::{SubsystemBinder, SubsystemServer};
use crate::connection::transport::ChannelIo;
use crate::error::{SftpError, SubsystemError};

/// Largest packet accepted from a client (OpenSSH uses the same bound).
pub const MAX_PACKET_LEN: u32 = 256 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct SftpBinder;

impl SubsystemBinder for SftpBinder {
    type Server = SftpServer;

    fn build(&self, root: &Path) -> Result<SftpServer, SubsystemError> {
        let invalid = |reason: String| SubsystemError::InvalidRoot {
            path: root.to_path_buf(),
            reason,
        };

        let canonical = root.canonicalize().map_err(|e| invalid(e.to_string()))?;
        if !canonical.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }

        Ok(SftpServer {
            protocol: SftpProtocol::new(canonical),
        })
    }
}

pub struct SftpServer {
    protocol: SftpProtocol,
}

#[async_trait]
impl SubsystemServer for SftpServer {
    async fn serve(&mut self, mut io: Box<dyn ChannelIo>) -> Result<(), SubsystemError> {
        tracing::debug!("Serving sftp from {:?}", self.protocol.root());
        let result = self.serve_packets(&mut io).await;
        self.protocol.close_all();
        result
    }

    async fn close(&mut self) {
        self.protocol.close_all();
    }
}

impl SftpServer {
    async fn serve_packets(&mut self, io: &mut Box<dyn ChannelIo>) -> Result<(), SubsystemError> {
        while let Some(packet) = read_packet(io).await? {
            let response = match wire::decode(packet) {
                Ok(request) => self.handle(request).await,
                Err(malformed) => match malformed.id {
                    Some(id) => {
                        tracing::debug!("Malformed sftp request {}: {}", id, malformed.reason);
                        Response::status(id, StatusCode::BadMessage, malformed.reason)
                    }
                    None => return Err(SubsystemError::Decode(malformed.reason)),
                },
            };
            io.write_all(&response.encode()).await?;
            io.flush().await?;
        }
        Ok(())
    }

    async fn handle(&mut self, request: Request) -> Response {
        if let Request::Init { version } = request {
            tracing::debug!("Client offered sftp version {}", version);
            return Response::Version;
        }
        let id = wire::request_id(&request).unwrap_or_default();

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("sftp request {} failed: {}", id, e);
                Response::status(id, e.status_code(), e.to_string())
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response, SftpError> {
        let sftp = &mut self.protocol;
        let response = match request {
            Request::Init { .. } => Response::Version,
            Request::Open { id, path, flags, attrs } => Response::Handle {
                id,
                handle: sftp.open(&path, flags, &attrs).await?,
            },
            Request::Close { id, handle } => {
                sftp.close(&handle)?;
                Response::ok(id)
            }
            Request::Read { id, handle, offset, len } => match sftp.read(&handle, offset, len).await? {
                Some(data) => Response::Data { id, data },
                None => Response::status(id, StatusCode::Eof, "End of file"),
            },
            Request::Write { id, handle, offset, data } => {
                sftp.write(&handle, offset, &data).await?;
                Response::ok(id)
            }
            Request::Lstat { id, path } => Response::Attrs {
                id,
                attrs: sftp.lstat(&path).await?,
            },
            Request::Fstat { id, handle } => Response::Attrs {
                id,
                attrs: sftp.fstat(&handle).await?,
            },
            Request::Stat { id, path } => Response::Attrs {
                id,
                attrs: sftp.stat(&path).await?,
            },
            Request::SetStat { id, path, attrs } => {
                sftp.setstat(&path, &attrs).await?;
                Response::ok(id)
            }
            Request::FSetStat { id, handle, attrs } => {
                sftp.fsetstat(&handle, &attrs).await?;
                Response::ok(id)
            }
            Request::OpenDir { id, path } => Response::Handle {
                id,
                handle: sftp.opendir(&path).await?,
            },
            Request::ReadDir { id, handle } => match sftp.readdir(&handle)? {
                Some(entries) => Response::Name { id, entries },
                None => Response::status(id, StatusCode::Eof, "End of directory"),
            },
            Request::Remove { id, path } => {
                sftp.remove(&path).await?;
                Response::ok(id)
            }
            Request::MkDir { id, path, attrs } => {
                sftp.mkdir(&path, &attrs).await?;
                Response::ok(id)
            }
            Request::RmDir { id, path } => {
                sftp.rmdir(&path).await?;
                Response::ok(id)
            }
            Request::RealPath { id, path } => {
                let resolved = sftp.realpath(&path).await?;
                single_name(id, resolved)
            }
            Request::Rename { id, from, to } => {
                sftp.rename(&from, &to).await?;
                Response::ok(id)
            }
            Request::ReadLink { id, path } => {
                let target = sftp.readlink(&path).await?;
                single_name(id, target)
            }
            Request::Symlink { id, target, link } => {
                sftp.symlink(&target, &link).await?;
                Response::ok(id)
            }
            Request::Extended { id, name } => {
                Response::status(id, StatusCode::OpUnsupported, format!("{} is not supported", name))
            }
            Request::Misdirected { id, kind } => {
                Response::status(id, StatusCode::BadMessage, format!("unexpected packet type {}", kind))
            }
            Request::Unknown { id, kind } => {
                Response::status(id, StatusCode::OpUnsupported, format!("unknown packet type {}", kind))
            }
        };
        Ok(response)
    }
}

fn single_name(id: u32, name: Vec<u8>) -> Response {
    Response::Name {
        id,
        entries: vec![wire::NameEntry {
            longname: String::from_utf8_lossy(&name).into_owned(),
            filename: name,
            attrs: Default::default(),
        }],
    }
}

/// Reads one length-prefixed packet. `None` means the peer ended the stream
/// cleanly between packets.
async fn read_packet(io: &mut Box<dyn ChannelIo>) -> Result<Option<Bytes>, SubsystemError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = io.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a packet header").into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_PACKET_LEN {
        return Err(SubsystemError::PacketTooLarge(len));
    }

    let mut packet = vec![0u8; len as usize];
    io.read_exact(&mut packet).await?;
    Ok(Some(Bytes::from(packet)))
}
