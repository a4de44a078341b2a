//! SFTP v3 packet codec
//!
//! Requests are decoded from and replies encoded into `uint32 length ||
//! uint8 type || body` frames (draft-ietf-secsh-filexfer-02).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};

pub const SFTP_VERSION: u32 = 3;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_SYMLINK: u8 = 20;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;
pub const SSH_FXP_EXTENDED: u8 = 200;
pub const SSH_FXP_EXTENDED_REPLY: u8 = 201;

const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UIDGID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACMODTIME: u32 = 0x0000_0008;
const ATTR_EXTENDED: u32 = 0x8000_0000;

/// A client request. Paths are raw bytes as the client sent them.
pub enum Request {
    Init { version: u32 },
    Open { id: u32, path: Bytes, flags: OpenFlags, attrs: FileAttributes },
    Close { id: u32, handle: String },
    Read { id: u32, handle: String, offset: u64, len: u32 },
    Write { id: u32, handle: String, offset: u64, data: Bytes },
    Lstat { id: u32, path: Bytes },
    Fstat { id: u32, handle: String },
    SetStat { id: u32, path: Bytes, attrs: FileAttributes },
    FSetStat { id: u32, handle: String, attrs: FileAttributes },
    OpenDir { id: u32, path: Bytes },
    ReadDir { id: u32, handle: String },
    Remove { id: u32, path: Bytes },
    MkDir { id: u32, path: Bytes, attrs: FileAttributes },
    RmDir { id: u32, path: Bytes },
    RealPath { id: u32, path: Bytes },
    Stat { id: u32, path: Bytes },
    Rename { id: u32, from: Bytes, to: Bytes },
    ReadLink { id: u32, path: Bytes },
    /// OpenSSH puts the target first, then the new link path.
    Symlink { id: u32, target: Bytes, link: Bytes },
    Extended { id: u32, name: String },
    /// A packet type only the server may send.
    Misdirected { id: u32, kind: u8 },
    Unknown { id: u32, kind: u8 },
}

/// A packet that could not be decoded. With an id the request can still be
/// answered; without one the stream is out of sync.
#[derive(Debug)]
pub struct Malformed {
    pub id: Option<u32>,
    pub reason: String,
}

/// One entry of a NAME reply.
pub struct NameEntry {
    pub filename: Vec<u8>,
    pub longname: String,
    pub attrs: FileAttributes,
}

pub enum Response {
    Version,
    Status { id: u32, code: StatusCode, message: String },
    Handle { id: u32, handle: String },
    Data { id: u32, data: Vec<u8> },
    Name { id: u32, entries: Vec<NameEntry> },
    Attrs { id: u32, attrs: FileAttributes },
}

impl Response {
    pub fn ok(id: u32) -> Self {
        Response::Status {
            id,
            code: StatusCode::Ok,
            message: "Success".to_string(),
        }
    }

    pub fn status(id: u32, code: StatusCode, message: impl Into<String>) -> Self {
        Response::Status {
            id,
            code,
            message: message.into(),
        }
    }

    /// Encodes the reply with its length prefix.
    pub fn encode(self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Response::Version => {
                body.put_u8(SSH_FXP_VERSION);
                body.put_u32(SFTP_VERSION);
            }
            Response::Status { id, code, message } => {
                body.put_u8(SSH_FXP_STATUS);
                body.put_u32(id);
                body.put_u32(code as u32);
                put_string(&mut body, message.as_bytes());
                put_string(&mut body, b"en");
            }
            Response::Handle { id, handle } => {
                body.put_u8(SSH_FXP_HANDLE);
                body.put_u32(id);
                put_string(&mut body, handle.as_bytes());
            }
            Response::Data { id, data } => {
                body.put_u8(SSH_FXP_DATA);
                body.put_u32(id);
                put_string(&mut body, &data);
            }
            Response::Name { id, entries } => {
                body.put_u8(SSH_FXP_NAME);
                body.put_u32(id);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    put_string(&mut body, &entry.filename);
                    put_string(&mut body, entry.longname.as_bytes());
                    put_attrs(&mut body, &entry.attrs);
                }
            }
            Response::Attrs { id, attrs } => {
                body.put_u8(SSH_FXP_ATTRS);
                body.put_u32(id);
                put_attrs(&mut body, &attrs);
            }
        }

        let mut packet = BytesMut::with_capacity(4 + body.len());
        packet.put_u32(body.len() as u32);
        packet.put_slice(&body);
        packet.freeze()
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_attrs(buf: &mut BytesMut, attrs: &FileAttributes) {
    let mut flags = 0u32;
    if attrs.size.is_some() {
        flags |= ATTR_SIZE;
    }
    if attrs.uid.is_some() && attrs.gid.is_some() {
        flags |= ATTR_UIDGID;
    }
    if attrs.permissions.is_some() {
        flags |= ATTR_PERMISSIONS;
    }
    if attrs.atime.is_some() && attrs.mtime.is_some() {
        flags |= ATTR_ACMODTIME;
    }
    buf.put_u32(flags);

    if let Some(size) = attrs.size {
        buf.put_u64(size);
    }
    if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
        buf.put_u32(uid);
        buf.put_u32(gid);
    }
    if let Some(permissions) = attrs.permissions {
        buf.put_u32(permissions);
    }
    if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
        buf.put_u32(atime);
        buf.put_u32(mtime);
    }
}

/// Cursor over one packet body that never reads past its end.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn u8(&mut self) -> Result<u8, String> {
        if self.buf.remaining() < 1 {
            return Err("truncated packet".to_string());
        }
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, String> {
        if self.buf.remaining() < 4 {
            return Err("truncated uint32".to_string());
        }
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, String> {
        if self.buf.remaining() < 8 {
            return Err("truncated uint64".to_string());
        }
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self) -> Result<Bytes, String> {
        let len = self.u32()? as usize;
        if self.buf.remaining() < len {
            return Err(format!("string of {} bytes overruns packet", len));
        }
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String, String> {
        let raw = self.bytes()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn attrs(&mut self) -> Result<FileAttributes, String> {
        let flags = self.u32()?;
        let mut attrs = FileAttributes::default();
        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(self.u64()?);
        }
        if flags & ATTR_UIDGID != 0 {
            attrs.uid = Some(self.u32()?);
            attrs.gid = Some(self.u32()?);
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(self.u32()?);
        }
        if flags & ATTR_ACMODTIME != 0 {
            attrs.atime = Some(self.u32()?);
            attrs.mtime = Some(self.u32()?);
        }
        if flags & ATTR_EXTENDED != 0 {
            let count = self.u32()?;
            for _ in 0..count {
                self.bytes()?;
                self.bytes()?;
            }
        }
        Ok(attrs)
    }
}

/// Decodes one packet body (the bytes after the length prefix).
pub fn decode(packet: Bytes) -> Result<Request, Malformed> {
    let mut reader = Reader { buf: packet };
    let kind = reader.u8().map_err(|reason| Malformed { id: None, reason })?;

    if kind == SSH_FXP_INIT {
        let version = reader.u32().map_err(|reason| Malformed { id: None, reason })?;
        return Ok(Request::Init { version });
    }

    let id = reader.u32().map_err(|reason| Malformed { id: None, reason })?;
    decode_body(kind, id, &mut reader).map_err(|reason| Malformed {
        id: Some(id),
        reason,
    })
}

fn decode_body(kind: u8, id: u32, r: &mut Reader) -> Result<Request, String> {
    let request = match kind {
        SSH_FXP_OPEN => Request::Open {
            id,
            path: r.bytes()?,
            flags: OpenFlags::from_bits_truncate(r.u32()?),
            attrs: r.attrs()?,
        },
        SSH_FXP_CLOSE => Request::Close { id, handle: r.string()? },
        SSH_FXP_READ => Request::Read {
            id,
            handle: r.string()?,
            offset: r.u64()?,
            len: r.u32()?,
        },
        SSH_FXP_WRITE => Request::Write {
            id,
            handle: r.string()?,
            offset: r.u64()?,
            data: r.bytes()?,
        },
        SSH_FXP_LSTAT => Request::Lstat { id, path: r.bytes()? },
        SSH_FXP_FSTAT => Request::Fstat { id, handle: r.string()? },
        SSH_FXP_SETSTAT => Request::SetStat {
            id,
            path: r.bytes()?,
            attrs: r.attrs()?,
        },
        SSH_FXP_FSETSTAT => Request::FSetStat {
            id,
            handle: r.string()?,
            attrs: r.attrs()?,
        },
        SSH_FXP_OPENDIR => Request::OpenDir { id, path: r.bytes()? },
        SSH_FXP_READDIR => Request::ReadDir { id, handle: r.string()? },
        SSH_FXP_REMOVE => Request::Remove { id, path: r.bytes()? },
        SSH_FXP_MKDIR => Request::MkDir {
            id,
            path: r.bytes()?,
            attrs: r.attrs()?,
        },
        SSH_FXP_RMDIR => Request::RmDir { id, path: r.bytes()? },
        SSH_FXP_REALPATH => Request::RealPath { id, path: r.bytes()? },
        SSH_FXP_STAT => Request::Stat { id, path: r.bytes()? },
        SSH_FXP_RENAME => Request::Rename {
            id,
            from: r.bytes()?,
            to: r.bytes()?,
        },
        SSH_FXP_READLINK => Request::ReadLink { id, path: r.bytes()? },
        SSH_FXP_SYMLINK => Request::Symlink {
            id,
            target: r.bytes()?,
            link: r.bytes()?,
        },
        SSH_FXP_EXTENDED => Request::Extended { id, name: r.string()? },
        SSH_FXP_VERSION | SSH_FXP_STATUS..=SSH_FXP_ATTRS | SSH_FXP_EXTENDED_REPLY => {
            Request::Misdirected { id, kind }
        }
        other => Request::Unknown { id, kind: other },
    };
    Ok(request)
}

/// Request id of a decoded request, if it carries one.
pub fn request_id(request: &Request) -> Option<u32> {
    let id = match request {
        Request::Init { .. } => return None,
        Request::Open { id, .. }
        | Request::Close { id, .. }
        | Request::Read { id, .. }
        | Request::Write { id, .. }
        | Request::Lstat { id, .. }
        | Request::Fstat { id, .. }
        | Request::SetStat { id, .. }
        | Request::FSetStat { id, .. }
        | Request::OpenDir { id, .. }
        | Request::ReadDir { id, .. }
        | Request::Remove { id, .. }
        | Request::MkDir { id, .. }
        | Request::RmDir { id, .. }
        | Request::RealPath { id, .. }
        | Request::Stat { id, .. }
        | Request::Rename { id, .. }
        | Request::ReadLink { id, .. }
        | Request::Symlink { id, .. }
        | Request::Extended { id, .. }
        | Request::Misdirected { id, .. }
        | Request::Unknown { id, .. } => id,
    };
    Some(*id)
}
