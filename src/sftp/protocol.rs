//! SFTP file operations
//!
//! Every client path is confined to the served root before it touches the
//! filesystem. Open files and directory listings live in a per-channel handle
//! table that is emptied when the channel ends.

use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::wire::NameEntry;
use crate::error::SftpError;
use crate::filesystem::security::{self, Links};

/// Largest READ served in one reply; clients issue follow-up reads.
pub const MAX_READ_LEN: u32 = 64 * 1024;

/// Entries per READDIR reply.
const READDIR_BATCH: usize = 100;

/// SFTP file handle
enum SftpHandle {
    File { path: PathBuf, file: fs::File },
    Dir { entries: Vec<NameEntry> },
}

pub struct SftpProtocol {
    root: PathBuf,
    handles: HashMap<String, SftpHandle>,
    handle_counter: u64,
}

impl SftpProtocol {
    /// `root` must be canonical.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            handles: HashMap::new(),
            handle_counter: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drops every open file and directory listing.
    pub fn close_all(&mut self) {
        if !self.handles.is_empty() {
            tracing::debug!("Releasing {} open sftp handles", self.handles.len());
            self.handles.clear();
        }
    }

    fn insert(&mut self, handle: SftpHandle) -> String {
        self.handle_counter += 1;
        let id = format!("handle_{}", self.handle_counter);
        self.handles.insert(id.clone(), handle);
        id
    }

    fn file(&mut self, handle: &str) -> Result<&mut fs::File, SftpError> {
        match self.handles.get_mut(handle) {
            Some(SftpHandle::File { file, .. }) => Ok(file),
            _ => Err(SftpError::InvalidHandle),
        }
    }

    fn resolve(&self, path: &[u8], links: Links) -> Result<PathBuf, SftpError> {
        Ok(security::confine(&self.root, path, links)?)
    }

    pub async fn open(
        &mut self,
        path: impl AsRef<[u8]>,
        flags: OpenFlags,
        attrs: &FileAttributes,
    ) -> Result<String, SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::Follow)?;
        tracing::debug!("SFTP OPEN: {:?} with flags {:?}", resolved, flags);

        let existed = match fs::metadata(&resolved).await {
            Ok(meta) if meta.is_dir() => {
                return Err(SftpError::Failure(format!(
                    "{} is a directory",
                    String::from_utf8_lossy(path.as_ref())
                )));
            }
            Ok(_) => true,
            Err(_) => false,
        };

        // no access mode means read, as most download clients expect
        let read = flags.contains(OpenFlags::READ)
            || !flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND);
        let create = flags.contains(OpenFlags::CREATE);

        let file = fs::OpenOptions::new()
            .read(read)
            .write(flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND))
            .append(flags.contains(OpenFlags::APPEND))
            .create(create && !flags.contains(OpenFlags::EXCLUDE))
            .create_new(create && flags.contains(OpenFlags::EXCLUDE))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .open(&resolved)
            .await?;

        if !existed {
            if let Some(mode) = attrs.permissions {
                set_mode(&resolved, mode).await?;
            }
        }

        Ok(self.insert(SftpHandle::File {
            path: resolved,
            file,
        }))
    }

    pub fn close(&mut self, handle: &str) -> Result<(), SftpError> {
        self.handles
            .remove(handle)
            .map(|_| ())
            .ok_or(SftpError::InvalidHandle)
    }

    /// `None` at end of file.
    pub async fn read(
        &mut self,
        handle: &str,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, SftpError> {
        let file = self.file(handle)?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 && !buffer.is_empty() {
            return Ok(None);
        }
        buffer.truncate(filled);
        Ok(Some(buffer))
    }

    pub async fn write(&mut self, handle: &str, offset: u64, data: &[u8]) -> Result<(), SftpError> {
        let file = self.file(handle)?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn stat(&self, path: impl AsRef<[u8]>) -> Result<FileAttributes, SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::Follow)?;
        tracing::debug!("SFTP STAT: {:?}", resolved);
        Ok(attributes(&fs::metadata(&resolved).await?))
    }

    /// Does not follow a final symlink.
    pub async fn lstat(&self, path: impl AsRef<[u8]>) -> Result<FileAttributes, SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::NoFollow)?;
        tracing::debug!("SFTP LSTAT: {:?}", resolved);
        Ok(attributes(&fs::symlink_metadata(&resolved).await?))
    }

    pub async fn fstat(&mut self, handle: &str) -> Result<FileAttributes, SftpError> {
        let file = self.file(handle)?;
        Ok(attributes(&file.metadata().await?))
    }

    /// Applies size and permission changes; ownership and times are ignored.
    pub async fn setstat(&self, path: impl AsRef<[u8]>, attrs: &FileAttributes) -> Result<(), SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::Follow)?;
        tracing::debug!("SFTP SETSTAT: {:?}", resolved);

        if let Some(size) = attrs.size {
            let file = fs::OpenOptions::new().write(true).open(&resolved).await?;
            file.set_len(size).await?;
        }
        if let Some(mode) = attrs.permissions {
            set_mode(&resolved, mode).await?;
        }
        Ok(())
    }

    pub async fn fsetstat(&mut self, handle: &str, attrs: &FileAttributes) -> Result<(), SftpError> {
        let path = match self.handles.get(handle) {
            Some(SftpHandle::File { path, .. }) => path.clone(),
            _ => return Err(SftpError::InvalidHandle),
        };

        if let Some(size) = attrs.size {
            self.file(handle)?.set_len(size).await?;
        }
        if let Some(mode) = attrs.permissions {
            set_mode(&path, mode).await?;
        }
        Ok(())
    }

    pub async fn opendir(&mut self, path: impl AsRef<[u8]>) -> Result<String, SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::Follow)?;
        tracing::debug!("SFTP OPENDIR: {:?}", resolved);

        let mut dir = fs::read_dir(&resolved).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let filename = security::name_bytes(&entry.file_name());
            // entries can vanish between listing and stat
            let Ok(meta) = fs::symlink_metadata(entry.path()).await else {
                continue;
            };
            let attrs = attributes(&meta);
            entries.push(NameEntry {
                longname: longname(&String::from_utf8_lossy(&filename), &attrs),
                filename,
                attrs,
            });
        }

        Ok(self.insert(SftpHandle::Dir { entries }))
    }

    /// Next batch of entries, `None` once the listing is exhausted.
    pub fn readdir(&mut self, handle: &str) -> Result<Option<Vec<NameEntry>>, SftpError> {
        let Some(SftpHandle::Dir { entries }) = self.handles.get_mut(handle) else {
            return Err(SftpError::InvalidHandle);
        };

        if entries.is_empty() {
            return Ok(None);
        }
        let end = READDIR_BATCH.min(entries.len());
        Ok(Some(entries.drain(..end).collect()))
    }

    pub async fn remove(&self, path: impl AsRef<[u8]>) -> Result<(), SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::NoFollow)?;
        tracing::debug!("SFTP REMOVE: {:?}", resolved);
        fs::remove_file(&resolved).await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: impl AsRef<[u8]>, attrs: &FileAttributes) -> Result<(), SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::NoFollow)?;
        tracing::debug!("SFTP MKDIR: {:?}", resolved);
        fs::create_dir(&resolved).await?;
        if let Some(mode) = attrs.permissions {
            set_mode(&resolved, mode).await?;
        }
        Ok(())
    }

    pub async fn rmdir(&self, path: impl AsRef<[u8]>) -> Result<(), SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::NoFollow)?;
        tracing::debug!("SFTP RMDIR: {:?}", resolved);
        fs::remove_dir(&resolved).await?;
        Ok(())
    }

    /// Canonical client view of `path`; `.` and the empty path are the root.
    pub async fn realpath(&self, path: impl AsRef<[u8]>) -> Result<Vec<u8>, SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::Follow)?;
        let real = fs::canonicalize(&resolved).await.unwrap_or(resolved);
        security::client_path(&self.root, &real)
            .ok_or_else(|| SftpError::PermissionDenied("path outside root".to_string()))
    }

    /// Fails when the destination exists.
    pub async fn rename(
        &self,
        from: impl AsRef<[u8]>,
        to: impl AsRef<[u8]>,
    ) -> Result<(), SftpError> {
        let from = self.resolve(from.as_ref(), Links::NoFollow)?;
        let to = self.resolve(to.as_ref(), Links::NoFollow)?;
        tracing::debug!("SFTP RENAME: {:?} -> {:?}", from, to);

        if fs::symlink_metadata(&to).await.is_ok() {
            return Err(SftpError::Failure("destination already exists".to_string()));
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    /// Targets inside the root come back root-relative.
    pub async fn readlink(&self, path: impl AsRef<[u8]>) -> Result<Vec<u8>, SftpError> {
        let resolved = self.resolve(path.as_ref(), Links::NoFollow)?;
        let target = fs::read_link(&resolved).await?;

        if target.is_relative() {
            return Ok(security::name_bytes(target.as_os_str()));
        }
        security::client_path(&self.root, &target)
            .ok_or_else(|| SftpError::PermissionDenied("link points outside root".to_string()))
    }

    /// The link stores the confined absolute target so it cannot be re-read
    /// relative to somewhere else.
    pub async fn symlink(
        &self,
        target: impl AsRef<[u8]>,
        link: impl AsRef<[u8]>,
    ) -> Result<(), SftpError> {
        let link = self.resolve(link.as_ref(), Links::NoFollow)?;
        let target = security::confine_link_target(&self.root, &link, target)?;
        tracing::debug!("SFTP SYMLINK: {:?} -> {:?}", link, target);
        make_symlink(&target, &link).await
    }
}

#[cfg(test)]
impl SftpProtocol {
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(unix)]
async fn make_symlink(target: &Path, link: &Path) -> Result<(), SftpError> {
    fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_symlink(_target: &Path, _link: &Path) -> Result<(), SftpError> {
    Err(SftpError::Failure("symlinks are not supported on this host".to_string()))
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), SftpError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), SftpError> {
    Ok(())
}

/// Convert file metadata to SFTP attributes
fn attributes(meta: &Metadata) -> FileAttributes {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32);
    let atime = meta
        .accessed()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .or(mtime);

    let mut attrs = FileAttributes {
        size: Some(meta.len()),
        atime,
        mtime,
        ..Default::default()
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        attrs.uid = Some(meta.uid());
        attrs.gid = Some(meta.gid());
        attrs.permissions = Some(meta.mode());
    }
    #[cfg(not(unix))]
    {
        attrs.permissions = Some(if meta.is_dir() { 0o040755 } else { 0o100644 });
    }

    attrs
}

/// `ls -l` style line for NAME replies
fn longname(name: &str, attrs: &FileAttributes) -> String {
    let perms = attrs.permissions.unwrap_or(0o100644);
    let file_type = match perms & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        _ => '-',
    };
    let rwx = |bits: u32| {
        format!(
            "{}{}{}",
            if bits & 4 != 0 { 'r' } else { '-' },
            if bits & 2 != 0 { 'w' } else { '-' },
            if bits & 1 != 0 { 'x' } else { '-' },
        )
    };
    format!(
        "{}{}{}{} 1 {} {} {} {}",
        file_type,
        rwx(perms >> 6),
        rwx(perms >> 3),
        rwx(perms),
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::protocol::StatusCode;
    use tempdir::TempDir;

    fn scratch() -> (TempDir, SftpProtocol) {
        let dir = TempDir::new("sftp_protocol").unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, SftpProtocol::new(root))
    }

    fn none() -> FileAttributes {
        FileAttributes::default()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, mut sftp) = scratch();
        let handle = sftp
            .open("/notes.txt", OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE, &none())
            .await
            .unwrap();
        sftp.write(&handle, 0, b"hello world").await.unwrap();
        sftp.close(&handle).unwrap();

        let handle = sftp.open("notes.txt", OpenFlags::READ, &none()).await.unwrap();
        assert_eq!(sftp.read(&handle, 6, 100).await.unwrap().unwrap(), b"world");
        assert!(sftp.read(&handle, 11, 100).await.unwrap().is_none());
        assert_eq!(sftp.fstat(&handle).await.unwrap().size, Some(11));
    }

    #[tokio::test]
    async fn test_open_missing_without_create() {
        let (_dir, mut sftp) = scratch();
        let err = sftp.open("/missing", OpenFlags::READ, &none()).await.err().unwrap();
        assert!(matches!(err.status_code(), StatusCode::NoSuchFile));
    }

    #[tokio::test]
    async fn test_exclusive_create() {
        let (_dir, mut sftp) = scratch();
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUDE;
        sftp.open("/once", flags, &none()).await.unwrap();
        assert!(sftp.open("/once", flags, &none()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_handles() {
        let (_dir, mut sftp) = scratch();
        assert!(matches!(sftp.close("handle_42"), Err(SftpError::InvalidHandle)));
        assert!(matches!(sftp.read("nope", 0, 1).await, Err(SftpError::InvalidHandle)));

        let dir = sftp.opendir("/").await.unwrap();
        assert!(matches!(sftp.write(&dir, 0, b"x").await, Err(SftpError::InvalidHandle)));
    }

    #[tokio::test]
    async fn test_directory_listing_in_batches() {
        let (_dir, mut sftp) = scratch();
        for i in 0..READDIR_BATCH + 5 {
            std::fs::write(sftp.root().join(format!("f{}", i)), b"x").unwrap();
        }

        let handle = sftp.opendir("/").await.unwrap();
        let first = sftp.readdir(&handle).unwrap().unwrap();
        let second = sftp.readdir(&handle).unwrap().unwrap();
        assert_eq!(first.len(), READDIR_BATCH);
        assert_eq!(second.len(), 5);
        assert!(sftp.readdir(&handle).unwrap().is_none());
        assert!(first[0].longname.starts_with('-'));
    }

    #[tokio::test]
    async fn test_mkdir_rename_remove() {
        let (_dir, mut sftp) = scratch();
        sftp.mkdir("/a", &none()).await.unwrap();
        assert!(sftp.mkdir("/a", &none()).await.is_err());
        let handle = sftp
            .open("/a/f", OpenFlags::WRITE | OpenFlags::CREATE, &none())
            .await
            .unwrap();
        sftp.close(&handle).unwrap();

        sftp.rename("/a/f", "/a/g").await.unwrap();
        assert!(sftp.stat("/a/g").await.is_ok());
        assert!(sftp.rmdir("/a").await.is_err());

        sftp.remove("/a/g").await.unwrap();
        sftp.rmdir("/a").await.unwrap();
        assert!(sftp.stat("/a").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_destination() {
        let (_dir, sftp) = scratch();
        std::fs::write(sftp.root().join("x"), b"1").unwrap();
        std::fs::write(sftp.root().join("y"), b"2").unwrap();
        assert!(sftp.rename("/x", "/y").await.is_err());
        assert_eq!(std::fs::read(sftp.root().join("y")).unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_realpath() {
        let (_dir, sftp) = scratch();
        std::fs::create_dir(sftp.root().join("sub")).unwrap();
        assert_eq!(sftp.realpath(".").await.unwrap(), b"/");
        assert_eq!(sftp.realpath("").await.unwrap(), b"/");
        assert_eq!(sftp.realpath("/../..").await.unwrap(), b"/");
        assert_eq!(sftp.realpath("sub/../sub/./x").await.unwrap(), b"/sub/x");
    }

    #[tokio::test]
    async fn test_traversal_stays_in_root() {
        let (_dir, mut sftp) = scratch();
        let handle = sftp
            .open("/../../escape.txt", OpenFlags::WRITE | OpenFlags::CREATE, &none())
            .await
            .unwrap();
        sftp.close(&handle).unwrap();
        assert!(sftp.root().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_setstat_truncates() {
        let (_dir, sftp) = scratch();
        std::fs::write(sftp.root().join("big"), b"0123456789").unwrap();
        let attrs = FileAttributes {
            size: Some(4),
            ..Default::default()
        };
        sftp.setstat("/big", &attrs).await.unwrap();
        assert_eq!(std::fs::read(sftp.root().join("big")).unwrap(), b"0123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_stay_confined() {
        let (_dir, sftp) = scratch();
        std::fs::write(sftp.root().join("real"), b"data").unwrap();

        sftp.symlink("real", "/alias").await.unwrap();
        assert_eq!(sftp.readlink("/alias").await.unwrap(), b"/real");
        assert_eq!(sftp.stat("/alias").await.unwrap().size, Some(4));
        let link_mode = sftp.lstat("/alias").await.unwrap().permissions.unwrap();
        assert_eq!(link_mode & 0o170000, 0o120000);

        // a target that climbs out is clamped to the root
        sftp.symlink("../../../etc/passwd", "/clamped").await.unwrap();
        assert_eq!(sftp.readlink("/clamped").await.unwrap(), b"/etc/passwd");
        assert!(sftp.stat("/clamped").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreign_symlink_is_denied() {
        let (_dir, sftp) = scratch();
        std::os::unix::fs::symlink("/etc", sftp.root().join("etc")).unwrap();

        let err = sftp.stat("/etc/passwd").await.err().unwrap();
        assert!(matches!(err.status_code(), StatusCode::PermissionDenied));
        let err = sftp.readlink("/etc").await.err().unwrap();
        assert!(matches!(err.status_code(), StatusCode::PermissionDenied));
    }

    #[tokio::test]
    async fn test_close_all_releases_handles() {
        let (_dir, mut sftp) = scratch();
        sftp.opendir("/").await.unwrap();
        sftp.open("/f", OpenFlags::WRITE | OpenFlags::CREATE, &none()).await.unwrap();
        assert_eq!(sftp.open_handles(), 2);
        sftp.close_all();
        assert_eq!(sftp.open_handles(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listed_non_utf8_name_can_be_reopened() {
        use std::os::unix::ffi::OsStrExt;
        let (_dir, mut sftp) = scratch();
        let raw: &[u8] = b"r\xe9sum\xe9.txt";
        std::fs::write(sftp.root().join(std::ffi::OsStr::from_bytes(raw)), b"cv").unwrap();

        let dir = sftp.opendir("/").await.unwrap();
        let entries = sftp.readdir(&dir).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, raw);

        let mut path = b"/".to_vec();
        path.extend_from_slice(&entries[0].filename);
        let handle = sftp.open(&path, OpenFlags::READ, &none()).await.unwrap();
        assert_eq!(sftp.read(&handle, 0, 16).await.unwrap().unwrap(), b"cv");
        assert_eq!(sftp.realpath(&path).await.unwrap(), path);
    }
}
