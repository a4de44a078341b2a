//! Root confinement for client supplied paths
//!
//! Client paths are read relative to the served root: `/` is the root itself
//! and `..` never climbs above it. Symlinks are followed only as far as their
//! target stays under the canonical root.
//!
//! Paths arrive as raw bytes and map onto file names byte for byte on unix,
//! so names that are not UTF-8 survive a listing and can be opened again.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Whether the last component of a path may be a symlink that gets followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Links {
    Follow,
    NoFollow,
}

#[cfg(unix)]
fn os_name(bytes: &[u8]) -> Cow<'_, OsStr> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn os_name(bytes: &[u8]) -> Cow<'_, OsStr> {
    Cow::Owned(String::from_utf8_lossy(bytes).into_owned().into())
}

/// Wire form of a file name.
#[cfg(unix)]
pub fn name_bytes(name: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
pub fn name_bytes(name: &OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

/// Lexically normalizes a client path into a root-relative path.
///
/// `.` and empty segments are dropped and `..` is clamped at the root, so the
/// result never starts with `/` or `..`.
pub fn normalize(requested: impl AsRef<[u8]>) -> PathBuf {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in requested.as_ref().split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut relative = PathBuf::new();
    for part in parts {
        relative.push(os_name(part));
    }
    relative
}

/// Maps a client path onto the filesystem under `root`.
///
/// `root` must already be canonical. Every existing ancestor of the result
/// resolves inside `root`; with [`Links::Follow`] the final component must
/// resolve inside it as well.
pub fn confine(
    root: &Path,
    requested: impl AsRef<[u8]>,
    links: Links,
) -> Result<PathBuf, PathError> {
    let requested = requested.as_ref();
    if requested.contains(&0) {
        return Err(PathError::Invalid);
    }

    let relative = normalize(requested);
    if relative.as_os_str().is_empty() {
        return Ok(root.to_path_buf());
    }
    let full = root.join(&relative);

    if let Some(parent) = full.parent() {
        check_ancestors(root, parent)?;
    }

    if links == Links::Follow {
        check_target(root, &full)?;
    }

    Ok(full)
}

/// Checks that the deepest existing ancestor of `path` lives under `root`.
fn check_ancestors(root: &Path, path: &Path) -> Result<(), PathError> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        match candidate.canonicalize() {
            Ok(real) if real.starts_with(root) => return Ok(()),
            Ok(real) => {
                tracing::warn!("Path escape attempt: {:?} -> {:?}", path, real);
                return Err(PathError::Escape);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => current = candidate.parent(),
            Err(e) => return Err(PathError::Resolve(e.to_string())),
        }
    }
    Err(PathError::Escape)
}

fn check_target(root: &Path, full: &Path) -> Result<(), PathError> {
    match full.canonicalize() {
        Ok(real) if real.starts_with(root) => Ok(()),
        Ok(real) => {
            tracing::warn!("Symlink escape attempt: {:?} -> {:?}", full, real);
            Err(PathError::Escape)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // a dangling link could be written through to anywhere
            match full.symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => Err(PathError::Escape),
                _ => Ok(()),
            }
        }
        Err(e) => Err(PathError::Resolve(e.to_string())),
    }
}

/// Renders a path under `root` the way clients see it (`/` is the root).
/// Paths outside the root yield `None`.
pub fn client_path(root: &Path, path: &Path) -> Option<Vec<u8>> {
    let relative = path.strip_prefix(root).ok()?;
    let mut rendered = vec![b'/'];
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                if rendered.len() > 1 {
                    rendered.push(b'/');
                }
                rendered.extend_from_slice(&name_bytes(part));
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(rendered)
}

/// Resolves a symlink target written by a client. Absolute targets are taken
/// relative to the root, relative ones relative to the link's directory.
pub fn confine_link_target(
    root: &Path,
    link: &Path,
    target: impl AsRef<[u8]>,
) -> Result<PathBuf, PathError> {
    let target = target.as_ref();
    if target.first() == Some(&b'/') {
        return confine(root, target, Links::Follow);
    }

    let link_dir = link.parent().unwrap_or(root);
    let mut joined = client_path(root, link_dir).ok_or(PathError::Escape)?;
    joined.push(b'/');
    joined.extend_from_slice(target);
    confine(root, joined, Links::Follow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempdir::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new("confine").unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    fn test_normalize_clamps_at_root() {
        assert_eq!(normalize("/"), PathBuf::new());
        assert_eq!(normalize("."), PathBuf::new());
        assert_eq!(normalize("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(normalize("/a/./b/../c//d"), PathBuf::from("a/c/d"));
        assert_eq!(normalize("a/../../.."), PathBuf::new());
    }

    #[test]
    fn test_parent_traversal_stays_inside() {
        let (_dir, root) = scratch();
        assert_eq!(confine(&root, "../etc/passwd", Links::Follow).unwrap(), root.join("etc/passwd"));
        assert_eq!(confine(&root, "/", Links::Follow).unwrap(), root);
        assert_eq!(confine(&root, "", Links::Follow).unwrap(), root);
    }

    #[test]
    fn test_reject_nul() {
        let (_dir, root) = scratch();
        assert_eq!(confine(&root, "a\0b", Links::Follow), Err(PathError::Invalid));
    }

    #[test]
    fn test_accept_valid_paths() {
        let (_dir, root) = scratch();
        fs::create_dir(root.join("data")).unwrap();
        assert_eq!(
            confine(&root, "/data/config.json", Links::Follow).unwrap(),
            root.join("data/config.json")
        );
        assert_eq!(
            confine(&root, "missing/deeper/file.txt", Links::NoFollow).unwrap(),
            root.join("missing/deeper/file.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_reject_symlink_escape() {
        let (_dir, root) = scratch();
        let (_outside_dir, outside) = scratch();
        std::os::unix::fs::symlink(&outside, root.join("out")).unwrap();

        assert_eq!(confine(&root, "/out", Links::Follow), Err(PathError::Escape));
        assert_eq!(confine(&root, "/out/file", Links::NoFollow), Err(PathError::Escape));
        // the link itself may be inspected or removed
        assert_eq!(confine(&root, "/out", Links::NoFollow).unwrap(), root.join("out"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_is_followed() {
        let (_dir, root) = scratch();
        fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();
        assert!(confine(&root, "/alias/file", Links::Follow).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_reject_dangling_symlink() {
        let (_dir, root) = scratch();
        std::os::unix::fs::symlink("/nonexistent/elsewhere", root.join("dangling")).unwrap();
        assert_eq!(confine(&root, "/dangling", Links::Follow), Err(PathError::Escape));
    }

    #[test]
    fn test_client_path() {
        let root = PathBuf::from("/srv/root");
        assert_eq!(client_path(&root, &root).as_deref(), Some(&b"/"[..]));
        assert_eq!(client_path(&root, &root.join("a/b")).as_deref(), Some(&b"/a/b"[..]));
        assert_eq!(client_path(&root, Path::new("/etc")), None);
    }

    #[test]
    fn test_link_targets() {
        let (_dir, root) = scratch();
        fs::create_dir(root.join("dir")).unwrap();
        let link = root.join("dir/link");

        assert_eq!(confine_link_target(&root, &link, "file").unwrap(), root.join("dir/file"));
        assert_eq!(confine_link_target(&root, &link, "../../x").unwrap(), root.join("x"));
        assert_eq!(confine_link_target(&root, &link, "/top").unwrap(), root.join("top"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_are_kept_verbatim() {
        use std::os::unix::ffi::OsStrExt;
        let (_dir, root) = scratch();
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        fs::write(root.join(name), b"x").unwrap();

        let resolved = confine(&root, b"/caf\xe9.txt", Links::Follow).unwrap();
        assert_eq!(resolved, root.join(name));
        assert!(resolved.exists());
        assert_eq!(client_path(&root, &resolved).unwrap(), b"/caf\xe9.txt");
    }
}
