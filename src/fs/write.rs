use std::ffi::CString;
use std::fs::{self, Permissions};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use nix::libc;
use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;
use nix::unistd::{chown, Gid, Uid};

use crate::error::{Error, IoResultExt, Result};

fn nix_error(path: &Path, e: nix::errno::Errno) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    }
}

/// create a symlink and confirm it reads back to `target`
///
/// an existing non-directory at `path` is replaced; a directory is left
/// alone and makes this fail.
pub fn create_symlink(path: &Path, target: &str) -> Result<()> {
    if let Ok(meta) = path.symlink_metadata() {
        if meta.is_dir() {
            return Err(Error::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "directory in the way of symlink",
                ),
            });
        }
        fs::remove_file(path).with_path(path)?;
    }

    symlink(target, path).with_path(path)?;

    let read_back = fs::read_link(path).with_path(path)?;
    if read_back.as_os_str() != target {
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("symlink reads back as {}", read_back.display()),
            ),
        });
    }
    Ok(())
}

/// copy blob content to `dest`, replacing whatever file is there
pub fn place_file(blob: &Path, dest: &Path) -> Result<()> {
    if let Ok(meta) = dest.symlink_metadata() {
        if !meta.is_dir() {
            fs::remove_file(dest).with_path(dest)?;
        }
    }
    fs::copy(blob, dest).with_path(dest)?;
    Ok(())
}

/// chmod
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).with_path(path)
}

/// chown/chgrp, following symlinks
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| nix_error(path, e))
}

/// chown/chgrp on the link itself
pub fn set_symlink_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid path"),
    })?;
    let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// set access and modification times (whole seconds)
pub fn set_times(path: &Path, atime: i64, mtime: i64) -> Result<()> {
    let atime = TimeVal::new(atime as _, 0);
    let mtime = TimeVal::new(mtime as _, 0);
    utimes(path, &atime, &mtime).map_err(|e| nix_error(path, e))
}
