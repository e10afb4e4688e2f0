use std::fs::{self, File, Metadata as StdMetadata, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use nix::libc;
use nix::unistd::{Gid, Group, Uid, User};

use crate::error::{IoResultExt, Result};
use crate::hash::Hash;
use crate::types::{EntryType, Metadata};

/// file type as seen without following symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    /// fifo, socket or device node
    Other,
}

impl FileType {
    /// detect file type from metadata; symlinks are checked first
    pub fn from_metadata(meta: &StdMetadata) -> Self {
        let ft = meta.file_type();
        if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_dir() {
            FileType::Directory
        } else if ft.is_file() {
            FileType::Regular
        } else {
            FileType::Other
        }
    }

    pub fn entry_type(self) -> Option<EntryType> {
        match self {
            FileType::Regular => Some(EntryType::File),
            FileType::Directory => Some(EntryType::Directory),
            FileType::Symlink => Some(EntryType::Symlink),
            FileType::Other => None,
        }
    }
}

/// raw metadata for a filesystem entry
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub file_type: FileType,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
}

impl FileMetadata {
    /// read metadata from path (does not follow symlinks)
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_std_metadata(&meta))
    }

    /// create from std::fs::Metadata
    pub fn from_std_metadata(meta: &StdMetadata) -> Self {
        Self {
            file_type: FileType::from_metadata(meta),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            size: meta.len(),
            mtime: meta.mtime(),
            atime: meta.atime(),
            ctime: meta.ctime(),
        }
    }

    /// manifest metadata, with uid/gid resolved to names where possible
    pub fn to_metadata(&self) -> Metadata {
        Metadata {
            mode: self.mode & 0o7777,
            owner: owner_name(self.uid),
            group: group_name(self.gid),
            mtime: self.mtime,
            atime: self.atime,
            ctime: self.ctime,
            size: self.size,
        }
    }
}

/// account name for a uid, or the uid itself
pub fn owner_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// group name for a gid, or the gid itself
pub fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

/// resolve a recorded owner (name or numeric) to a uid
pub fn resolve_owner(owner: &str) -> Option<u32> {
    if let Ok(Some(user)) = User::from_name(owner) {
        return Some(user.uid.as_raw());
    }
    owner.parse().ok()
}

/// resolve a recorded group (name or numeric) to a gid
pub fn resolve_group(group: &str) -> Option<u32> {
    if let Ok(Some(g)) = Group::from_name(group) {
        return Some(g.gid.as_raw());
    }
    group.parse().ok()
}

/// open a file for reading without touching its atime when allowed
///
/// O_NOATIME is refused for files we do not own, so fall back to a plain open.
pub fn open_for_read(path: &Path) -> std::io::Result<File> {
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOATIME)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => File::open(path),
        Err(e) => Err(e),
    }
}

/// md5 of a file's content
pub fn hash_file(path: &Path) -> Result<Hash> {
    let mut file = open_for_read(path).with_path(path)?;
    Hash::of_reader(&mut file).with_path(path)
}

/// read symlink target
pub fn read_symlink_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).with_path(path)?;
    Ok(target.to_string_lossy().into_owned())
}
