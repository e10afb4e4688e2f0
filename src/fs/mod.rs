pub mod read;
pub mod scan;
pub mod write;

use std::path::Path;

pub use read::{
    group_name, hash_file, open_for_read, owner_name, read_symlink_target, resolve_group,
    resolve_owner, FileMetadata, FileType,
};
pub use scan::{ScanItem, Scanner};
pub use write::{create_symlink, place_file, set_mode, set_owner, set_symlink_owner, set_times};

/// `path` relative to `root` with `/` separators; `.` for the root itself
pub fn relative_path(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}
