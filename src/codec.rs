//! line-oriented manifest text format
//!
//! one entry per line, tab-separated:
//!
//! ```text
//! FILE  path  hash    perm owner group mtime atime ctime size
//! DIR   path  [DIR]   perm owner group mtime atime ctime size
//! LINK  path  [LINK]  target perm owner group mtime atime ctime size
//! ```
//!
//! older generations are still readable: bare `path hash` lines, and
//! lines with six metadata fields (no size). writes always use the full
//! form. tabs and newlines inside paths are not escaped.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::types::{Manifest, ManifestEntry, Metadata};

pub const DIR_MARKER: &str = "[DIR]";
pub const LINK_MARKER: &str = "[LINK]";

/// metadata field count without size (second generation)
const META_FIELDS_V2: usize = 6;
/// metadata field count with size (current generation)
const META_FIELDS_V3: usize = 7;

/// encode one entry as a single line (no trailing newline)
pub fn encode_entry(entry: &ManifestEntry) -> String {
    let mut fields: Vec<String> = match entry {
        ManifestEntry::File { path, hash, .. } => vec![path.clone(), hash.to_hex()],
        ManifestEntry::Directory { path, .. } => vec![path.clone(), DIR_MARKER.to_string()],
        ManifestEntry::Symlink { path, target, .. } => {
            vec![path.clone(), LINK_MARKER.to_string(), target.clone()]
        }
    };

    // entries decoded from the bare generation have nothing more to write
    if let Some(meta) = entry.metadata() {
        fields.push(format!("{:o}", meta.mode));
        fields.push(meta.owner.clone());
        fields.push(meta.group.clone());
        fields.push(meta.mtime.to_string());
        fields.push(meta.atime.to_string());
        fields.push(meta.ctime.to_string());
        fields.push(meta.size.to_string());
    }

    fields.join("\t")
}

/// decode one line; `line_no` is only used for error messages
pub fn decode_entry(line: &str, line_no: usize) -> Result<ManifestEntry> {
    let fields: Vec<&str> = line.split('\t').collect();
    let invalid = |message: String| Error::InvalidManifestLine {
        line: line_no,
        message,
    };

    if fields.len() < 2 {
        return Err(invalid(format!("expected at least 2 fields, got {}", fields.len())));
    }
    let path = fields[0];
    if path.is_empty() {
        return Err(invalid("empty path".to_string()));
    }

    match fields[1] {
        DIR_MARKER => {
            let metadata = decode_metadata(&fields[2..], line_no)?;
            Ok(ManifestEntry::Directory {
                path: path.to_string(),
                metadata,
            })
        }
        LINK_MARKER => {
            let target = fields
                .get(2)
                .ok_or_else(|| invalid("symlink without target".to_string()))?;
            let metadata = decode_metadata(&fields[3..], line_no)?;
            Ok(ManifestEntry::Symlink {
                path: path.to_string(),
                target: target.to_string(),
                metadata,
            })
        }
        hash => {
            let hash = Hash::from_hex(hash)
                .map_err(|_| invalid(format!("invalid hash {:?}", hash)))?;
            let metadata = decode_metadata(&fields[2..], line_no)?;
            Ok(ManifestEntry::File {
                path: path.to_string(),
                hash,
                metadata,
            })
        }
    }
}

fn decode_metadata(fields: &[&str], line_no: usize) -> Result<Option<Metadata>> {
    let invalid = |message: String| Error::InvalidManifestLine {
        line: line_no,
        message,
    };

    match fields.len() {
        0 => return Ok(None),
        META_FIELDS_V2 | META_FIELDS_V3 => {}
        n => return Err(invalid(format!("unexpected metadata field count {}", n))),
    }

    let mode = u32::from_str_radix(fields[0], 8)
        .map_err(|_| invalid(format!("invalid permissions {:?}", fields[0])))?;
    let time = |s: &str| {
        s.parse::<i64>()
            .map_err(|_| invalid(format!("invalid timestamp {:?}", s)))
    };
    let size = match fields.get(6) {
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| invalid(format!("invalid size {:?}", s)))?,
        None => 0,
    };

    Ok(Some(Metadata {
        mode,
        owner: fields[1].to_string(),
        group: fields[2].to_string(),
        mtime: time(fields[3])?,
        atime: time(fields[4])?,
        ctime: time(fields[5])?,
        size,
    }))
}

/// encode a manifest's entries, one per line, newline-terminated
pub fn encode_manifest(manifest: &Manifest) -> String {
    let mut out = String::new();
    for entry in manifest.entries() {
        out.push_str(&encode_entry(entry));
        out.push('\n');
    }
    out
}

/// decode manifest text; blank lines are ignored
pub fn decode_manifest(text: &str) -> Result<Manifest> {
    let mut entries = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        entries.push(decode_entry(line, i + 1)?);
    }
    Manifest::from_entries(entries)
}
