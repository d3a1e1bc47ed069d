use crate::config::extension_allowed;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Result of diffing a filesystem scan against the catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Catalogued paths that no longer exist on disk, sorted
    pub to_delete: Vec<String>,
    /// New or modified files with their observed mtime, sorted by path
    pub to_process: Vec<(String, f64)>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_process.is_empty()
    }
}

/// Modification time as fractional seconds since the Unix epoch.
pub fn file_mtime(metadata: &fs::Metadata) -> std::io::Result<f64> {
    let modified = metadata.modified()?;
    let secs = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    };
    Ok(secs)
}

/// Recursively collect `{canonical path: mtime}` for files under `root` whose
/// extension is allowed. Symlinks resolve to their target, so a file reached
/// through several links is reported once. Unreadable entries are logged and
/// skipped.
pub fn scan_directory(root: &Path, extensions: &[String]) -> BTreeMap<String, f64> {
    let mut files = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry under {:?}: {}", root, e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !extension_allowed(entry.path(), extensions) {
            continue;
        }

        let mtime = match entry
            .metadata()
            .map_err(std::io::Error::from)
            .and_then(|m| file_mtime(&m))
        {
            Ok(mtime) => mtime,
            Err(e) => {
                log::warn!(
                    "Skipping {:?}: cannot read modification time: {}",
                    entry.path(),
                    e
                );
                continue;
            }
        };

        let path = match entry.path().canonicalize() {
            Ok(path) => path,
            Err(e) => {
                log::warn!("Skipping {:?}: cannot resolve path: {}", entry.path(), e);
                continue;
            }
        };
        files
            .entry(path.to_string_lossy().into_owned())
            .or_insert(mtime);
    }

    log::debug!("Scanned {:?}: {} matching files", root, files.len());
    files
}

/// Classify every path as deleted, new/modified, or unchanged. A file counts
/// as modified when its mtime differs from the stored one at all.
pub fn detect_changes(
    scan: &BTreeMap<String, f64>,
    catalog: &HashMap<String, f64>,
) -> ChangeSet {
    let mut to_delete: Vec<String> = catalog
        .keys()
        .filter(|path| !scan.contains_key(*path))
        .cloned()
        .collect();
    to_delete.sort();

    let mut to_process = Vec::new();
    let mut unchanged = 0;
    for (path, &mtime) in scan {
        match catalog.get(path) {
            Some(&stored) if stored == mtime => unchanged += 1,
            _ => to_process.push((path.clone(), mtime)),
        }
    }

    ChangeSet {
        to_delete,
        to_process,
        unchanged,
    }
}
