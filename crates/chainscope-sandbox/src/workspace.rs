//! Workspace introspection.
//!
//! The workspace directory is the only inter-execution communication channel
//! within a session. After every execution the workspace is re-listed and
//! compared against a pre-execution snapshot to report new or modified files.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

/// A single file visible in a session workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFile {
    /// Path relative to the workspace root, `/`-separated.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

/// List the workspace contents, recursively.
///
/// Hidden entries (leading `.`) are skipped — staged code and bookkeeping
/// live in dot-directories and must not show up as user output. The listing
/// is sorted by name. I/O errors on individual entries are skipped rather
/// than failing the whole listing.
pub fn list_workspace(root: &Path) -> Vec<WorkspaceFile> {
    let mut files = Vec::new();
    collect(root, root, &mut files);
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<WorkspaceFile>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };

        if meta.is_dir() {
            collect(root, &path, out);
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(WorkspaceFile {
                name: rel,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
}

/// Names of files that are new or modified in `after` relative to `before`.
pub fn diff_output_files(before: &[WorkspaceFile], after: &[WorkspaceFile]) -> Vec<String> {
    let prior: HashMap<&str, &WorkspaceFile> =
        before.iter().map(|f| (f.name.as_str(), f)).collect();

    after
        .iter()
        .filter(|f| match prior.get(f.name.as_str()) {
            None => true,
            Some(old) => old.size != f.size || old.modified != f.modified,
        })
        .map(|f| f.name.clone())
        .collect()
}

/// Format a byte size into a human-readable string.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;

    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    format!("{:.1} {}B", bytes as f64 / div as f64, b"KMGTPE"[exp] as char)
}
