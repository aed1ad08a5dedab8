//! Endpoint discovery
//!
//! Walks the endpoints root for script files with an allowed extension.

use crate::script::ScriptKind;
use std::collections::BTreeSet;
use std::path::{Component, Path};
use tracing::{debug, warn};

/// A script found under the endpoints root
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointFile {
    /// Path relative to the endpoints root, always `/`-separated
    pub relative_path: String,
    /// Script kind derived from the extension
    pub kind: ScriptKind,
}

impl EndpointFile {
    /// Build from a relative path, if the extension is allowed
    pub fn new(relative_path: impl Into<String>) -> Option<Self> {
        let relative_path = relative_path.into().replace('\\', "/");
        let kind = ScriptKind::from_path(&relative_path)?;
        Some(Self { relative_path, kind })
    }
}

/// Find every endpoint script below `root`.
///
/// A missing root yields an empty set. Unreadable entries are logged and
/// skipped. Extension matching is case-sensitive.
pub fn discover(root: &Path) -> BTreeSet<EndpointFile> {
    let mut files = BTreeSet::new();

    if !root.is_dir() {
        debug!(root = %root.display(), "Endpoints root does not exist");
        return files;
    }

    let Some(root_str) = root.to_str() else {
        warn!(root = %root.display(), "Endpoints root is not valid UTF-8, skipping discovery");
        return files;
    };
    let escaped_root = glob::Pattern::escape(root_str.trim_end_matches(['/', '\\']));

    for kind in ScriptKind::ALL {
        let pattern = format!("{}/**/*.{}", escaped_root, kind.extension());
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(%pattern, error = %e, "Invalid discovery pattern");
                continue;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %e.path().display(), error = %e.error(), "Skipping unreadable path");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let Some(relative) = relative_path(root, &path) else {
                continue;
            };
            // `*.py` also matches a bare `.py`, which has no extension
            if let Some(file) = EndpointFile::new(relative).filter(|f| f.kind == kind) {
                files.insert(file);
            }
        }
    }

    debug!(root = %root.display(), count = files.len(), "Discovered endpoint files");
    files
}

/// `/`-joined path of `path` below `root`
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = stripped
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
