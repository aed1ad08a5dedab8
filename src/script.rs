//! Extension-based script dispatch
//!
//! The route table and the launcher both decide how to execute an endpoint
//! file through [`command_for`], so a given file always runs the same way.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of endpoint script, determined by its file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// `.py`, run through the configured Python interpreter
    Python,
    /// `.sh`, run through the configured shell
    Shell,
    /// `.bat`, executed directly
    Batch,
    /// `.ps1`, executed directly
    PowerShell,
}

impl ScriptKind {
    /// All kinds, in discovery order
    pub const ALL: [ScriptKind; 4] = [
        ScriptKind::Python,
        ScriptKind::Shell,
        ScriptKind::Batch,
        ScriptKind::PowerShell,
    ];

    /// File extension without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptKind::Python => "py",
            ScriptKind::Shell => "sh",
            ScriptKind::Batch => "bat",
            ScriptKind::PowerShell => "ps1",
        }
    }

    /// Match an extension exactly. `PY` is not `py`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }

    /// Kind of the file at `path`, if it has an allowed extension
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

/// Interpreters used for scripts that are not executed directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreters {
    pub python: String,
    pub bash: String,
}

/// Command vector that executes `path` as a script of the given kind
pub fn command_for(kind: ScriptKind, path: &Path, interpreters: &Interpreters) -> Vec<String> {
    let file = path.to_string_lossy().into_owned();
    match kind {
        ScriptKind::Python => vec![interpreters.python.clone(), file],
        ScriptKind::Shell => vec![interpreters.bash.clone(), file],
        ScriptKind::Batch | ScriptKind::PowerShell => vec![file],
    }
}
