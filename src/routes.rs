//! Route table generation and the dispatcher's hooks file
//!
//! Each discovered endpoint becomes one hook. The hook runs the launcher with
//! the endpoint's relative path; the request body reaches the launcher only
//! through the payload file named by [`PAYLOAD_ENV`].

use crate::config::Settings;
use crate::discovery::EndpointFile;
use crate::error::{RouteCollision, RouteError};
use crate::script::{command_for, Interpreters, ScriptKind};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable holding the path of the raw request body file
pub const PAYLOAD_ENV: &str = "WEBHOOK_PAYLOAD";

/// URL prefix the dispatcher uses when none is configured
pub const DEFAULT_URL_PREFIX: &str = "hooks";

/// How the launcher itself is executed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSpec {
    /// Launcher executable
    pub program: PathBuf,
    /// Arguments placed before the endpoint's relative path
    pub args: Vec<String>,
}

impl LauncherSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Inputs to route table generation other than the endpoint files
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// Directory the endpoint relative paths are resolved against
    pub endpoints_root: PathBuf,
    /// Working directory for launcher processes
    pub working_dir: PathBuf,
    pub launcher: LauncherSpec,
    pub interpreters: Interpreters,
}

impl RouteConfig {
    /// Route inputs for resolved settings
    pub fn from_settings(settings: &Settings, working_dir: &Path, launcher: LauncherSpec) -> Self {
        Self {
            endpoints_root: PathBuf::from(&settings.endpoints_path),
            working_dir: working_dir.to_path_buf(),
            launcher,
            interpreters: settings.interpreters(),
        }
    }
}

/// Request body hand-off: written to a temp file whose path is exported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadBinding {
    pub env_var: &'static str,
}

impl Default for PayloadBinding {
    fn default() -> Self {
        Self { env_var: PAYLOAD_ENV }
    }
}

/// One row of the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Relative path without extension
    pub id: String,
    pub relative_path: String,
    pub kind: ScriptKind,
    /// How the launcher will execute the endpoint
    pub command: Vec<String>,
    pub launcher_program: PathBuf,
    /// Launcher argument prefix followed by the relative path
    pub launcher_args: Vec<String>,
    pub payload: PayloadBinding,
    pub working_dir: PathBuf,
}

/// Routing table keyed by route id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    entries: BTreeMap<String, RouteEntry>,
}

/// Route id for an endpoint's relative path: the extension is dropped and
/// separators are normalized to `/`. Case is preserved.
pub fn route_id(relative_path: &str) -> String {
    let normalized = relative_path.replace('\\', "/");
    let file_start = normalized.rfind('/').map(|i| i + 1).unwrap_or(0);
    match normalized[file_start..].rfind('.') {
        Some(dot) if dot > 0 => normalized[..file_start + dot].to_string(),
        _ => normalized,
    }
}

impl RouteTable {
    /// Build the table for a set of endpoint files.
    ///
    /// Fails with [`RouteError::DuplicateRouteIds`] when files map to the
    /// same id; the error names every colliding id and path.
    pub fn build<'a, I>(files: I, config: &RouteConfig) -> Result<Self, RouteError>
    where
        I: IntoIterator<Item = &'a EndpointFile>,
    {
        let mut entries: BTreeMap<String, RouteEntry> = BTreeMap::new();
        let mut collisions: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for file in files {
            let id = route_id(&file.relative_path);
            match entries.entry(id.clone()) {
                Entry::Occupied(existing) => {
                    collisions
                        .entry(id)
                        .or_insert_with(|| vec![existing.get().relative_path.clone()])
                        .push(file.relative_path.clone());
                }
                Entry::Vacant(slot) => {
                    slot.insert(Self::entry_for(id, file, config));
                }
            }
        }

        if !collisions.is_empty() {
            let collisions = collisions
                .into_iter()
                .map(|(id, mut paths)| {
                    paths.sort();
                    RouteCollision { id, paths }
                })
                .collect();
            return Err(RouteError::DuplicateRouteIds(collisions));
        }

        Ok(Self { entries })
    }

    fn entry_for(id: String, file: &EndpointFile, config: &RouteConfig) -> RouteEntry {
        let script_path = config.endpoints_root.join(&file.relative_path);
        let mut launcher_args = config.launcher.args.clone();
        launcher_args.push(file.relative_path.clone());

        RouteEntry {
            id,
            relative_path: file.relative_path.clone(),
            kind: file.kind,
            command: command_for(file.kind, &script_path, &config.interpreters),
            launcher_program: config.launcher.program.clone(),
            launcher_args,
            payload: PayloadBinding::default(),
            working_dir: config.working_dir.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&RouteEntry> {
        self.entries.get(id)
    }

    /// Entries ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    /// Public URL path for a route id. Unset means the dispatcher's default
    /// prefix; an empty prefix serves at root.
    pub fn url_for(id: &str, url_prefix: Option<&str>) -> String {
        let prefix = url_prefix.unwrap_or(DEFAULT_URL_PREFIX).trim_matches('/');
        if prefix.is_empty() {
            format!("/{}", id)
        } else {
            format!("/{}/{}", prefix, id)
        }
    }

    /// Serialize in the dispatcher's hooks format. Output is identical for
    /// identical tables.
    pub fn to_hooks_json(&self) -> String {
        let hooks: Vec<HookDefinition<'_>> = self.iter().map(HookDefinition::from).collect();
        // Only strings, bools and sequences: serialization cannot fail
        let mut json = serde_json::to_string_pretty(&hooks).unwrap_or_else(|_| "[]".to_string());
        json.push('\n');
        json
    }

    /// Atomically replace the hooks file with this table
    pub fn write_hooks_file(&self, path: &Path) -> Result<(), RouteError> {
        let write_err = |source| RouteError::Write {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(self.to_hooks_json().as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        info!(path = %path.display(), hooks = self.len(), "Wrote hooks file");
        Ok(())
    }
}

/// Hook entry as the dispatcher reads it
#[derive(Serialize)]
struct HookDefinition<'a> {
    id: &'a str,
    #[serde(rename = "execute-command")]
    execute_command: String,
    #[serde(rename = "command-working-directory")]
    working_directory: String,
    #[serde(rename = "pass-arguments-to-command")]
    arguments: Vec<HookArgument<'a>>,
    #[serde(rename = "pass-file-to-command")]
    files: Vec<HookFile<'a>>,
    #[serde(rename = "include-command-output-in-response")]
    include_output: bool,
}

#[derive(Serialize)]
struct HookArgument<'a> {
    source: &'static str,
    name: &'a str,
}

#[derive(Serialize)]
struct HookFile<'a> {
    source: &'static str,
    envname: &'a str,
    base64decode: bool,
}

impl<'a> From<&'a RouteEntry> for HookDefinition<'a> {
    fn from(entry: &'a RouteEntry) -> Self {
        Self {
            id: &entry.id,
            execute_command: entry.launcher_program.to_string_lossy().into_owned(),
            working_directory: entry.working_dir.to_string_lossy().into_owned(),
            arguments: entry
                .launcher_args
                .iter()
                .map(|arg| HookArgument {
                    source: "string",
                    name: arg,
                })
                .collect(),
            files: vec![HookFile {
                source: "raw-request-body",
                envname: entry.payload.env_var,
                base64decode: false,
            }],
            include_output: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RouteConfig {
        RouteConfig {
            endpoints_root: PathBuf::from("/srv/scriptgate/endpoints"),
            working_dir: PathBuf::from("/srv/scriptgate"),
            launcher: LauncherSpec::new("/usr/local/bin/scriptgate").with_args(vec![
                "--config".to_string(),
                "/srv/scriptgate/scriptgate.toml".to_string(),
                "invoke".to_string(),
            ]),
            interpreters: Interpreters {
                python: "python3".to_string(),
                bash: "bash".to_string(),
            },
        }
    }

    fn files(paths: &[&str]) -> Vec<EndpointFile> {
        paths.iter().map(|p| EndpointFile::new(*p).unwrap()).collect()
    }

    #[test]
    fn test_route_id() {
        assert_eq!(route_id("hello.py"), "hello");
        assert_eq!(route_id("users/create.sh"), "users/create");
        assert_eq!(route_id("users\\admin\\reset.ps1"), "users/admin/reset");
        assert_eq!(route_id("v1.2/report.tar.py"), "v1.2/report.tar");
        assert_eq!(route_id("Users/Create.py"), "Users/Create");
    }

    #[test]
    fn test_build_one_entry_per_file() {
        let table = RouteTable::build(&files(&["hello.py", "users/create.sh", "jobs/run.bat"]), &test_config()).unwrap();
        assert_eq!(table.len(), 3);

        let ids: Vec<&str> = table.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["hello", "jobs/run", "users/create"]);

        let hello = table.get("hello").unwrap();
        assert_eq!(hello.command, vec!["python3", "/srv/scriptgate/endpoints/hello.py"]);
        assert_eq!(
            hello.launcher_args,
            vec!["--config", "/srv/scriptgate/scriptgate.toml", "invoke", "hello.py"]
        );
        assert_eq!(hello.payload.env_var, "WEBHOOK_PAYLOAD");

        let job = table.get("jobs/run").unwrap();
        assert_eq!(job.command, vec!["/srv/scriptgate/endpoints/jobs/run.bat"]);
    }

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let err = RouteTable::build(&files(&["a/b.py", "a/b.sh", "c.py"]), &test_config()).unwrap_err();
        match err {
            RouteError::DuplicateRouteIds(collisions) => {
                assert_eq!(
                    collisions,
                    vec![RouteCollision {
                        id: "a/b".to_string(),
                        paths: vec!["a/b.py".to_string(), "a/b.sh".to_string()],
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_reports_every_collision() {
        let err = RouteTable::build(
            &files(&["c.py", "a/b.sh", "ok.sh", "c.bat", "a/b.py", "c.ps1"]),
            &test_config(),
        )
        .unwrap_err();
        let collisions = match err {
            RouteError::DuplicateRouteIds(collisions) => collisions,
            other => panic!("unexpected error: {other}"),
        };
        let ids: Vec<&str> = collisions.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a/b", "c"]);
        assert_eq!(collisions[0].paths, vec!["a/b.py", "a/b.sh"]);
        assert_eq!(collisions[1].paths, vec!["c.bat", "c.ps1", "c.py"]);
    }

    #[test]
    fn test_duplicate_ids_write_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let hooks = tmp.path().join("hooks.json");
        std::fs::write(&hooks, "previous").unwrap();

        let result = RouteTable::build(&files(&["x.py", "x.bat"]), &test_config())
            .and_then(|table| table.write_hooks_file(&hooks));
        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&hooks).unwrap(), "previous");
    }

    #[test]
    fn test_hooks_json_is_byte_stable() {
        let first = RouteTable::build(&files(&["b.py", "a.sh", "c/d.ps1"]), &test_config()).unwrap();
        let second = RouteTable::build(&files(&["c/d.ps1", "b.py", "a.sh"]), &test_config()).unwrap();
        assert_eq!(first.to_hooks_json(), second.to_hooks_json());
    }

    #[test]
    fn test_hooks_json_format() {
        let table = RouteTable::build(&files(&["greet \"me\".py"]), &test_config()).unwrap();
        let json = table.to_hooks_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        let hook = &parsed[0];
        assert_eq!(hook["id"], "greet \"me\"");
        assert_eq!(hook["execute-command"], "/usr/local/bin/scriptgate");
        assert_eq!(hook["command-working-directory"], "/srv/scriptgate");
        assert_eq!(hook["include-command-output-in-response"], true);

        let args = hook["pass-arguments-to-command"].as_array().unwrap();
        assert_eq!(args.len(), 4);
        assert_eq!(args[3]["source"], "string");
        assert_eq!(args[3]["name"], "greet \"me\".py");

        let file = &hook["pass-file-to-command"][0];
        assert_eq!(file["source"], "raw-request-body");
        assert_eq!(file["envname"], "WEBHOOK_PAYLOAD");
        assert_eq!(file["base64decode"], false);

        // Interpreter command and payload stay out of the argument list
        assert!(!json.contains("python3"));
    }

    #[test]
    fn test_write_hooks_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/hooks.json");
        let table = RouteTable::build(&files(&["hello.py"]), &test_config()).unwrap();

        table.write_hooks_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), table.to_hooks_json());
    }

    #[test]
    fn test_empty_table_serializes_to_empty_list() {
        let table = RouteTable::build(&files(&[]), &test_config()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.to_hooks_json(), "[]\n");
    }

    #[test]
    fn test_url_for() {
        assert_eq!(RouteTable::url_for("users/create", None), "/hooks/users/create");
        assert_eq!(RouteTable::url_for("hello", Some("api")), "/api/hello");
        assert_eq!(RouteTable::url_for("hello", Some("/api/")), "/api/hello");
        assert_eq!(RouteTable::url_for("hello", Some("")), "/hello");
        assert_eq!(RouteTable::url_for("a/b", Some("/")), "/a/b");
    }
}
