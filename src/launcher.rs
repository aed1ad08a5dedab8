//! Per-request endpoint launcher
//!
//! The dispatcher runs `scriptgate invoke <relative-path>` once per request.
//! The launcher resolves the endpoint, feeds it the request body on stdin,
//! relays its output and exits with its exit code. Failures are reported on
//! stderr with exit code 1 and never affect other invocations.

use crate::config::Settings;
use crate::error::LaunchError;
use crate::routes::PAYLOAD_ENV;
use crate::script::{command_for, Interpreters, ScriptKind};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Subcommand the dispatcher uses to run the launcher
pub const INVOKE_COMMAND: &str = "invoke";

/// Exit code for failures inside the launcher itself
pub const LAUNCHER_FAILURE: i32 = 1;

/// Captured result of one endpoint execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Runs endpoint scripts below a fixed root
#[derive(Debug, Clone)]
pub struct Launcher {
    endpoints_root: PathBuf,
    interpreters: Interpreters,
}

impl Launcher {
    pub fn new(endpoints_root: impl Into<PathBuf>, interpreters: Interpreters) -> Self {
        Self {
            endpoints_root: endpoints_root.into(),
            interpreters,
        }
    }

    /// Launcher for already-resolved settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.endpoints_path, settings.interpreters())
    }

    /// Locate an endpoint script. Absolute paths and `..` never resolve.
    pub fn resolve(&self, relative_path: &str) -> Result<(PathBuf, ScriptKind), LaunchError> {
        let not_found = |path: PathBuf| LaunchError::EndpointNotFound {
            relative_path: relative_path.to_string(),
            path,
        };

        let relative = Path::new(relative_path);
        let escapes = relative_path.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(not_found(relative.to_path_buf()));
        }

        let path = self.endpoints_root.join(relative);
        if !path.is_file() {
            return Err(not_found(path));
        }

        let kind = ScriptKind::from_path(&path).ok_or_else(|| LaunchError::ExecutionError {
            command: path.to_string_lossy().into_owned(),
            reason: "not an endpoint script (expected .py, .sh, .bat or .ps1)".to_string(),
        })?;
        Ok((path, kind))
    }

    /// Execute an endpoint with the payload file's content on stdin
    pub async fn run(
        &self,
        relative_path: &str,
        payload_path: Option<&Path>,
    ) -> Result<InvocationOutput, LaunchError> {
        let (script, kind) = self.resolve(relative_path)?;

        let payload_path = payload_path.ok_or_else(|| {
            LaunchError::PayloadUnavailable(format!("{} is not set", PAYLOAD_ENV))
        })?;
        let payload = tokio::fs::read(payload_path).await.map_err(|e| {
            LaunchError::PayloadUnavailable(format!("{}: {}", payload_path.display(), e))
        })?;

        let command = command_for(kind, &script, &self.interpreters);
        let command_line = shell_words::join(&command);
        let execution_error = |reason: String| LaunchError::ExecutionError {
            command: command_line.clone(),
            reason,
        };

        debug!(command = %command_line, payload_bytes = payload.len(), "Executing endpoint");

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| execution_error(e.to_string()))?;

        // Feed stdin while output is collected so neither side can block
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Endpoint closed stdin before reading the payload");
                }
                // Dropping stdin signals end of input
            }
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| execution_error(e.to_string()))?;
        let _ = writer.await;

        Ok(InvocationOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(LAUNCHER_FAILURE),
        })
    }

    /// Run an endpoint and relay its output, returning the exit code to use
    pub async fn invoke<O: Write, E: Write>(
        &self,
        relative_path: &str,
        payload_path: Option<&Path>,
        stdout: &mut O,
        stderr: &mut E,
    ) -> i32 {
        match self.run(relative_path, payload_path).await {
            Ok(output) => {
                if let Err(e) = stdout.write_all(&output.stdout).and_then(|_| stdout.flush()) {
                    warn!(error = %e, "Failed to relay endpoint stdout");
                }
                if !output.stderr.is_empty() {
                    if let Err(e) = stderr.write_all(&output.stderr).and_then(|_| stderr.flush()) {
                        warn!(error = %e, "Failed to relay endpoint stderr");
                    }
                }
                output.exit_code
            }
            Err(e) => {
                let _ = writeln!(stderr, "{}: {}", e.code(), e);
                let _ = stderr.flush();
                LAUNCHER_FAILURE
            }
        }
    }

    /// [`invoke`](Self::invoke) with the payload path from the environment
    /// and this process's stdio
    pub async fn invoke_from_env(&self, relative_path: &str) -> i32 {
        let payload_path = std::env::var_os(PAYLOAD_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        self.invoke(relative_path, payload_path.as_deref(), &mut stdout, &mut stderr)
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        launcher: Launcher,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("endpoints")).unwrap();
            let launcher = Launcher::new(
                dir.path().join("endpoints"),
                Interpreters {
                    python: "python3".to_string(),
                    bash: "sh".to_string(),
                },
            );
            Self { dir, launcher }
        }

        fn endpoint(&self, relative: &str, body: &str) {
            let path = self.dir.path().join("endpoints").join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }

        fn payload(&self, body: &str) -> PathBuf {
            let path = self.dir.path().join("payload");
            fs::write(&path, body).unwrap();
            path
        }

        async fn invoke(&self, relative: &str, payload: Option<&Path>) -> (i32, String, String) {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let code = self.launcher.invoke(relative, payload, &mut out, &mut err).await;
            (
                code,
                String::from_utf8(out).unwrap(),
                String::from_utf8(err).unwrap(),
            )
        }
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails_without_panicking() {
        let fixture = Fixture::new();
        let payload = fixture.payload("{}");

        let (code, out, err) = fixture.invoke("missing.py", Some(&payload)).await;
        assert_ne!(code, 0);
        assert!(out.is_empty());
        assert!(err.starts_with("ENDPOINT_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_payload_is_piped_to_stdin() {
        let fixture = Fixture::new();
        fixture.endpoint("echo.sh", "cat\n");
        let payload = fixture.payload(r#"{"name":"Ada"}"#);

        let (code, out, err) = fixture.invoke("echo.sh", Some(&payload)).await;
        assert_eq!(code, 0);
        assert_eq!(out, r#"{"name":"Ada"}"#);
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn test_python_echo_endpoint() {
        if !python_available() {
            eprintln!("python3 not available, skipping");
            return;
        }
        let fixture = Fixture::new();
        fixture.endpoint("echo.py", "import sys\nsys.stdout.write(sys.stdin.read())\n");
        let payload = fixture.payload(r#"{"name":"Ada"}"#);

        let (code, out, _) = fixture.invoke("echo.py", Some(&payload)).await;
        assert_eq!(code, 0);
        assert!(out.contains(r#"{"name":"Ada"}"#));
    }

    #[tokio::test]
    async fn test_large_payload_is_delivered_in_full() {
        let fixture = Fixture::new();
        fixture.endpoint("count.sh", "wc -c | tr -d ' '\n");
        let body = "x".repeat(1 << 20);
        let payload = fixture.payload(&body);

        let (code, out, _) = fixture.invoke("count.sh", Some(&payload)).await;
        assert_eq!(code, 0);
        assert_eq!(out.trim(), (1 << 20).to_string());
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr_pass_through() {
        let fixture = Fixture::new();
        fixture.endpoint("jobs/fail.sh", "echo partial\necho boom >&2\nexit 3\n");
        let payload = fixture.payload("");

        let (code, out, err) = fixture.invoke("jobs/fail.sh", Some(&payload)).await;
        assert_eq!(code, 3);
        assert_eq!(out, "partial\n");
        assert_eq!(err, "boom\n");
    }

    #[tokio::test]
    async fn test_missing_payload() {
        let fixture = Fixture::new();
        fixture.endpoint("echo.sh", "cat\n");

        let (code, _, err) = fixture.invoke("echo.sh", None).await;
        assert_eq!(code, LAUNCHER_FAILURE);
        assert!(err.starts_with("PAYLOAD_UNAVAILABLE"));

        let missing = fixture.dir.path().join("no-such-payload");
        let (code, _, err) = fixture.invoke("echo.sh", Some(&missing)).await;
        assert_eq!(code, LAUNCHER_FAILURE);
        assert!(err.contains("no-such-payload"));
    }

    #[tokio::test]
    async fn test_paths_outside_the_root_are_not_found() {
        let fixture = Fixture::new();
        fs::write(fixture.dir.path().join("secret.sh"), "echo leaked\n").unwrap();
        let payload = fixture.payload("");

        let (code, out, err) = fixture.invoke("../secret.sh", Some(&payload)).await;
        assert_eq!(code, LAUNCHER_FAILURE);
        assert!(out.is_empty());
        assert!(err.starts_with("ENDPOINT_NOT_FOUND"));

        let absolute = fixture.dir.path().join("secret.sh");
        let (code, _, _) = fixture.invoke(absolute.to_str().unwrap(), Some(&payload)).await;
        assert_eq!(code, LAUNCHER_FAILURE);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_execution_error() {
        let mut fixture = Fixture::new();
        fixture.launcher.interpreters.bash = "/nonexistent/shell".to_string();
        fixture.endpoint("echo.sh", "cat\n");
        let payload = fixture.payload("");

        let (code, _, err) = fixture.invoke("echo.sh", Some(&payload)).await;
        assert_eq!(code, LAUNCHER_FAILURE);
        assert!(err.starts_with("EXECUTION_ERROR"));
    }

    #[tokio::test]
    async fn test_signal_killed_endpoint_exits_with_failure() {
        let fixture = Fixture::new();
        fixture.endpoint("killed.sh", "echo partial\nkill -9 $$\necho unreachable\n");
        let payload = fixture.payload("{}");

        let (code, out, _) = fixture.invoke("killed.sh", Some(&payload)).await;
        assert_eq!(code, LAUNCHER_FAILURE);
        assert_eq!(out, "partial\n");
    }

    #[tokio::test]
    async fn test_unknown_extension_is_rejected() {
        let fixture = Fixture::new();
        fixture.endpoint("notes.txt", "hello");
        let payload = fixture.payload("");

        let (code, _, err) = fixture.invoke("notes.txt", Some(&payload)).await;
        assert_eq!(code, LAUNCHER_FAILURE);
        assert!(err.starts_with("EXECUTION_ERROR"));
    }

    #[test]
    fn test_resolve_matches_route_command() {
        let fixture = Fixture::new();
        fixture.endpoint("users/create.sh", "true\n");

        let (path, kind) = fixture.launcher.resolve("users/create.sh").unwrap();
        assert_eq!(kind, ScriptKind::Shell);
        assert_eq!(
            command_for(kind, &path, &fixture.launcher.interpreters),
            vec!["sh".to_string(), path.to_string_lossy().into_owned()]
        );
    }
}
