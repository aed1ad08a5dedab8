use crate::error::SettingsError;
use crate::script::Interpreters;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// User-editable settings, persisted as a flat TOML document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Dispatcher executable (default: `webhook`, looked up on PATH)
    pub webhook_path: String,

    /// Interpreter for `.py` endpoints
    pub python_path: String,

    /// Shell for `.sh` endpoints
    pub bash_path: String,

    /// Directory scanned for endpoint scripts
    pub endpoints_path: String,

    /// Port the dispatcher listens on, 1-65535
    pub port: u32,

    /// Start the dispatcher as soon as the console opens
    pub auto_start: bool,

    /// Open the console without the cycling status line
    pub auto_minimize: bool,

    /// Pass `-verbose` to the dispatcher (needed for request counting)
    pub verbose: bool,

    /// Dispatcher URL prefix; the dispatcher's own default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_prefix: Option<String>,

    /// Generated hooks file handed to the dispatcher
    pub hooks_path: String,

    /// Dispatcher output log, truncated on every start
    pub log_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            webhook_path: default_webhook_path(),
            python_path: default_python_path(),
            bash_path: default_bash_path(),
            endpoints_path: default_endpoints_path(),
            port: default_port(),
            auto_start: false,
            auto_minimize: false,
            verbose: true,
            url_prefix: None,
            hooks_path: default_hooks_path(),
            log_path: default_log_path(),
        }
    }
}

fn default_webhook_path() -> String {
    "webhook".to_string()
}

fn default_python_path() -> String {
    let python = if cfg!(windows) { "python" } else { "python3" };
    python.to_string()
}

fn default_bash_path() -> String {
    "bash".to_string()
}

fn default_endpoints_path() -> String {
    "endpoints".to_string()
}

fn default_port() -> u32 {
    9000
}

fn default_hooks_path() -> String {
    "hooks.json".to_string()
}

fn default_log_path() -> String {
    "webhook.log".to_string()
}

impl Settings {
    /// Merge a TOML document over the defaults.
    ///
    /// Each key is read on its own: a key with the wrong type or an invalid
    /// value keeps its default. Unknown keys are ignored.
    pub fn from_toml_lenient(source: &str) -> Self {
        let mut settings = Settings::default();

        let table: toml::Table = match source.parse() {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "Settings file is not valid TOML, using defaults");
                return settings;
            }
        };

        read_key(&table, "webhook_path", &mut settings.webhook_path);
        read_key(&table, "python_path", &mut settings.python_path);
        read_key(&table, "bash_path", &mut settings.bash_path);
        read_key(&table, "endpoints_path", &mut settings.endpoints_path);
        read_key(&table, "port", &mut settings.port);
        read_key(&table, "auto_start", &mut settings.auto_start);
        read_key(&table, "auto_minimize", &mut settings.auto_minimize);
        read_key(&table, "verbose", &mut settings.verbose);
        read_key(&table, "hooks_path", &mut settings.hooks_path);
        read_key(&table, "log_path", &mut settings.log_path);

        let mut prefix = String::new();
        if read_key(&table, "url_prefix", &mut prefix) {
            settings.url_prefix = Some(prefix);
        }

        if let Err(e) = validate_port(settings.port) {
            warn!(port = settings.port, error = %e, "Ignoring invalid port");
            settings.port = default_port();
        }

        for key in table.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                debug!(key = %key, "Ignoring unknown settings key");
            }
        }

        settings
    }

    /// Reject values that cannot be saved
    pub fn validate(&self) -> Result<(), SettingsError> {
        validate_port(self.port)?;

        let paths = [
            ("webhook_path", &self.webhook_path),
            ("python_path", &self.python_path),
            ("bash_path", &self.bash_path),
            ("endpoints_path", &self.endpoints_path),
            ("hooks_path", &self.hooks_path),
            ("log_path", &self.log_path),
        ];
        for (key, value) in paths {
            if value.trim().is_empty() {
                return Err(SettingsError::InvalidSetting {
                    key: key.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Port as the dispatcher expects it
    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or(9000)
    }

    pub fn interpreters(&self) -> Interpreters {
        Interpreters {
            python: self.python_path.clone(),
            bash: self.bash_path.clone(),
        }
    }

    /// Anchor relative file paths at `base`.
    ///
    /// Executables given as bare names (`webhook`, `python3`) are left for a
    /// PATH lookup; only values containing a separator are anchored.
    pub fn resolved(&self, base: &Path) -> Settings {
        let anchor = |value: &str| base.join(value).to_string_lossy().into_owned();
        let anchor_executable = |value: &str| {
            if value.contains('/') || value.contains('\\') {
                anchor(value)
            } else {
                value.to_string()
            }
        };

        Settings {
            webhook_path: anchor_executable(&self.webhook_path),
            python_path: anchor_executable(&self.python_path),
            bash_path: anchor_executable(&self.bash_path),
            endpoints_path: anchor(&self.endpoints_path),
            hooks_path: anchor(&self.hooks_path),
            log_path: anchor(&self.log_path),
            ..self.clone()
        }
    }

    /// Apply a single `key = value` change given as text
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = |reason: &str| SettingsError::InvalidSetting {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let parse_bool = |value: &str| match value {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(invalid("expected true or false")),
        };

        match key {
            "webhook_path" => self.webhook_path = value.to_string(),
            "python_path" => self.python_path = value.to_string(),
            "bash_path" => self.bash_path = value.to_string(),
            "endpoints_path" => self.endpoints_path = value.to_string(),
            "hooks_path" => self.hooks_path = value.to_string(),
            "log_path" => self.log_path = value.to_string(),
            "port" => self.port = value.parse().map_err(|_| invalid("expected a number"))?,
            "auto_start" => self.auto_start = parse_bool(value)?,
            "auto_minimize" => self.auto_minimize = parse_bool(value)?,
            "verbose" => self.verbose = parse_bool(value)?,
            "url_prefix" => self.url_prefix = Some(value.to_string()),
            _ => return Err(invalid("unknown setting")),
        }
        Ok(())
    }

    /// Return `key` to its default. For `url_prefix` this means the
    /// dispatcher's own prefix, unlike an empty prefix which serves at root.
    pub fn unset(&mut self, key: &str) -> Result<(), SettingsError> {
        let defaults = Settings::default();
        match key {
            "webhook_path" => self.webhook_path = defaults.webhook_path,
            "python_path" => self.python_path = defaults.python_path,
            "bash_path" => self.bash_path = defaults.bash_path,
            "endpoints_path" => self.endpoints_path = defaults.endpoints_path,
            "hooks_path" => self.hooks_path = defaults.hooks_path,
            "log_path" => self.log_path = defaults.log_path,
            "port" => self.port = defaults.port,
            "auto_start" => self.auto_start = defaults.auto_start,
            "auto_minimize" => self.auto_minimize = defaults.auto_minimize,
            "verbose" => self.verbose = defaults.verbose,
            "url_prefix" => self.url_prefix = None,
            _ => {
                return Err(SettingsError::InvalidSetting {
                    key: key.to_string(),
                    reason: "unknown setting".to_string(),
                })
            }
        }
        Ok(())
    }
}

const KNOWN_KEYS: &[&str] = &[
    "webhook_path",
    "python_path",
    "bash_path",
    "endpoints_path",
    "port",
    "auto_start",
    "auto_minimize",
    "verbose",
    "url_prefix",
    "hooks_path",
    "log_path",
];

fn validate_port(port: u32) -> Result<(), SettingsError> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(SettingsError::InvalidSetting {
            key: "port".to_string(),
            reason: format!("{} is outside 1-65535", port),
        })
    }
}

/// Overwrite `slot` with the value of `key` if present and well-typed
fn read_key<T: DeserializeOwned>(table: &toml::Table, key: &str, slot: &mut T) -> bool {
    let Some(value) = table.get(key) else {
        return false;
    };
    match value.clone().try_into() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(e) => {
            warn!(key, error = %e, "Ignoring malformed setting");
            false
        }
    }
}

/// Settings file plus the in-memory copy the rest of the engine reads
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`. Never fails: a missing or unreadable file
    /// gives the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(source) => {
                info!(path = %path.display(), "Settings loaded");
                Settings::from_toml_lenient(&source)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No settings file, using defaults");
                Settings::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read settings, using defaults");
                Settings::default()
            }
        };
        Self::with_settings(path, settings)
    }

    /// Store backed by `path` holding `settings`, without touching the disk
    pub fn with_settings(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative settings paths are anchored at
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Current settings (cloned)
    pub fn get(&self) -> Settings {
        self.current.read().clone()
    }

    /// Current settings with paths anchored at [`base_dir`](Self::base_dir)
    pub fn resolved(&self) -> Settings {
        self.get().resolved(&self.base_dir())
    }

    /// Validate and persist `settings`, then make them current.
    ///
    /// The file is replaced atomically. On any error neither the file nor
    /// the in-memory settings change.
    pub fn save(&self, settings: Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        let document = toml::to_string(&settings)?;

        let dir = self.base_dir();
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(document.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        *self.current.write() = settings;
        info!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}
