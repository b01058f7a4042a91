//! Panel configuration (`deckhand.toml`).
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file,
//! environment variables (`PORT`, `DECKHAND_WORKSPACE`, ...), then CLI flags
//! applied by the `serve` command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = "deckhand.toml";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of static assets served for unmatched routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_dir: Option<PathBuf>,
    /// Attach a permissive CORS layer (for a UI served from elsewhere).
    #[serde(default)]
    pub permissive_cors: bool,
    /// Request body limit for uploads and archive deploys, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_dir: None,
            permissive_cors: false,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSection {
    /// Root directory the deployed program runs in.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    /// Transient storage for uploaded archives and files.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("user_bot")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("temp_uploads")
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            staging_dir: default_staging_dir(),
        }
    }
}

/// Supervised process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSection {
    /// Run command used when a deploy does not name one.
    #[serde(default = "default_run_command")]
    pub run_command: String,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    /// How long `stop` waits for exit before escalating to SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Regexes for stderr lines logged at `input` instead of `error`.
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,
}

fn default_run_command() -> String {
    crate::panel::pipeline::DEFAULT_RUN_COMMAND.to_string()
}

fn default_install_command() -> String {
    crate::panel::pipeline::DEFAULT_INSTALL_COMMAND.to_string()
}

fn default_install_timeout_secs() -> u64 {
    crate::panel::pipeline::DEFAULT_INSTALL_TIMEOUT.as_secs()
}

fn default_stop_grace_ms() -> u64 {
    1500
}

fn default_noise_patterns() -> Vec<String> {
    crate::panel::supervisor::DEFAULT_NOISE_PATTERNS
        .iter()
        .map(|p| regex::escape(p))
        .collect()
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            run_command: default_run_command(),
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            noise_patterns: default_noise_patterns(),
        }
    }
}

impl ProcessSection {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Log buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogsSection {
    /// Entries kept for replay to late-joining observers.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    crate::panel::logbuf::DEFAULT_LOG_CAPACITY
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// The complete deckhand.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PanelConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub process: ProcessSection,
    #[serde(default)]
    pub logs: LogsSection,
}

impl PanelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid deckhand.toml")
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize deckhand.toml")
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides from an arbitrary lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid PORT"),
            }
        }
        if let Some(host) = lookup("DECKHAND_HOST").filter(|h| !h.trim().is_empty()) {
            self.server.host = host;
        }
        if let Some(root) = lookup("DECKHAND_WORKSPACE").filter(|r| !r.trim().is_empty()) {
            self.workspace.root = PathBuf::from(root);
        }
        if let Some(command) = lookup("DECKHAND_RUN_COMMAND").filter(|c| !c.trim().is_empty()) {
            self.process.run_command = command;
        }
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.logs.capacity == 0 {
            errors.push("logs.capacity must be at least 1".to_string());
        }
        if self.process.run_command.trim().is_empty() {
            errors.push("process.run_command must not be empty".to_string());
        }
        if self.process.install_command.trim().is_empty() {
            errors.push("process.install_command must not be empty".to_string());
        }
        if self.process.install_timeout_secs == 0 {
            errors.push("process.install_timeout_secs must be greater than 0".to_string());
        }
        if self.server.max_upload_bytes == 0 {
            errors.push("server.max_upload_bytes must be greater than 0".to_string());
        }
        if self.workspace.root.as_os_str().is_empty() {
            errors.push("workspace.root must not be empty".to_string());
        }
        for pattern in &self.process.noise_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("Invalid noise pattern '{}': {}", pattern, e));
            }
        }

        errors
    }

    /// Fail with every validation problem joined into one error.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}
