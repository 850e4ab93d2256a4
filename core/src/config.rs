use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::error::SqlCellErr;

const CONFIG_FILE_NAME: &str = "config.toml";
const HOME_ENV_VAR: &str = "SQLCELL_HOME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SqlCellConfig {
    /// Engine executable, resolved through `PATH` when relative.
    #[serde(default = "default_engine_path")]
    pub engine_path: PathBuf,

    /// Database file passed to the engine. `None` runs in-memory.
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Maximum number of result lines returned per execution. `None`
    /// disables truncation.
    #[serde(default = "default_max_result_lines")]
    pub max_result_lines: Option<usize>,

    #[serde(default = "default_error_excerpt_lines")]
    pub error_excerpt_lines: usize,

    /// Where per-execution temp files live. Defaults to the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    #[serde(default = "default_progress_refresh_ms")]
    pub progress_refresh_ms: u64,

    #[serde(default)]
    pub display: DisplaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DisplaySettings {
    /// Display mode used for raw (unparsed) results.
    #[serde(default = "default_raw_mode")]
    pub raw_mode: String,

    #[serde(default)]
    pub timer: bool,

    #[serde(default = "default_headers")]
    pub headers: bool,

    #[serde(default = "default_null_value")]
    pub null_value: String,

    #[serde(default)]
    pub separator: Option<String>,
}

fn default_engine_path() -> PathBuf {
    PathBuf::from("duckdb")
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_sync_timeout_ms() -> u64 {
    60_000
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_max_result_lines() -> Option<usize> {
    Some(1_000)
}

fn default_error_excerpt_lines() -> usize {
    20
}

fn default_progress_refresh_ms() -> u64 {
    250
}

fn default_raw_mode() -> String {
    "markdown".to_string()
}

fn default_headers() -> bool {
    true
}

fn default_null_value() -> String {
    "NULL".to_string()
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            raw_mode: default_raw_mode(),
            timer: false,
            headers: default_headers(),
            null_value: default_null_value(),
            separator: None,
        }
    }
}

impl Default for SqlCellConfig {
    fn default() -> Self {
        Self {
            engine_path: default_engine_path(),
            database: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            max_result_lines: default_max_result_lines(),
            error_excerpt_lines: default_error_excerpt_lines(),
            temp_dir: None,
            progress_refresh_ms: default_progress_refresh_ms(),
            display: DisplaySettings::default(),
        }
    }
}

impl SqlCellConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| SqlCellErr::Config(err.to_string()))
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file missing; using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Loads the config from the default location.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn progress_refresh(&self) -> Duration {
        Duration::from_millis(self.progress_refresh_ms.max(50))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// `$SQLCELL_HOME/config.toml`, else `<config dir>/sqlcell/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV_VAR) {
        return Some(PathBuf::from(home).join(CONFIG_FILE_NAME));
    }
    dirs::config_dir().map(|dir| dir.join("sqlcell").join(CONFIG_FILE_NAME))
}
