use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cadence_error::CadenceError;
use cadence_opencode_client::{normalize_base_url, ModelRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store;

pub const CONFIG_DIR_ENV: &str = "CADENCE_CONFIG_DIR";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:4096";
pub const DEFAULT_HOTKEY: &str = "Control+Alt+Space";

const SETTINGS_FILE: &str = "settings.json";
const PERMISSION_MEMORY_FILE: &str = "permission-memory.json";
// Earlier shells kept permission memory inside this settings document.
const LEGACY_SETTINGS_FILE: &str = "cadence.settings.json";

/// Where persisted documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub root: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `explicit`, then `CADENCE_CONFIG_DIR`, then `<config dir>/cadence`.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self, CadenceError> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(root) = env::var_os(CONFIG_DIR_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::new(root));
        }
        dirs::config_dir()
            .map(|base| Self::new(base.join("cadence")))
            .ok_or_else(|| {
                CadenceError::persistence(format!(
                    "no user config directory available; set {CONFIG_DIR_ENV}"
                ))
            })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn permission_memory_file(&self) -> PathBuf {
        self.root.join(PERMISSION_MEMORY_FILE)
    }

    /// Settings documents that may carry a `permissionMemory` field.
    pub fn legacy_documents(&self) -> Vec<PathBuf> {
        vec![self.settings_file(), self.root.join(LEGACY_SETTINGS_FILE)]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Spawn a local server and fall back to `serverUrl` if that fails.
    #[default]
    Auto,
    Attach,
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Attach => "attach",
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "attach" => Ok(Self::Attach),
            other => Err(format!("unknown server mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiMode {
    #[default]
    Cadence,
    Opencode,
}

impl FromStr for UiMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cadence" => Ok(Self::Cadence),
            "opencode" => Ok(Self::Opencode),
            other => Err(format!("unknown ui mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub server_mode: ServerMode,
    pub server_url: String,
    pub ui_mode: UiMode,
    pub auto_launch: bool,
    pub hotkey: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            model: None,
            agent: None,
            server_mode: ServerMode::default(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            ui_mode: UiMode::default(),
            auto_launch: false,
            hotkey: DEFAULT_HOTKEY.to_string(),
        }
    }
}

impl Settings {
    /// Loads settings, falling back to defaults for a missing file and for
    /// every field that is absent or has the wrong shape.
    pub async fn load(path: &Path) -> Self {
        match store::read_json_document(path).await {
            Some(value) => Self::from_value(value),
            None => Self::default(),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), CadenceError> {
        store::write_json_atomic(path, self).await
    }

    /// A stored `permissionMemory` field is left to
    /// [`PermissionMemory::load_or_import`](crate::PermissionMemory::load_or_import).
    pub fn from_value(value: Value) -> Self {
        let defaults = Self::default();
        let Value::Object(map) = value else {
            return defaults;
        };
        Self {
            directory: field::<String>(&map, "directory")
                .filter(|directory| !directory.trim().is_empty())
                .unwrap_or(defaults.directory),
            model: field(&map, "model"),
            agent: field::<String>(&map, "agent").filter(|agent| !agent.is_empty()),
            server_mode: field(&map, "serverMode").unwrap_or(defaults.server_mode),
            server_url: field::<String>(&map, "serverUrl")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.server_url),
            ui_mode: field(&map, "uiMode").unwrap_or(defaults.ui_mode),
            auto_launch: field(&map, "autoLaunch").unwrap_or(defaults.auto_launch),
            hotkey: field(&map, "hotkey").unwrap_or(defaults.hotkey),
        }
    }

    /// `serverUrl` without trailing slashes.
    pub fn attach_url(&self) -> String {
        normalize_base_url(&self.server_url)
    }
}

fn field<T: DeserializeOwned>(map: &Map<String, Value>, key: &str) -> Option<T> {
    let value = map.get(key)?.clone();
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::debug!(field = key, error = %err, "ignoring invalid settings field");
            None
        }
    }
}

fn default_directory() -> String {
    env::current_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_else(|_| ".".to_string())
}

/// Partial update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub directory: Option<String>,
    pub model: Option<Option<ModelRef>>,
    pub agent: Option<Option<String>>,
    pub server_mode: Option<ServerMode>,
    pub server_url: Option<String>,
    pub ui_mode: Option<UiMode>,
    pub auto_launch: Option<bool>,
    pub hotkey: Option<String>,
}

/// What an applied patch changed that the shell has to react to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub previous_mode: ServerMode,
    pub mode_changed: bool,
    pub url_changed: bool,
}

impl SettingsChange {
    pub fn server_changed(&self) -> bool {
        self.mode_changed || self.url_changed
    }
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(self, settings: &mut Settings) -> SettingsChange {
        let previous_mode = settings.server_mode;
        let previous_url = settings.server_url.clone();

        if let Some(directory) = self.directory {
            settings.directory = directory;
        }
        if let Some(model) = self.model {
            settings.model = model;
        }
        if let Some(agent) = self.agent {
            settings.agent = agent;
        }
        if let Some(server_mode) = self.server_mode {
            settings.server_mode = server_mode;
        }
        if let Some(server_url) = self.server_url {
            settings.server_url = server_url;
        }
        if let Some(ui_mode) = self.ui_mode {
            settings.ui_mode = ui_mode;
        }
        if let Some(auto_launch) = self.auto_launch {
            settings.auto_launch = auto_launch;
        }
        if let Some(hotkey) = self.hotkey {
            settings.hotkey = hotkey;
        }

        SettingsChange {
            previous_mode,
            mode_changed: previous_mode != settings.server_mode,
            url_changed: previous_url != settings.server_url,
        }
    }
}
