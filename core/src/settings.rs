use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// How to reach the host's delivery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub method: String,
    pub timeout_secs: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9334,
            path: "/".to_string(),
            method: "POST".to_string(),
            timeout_secs: 30,
        }
    }
}

impl DeliverySettings {
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The host's command-line submission utility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliFallbackSettings {
    pub program: Option<PathBuf>,
    /// File the utility creates when a submission fails
    pub failure_file: Option<PathBuf>,
}

impl CliFallbackSettings {
    /// Sentinel path, defaulting to `submit-failure.txt` next to the program.
    pub fn resolved_failure_file(&self) -> Option<PathBuf> {
        self.failure_file.clone().or_else(|| {
            self.program
                .as_ref()
                .map(|program| program.with_file_name("submit-failure.txt"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualSettings {
    /// Addon recorded on sessions created from the manual-entry page
    pub addon_name: String,
}

impl Default for ManualSettings {
    fn default() -> Self {
        Self {
            addon_name: "formbridge".to_string(),
        }
    }
}

/// Contents of `settings.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub delivery: DeliverySettings,
    pub cli_fallback: CliFallbackSettings,
    pub manual: ManualSettings,
}

impl Settings {
    /// Loads settings from a file; absent or malformed files yield the defaults.
    pub fn load_from_file(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No settings file, using defaults");
                return Self::default();
            }
        };

        match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed settings file, using defaults");
                Self::default()
            }
        }
    }
}

/// A single cached value, valid for as long as its key is unchanged.
#[derive(Debug, Clone)]
pub struct KeyedCache<K, V> {
    entry: Option<(K, V)>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self { entry: None }
    }
}

impl<K: PartialEq, V: Clone> KeyedCache<K, V> {
    /// Return the cached value if `key` matches, otherwise reload it.
    pub fn get_or_refresh(&mut self, key: K, load: impl FnOnce() -> V) -> V {
        match &self.entry {
            Some((cached_key, value)) if *cached_key == key => value.clone(),
            _ => {
                let value = load();
                self.entry = Some((key, value.clone()));
                value
            }
        }
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

/// Settings re-read whenever the file's modification time changes.
#[derive(Debug)]
pub struct SettingsLoader {
    path: PathBuf,
    cache: KeyedCache<Option<SystemTime>, Settings>,
}

impl SettingsLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: KeyedCache::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings, reloading only if the file changed since last call.
    pub fn current(&mut self) -> Settings {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let path = self.path.clone();
        self.cache.get_or_refresh(modified, || {
            info!(path = %path.display(), "Loading settings");
            Settings::load_from_file(&path)
        })
    }
}
