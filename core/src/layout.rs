use std::path::{Path, PathBuf};

use crate::errors::{FormError, FormResult};

/// Environment variable overriding the installation home
pub const HOME_ENV: &str = "FORMBRIDGE_HOME";

/// Directory layout of a formbridge installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Resolve the home from an explicit path, `FORMBRIDGE_HOME`, or the
    /// platform data directory, in that order.
    pub fn resolve(explicit: Option<&Path>) -> FormResult<Self> {
        if let Some(path) = explicit {
            return Ok(Self::new(path));
        }
        if let Some(path) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(path)));
        }
        let data_dir = dirs::data_local_dir().ok_or_else(|| {
            FormError::configuration("Could not determine local data directory")
        })?;
        Ok(Self::new(data_dir.join("formbridge")))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// One `<addon>.ini` per addon this installation serves
    pub fn addons_dir(&self) -> PathBuf {
        self.home.join("addons")
    }

    /// Static HTML form templates
    pub fn forms_dir(&self) -> PathBuf {
        self.home.join("forms")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.home.join("snapshots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.home.join("tmp")
    }

    pub fn port_file(&self) -> PathBuf {
        self.logs_dir().join("daemon.port")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("daemon.log")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.join("settings.toml")
    }

    pub fn addon_config(&self, addon_name: &str) -> FormResult<PathBuf> {
        addon_config_path(&self.addons_dir(), addon_name)
    }

    /// Create the directories the daemon writes into.
    pub fn ensure_writable_dirs(&self) -> FormResult<()> {
        for dir in [self.snapshots_dir(), self.logs_dir(), self.temp_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                FormError::configuration(format!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// `<addons_dir>/<addon_name>.ini`; the name must not leave `addons_dir`.
pub fn addon_config_path(addons_dir: &Path, addon_name: &str) -> FormResult<PathBuf> {
    let bare = !addon_name.is_empty()
        && addon_name != "."
        && addon_name != ".."
        && !addon_name.contains(['/', '\\', ':']);
    if !bare {
        return Err(FormError::configuration(format!(
            "invalid addon name '{}'",
            addon_name
        )));
    }
    Ok(addons_dir.join(format!("{}.ini", addon_name)))
}
