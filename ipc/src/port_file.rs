//! Port advertisement file.
//!
//! A daemon writes its listening port here at startup; launchers read it to
//! find the daemon. Several daemon generations may touch the file in
//! sequence, so every update happens under an exclusive lock on a sibling
//! `.lock` file and deletion is compare-and-delete.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PortFileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, PortFileError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PortFileError + '_ {
    move |source| PortFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct PortFile {
    path: PathBuf,
}

impl PortFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Hold the exclusive lock for as long as the returned file lives.
    fn lock(&self) -> Result<File> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        file.lock_exclusive().map_err(io_error(&lock_path))?;
        Ok(file)
    }

    /// Advertised port, or `None` when the file is absent or unparsable.
    pub fn read(&self) -> Result<Option<u16>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse::<u16>().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path)(e)),
        }
    }

    /// Replace the advertisement with `port`.
    pub fn advertise(&self, port: u16) -> Result<()> {
        let _lock = self.lock()?;
        let temp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut file = File::create(&temp_path).map_err(io_error(&temp_path))?;
            write!(file, "{}", port).map_err(io_error(&temp_path))?;
            file.sync_all().map_err(io_error(&temp_path))?;
        }
        fs::rename(&temp_path, &self.path).map_err(io_error(&self.path))?;
        info!(port, path = %self.path.display(), "Advertised daemon port");
        Ok(())
    }

    /// Delete the file only if it still names `port`.
    ///
    /// Returns whether the file was deleted. A file naming another port
    /// belongs to a newer daemon and is left alone.
    pub fn release_if_owned(&self, port: u16) -> Result<bool> {
        let _lock = self.lock()?;
        match self.read()? {
            Some(advertised) if advertised == port => {
                match fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                    Err(e) => return Err(io_error(&self.path)(e)),
                }
                info!(port, "Released port advertisement");
                Ok(true)
            }
            other => {
                debug!(port, advertised = ?other, "Port file not owned by this daemon, keeping it");
                Ok(false)
            }
        }
    }
}
