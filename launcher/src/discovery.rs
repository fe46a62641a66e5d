//! Finding (or starting) the daemon and handing it the host's arguments.

use std::time::Duration;

use async_trait::async_trait;
use formbridge_ipc::daemon_messages::{daemon_url, routes, OpenRequest, ERROR_HEADER, UNKNOWN_ADDON};
use formbridge_ipc::port_file::{PortFile, PortFileError};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Retries after the first attempt.
pub const MAX_RETRIES: u32 = 6;
/// Retries before which a daemon is spawned.
pub const SPAWN_ON_RETRIES: [u32; 2] = [1, 4];
/// Delay before retry `n` is `n * BACKOFF_STEP`.
pub const BACKOFF_STEP: Duration = Duration::from_secs(1);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("no daemon port is advertised")]
    NoPortFile,

    #[error("daemon on port {port} is unreachable: {message}")]
    Unreachable { port: u16, message: String },

    #[error("daemon on port {port} does not serve this addon")]
    UnknownAddon { port: u16 },

    #[error("daemon refused the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to start daemon: {0}")]
    Spawn(String),

    #[error(transparent)]
    PortFile(#[from] PortFileError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("daemon not reachable after {retries} retries: {last}")]
    Exhausted {
        retries: u32,
        #[source]
        last: Box<LaunchError>,
    },
}

impl LaunchError {
    /// Whether waiting (and possibly spawning a daemon) may fix this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LaunchError::NoPortFile
                | LaunchError::Unreachable { .. }
                | LaunchError::UnknownAddon { .. }
        )
    }
}

/// Connection to whatever daemon is currently advertised.
#[async_trait]
pub trait DaemonLink: Send + Sync {
    /// Open a session and return the URL of its view.
    async fn open(&self, args: &[String]) -> Result<String, LaunchError>;
}

pub trait DaemonSpawner: Send + Sync {
    fn spawn(&self) -> Result<(), LaunchError>;
}

/// Open a session, starting a daemon when none answers.
///
/// One initial try, then up to [`MAX_RETRIES`] retries with linear backoff;
/// a daemon is spawned before the retries listed in [`SPAWN_ON_RETRIES`].
pub async fn find_or_start(
    link: &dyn DaemonLink,
    spawner: &dyn DaemonSpawner,
    args: &[String],
) -> Result<String, LaunchError> {
    let mut last = match link.open(args).await {
        Ok(url) => return Ok(url),
        Err(e) if e.is_retryable() => e,
        Err(e) => return Err(e),
    };

    for retry in 1..=MAX_RETRIES {
        debug!(retry, error = %last, "Daemon not ready");
        if SPAWN_ON_RETRIES.contains(&retry) {
            info!(retry, "Starting daemon");
            if let Err(e) = spawner.spawn() {
                warn!(error = %e, "Failed to start daemon");
            }
        }
        tokio::time::sleep(BACKOFF_STEP * retry).await;

        match link.open(args).await {
            Ok(url) => return Ok(url),
            Err(e) if e.is_retryable() => last = e,
            Err(e) => return Err(e),
        }
    }

    Err(LaunchError::Exhausted {
        retries: MAX_RETRIES,
        last: Box::new(last),
    })
}

/// Talks to the daemon named in the port file over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDaemonLink {
    port_file: PortFile,
    client: Client,
}

impl HttpDaemonLink {
    pub fn new(port_file: PortFile) -> Result<Self, LaunchError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .no_proxy()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { port_file, client })
    }

    fn advertised_port(&self) -> Result<u16, LaunchError> {
        self.port_file.read()?.ok_or(LaunchError::NoPortFile)
    }

    /// Ask the advertised daemon to shut down. Returns `false` when none is
    /// advertised.
    pub async fn stop(&self) -> Result<bool, LaunchError> {
        let port = match self.advertised_port() {
            Ok(port) => port,
            Err(LaunchError::NoPortFile) => return Ok(false),
            Err(e) => return Err(e),
        };
        let url = format!("{}{}", daemon_url(port), routes::STOP);
        self.client
            .post(url)
            .send()
            .await
            .map_err(|e| LaunchError::Unreachable {
                port,
                message: e.to_string(),
            })?;
        Ok(true)
    }
}

#[async_trait]
impl DaemonLink for HttpDaemonLink {
    async fn open(&self, args: &[String]) -> Result<String, LaunchError> {
        let port = self.advertised_port()?;
        let base = daemon_url(port);
        let request = OpenRequest {
            args: args.to_vec(),
        };

        let response = self
            .client
            .post(format!("{}{}", base, routes::OPEN))
            .json(&request)
            .send()
            .await
            .map_err(|e| LaunchError::Unreachable {
                port,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| LaunchError::Rejected {
                    status: status.as_u16(),
                    body: "redirect without location".to_string(),
                })?;
            return Ok(format!("{}{}", base, location));
        }

        let unknown_addon = response
            .headers()
            .get(ERROR_HEADER)
            .map(|value| value == UNKNOWN_ADDON)
            .unwrap_or(false);
        if status == StatusCode::NOT_FOUND && unknown_addon {
            return Err(LaunchError::UnknownAddon { port });
        }

        let body = response.text().await.unwrap_or_default();
        Err(LaunchError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::test;
    use tokio::time::Instant;

    /// Fails with `error` until `succeed_after_spawns` spawns have happened.
    struct FakeLink {
        calls: Mutex<Vec<Instant>>,
        spawns: Arc<AtomicU32>,
        succeed_after_spawns: Option<u32>,
        error: fn() -> LaunchError,
    }

    impl FakeLink {
        fn new(spawns: Arc<AtomicU32>, succeed_after_spawns: Option<u32>, error: fn() -> LaunchError) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                spawns,
                succeed_after_spawns,
                error,
            }
        }
    }

    #[async_trait]
    impl DaemonLink for FakeLink {
        async fn open(&self, _args: &[String]) -> Result<String, LaunchError> {
            self.calls.lock().unwrap().push(Instant::now());
            match self.succeed_after_spawns {
                Some(n) if self.spawns.load(Ordering::SeqCst) >= n => {
                    Ok("http://127.0.0.1:1/form/1".to_string())
                }
                _ => Err((self.error)()),
            }
        }
    }

    /// Records how many link calls had happened at each spawn.
    struct FakeSpawner {
        spawns: Arc<AtomicU32>,
        calls_at_spawn: Mutex<Vec<usize>>,
        link_calls: Arc<dyn Fn() -> usize + Send + Sync>,
    }

    impl DaemonSpawner for FakeSpawner {
        fn spawn(&self) -> Result<(), LaunchError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.calls_at_spawn.lock().unwrap().push((self.link_calls)());
            Ok(())
        }
    }

    fn no_port_file() -> LaunchError {
        LaunchError::NoPortFile
    }

    fn setup(
        succeed_after_spawns: Option<u32>,
        error: fn() -> LaunchError,
    ) -> (Arc<FakeLink>, FakeSpawner) {
        let spawns = Arc::new(AtomicU32::new(0));
        let link = Arc::new(FakeLink::new(spawns.clone(), succeed_after_spawns, error));
        let counted = link.clone();
        let spawner = FakeSpawner {
            spawns,
            calls_at_spawn: Mutex::new(Vec::new()),
            link_calls: Arc::new(move || counted.calls.lock().unwrap().len()),
        };
        (link, spawner)
    }

    #[test(start_paused = true)]
    async fn test_backoff_schedule_and_spawns() {
        let (link, spawner) = setup(None, no_port_file);
        let err = find_or_start(link.as_ref(), &spawner, &[]).await.unwrap_err();
        assert!(matches!(err, LaunchError::Exhausted { retries: 6, .. }));

        let calls = link.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 7);
        let delays: Vec<u64> = calls
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 5, 6]);

        // Spawned right before retry 1 (after one call) and retry 4 (after four).
        assert_eq!(*spawner.calls_at_spawn.lock().unwrap(), vec![1, 4]);
    }

    #[test(start_paused = true)]
    async fn test_succeeds_once_daemon_is_up() {
        let (link, spawner) = setup(Some(1), no_port_file);
        let url = find_or_start(link.as_ref(), &spawner, &[]).await.unwrap();
        assert_eq!(url, "http://127.0.0.1:1/form/1");
        assert_eq!(link.calls.lock().unwrap().len(), 2);
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
    }

    #[test(start_paused = true)]
    async fn test_unknown_addon_is_retried() {
        let (link, spawner) = setup(Some(2), || LaunchError::UnknownAddon { port: 4000 });
        find_or_start(link.as_ref(), &spawner, &[]).await.unwrap();
        assert_eq!(link.calls.lock().unwrap().len(), 5);
    }

    #[test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let (link, spawner) = setup(None, || LaunchError::Rejected {
            status: 400,
            body: "missing addon_name".to_string(),
        });
        let err = find_or_start(link.as_ref(), &spawner, &[]).await.unwrap_err();
        assert!(matches!(err, LaunchError::Rejected { status: 400, .. }));
        assert_eq!(link.calls.lock().unwrap().len(), 1);
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
    }

    #[test]
    async fn test_http_link_without_port_file() {
        let dir = tempfile::tempdir().unwrap();
        let link = HttpDaemonLink::new(PortFile::new(dir.path().join("daemon.port"))).unwrap();
        assert!(matches!(
            link.open(&[]).await.unwrap_err(),
            LaunchError::NoPortFile
        ));
        assert!(!link.stop().await.unwrap());
    }

    #[test]
    async fn test_http_link_stale_port_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = PortFile::new(dir.path().join("daemon.port"));
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        port_file.advertise(port).unwrap();

        let link = HttpDaemonLink::new(port_file).unwrap();
        let err = link.open(&["--addon_name".to_string()]).await.unwrap_err();
        assert!(matches!(err, LaunchError::Unreachable { .. }));
        assert!(err.is_retryable());
    }
}
