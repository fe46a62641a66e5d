// Form session daemon
// - Session registry with idle eviction and on-disk snapshots
// - Submission adapter for the host's delivery endpoint and CLI utility
// - Loopback HTTP server the browser and the launcher talk to

pub mod config;
pub mod http_server;
pub mod pages;
pub mod session;
pub mod submission;
pub mod watchdog;

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use formbridge_core::settings::SettingsLoader;
use formbridge_ipc::daemon_messages::{daemon_url, routes, KEEPALIVE_SESSION};
use formbridge_ipc::port_file::PortFile;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use config::DaemonConfig;
use http_server::AppState;
use pages::Pages;
use session::{
    FileSnapshotStore, InMemorySnapshotStore, SessionRegistry, SnapshotStoreRef, SystemClock,
};
use submission::SubmissionAdapter;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the daemon stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Interrupted,
    Idle,
    ServerExited,
}

/// Whether a daemon answers on `port`. Any HTTP answer counts, since the
/// keep-alive route always replies 404.
pub async fn daemon_alive(port: u16) -> bool {
    let built = reqwest::Client::builder()
        .no_proxy()
        .timeout(PING_TIMEOUT)
        .build();
    let client = match built {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build HTTP client");
            return false;
        }
    };
    let url = format!("{}{}", daemon_url(port), routes::ping(KEEPALIVE_SESSION));
    client.get(url).send().await.is_ok()
}

fn bind_loopback() -> anyhow::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").context("Failed to bind loopback port")?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn app_state(config: &DaemonConfig, snapshots: SnapshotStoreRef) -> anyhow::Result<AppState> {
    let layout = &config.layout;
    let registry = Arc::new(SessionRegistry::new(
        config.registry_config(),
        snapshots,
        Arc::new(SystemClock),
    ));
    Ok(AppState::new(
        registry,
        SettingsLoader::new(layout.settings_file()),
        SubmissionAdapter::new(layout.temp_dir())?,
        Pages::new(layout.forms_dir()),
    ))
}

/// Run the daemon until stopped, interrupted or idle.
///
/// Exits quietly when the port file already names a live daemon, so extra
/// spawns by concurrent launchers are harmless.
pub async fn run_daemon(config: DaemonConfig) -> anyhow::Result<StopReason> {
    let layout = config.layout.clone();
    layout.ensure_writable_dirs()?;
    let port_file = PortFile::new(layout.port_file());

    if let Some(port) = port_file.read()? {
        if daemon_alive(port).await {
            info!(port, "Daemon already running");
            return Ok(StopReason::Requested);
        }
        info!(port, "Stale port advertisement, taking over");
    }

    let (listener, port) = bind_loopback()?;
    let snapshots: SnapshotStoreRef = Arc::new(FileSnapshotStore::new(layout.snapshots_dir(), port));
    let state = app_state(&config, snapshots)?;
    let registry = state.registry().clone();
    port_file.advertise(port)?;
    info!(port, home = %layout.home().display(), "Daemon listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(http_server::serve(listener, state.clone(), async {
        let _ = shutdown_rx.await;
    }));

    let mut server_done = false;
    let reason = tokio::select! {
        _ = state.stop_requested() => StopReason::Requested,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for interrupt");
            }
            StopReason::Interrupted
        }
        _ = watchdog::run(registry.clone(), config.sweep_interval) => StopReason::Idle,
        result = &mut server => {
            server_done = true;
            match result {
                Ok(Ok(())) => warn!("HTTP server exited"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
            StopReason::ServerExited
        }
    };
    info!(?reason, "Daemon stopping");

    let _ = shutdown_tx.send(());
    if !server_done {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
            Ok(Ok(())) => {}
        }
    }

    let closed = registry.shutdown_all().await;
    info!(closed, "Closed remaining sessions");
    if reason == StopReason::Idle {
        let deleted = registry.discard_own_snapshots().await;
        info!(deleted, "Deleted own snapshots");
    }
    match port_file.release_if_owned(port) {
        Ok(released) => info!(released, "Port advertisement handled"),
        Err(e) => warn!(error = %e, "Failed to release port advertisement"),
    }
    Ok(reason)
}

/// Bind, answer one request from ourselves, and exit. Writes no port file
/// and creates no session.
pub async fn dry_run(config: DaemonConfig) -> anyhow::Result<()> {
    let (listener, port) = bind_loopback()?;
    let state = app_state(&config, Arc::new(InMemorySnapshotStore::new()))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(http_server::serve(listener, state, async {
        let _ = shutdown_rx.await;
    }));

    let alive = daemon_alive(port).await;
    let _ = shutdown_tx.send(());
    server.await.context("HTTP server task panicked")??;

    if !alive {
        bail!("Dry run failed: daemon did not answer on port {}", port);
    }
    info!(port, "Dry run succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use formbridge_core::layout::Layout;
    use tokio::test;

    async fn wait_for_port(port_file: &PortFile) -> u16 {
        for _ in 0..200 {
            if let Some(port) = port_file.read().unwrap() {
                return port;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("daemon never advertised its port");
    }

    #[test]
    async fn test_dry_run_writes_no_port_file() {
        let home = tempfile::tempdir().unwrap();
        let layout = Layout::new(home.path());
        dry_run(DaemonConfig::new(layout.clone())).await.unwrap();
        assert!(!layout.port_file().exists());
    }

    #[test]
    async fn test_daemon_lifecycle() {
        let home = tempfile::tempdir().unwrap();
        let layout = Layout::new(home.path());
        std::fs::create_dir_all(layout.addons_dir()).unwrap();
        std::fs::write(layout.addon_config("PacFORMS").unwrap(), "").unwrap();
        let port_file = PortFile::new(layout.port_file());

        let daemon = tokio::spawn(run_daemon(DaemonConfig::new(layout.clone())));
        let port = wait_for_port(&port_file).await;
        assert!(daemon_alive(port).await);

        // A second daemon sees the first one and exits without taking over.
        let second = run_daemon(DaemonConfig::new(layout.clone())).await.unwrap();
        assert_eq!(second, StopReason::Requested);
        assert_eq!(port_file.read().unwrap(), Some(port));

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let base = daemon_url(port);
        let opened = client
            .post(format!("{}{}", base, routes::OPEN))
            .json(&formbridge_ipc::daemon_messages::OpenRequest {
                args: vec!["--addon_name".to_string(), "PacFORMS".to_string()],
            })
            .send()
            .await
            .unwrap();
        assert_eq!(opened.status().as_u16(), 303);

        client
            .post(format!("{}{}", base, routes::STOP))
            .send()
            .await
            .unwrap();
        let reason = daemon.await.unwrap().unwrap();
        assert_eq!(reason, StopReason::Requested);

        assert!(port_file.read().unwrap().is_none());
        // The open editable session was snapshotted on stop.
        assert!(layout
            .snapshots_dir()
            .join(format!("session-{}-1.json", port))
            .exists());
    }

    #[test]
    async fn test_stale_port_file_is_taken_over() {
        let home = tempfile::tempdir().unwrap();
        let layout = Layout::new(home.path());
        let stale = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let port_file = PortFile::new(layout.port_file());
        port_file.advertise(stale).unwrap();

        let daemon = tokio::spawn(run_daemon(DaemonConfig::new(layout.clone())));
        let mut port = stale;
        for _ in 0..200 {
            port = port_file.read().unwrap().unwrap_or(stale);
            if port != stale {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_ne!(port, stale);

        reqwest::Client::new()
            .post(format!("{}{}", daemon_url(port), routes::STOP))
            .send()
            .await
            .unwrap();
        daemon.await.unwrap().unwrap();
    }
}
