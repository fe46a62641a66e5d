use std::time::Duration;

use formbridge_core::layout::Layout;

use crate::session::RegistryConfig;

/// Runtime configuration of one daemon process.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub layout: Layout,
    /// How often idle counters advance
    pub sweep_interval: Duration,
    pub idle_session_limit: Duration,
    pub idle_shutdown_after: Duration,
    pub snapshot_max_age: Duration,
}

impl DaemonConfig {
    pub fn new(layout: Layout) -> Self {
        let defaults = RegistryConfig::new(layout.addons_dir());
        DaemonConfig {
            layout,
            sweep_interval: Duration::from_secs(5),
            idle_session_limit: defaults.idle_session_limit,
            idle_shutdown_after: defaults.idle_shutdown_after,
            snapshot_max_age: defaults.snapshot_max_age,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            addons_dir: self.layout.addons_dir(),
            idle_session_limit: self.idle_session_limit,
            idle_shutdown_after: self.idle_shutdown_after,
            snapshot_max_age: self.snapshot_max_age,
        }
    }
}
