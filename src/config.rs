use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::lock::DEFAULT_LOCK_PATH;
use crate::core::transfer_engine::rsync::DEFAULT_LOG_FILE;

pub const CONFIG_PATH: &str = "/etc/nasfilecopy/config.toml";
pub const ENV_PREFIX: &str = "NASFILECOPY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Managed mount root: sources must live below it, destinations are mounted in it.
    pub mount_root: PathBuf,
    pub lock_path: PathBuf,
    pub rsync_log_file: PathBuf,
    pub unmount_retry_secs: u64,
    /// Drain loop poll interval for remote output.
    pub poll_interval_ms: u64,
    /// Path of this binary on remote hosts.
    pub server_binary: String,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            rsync_log_file: PathBuf::from(DEFAULT_LOG_FILE),
            unmount_retry_secs: 3,
            poll_interval_ms: 10,
            server_binary: "/opt/nasfilecopy/nasfilecopy".to_string(),
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `NASFILECOPY_*` variables and the
    /// command-line overrides, in increasing precedence.
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self> {
        Self::figment(CONFIG_PATH, cli_overrides).extract().map_err(Into::into)
    }

    pub fn figment<T: Serialize>(config_path: &str, cli_overrides: Option<&T>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        figment
    }

    pub fn unmount_retry_interval(&self) -> Duration {
        Duration::from_secs(self.unmount_retry_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
