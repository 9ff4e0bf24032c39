use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dhcp-tftpd/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: PathBuf,
    pub leases_file: PathBuf,
    pub control_socket: PathBuf,
    pub service_binary: PathBuf,
    pub service_user: String,
    pub lease_hook: PathBuf,
    /// Process name swept from the process table on restart.
    /// Defaults to the file name of `service_binary`.
    pub process_name: Option<String>,
    pub poll_timeout_ms: u64,
    pub store_settle_ms: u64,
    pub startup_backoff_ms: u64,
    pub startup_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/etc/dhcp-tftpd/store.json"),
            leases_file: PathBuf::from("/var/lib/dhcp-tftpd/leases.json"),
            control_socket: PathBuf::from("/var/run/dhcp-tftpd/control.sock"),
            service_binary: PathBuf::from("/usr/sbin/dnsmasq"),
            service_user: "nobody".to_string(),
            lease_hook: PathBuf::from("/usr/bin/dhcp_leases"),
            process_name: None,
            poll_timeout_ms: 5000,
            store_settle_ms: 100,
            startup_backoff_ms: 2000,
            startup_timeout_ms: 1000,
            stop_grace_ms: 1000,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Loads an existing settings file without creating one.
    ///
    /// Used by the lease hook, which must never write settings.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_user.is_empty() {
            return Err(Error::InvalidConfig(
                "service_user must not be empty".to_string(),
            ));
        }

        if self.process_name().is_none() {
            return Err(Error::InvalidConfig(format!(
                "cannot derive a process name from {}",
                self.service_binary.display()
            )));
        }

        for (name, value) in [
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("startup_backoff_ms", self.startup_backoff_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn process_name(&self) -> Option<String> {
        match &self.process_name {
            Some(name) if !name.is_empty() => Some(name.clone()),
            Some(_) => None,
            None => self
                .service_binary
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn store_settle(&self) -> Duration {
        Duration::from_millis(self.store_settle_ms)
    }

    pub fn startup_backoff(&self) -> Duration {
        Duration::from_millis(self.startup_backoff_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}
