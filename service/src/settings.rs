use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use usb_warden::policy::config::{DEFAULT_UNIT_DIR, DEFAULT_UNIT_NAME};
use usb_warden_core::{Error, Result};

const MAX_SETTINGS_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// SQLite database holding permission and mount records.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_mount_base")]
    pub mount_base: PathBuf,
    /// Filesystem types that are never mounted. An empty filesystem field on
    /// an event is always treated as unsupported.
    #[serde(default = "default_deny_filesystems")]
    pub deny_filesystems: Vec<String>,
    /// Bounded wait on the event source; the stop signal and sweep cadence
    /// are checked at this granularity.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_unit_name")]
    pub unit_name: String,
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/usb-warden/usb-warden.db")
}

fn default_mount_base() -> PathBuf {
    PathBuf::from("/media")
}

fn default_deny_filesystems() -> Vec<String> {
    vec!["jfs".to_string(), "LVM2_member".to_string()]
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_unit_name() -> String {
    DEFAULT_UNIT_NAME.to_string()
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from(DEFAULT_UNIT_DIR)
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: default_db_path(),
            mount_base: default_mount_base(),
            deny_filesystems: default_deny_filesystems(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            unit_name: default_unit_name(),
            unit_dir: default_unit_dir(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if !self.mount_base.is_absolute() {
            return Err(Error::InvalidConfig(
                "mount_base must be an absolute path".to_string(),
            ));
        }
        if self.unit_name.trim().is_empty() {
            return Err(Error::InvalidConfig("unit_name must be non-empty".to_string()));
        }
        for (idx, fs) in self.deny_filesystems.iter().enumerate() {
            if fs.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "deny_filesystems[{idx}] must be non-empty"
                )));
            }
        }
        Ok(())
    }
}

pub fn load_settings(path: impl AsRef<Path>) -> anyhow::Result<Settings> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    if bytes.len() > MAX_SETTINGS_BYTES {
        anyhow::bail!(
            "settings file is too large ({} bytes; max {} bytes)",
            bytes.len(),
            MAX_SETTINGS_BYTES
        );
    }
    let raw = String::from_utf8(bytes)?;
    let ext = path.extension().and_then(|s| s.to_str());
    let settings: Settings = match ext {
        Some("json") => serde_json::from_str(&raw)?,
        Some("toml") | None => toml::from_str(&raw)?,
        Some(other) => anyhow::bail!("unsupported settings extension: {other}"),
    };
    settings.validate().map_err(anyhow::Error::msg)?;
    Ok(settings)
}
