use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use usb_warden_core::rule::Target;
use usb_warden_core::{Error, Result};

pub const DEFAULT_UNIT_NAME: &str = "usbguard.service";
pub const DEFAULT_UNIT_DIR: &str = "/lib/systemd/system";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbguard/usbguard-daemon.conf";

const MAX_CONFIG_BYTES: usize = 1024 * 1024;
const IMPLICIT_POLICY_KEY: &str = "ImplicitPolicyTarget";

/// Parsed enforcement-daemon configuration. Fields stay unset when the
/// config file does not exist; a malformed existing file is an error.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    pub rules_file: Option<PathBuf>,
    pub rules_file_exists: bool,
    pub ipc_allowed_users: BTreeSet<String>,
    pub ipc_allowed_groups: BTreeSet<String>,
    pub implicit_policy_target: Option<Target>,
}

/// Resolves the daemon's config path from its installed unit file: the
/// `ExecStart` line carries `-c <path>`. `None` means the daemon is not
/// installed; an installed unit without `-c` uses the stock path.
pub fn locate_daemon_config(unit_path: &Path) -> Result<Option<PathBuf>> {
    let content = match std::fs::read_to_string(unit_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    for line in content.lines() {
        let Some(command) = line.trim().strip_prefix("ExecStart=") else {
            continue;
        };
        let mut tokens = command.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "-c" {
                if let Some(path) = tokens.next() {
                    return Ok(Some(PathBuf::from(path)));
                }
            }
        }
        return Ok(Some(PathBuf::from(DEFAULT_CONFIG_PATH)));
    }
    Ok(Some(PathBuf::from(DEFAULT_CONFIG_PATH)))
}

impl DaemonConfig {
    pub fn parse(config_path: impl Into<PathBuf>) -> Result<DaemonConfig> {
        let config_path = config_path.into();
        let mut config = DaemonConfig {
            config_path: config_path.clone(),
            ..DaemonConfig::default()
        };

        let content = match std::fs::read_to_string(&config_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(err) => return Err(err.into()),
        };
        if content.len() > MAX_CONFIG_BYTES {
            return Err(Error::InvalidConfig(format!(
                "daemon config is too large ({} bytes; max {} bytes)",
                content.len(),
                MAX_CONFIG_BYTES
            )));
        }

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::InvalidConfig(format!(
                    "line {} is not a key=value directive: {line}",
                    idx + 1
                )));
            };
            let value = value.trim();
            match key.trim() {
                "RuleFile" => config.rules_file = Some(PathBuf::from(value)),
                "IPCAllowedUsers" => {
                    config.ipc_allowed_users =
                        value.split_whitespace().map(str::to_string).collect()
                }
                "IPCAllowedGroups" => {
                    config.ipc_allowed_groups =
                        value.split_whitespace().map(str::to_string).collect()
                }
                IMPLICIT_POLICY_KEY => {
                    let target = Target::parse(value).map_err(|_| {
                        Error::InvalidConfig(format!("bad {IMPLICIT_POLICY_KEY}: {value}"))
                    })?;
                    config.implicit_policy_target = Some(target);
                }
                _ => {}
            }
        }

        if let Some(rules_file) = &config.rules_file {
            config.rules_file_exists = rules_file.exists();
        }
        Ok(config)
    }
}

/// Rewrites the implicit-policy directive in a config file body, appending
/// it when absent. Every other line is preserved verbatim.
pub fn render_implicit_policy(content: &str, target: Target) -> String {
    let directive = format!("{IMPLICIT_POLICY_KEY}={target}");
    let mut out = String::new();
    let mut replaced = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('#')
            && trimmed
                .split_once('=')
                .is_some_and(|(key, _)| key.trim() == IMPLICIT_POLICY_KEY)
        {
            out.push_str(&directive);
            replaced = true;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    if !replaced {
        out.push_str(&directive);
        out.push('\n');
    }
    out
}
