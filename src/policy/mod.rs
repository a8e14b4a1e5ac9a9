//! Policy store: daemon config discovery and transactional rule-file
//! management. Rule-file replacement is atomic from the caller's point of
//! view: either the new content is live and the daemon healthy, or file and
//! daemon state are exactly as before the call.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use usb_warden_core::rule::Target;
use usb_warden_core::{Error, Result};

pub mod config;
pub mod file;
pub mod udev;

pub use config::{locate_daemon_config, DaemonConfig};
pub use file::{parse_rule_file, render_rules, PolicyFileSnapshot};

use crate::systemd::{BackoffPolicy, Confirm, UnitController, UnitManager};

pub struct PolicyStore<M: UnitManager> {
    controller: UnitController<M>,
    pub config: DaemonConfig,
}

impl<M: UnitManager> PolicyStore<M> {
    /// Locates the installed daemon and parses its configuration. Fails with
    /// `Unavailable` when the unit file is absent.
    pub fn open(
        manager: M,
        backoff: BackoffPolicy,
        unit_dir: &Path,
        unit_name: &str,
    ) -> Result<Self> {
        let unit_path = unit_dir.join(unit_name);
        let config_path = locate_daemon_config(&unit_path)?.ok_or_else(|| {
            Error::Unavailable(format!("{unit_name} is not installed"))
        })?;
        let config = DaemonConfig::parse(config_path)?;
        Ok(PolicyStore {
            controller: UnitController::new(manager, unit_name, backoff),
            config,
        })
    }

    /// Builds a store over an already-parsed config; used by tests and by
    /// callers that resolve the config themselves.
    pub fn with_config(
        manager: M,
        backoff: BackoffPolicy,
        unit_name: &str,
        config: DaemonConfig,
    ) -> Self {
        PolicyStore {
            controller: UnitController::new(manager, unit_name, backoff),
            config,
        }
    }

    pub fn controller(&self) -> &UnitController<M> {
        &self.controller
    }

    pub fn reload_config(&mut self) -> Result<()> {
        self.config = DaemonConfig::parse(self.config.config_path.clone())?;
        Ok(())
    }

    pub fn rules_path(&self) -> Result<PathBuf> {
        self.config
            .rules_file
            .clone()
            .ok_or_else(|| Error::InvalidConfig("daemon config names no rule file".to_string()))
    }

    pub fn parse_rule_file(&self) -> Result<PolicyFileSnapshot> {
        file::parse_rule_file(&self.rules_path()?)
    }

    /// Transactional rule-file replacement. `run_daemon` selects whether the
    /// daemon stays up after a successful health check; `expected_sha256`
    /// rejects the write when the file changed since the caller's snapshot.
    pub fn overwrite_rule_file(
        &self,
        new_content: &str,
        run_daemon: bool,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        let rules_path = self.rules_path()?;
        self.transactional_write(&rules_path, new_content, run_daemon, expected_sha256)
    }

    /// Rewrites the implicit-policy directive in the daemon config and
    /// validates it through the same write/health-check/rollback path. The
    /// daemon's run state is preserved.
    pub fn change_implicit_policy(&mut self, block: bool) -> Result<()> {
        let target = if block { Target::Block } else { Target::Allow };
        let config_path = self.config.config_path.clone();
        let current = read_or_empty(&config_path)?;
        let new_content = config::render_implicit_policy(&current, target);
        let keep_running = self.controller.is_active().unwrap_or(false);
        self.transactional_write(&config_path, &new_content, keep_running, None)?;
        self.config.implicit_policy_target = Some(target);
        Ok(())
    }

    /// Applies the requested active/enabled flags through the unit
    /// controller. Inconclusive outcomes are surfaced, never inferred as
    /// success.
    pub fn change_daemon_status(&self, active: bool, enabled: bool) -> Result<()> {
        let run = if active {
            self.controller.start()
        } else {
            self.controller.stop()
        };
        let persist = if enabled {
            self.controller.enable()
        } else {
            self.controller.disable()
        };
        for (what, confirm) in [("active", run), ("enabled", persist)] {
            match confirm {
                Confirm::Confirmed(true) => {}
                Confirm::Confirmed(false) => {
                    return Err(Error::Unavailable(format!(
                        "the service manager refused to change the {what} state"
                    )))
                }
                Confirm::Unknown => {
                    return Err(Error::Unavailable(format!(
                        "changing the {what} state was not confirmed within the retry budget"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Health probe: start the unit and report whether it reached the active
    /// state within the controller's budget. With `keep_running == false`
    /// the unit is stopped again afterward regardless of outcome.
    pub fn try_to_run(&self, keep_running: bool) -> bool {
        let started = self.controller.start().is_success();
        if !keep_running {
            let stopped = self.controller.stop();
            if !stopped.is_success() {
                tracing::warn!(
                    unit = %self.controller.unit(),
                    "couldn't stop the unit after a probe-only health check"
                );
            }
        }
        started
    }

    fn transactional_write(
        &self,
        path: &Path,
        new_content: &str,
        keep_running: bool,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        // The lock makes file content plus health check one critical
        // section; no two transactions may be in flight concurrently.
        let lock = open_lock_file(path)?;
        lock.lock_exclusive()?;
        let result = self.transactional_write_locked(path, new_content, keep_running, expected_sha256);
        let _ = FileExt::unlock(&lock);
        result
    }

    fn transactional_write_locked(
        &self,
        path: &Path,
        new_content: &str,
        keep_running: bool,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        let rollback = read_or_empty(path)?;
        if let Some(expected) = expected_sha256 {
            let actual = file::content_sha256(&rollback);
            if actual != expected {
                return Err(Error::Conflict(format!(
                    "{} changed since validation",
                    path.display()
                )));
            }
        }
        let was_active = self.controller.is_active().unwrap_or(false);

        std::fs::write(path, new_content)?;
        if self.try_to_run(keep_running) {
            return Ok(());
        }

        if let Err(err) = std::fs::write(path, &rollback) {
            return Err(Error::TransactionFailure(format!(
                "health check failed and restoring {} also failed: {err}",
                path.display()
            )));
        }
        if was_active && !self.try_to_run(true) {
            tracing::error!(
                path = %path.display(),
                "restored previous content but the daemon did not come back up"
            );
        }
        Err(Error::TransactionFailure(format!(
            "daemon failed to start with the new content of {}; previous content restored",
            path.display()
        )))
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

fn open_lock_file(path: &Path) -> Result<std::fs::File> {
    let mut lock_path = path.to_path_buf();
    lock_path.set_extension(format!(
        "{}.lock",
        path.extension().and_then(|s| s.to_str()).unwrap_or("lock")
    ));
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(Error::from)
}
