use std::process::Command;
use std::thread;
use std::time::Duration;

use usb_warden_core::{Error, Result};

/// Outcome of a unit-lifecycle operation. `Unknown` means the control call
/// failed or no poll observed the expected state within the budget; callers
/// must never treat it as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Confirmed(bool),
    Unknown,
}

impl Confirm {
    pub fn is_success(&self) -> bool {
        matches!(self, Confirm::Confirmed(true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Activating,
    Inactive,
    Failed,
}

/// RPC-style boundary to the service manager. Implemented by
/// [`SystemctlManager`] in production and by fakes in tests.
pub trait UnitManager {
    fn active_state(&self, unit: &str) -> Result<UnitState>;

    fn is_enabled(&self, unit: &str) -> Result<bool>;

    fn start(&self, unit: &str) -> Result<()>;

    fn stop(&self, unit: &str) -> Result<()>;

    fn enable(&self, unit: &str) -> Result<()>;

    fn disable(&self, unit: &str) -> Result<()>;

    fn restart(&self, unit: &str) -> Result<()>;
}

/// One polling budget shared by every lifecycle operation: settle after the
/// control request, then poll at a fixed interval up to the attempt ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub settle: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            settle: Duration::from_millis(100),
            interval: Duration::from_millis(200),
            max_attempts: 10,
        }
    }
}

pub struct UnitController<M> {
    manager: M,
    unit: String,
    backoff: BackoffPolicy,
}

impl<M: UnitManager> UnitController<M> {
    pub fn new(manager: M, unit: impl Into<String>, backoff: BackoffPolicy) -> Self {
        UnitController {
            manager,
            unit: unit.into(),
            backoff,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.manager.active_state(&self.unit)? == UnitState::Active)
    }

    pub fn is_enabled(&self) -> Result<bool> {
        self.manager.is_enabled(&self.unit)
    }

    pub fn start(&self) -> Confirm {
        if let Err(err) = self.manager.start(&self.unit) {
            tracing::warn!(unit = %self.unit, %err, "start request failed");
            return Confirm::Unknown;
        }
        self.await_active(true)
    }

    pub fn stop(&self) -> Confirm {
        // A unit that is already down needs no control request.
        if let Ok(false) = self.is_active() {
            return Confirm::Confirmed(true);
        }
        if let Err(err) = self.manager.stop(&self.unit) {
            tracing::warn!(unit = %self.unit, %err, "stop request failed");
            return Confirm::Unknown;
        }
        self.await_active(false)
    }

    pub fn restart(&self) -> Confirm {
        if let Err(err) = self.manager.restart(&self.unit) {
            tracing::warn!(unit = %self.unit, %err, "restart request failed");
            return Confirm::Unknown;
        }
        self.await_active(true)
    }

    pub fn enable(&self) -> Confirm {
        if let Err(err) = self.manager.enable(&self.unit) {
            tracing::warn!(unit = %self.unit, %err, "enable request failed");
            return Confirm::Unknown;
        }
        self.await_enabled(true)
    }

    pub fn disable(&self) -> Confirm {
        if let Err(err) = self.manager.disable(&self.unit) {
            tracing::warn!(unit = %self.unit, %err, "disable request failed");
            return Confirm::Unknown;
        }
        self.await_enabled(false)
    }

    fn await_active(&self, desired: bool) -> Confirm {
        self.poll(|manager, unit| match manager.active_state(unit) {
            Ok(UnitState::Active) if desired => Some(Confirm::Confirmed(true)),
            Ok(UnitState::Failed) if desired => Some(Confirm::Confirmed(false)),
            Ok(UnitState::Inactive) | Ok(UnitState::Failed) if !desired => {
                Some(Confirm::Confirmed(true))
            }
            Ok(_) => None,
            Err(_) => None,
        })
    }

    fn await_enabled(&self, desired: bool) -> Confirm {
        self.poll(|manager, unit| match manager.is_enabled(unit) {
            Ok(enabled) if enabled == desired => Some(Confirm::Confirmed(true)),
            _ => None,
        })
    }

    fn poll<F>(&self, probe: F) -> Confirm
    where
        F: Fn(&M, &str) -> Option<Confirm>,
    {
        thread::sleep(self.backoff.settle);
        for attempt in 0..self.backoff.max_attempts {
            if let Some(confirm) = probe(&self.manager, &self.unit) {
                return confirm;
            }
            tracing::debug!(unit = %self.unit, attempt, "waiting for the service manager");
            thread::sleep(self.backoff.interval);
        }
        Confirm::Unknown
    }
}

/// Drives `systemctl(1)`. State queries read the command output; a command
/// that cannot be spawned at all surfaces as `Unavailable`.
pub struct SystemctlManager;

impl SystemctlManager {
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .map_err(|err| Error::Unavailable(format!("systemctl {}: {err}", args.join(" "))))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl UnitManager for SystemctlManager {
    fn active_state(&self, unit: &str) -> Result<UnitState> {
        // is-active exits non-zero for inactive units; the output is the
        // state either way.
        let state = self.run(&["is-active", unit])?;
        Ok(match state.as_str() {
            "active" => UnitState::Active,
            "activating" | "reloading" => UnitState::Activating,
            "failed" => UnitState::Failed,
            _ => UnitState::Inactive,
        })
    }

    fn is_enabled(&self, unit: &str) -> Result<bool> {
        let state = self.run(&["is-enabled", unit])?;
        Ok(state.starts_with("enabled"))
    }

    fn start(&self, unit: &str) -> Result<()> {
        self.run(&["start", unit]).map(|_| ())
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.run(&["stop", unit]).map(|_| ())
    }

    fn enable(&self, unit: &str) -> Result<()> {
        self.run(&["enable", unit]).map(|_| ())
    }

    fn disable(&self, unit: &str) -> Result<()> {
        self.run(&["disable", unit]).map(|_| ())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.run(&["restart", unit]).map(|_| ())
    }
}
