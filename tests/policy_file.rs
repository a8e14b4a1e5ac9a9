use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::Duration;

use usb_warden::policy::config::{locate_daemon_config, DaemonConfig};
use usb_warden::policy::file::{content_sha256, parse_rules};
use usb_warden::policy::PolicyStore;
use usb_warden::systemd::{BackoffPolicy, UnitManager, UnitState};
use usb_warden_core::rule::Target;
use usb_warden_core::{Error, Result};

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        settle: Duration::from_millis(1),
        interval: Duration::from_millis(1),
        max_attempts: 3,
    }
}

/// Behaves like the enforcement daemon: starting succeeds only while every
/// line of the rule file parses.
struct FakeDaemon {
    rules_path: PathBuf,
    state: Cell<UnitState>,
    enabled: Cell<bool>,
}

impl FakeDaemon {
    fn rules_are_valid(&self) -> bool {
        match std::fs::read_to_string(&self.rules_path) {
            Ok(content) => parse_rules(&content).is_lossless(),
            Err(_) => true,
        }
    }
}

impl UnitManager for FakeDaemon {
    fn active_state(&self, _unit: &str) -> Result<UnitState> {
        Ok(self.state.get())
    }

    fn is_enabled(&self, _unit: &str) -> Result<bool> {
        Ok(self.enabled.get())
    }

    fn start(&self, _unit: &str) -> Result<()> {
        self.state.set(if self.rules_are_valid() {
            UnitState::Active
        } else {
            UnitState::Failed
        });
        Ok(())
    }

    fn stop(&self, _unit: &str) -> Result<()> {
        self.state.set(UnitState::Inactive);
        Ok(())
    }

    fn enable(&self, _unit: &str) -> Result<()> {
        self.enabled.set(true);
        Ok(())
    }

    fn disable(&self, _unit: &str) -> Result<()> {
        self.enabled.set(false);
        Ok(())
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.start(unit)
    }
}

fn policy_store(dir: &Path, rules: &str, active: bool) -> (PolicyStore<FakeDaemon>, PathBuf) {
    let rules_path = dir.join("rules.conf");
    std::fs::write(&rules_path, rules).expect("write rules");
    let config_path = dir.join("usbguard-daemon.conf");
    std::fs::write(
        &config_path,
        format!(
            "RuleFile={}\nImplicitPolicyTarget=block\n",
            rules_path.display()
        ),
    )
    .expect("write config");

    let config = DaemonConfig::parse(&config_path).expect("parse config");
    let manager = FakeDaemon {
        rules_path: rules_path.clone(),
        state: Cell::new(if active {
            UnitState::Active
        } else {
            UnitState::Inactive
        }),
        enabled: Cell::new(false),
    };
    let store = PolicyStore::with_config(manager, fast_backoff(), "usbguard.service", config);
    (store, rules_path)
}

#[test]
fn locate_finds_the_config_flag_in_the_unit_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let unit_path = dir.path().join("usbguard.service");
    std::fs::write(
        &unit_path,
        "[Service]\nExecStart=/usr/sbin/usbguard-daemon -d -k -c /etc/usbguard/usbguard-daemon.conf\n",
    )
    .expect("write unit");

    let found = locate_daemon_config(&unit_path).expect("locate");
    assert_eq!(
        found,
        Some(PathBuf::from("/etc/usbguard/usbguard-daemon.conf"))
    );
}

#[test]
fn locate_reports_a_missing_unit_as_not_installed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let found = locate_daemon_config(&dir.path().join("usbguard.service")).expect("locate");
    assert_eq!(found, None);
}

#[test]
fn daemon_config_parses_acl_and_policy_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("daemon.conf");
    std::fs::write(
        &config_path,
        "# comment\nRuleFile=/etc/usbguard/rules.conf\nIPCAllowedUsers=root joe\nIPCAllowedGroups=wheel\nImplicitPolicyTarget=block\n",
    )
    .expect("write");

    let config = DaemonConfig::parse(&config_path).expect("parse");
    assert_eq!(
        config.rules_file.as_deref(),
        Some(Path::new("/etc/usbguard/rules.conf"))
    );
    assert!(config.ipc_allowed_users.contains("root"));
    assert!(config.ipc_allowed_users.contains("joe"));
    assert!(config.ipc_allowed_groups.contains("wheel"));
    assert_eq!(config.implicit_policy_target, Some(Target::Block));
}

#[test]
fn malformed_daemon_config_is_an_error_not_a_silent_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("daemon.conf");
    std::fs::write(&config_path, "RuleFile /no/equals/sign\n").expect("write");
    assert!(matches!(
        DaemonConfig::parse(&config_path),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn missing_daemon_config_parses_with_unset_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig::parse(dir.path().join("absent.conf")).expect("parse");
    assert!(config.rules_file.is_none());
    assert!(config.ipc_allowed_users.is_empty());
    assert_eq!(config.implicit_policy_target, None);
}

#[test]
fn overwrite_applies_new_rules_and_leaves_the_daemon_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, rules_path) = policy_store(dir.path(), "allow id 1d6b:0002\n", false);

    store
        .overwrite_rule_file("allow id 0951:1666\n", true, None)
        .expect("overwrite");

    assert_eq!(
        std::fs::read_to_string(&rules_path).expect("read"),
        "allow id 0951:1666\n"
    );
    assert!(store.controller().is_active().expect("state"));
}

#[test]
fn overwrite_probe_only_stops_the_daemon_afterward() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, _rules_path) = policy_store(dir.path(), "", false);

    store
        .overwrite_rule_file("allow id 0951:1666\n", false, None)
        .expect("overwrite");
    assert!(!store.controller().is_active().expect("state"));
}

#[test]
fn failed_health_check_restores_the_file_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let before = "allow id 1d6b:0002\nblock\n";
    let (store, rules_path) = policy_store(dir.path(), before, false);

    let result = store.overwrite_rule_file("this is not a rule\n", true, None);
    assert!(matches!(result, Err(Error::TransactionFailure(_))));
    assert_eq!(std::fs::read_to_string(&rules_path).expect("read"), before);
}

#[test]
fn rollback_brings_a_previously_active_daemon_back_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let before = "allow id 1d6b:0002\n";
    let (store, rules_path) = policy_store(dir.path(), before, true);

    let result = store.overwrite_rule_file("broken content\n", true, None);
    assert!(result.is_err());
    assert_eq!(std::fs::read_to_string(&rules_path).expect("read"), before);
    assert!(store.controller().is_active().expect("state"));
}

#[test]
fn overwrite_detects_concurrent_edits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, rules_path) = policy_store(dir.path(), "allow id 1d6b:0002\n", false);

    let stale = content_sha256("different content entirely\n");
    let result = store.overwrite_rule_file("block\n", true, Some(&stale));
    assert!(matches!(result, Err(Error::Conflict(_))));
    assert_eq!(
        std::fs::read_to_string(&rules_path).expect("read"),
        "allow id 1d6b:0002\n"
    );
}

#[test]
fn change_implicit_policy_rewrites_the_directive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut store, _rules_path) = policy_store(dir.path(), "", false);
    let config_path = store.config.config_path.clone();

    store.change_implicit_policy(false).expect("change");
    assert_eq!(store.config.implicit_policy_target, Some(Target::Allow));
    let content = std::fs::read_to_string(&config_path).expect("read");
    assert!(content.contains("ImplicitPolicyTarget=allow"));
    assert!(!content.contains("ImplicitPolicyTarget=block"));

    store.change_implicit_policy(true).expect("change back");
    let content = std::fs::read_to_string(&config_path).expect("read");
    assert!(content.contains("ImplicitPolicyTarget=block"));
}

#[test]
fn change_daemon_status_confirms_both_flags() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, _rules_path) = policy_store(dir.path(), "", false);

    store.change_daemon_status(true, true).expect("status");
    assert!(store.controller().is_active().expect("state"));
    assert!(store.controller().is_enabled().expect("state"));

    store.change_daemon_status(false, false).expect("status");
    assert!(!store.controller().is_active().expect("state"));
    assert!(!store.controller().is_enabled().expect("state"));
}

#[test]
fn try_to_run_probe_leaves_no_side_effects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, _rules_path) = policy_store(dir.path(), "allow\n", false);

    assert!(store.try_to_run(false));
    assert!(!store.controller().is_active().expect("state"));

    assert!(store.try_to_run(true));
    assert!(store.controller().is_active().expect("state"));
}
