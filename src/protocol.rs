//! JSON batch policy-change protocol. A request names the target daemon run
//! state and a preset mode; the response reports per-item accept/reject
//! status and an overall flag.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use usb_warden_core::device::{DeviceId, UsbDevice};
use usb_warden_core::rule::{Rule, Target};
use usb_warden_core::{Error, Result};

use crate::guard::GuardBus;
use crate::policy::{file, PolicyStore};
use crate::store::{PermissionRecord, Store};
use crate::systemd::UnitManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresetMode {
    #[serde(rename = "manual_mode")]
    Manual,
    #[serde(rename = "put_connected_to_white_list")]
    AllowConnected,
    #[serde(rename = "put_connected_to_white_list_plus_HID")]
    AllowConnectedPlusHid,
}

/// One proposed rule addition. `raw` short-circuits the field-wise form;
/// either way the result goes through the rule parser, so a spec that names
/// an invalid field is rejected, never silently widened.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleSpec {
    pub tr_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_connect_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interface: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl RuleSpec {
    pub fn to_rule(&self) -> Result<Rule> {
        if let Some(raw) = &self.raw {
            return Rule::parse(raw);
        }
        let target = self
            .target
            .ok_or_else(|| Error::MalformedRule("rule spec names no target".to_string()))?;
        let mut text = target.as_str().to_string();
        if let Some(name) = &self.name {
            text.push_str(&format!(" name \"{name}\""));
        }
        if self.vid.is_some() || self.pid.is_some() {
            text.push_str(&format!(
                " id {}:{}",
                self.vid.as_deref().unwrap_or("*"),
                self.pid.as_deref().unwrap_or("*")
            ));
        }
        if let Some(serial) = &self.serial {
            text.push_str(&format!(" serial \"{serial}\""));
        }
        if let Some(hash) = &self.hash {
            text.push_str(&format!(" hash \"{hash}\""));
        }
        if let Some(parent_hash) = &self.parent_hash {
            text.push_str(&format!(" parent-hash \"{parent_hash}\""));
        }
        if let Some(via_port) = &self.via_port {
            text.push_str(&format!(" via-port \"{via_port}\""));
        }
        if let Some(connect_type) = &self.with_connect_type {
            text.push_str(&format!(" with-connect-type \"{connect_type}\""));
        }
        match self.interface.len() {
            0 => {}
            1 => text.push_str(&format!(" with-interface {}", self.interface[0])),
            _ => text.push_str(&format!(" with-interface {{ {} }}", self.interface.join(" "))),
        }
        if let Some(condition) = &self.condition {
            text.push_str(&format!(" if {condition}"));
        }
        Rule::parse(&text)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRequest {
    /// Wire value is the string "true" or "false", not a JSON bool.
    pub run_daemon: String,
    pub preset_mode: PresetMode,
    #[serde(default)]
    pub appended_rules: Vec<RuleSpec>,
    #[serde(default)]
    pub deleted_rules: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "BAD")]
    Bad,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeResponse {
    #[serde(rename = "rules_OK", default)]
    pub rules_ok: Vec<String>,
    #[serde(rename = "rules_BAD", default)]
    pub rules_bad: Vec<String>,
    #[serde(rename = "STATUS")]
    pub status: Status,
    #[serde(rename = "ERROR_MSG", skip_serializing_if = "Option::is_none", default)]
    pub error_msg: Option<String>,
}

impl ChangeResponse {
    fn ok(rules_ok: Vec<String>) -> Self {
        ChangeResponse {
            rules_ok,
            rules_bad: Vec::new(),
            status: Status::Ok,
            error_msg: None,
        }
    }

    fn bad(rules_ok: Vec<String>, rules_bad: Vec<String>) -> Self {
        ChangeResponse {
            rules_ok,
            rules_bad,
            status: Status::Bad,
            error_msg: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        ChangeResponse {
            rules_ok: Vec::new(),
            rules_bad: Vec::new(),
            status: Status::Error,
            error_msg: Some(msg.into()),
        }
    }
}

/// Parses and applies a raw JSON change request. A request that fails
/// validation applies no changes.
pub fn apply_json<M: UnitManager>(
    msg: &str,
    policy: &mut PolicyStore<M>,
    guard: &mut dyn GuardBus,
    store: Option<&mut dyn Store>,
) -> ChangeResponse {
    let request: ChangeRequest = match serde_json::from_str(msg) {
        Ok(request) => request,
        Err(err) => return ChangeResponse::error(format!("bad change request: {err}")),
    };
    apply(&request, policy, guard, store)
}

pub fn apply<M: UnitManager>(
    request: &ChangeRequest,
    policy: &mut PolicyStore<M>,
    guard: &mut dyn GuardBus,
    mut store: Option<&mut dyn Store>,
) -> ChangeResponse {
    let run_daemon = match request.run_daemon.as_str() {
        "true" => true,
        "false" => false,
        other => {
            return ChangeResponse::error(format!(
                "run_daemon must be \"true\" or \"false\", got \"{other}\""
            ))
        }
    };

    let outcome = match request.preset_mode {
        PresetMode::Manual => manual_mode(request, policy),
        PresetMode::AllowConnected => allow_connected(policy, guard, false),
        PresetMode::AllowConnectedPlusHid => allow_connected(policy, guard, true),
    };
    let plan = match outcome {
        Ok(plan) => plan,
        Err(response) => return response,
    };

    if plan.changed() {
        let content = file::render_rules(&plan.new_rules);
        if let Err(err) =
            policy.overwrite_rule_file(&content, run_daemon, plan.expected_sha256.as_deref())
        {
            tracing::error!(%err, "rule file transaction failed; no changes applied");
            return ChangeResponse::error(format!("can't apply the new rules: {err}"));
        }
        if let Some(store) = store.as_deref_mut() {
            sync_permissions(store, &plan);
        }
    }

    // The rule change is already live; a status failure here is reported in
    // the log only.
    if let Err(err) = policy.change_daemon_status(run_daemon, run_daemon) {
        tracing::error!(%err, "changing the daemon status failed");
    }

    ChangeResponse::ok(plan.rules_ok)
}

struct ChangePlan {
    new_rules: Vec<Rule>,
    added: Vec<Rule>,
    removed: Vec<Rule>,
    rules_ok: Vec<String>,
    any_deletion: bool,
    expected_sha256: Option<String>,
}

impl ChangePlan {
    fn changed(&self) -> bool {
        !self.added.is_empty() || self.any_deletion
    }
}

fn manual_mode<M: UnitManager>(
    request: &ChangeRequest,
    policy: &PolicyStore<M>,
) -> std::result::Result<ChangePlan, ChangeResponse> {
    let mut rules_ok = Vec::new();
    let mut rules_bad = Vec::new();
    let mut additions = Vec::new();
    for spec in &request.appended_rules {
        match spec.to_rule() {
            Ok(rule) => {
                additions.push(rule);
                rules_ok.push(spec.tr_id.clone());
            }
            Err(err) => {
                tracing::warn!(tr_id = %spec.tr_id, %err, "rejected rule");
                rules_bad.push(spec.tr_id.clone());
            }
        }
    }
    // Unparseable deletion entries are skipped; only malformed additions
    // trip the all-or-nothing gate.
    let deleted_numbers: BTreeSet<usize> = request
        .deleted_rules
        .iter()
        .filter_map(|raw| raw.trim().parse::<usize>().ok())
        .collect();

    if !rules_bad.is_empty() {
        return Err(ChangeResponse::bad(rules_ok, rules_bad));
    }

    let snapshot = match policy.parse_rule_file() {
        Ok(snapshot) => snapshot,
        Err(err) => return Err(ChangeResponse::error(format!("can't read the rule file: {err}"))),
    };
    if !snapshot.is_lossless() {
        let err = Error::UntrustworthySnapshot {
            parsed: snapshot.rules.len(),
            total: snapshot.line_count,
        };
        return Err(ChangeResponse::error(err.to_string()));
    }

    let mut new_rules = Vec::new();
    let mut removed = Vec::new();
    for rule in snapshot.rules {
        let number = rule.number.unwrap_or(0);
        if deleted_numbers.contains(&number) {
            removed.push(rule);
        } else {
            new_rules.push(rule);
        }
    }
    new_rules.extend(additions.iter().cloned());

    Ok(ChangePlan {
        new_rules,
        added: additions,
        removed,
        rules_ok,
        any_deletion: !deleted_numbers.is_empty(),
        expected_sha256: Some(snapshot.sha256),
    })
}

fn allow_connected<M: UnitManager>(
    policy: &mut PolicyStore<M>,
    guard: &mut dyn GuardBus,
    plus_hid: bool,
) -> std::result::Result<ChangePlan, ChangeResponse> {
    // Enumeration must not itself be blocked, so the implicit policy goes to
    // allow-all for the duration of the listing.
    if let Err(err) = policy.change_implicit_policy(false) {
        tracing::error!(%err, "can't lift the implicit policy");
        return Err(ChangeResponse::error("failed to change the implicit policy"));
    }

    let _ = guard.reconnect();
    if !guard.healthy() {
        policy.try_to_run(true);
        let _ = guard.reconnect();
        if !guard.healthy() {
            restore_block_policy(policy);
            return Err(ChangeResponse::error("failed to create policy"));
        }
    }

    let devices = match guard.list_devices() {
        Ok(devices) => devices,
        Err(err) => {
            tracing::error!(%err, "device enumeration failed");
            restore_block_policy(policy);
            return Err(ChangeResponse::error("failed to create policy"));
        }
    };

    let mut additions = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for device in &devices {
        if !seen.insert(device.hash.clone()) {
            continue;
        }
        additions.push(snapshot_rule(device));
    }
    if plus_hid {
        let mut hid = Rule::new(Target::Allow);
        hid.interfaces = vec![usb_warden_core::rule::InterfaceClass {
            base: 0x03,
            sub: None,
            protocol: None,
        }];
        additions.push(hid);
    }

    // The preset whitelists what is connected; it always ends blocking
    // everything else.
    restore_block_policy(policy);

    Ok(ChangePlan {
        new_rules: additions.clone(),
        added: additions,
        removed: Vec::new(),
        rules_ok: Vec::new(),
        any_deletion: false,
        expected_sha256: None,
    })
}

fn snapshot_rule(device: &UsbDevice) -> Rule {
    let mut rule = Rule::new(Target::Allow);
    rule.name = Some(device.name.clone());
    rule.hash = Some(device.hash.clone());
    if !device.vid.is_empty() && !device.pid.is_empty() {
        rule.vid = Some(device.vid.clone());
        rule.pid = Some(device.pid.clone());
    }
    if !device.serial.is_empty() {
        rule.serial = Some(device.serial.clone());
    }
    rule
}

fn restore_block_policy<M: UnitManager>(policy: &mut PolicyStore<M>) {
    if let Err(err) = policy.change_implicit_policy(true) {
        tracing::warn!(%err, "can't restore the blocking implicit policy");
    }
}

/// Mirrors accepted rule changes into the permission store. Only rules with
/// a full vid/pid/serial identity are reflected; the automount engine keys
/// strictly by that tuple.
fn sync_permissions(store: &mut dyn Store, plan: &ChangePlan) {
    for rule in &plan.removed {
        if let Some(id) = rule_identity(rule) {
            if let Err(err) = store.permission_remove(&id) {
                tracing::warn!(%err, "can't remove a permission record");
            }
        }
    }
    for rule in &plan.added {
        if let Some(id) = rule_identity(rule) {
            let record = PermissionRecord {
                id,
                trusted: rule.target == Target::Allow,
            };
            if let Err(err) = store.permission_upsert(&record) {
                tracing::warn!(%err, "can't store a permission record");
            }
        }
    }
}

fn rule_identity(rule: &Rule) -> Option<DeviceId> {
    let vid = rule.vid.as_deref().filter(|v| !v.is_empty() && *v != "*")?;
    let pid = rule.pid.as_deref().filter(|p| !p.is_empty() && *p != "*")?;
    let serial = rule.serial.as_deref().filter(|s| !s.is_empty())?;
    Some(DeviceId::new(vid, pid, serial))
}
