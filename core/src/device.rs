use serde::{Deserialize, Serialize};

use crate::rule::Target;

/// Identity tuple keying trust decisions. Vendor and product ids are kept in
/// their textual hex form, exactly as they appear in rules and udev
/// properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub vid: String,
    pub pid: String,
    pub serial: String,
}

impl DeviceId {
    pub fn new(vid: impl Into<String>, pid: impl Into<String>, serial: impl Into<String>) -> Self {
        DeviceId {
            vid: vid.into(),
            pid: pid.into(),
            serial: serial.into(),
        }
    }
}

/// One attached device as reported by the enforcement daemon. The daemon
/// reports one record per folded interface type, so a compound device can
/// appear several times under the same numeric id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbDevice {
    pub id: u32,
    pub target: Target,
    pub name: String,
    pub vid: String,
    pub pid: String,
    pub via_port: String,
    pub connect_type: String,
    pub interface: String,
    pub serial: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
}

/// Hotplug event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Add,
    Remove,
    Change,
}

impl EventAction {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "add" => Some(EventAction::Add),
            "remove" => Some(EventAction::Remove),
            "change" => Some(EventAction::Change),
            _ => None,
        }
    }
}

/// One hotplug notification. Transient; never persisted.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub action: EventAction,
    pub id: DeviceId,
    pub block_name: String,
    pub filesystem: String,
}
