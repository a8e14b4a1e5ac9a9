use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

use usb_warden_core::device::UsbDevice;
use usb_warden_core::rule::{fold_interface_list, InterfaceClass, Rule, Target};
use usb_warden_core::{Error, Result};

const USB_IDS_PATH: &str = "/usr/share/misc/usb.ids";

/// Narrow capability interface to the enforcement daemon. The core never
/// depends on the daemon's concrete types; production uses the CLI adapter,
/// tests use fakes.
pub trait GuardBus {
    fn healthy(&self) -> bool;

    fn reconnect(&mut self) -> Result<()>;

    fn list_devices(&mut self) -> Result<Vec<UsbDevice>>;

    fn apply_device_policy(&mut self, id: u32, target: Target, permanent: bool) -> Result<()>;
}

/// Adapter over the `usbguard(1)` control utility. The handle is owned and
/// reconnectable; `healthy` reflects the last probe, `reconnect` re-probes.
pub struct UsbguardCli {
    binary: PathBuf,
    usb_ids_path: PathBuf,
    connected: bool,
}

impl UsbguardCli {
    pub fn new() -> Self {
        Self::with_paths("usbguard", USB_IDS_PATH)
    }

    pub fn with_paths(binary: impl Into<PathBuf>, usb_ids_path: impl Into<PathBuf>) -> Self {
        UsbguardCli {
            binary: binary.into(),
            usb_ids_path: usb_ids_path.into(),
            connected: false,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|err| Error::Unavailable(format!("usbguard {}: {err}", args.join(" "))))?;
        if !output.status.success() {
            return Err(Error::Unavailable(format!(
                "usbguard {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for UsbguardCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardBus for UsbguardCli {
    fn healthy(&self) -> bool {
        self.connected
    }

    fn reconnect(&mut self) -> Result<()> {
        match self.run(&["get-parameter", "ImplicitPolicyTarget"]) {
            Ok(_) => {
                self.connected = true;
                Ok(())
            }
            Err(err) => {
                self.connected = false;
                Err(err)
            }
        }
    }

    fn list_devices(&mut self) -> Result<Vec<UsbDevice>> {
        if !self.healthy() {
            return Err(Error::Unavailable(
                "enforcement daemon is not connected".to_string(),
            ));
        }
        let listing = self.run(&["list-devices"])?;
        let mut devices = parse_device_listing(&listing);

        let vids: HashSet<String> = devices.iter().map(|d| d.vid.clone()).collect();
        let vendor_names = map_vendor_names(&self.usb_ids_path, &vids);
        for device in &mut devices {
            if let Some(name) = vendor_names.get(&device.vid) {
                device.vendor_name = Some(name.clone());
            }
        }
        Ok(devices)
    }

    fn apply_device_policy(&mut self, id: u32, target: Target, permanent: bool) -> Result<()> {
        if !self.healthy() {
            return Err(Error::Unavailable(
                "enforcement daemon is not connected".to_string(),
            ));
        }
        let verb = match target {
            Target::Allow => "allow-device",
            Target::Block | Target::Reject => "block-device",
        };
        let id = id.to_string();
        let args: Vec<&str> = if permanent {
            vec![verb, "-p", &id]
        } else {
            vec![verb, &id]
        };
        self.run(&args).map(|_| ())
    }
}

/// Each listing line is `<id>: <rule string>`. A device exposing several
/// interfaces produces one record per folded interface type; lines that do
/// not parse are skipped.
fn parse_device_listing(listing: &str) -> Vec<UsbDevice> {
    let mut devices = Vec::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((id, rule_text)) = line.split_once(':') else {
            continue;
        };
        let Ok(id) = id.trim().parse::<u32>() else {
            continue;
        };
        let rule = match Rule::parse(rule_text.trim()) {
            Ok(rule) => rule,
            Err(err) => {
                tracing::warn!(%err, line, "skipping unparseable device entry");
                continue;
            }
        };
        for interface in folded_interfaces(&rule.interfaces) {
            devices.push(UsbDevice {
                id,
                target: rule.target,
                name: rule.name.clone().unwrap_or_default(),
                vid: rule.vid.clone().unwrap_or_default(),
                pid: rule.pid.clone().unwrap_or_default(),
                via_port: rule.via_port.clone().unwrap_or_default(),
                connect_type: rule.connect_type.clone().unwrap_or_default(),
                interface,
                serial: rule.serial.clone().unwrap_or_default(),
                hash: rule.hash.clone().unwrap_or_default(),
                vendor_name: None,
            });
        }
    }
    devices
}

fn folded_interfaces(interfaces: &[InterfaceClass]) -> Vec<String> {
    match interfaces.len() {
        0 => vec![String::new()],
        1 => vec![interfaces[0].to_string()],
        _ => {
            let specs: Vec<String> = interfaces.iter().map(|i| i.to_string()).collect();
            fold_interface_list(&format!("{{ {} }}", specs.join(" ")))
        }
    }
}

/// Resolves vendor ids to names with one pass over the usb.ids database.
/// Vendor lines are `vvvv  Name`; tab-indented product lines are skipped.
pub fn map_vendor_names(path: &Path, vendors: &HashSet<String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "can't open the usb.ids database");
            return out;
        }
    };
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.starts_with('\t') || line.starts_with('#') || line.is_empty() {
            continue;
        }
        let Some((vid, name)) = line.split_once("  ") else {
            continue;
        };
        if vendors.contains(vid) {
            out.insert(vid.to_string(), name.trim().to_string());
        }
    }
    out
}
