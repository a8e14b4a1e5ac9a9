use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use usb_warden::guard::{GuardBus, UsbguardCli};
use usb_warden::policy::udev::{inspect_udev_rules, UDEV_RULES_DIRS};
use usb_warden::policy::PolicyStore;
use usb_warden::protocol;
use usb_warden::store::sqlite::SqliteStore;
use usb_warden::store::Store;
use usb_warden::systemd::{BackoffPolicy, SystemctlManager};
use usb_warden_core::rule::Target;
use usb_warden_service::monitor::{Monitor, NetlinkEventSource, SharedStore};
use usb_warden_service::mounter::SysMounter;
use usb_warden_service::settings::{load_settings, Settings};

#[derive(Debug, Parser)]
#[command(name = "usb-wardend")]
struct Args {
    /// Settings file (.toml or .json); built-in defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the automount daemon
    Run,
    /// Apply a JSON policy-change request and print the response
    Apply {
        /// Request file; reads stdin when omitted
        #[arg(long)]
        request: Option<PathBuf>,
    },
    /// Allow or block one attached device by its daemon-assigned id
    Device {
        id: u32,
        #[arg(long, conflicts_with = "block")]
        allow: bool,
        #[arg(long)]
        block: bool,
        /// Make the decision a permanent rule instead of a one-off
        #[arg(long)]
        permanent: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };

    match args.command {
        Command::Run => run_monitor(settings).await,
        Command::Apply { request } => apply_request(settings, request),
        Command::Device {
            id,
            allow,
            block: _,
            permanent,
        } => {
            let mut guard = UsbguardCli::new();
            guard.reconnect()?;
            let target = if allow { Target::Allow } else { Target::Block };
            guard.apply_device_policy(id, target, permanent)?;
            Ok(())
        }
    }
}

async fn run_monitor(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let store: SharedStore = Arc::new(Mutex::new(store));
    let mounter = Arc::new(SysMounter::new(settings.mount_base.clone()));
    let source = NetlinkEventSource::create()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            let _ = stop_tx.send(true);
        }
    });

    Monitor::new(
        source,
        store,
        mounter,
        settings.deny_filesystems.clone(),
        Duration::from_millis(settings.poll_interval_ms),
        Duration::from_secs(settings.sweep_interval_secs),
        stop_rx,
    )
    .run()
    .await;
    Ok(())
}

fn apply_request(settings: Settings, request: Option<PathBuf>) -> anyhow::Result<()> {
    let raw = match request {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    for warning in inspect_udev_rules(UDEV_RULES_DIRS) {
        tracing::warn!(path = %warning.path.display(), reason = %warning.reason, "suspicious udev rule file");
    }

    let mut policy = PolicyStore::open(
        SystemctlManager,
        BackoffPolicy::default(),
        &settings.unit_dir,
        &settings.unit_name,
    )?;
    let mut guard = UsbguardCli::new();
    let mut store = open_store(&settings)?;

    let response = protocol::apply_json(&raw, &mut policy, &mut guard, Some(&mut store as &mut dyn Store));
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

fn open_store(settings: &Settings) -> anyhow::Result<SqliteStore> {
    if let Some(parent) = settings.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(SqliteStore::open(&settings.db_path)?)
}
