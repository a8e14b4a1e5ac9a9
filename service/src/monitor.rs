//! Hotplug monitor: consumes device events, consults the permission store,
//! and dispatches mount/unmount/reconcile actions.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kobject_uevent::ActionType;
use nix::sys::socket;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use usb_warden::store::Store;
use usb_warden_core::device::{DeviceEvent, DeviceId, EventAction};
use usb_warden_core::{Error, Result};

use crate::mounter::Mounter;

const UEVENT_BUF_SIZE: usize = 64 * 1024;

pub type SharedStore = Arc<Mutex<dyn Store + Send>>;

/// Asynchronous hotplug event source; the netlink implementation is below,
/// tests feed scripted events.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<DeviceEvent>;
}

/// Listens for udev-processed uevents on the kernel netlink socket.
pub struct NetlinkEventSource {
    afd: AsyncFd<OwnedFd>,
}

impl NetlinkEventSource {
    /// Binds the netlink socket. A failure here means the monitor cannot
    /// observe devices at all and is fatal to startup.
    pub fn create() -> Result<Self> {
        let fd = create_socket()
            .map_err(|err| Error::Unavailable(format!("can't bind the uevent socket: {err}")))?;
        let afd = AsyncFd::new(fd)?;
        Ok(NetlinkEventSource { afd })
    }
}

fn create_socket() -> nix::Result<OwnedFd> {
    let addr = socket::NetlinkAddr::new(0, 0xffffffff);
    let s = socket::socket(
        socket::AddressFamily::Netlink,
        socket::SockType::Datagram,
        socket::SockFlag::SOCK_NONBLOCK | socket::SockFlag::SOCK_CLOEXEC,
        socket::SockProtocol::NetlinkKObjectUEvent,
    )?;
    socket::setsockopt(&s, socket::sockopt::RcvBuf, &UEVENT_BUF_SIZE)?;
    socket::bind(s.as_raw_fd(), &addr)?;
    Ok(s)
}

#[async_trait]
impl EventSource for NetlinkEventSource {
    async fn next_event(&mut self) -> Result<DeviceEvent> {
        let mut buffer = [0u8; UEVENT_BUF_SIZE];
        loop {
            let mut guard = self.afd.readable().await?;
            match guard.try_io(|inner| {
                socket::recv(inner.as_raw_fd(), &mut buffer, socket::MsgFlags::empty())
                    .map_err(std::io::Error::from)
            }) {
                Ok(Ok(count)) => {
                    if count == 0 {
                        return Err(Error::Unavailable("netlink socket closed".to_string()));
                    }
                    match kobject_uevent::UEvent::from_netlink_packet(&buffer[..count]) {
                        Ok(uevent) => {
                            if let Some(event) = to_device_event(&uevent) {
                                return Ok(event);
                            }
                        }
                        Err(err) => tracing::debug!(%err, "unparseable uevent packet"),
                    }
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Maps a uevent onto a [`DeviceEvent`]. Only udev-annotated block events
/// from USB devices qualify; kernel-side duplicates carry no ID_* keys and
/// are dropped here.
fn to_device_event(uevent: &kobject_uevent::UEvent) -> Option<DeviceEvent> {
    if uevent.subsystem != "block" {
        return None;
    }
    let env = &uevent.env;
    if env.get("ID_BUS").map(String::as_str) != Some("usb") {
        return None;
    }
    let action = match uevent.action {
        ActionType::Add => EventAction::Add,
        ActionType::Remove => EventAction::Remove,
        ActionType::Change => EventAction::Change,
        _ => return None,
    };
    let block_name = env
        .get("DEVNAME")?
        .trim_start_matches("/dev/")
        .to_string();
    Some(DeviceEvent {
        action,
        id: DeviceId::new(
            env.get("ID_VENDOR_ID").cloned().unwrap_or_default(),
            env.get("ID_MODEL_ID").cloned().unwrap_or_default(),
            env.get("ID_SERIAL_SHORT").cloned().unwrap_or_default(),
        ),
        block_name,
        filesystem: env.get("ID_FS_TYPE").cloned().unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Mount,
    Unmount,
    Reconcile,
    Ignore,
}

/// The decision state machine, kept pure so it can be exercised directly.
pub fn decide(
    event: &DeviceEvent,
    known: bool,
    was_mounted: bool,
    deny_filesystems: &[String],
) -> Decision {
    let unsupported = event.filesystem.is_empty()
        || deny_filesystems.iter().any(|fs| fs == &event.filesystem);
    let added = event.action == EventAction::Add;
    let removed_and_mounted = was_mounted && event.action == EventAction::Remove;

    if ((known && added) || removed_and_mounted) && !unsupported {
        if added {
            Decision::Mount
        } else {
            Decision::Unmount
        }
    } else if event.action == EventAction::Change && was_mounted {
        Decision::Reconcile
    } else {
        Decision::Ignore
    }
}

pub struct Monitor<E: EventSource> {
    source: E,
    store: SharedStore,
    mounter: Arc<dyn Mounter>,
    deny_filesystems: Vec<String>,
    poll_interval: Duration,
    sweep_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<E: EventSource> Monitor<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: E,
        store: SharedStore,
        mounter: Arc<dyn Mounter>,
        deny_filesystems: Vec<String>,
        poll_interval: Duration,
        sweep_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Monitor {
            source,
            store,
            mounter,
            deny_filesystems,
            poll_interval,
            sweep_interval,
            shutdown,
        }
    }

    /// Runs until the stop signal is raised. The wait on the event source is
    /// bounded so the stop signal and sweep cadence are observed even with
    /// no device activity; sweeps never gate the loop.
    pub async fn run(mut self) {
        spawn_sweep(self.store.clone(), self.mounter.clone());
        let mut last_sweep = tokio::time::Instant::now();
        loop {
            if *self.shutdown.borrow() {
                tracing::debug!("stop signal received");
                break;
            }
            match tokio::time::timeout(self.poll_interval, self.source.next_event()).await {
                Err(_elapsed) => {
                    if last_sweep.elapsed() >= self.sweep_interval {
                        last_sweep = tokio::time::Instant::now();
                        spawn_sweep(self.store.clone(), self.mounter.clone());
                    }
                }
                Ok(Err(err)) => tracing::warn!(%err, "event source error"),
                Ok(Ok(event)) => self.handle_event(event).await,
            }
        }
    }

    pub async fn handle_event(&self, event: DeviceEvent) {
        let (known, was_mounted) = {
            let Ok(mut store) = self.store.lock() else {
                tracing::error!("permission store lock is poisoned; dropping event");
                return;
            };
            let known = match store.permission_find(&event.id) {
                Ok(Some(record)) => record.trusted,
                Ok(None) => false,
                Err(err) => {
                    tracing::warn!(%err, "permission lookup failed");
                    false
                }
            };
            let was_mounted = matches!(store.mount_find(&event.block_name), Ok(Some(_)));
            (known, was_mounted)
        };

        match decide(&event, known, was_mounted, &self.deny_filesystems) {
            Decision::Mount => self.mount(event).await,
            Decision::Unmount => self.unmount(event).await,
            Decision::Reconcile => spawn_sweep(self.store.clone(), self.mounter.clone()),
            Decision::Ignore => {}
        }
    }

    async fn mount(&self, event: DeviceEvent) {
        let mounter = self.mounter.clone();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let record = mounter.mount(&event.block_name, &event.filesystem)?;
            let mut store = store
                .lock()
                .map_err(|_| Error::Db("store lock poisoned".to_string()))?;
            store.mount_upsert(&record)?;
            Ok::<_, Error>(record)
        })
        .await;
        match result {
            Ok(Ok(record)) => tracing::info!(
                block = %record.block_name,
                mount_point = %record.mount_point,
                "device mounted"
            ),
            Ok(Err(err)) => tracing::warn!(%err, "mount failed"),
            Err(err) => tracing::warn!(%err, "mount task failed"),
        }
    }

    async fn unmount(&self, event: DeviceEvent) {
        let mounter = self.mounter.clone();
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let record = {
                let mut store = store
                    .lock()
                    .map_err(|_| Error::Db("store lock poisoned".to_string()))?;
                store.mount_find(&event.block_name)?
            };
            let Some(record) = record else {
                return Ok(None);
            };
            mounter.unmount(Path::new(&record.mount_point))?;
            let mut store = store
                .lock()
                .map_err(|_| Error::Db("store lock poisoned".to_string()))?;
            store.mount_remove(&record.block_name)?;
            Ok::<_, Error>(Some(record))
        })
        .await;
        match result {
            Ok(Ok(Some(record))) => tracing::info!(
                block = %record.block_name,
                mount_point = %record.mount_point,
                "device unmounted"
            ),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => tracing::warn!(%err, "unmount failed"),
            Err(err) => tracing::warn!(%err, "unmount task failed"),
        }
    }
}

/// Fire-and-forget reconciliation. The result is not awaited by the caller;
/// failures are logged, never fatal to the loop.
pub fn spawn_sweep(store: SharedStore, mounter: Arc<dyn Mounter>) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = reconcile(&store, mounter.as_ref()) {
            tracing::warn!(%err, "mount table reconciliation failed");
        }
    });
}

/// Rebuilds the mount table from the live kernel view, healing drift caused
/// by external tools.
pub fn reconcile(store: &SharedStore, mounter: &dyn Mounter) -> Result<()> {
    let live = mounter.active_mounts()?;
    let mut store = store
        .lock()
        .map_err(|_| Error::Db("store lock poisoned".to_string()))?;
    store.mount_replace_all(&live)
}
