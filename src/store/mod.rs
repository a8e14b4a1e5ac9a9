use usb_warden_core::device::DeviceId;
use usb_warden_core::{Error, Result};

/// Trust decision for one device identity. Written only by the policy
/// change protocol, never by the automount engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRecord {
    pub id: DeviceId,
    pub trusted: bool,
}

/// Active mount owned by the automount engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub block_name: String,
    pub mount_point: String,
}

pub trait Store {
    fn permission_find(&mut self, id: &DeviceId) -> Result<Option<PermissionRecord>>;

    fn permission_upsert(&mut self, record: &PermissionRecord) -> Result<()>;

    fn permission_remove(&mut self, id: &DeviceId) -> Result<bool>;

    fn permission_list(&mut self) -> Result<Vec<PermissionRecord>>;

    fn mount_find(&mut self, block_name: &str) -> Result<Option<MountRecord>>;

    fn mount_upsert(&mut self, record: &MountRecord) -> Result<()>;

    fn mount_remove(&mut self, block_name: &str) -> Result<bool>;

    fn mount_list(&mut self) -> Result<Vec<MountRecord>>;

    /// Replaces the whole mount table in one transaction; used by the
    /// reconciliation sweep.
    fn mount_replace_all(&mut self, records: &[MountRecord]) -> Result<()>;
}

fn db_err(err: impl std::fmt::Display) -> Error {
    Error::Db(err.to_string())
}

pub mod sqlite;
