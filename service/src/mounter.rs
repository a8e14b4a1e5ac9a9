use std::path::{Path, PathBuf};
use std::process::Command;

use usb_warden::store::MountRecord;
use usb_warden_core::{Error, Result};

/// Mount/unmount boundary. The system implementation shells out to
/// `mount(8)`/`umount(8)`; tests substitute fakes.
pub trait Mounter: Send + Sync {
    fn mount(&self, block_name: &str, filesystem: &str) -> Result<MountRecord>;

    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Live mounts under the configured base, read from the kernel mount
    /// table.
    fn active_mounts(&self) -> Result<Vec<MountRecord>>;
}

pub struct SysMounter {
    mount_base: PathBuf,
}

impl SysMounter {
    pub fn new(mount_base: impl Into<PathBuf>) -> Self {
        SysMounter {
            mount_base: mount_base.into(),
        }
    }
}

impl Mounter for SysMounter {
    fn mount(&self, block_name: &str, filesystem: &str) -> Result<MountRecord> {
        let device = format!("/dev/{block_name}");
        let mount_point = self.mount_base.join(block_name);
        std::fs::create_dir_all(&mount_point)?;

        let output = Command::new("mount")
            .arg("-t")
            .arg(filesystem)
            .arg(&device)
            .arg(&mount_point)
            .output()
            .map_err(|err| Error::Unavailable(format!("mount: {err}")))?;
        if !output.status.success() {
            let _ = std::fs::remove_dir(&mount_point);
            return Err(Error::Io(format!(
                "mount {device} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(MountRecord {
            block_name: block_name.to_string(),
            mount_point: mount_point.to_string_lossy().into_owned(),
        })
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let output = Command::new("umount")
            .arg(mount_point)
            .output()
            .map_err(|err| Error::Unavailable(format!("umount: {err}")))?;
        if !output.status.success() {
            return Err(Error::Io(format!(
                "umount {} failed: {}",
                mount_point.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let _ = std::fs::remove_dir(mount_point);
        Ok(())
    }

    fn active_mounts(&self) -> Result<Vec<MountRecord>> {
        let table = std::fs::read_to_string("/proc/self/mounts")?;
        Ok(parse_mount_table(&table, &self.mount_base))
    }
}

/// Extracts `/dev/<name> <mount point>` pairs whose mount point lies under
/// `base`. Mount-table fields are whitespace separated; spaces inside paths
/// appear as `\040`.
pub fn parse_mount_table(table: &str, base: &Path) -> Vec<MountRecord> {
    let mut out = Vec::new();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some(block_name) = device.strip_prefix("/dev/") else {
            continue;
        };
        let mount_point = mount_point.replace("\\040", " ");
        if !Path::new(&mount_point).starts_with(base) {
            continue;
        }
        out.push(MountRecord {
            block_name: block_name.to_string(),
            mount_point,
        });
    }
    out
}
