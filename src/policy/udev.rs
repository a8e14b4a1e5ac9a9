use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const UDEV_RULES_DIRS: &[&str] = &[
    "/etc/udev/rules.d",
    "/usr/lib/udev/rules.d",
    "/run/udev/rules.d",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// Scans udev rule directories for files with suspicious ownership or
/// permissions. Missing directories are skipped; this is a boundary-level
/// inspection, not an enforcement mechanism.
pub fn inspect_udev_rules(dirs: &[impl AsRef<Path>]) -> Vec<UdevWarning> {
    let mut warnings = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir.as_ref()) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("rules") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            if meta.uid() != 0 {
                warnings.push(UdevWarning {
                    path: path.clone(),
                    reason: format!("not owned by root (uid {})", meta.uid()),
                });
            }
            let mode = meta.permissions().mode();
            if mode & 0o022 != 0 {
                warnings.push(UdevWarning {
                    path,
                    reason: format!("writable by group or other (mode {:o})", mode & 0o777),
                });
            }
        }
    }
    warnings
}
