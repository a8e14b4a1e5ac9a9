use std::path::Path;
use std::time::Duration;

use rusqlite::OptionalExtension;

use usb_warden_core::device::DeviceId;
use usb_warden_core::Result;

use super::{db_err, MountRecord, PermissionRecord, Store};

pub struct SqliteStore {
    conn: rusqlite::Connection,
}

impl SqliteStore {
    pub fn new(conn: rusqlite::Connection) -> Result<Self> {
        let _ = conn.busy_timeout(Duration::from_secs(5));
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        crate::migrations::migrate_sqlite(&conn).map_err(db_err)?;
        Ok(Self { conn })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(db_err)?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err)?;
        Self::new(conn)
    }
}

impl Store for SqliteStore {
    fn permission_find(&mut self, id: &DeviceId) -> Result<Option<PermissionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT trusted
                 FROM permissions
                 WHERE vid = ?1 AND pid = ?2 AND serial = ?3",
            )
            .map_err(db_err)?;

        stmt.query_row(
            rusqlite::params![id.vid, id.pid, id.serial],
            |row| {
                Ok(PermissionRecord {
                    id: id.clone(),
                    trusted: row.get::<_, i64>(0)? != 0,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn permission_upsert(&mut self, record: &PermissionRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO permissions(vid, pid, serial, trusted)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(vid, pid, serial) DO UPDATE SET trusted = excluded.trusted",
                rusqlite::params![
                    record.id.vid,
                    record.id.pid,
                    record.id.serial,
                    record.trusted as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn permission_remove(&mut self, id: &DeviceId) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM permissions WHERE vid = ?1 AND pid = ?2 AND serial = ?3",
                rusqlite::params![id.vid, id.pid, id.serial],
            )
            .map_err(db_err)?;
        Ok(deleted == 1)
    }

    fn permission_list(&mut self) -> Result<Vec<PermissionRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT vid, pid, serial, trusted FROM permissions ORDER BY vid, pid, serial")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(PermissionRecord {
                    id: DeviceId {
                        vid: row.get(0)?,
                        pid: row.get(1)?,
                        serial: row.get(2)?,
                    },
                    trusted: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    fn mount_find(&mut self, block_name: &str) -> Result<Option<MountRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT mount_point FROM mounts WHERE block_name = ?1")
            .map_err(db_err)?;

        stmt.query_row(rusqlite::params![block_name], |row| {
            Ok(MountRecord {
                block_name: block_name.to_string(),
                mount_point: row.get(0)?,
            })
        })
        .optional()
        .map_err(db_err)
    }

    fn mount_upsert(&mut self, record: &MountRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO mounts(block_name, mount_point)
                 VALUES (?1, ?2)
                 ON CONFLICT(block_name) DO UPDATE SET mount_point = excluded.mount_point",
                rusqlite::params![record.block_name, record.mount_point],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn mount_remove(&mut self, block_name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM mounts WHERE block_name = ?1",
                rusqlite::params![block_name],
            )
            .map_err(db_err)?;
        Ok(deleted == 1)
    }

    fn mount_list(&mut self) -> Result<Vec<MountRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT block_name, mount_point FROM mounts ORDER BY block_name")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(MountRecord {
                    block_name: row.get(0)?,
                    mount_point: row.get(1)?,
                })
            })
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    fn mount_replace_all(&mut self, records: &[MountRecord]) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM mounts", []).map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO mounts(block_name, mount_point) VALUES (?1, ?2)")
                .map_err(db_err)?;
            for record in records {
                stmt.execute(rusqlite::params![record.block_name, record.mount_point])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }
}
