use usb_warden::store::sqlite::SqliteStore;
use usb_warden::store::{MountRecord, PermissionRecord, Store};
use usb_warden_core::device::DeviceId;

fn id(serial: &str) -> DeviceId {
    DeviceId::new("0951", "1666", serial)
}

#[test]
fn permission_roundtrip() {
    let mut store = SqliteStore::open_in_memory().expect("open");

    assert!(store.permission_find(&id("A1")).expect("find").is_none());

    store
        .permission_upsert(&PermissionRecord {
            id: id("A1"),
            trusted: true,
        })
        .expect("upsert");
    let found = store.permission_find(&id("A1")).expect("find").expect("present");
    assert!(found.trusted);

    // Upsert flips the decision in place.
    store
        .permission_upsert(&PermissionRecord {
            id: id("A1"),
            trusted: false,
        })
        .expect("upsert");
    let found = store.permission_find(&id("A1")).expect("find").expect("present");
    assert!(!found.trusted);

    assert!(store.permission_remove(&id("A1")).expect("remove"));
    assert!(!store.permission_remove(&id("A1")).expect("remove"));
    assert!(store.permission_find(&id("A1")).expect("find").is_none());
}

#[test]
fn permission_lookup_is_keyed_by_full_identity() {
    let mut store = SqliteStore::open_in_memory().expect("open");
    store
        .permission_upsert(&PermissionRecord {
            id: id("A1"),
            trusted: true,
        })
        .expect("upsert");

    assert!(store.permission_find(&id("A2")).expect("find").is_none());
    let other = DeviceId::new("0951", "1667", "A1");
    assert!(store.permission_find(&other).expect("find").is_none());
}

#[test]
fn mount_records_roundtrip() {
    let mut store = SqliteStore::open_in_memory().expect("open");

    store
        .mount_upsert(&MountRecord {
            block_name: "sdb1".to_string(),
            mount_point: "/media/sdb1".to_string(),
        })
        .expect("upsert");
    let found = store.mount_find("sdb1").expect("find").expect("present");
    assert_eq!(found.mount_point, "/media/sdb1");

    assert!(store.mount_remove("sdb1").expect("remove"));
    assert!(store.mount_find("sdb1").expect("find").is_none());
}

#[test]
fn mount_replace_all_rebuilds_the_table() {
    let mut store = SqliteStore::open_in_memory().expect("open");
    for name in ["sdb1", "sdc1"] {
        store
            .mount_upsert(&MountRecord {
                block_name: name.to_string(),
                mount_point: format!("/media/{name}"),
            })
            .expect("upsert");
    }

    let live = vec![MountRecord {
        block_name: "sdd1".to_string(),
        mount_point: "/media/sdd1".to_string(),
    }];
    store.mount_replace_all(&live).expect("replace");

    assert!(store.mount_find("sdb1").expect("find").is_none());
    assert!(store.mount_find("sdc1").expect("find").is_none());
    assert_eq!(store.mount_list().expect("list"), live);
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("warden.db");

    {
        let mut store = SqliteStore::open(&db).expect("open");
        store
            .permission_upsert(&PermissionRecord {
                id: id("A1"),
                trusted: true,
            })
            .expect("upsert");
        store
            .mount_upsert(&MountRecord {
                block_name: "sdb1".to_string(),
                mount_point: "/media/sdb1".to_string(),
            })
            .expect("upsert");
    }

    let mut store = SqliteStore::open(&db).expect("reopen");
    assert!(store.permission_find(&id("A1")).expect("find").is_some());
    assert!(store.mount_find("sdb1").expect("find").is_some());
}
