// crates/core/tests/db_history.rs
use rusqlite::Connection;
use tempfile::tempdir;

use bootscope_core::db::{
    AnalysisRunRecord, DbError, ProjectDb, RunStatus, CURRENT_SCHEMA_VERSION,
};
use bootscope_core::model::{
    BootService, CallSite, GuidNamespace, GuidUsageRecord, GuidValue, WorkingSet,
    PROPRIETARY_PROTOCOL,
};

fn run(module: &str, status: RunStatus) -> AnalysisRunRecord {
    AnalysisRunRecord {
        module: module.into(),
        module_hash: Some("abc123".into()),
        arch: "x64".into(),
        backend: "capstone".into(),
        status,
        started_at: "t0".into(),
        finished_at: "t1".into(),
        annotations_applied: 3,
        annotations_failed: 0,
    }
}

fn working_set() -> WorkingSet {
    let mut set = WorkingSet::new();
    set.insert_call_site(CallSite {
        address: 0x1000_1011,
        service: BootService::HandleProtocol,
        function: 0x1000_1000,
    });
    let guid: GuidValue = "5B1B31A1-9562-11D2-8E3F-00A0C969723B".parse().expect("guid");
    let mut known = GuidUsageRecord::new(0x1000_2010, BootService::HandleProtocol, guid);
    known.protocol_name = Some("EFI_LOADED_IMAGE_PROTOCOL".into());
    known.namespace = Some(GuidNamespace::Edk2Guids);
    set.insert_record(known);

    let odd: GuidValue = "76543210-BA98-FEDC-0123-456789ABCDEF".parse().expect("guid");
    let mut proprietary = GuidUsageRecord::new(0x1000_2030, BootService::LocateProtocol, odd);
    proprietary.protocol_name = Some(PROPRIETARY_PROTOCOL.into());
    proprietary.namespace = Some(GuidNamespace::Unknown);
    set.insert_record(proprietary);
    set
}

#[test]
fn runs_and_results_round_trip() {
    let dir = tempdir().expect("tempdir");
    let db = ProjectDb::open(&dir.path().join("project.db")).expect("open db");

    let id = db.insert_run(&run("Driver.efi", RunStatus::Succeeded)).expect("insert run");
    db.insert_working_set(id, &working_set()).expect("insert results");
    db.insert_run(&run("Other.efi", RunStatus::Rejected)).expect("insert rejected run");

    let all = db.list_runs(None).expect("list runs");
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].call_sites, 1);
    assert_eq!(all[0].protocols, 2);
    assert_eq!(all[0].record.annotations_applied, 3);
    assert_eq!(all[1].record.status, RunStatus::Rejected);

    let only = db.list_runs(Some("Driver.efi")).expect("filtered runs");
    assert_eq!(only.len(), 1);
    assert_eq!(db.latest_run_id("Driver.efi").expect("latest"), Some(id));
    assert_eq!(db.latest_run_id("Missing.efi").expect("latest"), None);

    assert_eq!(db.load_working_set(id).expect("load results"), working_set());
}

#[test]
fn proprietary_guids_are_listed_once_across_runs() {
    let dir = tempdir().expect("tempdir");
    let db = ProjectDb::open(&dir.path().join("project.db")).expect("open db");
    for _ in 0..2 {
        let id = db.insert_run(&run("Driver.efi", RunStatus::Succeeded)).expect("insert run");
        db.insert_working_set(id, &working_set()).expect("insert results");
    }

    let guids = db.list_proprietary_guids().expect("list proprietary");
    assert_eq!(guids.len(), 1);
    assert_eq!(guids[0].guid, "76543210-BA98-FEDC-0123-456789ABCDEF");
    assert_eq!(guids[0].module, "Driver.efi");
    assert_eq!(guids[0].service, "LocateProtocol");
    assert_eq!(guids[0].address, 0x1000_2030);
}

#[test]
fn migrations_bring_a_fresh_db_to_the_current_version() {
    let dir = tempdir().expect("tempdir");
    let db = ProjectDb::open(&dir.path().join("project.db")).expect("open db");
    let version: i32 = db
        .connection()
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .expect("user_version");
    assert_eq!(version, CURRENT_SCHEMA_VERSION);
}

#[test]
fn newer_schema_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("project.db");
    {
        let conn = Connection::open(&path).expect("raw open");
        conn.execute_batch("PRAGMA user_version = 99;").expect("bump version");
    }
    let err = ProjectDb::open(&path).expect_err("newer schema must be rejected");
    assert!(matches!(err, DbError::UnsupportedSchemaVersion { found: 99, .. }));
}

#[test]
fn unknown_service_in_a_row_is_reported_as_corrupt() {
    let dir = tempdir().expect("tempdir");
    let db = ProjectDb::open(&dir.path().join("project.db")).expect("open db");
    let id = db.insert_run(&run("Driver.efi", RunStatus::Succeeded)).expect("insert run");
    db.connection()
        .execute(
            "INSERT INTO boot_service_calls (run_id, address, service, function) VALUES (?1, 1, 'Bogus', 0)",
            [id],
        )
        .expect("insert bogus row");
    let err = db.load_working_set(id).expect_err("bogus service");
    assert!(matches!(err, DbError::Corrupt { table: "boot_service_calls", .. }));
}
