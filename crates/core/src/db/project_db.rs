use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::db::{AnalysisRunRecord, ProprietaryGuidEntry, RunStatus, StoredRun};
use crate::model::{BootService, CallSite, GuidNamespace, GuidUsageRecord, GuidValue, WorkingSet};

/// Minimum schema version we know how to handle.
///
/// `0` means "no schema yet" (fresh DB).
const MIN_SUPPORTED_SCHEMA_VERSION: i32 = 0;

/// Latest schema version this crate knows about.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The database was created with a newer schema version than we support.
    #[error(
        "Unsupported schema version {found}; supported range is {min_supported}..={max_supported}"
    )]
    UnsupportedSchemaVersion { found: i32, min_supported: i32, max_supported: i32 },

    /// A stored value no longer parses (e.g. a service name from a newer build).
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub type DbResult<T> = Result<T, DbError>;

/// SQLite-backed run history.
///
/// Thin wrapper around `rusqlite::Connection` that opens the file, applies
/// migrations and offers small typed helpers.
#[derive(Debug)]
pub struct ProjectDb {
    conn: Connection,
}

impl ProjectDb {
    /// Open (or create) a project database at the given path and ensure the schema exists.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert a run row and return its id.
    pub fn insert_run(&self, record: &AnalysisRunRecord) -> DbResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO analysis_runs (module, module_hash, arch, backend, status, started_at, finished_at, annotations_applied, annotations_failed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.module,
                record.module_hash,
                record.arch,
                record.backend,
                record.status.as_str(),
                record.started_at,
                record.finished_at,
                record.annotations_applied,
                record.annotations_failed,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Persist the call sites and GUID usages found by a run.
    pub fn insert_working_set(&self, run_id: i64, set: &WorkingSet) -> DbResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO boot_service_calls (run_id, address, service, function)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )?;
            for site in &set.call_sites {
                stmt.execute(params![
                    run_id,
                    site.address as i64,
                    site.service.as_str(),
                    site.function as i64
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO protocol_usages (run_id, address, service, guid, protocol_name, namespace)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for record in &set.records {
                stmt.execute(params![
                    run_id,
                    record.address as i64,
                    record.service.as_str(),
                    record.guid.to_string(),
                    record.protocol_name,
                    record.namespace.map(|ns| ns.as_str()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// List runs, optionally filtered by module name, oldest first.
    pub fn list_runs(&self, module: Option<&str>) -> DbResult<Vec<StoredRun>> {
        fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRun> {
            let status: String = row.get(5)?;
            Ok(StoredRun {
                id: row.get(0)?,
                record: AnalysisRunRecord {
                    module: row.get(1)?,
                    module_hash: row.get(2)?,
                    arch: row.get(3)?,
                    backend: row.get(4)?,
                    status: RunStatus::parse(&status),
                    started_at: row.get(6)?,
                    finished_at: row.get(7)?,
                    annotations_applied: row.get(8)?,
                    annotations_failed: row.get(9)?,
                },
                call_sites: row.get(10)?,
                protocols: row.get(11)?,
            })
        }

        let sql = r#"
            SELECT r.id, r.module, r.module_hash, r.arch, r.backend, r.status,
                   r.started_at, r.finished_at, r.annotations_applied, r.annotations_failed,
                   (SELECT COUNT(*) FROM boot_service_calls c WHERE c.run_id = r.id),
                   (SELECT COUNT(*) FROM protocol_usages p WHERE p.run_id = r.id)
            FROM analysis_runs r
            WHERE ?1 IS NULL OR r.module = ?1
            ORDER BY r.id
        "#;
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![module], map_run)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent run id for a module.
    pub fn latest_run_id(&self, module: &str) -> DbResult<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM analysis_runs WHERE module = ?1 ORDER BY id DESC LIMIT 1",
                params![module],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Rebuild the working set stored for a run.
    pub fn load_working_set(&self, run_id: i64) -> DbResult<WorkingSet> {
        let mut set = WorkingSet::new();

        let mut stmt = self.conn.prepare(
            "SELECT address, service, function FROM boot_service_calls WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (address, service, function) = row?;
            let service = parse_service("boot_service_calls", &service)?;
            set.insert_call_site(CallSite {
                address: address as u64,
                service,
                function: function as u64,
            });
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT address, service, guid, protocol_name, namespace
            FROM protocol_usages WHERE run_id = ?1 ORDER BY rowid
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for row in rows {
            let (address, service, guid, protocol_name, namespace) = row?;
            let guid: GuidValue = guid.parse().map_err(|e| DbError::Corrupt {
                table: "protocol_usages",
                detail: format!("{e}"),
            })?;
            let mut record =
                GuidUsageRecord::new(address as u64, parse_service("protocol_usages", &service)?, guid);
            record.protocol_name = protocol_name;
            record.namespace = namespace.as_deref().map(GuidNamespace::parse);
            set.insert_record(record);
        }
        Ok(set)
    }

    /// Distinct proprietary GUID usages across every run, first sighting first.
    pub fn list_proprietary_guids(&self) -> DbResult<Vec<ProprietaryGuidEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.guid, r.module, p.service, p.address
            FROM protocol_usages p
            JOIN analysis_runs r ON r.id = p.run_id
            WHERE p.protocol_name = ?1
            GROUP BY p.guid, r.module, p.service, p.address
            ORDER BY MIN(p.rowid)
            "#,
        )?;
        let rows = stmt.query_map(params![crate::model::PROPRIETARY_PROTOCOL], |row| {
            Ok(ProprietaryGuidEntry {
                guid: row.get(0)?,
                module: row.get(1)?,
                service: row.get(2)?,
                address: row.get::<_, i64>(3)? as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn parse_service(table: &'static str, value: &str) -> DbResult<BootService> {
    value.parse().map_err(|detail| DbError::Corrupt { table, detail })
}

/// Apply schema migrations to bring the database to the latest version.
///
/// `PRAGMA user_version` holds the schema version.
///
/// Version map:
/// - 0: no schema
/// - 1: runs, boot service calls, protocol usages
/// - 2: annotation counters on runs
fn apply_migrations(conn: &Connection) -> DbResult<()> {
    let current_version = current_schema_version(conn)?;

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            found: current_version,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            max_supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current_version < 1 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS analysis_runs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                module       TEXT NOT NULL,
                module_hash  TEXT,
                arch         TEXT NOT NULL,
                backend      TEXT NOT NULL,
                status       TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                finished_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS boot_service_calls (
                run_id    INTEGER NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
                address   INTEGER NOT NULL,
                service   TEXT NOT NULL,
                function  INTEGER NOT NULL,
                PRIMARY KEY (run_id, address)
            );

            CREATE TABLE IF NOT EXISTS protocol_usages (
                run_id         INTEGER NOT NULL REFERENCES analysis_runs(id) ON DELETE CASCADE,
                address        INTEGER NOT NULL,
                service        TEXT NOT NULL,
                guid           TEXT NOT NULL,
                protocol_name  TEXT,
                namespace      TEXT,
                PRIMARY KEY (run_id, address, service)
            );

            CREATE INDEX IF NOT EXISTS idx_protocol_usages_name ON protocol_usages(protocol_name);

            PRAGMA user_version = 1;
            COMMIT;
            "#,
        )?;
    }

    if current_version < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            ALTER TABLE analysis_runs ADD COLUMN annotations_applied INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE analysis_runs ADD COLUMN annotations_failed INTEGER NOT NULL DEFAULT 0;
            PRAGMA user_version = 2;
            COMMIT;
            "#,
        )?;
    }

    Ok(())
}

fn current_schema_version(conn: &Connection) -> DbResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}
