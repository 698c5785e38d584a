//! Bundled protocol GUID databases and the name resolver.
//!
//! Three vendor namespaces are consulted in a fixed order: `edk2_guids`, then
//! `edk_guids`, then `ami_guids`. The first exact 16-byte match wins; a miss
//! resolves to `ProprietaryProtocol` / `unknown`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::DatabasePaths;
use crate::model::{GuidNamespace, GuidUsageRecord, GuidValue, WorkingSet, PROPRIETARY_PROTOCOL};

const EDK2_GUIDS: &str = include_str!("../data/edk2_guids.json");
const EDK_GUIDS: &str = include_str!("../data/edk_guids.json");
const AMI_GUIDS: &str = include_str!("../data/ami_guids.json");

#[derive(Debug, Error)]
pub enum GuidDbError {
    #[error("failed to read GUID database {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse GUID database {origin}: {source}")]
    Parse { origin: String, source: serde_json::Error },
}

/// One namespace: protocol name -> GUID, with a reverse index for lookups.
#[derive(Debug, Clone, Default)]
pub struct GuidTable {
    by_name: BTreeMap<String, GuidValue>,
    by_guid: HashMap<GuidValue, String>,
}

impl GuidTable {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, GuidValue)>,
        S: Into<String>,
    {
        let by_name: BTreeMap<String, GuidValue> =
            entries.into_iter().map(|(name, guid)| (name.into(), guid)).collect();
        // Iterate in name order so aliases resolve to the same name every time.
        let mut by_guid = HashMap::new();
        for (name, guid) in &by_name {
            by_guid.entry(*guid).or_insert_with(|| name.clone());
        }
        Self { by_name, by_guid }
    }

    pub fn from_json(body: &str, origin: &str) -> Result<Self, GuidDbError> {
        let entries: BTreeMap<String, GuidValue> = serde_json::from_str(body)
            .map_err(|source| GuidDbError::Parse { origin: origin.to_string(), source })?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_file(path: &Path) -> Result<Self, GuidDbError> {
        let body = std::fs::read_to_string(path)
            .map_err(|source| GuidDbError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(&body, &path.display().to_string())
    }

    pub fn name_of(&self, guid: &GuidValue) -> Option<&str> {
        self.by_guid.get(guid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Result of resolving a GUID against the databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub namespace: GuidNamespace,
}

impl Resolution {
    pub fn is_known(&self) -> bool {
        self.namespace != GuidNamespace::Unknown
    }
}

/// The three vendor namespaces, read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct GuidDatabase {
    edk2: GuidTable,
    edk: GuidTable,
    ami: GuidTable,
}

impl GuidDatabase {
    pub fn new(edk2: GuidTable, edk: GuidTable, ami: GuidTable) -> Self {
        Self { edk2, edk, ami }
    }

    /// Databases compiled into the library.
    pub fn bundled() -> Result<Self, GuidDbError> {
        Ok(Self::new(
            GuidTable::from_json(EDK2_GUIDS, "bundled edk2_guids")?,
            GuidTable::from_json(EDK_GUIDS, "bundled edk_guids")?,
            GuidTable::from_json(AMI_GUIDS, "bundled ami_guids")?,
        ))
    }

    /// Bundled databases, with any namespace listed in `paths` replaced by its file.
    pub fn load(paths: &DatabasePaths) -> Result<Self, GuidDbError> {
        let mut db = Self::bundled()?;
        if let Some(p) = &paths.edk2 {
            db.edk2 = GuidTable::from_file(p)?;
        }
        if let Some(p) = &paths.edk {
            db.edk = GuidTable::from_file(p)?;
        }
        if let Some(p) = &paths.ami {
            db.ami = GuidTable::from_file(p)?;
        }
        debug!(
            edk2 = db.edk2.len(),
            edk = db.edk.len(),
            ami = db.ami.len(),
            "loaded GUID databases"
        );
        Ok(db)
    }

    /// Namespaces in lookup order.
    pub fn namespaces(&self) -> [(GuidNamespace, &GuidTable); 3] {
        [
            (GuidNamespace::Edk2Guids, &self.edk2),
            (GuidNamespace::EdkGuids, &self.edk),
            (GuidNamespace::AmiGuids, &self.ami),
        ]
    }

    /// Exact match only; `None` when no namespace knows the value.
    pub fn lookup(&self, guid: &GuidValue) -> Option<Resolution> {
        self.namespaces().into_iter().find_map(|(namespace, table)| {
            table.name_of(guid).map(|name| Resolution { name: name.to_string(), namespace })
        })
    }

    /// Like [`lookup`](Self::lookup) but never misses: unknown values map to
    /// the `ProprietaryProtocol` sentinel.
    pub fn resolve(&self, guid: &GuidValue) -> Resolution {
        self.lookup(guid).unwrap_or_else(|| Resolution {
            name: PROPRIETARY_PROTOCOL.to_string(),
            namespace: GuidNamespace::Unknown,
        })
    }

    pub fn resolve_record(&self, record: &mut GuidUsageRecord) {
        let resolution = self.resolve(&record.guid);
        record.protocol_name = Some(resolution.name);
        record.namespace = Some(resolution.namespace);
    }

    /// Resolve every record in the working set; returns how many were unknown.
    pub fn resolve_all(&self, set: &mut WorkingSet) -> usize {
        for record in set.records.iter_mut() {
            self.resolve_record(record);
        }
        set.proprietary_records().count()
    }
}
