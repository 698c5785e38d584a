use anyhow::{anyhow, Result};
use bootscope_core::db::ProjectLayout;
use bootscope_core::model::GuidValue;
use serde_json::json;

use crate::project_root;
use crate::commands::{load_guid_database, load_scan_config};

/// Resolve a GUID string against the databases.
///
/// An unknown GUID is not an error: it resolves to the proprietary sentinel.
pub fn lookup_command(guid: &str, root: &str, config: Option<&str>, json: bool) -> Result<()> {
    let value: GuidValue = guid.parse().map_err(|e| anyhow!("Invalid GUID '{}': {}", guid, e))?;
    let layout = ProjectLayout::new(project_root(root)?);
    let config = load_scan_config(&layout, config)?;
    let db = load_guid_database(&config)?;
    let resolution = db.resolve(&value);

    if json {
        let body = json!({
            "guid": value.to_string(),
            "name": resolution.name,
            "namespace": resolution.namespace.as_str(),
            "known": resolution.is_known(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("{} {} ({})", value, resolution.name, resolution.namespace);
    Ok(())
}
