//! Text and JSON rendering of a session, plus the proprietary GUID log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::analysis::SessionSummary;
use crate::annotate::AnnotationReport;
use crate::header::ModuleInfo;
use crate::model::{CallSite, GuidUsageRecord, WorkingSet};

pub const EMPTY_LIST: &str = " * list is empty";

const PP_LOG_HEADER: &str = "| Guid | Module | Service | Address |";
const PP_LOG_SEPARATOR: &str = "| --- | --- | --- | --- |";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything one `analyze` run produced, as emitted by `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub module: String,
    pub info: ModuleInfo,
    pub backend: String,
    pub summary: SessionSummary,
    pub working_set: WorkingSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<AnnotationReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saved: Vec<PathBuf>,
}

fn table_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let padded: Vec<String> =
        cells.zip(widths).map(|(cell, &width)| format!("{cell:<width$}")).collect();
    format!("| {} |\n", padded.join(" | "))
}

fn render_table(title: &str, headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = format!("{title}\n");
    if rows.is_empty() {
        out.push_str(EMPTY_LIST);
        out.push('\n');
        return out;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let rule: String = widths.iter().map(|w| "-".repeat(w + 2)).collect::<Vec<_>>().join("+");

    out.push_str(&format!("+{rule}+\n"));
    out.push_str(&table_line(headers.iter().copied(), &widths));
    out.push_str(&format!("+{rule}+\n"));
    for row in rows {
        out.push_str(&table_line(row.iter().map(String::as_str), &widths));
    }
    out.push_str(&format!("+{rule}+\n"));
    out
}

/// `Boot services:` table (Address | Service).
pub fn render_call_sites(sites: &[CallSite]) -> String {
    let rows: Vec<Vec<String>> = sites
        .iter()
        .map(|site| vec![format!("{:#x}", site.address), site.service.to_string()])
        .collect();
    render_table("Boot services:", &["Address", "Service"], &rows)
}

/// `Protocols:` table (GUID | Protocol name | Address | Service | Namespace).
pub fn render_records(records: &[GuidUsageRecord]) -> String {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            vec![
                record.guid.to_string(),
                record.protocol_name.clone().unwrap_or_default(),
                format!("{:#x}", record.address),
                record.service.to_string(),
                record.namespace.map(|ns| ns.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    render_table(
        "Protocols:",
        &["GUID", "Protocol name", "Address", "Service", "Namespace"],
        &rows,
    )
}

pub fn render_working_set(set: &WorkingSet) -> String {
    format!("{}\n{}", render_call_sites(&set.call_sites), render_records(&set.records))
}

/// Append one row per proprietary record to the Markdown log at `path`,
/// writing the header first when the file is missing or empty.
///
/// Returns the number of rows appended.
pub fn append_proprietary_log(
    path: &Path,
    module: &str,
    set: &WorkingSet,
) -> Result<usize, ReportError> {
    let io_err = |source: std::io::Error| ReportError::Io { path: path.to_path_buf(), source };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io_err)?;

    let mut body = String::new();
    if needs_header {
        body.push_str(PP_LOG_HEADER);
        body.push('\n');
        body.push_str(PP_LOG_SEPARATOR);
        body.push('\n');
    }
    let mut rows = 0;
    for record in set.proprietary_records() {
        body.push_str(&format!(
            "| {} | {} | {} | {:#x} |\n",
            record.guid, module, record.service, record.address
        ));
        rows += 1;
    }
    file.write_all(body.as_bytes()).map_err(io_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BootService, GuidNamespace, GuidValue, PROPRIETARY_PROTOCOL};

    fn set() -> WorkingSet {
        let mut set = WorkingSet::new();
        set.insert_call_site(CallSite {
            address: 0x401020,
            service: BootService::LocateProtocol,
            function: 0x401000,
        });
        let guid = GuidValue::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
            0x0F, 0x10,
        ]);
        let mut record = GuidUsageRecord::new(0x403000, BootService::LocateProtocol, guid);
        record.protocol_name = Some(PROPRIETARY_PROTOCOL.to_string());
        record.namespace = Some(GuidNamespace::Unknown);
        set.insert_record(record);
        set
    }

    #[test]
    fn empty_tables_say_so() {
        let text = render_working_set(&WorkingSet::new());
        assert!(text.starts_with("Boot services:\n * list is empty\n"));
        assert!(text.contains("Protocols:\n * list is empty\n"));
    }

    #[test]
    fn tables_list_every_entry() {
        let text = render_working_set(&set());
        assert!(text.contains("| Address  | Service        |"));
        assert!(text.contains("| 0x401020 | LocateProtocol |"));
        assert!(text.contains(PROPRIETARY_PROTOCOL));
        assert!(text.contains("0x403000"));
    }

    #[test]
    fn log_header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("pp_guids.md");

        assert_eq!(append_proprietary_log(&path, "Foo.efi", &set()).unwrap(), 1);
        assert_eq!(append_proprietary_log(&path, "Bar.efi", &set()).unwrap(), 1);

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], PP_LOG_HEADER);
        assert_eq!(lines[1], PP_LOG_SEPARATOR);
        assert!(lines[2].contains("| Foo.efi | LocateProtocol | 0x403000 |"));
        assert!(lines[3].contains("| Bar.efi |"));
    }

    #[test]
    fn empty_log_file_gets_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pp_guids.md");
        std::fs::write(&path, "").unwrap();
        append_proprietary_log(&path, "Foo.efi", &WorkingSet::new()).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, format!("{PP_LOG_HEADER}\n{PP_LOG_SEPARATOR}\n"));
    }
}
