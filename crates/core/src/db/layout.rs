use std::path::{Path, PathBuf};

/// Logical layout of a bootscope project on disk.
///
/// Derived from a chosen root path without any IO. Frontends create the
/// directories they actually write to.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub root: PathBuf,
    /// Directory for internal metadata (.bootscope).
    pub meta_dir: PathBuf,
    /// Optional scan configuration (YAML).
    pub config_path: PathBuf,
    /// Run history database.
    pub db_path: PathBuf,
    /// Saved annotation projects and rizin scripts, one per module.
    pub annotations_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Append-only table of GUIDs no database knows.
    pub pp_guid_log_path: PathBuf,
}

impl ProjectLayout {
    /// Compute the default layout for a project rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join(".bootscope");
        let config_path = meta_dir.join("config.yaml");
        let db_path = meta_dir.join("project.db");
        let annotations_dir = meta_dir.join("annotations");
        let log_dir = root.join("log");
        let pp_guid_log_path = log_dir.join("pp_guids.md");

        Self { root, meta_dir, config_path, db_path, annotations_dir, log_dir, pp_guid_log_path }
    }

    /// Annotation project file for a module (JSON).
    pub fn annotation_project_path(&self, module_name: &str) -> PathBuf {
        self.annotations_dir.join(format!("{module_name}.annotations.json"))
    }

    /// Rizin script holding the mutations planned for a module.
    pub fn rizin_script_path(&self, module_name: &str) -> PathBuf {
        self.annotations_dir.join(format!("{module_name}.rz"))
    }
}
