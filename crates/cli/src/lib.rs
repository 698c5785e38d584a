use std::env;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub mod commands;

/// Absolute project root for `--root`.
///
/// `.` means the working directory. A root that does not exist yet is joined
/// onto the working directory so the layout can be created under it.
pub fn project_root(root: &str) -> Result<PathBuf> {
    let cwd = || env::current_dir().context("Failed to get current directory");
    if root == "." {
        return cwd();
    }
    let path = Path::new(root);
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(_) => Ok(cwd()?.join(path)),
    }
}

/// Module name used in logs, the run history and annotation file names.
///
/// Falls back to `module` when the path has no final component.
pub fn module_name(path: &Path) -> String {
    path.file_name().and_then(|name| name.to_str()).unwrap_or("module").to_string()
}

/// Hex SHA-256 of the module file, stored with each analysis run.
pub fn module_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open module for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read module for hashing: {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}
