//! Facade adapters over concrete disassemblers.
//!
//! - `capstone`: goblin PE loader plus capstone decoding into a [`ModuleImage`]
//! - `rizin`: drives the `rizin` binary through a command pipe
//!
//! Both hand back a [`LoadedModule`], which exposes the facade and knows how
//! to persist the annotations written through it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::db::ProjectLayout;
use crate::facade::{DisassemblyFacade, FacadeError, ModuleImage};

#[cfg(feature = "capstone-backend")]
pub mod capstone;
#[cfg(feature = "rizin-backend")]
pub mod rizin;

#[cfg(feature = "capstone-backend")]
pub use capstone::CapstoneBackend;
#[cfg(feature = "rizin-backend")]
pub use rizin::RizinBackend;

/// A module opened by a backend.
pub trait LoadedModule {
    fn facade(&self) -> &dyn DisassemblyFacade;

    fn facade_mut(&mut self) -> &mut dyn DisassemblyFacade;

    /// Write the annotations made so far under `layout`; returns the paths written.
    fn save(&self, layout: &ProjectLayout, module_name: &str) -> Result<Vec<PathBuf>, FacadeError>;
}

impl LoadedModule for ModuleImage {
    fn facade(&self) -> &dyn DisassemblyFacade {
        self
    }

    fn facade_mut(&mut self) -> &mut dyn DisassemblyFacade {
        self
    }

    fn save(&self, layout: &ProjectLayout, module_name: &str) -> Result<Vec<PathBuf>, FacadeError> {
        let path = layout.annotation_project_path(module_name);
        ensure_parent(&path)?;
        self.save_annotations(&path)?;
        Ok(vec![path])
    }
}

/// Opens modules for analysis.
pub trait FacadeBackend {
    fn name(&self) -> &'static str;

    /// Open `module`, seeding annotations from `previous` when it exists.
    fn open(&self, module: &Path, previous: Option<&Path>) -> Result<Box<dyn LoadedModule>, FacadeError>;
}

/// Backends selectable by name.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn FacadeBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self { backends: HashMap::new() }
    }

    /// Every backend compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "capstone-backend")]
        registry.register(CapstoneBackend);
        #[cfg(feature = "rizin-backend")]
        registry.register(RizinBackend::default());
        registry
    }

    pub fn register<B: FacadeBackend + 'static>(&mut self, backend: B) -> &mut Self {
        self.backends.insert(backend.name().to_string(), Box::new(backend));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn FacadeBackend> {
        self.backends.get(name).map(|b| &**b)
    }

    /// Sorted backend names for error messages and help.
    pub fn names(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.backends.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Register number reported for registers outside the general-purpose set.
pub const UNKNOWN_REGISTER: u64 = u64::MAX;

/// Register number in the usual x86 encoding order (`rax` = 0 .. `r15` = 15).
pub fn register_number(name: Option<&str>) -> u64 {
    const LEGACY: [[&str; 4]; 8] = [
        ["rax", "eax", "ax", "al"],
        ["rcx", "ecx", "cx", "cl"],
        ["rdx", "edx", "dx", "dl"],
        ["rbx", "ebx", "bx", "bl"],
        ["rsp", "esp", "sp", "spl"],
        ["rbp", "ebp", "bp", "bpl"],
        ["rsi", "esi", "si", "sil"],
        ["rdi", "edi", "di", "dil"],
    ];
    let Some(name) = name else { return UNKNOWN_REGISTER };
    if let Some(index) = LEGACY.iter().position(|names| names.contains(&name)) {
        return index as u64;
    }
    name.strip_prefix('r')
        .map(|rest| rest.trim_end_matches(['d', 'w', 'b']))
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| (8..=15).contains(n))
        .unwrap_or(UNKNOWN_REGISTER)
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), FacadeError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| FacadeError::Backend(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(())
}
