//! Native library descriptors.
//!
//! A [`Library`] describes how to build one support library (compiler
//! runtime, libc, startup object) for a target. The [`LibrarySet`] holding
//! them is built by the caller and handed to the builder.

mod declared;
pub mod flags;

pub use declared::{DeclaredLibrary, TargetSources};

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Description of a single native library
pub trait Library: Send + Sync {
    /// Library name, such as "compiler-rt" or "picolibc"
    fn name(&self) -> &str;

    /// Directory the source paths are relative to
    fn source_root(&self) -> &Path;

    /// Library sources for `target`, relative to [`Library::source_root`]
    fn sources(&self, target: &str) -> Result<Vec<PathBuf>>;

    /// Source of the startup object (crt1.o), if the library has one
    fn startup_source(&self) -> Option<&Path> {
        None
    }

    /// Library specific compiler flags. `out_dir` is the temporary output
    /// directory; generated headers live in `out_dir/include`.
    fn cflags(&self, target: &str, out_dir: &Path) -> Vec<String>;

    /// Whether [`Library::make_headers`] must run before compiling
    fn has_headers(&self) -> bool {
        false
    }

    /// Populate `include_dir` (already created) with generated headers.
    fn make_headers(&self, _target: &str, _include_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Absolute paths of every source, startup source first.
    fn source_paths(&self, target: &str) -> Result<Vec<PathBuf>> {
        let root = self.source_root();
        Ok(self
            .startup_source()
            .map(Path::to_path_buf)
            .into_iter()
            .chain(self.sources(target)?)
            .map(|relative| root.join(relative))
            .collect())
    }
}

/// Libraries known to a builder, keyed by name
#[derive(Clone, Default)]
pub struct LibrarySet {
    libraries: BTreeMap<String, Arc<dyn Library>>,
}

impl LibrarySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from declared libraries
    pub fn from_declared(declared: impl IntoIterator<Item = DeclaredLibrary>) -> Self {
        let mut set = Self::new();
        for library in declared {
            set.insert(library);
        }
        set
    }

    /// Register `library`, replacing any library with the same name.
    pub fn insert<L: Library + 'static>(&mut self, library: L) -> Option<Arc<dyn Library>> {
        self.insert_arc(Arc::new(library))
    }

    pub fn insert_arc(&mut self, library: Arc<dyn Library>) -> Option<Arc<dyn Library>> {
        self.libraries.insert(library.name().to_string(), library)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Library>> {
        self.libraries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.libraries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

impl fmt::Debug for LibrarySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.libraries.keys()).finish()
    }
}
