//! Symbol resolution across already-located shared libraries
//!
//! A native API is often split over several shared objects (and a symbol may
//! move between them across versions), so lookups try each library in the
//! order it was opened and take the first hit. Locating the files themselves
//! is the caller's job.

use crate::types::{BridgeError, Result};
use libloading::Library;
use std::path::{Path, PathBuf};

/// A set of opened shared libraries searched in order
pub struct SharedLibraries {
    libraries: Vec<(PathBuf, Library)>,
}

impl SharedLibraries {
    /// Open every library in `paths`.
    ///
    /// # Errors
    /// * `Library` if any path fails to load
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut libraries = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            log::debug!("Opening shared library: {:?}", path);
            // SAFETY: running a library's initializers is inherent to loading it;
            // callers only pass libraries of the native API being bridged.
            let library = unsafe { Library::new(path) }
                .map_err(|e| BridgeError::Library(format!("{:?}: {}", path, e)))?;
            libraries.push((path.to_path_buf(), library));
        }
        Ok(Self { libraries })
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    /// Paths of the opened libraries, in search order
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.libraries.iter().map(|(path, _)| path.as_path())
    }

    /// Resolve `name` in the first library that exports it.
    ///
    /// # Safety
    /// `T` must match the symbol's real type (usually an `unsafe extern "C" fn`
    /// pointer), and the returned value must not outlive `self`.
    ///
    /// # Errors
    /// * `SymbolNotFound` if no library exports `name`
    pub unsafe fn resolve<T: Copy>(&self, name: &str) -> Result<T> {
        for (path, library) in &self.libraries {
            if let Ok(symbol) = library.get::<T>(name.as_bytes()) {
                log::trace!("Resolved {} in {:?}", name, path);
                return Ok(*symbol);
            }
        }
        Err(BridgeError::SymbolNotFound(name.to_string()))
    }
}
