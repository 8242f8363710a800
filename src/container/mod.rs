//! Hierarchical container abstraction.
//!
//! The engine never talks to a file format directly: it drives the
//! `ContainerFile`/`ContainerGroup`/`ContainerField` traits, and a backend
//! registered in [`BackendRegistry`] supplies the implementation. Two
//! backends ship with the crate: an always-available in-memory container
//! (the default, also used by the test suite) and an HDF5-backed container
//! behind the `storage_hdf5` feature. Builds without that feature still
//! resolve the "hdf5" name, but creating a file through it reports
//! `FeatureNotEnabled` so the user knows which flag to rebuild with.

use crate::error::{WriterError, WriterResult};
use crate::types::{DataRecord, NxType};
use std::collections::HashMap;
use std::sync::Arc;

pub mod memory;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5;

pub use memory::MemoryFile;

/// Shared handle to an open container file.
pub type FileHandle = Arc<dyn ContainerFile>;
/// Shared handle to a container group.
pub type GroupHandle = Arc<dyn ContainerGroup>;
/// Shared handle to a container field (dataset).
pub type FieldHandle = Arc<dyn ContainerField>;

/// Creation options for a field, taken from the schema `<strategy>` element.
#[derive(Clone, Debug, Default)]
pub struct FieldOptions {
    /// Compression filter id; `None` disables compression.
    pub compression: Option<u32>,
    /// Compression level for the filter.
    pub rate: Option<u8>,
    /// Byte-shuffle filter toggle.
    pub shuffle: bool,
}

/// An open output container.
pub trait ContainerFile: Send + Sync {
    /// The root group.
    fn root(&self) -> GroupHandle;

    /// Flush buffered writes to the underlying store.
    fn flush(&self) -> WriterResult<()>;

    /// Close the container. Further operations fail.
    fn close(&self) -> WriterResult<()>;

    /// Path the container was opened with.
    fn path(&self) -> &str;

    /// Concrete-type escape hatch, used by tests to inspect backends.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A group inside the container tree.
pub trait ContainerGroup: Send + Sync {
    fn name(&self) -> String;

    /// Absolute path of this group ("/" for the root).
    fn path(&self) -> String;

    /// Create a child group with the given class tag, or open it if a child
    /// of the same name and class already exists.
    fn create_group(&self, name: &str, class: &str) -> WriterResult<GroupHandle>;

    /// Create a typed child dataset. `unlimited` names the axis that may be
    /// extended by `ContainerField::append`; `shape` carries its initial
    /// extent (normally zero).
    fn create_field(
        &self,
        name: &str,
        dtype: NxType,
        shape: &[usize],
        unlimited: Option<usize>,
        opts: &FieldOptions,
    ) -> WriterResult<FieldHandle>;

    /// Set (or overwrite) an attribute on this group.
    fn set_attribute(&self, name: &str, value: &DataRecord) -> WriterResult<()>;

    /// Create a symbolic link named `name` pointing at `target` (an absolute
    /// container path).
    fn create_link(&self, name: &str, target: &str) -> WriterResult<()>;
}

/// A typed dataset inside the container tree.
pub trait ContainerField: Send + Sync {
    fn name(&self) -> String;

    /// Absolute path of this dataset.
    fn path(&self) -> String;

    /// Declared element type.
    fn dtype(&self) -> NxType;

    /// Current shape.
    fn shape(&self) -> Vec<usize>;

    /// Overwrite the dataset with the record's data. Backends adopt the
    /// record's shape for axes created with extent zero.
    fn write(&self, record: &DataRecord) -> WriterResult<()>;

    /// Extend the dataset by one slab along `axis` and write the record into
    /// the new slab. The record's rank must be one less than the dataset's.
    fn append(&self, record: &DataRecord, axis: usize) -> WriterResult<()>;

    /// Set (or overwrite) an attribute on this dataset.
    fn set_attribute(&self, name: &str, value: &DataRecord) -> WriterResult<()>;
}

// =============================================================================
// Backend registry
// =============================================================================

type BackendFactory = Box<dyn Fn(&str) -> WriterResult<FileHandle> + Send + Sync>;

/// Registry of container backends, keyed by the name used in
/// `storage.backend` settings. Populated at writer construction and sealed
/// afterwards; phase runs only read it.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// A registry with the built-in backends.
    pub fn new() -> Self {
        let mut factories: HashMap<String, BackendFactory> = HashMap::new();

        factories.insert(
            "memory".to_string(),
            Box::new(|path| Ok(MemoryFile::create(path) as FileHandle)),
        );

        #[cfg(feature = "storage_hdf5")]
        factories.insert(
            "hdf5".to_string(),
            Box::new(|path| hdf5::Hdf5File::create(path).map(|f| f as FileHandle)),
        );

        #[cfg(not(feature = "storage_hdf5"))]
        factories.insert(
            "hdf5".to_string(),
            Box::new(|_path| Err(WriterError::FeatureNotEnabled("storage_hdf5".to_string()))),
        );

        Self { factories }
    }

    /// Register (or replace) a backend factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> WriterResult<FileHandle> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            log::debug!("replacing container backend '{}'", name);
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Open a container file through the named backend.
    pub fn create(&self, backend: &str, path: &str) -> WriterResult<FileHandle> {
        self.factories
            .get(backend)
            .ok_or_else(|| WriterError::Storage(format!("unknown container backend '{}'", backend)))
            .and_then(|factory| factory(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_is_storage_error() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.create("netcdf", "x"),
            Err(WriterError::Storage(_))
        ));
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn test_disabled_hdf5_reports_feature() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.create("hdf5", "x.h5"),
            Err(WriterError::FeatureNotEnabled(f)) if f == "storage_hdf5"
        ));
    }

    #[test]
    fn test_custom_backend_registration() {
        let mut registry = BackendRegistry::new();
        let shared = MemoryFile::create("shared");
        let handle = shared.clone();
        registry.register("shared-mem", move |_| Ok(handle.clone() as FileHandle));
        let file = registry.create("shared-mem", "ignored").expect("create");
        assert_eq!(file.path(), "shared");
    }
}
