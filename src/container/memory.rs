//! In-memory container backend.
//!
//! The default backend: a thread-safe tree of groups, typed datasets, and
//! links held in process memory. It implements the full container contract
//! including growable axes and attribute storage, which makes it the
//! reference backend for the test suite and for dry runs on machines
//! without an HDF5 toolchain.

use super::{
    ContainerField, ContainerFile, ContainerGroup, FieldHandle, FieldOptions, GroupHandle,
};
use crate::error::{WriterError, WriterResult};
use crate::types::{DataRecord, NxType, ScalarValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn rlock<T>(lock: &RwLock<T>) -> WriterResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| WriterError::Storage("container lock poisoned".to_string()))
}

fn wlock<T>(lock: &RwLock<T>) -> WriterResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| WriterError::Storage("container lock poisoned".to_string()))
}

fn child_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// An in-memory container file.
pub struct MemoryFile {
    path: String,
    root: Arc<MemGroup>,
    closed: AtomicBool,
}

impl MemoryFile {
    /// Create an empty container. The path is recorded but nothing touches
    /// the filesystem.
    pub fn create(path: &str) -> Arc<MemoryFile> {
        Arc::new(MemoryFile {
            path: path.to_string(),
            root: Arc::new(MemGroup::new("", "/", "")),
            closed: AtomicBool::new(false),
        })
    }

    fn walk(&self, path: &str) -> Option<MemEntry> {
        let mut current = self.root.clone();
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        while let Some(segment) = segments.next() {
            let entry = {
                let entries = current.entries.read().ok()?;
                entries.get(segment).cloned()?
            };
            if segments.peek().is_none() {
                return Some(entry);
            }
            match entry {
                MemEntry::Group(g) => current = g,
                _ => return None,
            }
        }
        Some(MemEntry::Group(current))
    }

    /// The dataset at an absolute path, if present.
    pub fn dataset(&self, path: &str) -> Option<Arc<MemField>> {
        match self.walk(path)? {
            MemEntry::Field(f) => Some(f),
            _ => None,
        }
    }

    /// The group at an absolute path, if present.
    pub fn group_at(&self, path: &str) -> Option<Arc<MemGroup>> {
        match self.walk(path)? {
            MemEntry::Group(g) => Some(g),
            _ => None,
        }
    }

    /// The target of a link at an absolute path, if present.
    pub fn link_target(&self, path: &str) -> Option<String> {
        match self.walk(path)? {
            MemEntry::Link(target) => Some(target),
            _ => None,
        }
    }
}

impl ContainerFile for MemoryFile {
    fn root(&self) -> GroupHandle {
        self.root.clone()
    }

    fn flush(&self) -> WriterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriterError::Storage("container already closed".to_string()));
        }
        Ok(())
    }

    fn close(&self) -> WriterResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Clone)]
enum MemEntry {
    Group(Arc<MemGroup>),
    Field(Arc<MemField>),
    Link(String),
}

/// A group node of the in-memory tree.
pub struct MemGroup {
    name: String,
    path: String,
    class: String,
    entries: RwLock<HashMap<String, MemEntry>>,
    attrs: RwLock<HashMap<String, DataRecord>>,
}

impl MemGroup {
    fn new(name: &str, path: &str, class: &str) -> Self {
        MemGroup {
            name: name.to_string(),
            path: path.to_string(),
            class: class.to_string(),
            entries: RwLock::new(HashMap::new()),
            attrs: RwLock::new(HashMap::new()),
        }
    }

    /// Class tag the group was created with.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Attribute lookup, used by tests.
    pub fn attr(&self, name: &str) -> Option<DataRecord> {
        self.attrs.read().ok()?.get(name).cloned()
    }
}

impl ContainerGroup for MemGroup {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn create_group(&self, name: &str, class: &str) -> WriterResult<GroupHandle> {
        let mut entries = wlock(&self.entries)?;
        match entries.get(name) {
            Some(MemEntry::Group(existing)) if existing.class == class => {
                return Ok(existing.clone())
            }
            Some(_) => {
                return Err(WriterError::Storage(format!(
                    "'{}' already exists in {}",
                    name,
                    self.path
                )))
            }
            None => {}
        }
        let group = Arc::new(MemGroup::new(name, &child_path(&self.path, name), class));
        entries.insert(name.to_string(), MemEntry::Group(group.clone()));
        Ok(group)
    }

    fn create_field(
        &self,
        name: &str,
        dtype: NxType,
        shape: &[usize],
        unlimited: Option<usize>,
        _opts: &FieldOptions,
    ) -> WriterResult<FieldHandle> {
        let mut entries = wlock(&self.entries)?;
        if entries.contains_key(name) {
            return Err(WriterError::Storage(format!(
                "'{}' already exists in {}",
                name, self.path
            )));
        }
        if let Some(axis) = unlimited {
            if axis >= shape.len() {
                return Err(WriterError::Storage(format!(
                    "growable axis {} out of range for rank {}",
                    axis,
                    shape.len()
                )));
            }
        }
        let field = Arc::new(MemField {
            name: name.to_string(),
            path: child_path(&self.path, name),
            dtype,
            unlimited,
            state: RwLock::new(FieldState {
                shape: shape.to_vec(),
                data: Vec::new(),
            }),
            attrs: RwLock::new(HashMap::new()),
        });
        entries.insert(name.to_string(), MemEntry::Field(field.clone()));
        Ok(field)
    }

    fn set_attribute(&self, name: &str, value: &DataRecord) -> WriterResult<()> {
        wlock(&self.attrs)?.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn create_link(&self, name: &str, target: &str) -> WriterResult<()> {
        let mut entries = wlock(&self.entries)?;
        if entries.contains_key(name) {
            return Err(WriterError::Storage(format!(
                "'{}' already exists in {}",
                name, self.path
            )));
        }
        entries.insert(name.to_string(), MemEntry::Link(target.to_string()));
        Ok(())
    }
}

struct FieldState {
    shape: Vec<usize>,
    data: Vec<ScalarValue>,
}

/// A typed dataset of the in-memory tree.
pub struct MemField {
    name: String,
    path: String,
    dtype: NxType,
    unlimited: Option<usize>,
    state: RwLock<FieldState>,
    attrs: RwLock<HashMap<String, DataRecord>>,
}

impl MemField {
    /// Attribute lookup, used by tests.
    pub fn attr(&self, name: &str) -> Option<DataRecord> {
        self.attrs.read().ok()?.get(name).cloned()
    }

    /// Reconstruct the stored data as a record. Fails for rank > 2 datasets
    /// (growable rank-2 fields become rank-3 storage, which the record model
    /// does not represent).
    pub fn read(&self) -> WriterResult<DataRecord> {
        let state = rlock(&self.state)?;
        match state.shape.len() {
            0 => {
                let value = state.data.first().cloned().ok_or_else(|| {
                    WriterError::Storage(format!("{} has not been written", self.path))
                })?;
                Ok(DataRecord::scalar(value, self.dtype))
            }
            1 => Ok(DataRecord::list(state.data.clone(), self.dtype)),
            2 => {
                let cols = state.shape[1];
                let rows = if cols == 0 {
                    Vec::new()
                } else {
                    state.data.chunks(cols).map(<[ScalarValue]>::to_vec).collect()
                };
                DataRecord::table(rows, self.dtype)
            }
            n => Err(WriterError::Storage(format!(
                "cannot read rank-{} dataset {} as a record",
                n, self.path
            ))),
        }
    }
}

/// Expected record shape for an append along `axis`.
fn slab_shape(shape: &[usize], axis: usize) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != axis)
        .map(|(_, d)| *d)
        .collect()
}

impl ContainerField for MemField {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn dtype(&self) -> NxType {
        self.dtype
    }

    fn shape(&self) -> Vec<usize> {
        self.state.read().map(|s| s.shape.clone()).unwrap_or_default()
    }

    fn write(&self, record: &DataRecord) -> WriterResult<()> {
        let mut state = wlock(&self.state)?;
        let declared = state.shape.clone();
        let matches = declared.len() == record.shape.len()
            && declared
                .iter()
                .zip(&record.shape)
                .all(|(d, r)| *d == 0 || d == r);
        if !matches {
            return Err(WriterError::Storage(format!(
                "shape mismatch writing {}: declared {:?}, record {:?}",
                self.path, declared, record.shape
            )));
        }
        state.shape = record.shape.clone();
        state.data = record.flat_values()?;
        Ok(())
    }

    fn append(&self, record: &DataRecord, axis: usize) -> WriterResult<()> {
        if self.unlimited != Some(axis) {
            return Err(WriterError::Storage(format!(
                "{} was not created with growable axis {}",
                self.path, axis
            )));
        }
        let mut state = wlock(&self.state)?;
        if record.rank.ndim() + 1 != state.shape.len() {
            return Err(WriterError::Storage(format!(
                "append rank mismatch on {}: record {:?} into rank-{} dataset",
                self.path,
                record.shape,
                state.shape.len()
            )));
        }

        // Zero-extent fixed axes adopt their size from the first slab.
        let expected = slab_shape(&state.shape, axis);
        for ((i, d), r) in expected.iter().enumerate().zip(&record.shape) {
            let shape_index = if i >= axis { i + 1 } else { i };
            if *d == 0 {
                state.shape[shape_index] = *r;
            } else if d != r {
                return Err(WriterError::Storage(format!(
                    "append shape mismatch on {}: slab {:?} into {:?} along axis {}",
                    self.path, record.shape, state.shape, axis
                )));
            }
        }

        let values = record.flat_values()?;
        if axis == 0 {
            state.data.extend(values);
            state.shape[0] += 1;
            return Ok(());
        }

        // Growing a non-leading axis re-lays the buffer; only rank-2
        // datasets support it.
        if state.shape.len() != 2 || axis != 1 {
            return Err(WriterError::Storage(format!(
                "growable axis {} is only supported on rank-2 datasets ({})",
                axis, self.path
            )));
        }
        let rows = state.shape[0];
        let old_cols = state.shape[1];
        if values.len() != rows {
            return Err(WriterError::Storage(format!(
                "append shape mismatch on {}: column of {} into {} rows",
                self.path,
                values.len(),
                rows
            )));
        }
        let mut data = Vec::with_capacity(rows * (old_cols + 1));
        for (row, value) in values.into_iter().enumerate() {
            data.extend_from_slice(&state.data[row * old_cols..(row + 1) * old_cols]);
            data.push(value);
        }
        state.data = data;
        state.shape[1] = old_cols + 1;
        Ok(())
    }

    fn set_attribute(&self, name: &str, value: &DataRecord) -> WriterResult<()> {
        wlock(&self.attrs)?.insert(name.to_string(), value.clone());
        Ok(())
    }
}
