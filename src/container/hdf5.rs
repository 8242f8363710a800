//! HDF5 container backend.
//!
//! Maps the container traits onto the `hdf5` crate. Requires a native HDF5
//! installation; the whole module sits behind the `storage_hdf5` feature and
//! builds without it resolve the backend name to a `FeatureNotEnabled`
//! error instead.
//!
//! Storage mapping: integer types store as `i64`, unsigned as `u64`, floats
//! as `f64`, booleans as `u8`, text as variable-length UTF-8.

use super::{
    ContainerField, ContainerFile, ContainerGroup, FieldHandle, FieldOptions, GroupHandle,
};
use crate::error::{WriterError, WriterResult};
use crate::types::{DataRecord, NxType, ScalarValue, StorageClass};
use anyhow::Context;
use hdf5::types::VarLenUnicode;
use hdf5::{Extent, SimpleExtents};
use ndarray::s;
use std::sync::Arc;

fn storage_err(err: impl std::fmt::Display) -> WriterError {
    WriterError::Storage(err.to_string())
}

/// An HDF5-backed container file.
pub struct Hdf5File {
    file: hdf5::File,
    path: String,
}

impl Hdf5File {
    /// Create (truncate) an HDF5 file at the given path.
    pub fn create(path: &str) -> WriterResult<Arc<Hdf5File>> {
        let file = hdf5::File::create(path)
            .with_context(|| format!("Failed to create HDF5 file at {:?}", path))
            .map_err(storage_err)?;
        Ok(Arc::new(Hdf5File {
            file,
            path: path.to_string(),
        }))
    }
}

impl ContainerFile for Hdf5File {
    fn root(&self) -> GroupHandle {
        Arc::new(Hdf5Group {
            group: self.file.group("/").ok(),
            path: "/".to_string(),
        })
    }

    fn flush(&self) -> WriterResult<()> {
        self.file.flush().map_err(storage_err)
    }

    fn close(&self) -> WriterResult<()> {
        // The handle closes with the last reference; flushing is the
        // observable part.
        self.file.flush().map_err(storage_err)
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct Hdf5Group {
    group: Option<hdf5::Group>,
    path: String,
}

impl Hdf5Group {
    fn inner(&self) -> WriterResult<&hdf5::Group> {
        self.group
            .as_ref()
            .ok_or_else(|| WriterError::Storage(format!("group {} is not open", self.path)))
    }
}

fn write_attr(obj: &hdf5::Location, name: &str, value: &DataRecord) -> WriterResult<()> {
    let scalars = value.flat_values()?;
    let result: hdf5::Result<()> = (|| {
        match value.dtype.storage_class() {
            StorageClass::Float => {
                let vals: Vec<f64> = scalars.iter().filter_map(ScalarValue::as_f64).collect();
                if value.shape.is_empty() {
                    obj.new_attr::<f64>().create(name)?.write_scalar(&vals[0])?;
                } else {
                    obj.new_attr::<f64>()
                        .shape(vals.len())
                        .create(name)?
                        .write_raw(&vals)?;
                }
            }
            StorageClass::Integer | StorageClass::Boolean => {
                let vals: Vec<i64> = scalars.iter().filter_map(ScalarValue::as_i64).collect();
                if value.shape.is_empty() {
                    obj.new_attr::<i64>().create(name)?.write_scalar(&vals[0])?;
                } else {
                    obj.new_attr::<i64>()
                        .shape(vals.len())
                        .create(name)?
                        .write_raw(&vals)?;
                }
            }
            StorageClass::Unsigned => {
                let vals: Vec<u64> = scalars.iter().filter_map(ScalarValue::as_u64).collect();
                if value.shape.is_empty() {
                    obj.new_attr::<u64>().create(name)?.write_scalar(&vals[0])?;
                } else {
                    obj.new_attr::<u64>()
                        .shape(vals.len())
                        .create(name)?
                        .write_raw(&vals)?;
                }
            }
            StorageClass::Text => {
                let vals: Vec<VarLenUnicode> = scalars
                    .iter()
                    .map(|v| v.to_string().parse().unwrap_or_default())
                    .collect();
                if value.shape.is_empty() {
                    obj.new_attr::<VarLenUnicode>()
                        .create(name)?
                        .write_scalar(&vals[0])?;
                } else {
                    obj.new_attr::<VarLenUnicode>()
                        .shape(vals.len())
                        .create(name)?
                        .write_raw(&vals)?;
                }
            }
        }
        Ok(())
    })();
    result.map_err(storage_err)
}

fn extents(shape: &[usize], unlimited: Option<usize>) -> SimpleExtents {
    // Zero-extent axes stay resizable so a later write can adopt the real
    // shape.
    let resizable = unlimited.is_some() || shape.contains(&0);
    let dims: Vec<Extent> = shape
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if resizable && (Some(i) == unlimited || d == 0) {
                Extent::resizable(d)
            } else {
                Extent::from(d)
            }
        })
        .collect();
    SimpleExtents::new(dims)
}

fn chunk_dims(shape: &[usize]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(1)).collect()
}

impl ContainerGroup for Hdf5Group {
    fn name(&self) -> String {
        self.path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn create_group(&self, name: &str, class: &str) -> WriterResult<GroupHandle> {
        let parent = self.inner()?;
        let group = match parent.group(name) {
            Ok(existing) => existing,
            Err(_) => parent.create_group(name).map_err(storage_err)?,
        };
        let handle = Hdf5Group {
            path: group.name(),
            group: Some(group),
        };
        if !class.is_empty() {
            write_attr(
                handle.inner()?,
                "NX_class",
                &DataRecord::scalar(ScalarValue::Text(class.to_string()), NxType::Char),
            )?;
        }
        Ok(Arc::new(handle))
    }

    fn create_field(
        &self,
        name: &str,
        dtype: NxType,
        shape: &[usize],
        unlimited: Option<usize>,
        opts: &FieldOptions,
    ) -> WriterResult<FieldHandle> {
        let parent = self.inner()?;
        let shaped = extents(shape, unlimited);
        let chunked = unlimited.is_some() || shape.contains(&0);
        let ds: hdf5::Result<hdf5::Dataset> = (|| {
            macro_rules! build {
                ($t:ty) => {{
                    let mut b = parent.new_dataset::<$t>();
                    if chunked && !shape.is_empty() {
                        b = b.chunk(chunk_dims(shape));
                    }
                    if let Some(level) = opts.rate.filter(|_| opts.compression.is_some()) {
                        b = b.deflate(level);
                    }
                    if opts.shuffle {
                        b = b.shuffle();
                    }
                    b.shape(shaped).create(name)
                }};
            }
            match dtype.storage_class() {
                StorageClass::Float => build!(f64),
                StorageClass::Integer => build!(i64),
                StorageClass::Unsigned => build!(u64),
                StorageClass::Boolean => build!(u8),
                StorageClass::Text => build!(VarLenUnicode),
            }
        })();
        let ds = ds.map_err(storage_err)?;
        Ok(Arc::new(Hdf5Field {
            path: ds.name(),
            ds,
            dtype,
        }))
    }

    fn set_attribute(&self, name: &str, value: &DataRecord) -> WriterResult<()> {
        write_attr(self.inner()?, name, value)
    }

    fn create_link(&self, name: &str, target: &str) -> WriterResult<()> {
        self.inner()?.link_soft(target, name).map_err(storage_err)
    }
}

struct Hdf5Field {
    ds: hdf5::Dataset,
    dtype: NxType,
    path: String,
}

impl Hdf5Field {
    fn write_full<T: hdf5::H5Type + Clone>(&self, vals: &[T], shape: &[usize]) -> WriterResult<()> {
        if self.ds.shape() != shape {
            self.ds.resize(shape.to_vec()).map_err(storage_err)?;
        }
        self.ds.write_raw(vals).map_err(storage_err)
    }

    fn append_slab<T: hdf5::H5Type + Clone>(&self, vals: Vec<T>) -> WriterResult<()> {
        let mut shape = self.ds.shape();
        shape[0] += 1;
        self.ds.resize(shape.clone()).map_err(storage_err)?;
        let n = shape[0];
        let result: anyhow::Result<()> = (|| {
            match shape.len() {
                1 => self.ds.write_slice(&vals, s![n - 1..n])?,
                2 => {
                    let arr = ndarray::Array::from_shape_vec((1, shape[1]), vals)?;
                    self.ds.write_slice(&arr, s![n - 1..n, ..])?;
                }
                3 => {
                    let arr = ndarray::Array::from_shape_vec((1, shape[1], shape[2]), vals)?;
                    self.ds.write_slice(&arr, s![n - 1..n, .., ..])?;
                }
                other => anyhow::bail!("unsupported dataset rank {}", other),
            }
            Ok(())
        })();
        result.map_err(storage_err)
    }
}

fn to_f64(scalars: &[ScalarValue]) -> Vec<f64> {
    scalars.iter().filter_map(ScalarValue::as_f64).collect()
}

fn to_i64(scalars: &[ScalarValue]) -> Vec<i64> {
    scalars.iter().filter_map(ScalarValue::as_i64).collect()
}

fn to_u64(scalars: &[ScalarValue]) -> Vec<u64> {
    scalars.iter().filter_map(ScalarValue::as_u64).collect()
}

fn to_text(scalars: &[ScalarValue]) -> Vec<VarLenUnicode> {
    scalars
        .iter()
        .map(|v| v.to_string().parse().unwrap_or_default())
        .collect()
}

fn to_bool(scalars: &[ScalarValue]) -> Vec<u8> {
    scalars
        .iter()
        .map(|v| u8::from(v.as_bool().unwrap_or_default()))
        .collect()
}

impl ContainerField for Hdf5Field {
    fn name(&self) -> String {
        self.path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn dtype(&self) -> NxType {
        self.dtype
    }

    fn shape(&self) -> Vec<usize> {
        self.ds.shape()
    }

    fn write(&self, record: &DataRecord) -> WriterResult<()> {
        let scalars = record.flat_values()?;
        match self.dtype.storage_class() {
            StorageClass::Float => self.write_full(&to_f64(&scalars), &record.shape),
            StorageClass::Integer => self.write_full(&to_i64(&scalars), &record.shape),
            StorageClass::Unsigned => self.write_full(&to_u64(&scalars), &record.shape),
            StorageClass::Boolean => self.write_full(&to_bool(&scalars), &record.shape),
            StorageClass::Text => self.write_full(&to_text(&scalars), &record.shape),
        }
    }

    fn append(&self, record: &DataRecord, axis: usize) -> WriterResult<()> {
        if axis != 0 {
            return Err(WriterError::Storage(format!(
                "the HDF5 backend only grows along the first axis ({})",
                self.path
            )));
        }
        let scalars = record.flat_values()?;
        match self.dtype.storage_class() {
            StorageClass::Float => self.append_slab(to_f64(&scalars)),
            StorageClass::Integer => self.append_slab(to_i64(&scalars)),
            StorageClass::Unsigned => self.append_slab(to_u64(&scalars)),
            StorageClass::Boolean => self.append_slab(to_bool(&scalars)),
            StorageClass::Text => self.append_slab(to_text(&scalars)),
        }
    }

    fn set_attribute(&self, name: &str, value: &DataRecord) -> WriterResult<()> {
        write_attr(&self.ds, name, value)
    }
}
