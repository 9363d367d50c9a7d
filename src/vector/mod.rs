mod chunked;
pub(crate) mod get;
mod table;

pub use chunked::{Chunked, Column};
pub use table::{RecordBatch, Table};

use std::sync::Arc;

use crate::core::PlumeError;
use crate::data::Data;
use crate::types::DataType;
use crate::value::Value;

/// Logical, randomly-indexable view over exactly one `Data` node.
#[derive(Debug, Clone)]
pub struct Vector {
    data: Arc<Data>,
}

impl Vector {
    pub fn new(data: Arc<Data>) -> Self {
        Self { data }
    }

    pub fn from_data(data: Data) -> Self {
        Self { data: Arc::new(data) }
    }

    pub fn data(&self) -> &Arc<Data> {
        &self.data
    }

    pub fn data_type(&self) -> &DataType {
        self.data.data_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn null_count(&self) -> usize {
        self.data.null_count()
    }

    pub fn is_valid(&self, i: usize) -> bool {
        i < self.len() && self.data.is_valid(i)
    }

    /// Value at slot `i`; `None` past the end, `Value::Null` for null slots.
    pub fn get(&self, i: usize) -> Option<Value> {
        if i >= self.len() {
            return None;
        }
        Some(get::value_at(&self.data, i))
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<Vector, PlumeError> {
        if offset + len > self.len() {
            return Err(PlumeError::InvalidError(format!(
                "slice [{offset}, {}) out of range for vector of length {}",
                offset + len,
                self.len()
            )));
        }
        Ok(Vector::from_data(self.data.slice(offset, len)))
    }

    pub fn iter(&self) -> ValueIter<'_> {
        ValueIter { data: &self.data, i: 0, len: self.data.len() }
    }

    /// Borrow the backing values as a typed slice without copying. Available
    /// for fixed-width primitives when the backing allocation is aligned;
    /// the returned slice is trimmed to the logical window.
    pub fn typed_values<T: crate::buffer::Native + bytemuck::Pod>(&self) -> Option<&[T]> {
        let width = self.data_type().fixed_byte_width()?;
        if width != T::WIDTH {
            return None;
        }
        let values = self.data.buffers().values.as_ref()?;
        let all = values.typed::<T>()?;
        Some(&all[self.data.offset()..self.data.offset() + self.len()])
    }

    /// Materialize the values buffer as a `Vec<T>`. Fast path borrows the
    /// aligned backing slice; otherwise decodes element-wise.
    pub fn to_vec<T: crate::buffer::Native + bytemuck::Pod>(&self) -> Result<Vec<T>, PlumeError> {
        let width = self.data_type().fixed_byte_width().ok_or_else(|| {
            PlumeError::InvalidError(format!(
                "to_vec is only defined for fixed-width types, not {:?}",
                self.data_type()
            ))
        })?;
        if width != T::WIDTH {
            return Err(PlumeError::InvalidError(format!(
                "element width {} does not match {:?} (width {width})",
                T::WIDTH,
                self.data_type()
            )));
        }
        if let Some(slice) = self.typed_values::<T>() {
            return Ok(slice.to_vec());
        }
        let values = self.data.buffers().values.as_ref().ok_or_else(|| {
            PlumeError::InvalidError("vector has no values buffer".into())
        })?;
        Ok((0..self.len()).map(|i| values.value::<T>(self.data.offset() + i)).collect())
    }
}

/// Element iterator; the type dispatch is resolved once per iteration,
/// not re-derived per element.
pub struct ValueIter<'a> {
    data: &'a Data,
    i: usize,
    len: usize,
}

impl Iterator for ValueIter<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.i >= self.len {
            return None;
        }
        let v = get::value_at(self.data, self.i);
        self.i += 1;
        Some(v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.len - self.i;
        (rem, Some(rem))
    }
}

impl ExactSizeIterator for ValueIter<'_> {}
