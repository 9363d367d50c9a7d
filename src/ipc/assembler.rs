//! Flattens columns into a record batch header plus one contiguous body.
//!
//! The assembler is the writer-side dual of the loader: it walks each column
//! depth first, emitting a field node per vector and a buffer region per
//! physical buffer, with every region starting on an 8-byte boundary.
//! Sliced vectors are rebased here so readers always see offset-zero data:
//! bitmaps are repacked from the window's first bit, offset buffers are
//! shifted to start at zero, and children are trimmed to the referenced
//! range.

use std::sync::Arc;

use crate::buffer::{Buffer, ceil_div, get_bit, set_bit};
use crate::core::PlumeError;
use crate::data::Data;
use crate::ipc::message::{BufferRegion, FieldNode, RecordBatchHeader};
use crate::types::{DataType, UnionMode};

#[derive(Default)]
pub struct VectorAssembler {
    nodes: Vec<FieldNode>,
    buffers: Vec<BufferRegion>,
    body: Vec<u8>,
}

/// Bits `[offset, offset + len)` of `bitmap`, repacked to start at bit zero.
fn repack_bits(bitmap: &Buffer, offset: usize, len: usize) -> Vec<u8> {
    if offset % 8 == 0 {
        let start = offset / 8;
        return bitmap.as_slice()[start..start + ceil_div(len, 8)].to_vec();
    }
    let mut out = vec![0u8; ceil_div(len, 8)];
    for i in 0..len {
        if get_bit(bitmap.as_slice(), offset + i) {
            set_bit(&mut out, i, true);
        }
    }
    out
}

impl VectorAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_region(&mut self, bytes: &[u8]) {
        while self.body.len() % 8 != 0 {
            self.body.push(0);
        }
        self.buffers.push(BufferRegion {
            offset: self.body.len() as i64,
            length: bytes.len() as i64,
        });
        self.body.extend_from_slice(bytes);
    }

    fn push_empty_region(&mut self) {
        self.push_region(&[]);
    }

    fn push_validity(&mut self, data: &Data) {
        if data.null_count() == 0 {
            self.push_empty_region();
            return;
        }
        match &data.buffers().validity {
            Some(validity) if !validity.is_empty() => {
                let bytes = repack_bits(validity, data.offset(), data.len());
                self.push_region(&bytes);
            }
            _ => self.push_empty_region(),
        }
    }

    fn offsets_of(data: &Data) -> Result<&Buffer, PlumeError> {
        data.buffers().offsets.as_ref().ok_or_else(|| {
            PlumeError::InvalidError(format!("{:?} vector without an offsets buffer", data.data_type()))
        })
    }

    fn values_of(data: &Data) -> Result<&Buffer, PlumeError> {
        data.buffers().values.as_ref().ok_or_else(|| {
            PlumeError::InvalidError(format!("{:?} vector without a values buffer", data.data_type()))
        })
    }

    /// Rebase the offsets window to start at zero and return the referenced
    /// child/value range `[first, last)`.
    fn push_offsets(&mut self, data: &Data) -> Result<(usize, usize), PlumeError> {
        let offsets = Self::offsets_of(data)?;
        if data.len() == 0 {
            self.push_region(&0i32.to_le_bytes());
            return Ok((0, 0));
        }
        let first = offsets.value::<i32>(data.offset());
        let last = offsets.value::<i32>(data.offset() + data.len());
        let mut raw = Vec::with_capacity((data.len() + 1) * 4);
        for i in 0..=data.len() {
            let v = offsets.value::<i32>(data.offset() + i) - first;
            raw.extend_from_slice(&v.to_le_bytes());
        }
        self.push_region(&raw);
        Ok((first as usize, last as usize))
    }

    /// Emit the node, buffers and children of one vector.
    pub fn push(&mut self, data: &Arc<Data>) -> Result<(), PlumeError> {
        self.nodes.push(FieldNode {
            length: data.len() as i64,
            null_count: data.null_count() as i64,
        });

        match data.data_type().clone() {
            DataType::Null => {}
            DataType::Bool => {
                self.push_validity(data);
                let values = Self::values_of(data)?;
                let bytes = repack_bits(values, data.offset(), data.len());
                self.push_region(&bytes);
            }
            DataType::Utf8 | DataType::Binary => {
                self.push_validity(data);
                let (first, last) = self.push_offsets(data)?;
                let values = Self::values_of(data)?;
                self.push_region(&values.as_slice()[first..last]);
            }
            DataType::List(_) | DataType::Map(_, _) => {
                self.push_validity(data);
                let (first, last) = self.push_offsets(data)?;
                self.push(&Arc::new(data.child(0).slice(first, last - first)))?;
            }
            DataType::FixedSizeList(n, _) => {
                self.push_validity(data);
                let n = n as usize;
                self.push(&Arc::new(data.child(0).slice(data.offset() * n, data.len() * n)))?;
            }
            DataType::Struct(_) => {
                self.push_validity(data);
                for child in data.children() {
                    self.push(&Arc::new(child.slice(data.offset(), data.len())))?;
                }
            }
            DataType::Union(mode, _, _) => {
                let type_ids = data.buffers().type_ids.as_ref().ok_or_else(|| {
                    PlumeError::InvalidError("union vector without a type ids buffer".into())
                })?;
                self.push_region(&type_ids.as_slice()[data.offset()..data.offset() + data.len()]);
                match mode {
                    UnionMode::Sparse => {
                        for child in data.children() {
                            self.push(&Arc::new(child.slice(data.offset(), data.len())))?;
                        }
                    }
                    UnionMode::Dense => {
                        // Dense offsets index into the children directly, so
                        // the window applies to type ids and offsets only and
                        // the children travel whole.
                        let offsets = Self::offsets_of(data)?;
                        let start = data.offset() * 4;
                        self.push_region(&offsets.as_slice()[start..start + data.len() * 4]);
                        for child in data.children() {
                            self.push(child)?;
                        }
                    }
                }
            }
            DataType::Dictionary { index, .. } => {
                // Only the index vector travels in a record batch; the
                // dictionary itself goes out as its own batch.
                self.push_validity(data);
                let width = index.fixed_byte_width().ok_or_else(|| {
                    PlumeError::InvalidError(format!("dictionary index type {index:?} is not an integer"))
                })?;
                let values = Self::values_of(data)?;
                let start = data.offset() * width;
                self.push_region(&values.as_slice()[start..start + data.len() * width]);
            }
            // All remaining types are fixed width.
            other => {
                self.push_validity(data);
                let width = other.fixed_byte_width().ok_or_else(|| {
                    PlumeError::InvalidError(format!("cannot assemble {other:?} as fixed width"))
                })?;
                let values = Self::values_of(data)?;
                let start = data.offset() * width;
                self.push_region(&values.as_slice()[start..start + data.len() * width]);
            }
        }
        Ok(())
    }

    /// Finish the batch: the header plus the 8-byte padded body.
    pub fn finish(mut self, num_rows: usize) -> (RecordBatchHeader, Vec<u8>) {
        while self.body.len() % 8 != 0 {
            self.body.push(0);
        }
        (
            RecordBatchHeader {
                length: num_rows as i64,
                nodes: self.nodes,
                buffers: self.buffers,
            },
            self.body,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::ipc::loader::load_record_batch;
    use crate::ipc::Dictionaries;
    use crate::types::{Field, Schema};
    use crate::value::Value;
    use crate::vector::{RecordBatch, Vector};

    fn utf8_vector(values: &[Option<&str>]) -> Vector {
        let mut b = Builder::new(DataType::Utf8);
        for v in values {
            b.append_option(v.map(|s| Value::Utf8(s.to_string()))).unwrap();
        }
        Vector::from_data(b.flush().unwrap())
    }

    fn assemble(batch: &RecordBatch) -> (RecordBatchHeader, Vec<u8>) {
        let mut asm = VectorAssembler::new();
        for column in batch.columns() {
            asm.push(column.data()).unwrap();
        }
        asm.finish(batch.num_rows())
    }

    #[test]
    fn test_regions_are_8_byte_aligned() {
        let schema =
            Arc::new(Schema::try_new(vec![Field::new("s", DataType::Utf8, true)]).unwrap());
        let batch = RecordBatch::try_new(
            schema,
            vec![utf8_vector(&[Some("a"), None, Some("bcd")])],
        )
        .unwrap();
        let (header, body) = assemble(&batch);
        assert_eq!(body.len() % 8, 0);
        for region in &header.buffers {
            assert_eq!(region.offset % 8, 0);
        }
        // validity, offsets, values
        assert_eq!(header.buffers.len(), 3);
        assert_eq!(header.nodes, vec![FieldNode { length: 3, null_count: 1 }]);
    }

    #[test]
    fn test_sliced_vector_is_rebased() {
        let schema =
            Arc::new(Schema::try_new(vec![Field::new("s", DataType::Utf8, true)]).unwrap());
        let full = utf8_vector(&[Some("xx"), Some("yy"), None, Some("zz")]);
        let sliced = full.slice(1, 3).unwrap();
        let batch = RecordBatch::try_new(schema.clone(), vec![sliced]).unwrap();

        let (header, body) = assemble(&batch);
        // Offsets were shifted to start at zero and values trimmed to the
        // window, so only the referenced bytes travel.
        let loaded =
            load_record_batch(&schema, &header, Buffer::from_vec(body), &Dictionaries::new())
                .unwrap();
        assert_eq!(loaded.column(0).get(0), Some(Value::Utf8("yy".into())));
        assert_eq!(loaded.column(0).get(1), Some(Value::Null));
        assert_eq!(loaded.column(0).get(2), Some(Value::Utf8("zz".into())));
        assert_eq!(loaded.column(0).data().offset(), 0);
    }

    #[test]
    fn test_no_validity_region_when_fully_valid() {
        let schema =
            Arc::new(Schema::try_new(vec![Field::new("s", DataType::Utf8, true)]).unwrap());
        let batch = RecordBatch::try_new(
            schema,
            vec![utf8_vector(&[Some("a"), Some("b")])],
        )
        .unwrap();
        let (header, _) = assemble(&batch);
        assert_eq!(header.buffers[0].length, 0);
    }

    #[test]
    fn test_struct_children_follow_parent_window() {
        let dt = DataType::Struct(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Utf8, true),
        ]);
        let schema = Arc::new(Schema::try_new(vec![Field::new("p", dt.clone(), true)]).unwrap());
        let mut b = Builder::new(dt);
        for (x, s) in [(1, "u"), (2, "v"), (3, "w")] {
            b.append(Value::Struct(vec![Value::Int32(x), Value::Utf8(s.into())])).unwrap();
        }
        let full = Vector::from_data(b.flush().unwrap());
        let batch =
            RecordBatch::try_new(schema.clone(), vec![full.slice(1, 2).unwrap()]).unwrap();

        let (header, body) = assemble(&batch);
        // Parent node plus two child nodes, each rebased to length 2.
        assert_eq!(header.nodes.len(), 3);
        assert!(header.nodes.iter().all(|n| n.length == 2));
        let loaded =
            load_record_batch(&schema, &header, Buffer::from_vec(body), &Dictionaries::new())
                .unwrap();
        assert_eq!(
            loaded.column(0).get(0),
            Some(Value::Struct(vec![Value::Int32(2), Value::Utf8("v".into())]))
        );
    }

    #[test]
    fn test_bool_bitmap_repacked_from_unaligned_offset() {
        let schema =
            Arc::new(Schema::try_new(vec![Field::new("f", DataType::Bool, true)]).unwrap());
        let mut b = Builder::new(DataType::Bool);
        for i in 0..12 {
            b.append(Value::Bool(i % 3 == 0)).unwrap();
        }
        let full = Vector::from_data(b.flush().unwrap());
        let batch =
            RecordBatch::try_new(schema.clone(), vec![full.slice(5, 6).unwrap()]).unwrap();
        let (header, body) = assemble(&batch);
        let loaded =
            load_record_batch(&schema, &header, Buffer::from_vec(body), &Dictionaries::new())
                .unwrap();
        for i in 0..6 {
            assert_eq!(loaded.column(0).get(i), Some(Value::Bool((i + 5) % 3 == 0)));
        }
    }
}
