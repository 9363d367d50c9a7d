//! Reconstructs columns from a record batch header plus its body bytes.
//!
//! Field nodes and buffer regions are consumed in depth-first field order,
//! matching the order the assembler emits them. Buffers are sliced out of
//! the shared body without copying.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::core::PlumeError;
use crate::data::{Buffers, Data};
use crate::ipc::message::RecordBatchHeader;
use crate::ipc::Dictionaries;
use crate::types::{DataType, Schema};
use crate::vector::{RecordBatch, Vector};

pub struct VectorLoader<'a> {
    body: Buffer,
    header: &'a RecordBatchHeader,
    node_index: usize,
    buffer_index: usize,
    dictionaries: Option<&'a Dictionaries>,
}

impl<'a> VectorLoader<'a> {
    pub fn new(
        header: &'a RecordBatchHeader,
        body: Buffer,
        dictionaries: Option<&'a Dictionaries>,
    ) -> Self {
        Self { body, header, node_index: 0, buffer_index: 0, dictionaries }
    }

    fn next_node(&mut self) -> Result<(usize, usize), PlumeError> {
        let node = self.header.nodes.get(self.node_index).ok_or_else(|| {
            PlumeError::FormatError(format!(
                "record batch header has only {} field nodes",
                self.header.nodes.len()
            ))
        })?;
        self.node_index += 1;
        if node.length < 0 || node.null_count < 0 {
            return Err(PlumeError::FormatError(format!(
                "negative field node ({}, {})",
                node.length, node.null_count
            )));
        }
        Ok((node.length as usize, node.null_count as usize))
    }

    fn next_buffer(&mut self) -> Result<Option<Buffer>, PlumeError> {
        let region = self.header.buffers.get(self.buffer_index).ok_or_else(|| {
            PlumeError::FormatError(format!(
                "record batch header has only {} buffer regions",
                self.header.buffers.len()
            ))
        })?;
        self.buffer_index += 1;
        if region.offset < 0 || region.length < 0 {
            return Err(PlumeError::FormatError(format!(
                "negative buffer region ({}, {})",
                region.offset, region.length
            )));
        }
        let (offset, length) = (region.offset as usize, region.length as usize);
        if offset + length > self.body.len() {
            return Err(PlumeError::FormatError(format!(
                "buffer region [{offset}, {}) outside a body of {} bytes",
                offset + length,
                self.body.len()
            )));
        }
        if length == 0 {
            return Ok(None);
        }
        Ok(Some(self.body.slice(offset, length)))
    }

    /// Load the vector for one field, consuming its node, its buffers and
    /// recursively its children's.
    pub fn load(&mut self, data_type: &DataType) -> Result<Arc<Data>, PlumeError> {
        let (len, null_count) = self.next_node()?;
        if *data_type == DataType::Null {
            let data =
                Data::try_new(DataType::Null, len, 0, Buffers::default(), Vec::new(), None, None)?;
            return Ok(Arc::new(data));
        }

        let layout = data_type.buffer_layout();
        let mut buffers = Buffers::default();
        if layout.validity {
            buffers.validity = self.next_buffer()?;
        }
        if layout.type_ids {
            buffers.type_ids = self.next_buffer()?;
        }
        if layout.offsets {
            buffers.offsets = self.next_buffer()?;
        }
        if layout.values {
            // Zero-length values are legal (e.g. all-empty strings); keep an
            // empty buffer so validation sees the slot filled.
            buffers.values = Some(self.next_buffer()?.unwrap_or_default());
        }

        let children = match data_type {
            DataType::Dictionary { .. } => Vec::new(),
            other => {
                let mut children = Vec::with_capacity(other.children().len());
                for child in other.children() {
                    children.push(self.load(&child.data_type)?);
                }
                children
            }
        };

        let dictionary = match data_type {
            DataType::Dictionary { id, .. } => {
                let resolved = self.dictionaries.and_then(|d| d.get(id)).ok_or_else(|| {
                    PlumeError::ProtocolError(format!(
                        "record batch references dictionary id {id} before its dictionary batch"
                    ))
                })?;
                Some(resolved.clone())
            }
            _ => None,
        };

        let data =
            Data::try_new(data_type.clone(), len, 0, buffers, children, dictionary, Some(null_count))?;
        Ok(Arc::new(data))
    }

    /// Every node and buffer region must have been claimed by a field.
    pub fn finish(self) -> Result<(), PlumeError> {
        if self.node_index != self.header.nodes.len() {
            return Err(PlumeError::FormatError(format!(
                "{} of {} field nodes consumed",
                self.node_index,
                self.header.nodes.len()
            )));
        }
        if self.buffer_index != self.header.buffers.len() {
            return Err(PlumeError::FormatError(format!(
                "{} of {} buffer regions consumed",
                self.buffer_index,
                self.header.buffers.len()
            )));
        }
        Ok(())
    }
}

pub fn load_record_batch(
    schema: &Arc<Schema>,
    header: &RecordBatchHeader,
    body: Buffer,
    dictionaries: &Dictionaries,
) -> Result<RecordBatch, PlumeError> {
    let mut loader = VectorLoader::new(header, body, Some(dictionaries));
    let mut columns = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        columns.push(Vector::new(loader.load(&field.data_type)?));
    }
    loader.finish()?;
    RecordBatch::try_new(schema.clone(), columns)
}

/// Load the single-column payload of a dictionary batch.
pub fn load_dictionary_vector(
    value_type: &DataType,
    header: &RecordBatchHeader,
    body: Buffer,
) -> Result<Arc<Data>, PlumeError> {
    let mut loader = VectorLoader::new(header, body, None);
    let data = loader.load(value_type)?;
    loader.finish()?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::assembler::VectorAssembler;
    use crate::ipc::message::{BufferRegion, FieldNode};
    use crate::builder::Builder;
    use crate::types::Field;
    use crate::value::Value;

    fn int32_vector(values: &[Option<i32>]) -> Vector {
        let mut b = Builder::new(DataType::Int32);
        for v in values {
            b.append_option(v.map(Value::Int32)).unwrap();
        }
        Vector::from_data(b.flush().unwrap())
    }

    #[test]
    fn test_assemble_then_load_round_trip() {
        let schema = Arc::new(
            Schema::try_new(vec![Field::new("x", DataType::Int32, true)]).unwrap(),
        );
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![int32_vector(&[Some(1), None, Some(3)])],
        )
        .unwrap();

        let mut asm = VectorAssembler::new();
        for column in batch.columns() {
            asm.push(column.data()).unwrap();
        }
        let (header, body) = asm.finish(batch.num_rows());

        let loaded =
            load_record_batch(&schema, &header, Buffer::from_vec(body), &Dictionaries::new())
                .unwrap();
        assert_eq!(loaded.num_rows(), 3);
        assert_eq!(loaded.column(0).get(0), Some(Value::Int32(1)));
        assert_eq!(loaded.column(0).get(1), Some(Value::Null));
        assert_eq!(loaded.column(0).get(2), Some(Value::Int32(3)));
    }

    #[test]
    fn test_missing_dictionary_is_protocol_error() {
        let dict_type = DataType::Dictionary {
            index: Box::new(DataType::Int32),
            value: Box::new(DataType::Utf8),
            id: 0,
            ordered: false,
        };
        let schema =
            Arc::new(Schema::try_new(vec![Field::new("d", dict_type, true)]).unwrap());
        let header = RecordBatchHeader {
            length: 1,
            nodes: vec![FieldNode { length: 1, null_count: 0 }],
            buffers: vec![
                BufferRegion { offset: 0, length: 0 },
                BufferRegion { offset: 0, length: 8 },
            ],
        };
        let err = load_record_batch(
            &schema,
            &header,
            Buffer::from_vec(vec![0u8; 8]),
            &Dictionaries::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PlumeError::ProtocolError(_)));
    }

    #[test]
    fn test_invalid_utf8_body_is_rejected() {
        let schema =
            Arc::new(Schema::try_new(vec![Field::new("s", DataType::Utf8, false)]).unwrap());
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&[0xff, 0xfe]);
        let header = RecordBatchHeader {
            length: 1,
            nodes: vec![FieldNode { length: 1, null_count: 0 }],
            buffers: vec![
                BufferRegion { offset: 0, length: 0 },
                BufferRegion { offset: 0, length: 8 },
                BufferRegion { offset: 8, length: 2 },
            ],
        };
        let err = load_record_batch(
            &schema,
            &header,
            Buffer::from_vec(body),
            &Dictionaries::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PlumeError::InvalidError(_)));
    }

    #[test]
    fn test_out_of_range_region_is_format_error() {
        let schema = Arc::new(
            Schema::try_new(vec![Field::new("x", DataType::Int64, false)]).unwrap(),
        );
        let header = RecordBatchHeader {
            length: 2,
            nodes: vec![FieldNode { length: 2, null_count: 0 }],
            buffers: vec![
                BufferRegion { offset: 0, length: 0 },
                BufferRegion { offset: 0, length: 64 },
            ],
        };
        let err = load_record_batch(
            &schema,
            &header,
            Buffer::from_vec(vec![0u8; 16]),
            &Dictionaries::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PlumeError::FormatError(_)));
    }
}
