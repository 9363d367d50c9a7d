//! The IPC message envelope: one metadata table carrying a schema, record
//! batch header or dictionary batch header, plus the body length.
//!
//! Wire layout of an encoded message (before framing):
//!
//! ```text
//! Message { version: i16, header: union, bodyLength: i64 }
//! RecordBatch { length: i64, nodes: [FieldNode], buffers: [Buffer] }
//! DictionaryBatch { id: i64, data: RecordBatch, isDelta: bool }
//! FieldNode = struct { length: i64, null_count: i64 }    (16 bytes)
//! Buffer    = struct { offset: i64, length: i64 }        (16 bytes)
//! ```

use flatbuffers::{FlatBufferBuilder, Table};

use crate::core::PlumeError;
use crate::ipc::fb::{self, RawBuffer, RawFieldNode, TableOffset};
use crate::ipc::schema_codec::{decode_schema, encode_schema};
use crate::ipc::{DictionaryMemo, METADATA_VERSION};
use crate::types::Schema;

// Header union tags from Message.fbs.
const HEADER_SCHEMA: u8 = 1;
const HEADER_DICTIONARY_BATCH: u8 = 2;
const HEADER_RECORD_BATCH: u8 = 3;

/// Length and null count of one vector in depth-first field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldNode {
    pub length: i64,
    pub null_count: i64,
}

/// One physical buffer's window into the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub offset: i64,
    pub length: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatchHeader {
    pub length: i64,
    pub nodes: Vec<FieldNode>,
    pub buffers: Vec<BufferRegion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryBatchHeader {
    pub id: i64,
    pub data: RecordBatchHeader,
    pub is_delta: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageHeader {
    Schema(Schema),
    RecordBatch(RecordBatchHeader),
    DictionaryBatch(DictionaryBatchHeader),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body_length: i64,
}

fn encode_record_batch_header<'fbb>(
    fbb: &mut FlatBufferBuilder<'fbb>,
    header: &RecordBatchHeader,
) -> TableOffset {
    let buffers: Vec<RawBuffer> =
        header.buffers.iter().map(|b| RawBuffer::new(b.offset, b.length)).collect();
    let buffers = fbb.create_vector(&buffers);
    let nodes: Vec<RawFieldNode> =
        header.nodes.iter().map(|n| RawFieldNode::new(n.length, n.null_count)).collect();
    let nodes = fbb.create_vector(&nodes);

    let start = fbb.start_table();
    fbb.push_slot::<i64>(fb::slot(0), header.length, 0);
    fbb.push_slot_always(fb::slot(1), nodes);
    fbb.push_slot_always(fb::slot(2), buffers);
    fbb.end_table(start)
}

fn decode_record_batch_header(table: &Table) -> Result<RecordBatchHeader, PlumeError> {
    if fb::table_field(table, 3).is_some() {
        return Err(PlumeError::FormatError(
            "compressed record batch bodies are not supported".into(),
        ));
    }
    let length = fb::scalar_field::<i64>(table, 0, 0);

    let mut nodes = Vec::new();
    if let Some(v) = fb::vector_field::<RawFieldNode>(table, 1) {
        nodes.reserve(v.len());
        for n in v.iter() {
            nodes.push(FieldNode { length: n.length(), null_count: n.null_count() });
        }
    }

    let mut buffers = Vec::new();
    if let Some(v) = fb::vector_field::<RawBuffer>(table, 2) {
        buffers.reserve(v.len());
        for b in v.iter() {
            buffers.push(BufferRegion { offset: b.offset(), length: b.length() });
        }
    }

    Ok(RecordBatchHeader { length, nodes, buffers })
}

/// Serialize a message envelope to a standalone metadata buffer (framing and
/// padding are the caller's concern).
pub fn encode_message(message: &Message) -> Result<Vec<u8>, PlumeError> {
    let mut fbb = FlatBufferBuilder::new();
    let (tag, header) = match &message.header {
        MessageHeader::Schema(schema) => (HEADER_SCHEMA, encode_schema(&mut fbb, schema)?),
        MessageHeader::RecordBatch(h) => {
            (HEADER_RECORD_BATCH, encode_record_batch_header(&mut fbb, h))
        }
        MessageHeader::DictionaryBatch(h) => {
            let data = encode_record_batch_header(&mut fbb, &h.data);
            let start = fbb.start_table();
            fbb.push_slot::<i64>(fb::slot(0), h.id, 0);
            fbb.push_slot_always(fb::slot(1), data);
            fbb.push_slot::<bool>(fb::slot(2), h.is_delta, false);
            (HEADER_DICTIONARY_BATCH, fbb.end_table(start))
        }
    };
    let start = fbb.start_table();
    fbb.push_slot::<i16>(fb::slot(0), METADATA_VERSION, 0);
    fbb.push_slot::<u8>(fb::slot(1), tag, 0);
    fbb.push_slot_always(fb::slot(2), header);
    fbb.push_slot::<i64>(fb::slot(3), message.body_length, 0);
    let root = fbb.end_table(start);
    fbb.finish_minimal(root);
    Ok(fbb.finished_data().to_vec())
}

/// Parse a metadata buffer into a message envelope. Schema headers bind
/// dictionary ids through `memo`.
pub fn decode_message(buf: &[u8], memo: &mut DictionaryMemo) -> Result<Message, PlumeError> {
    let root = fb::root(buf)?;
    let version = fb::scalar_field::<i16>(&root, 0, 0);
    if version != METADATA_VERSION && version != METADATA_VERSION - 1 {
        return Err(PlumeError::FormatError(format!(
            "unsupported metadata version {version}"
        )));
    }
    let tag = fb::scalar_field::<u8>(&root, 1, 0);
    let header = fb::table_field(&root, 2).ok_or_else(|| {
        PlumeError::FormatError("message envelope without a header".into())
    })?;
    let body_length = fb::scalar_field::<i64>(&root, 3, 0);

    let header = match tag {
        HEADER_SCHEMA => MessageHeader::Schema(decode_schema(&header, memo)?),
        HEADER_RECORD_BATCH => {
            MessageHeader::RecordBatch(decode_record_batch_header(&header)?)
        }
        HEADER_DICTIONARY_BATCH => {
            let id = fb::scalar_field::<i64>(&header, 0, 0);
            let data = fb::table_field(&header, 1).ok_or_else(|| {
                PlumeError::FormatError("dictionary batch without batch data".into())
            })?;
            MessageHeader::DictionaryBatch(DictionaryBatchHeader {
                id,
                data: decode_record_batch_header(&data)?,
                is_delta: fb::scalar_field::<bool>(&header, 2, false),
            })
        }
        other => {
            return Err(PlumeError::FormatError(format!("unknown message header tag {other}")));
        }
    };

    Ok(Message { header, body_length })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Field};

    fn round_trip(message: &Message) -> Message {
        let bytes = encode_message(message).unwrap();
        decode_message(&bytes, &mut DictionaryMemo::new()).unwrap()
    }

    fn finish(mut fbb: FlatBufferBuilder, root: TableOffset) -> Vec<u8> {
        fbb.finish_minimal(root);
        fbb.finished_data().to_vec()
    }

    #[test]
    fn test_record_batch_message_round_trip() {
        let message = Message {
            header: MessageHeader::RecordBatch(RecordBatchHeader {
                length: 3,
                nodes: vec![FieldNode { length: 3, null_count: 1 }],
                buffers: vec![
                    BufferRegion { offset: 0, length: 1 },
                    BufferRegion { offset: 8, length: 12 },
                ],
            }),
            body_length: 24,
        };
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_dictionary_batch_message_round_trip() {
        let message = Message {
            header: MessageHeader::DictionaryBatch(DictionaryBatchHeader {
                id: 2,
                data: RecordBatchHeader {
                    length: 5,
                    nodes: vec![FieldNode { length: 5, null_count: 0 }],
                    buffers: vec![
                        BufferRegion { offset: 0, length: 24 },
                        BufferRegion { offset: 24, length: 17 },
                    ],
                },
                is_delta: true,
            }),
            body_length: 48,
        };
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_schema_message_round_trip() {
        let schema = Schema::try_new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Utf8, false),
        ])
        .unwrap();
        let message = Message { header: MessageHeader::Schema(schema.clone()), body_length: 0 };
        match round_trip(&message).header {
            MessageHeader::Schema(decoded) => assert_eq!(decoded.fields, schema.fields),
            other => panic!("expected schema header, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_header_rejected() {
        let mut fbb = FlatBufferBuilder::new();
        let start = fbb.start_table();
        fbb.push_slot::<i16>(fb::slot(0), METADATA_VERSION, 0);
        let root = fbb.end_table(start);
        let bytes = finish(fbb, root);
        let err = decode_message(&bytes, &mut DictionaryMemo::new()).unwrap_err();
        assert!(matches!(err, PlumeError::FormatError(_)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut fbb = FlatBufferBuilder::new();
        let start = fbb.start_table();
        fbb.push_slot::<i16>(fb::slot(0), 1, 0);
        let root = fbb.end_table(start);
        let bytes = finish(fbb, root);
        assert!(decode_message(&bytes, &mut DictionaryMemo::new()).is_err());
    }

    #[test]
    fn test_compressed_batch_rejected() {
        let mut fbb = FlatBufferBuilder::new();
        let compression_start = fbb.start_table();
        let compression = fbb.end_table(compression_start);
        let batch_start = fbb.start_table();
        fbb.push_slot::<i64>(fb::slot(0), 2, 0);
        fbb.push_slot_always(fb::slot(3), compression);
        let batch = fbb.end_table(batch_start);
        let start = fbb.start_table();
        fbb.push_slot::<i16>(fb::slot(0), METADATA_VERSION, 0);
        fbb.push_slot::<u8>(fb::slot(1), 3, 0);
        fbb.push_slot_always(fb::slot(2), batch);
        let root = fbb.end_table(start);
        let bytes = finish(fbb, root);
        let err = decode_message(&bytes, &mut DictionaryMemo::new()).unwrap_err();
        assert!(matches!(err, PlumeError::FormatError(_)));
    }
}
