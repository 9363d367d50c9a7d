//! File footer: the schema plus block indexes for random access.
//!
//! ```text
//! Footer { version: i16, schema: Schema, dictionaries: [Block], recordBatches: [Block] }
//! Block = struct { offset: i64, metaDataLength: i32, <4 pad>, bodyLength: i64 }  (24 bytes)
//! ```

use flatbuffers::{FlatBufferBuilder, Table};

use crate::core::PlumeError;
use crate::ipc::fb::{self, RawBlock};
use crate::ipc::schema_codec::{decode_schema, encode_schema};
use crate::ipc::{DictionaryMemo, METADATA_VERSION};
use crate::types::Schema;

/// Position of one encapsulated message inside the file. `offset` points at
/// the start of its framing; `meta_data_length` covers the framing prefix
/// plus the padded metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: i64,
    pub meta_data_length: i32,
    pub body_length: i64,
}

#[derive(Debug, Clone)]
pub struct Footer {
    pub schema: Schema,
    pub dictionaries: Vec<Block>,
    pub record_batches: Vec<Block>,
}

fn raw_blocks(blocks: &[Block]) -> Vec<RawBlock> {
    blocks
        .iter()
        .map(|b| RawBlock::new(b.offset, b.meta_data_length, b.body_length))
        .collect()
}

fn decode_blocks(table: &Table, slot: usize) -> Vec<Block> {
    let mut out = Vec::new();
    if let Some(v) = fb::vector_field::<RawBlock>(table, slot) {
        out.reserve(v.len());
        for b in v.iter() {
            out.push(Block {
                offset: b.offset(),
                meta_data_length: b.meta_data_length(),
                body_length: b.body_length(),
            });
        }
    }
    out
}

pub fn encode_footer(footer: &Footer) -> Result<Vec<u8>, PlumeError> {
    let mut fbb = FlatBufferBuilder::new();
    let raw = raw_blocks(&footer.record_batches);
    let record_batches = fbb.create_vector(&raw);
    let raw = raw_blocks(&footer.dictionaries);
    let dictionaries = fbb.create_vector(&raw);
    let schema = encode_schema(&mut fbb, &footer.schema)?;

    let start = fbb.start_table();
    fbb.push_slot::<i16>(fb::slot(0), METADATA_VERSION, 0);
    fbb.push_slot_always(fb::slot(1), schema);
    fbb.push_slot_always(fb::slot(2), dictionaries);
    fbb.push_slot_always(fb::slot(3), record_batches);
    let root = fbb.end_table(start);
    fbb.finish_minimal(root);
    Ok(fbb.finished_data().to_vec())
}

pub fn decode_footer(buf: &[u8], memo: &mut DictionaryMemo) -> Result<Footer, PlumeError> {
    let root = fb::root(buf)?;
    let schema = fb::table_field(&root, 1)
        .ok_or_else(|| PlumeError::FormatError("file footer without a schema".into()))?;
    Ok(Footer {
        schema: decode_schema(&schema, memo)?,
        dictionaries: decode_blocks(&root, 2),
        record_batches: decode_blocks(&root, 3),
    })
}
