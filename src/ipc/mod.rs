//! Arrow-compatible IPC: metadata codec, body assembly/loading, and the
//! stream/file protocol state machines.

pub mod assembler;
mod fb;
pub mod footer;
pub mod loader;
pub mod message;
pub mod reader;
pub mod schema_codec;
pub mod writer;

mod aio;

pub use aio::{AsyncStreamReader, AsyncStreamWriter};
pub use message::{
    BufferRegion, DictionaryBatchHeader, FieldNode, Message, MessageHeader, RecordBatchHeader,
};
pub use reader::{FileReader, StreamReader};
pub use writer::{FileWriter, StreamWriter, WriterOptions};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::PlumeError;
use crate::data::Data;
use crate::types::DataType;

/// Stream terminator / continuation marker.
pub const CONTINUATION: i32 = -1;
/// Magic at both ends of an IPC file. The leading copy is padded to 8.
pub const FILE_MAGIC: &[u8; 6] = b"ARROW1";
/// Metadata version written by this crate (V5).
pub const METADATA_VERSION: i16 = 4;

/// Per-session dictionary-id resolution: decoding two fields that share an
/// id must yield the same dictionary value type, and dictionary batches
/// resolve through the same map. Never process-wide; one per stream.
#[derive(Debug, Default)]
pub struct DictionaryMemo {
    types: BTreeMap<i64, DataType>,
}

impl DictionaryMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_type(&self, id: i64) -> Option<&DataType> {
        self.types.get(&id)
    }

    /// Record the value type for `id`, enforcing one type per id.
    pub fn bind(&mut self, id: i64, value_type: &DataType) -> Result<(), PlumeError> {
        match self.types.get(&id) {
            None => {
                self.types.insert(id, value_type.clone());
                Ok(())
            }
            Some(existing) if existing == value_type => Ok(()),
            Some(existing) => Err(PlumeError::SchemaConflict(format!(
                "dictionary id {id} decoded as {existing:?} and {value_type:?}"
            ))),
        }
    }
}

/// Materialized dictionary vectors by id, shared by a reader session.
pub type Dictionaries = BTreeMap<i64, Arc<Data>>;
