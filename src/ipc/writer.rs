//! Stream and file writers.
//!
//! Every message goes out as an encapsulated frame: `[-1][metadata length]`
//! (or the bare legacy length on request), the padded metadata, then the
//! 8-byte aligned body. The file writer additionally brackets the stream
//! with the file magic and appends a footer indexing every block.
//!
//! Dictionaries are append-only across a session: the first batch that uses
//! an id emits the full dictionary, later batches emit only the delta of
//! newly-appended values, and a dictionary that shrank or was replaced is
//! refused.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use log::debug;

use crate::buffer::round_to_8;
use crate::core::PlumeError;
use crate::data::Data;
use crate::ipc::assembler::VectorAssembler;
use crate::ipc::footer::{Block, Footer, encode_footer};
use crate::ipc::message::{
    DictionaryBatchHeader, Message, MessageHeader, encode_message,
};
use crate::ipc::{CONTINUATION, FILE_MAGIC};
use crate::types::{DataType, Schema};
use crate::vector::{RecordBatch, Table};

#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Emit the pre-continuation framing (`[length]` with no marker).
    /// Readers accept both; this exists for old consumers.
    pub write_legacy_format: bool,
}

/// Frame a metadata buffer: prefix, metadata, zero padding so the body
/// starts 8-byte aligned.
pub(super) fn encode_frame(meta: &[u8], options: &WriterOptions) -> Vec<u8> {
    let prefix = if options.write_legacy_format { 4 } else { 8 };
    let padded_meta = round_to_8(prefix + meta.len()) - prefix;
    let mut out = Vec::with_capacity(prefix + padded_meta);
    if !options.write_legacy_format {
        out.extend_from_slice(&CONTINUATION.to_le_bytes());
    }
    out.extend_from_slice(&(padded_meta as i32).to_le_bytes());
    out.extend_from_slice(meta);
    out.resize(prefix + padded_meta, 0);
    out
}

pub(super) fn eos_frame(options: &WriterOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    if !options.write_legacy_format {
        out.extend_from_slice(&CONTINUATION.to_le_bytes());
    }
    out.extend_from_slice(&0i32.to_le_bytes());
    out
}

pub(super) fn encode_schema_message(schema: &Schema) -> Result<Vec<u8>, PlumeError> {
    encode_message(&Message { header: MessageHeader::Schema(schema.clone()), body_length: 0 })
}

pub(super) fn encode_batch_message(
    batch: &RecordBatch,
) -> Result<(Vec<u8>, Vec<u8>), PlumeError> {
    let mut asm = VectorAssembler::new();
    for column in batch.columns() {
        asm.push(column.data())?;
    }
    let (header, body) = asm.finish(batch.num_rows());
    let message = Message {
        header: MessageHeader::RecordBatch(header),
        body_length: body.len() as i64,
    };
    Ok((encode_message(&message)?, body))
}

pub(super) fn encode_dictionary_message(
    id: i64,
    data: &Arc<Data>,
    is_delta: bool,
) -> Result<(Vec<u8>, Vec<u8>), PlumeError> {
    let mut asm = VectorAssembler::new();
    asm.push(data)?;
    let (header, body) = asm.finish(data.len());
    let message = Message {
        header: MessageHeader::DictionaryBatch(DictionaryBatchHeader {
            id,
            data: header,
            is_delta,
        }),
        body_length: body.len() as i64,
    };
    Ok((encode_message(&message)?, body))
}

/// One pending dictionary emission: the vector to send and whether it is a
/// delta on an earlier batch.
pub(super) struct DictionaryUpdate {
    pub id: i64,
    pub data: Arc<Data>,
    pub is_delta: bool,
}

/// Tracks how much of each dictionary has been written so far, so repeated
/// batches against a growing dictionary ship only the new suffix.
#[derive(Default)]
pub(super) struct DictionaryTracker {
    written: BTreeMap<i64, usize>,
}

impl DictionaryTracker {
    /// Dictionary batches that must precede `batch` on the wire.
    pub(super) fn plan(
        &mut self,
        batch: &RecordBatch,
    ) -> Result<Vec<DictionaryUpdate>, PlumeError> {
        let mut updates = Vec::new();
        for column in batch.columns() {
            self.visit(column.data(), &mut updates)?;
        }
        Ok(updates)
    }

    fn visit(
        &mut self,
        data: &Arc<Data>,
        updates: &mut Vec<DictionaryUpdate>,
    ) -> Result<(), PlumeError> {
        if let DataType::Dictionary { id, .. } = data.data_type() {
            let id = *id;
            let dictionary = data.dictionary().ok_or_else(|| {
                PlumeError::InvalidError(format!(
                    "dictionary-encoded column for id {id} carries no dictionary"
                ))
            })?;
            self.visit(dictionary, updates)?;
            let len = dictionary.len();
            match self.written.get(&id).copied() {
                None => {
                    updates.push(DictionaryUpdate {
                        id,
                        data: dictionary.clone(),
                        is_delta: false,
                    });
                    self.written.insert(id, len);
                }
                Some(prev) if len < prev => {
                    return Err(PlumeError::ProtocolError(format!(
                        "dictionary id {id} shrank from {prev} to {len} values; \
                         dictionaries are append-only within a session"
                    )));
                }
                Some(prev) if len > prev => {
                    updates.push(DictionaryUpdate {
                        id,
                        data: Arc::new(dictionary.slice(prev, len - prev)),
                        is_delta: true,
                    });
                    self.written.insert(id, len);
                }
                Some(_) => {}
            }
        }
        for child in data.children() {
            self.visit(child, updates)?;
        }
        Ok(())
    }
}


pub struct StreamWriter<W: Write> {
    writer: W,
    schema: Arc<Schema>,
    options: WriterOptions,
    tracker: DictionaryTracker,
    finished: bool,
}

impl<W: Write> StreamWriter<W> {
    pub fn try_new(writer: W, schema: Arc<Schema>) -> Result<Self, PlumeError> {
        Self::with_options(writer, schema, WriterOptions::default())
    }

    pub fn with_options(
        mut writer: W,
        schema: Arc<Schema>,
        options: WriterOptions,
    ) -> Result<Self, PlumeError> {
        let meta = encode_schema_message(&schema)?;
        writer.write_all(&encode_frame(&meta, &options))?;
        Ok(Self {
            writer,
            schema,
            options,
            tracker: DictionaryTracker::default(),
            finished: false,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<(), PlumeError> {
        if self.finished {
            return Err(PlumeError::ProtocolError("write after finish".into()));
        }
        if batch.schema().fields != self.schema.fields {
            // Schema change starts a fresh logical stream: emit the new
            // schema and drop the dictionary bookkeeping of the old one.
            debug!("schema changed; resetting to a new stream section");
            self.schema = batch.schema().clone();
            self.tracker = DictionaryTracker::default();
            let meta = encode_schema_message(&self.schema)?;
            self.writer.write_all(&encode_frame(&meta, &self.options))?;
        }
        for update in self.tracker.plan(batch)? {
            let (meta, body) = encode_dictionary_message(update.id, &update.data, update.is_delta)?;
            self.writer.write_all(&encode_frame(&meta, &self.options))?;
            self.writer.write_all(&body)?;
        }
        let (meta, body) = encode_batch_message(batch)?;
        self.writer.write_all(&encode_frame(&meta, &self.options))?;
        self.writer.write_all(&body)?;
        Ok(())
    }

    pub fn write_table(&mut self, table: &Table) -> Result<(), PlumeError> {
        for batch in table.batches() {
            self.write(batch)?;
        }
        Ok(())
    }

    /// Terminate the stream with the end-of-stream marker and flush.
    pub fn finish(&mut self) -> Result<(), PlumeError> {
        if self.finished {
            return Ok(());
        }
        self.writer.write_all(&eos_frame(&self.options))?;
        self.writer.flush()?;
        self.finished = true;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub struct FileWriter<W: Write> {
    writer: W,
    schema: Arc<Schema>,
    options: WriterOptions,
    tracker: DictionaryTracker,
    position: usize,
    dictionary_blocks: Vec<Block>,
    record_blocks: Vec<Block>,
    finished: bool,
}

impl FileWriter<std::io::BufWriter<std::fs::File>> {
    pub fn create(path: impl AsRef<Path>, schema: Arc<Schema>) -> Result<Self, PlumeError> {
        let file = std::fs::File::create(path)?;
        Self::try_new(std::io::BufWriter::new(file), schema)
    }
}

impl<W: Write> FileWriter<W> {
    pub fn try_new(writer: W, schema: Arc<Schema>) -> Result<Self, PlumeError> {
        Self::with_options(writer, schema, WriterOptions::default())
    }

    pub fn with_options(
        mut writer: W,
        schema: Arc<Schema>,
        options: WriterOptions,
    ) -> Result<Self, PlumeError> {
        // 6-byte magic padded to 8 so the first message starts aligned.
        writer.write_all(FILE_MAGIC)?;
        writer.write_all(&[0, 0])?;
        let mut position = 8;
        let meta = encode_schema_message(&schema)?;
        let frame = encode_frame(&meta, &options);
        writer.write_all(&frame)?;
        position += frame.len();
        Ok(Self {
            writer,
            schema,
            options,
            tracker: DictionaryTracker::default(),
            position,
            dictionary_blocks: Vec::new(),
            record_blocks: Vec::new(),
            finished: false,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn write_block(&mut self, meta: &[u8], body: &[u8]) -> Result<Block, PlumeError> {
        let frame = encode_frame(meta, &self.options);
        let block = Block {
            offset: self.position as i64,
            meta_data_length: frame.len() as i32,
            body_length: body.len() as i64,
        };
        self.writer.write_all(&frame)?;
        self.writer.write_all(body)?;
        self.position += frame.len() + body.len();
        Ok(block)
    }

    pub fn write(&mut self, batch: &RecordBatch) -> Result<(), PlumeError> {
        if self.finished {
            return Err(PlumeError::ProtocolError("write after finish".into()));
        }
        if batch.schema().fields != self.schema.fields {
            // A file carries exactly one schema in its footer.
            return Err(PlumeError::SchemaConflict(
                "record batch schema differs from the file's schema".into(),
            ));
        }
        for update in self.tracker.plan(batch)? {
            let (meta, body) = encode_dictionary_message(update.id, &update.data, update.is_delta)?;
            let block = self.write_block(&meta, &body)?;
            self.dictionary_blocks.push(block);
        }
        let (meta, body) = encode_batch_message(batch)?;
        let block = self.write_block(&meta, &body)?;
        self.record_blocks.push(block);
        Ok(())
    }

    pub fn write_table(&mut self, table: &Table) -> Result<(), PlumeError> {
        for batch in table.batches() {
            self.write(batch)?;
        }
        Ok(())
    }

    /// Write the end-of-stream marker, the footer and the trailing magic.
    pub fn finish(&mut self) -> Result<(), PlumeError> {
        if self.finished {
            return Ok(());
        }
        self.writer.write_all(&eos_frame(&self.options))?;
        let footer = encode_footer(&Footer {
            schema: (*self.schema).clone(),
            dictionaries: std::mem::take(&mut self.dictionary_blocks),
            record_batches: std::mem::take(&mut self.record_blocks),
        })?;
        self.writer.write_all(&footer)?;
        self.writer.write_all(&(footer.len() as i32).to_le_bytes())?;
        self.writer.write_all(FILE_MAGIC)?;
        self.writer.flush()?;
        self.finished = true;
        debug!(bytes = self.position; "finished IPC file");
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_padding_keeps_body_aligned() {
        let options = WriterOptions::default();
        for meta_len in [1, 7, 8, 9, 24, 37] {
            let frame = encode_frame(&vec![0xABu8; meta_len], &options);
            assert_eq!(frame.len() % 8, 0);
            assert_eq!(&frame[..4], &CONTINUATION.to_le_bytes());
            let declared = i32::from_le_bytes(frame[4..8].try_into().unwrap()) as usize;
            assert_eq!(declared, frame.len() - 8);
        }
    }

    #[test]
    fn test_legacy_frame_has_no_marker() {
        let options = WriterOptions { write_legacy_format: true };
        let frame = encode_frame(&[1, 2, 3], &options);
        let declared = i32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - 4);
        assert_eq!(frame.len() % 8, 0);
    }

    #[test]
    fn test_eos_frames() {
        assert_eq!(eos_frame(&WriterOptions::default()), {
            let mut v = CONTINUATION.to_le_bytes().to_vec();
            v.extend_from_slice(&0i32.to_le_bytes());
            v
        });
        assert_eq!(eos_frame(&WriterOptions { write_legacy_format: true }), vec![0; 4]);
    }
}
