//! Stream and file readers.
//!
//! The stream reader is a pull iterator over an encapsulated message
//! sequence: one schema message, then dictionary batches and record batches
//! in any interleaving, then an end-of-stream marker. Both the current
//! framing (`[-1][length]`) and the legacy pre-continuation framing
//! (`[length]`) are accepted; writers only emit legacy framing on request.
//!
//! The file reader maps the whole file and serves random access through the
//! footer's block index. Dictionaries are materialized eagerly at open so
//! `batch(i)` needs no ordering.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::buffer::Buffer;
use crate::builder::Builder;
use crate::core::PlumeError;
use crate::data::Data;
use crate::ipc::footer::{Block, decode_footer};
use crate::ipc::loader::{load_dictionary_vector, load_record_batch};
use crate::ipc::message::{DictionaryBatchHeader, Message, MessageHeader, decode_message};
use crate::ipc::{CONTINUATION, Dictionaries, DictionaryMemo, FILE_MAGIC};
use crate::types::{DataType, Schema};
use crate::value::Value;
use crate::vector::{RecordBatch, Vector};

/// Append `delta`'s values after `base`'s, producing the combined
/// dictionary. Deltas are value-level, so this re-encodes through a builder
/// rather than splicing buffers.
fn concat_dictionary(
    value_type: &DataType,
    base: &Arc<Data>,
    delta: &Arc<Data>,
) -> Result<Arc<Data>, PlumeError> {
    let mut builder = Builder::new(value_type.clone());
    for part in [base, delta] {
        for value in Vector::new((*part).clone()).iter() {
            match value {
                Value::Null => builder.append_null()?,
                other => builder.append(other)?,
            }
        }
    }
    Ok(Arc::new(builder.flush()?))
}

/// Materialize one dictionary batch into the session's dictionary map.
/// Deltas append to the existing entry; a non-delta re-send replaces it.
pub(super) fn apply_dictionary_batch(
    header: &DictionaryBatchHeader,
    body: Buffer,
    memo: &DictionaryMemo,
    dictionaries: &mut Dictionaries,
) -> Result<(), PlumeError> {
    let value_type = memo.value_type(header.id).ok_or_else(|| {
        PlumeError::ProtocolError(format!(
            "dictionary batch for id {} which no schema field declares",
            header.id
        ))
    })?;
    let data = load_dictionary_vector(value_type, &header.data, body)?;
    match dictionaries.get(&header.id) {
        Some(existing) if header.is_delta => {
            debug!(id = header.id, delta_len = data.len(); "appending dictionary delta");
            let combined = concat_dictionary(value_type, existing, &data)?;
            dictionaries.insert(header.id, combined);
        }
        _ if header.is_delta => {
            return Err(PlumeError::ProtocolError(format!(
                "delta for dictionary id {} arrived before its base batch",
                header.id
            )));
        }
        _ => {
            dictionaries.insert(header.id, data);
        }
    }
    Ok(())
}

fn empty_batch(schema: &Arc<Schema>) -> Result<RecordBatch, PlumeError> {
    let columns = schema
        .fields
        .iter()
        .map(|f| Vector::from_data(Data::new_null(&f.data_type, 0)))
        .collect();
    RecordBatch::try_new(schema.clone(), columns)
}

/// Message-sequence state shared by the sync and async stream readers:
/// schema-first enforcement, dictionary materialization, and the synthetic
/// empty batch for schema-only streams.
#[derive(Debug, Default)]
pub(super) struct StreamState {
    schema: Option<Arc<Schema>>,
    memo: DictionaryMemo,
    dictionaries: Dictionaries,
    produced: bool,
}

impl StreamState {
    pub(super) fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    pub(super) fn decode(&self, meta: &[u8]) -> Result<Message, PlumeError> {
        // Intra-schema dictionary-id consistency is enforced within the
        // decode; cross-message state lives in `self.memo`, rebuilt per
        // schema below.
        decode_message(meta, &mut DictionaryMemo::new())
    }

    pub(super) fn process(
        &mut self,
        message: Message,
        body: Buffer,
    ) -> Result<Option<RecordBatch>, PlumeError> {
        match message.header {
            MessageHeader::Schema(schema) => {
                if self.schema.is_some() {
                    // A new schema mid-stream starts a fresh logical stream:
                    // dictionary state from the previous one is dropped.
                    debug!("schema message mid-stream; resetting session state");
                    self.dictionaries.clear();
                }
                self.memo = DictionaryMemo::new();
                for (id, value_type) in schema.dictionaries() {
                    self.memo.bind(*id, value_type)?;
                }
                self.schema = Some(Arc::new(schema));
                Ok(None)
            }
            MessageHeader::DictionaryBatch(header) => {
                if self.schema.is_none() {
                    return Err(PlumeError::ProtocolError(
                        "dictionary batch before the schema message".into(),
                    ));
                }
                apply_dictionary_batch(&header, body, &self.memo, &mut self.dictionaries)?;
                Ok(None)
            }
            MessageHeader::RecordBatch(header) => {
                let schema = self.schema.as_ref().ok_or_else(|| {
                    PlumeError::ProtocolError("record batch before the schema message".into())
                })?;
                let batch = load_record_batch(schema, &header, body, &self.dictionaries)?;
                self.produced = true;
                Ok(Some(batch))
            }
        }
    }

    /// Called once at end of stream. A stream that carried a schema but no
    /// record batches yields one empty batch so consumers still observe the
    /// schema's shape.
    pub(super) fn at_end(&mut self) -> Option<Result<RecordBatch, PlumeError>> {
        if self.produced {
            return None;
        }
        self.produced = true;
        self.schema.as_ref().map(empty_batch)
    }
}

/// Read the next metadata frame. `Ok(None)` on a clean end: either an
/// explicit end-of-stream marker or EOF on a frame boundary.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, PlumeError> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut prefix[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(PlumeError::FormatError("stream truncated inside framing".into()));
        }
        filled += n;
    }
    let first = i32::from_le_bytes(prefix);
    let meta_len = if first == CONTINUATION {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).map_err(truncated)?;
        i32::from_le_bytes(len)
    } else {
        // Legacy framing: the length arrives bare.
        first
    };
    if meta_len == 0 {
        return Ok(None);
    }
    if meta_len < 0 {
        return Err(PlumeError::FormatError(format!("negative metadata length {meta_len}")));
    }
    let mut meta = vec![0u8; meta_len as usize];
    reader.read_exact(&mut meta).map_err(truncated)?;
    Ok(Some(meta))
}

fn read_body<R: Read>(reader: &mut R, body_length: i64) -> Result<Buffer, PlumeError> {
    if body_length < 0 {
        return Err(PlumeError::FormatError(format!("negative body length {body_length}")));
    }
    let mut body = vec![0u8; body_length as usize];
    reader.read_exact(&mut body).map_err(truncated)?;
    Ok(Buffer::from_vec(body))
}

fn truncated(e: std::io::Error) -> PlumeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PlumeError::FormatError("fewer bytes available than the message declared".into())
    } else {
        e.into()
    }
}

#[derive(Debug)]
pub struct StreamReader<R: Read> {
    reader: R,
    state: StreamState,
    schema: Arc<Schema>,
    done: bool,
}

impl<R: Read> StreamReader<R> {
    /// Consume the leading schema message. Anything else first is a
    /// `ProtocolError`.
    pub fn try_new(mut reader: R) -> Result<Self, PlumeError> {
        let mut state = StreamState::default();
        let meta = read_frame(&mut reader)?.ok_or_else(|| {
            PlumeError::ProtocolError("stream ended before a schema message".into())
        })?;
        let message = state.decode(&meta)?;
        let body = read_body(&mut reader, message.body_length)?;
        if state.process(message, body)?.is_some() || state.schema().is_none() {
            return Err(PlumeError::ProtocolError(
                "stream must begin with a schema message".into(),
            ));
        }
        let schema = state.schema().cloned().ok_or_else(|| {
            PlumeError::ProtocolError("stream must begin with a schema message".into())
        })?;
        Ok(Self { reader, state, schema, done: false })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn step(&mut self) -> Result<Option<RecordBatch>, PlumeError> {
        loop {
            let meta = match read_frame(&mut self.reader)? {
                None => return Ok(None),
                Some(meta) => meta,
            };
            let message = self.state.decode(&meta)?;
            let body = read_body(&mut self.reader, message.body_length)?;
            if let Some(batch) = self.state.process(message, body)? {
                return Ok(Some(batch));
            }
        }
    }
}

impl<R: Read> Iterator for StreamReader<R> {
    type Item = Result<RecordBatch, PlumeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                self.state.at_end()
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Little-endian i32 at `at`, bounds checked.
fn read_i32(bytes: &[u8], at: usize) -> Result<i32, PlumeError> {
    let end = at + 4;
    if end > bytes.len() {
        return Err(PlumeError::FormatError(format!(
            "need 4 bytes at offset {at}, only {} available",
            bytes.len()
        )));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..end]);
    Ok(i32::from_le_bytes(raw))
}

/// Parse the framed message starting at `offset` in `buf`, returning the
/// message and its body slice.
fn message_at(
    buf: &Buffer,
    offset: usize,
    memo: &mut DictionaryMemo,
) -> Result<(Message, Buffer), PlumeError> {
    let bytes = buf.as_slice();
    let first = read_i32(bytes, offset)?;
    let (meta_len, meta_start) = if first == CONTINUATION {
        (read_i32(bytes, offset + 4)?, offset + 8)
    } else {
        (first, offset + 4)
    };
    if meta_len <= 0 {
        return Err(PlumeError::FormatError(format!(
            "invalid metadata length {meta_len} at file offset {offset}"
        )));
    }
    let meta_len = meta_len as usize;
    let meta = bytes.get(meta_start..meta_start + meta_len).ok_or_else(|| {
        PlumeError::FormatError(format!("message metadata at {meta_start} extends past the file"))
    })?;
    let message = decode_message(meta, memo)?;
    if message.body_length < 0 {
        return Err(PlumeError::FormatError(format!(
            "negative body length {}",
            message.body_length
        )));
    }
    let body_start = meta_start + meta_len;
    let body_len = message.body_length as usize;
    if body_start + body_len > buf.len() {
        return Err(PlumeError::FormatError(format!(
            "message body at {body_start} extends past the file"
        )));
    }
    let body = buf.slice(body_start, body_len);
    Ok((message, body))
}

/// Random-access reader over a complete IPC file.
#[derive(Debug)]
pub struct FileReader {
    buf: Buffer,
    schema: Arc<Schema>,
    blocks: Vec<Block>,
    dictionaries: Dictionaries,
    cursor: usize,
}

impl FileReader {
    /// Memory-map `path` and parse its footer.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PlumeError> {
        let file = std::fs::File::open(path)?;
        // The mapping assumes the file is not truncated while open.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Self::from_bytes(Bytes::from_owner(mmap))
    }

    /// Parse an in-memory IPC file. This is also the async entry point:
    /// read the file with `tokio::fs` and hand the bytes over.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PlumeError> {
        let buf = Buffer::from_bytes(bytes);
        let len = buf.len();
        if len < 8 + 4 + FILE_MAGIC.len() {
            return Err(PlumeError::FormatError(format!("{len} bytes is too short for an IPC file")));
        }
        let bytes = buf.as_slice();
        if &bytes[..FILE_MAGIC.len()] != FILE_MAGIC {
            return Err(PlumeError::FormatError("leading file magic missing".into()));
        }
        if &bytes[len - FILE_MAGIC.len()..] != FILE_MAGIC {
            return Err(PlumeError::FormatError("trailing file magic missing".into()));
        }
        let footer_end = len - FILE_MAGIC.len() - 4;
        let footer_len = read_i32(bytes, footer_end)?;
        if footer_len <= 0 || footer_len as usize > footer_end - 8 {
            return Err(PlumeError::FormatError(format!("invalid footer length {footer_len}")));
        }
        let footer_bytes = &bytes[footer_end - footer_len as usize..footer_end];
        let mut memo = DictionaryMemo::new();
        let footer = decode_footer(footer_bytes, &mut memo)?;
        debug!(
            batches = footer.record_batches.len(),
            dictionaries = footer.dictionaries.len();
            "opened IPC file"
        );

        let mut dictionaries = Dictionaries::new();
        for block in &footer.dictionaries {
            let (message, body) = message_at(&buf, block.offset as usize, &mut memo)?;
            match message.header {
                MessageHeader::DictionaryBatch(header) => {
                    apply_dictionary_batch(&header, body, &memo, &mut dictionaries)?;
                }
                other => {
                    return Err(PlumeError::FormatError(format!(
                        "dictionary block points at a {} message",
                        header_name(&other)
                    )));
                }
            }
        }

        Ok(Self {
            buf,
            schema: Arc::new(footer.schema),
            blocks: footer.record_batches,
            dictionaries,
            cursor: 0,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn num_batches(&self) -> usize {
        self.blocks.len()
    }

    /// Decode record batch `i` directly from its block, independent of any
    /// batches before it.
    pub fn batch(&self, i: usize) -> Result<RecordBatch, PlumeError> {
        let block = self.blocks.get(i).ok_or_else(|| {
            PlumeError::InvalidError(format!(
                "batch index {i} out of range for a file of {} batches",
                self.blocks.len()
            ))
        })?;
        // Dictionary ids were bound while decoding the footer schema; batch
        // headers bind nothing new.
        let mut memo = DictionaryMemo::new();
        let (message, body) = message_at(&self.buf, block.offset as usize, &mut memo)?;
        match message.header {
            MessageHeader::RecordBatch(header) => {
                load_record_batch(&self.schema, &header, body, &self.dictionaries)
            }
            other => Err(PlumeError::FormatError(format!(
                "record batch block points at a {} message",
                header_name(&other)
            ))),
        }
    }
}

impl Iterator for FileReader {
    type Item = Result<RecordBatch, PlumeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.blocks.len() {
            return None;
        }
        let batch = self.batch(self.cursor);
        self.cursor += 1;
        Some(batch)
    }
}

fn header_name(header: &MessageHeader) -> &'static str {
    match header {
        MessageHeader::Schema(_) => "schema",
        MessageHeader::RecordBatch(_) => "record batch",
        MessageHeader::DictionaryBatch(_) => "dictionary batch",
    }
}
