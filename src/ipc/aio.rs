//! Async counterparts of the stream reader and writer, over tokio I/O.
//! Framing and message handling are shared with the sync implementations;
//! only the byte transport differs.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::Buffer;
use crate::core::PlumeError;
use crate::ipc::reader::StreamState;
use crate::ipc::writer::{
    DictionaryTracker, WriterOptions, encode_batch_message, encode_dictionary_message,
    encode_frame, encode_schema_message, eos_frame,
};
use crate::ipc::CONTINUATION;
use crate::types::Schema;
use crate::vector::{RecordBatch, Table};

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, PlumeError> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut prefix[filled..]).await?;
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
        reader.read_exact(&mut len).await.map_err(truncated)?;
        i32::from_le_bytes(len)
    } else {
        first
    };
    if meta_len == 0 {
        return Ok(None);
    }
    if meta_len < 0 {
        return Err(PlumeError::FormatError(format!("negative metadata length {meta_len}")));
    }
    let mut meta = vec![0u8; meta_len as usize];
    reader.read_exact(&mut meta).await.map_err(truncated)?;
    Ok(Some(meta))
}

async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    body_length: i64,
) -> Result<Buffer, PlumeError> {
    if body_length < 0 {
        return Err(PlumeError::FormatError(format!("negative body length {body_length}")));
    }
    let mut body = vec![0u8; body_length as usize];
    reader.read_exact(&mut body).await.map_err(truncated)?;
    Ok(Buffer::from_vec(body))
}

fn truncated(e: std::io::Error) -> PlumeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PlumeError::FormatError("fewer bytes available than the message declared".into())
    } else {
        e.into()
    }
}

pub struct AsyncStreamReader<R: AsyncRead + Unpin> {
    reader: R,
    state: StreamState,
    schema: Arc<Schema>,
    done: bool,
}

impl<R: AsyncRead + Unpin> AsyncStreamReader<R> {
    pub async fn try_new(mut reader: R) -> Result<Self, PlumeError> {
        let mut state = StreamState::default();
        let meta = read_frame(&mut reader).await?.ok_or_else(|| {
            PlumeError::ProtocolError("stream ended before a schema message".into())
        })?;
        let message = state.decode(&meta)?;
        let body = read_body(&mut reader, message.body_length).await?;
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

    async fn step(&mut self) -> Result<Option<RecordBatch>, PlumeError> {
        loop {
            let meta = match read_frame(&mut self.reader).await? {
                None => return Ok(None),
                Some(meta) => meta,
            };
            let message = self.state.decode(&meta)?;
            let body = read_body(&mut self.reader, message.body_length).await?;
            if let Some(batch) = self.state.process(message, body)? {
                return Ok(Some(batch));
            }
        }
    }

    /// Next record batch, or `None` after the end of the stream.
    pub async fn next(&mut self) -> Option<Result<RecordBatch, PlumeError>> {
        if self.done {
            return None;
        }
        match self.step().await {
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

pub struct AsyncStreamWriter<W: AsyncWrite + Unpin> {
    writer: W,
    schema: Arc<Schema>,
    options: WriterOptions,
    tracker: DictionaryTracker,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> AsyncStreamWriter<W> {
    pub async fn try_new(writer: W, schema: Arc<Schema>) -> Result<Self, PlumeError> {
        Self::with_options(writer, schema, WriterOptions::default()).await
    }

    pub async fn with_options(
        mut writer: W,
        schema: Arc<Schema>,
        options: WriterOptions,
    ) -> Result<Self, PlumeError> {
        let meta = encode_schema_message(&schema)?;
        writer.write_all(&encode_frame(&meta, &options)).await?;
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

    pub async fn write(&mut self, batch: &RecordBatch) -> Result<(), PlumeError> {
        if self.finished {
            return Err(PlumeError::ProtocolError("write after finish".into()));
        }
        if batch.schema().fields != self.schema.fields {
            // Schema change starts a fresh logical stream: emit the new
            // schema and drop the dictionary bookkeeping of the old one.
            self.schema = batch.schema().clone();
            self.tracker = DictionaryTracker::default();
            let meta = encode_schema_message(&self.schema)?;
            self.writer.write_all(&encode_frame(&meta, &self.options)).await?;
        }
        for update in self.tracker.plan(batch)? {
            let (meta, body) = encode_dictionary_message(update.id, &update.data, update.is_delta)?;
            self.writer.write_all(&encode_frame(&meta, &self.options)).await?;
            self.writer.write_all(&body).await?;
        }
        let (meta, body) = encode_batch_message(batch)?;
        self.writer.write_all(&encode_frame(&meta, &self.options)).await?;
        self.writer.write_all(&body).await?;
        Ok(())
    }

    pub async fn write_table(&mut self, table: &Table) -> Result<(), PlumeError> {
        for batch in table.batches() {
            self.write(batch).await?;
        }
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<(), PlumeError> {
        if self.finished {
            return Ok(());
        }
        self.writer.write_all(&eos_frame(&self.options)).await?;
        self.writer.flush().await?;
        self.finished = true;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
