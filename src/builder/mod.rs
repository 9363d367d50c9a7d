mod chunked;

pub use chunked::{ChunkWatermark, Chunks};

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::buffer::{
    BitmapBuilder, Buffer, BufferBuilder, MAX_BUFFER_BYTES, OffsetsBuilder, round_to_alignment,
};
use crate::core::PlumeError;
use crate::data::{Buffers, Data};
use crate::types::{DataType, DateUnit, IntervalUnit, UnionMode};
use crate::value::Value;

/// Null-classification policy: values matching any sentinel (exact, with
/// NaN matching NaN) are written as null slots.
#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    pub null_values: Vec<Value>,
}

/// Fixed-width byte builder for arbitrary slot widths (decimals, fixed-size
/// binary, dictionary indices).
#[derive(Debug)]
struct FixedBuilder {
    width: usize,
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuilder {
    fn new(width: usize) -> Self {
        Self { width, buf: Vec::new(), len: 0 }
    }

    fn append_raw(&mut self, bytes: &[u8]) -> Result<(), PlumeError> {
        debug_assert_eq!(bytes.len(), self.width);
        if self.buf.len() + self.width > MAX_BUFFER_BYTES {
            return Err(PlumeError::CapacityError(format!(
                "values buffer would exceed the {MAX_BUFFER_BYTES} byte limit"
            )));
        }
        self.buf.extend_from_slice(bytes);
        self.len += 1;
        Ok(())
    }

    fn append_zeros(&mut self) -> Result<(), PlumeError> {
        if self.buf.len() + self.width > MAX_BUFFER_BYTES {
            return Err(PlumeError::CapacityError(format!(
                "values buffer would exceed the {MAX_BUFFER_BYTES} byte limit"
            )));
        }
        self.buf.resize(self.buf.len() + self.width, 0);
        self.len += 1;
        Ok(())
    }

    fn byte_len(&self) -> usize {
        self.buf.len()
    }

    fn flush(&mut self, rows: usize) -> Buffer {
        let byte_len = rows * self.width;
        self.buf.truncate(byte_len);
        self.buf.resize(round_to_alignment(byte_len), 0);
        self.len = 0;
        Buffer::from_vec(std::mem::take(&mut self.buf)).slice(0, byte_len)
    }
}

/// Variable-width byte sink for utf8/binary payloads.
#[derive(Debug, Default)]
struct VarBuilder {
    buf: Vec<u8>,
}

impl VarBuilder {
    fn append(&mut self, bytes: &[u8]) -> Result<(), PlumeError> {
        if self.buf.len() + bytes.len() > MAX_BUFFER_BYTES {
            return Err(PlumeError::CapacityError(format!(
                "variable-width buffer would exceed the {MAX_BUFFER_BYTES} byte limit"
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn byte_len(&self) -> usize {
        self.buf.len()
    }

    /// Trim to exactly `data_len` payload bytes (the final end offset).
    fn flush(&mut self, data_len: usize) -> Buffer {
        self.buf.truncate(data_len);
        self.buf.resize(round_to_alignment(data_len), 0);
        Buffer::from_vec(std::mem::take(&mut self.buf)).slice(0, data_len)
    }
}

/// Accumulated dictionary state: insertion-ordered values plus a hash index
/// for O(1) key lookup. Survives `flush` so later chunks keep referencing
/// earlier entries (delta semantics on the wire).
#[derive(Debug, Default)]
struct DictionaryState {
    entries: Vec<Value>,
    index: ahash::AHashMap<u64, Vec<usize>>,
}

impl DictionaryState {
    fn intern(&mut self, value: Value) -> usize {
        let key = hash_value(&value);
        if let Some(candidates) = self.index.get(&key) {
            for &i in candidates {
                if self.entries[i].sentinel_eq(&value) {
                    return i;
                }
            }
        }
        let i = self.entries.len();
        self.entries.push(value);
        self.index.entry(key).or_default().push(i);
        i
    }
}

// Runs once per appended dictionary value, so it uses the fast non-keyed
// hasher rather than the collision-resistant std default.
fn hash_value(value: &Value) -> u64 {
    let mut h = ahash::AHasher::default();
    std::mem::discriminant(value).hash(&mut h);
    match value {
        Value::Utf8(s) => s.hash(&mut h),
        Value::Binary(b) | Value::FixedSizeBinary(b) => b.hash(&mut h),
        Value::Int8(v) => v.hash(&mut h),
        Value::Int16(v) => v.hash(&mut h),
        Value::Int32(v) => v.hash(&mut h),
        Value::Int64(v) => v.hash(&mut h),
        Value::UInt8(v) => v.hash(&mut h),
        Value::UInt16(v) => v.hash(&mut h),
        Value::UInt32(v) => v.hash(&mut h),
        Value::UInt64(v) => v.hash(&mut h),
        Value::Bool(v) => v.hash(&mut h),
        Value::Float32(v) => v.to_bits().hash(&mut h),
        Value::Float64(v) => v.to_bits().hash(&mut h),
        Value::Decimal(v) => v.hash(&mut h),
        // Rare dictionary value types fall back to collision buckets.
        _ => {}
    }
    h.finish()
}

/// Per-type incremental constructor producing a `Data` on flush. The Set
/// surface of the type-dispatch engine lives in `write_value`.
#[derive(Debug)]
pub struct Builder {
    data_type: DataType,
    options: BuilderOptions,
    len: usize,
    finished: bool,
    validity: BitmapBuilder,
    bits: BitmapBuilder,
    fixed: Option<FixedBuilder>,
    var: VarBuilder,
    offsets: OffsetsBuilder,
    type_ids: BufferBuilder<i8>,
    union_offsets: BufferBuilder<i32>,
    children: Vec<Builder>,
    dictionary: Option<DictionaryState>,
}

impl Builder {
    pub fn new(data_type: DataType) -> Self {
        Self::with_options(data_type, BuilderOptions::default())
    }

    pub fn with_options(data_type: DataType, options: BuilderOptions) -> Self {
        let children = data_type
            .children()
            .iter()
            .map(|f| Builder::with_options(f.data_type.clone(), options.clone()))
            .collect();
        let fixed = match &data_type {
            DataType::Bool => None,
            DataType::Dictionary { index, .. } => index.fixed_byte_width().map(FixedBuilder::new),
            other => other.fixed_byte_width().map(FixedBuilder::new),
        };
        let dictionary =
            matches!(data_type, DataType::Dictionary { .. }).then(DictionaryState::default);
        Self {
            data_type,
            options,
            len: 0,
            finished: false,
            validity: BitmapBuilder::new(),
            bits: BitmapBuilder::new(),
            fixed,
            var: VarBuilder::default(),
            offsets: OffsetsBuilder::new(),
            type_ids: BufferBuilder::new(),
            union_offsets: BufferBuilder::new(),
            children,
            dictionary,
        }
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Approximate accumulated payload bytes, for chunking watermarks.
    pub fn byte_len(&self) -> usize {
        let own = self.fixed.as_ref().map(|f| f.byte_len()).unwrap_or(0)
            + self.var.byte_len()
            + self.offsets.len() * 4
            + self.len / 8;
        own + self.children.iter().map(|c| c.byte_len()).sum::<usize>()
    }

    pub fn append(&mut self, value: Value) -> Result<(), PlumeError> {
        let i = self.len;
        self.set(i, value)
    }

    pub fn append_null(&mut self) -> Result<(), PlumeError> {
        self.append(Value::Null)
    }

    pub fn append_option(&mut self, value: Option<Value>) -> Result<(), PlumeError> {
        self.append(value.unwrap_or(Value::Null))
    }

    /// Write slot `i`, backfilling any gap with nulls. Rewriting an already
    /// written slot is not supported.
    pub fn set(&mut self, i: usize, value: Value) -> Result<(), PlumeError> {
        if self.finished {
            return Err(PlumeError::ProtocolError(
                "cannot append to a finished builder".into(),
            ));
        }
        if i < self.len {
            return Err(PlumeError::InvalidError(format!(
                "slot {i} already written (builder length {})",
                self.len
            )));
        }
        while self.len < i {
            self.write_slot(Value::Null)?;
        }
        self.write_slot(value)
    }

    fn write_slot(&mut self, value: Value) -> Result<(), PlumeError> {
        let is_null = value.is_null()
            || self.options.null_values.iter().any(|s| s.sentinel_eq(&value));
        if is_null {
            self.write_null()?;
        } else {
            self.validity.append(true);
            self.write_value(value)?;
        }
        self.len += 1;
        Ok(())
    }

    fn write_null(&mut self) -> Result<(), PlumeError> {
        self.validity.append(false);
        match &self.data_type.clone() {
            DataType::Null => {}
            DataType::Bool => self.bits.append(false),
            DataType::Utf8 | DataType::Binary => self.offsets.append_length(0)?,
            DataType::List(_) | DataType::Map(_, _) => self.offsets.append_length(0)?,
            DataType::FixedSizeList(n, _) => {
                for _ in 0..*n {
                    self.children[0].append(Value::Null)?;
                }
            }
            DataType::Struct(_) => {
                for child in &mut self.children {
                    child.append(Value::Null)?;
                }
            }
            DataType::Union(mode, type_ids, _) => {
                // Unions carry no validity bitmap; a null writes through the
                // first child so the slot decodes as a null of that type.
                self.validity.set(self.len, true);
                let tid = type_ids.first().copied().unwrap_or(0);
                self.type_ids.append(tid)?;
                match mode {
                    UnionMode::Dense => {
                        let pos = self.children[0].len() as i32;
                        self.union_offsets.append(pos)?;
                        self.children[0].append(Value::Null)?;
                    }
                    UnionMode::Sparse => {
                        for child in &mut self.children {
                            child.append(Value::Null)?;
                        }
                    }
                }
            }
            _ => {
                // Fixed-width placeholder.
                self.fixed.as_mut().expect("fixed builder").append_zeros()?;
            }
        }
        Ok(())
    }

    fn write_value(&mut self, value: Value) -> Result<(), PlumeError> {
        let mismatch = |dt: &DataType, v: &Value| {
            PlumeError::InvalidError(format!("cannot write {v:?} into a {dt:?} builder"))
        };
        match (&self.data_type.clone(), value) {
            (DataType::Null, _) => {
                // Every slot of a Null column is null; record it as such.
                self.validity.set(self.len, false);
            }
            (DataType::Bool, Value::Bool(v)) => self.bits.append(v),
            (DataType::Int8, Value::Int8(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Int16, Value::Int16(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Int32, Value::Int32(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Int64, Value::Int64(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::UInt8, Value::UInt8(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::UInt16, Value::UInt16(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::UInt32, Value::UInt32(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::UInt64, Value::UInt64(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Float16, Value::Float16(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Float32, Value::Float32(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Float64, Value::Float64(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Decimal { bit_width, .. }, Value::Decimal(v)) => {
                let bytes = v.to_le_bytes();
                let width = *bit_width as usize / 8;
                self.append_le(&bytes[..width])?;
            }
            (DataType::Date(DateUnit::Day), Value::Date32(v)) => {
                self.append_le(&v.to_le_bytes())?
            }
            (DataType::Date(DateUnit::Millisecond), Value::Date64(v)) => {
                self.append_le(&v.to_le_bytes())?
            }
            (DataType::Time32(_), Value::Time32(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Time64(_), Value::Time64(v)) => self.append_le(&v.to_le_bytes())?,
            (DataType::Timestamp(_, _), Value::Timestamp(v)) => {
                self.append_le(&v.to_le_bytes())?
            }
            (DataType::Interval(IntervalUnit::YearMonth), Value::IntervalYearMonth(v)) => {
                self.append_le(&v.to_le_bytes())?
            }
            (DataType::Interval(IntervalUnit::DayTime), Value::IntervalDayTime { days, millis }) => {
                let mut bytes = [0u8; 8];
                bytes[..4].copy_from_slice(&days.to_le_bytes());
                bytes[4..].copy_from_slice(&millis.to_le_bytes());
                self.append_le(&bytes)?;
            }
            (
                DataType::Interval(IntervalUnit::MonthDayNano),
                Value::IntervalMonthDayNano { months, days, nanos },
            ) => {
                let mut bytes = [0u8; 16];
                bytes[..4].copy_from_slice(&months.to_le_bytes());
                bytes[4..8].copy_from_slice(&days.to_le_bytes());
                bytes[8..].copy_from_slice(&nanos.to_le_bytes());
                self.append_le(&bytes)?;
            }
            (DataType::Utf8, Value::Utf8(s)) => {
                self.offsets.append_length(s.len())?;
                self.var.append(s.as_bytes())?;
            }
            (DataType::Binary, Value::Binary(b)) => {
                self.offsets.append_length(b.len())?;
                self.var.append(&b)?;
            }
            (DataType::FixedSizeBinary(w), Value::FixedSizeBinary(b)) => {
                if b.len() != *w as usize {
                    return Err(PlumeError::InvalidError(format!(
                        "fixed-size binary of {} bytes in a width-{w} column",
                        b.len()
                    )));
                }
                self.append_le(&b)?;
            }
            (DataType::List(_), Value::List(items)) => {
                self.offsets.append_length(items.len())?;
                for item in items {
                    self.children[0].append(item)?;
                }
            }
            (DataType::FixedSizeList(n, _), Value::List(items)) => {
                if items.len() != *n as usize {
                    return Err(PlumeError::InvalidError(format!(
                        "{} items in a fixed-size list of {n}",
                        items.len()
                    )));
                }
                for item in items {
                    self.children[0].append(item)?;
                }
            }
            (DataType::Struct(fields), Value::Struct(items)) => {
                if items.len() != fields.len() {
                    return Err(PlumeError::InvalidError(format!(
                        "{} values for a struct of {} fields",
                        items.len(),
                        fields.len()
                    )));
                }
                for (child, item) in self.children.iter_mut().zip(items) {
                    child.append(item)?;
                }
            }
            (DataType::Map(_, _), Value::Map(pairs)) => {
                self.offsets.append_length(pairs.len())?;
                for (k, v) in pairs {
                    self.children[0].append(Value::Struct(vec![k, v]))?;
                }
            }
            (DataType::Union(mode, type_ids, _), Value::Union(tid, inner)) => {
                let child_idx = type_ids.iter().position(|t| *t == tid).ok_or_else(|| {
                    PlumeError::InvalidError(format!("unknown union type id {tid}"))
                })?;
                self.type_ids.append(tid)?;
                match mode {
                    UnionMode::Dense => {
                        let pos = self.children[child_idx].len() as i32;
                        self.union_offsets.append(pos)?;
                        self.children[child_idx].append(*inner)?;
                    }
                    UnionMode::Sparse => {
                        for (i, child) in self.children.iter_mut().enumerate() {
                            if i == child_idx {
                                child.append((*inner).clone())?;
                            } else {
                                child.append(Value::Null)?;
                            }
                        }
                    }
                }
            }
            (DataType::Dictionary { index, .. }, value) => {
                let state = self.dictionary.as_mut().expect("dictionary state");
                let key = state.intern(value);
                let width = index.fixed_byte_width().unwrap_or(4);
                let bytes = (key as u64).to_le_bytes();
                let fixed = self.fixed.as_mut().expect("index builder");
                fixed.append_raw(&bytes[..width])?;
            }
            (dt, v) => return Err(mismatch(dt, &v)),
        }
        Ok(())
    }

    fn append_le(&mut self, bytes: &[u8]) -> Result<(), PlumeError> {
        self.fixed.as_mut().expect("fixed builder").append_raw(bytes)
    }

    /// Produce a `Data` for everything appended since the last flush and
    /// reset. Buffer emission per type: unions emit TYPE (+OFFSET when
    /// dense); variable-width types emit OFFSET then trimmed DATA;
    /// fixed-width types emit DATA only. The validity buffer is emitted only
    /// when at least one slot is null.
    pub fn flush(&mut self) -> Result<Data, PlumeError> {
        let rows = self.len;
        let (validity_buf, null_count) = self.validity.flush(rows);
        let validity = (null_count > 0).then_some(validity_buf);

        let mut buffers = Buffers::default();
        let mut children: Vec<Arc<Data>> = Vec::new();
        let mut dictionary = None;

        match &self.data_type.clone() {
            DataType::Null => {}
            DataType::Bool => {
                buffers.validity = validity;
                let (bits, _) = self.bits.flush(rows);
                buffers.values = Some(bits);
            }
            DataType::Utf8 | DataType::Binary => {
                buffers.validity = validity;
                let data_len = self.offsets.last() as usize;
                buffers.offsets = Some(self.offsets.flush(rows));
                buffers.values = Some(self.var.flush(data_len));
            }
            DataType::List(_) | DataType::Map(_, _) => {
                buffers.validity = validity;
                buffers.offsets = Some(self.offsets.flush(rows));
                children.push(Arc::new(self.children[0].flush()?));
            }
            DataType::FixedSizeList(_, _) | DataType::Struct(_) => {
                buffers.validity = validity;
                for child in &mut self.children {
                    children.push(Arc::new(child.flush()?));
                }
            }
            DataType::Union(mode, _, _) => {
                buffers.type_ids = Some(self.type_ids.flush(rows));
                if *mode == UnionMode::Dense {
                    buffers.offsets = Some(self.union_offsets.flush(rows));
                }
                for child in &mut self.children {
                    children.push(Arc::new(child.flush()?));
                }
            }
            DataType::Dictionary { value, .. } => {
                buffers.validity = validity;
                buffers.values = Some(self.fixed.as_mut().expect("index builder").flush(rows));
                // Emit the full dictionary accumulated so far; the state is
                // kept so later chunks extend it (delta semantics).
                let mut dict_builder = Builder::new((**value).clone());
                for entry in &self.dictionary.as_ref().expect("dictionary state").entries {
                    dict_builder.append(entry.clone())?;
                }
                dictionary = Some(Arc::new(dict_builder.flush()?));
            }
            _ => {
                buffers.validity = validity;
                buffers.values = Some(self.fixed.as_mut().expect("fixed builder").flush(rows));
            }
        }

        self.len = 0;
        let explicit_nulls =
            if self.data_type == DataType::Null { Some(rows) } else { Some(null_count) };
        Data::try_new(
            self.data_type.clone(),
            rows,
            0,
            buffers,
            children,
            dictionary,
            explicit_nulls,
        )
    }

    /// Terminate writes on this builder and its children. Idempotent; does
    /// not flush.
    pub fn finish(&mut self) {
        self.finished = true;
        for child in &mut self.children {
            child.finish();
        }
    }
}
