use std::marker::PhantomData;

use crate::buffer::{
    Buffer, MAX_BUFFER_BYTES, Native, ceil_div, get_bit, round_to_alignment, set_bit,
};
use crate::core::PlumeError;

/// Growable typed buffer. `len` counts logical rows and is distinct from the
/// physical capacity; `reserve` grows by doubling rounded up to an aligned
/// element count so appends are amortized O(1).
#[derive(Debug)]
pub struct BufferBuilder<T: Native> {
    buf: Vec<u8>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Native> Default for BufferBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Native> BufferBuilder<T> {
    pub fn new() -> Self {
        Self { buf: Vec::new(), len: 0, _marker: PhantomData }
    }

    pub fn with_capacity(rows: usize) -> Self {
        Self { buf: Vec::with_capacity(round_to_alignment(rows * T::WIDTH)), len: 0, _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * T::WIDTH
    }

    /// Ensure capacity for `extra` more rows.
    pub fn reserve(&mut self, extra: usize) -> Result<(), PlumeError> {
        let needed = (self.len + extra) * T::WIDTH;
        if needed > MAX_BUFFER_BYTES {
            return Err(PlumeError::CapacityError(format!(
                "buffer of {needed} bytes exceeds the {MAX_BUFFER_BYTES} byte limit"
            )));
        }
        if needed > self.buf.capacity() {
            let target = round_to_alignment(needed.max(self.buf.capacity() * 2));
            self.buf.reserve(target - self.buf.len());
        }
        Ok(())
    }

    pub fn append(&mut self, value: T) -> Result<(), PlumeError> {
        self.reserve(1)?;
        value.put_le(&mut self.buf);
        self.len += 1;
        Ok(())
    }

    /// Write `value` at row `i`, zero-filling any gap.
    pub fn set(&mut self, i: usize, value: T) -> Result<(), PlumeError> {
        if i >= self.len {
            self.reserve(i + 1 - self.len)?;
            self.buf.resize((i + 1) * T::WIDTH, 0);
            self.len = i + 1;
        }
        let mut scratch = Vec::with_capacity(T::WIDTH);
        value.put_le(&mut scratch);
        self.buf[i * T::WIDTH..(i + 1) * T::WIDTH].copy_from_slice(&scratch);
        Ok(())
    }

    pub fn get(&self, i: usize) -> T {
        T::from_le_slice(&self.buf[i * T::WIDTH..])
    }

    /// Return a buffer holding exactly `rows` rows (64-byte rounded, zero
    /// padded) and reset the builder. The returned buffer is immutable; this
    /// is the sole mutation boundary.
    pub fn flush(&mut self, rows: usize) -> Buffer {
        let byte_len = rows * T::WIDTH;
        self.buf.truncate(byte_len);
        self.buf.resize(round_to_alignment(byte_len), 0);
        self.len = 0;
        Buffer::from_vec(std::mem::take(&mut self.buf)).slice(0, byte_len)
    }
}

/// Offsets buffer for variable-width types. Maintains the leading zero and
/// one monotone end offset per row.
#[derive(Debug)]
pub struct OffsetsBuilder {
    inner: BufferBuilder<i32>,
    last: i32,
}

impl Default for OffsetsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetsBuilder {
    pub fn new() -> Self {
        Self { inner: BufferBuilder::new(), last: 0 }
    }

    /// Number of logical rows (one fewer than physical offsets once the
    /// leading zero is materialized).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// End offset of the last appended row.
    pub fn last(&self) -> i32 {
        self.last
    }

    /// Close row `i` with `length` more value slots. Rows skipped between the
    /// current end and `i` are backfilled as empty (offset unchanged).
    pub fn set_length(&mut self, i: usize, length: usize) -> Result<(), PlumeError> {
        while self.inner.len() < i {
            let last = self.last;
            self.inner.append(last)?;
        }
        let end = self.last as i64 + length as i64;
        if end > i32::MAX as i64 {
            return Err(PlumeError::CapacityError(format!(
                "variable-width data of {end} bytes exceeds the i32 offset range"
            )));
        }
        self.last = end as i32;
        self.inner.set(i, self.last)?;
        Ok(())
    }

    pub fn append_length(&mut self, length: usize) -> Result<(), PlumeError> {
        let i = self.inner.len();
        self.set_length(i, length)
    }

    /// Flush `rows + 1` offsets: a leading zero, then one end offset per row,
    /// backfilling skipped rows with the running end offset.
    pub fn flush(&mut self, rows: usize) -> Buffer {
        let mut out = BufferBuilder::<i32>::with_capacity(rows + 1);
        // The leading zero.
        let _ = out.append(0);
        for i in 0..rows {
            let v = if i < self.inner.len() { self.inner.get(i) } else { self.last };
            let _ = out.append(v);
        }
        self.inner = BufferBuilder::new();
        self.last = 0;
        out.flush(rows + 1)
    }
}

/// Bit-packed validity builder. Tracks the number of valid slots
/// incrementally so null counts never need a popcount here.
#[derive(Debug, Default)]
pub struct BitmapBuilder {
    buf: Vec<u8>,
    len: usize,
    num_valid: usize,
}

impl BitmapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_valid(&self) -> usize {
        self.num_valid
    }

    pub fn null_count(&self) -> usize {
        self.len - self.num_valid
    }

    pub fn append(&mut self, valid: bool) {
        self.set(self.len, valid);
    }

    pub fn set(&mut self, i: usize, valid: bool) {
        let byte = i / 8;
        if byte >= self.buf.len() {
            self.buf.resize(round_to_alignment(byte + 1), 0);
        }
        if i >= self.len {
            self.len = i + 1;
        } else if get_bit(&self.buf, i) {
            // Rewriting an existing slot: drop its old contribution.
            self.num_valid -= 1;
        }
        if valid {
            self.num_valid += 1;
        }
        set_bit(&mut self.buf, i, valid);
    }

    pub fn get(&self, i: usize) -> bool {
        get_bit(&self.buf, i)
    }

    /// Flush to exactly `rows` bits, 64-byte rounded. Bits past the appended
    /// length read as 0 (null).
    pub fn flush(&mut self, rows: usize) -> (Buffer, usize) {
        let byte_len = ceil_div(rows, 8);
        let null_count = if rows <= self.len {
            rows - crate::buffer::count_set_bits(&self.buf, 0, rows)
        } else {
            (rows - self.len) + self.null_count()
        };
        self.buf.truncate(byte_len);
        self.buf.resize(round_to_alignment(byte_len), 0);
        let buf = Buffer::from_vec(std::mem::take(&mut self.buf)).slice(0, byte_len);
        self.len = 0;
        self.num_valid = 0;
        (buf, null_count)
    }
}
