//! Shared helpers over the `flatbuffers` builder/table primitives.
//!
//! The metadata codecs drive `flatbuffers::FlatBufferBuilder` directly
//! instead of going through flatc-generated accessors, so the vtable slot
//! arithmetic and the fixed-size structs the tables embed live here. Slot
//! numbers follow the Arrow `.fbs` declarations.

use flatbuffers::{Follow, ForwardsUOffset, Push, PushAlignment, Table, VOffsetT, Vector};

use crate::core::PlumeError;

/// Finished table offset, as returned by `FlatBufferBuilder::end_table`.
pub(crate) type TableOffset = flatbuffers::WIPOffset<flatbuffers::TableFinishedWIPOffset>;

/// Byte offset of vtable slot `i`; the first two vtable entries hold the
/// vtable and table sizes.
pub(crate) const fn slot(i: usize) -> VOffsetT {
    (4 + 2 * i) as VOffsetT
}

/// Root table of a finished buffer, with the root offset checked against the
/// buffer bounds before any table access.
pub(crate) fn root(buf: &[u8]) -> Result<Table<'_>, PlumeError> {
    if buf.len() < 4 {
        return Err(PlumeError::FormatError(format!(
            "{} bytes is too short for a metadata table",
            buf.len()
        )));
    }
    let loc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if loc < 4 || loc >= buf.len() {
        return Err(PlumeError::FormatError(format!(
            "metadata root offset {loc} out of range for {} bytes",
            buf.len()
        )));
    }
    // Offset verified against the buffer above.
    Ok(unsafe { Table::new(buf, loc) })
}

/// Scalar slot with its schema default.
pub(crate) fn scalar_field<'a, T>(table: &Table<'a>, i: usize, default: T) -> T
where
    T: Follow<'a, Inner = T> + Copy + 'a,
{
    unsafe { table.get::<T>(slot(i), Some(default)) }.unwrap_or(default)
}

/// Sub-table slot, absent when the field was not written.
pub(crate) fn table_field<'a>(table: &Table<'a>, i: usize) -> Option<Table<'a>> {
    unsafe { table.get::<ForwardsUOffset<Table<'a>>>(slot(i), None) }
}

/// Vector slot of any element kind (scalars, structs, or table offsets).
pub(crate) fn vector_field<'a, T>(table: &Table<'a>, i: usize) -> Option<Vector<'a, T>>
where
    T: Follow<'a> + 'a,
{
    unsafe { table.get::<ForwardsUOffset<Vector<'a, T>>>(slot(i), None) }
}

/// String slot, read through the byte vector so invalid UTF-8 surfaces as an
/// error instead of reaching `str` unchecked.
pub(crate) fn string_field<'a>(
    table: &Table<'a>,
    i: usize,
) -> Result<Option<String>, PlumeError> {
    let Some(v) = vector_field::<u8>(table, i) else {
        return Ok(None);
    };
    match std::str::from_utf8(v.bytes()) {
        Ok(s) => Ok(Some(s.to_owned())),
        Err(_) => Err(PlumeError::FormatError(
            "metadata string is not valid UTF-8".into(),
        )),
    }
}

fn le_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    i32::from_le_bytes(raw)
}

fn le_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    i64::from_le_bytes(raw)
}

macro_rules! wire_struct {
    ($name:ident, $size:literal) => {
        /// Fixed-size struct stored inline in metadata vectors. Kept as raw
        /// little-endian bytes so references into the buffer need no
        /// alignment.
        #[repr(transparent)]
        #[derive(Clone, Copy, Default, PartialEq)]
        pub(crate) struct $name([u8; $size]);

        impl Push for $name {
            type Output = $name;

            unsafe fn push(&self, dst: &mut [u8], _written_len: usize) {
                dst.copy_from_slice(&self.0);
            }

            fn alignment() -> PushAlignment {
                PushAlignment::new(8)
            }
        }

        impl<'a> Follow<'a> for $name {
            type Inner = &'a $name;

            unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
                unsafe { flatbuffers::follow_cast_ref::<$name>(buf, loc) }
            }
        }
    };
}

// FieldNode = struct { length: i64, null_count: i64 }
wire_struct!(RawFieldNode, 16);

impl RawFieldNode {
    pub(crate) fn new(length: i64, null_count: i64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&length.to_le_bytes());
        raw[8..].copy_from_slice(&null_count.to_le_bytes());
        Self(raw)
    }

    pub(crate) fn length(&self) -> i64 {
        le_i64(&self.0[..8])
    }

    pub(crate) fn null_count(&self) -> i64 {
        le_i64(&self.0[8..])
    }
}

// Buffer = struct { offset: i64, length: i64 }
wire_struct!(RawBuffer, 16);

impl RawBuffer {
    pub(crate) fn new(offset: i64, length: i64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&offset.to_le_bytes());
        raw[8..].copy_from_slice(&length.to_le_bytes());
        Self(raw)
    }

    pub(crate) fn offset(&self) -> i64 {
        le_i64(&self.0[..8])
    }

    pub(crate) fn length(&self) -> i64 {
        le_i64(&self.0[8..])
    }
}

// Block = struct { offset: i64, metaDataLength: i32, <4 pad>, bodyLength: i64 }
wire_struct!(RawBlock, 24);

impl RawBlock {
    pub(crate) fn new(offset: i64, meta_data_length: i32, body_length: i64) -> Self {
        let mut raw = [0u8; 24];
        raw[..8].copy_from_slice(&offset.to_le_bytes());
        raw[8..12].copy_from_slice(&meta_data_length.to_le_bytes());
        raw[16..].copy_from_slice(&body_length.to_le_bytes());
        Self(raw)
    }

    pub(crate) fn offset(&self) -> i64 {
        le_i64(&self.0[..8])
    }

    pub(crate) fn meta_data_length(&self) -> i32 {
        le_i32(&self.0[8..12])
    }

    pub(crate) fn body_length(&self) -> i64 {
        le_i64(&self.0[16..])
    }
}
