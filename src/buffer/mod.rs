mod builder;

pub use builder::{BitmapBuilder, BufferBuilder, OffsetsBuilder};

use bytes::Bytes;

/// All buffers are padded to a multiple of this many bytes when flushed.
pub const ALIGNMENT: usize = 64;

/// Addressable limit for a single buffer. Growth past this is a
/// `CapacityError`.
pub const MAX_BUFFER_BYTES: usize = i32::MAX as usize;

/// Fixed-width primitive element types that can live in a values buffer.
/// Elements are stored little-endian regardless of host order.
pub trait Native: Copy + Default + PartialEq + std::fmt::Debug + 'static {
    const WIDTH: usize;
    fn from_le_slice(bytes: &[u8]) -> Self;
    fn put_le(self, out: &mut Vec<u8>);
}

macro_rules! native {
    ($t:ty, $w:expr) => {
        impl Native for $t {
            const WIDTH: usize = $w;
            fn from_le_slice(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes[..$w].try_into().unwrap())
            }
            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

native!(i8, 1);
native!(i16, 2);
native!(i32, 4);
native!(i64, 8);
native!(i128, 16);
native!(u8, 1);
native!(u16, 2);
native!(u32, 4);
native!(u64, 8);
native!(f32, 4);
native!(f64, 8);

impl Native for half::f16 {
    const WIDTH: usize = 2;
    fn from_le_slice(bytes: &[u8]) -> Self {
        half::f16::from_le_bytes(bytes[..2].try_into().unwrap())
    }
    fn put_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Immutable, cheaply-cloneable byte region. `slice` shares the backing
/// allocation; no buffer operation copies payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Bytes,
}

impl Buffer {
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: Bytes::from(data) }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Zero-copy sub-range view.
    pub fn slice(&self, offset: usize, len: usize) -> Buffer {
        Buffer { data: self.data.slice(offset..offset + len) }
    }

    /// Borrow the buffer as a typed slice. Returns `None` when the backing
    /// allocation is not aligned for `T`; callers fall back to `value`.
    pub fn typed<T: Native + bytemuck::Pod>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(self.as_slice()).ok()
    }

    /// Decode the element at `i`, independent of alignment.
    pub fn value<T: Native>(&self, i: usize) -> T {
        T::from_le_slice(&self.data[i * T::WIDTH..])
    }

    pub fn bit(&self, i: usize) -> bool {
        get_bit(&self.data, i)
    }

    /// Popcount over the bit range `[offset, offset + len)`.
    pub fn count_set_bits(&self, offset: usize, len: usize) -> usize {
        count_set_bits(&self.data, offset, len)
    }
}

pub fn get_bit(bytes: &[u8], i: usize) -> bool {
    (bytes[i / 8] >> (i % 8)) & 1 == 1
}

pub fn set_bit(bytes: &mut [u8], i: usize, value: bool) {
    if value {
        bytes[i / 8] |= 1 << (i % 8);
    } else {
        bytes[i / 8] &= !(1 << (i % 8));
    }
}

pub fn count_set_bits(bytes: &[u8], offset: usize, len: usize) -> usize {
    let mut count = 0;
    let mut i = offset;
    let end = offset + len;
    // Ragged head up to the next byte boundary.
    while i < end && i % 8 != 0 {
        if get_bit(bytes, i) {
            count += 1;
        }
        i += 1;
    }
    // Whole bytes.
    while i + 8 <= end {
        count += bytes[i / 8].count_ones() as usize;
        i += 8;
    }
    // Ragged tail.
    while i < end {
        if get_bit(bytes, i) {
            count += 1;
        }
        i += 1;
    }
    count
}

pub fn ceil_div(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

/// Round `bytes` up to the buffer alignment boundary.
pub fn round_to_alignment(bytes: usize) -> usize {
    bytes.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Round `bytes` up to the next multiple of 8 (IPC body alignment).
pub fn round_to_8(bytes: usize) -> usize {
    bytes.div_ceil(8) * 8
}
