use std::sync::{Arc, OnceLock};

use crate::buffer::{Buffer, BufferBuilder, ceil_div, get_bit, round_to_alignment, set_bit};
use crate::core::PlumeError;
use crate::types::{DataType, IntervalUnit, UnionMode};

/// Every string slot of `[offset, offset + len)` must reference an in-bounds
/// byte range holding valid UTF-8. Checked once at construction so the value
/// accessors can hand out `str` without re-validating.
fn validate_utf8_payload(
    offset: usize,
    len: usize,
    buffers: &Buffers,
) -> Result<(), PlumeError> {
    let (Some(offsets), Some(values)) = (&buffers.offsets, &buffers.values) else {
        return Ok(());
    };
    let bytes = values.as_slice();
    for i in offset..offset + len {
        let start = offsets.value::<i32>(i);
        let end = offsets.value::<i32>(i + 1);
        if start < 0 || end < start || end as usize > bytes.len() {
            return Err(PlumeError::InvalidError(format!(
                "string slot {i} references [{start}, {end}) outside a {} byte payload",
                bytes.len()
            )));
        }
        if std::str::from_utf8(&bytes[start as usize..end as usize]).is_err() {
            return Err(PlumeError::InvalidError(format!(
                "string slot {i} holds invalid UTF-8"
            )));
        }
    }
    Ok(())
}

/// The four physical buffers a column may carry, in the fixed wire ordering.
#[derive(Debug, Clone, Default)]
pub struct Buffers {
    pub validity: Option<Buffer>,
    pub type_ids: Option<Buffer>,
    pub offsets: Option<Buffer>,
    pub values: Option<Buffer>,
}

/// Physical representation of one column: a logical window
/// `[offset, offset + len)` over shared buffers plus child nodes.
///
/// `slice` never copies: it adjusts only the window, so several logical
/// columns may alias one physical values buffer. The null count is computed
/// on first request by popcount over the validity window and cached.
#[derive(Debug, Clone)]
pub struct Data {
    data_type: DataType,
    offset: usize,
    len: usize,
    null_count: OnceLock<usize>,
    buffers: Buffers,
    children: Vec<Arc<Data>>,
    dictionary: Option<Arc<Data>>,
}

impl Data {
    pub fn try_new(
        data_type: DataType,
        len: usize,
        offset: usize,
        buffers: Buffers,
        children: Vec<Arc<Data>>,
        dictionary: Option<Arc<Data>>,
        null_count: Option<usize>,
    ) -> Result<Self, PlumeError> {
        let end = offset + len;
        if let Some(validity) = &buffers.validity {
            if !validity.is_empty() && validity.len() * 8 < end {
                return Err(PlumeError::InvalidError(format!(
                    "validity bitmap of {} bytes too short for {end} slots",
                    validity.len()
                )));
            }
        }
        let layout = data_type.buffer_layout();
        if layout.offsets && !matches!(data_type, DataType::Union(_, _, _)) {
            let offsets = buffers.offsets.as_ref().ok_or_else(|| {
                PlumeError::InvalidError(format!("{data_type:?} requires an offsets buffer"))
            })?;
            if len > 0 && offsets.len() < (end + 1) * 4 {
                return Err(PlumeError::InvalidError(format!(
                    "offsets buffer of {} bytes too short for {end} rows",
                    offsets.len()
                )));
            }
        }
        if data_type == DataType::Utf8 {
            validate_utf8_payload(offset, len, &buffers)?;
        }
        if let Some(width) = data_type.fixed_byte_width() {
            let values = buffers.values.as_ref().ok_or_else(|| {
                PlumeError::InvalidError(format!("{data_type:?} requires a values buffer"))
            })?;
            if values.len() < end * width {
                return Err(PlumeError::InvalidError(format!(
                    "values buffer of {} bytes too short for {end} slots of width {width}",
                    values.len()
                )));
            }
        }
        let null_count_cell = OnceLock::new();
        if let Some(n) = null_count {
            let _ = null_count_cell.set(n);
        }
        Ok(Self {
            data_type,
            offset,
            len,
            null_count: null_count_cell,
            buffers,
            children,
            dictionary,
        })
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

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn buffers(&self) -> &Buffers {
        &self.buffers
    }

    pub fn children(&self) -> &[Arc<Data>] {
        &self.children
    }

    pub fn child(&self, i: usize) -> &Arc<Data> {
        &self.children[i]
    }

    pub fn dictionary(&self) -> Option<&Arc<Data>> {
        self.dictionary.as_ref()
    }

    pub fn with_dictionary(mut self, dictionary: Arc<Data>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// Number of null slots in the logical window, popcounted lazily and
    /// cached. Columns without a validity bitmap report zero, except the
    /// Null type where every slot is null.
    pub fn null_count(&self) -> usize {
        *self.null_count.get_or_init(|| match &self.buffers.validity {
            Some(validity) if !validity.is_empty() => {
                self.len - validity.count_set_bits(self.offset, self.len)
            }
            _ => {
                if self.data_type == DataType::Null {
                    self.len
                } else {
                    0
                }
            }
        })
    }

    /// Whether slot `i` (logical) is non-null per the validity bitmap alone.
    pub fn is_valid(&self, i: usize) -> bool {
        match &self.buffers.validity {
            Some(validity) if !validity.is_empty() => validity.bit(self.offset + i),
            _ => self.data_type != DataType::Null,
        }
    }

    /// Zero-copy window adjustment. Offsets/values/validity buffers and
    /// children are shared, never copied or re-sliced.
    pub fn slice(&self, offset: usize, len: usize) -> Data {
        debug_assert!(offset + len <= self.len);
        Data {
            data_type: self.data_type.clone(),
            offset: self.offset + offset,
            len,
            null_count: OnceLock::new(),
            buffers: self.buffers.clone(),
            children: self.children.clone(),
            dictionary: self.dictionary.clone(),
        }
    }

    /// Grow the window by `extra` slots whose validity reads null. Every
    /// buffer whose extent tracks the window is extended too, so the padded
    /// column survives slicing and body assembly: offsets repeat the last
    /// entry, bitmaps and fixed-width values gain zeroed slots, and nested
    /// children grow recursively. Used to backfill short columns when
    /// assembling tables.
    pub fn pad_length(&self, extra: usize) -> Result<Data, PlumeError> {
        if matches!(self.data_type, DataType::Union(_, _, _)) {
            return Err(PlumeError::InvalidError(
                "cannot backfill a union column with nulls".into(),
            ));
        }
        if self.data_type == DataType::Null {
            let mut out = self.clone();
            out.len += extra;
            out.null_count = OnceLock::new();
            return Ok(out);
        }
        let end = self.offset + self.len;
        let grown = end + extra;
        let mut bitmap = vec![0u8; round_to_alignment(ceil_div(grown, 8))];
        match &self.buffers.validity {
            Some(validity) if !validity.is_empty() => {
                for i in self.offset..end {
                    if validity.bit(i) {
                        set_bit(&mut bitmap, i, true);
                    }
                }
            }
            _ => {
                for i in self.offset..end {
                    set_bit(&mut bitmap, i, true);
                }
            }
        }
        let null_count = self.null_count() + extra;
        let mut out = self.clone();
        out.len += extra;
        out.buffers.validity = Some(Buffer::from_vec(bitmap).slice(0, ceil_div(grown, 8)));

        match &self.data_type {
            DataType::Bool => {
                let values = self.buffers.values.as_ref().ok_or_else(|| {
                    PlumeError::InvalidError("bool column without a values bitmap".into())
                })?;
                let mut bits = vec![0u8; round_to_alignment(ceil_div(grown, 8))];
                let have = values.len().min(ceil_div(end, 8));
                bits[..have].copy_from_slice(&values.as_slice()[..have]);
                out.buffers.values = Some(Buffer::from_vec(bits).slice(0, ceil_div(grown, 8)));
            }
            DataType::Utf8 | DataType::Binary | DataType::List(_) | DataType::Map(_, _) => {
                let offsets = self.buffers.offsets.as_ref().ok_or_else(|| {
                    PlumeError::InvalidError(format!(
                        "{:?} column without an offsets buffer",
                        self.data_type
                    ))
                })?;
                let entries = offsets.len() / 4;
                let mut raw = Vec::with_capacity(round_to_alignment((grown + 1) * 4));
                let mut last = 0i32;
                for i in 0..=end {
                    if i < entries {
                        last = offsets.value::<i32>(i);
                    }
                    raw.extend_from_slice(&last.to_le_bytes());
                }
                // Null slots span zero bytes: repeat the final offset.
                for _ in 0..extra {
                    raw.extend_from_slice(&last.to_le_bytes());
                }
                let exact = raw.len();
                raw.resize(round_to_alignment(exact), 0);
                out.buffers.offsets = Some(Buffer::from_vec(raw).slice(0, exact));
            }
            DataType::Struct(_) => {
                let mut children = Vec::with_capacity(self.children.len());
                for child in &self.children {
                    children.push(Arc::new(child.pad_length(extra)?));
                }
                out.children = children;
            }
            DataType::FixedSizeList(n, _) => {
                let child = self.children.first().ok_or_else(|| {
                    PlumeError::InvalidError("fixed-size list column without a child".into())
                })?;
                out.children = vec![Arc::new(child.pad_length(extra * *n as usize)?)];
            }
            other => {
                // Everything else, dictionary indices included, stores one
                // fixed-width value per slot.
                let width = other.fixed_byte_width().ok_or_else(|| {
                    PlumeError::InvalidError(format!("cannot backfill a {other:?} column"))
                })?;
                let values = self.buffers.values.as_ref().ok_or_else(|| {
                    PlumeError::InvalidError(format!("{other:?} column without a values buffer"))
                })?;
                let mut raw = vec![0u8; round_to_alignment(grown * width)];
                let have = values.len().min(end * width);
                raw[..have].copy_from_slice(&values.as_slice()[..have]);
                out.buffers.values = Some(Buffer::from_vec(raw).slice(0, grown * width));
            }
        }

        out.null_count = OnceLock::new();
        let _ = out.null_count.set(null_count);
        Ok(out)
    }

    /// Synthetic all-null column of any type.
    pub fn new_null(data_type: &DataType, len: usize) -> Data {
        let nulls = |len: usize| -> Option<Buffer> {
            Some(Buffer::from_vec(vec![0u8; round_to_alignment(ceil_div(len, 8))])
                .slice(0, ceil_div(len, 8)))
        };
        let zeroed = |bytes: usize| -> Option<Buffer> {
            Some(Buffer::from_vec(vec![0u8; round_to_alignment(bytes)]).slice(0, bytes))
        };
        let (buffers, children, dictionary) = match data_type {
            DataType::Null => (Buffers::default(), Vec::new(), None),
            DataType::Bool => (
                Buffers {
                    validity: nulls(len),
                    values: zeroed(ceil_div(len, 8)),
                    ..Default::default()
                },
                Vec::new(),
                None,
            ),
            DataType::Utf8 | DataType::Binary => (
                Buffers {
                    validity: nulls(len),
                    offsets: zeroed((len + 1) * 4),
                    values: zeroed(0),
                    ..Default::default()
                },
                Vec::new(),
                None,
            ),
            DataType::List(child) | DataType::Map(child, _) => (
                Buffers { validity: nulls(len), offsets: zeroed((len + 1) * 4), ..Default::default() },
                vec![Arc::new(Data::new_null(&child.data_type, 0))],
                None,
            ),
            DataType::FixedSizeList(n, child) => (
                Buffers { validity: nulls(len), ..Default::default() },
                vec![Arc::new(Data::new_null(&child.data_type, len * *n as usize))],
                None,
            ),
            DataType::Struct(fields) => (
                Buffers { validity: nulls(len), ..Default::default() },
                fields
                    .iter()
                    .map(|f| Arc::new(Data::new_null(&f.data_type, len)))
                    .collect(),
                None,
            ),
            DataType::Union(mode, type_ids, fields) => {
                let tid = type_ids.first().copied().unwrap_or(0);
                let mut ids = BufferBuilder::<i8>::new();
                for _ in 0..len {
                    let _ = ids.append(tid);
                }
                let offsets = match mode {
                    UnionMode::Dense => {
                        let mut o = BufferBuilder::<i32>::new();
                        for i in 0..len {
                            let _ = o.append(i as i32);
                        }
                        Some(o.flush(len))
                    }
                    UnionMode::Sparse => None,
                };
                let children = fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| {
                        let child_len = match mode {
                            UnionMode::Sparse => len,
                            UnionMode::Dense if i == 0 => len,
                            UnionMode::Dense => 0,
                        };
                        Arc::new(Data::new_null(&f.data_type, child_len))
                    })
                    .collect();
                (
                    Buffers { type_ids: Some(ids.flush(len)), offsets, ..Default::default() },
                    children,
                    None,
                )
            }
            DataType::Dictionary { index, value, .. } => {
                let width = index.fixed_byte_width().unwrap_or(4);
                (
                    Buffers { validity: nulls(len), values: zeroed(len * width), ..Default::default() },
                    Vec::new(),
                    Some(Arc::new(Data::new_null(value, 0))),
                )
            }
            // All remaining types are fixed width.
            other => {
                let width = other.fixed_byte_width().unwrap_or_else(|| {
                    unreachable!("non fixed-width type {other:?} unhandled in new_null")
                });
                (
                    Buffers { validity: nulls(len), values: zeroed(len * width), ..Default::default() },
                    Vec::new(),
                    None,
                )
            }
        };
        let null_count = OnceLock::new();
        let _ = null_count.set(len);
        Data {
            data_type: data_type.clone(),
            offset: 0,
            len,
            null_count,
            buffers,
            children,
            dictionary,
        }
    }

    /// Physical slots consumed in the values buffer by one logical slot.
    /// Only Interval(DayTime/MonthDayNano) pack multiple lanes, and those
    /// are handled through their byte width; kept for layout arithmetic.
    pub fn stride(&self) -> usize {
        match &self.data_type {
            DataType::Interval(IntervalUnit::DayTime) => 2,
            DataType::Interval(IntervalUnit::MonthDayNano) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    fn int32_data(values: &[i32], validity: Option<&[bool]>) -> Data {
        let mut b = BufferBuilder::<i32>::new();
        for v in values {
            b.append(*v).unwrap();
        }
        let validity_buf = validity.map(|bits| {
            let mut bytes = vec![0u8; ceil_div(bits.len(), 8)];
            for (i, bit) in bits.iter().enumerate() {
                set_bit(&mut bytes, i, *bit);
            }
            Buffer::from_vec(bytes)
        });
        Data::try_new(
            DataType::Int32,
            values.len(),
            0,
            Buffers { validity: validity_buf, values: Some(b.flush(values.len())), ..Default::default() },
            Vec::new(),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_null_count_lazy_and_stable() {
        let d = int32_data(&[1, 2, 3, 4], Some(&[true, false, true, false]));
        assert_eq!(d.null_count(), 2);
        assert_eq!(d.null_count(), 2);
        assert!(d.is_valid(0));
        assert!(!d.is_valid(1));
    }

    #[test]
    fn test_no_validity_means_all_valid() {
        let d = int32_data(&[1, 2, 3], None);
        assert_eq!(d.null_count(), 0);
        assert!(d.is_valid(2));
    }

    #[test]
    fn test_slice_shares_buffers_and_recounts_nulls() {
        let d = int32_data(&[10, 20, 30, 40, 50], Some(&[true, false, true, true, false]));
        let s = d.slice(1, 3);
        assert_eq!(s.len(), 3);
        assert_eq!(s.offset(), 1);
        assert_eq!(s.null_count(), 1);
        // Backing values buffer is the same allocation.
        assert_eq!(
            s.buffers().values.as_ref().unwrap().as_slice().as_ptr(),
            d.buffers().values.as_ref().unwrap().as_slice().as_ptr()
        );
        // Slice of slice composes offsets.
        let ss = s.slice(1, 2);
        assert_eq!(ss.offset(), 2);
        assert_eq!(ss.null_count(), 1);
    }

    #[test]
    fn test_pad_length_backfills_nulls() {
        let d = int32_data(&[1, 2], None);
        let padded = d.pad_length(3).unwrap();
        assert_eq!(padded.len(), 5);
        assert_eq!(padded.null_count(), 3);
        assert!(padded.is_valid(1));
        assert!(!padded.is_valid(2));
        // Values buffer covers every slot of the grown window.
        let values = padded.buffers().values.as_ref().unwrap();
        assert_eq!(values.len(), 5 * 4);
        assert_eq!(values.value::<i32>(1), 2);
        assert_eq!(values.value::<i32>(4), 0);
    }

    #[test]
    fn test_pad_length_extends_offsets() {
        let mut b = crate::builder::Builder::new(DataType::Utf8);
        b.append(crate::value::Value::Utf8("ab".into())).unwrap();
        b.append(crate::value::Value::Utf8("cde".into())).unwrap();
        let d = b.flush().unwrap();
        let padded = d.pad_length(2).unwrap();
        assert_eq!(padded.len(), 4);
        let offsets = padded.buffers().offsets.as_ref().unwrap();
        assert_eq!(offsets.len(), 5 * 4);
        assert_eq!(offsets.value::<i32>(2), 5);
        // Padded slots span zero bytes.
        assert_eq!(offsets.value::<i32>(3), 5);
        assert_eq!(offsets.value::<i32>(4), 5);
    }

    #[test]
    fn test_pad_length_extends_bool_bitmap() {
        let mut b = crate::builder::Builder::new(DataType::Bool);
        b.append(crate::value::Value::Bool(true)).unwrap();
        let d = b.flush().unwrap();
        let padded = d.pad_length(9).unwrap();
        assert_eq!(padded.len(), 10);
        let values = padded.buffers().values.as_ref().unwrap();
        assert_eq!(values.len(), ceil_div(10, 8));
        assert!(values.bit(0));
        assert!(!values.bit(9));
    }

    #[test]
    fn test_pad_length_grows_struct_children() {
        let dt = DataType::Struct(vec![Field::new("a", DataType::Int32, true)]);
        let d = Data::new_null(&dt, 2);
        let padded = d.pad_length(3).unwrap();
        assert_eq!(padded.len(), 5);
        assert_eq!(padded.child(0).len(), 5);
    }

    #[test]
    fn test_new_null_struct() {
        let dt = DataType::Struct(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]);
        let d = Data::new_null(&dt, 4);
        assert_eq!(d.len(), 4);
        assert_eq!(d.null_count(), 4);
        assert_eq!(d.children().len(), 2);
        assert_eq!(d.child(0).len(), 4);
    }

    #[test]
    fn test_new_null_of_null_type() {
        let d = Data::new_null(&DataType::Null, 7);
        assert_eq!(d.null_count(), 7);
        assert!(!d.is_valid(0));
    }

    #[test]
    fn test_try_new_rejects_invalid_utf8() {
        let mut offsets = Vec::new();
        offsets.extend_from_slice(&0i32.to_le_bytes());
        offsets.extend_from_slice(&2i32.to_le_bytes());
        let err = Data::try_new(
            DataType::Utf8,
            1,
            0,
            Buffers {
                offsets: Some(Buffer::from_vec(offsets)),
                values: Some(Buffer::from_vec(vec![0xff, 0xfe])),
                ..Default::default()
            },
            Vec::new(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PlumeError::InvalidError(_)));
    }

    #[test]
    fn test_try_new_rejects_out_of_range_string_offsets() {
        let mut offsets = Vec::new();
        offsets.extend_from_slice(&0i32.to_le_bytes());
        offsets.extend_from_slice(&9i32.to_le_bytes());
        let err = Data::try_new(
            DataType::Utf8,
            1,
            0,
            Buffers {
                offsets: Some(Buffer::from_vec(offsets)),
                values: Some(Buffer::from_vec(b"ab".to_vec())),
                ..Default::default()
            },
            Vec::new(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PlumeError::InvalidError(_)));
    }

    #[test]
    fn test_try_new_rejects_short_values() {
        let err = Data::try_new(
            DataType::Int64,
            4,
            0,
            Buffers { values: Some(Buffer::from_vec(vec![0u8; 8])), ..Default::default() },
            Vec::new(),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PlumeError::InvalidError(_)));
    }
}
