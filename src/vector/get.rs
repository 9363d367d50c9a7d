use crate::buffer::Buffer;
use crate::data::Data;
use crate::types::{DataType, DateUnit, IntervalUnit, UnionMode};
use crate::value::Value;

/// Decode the logical value at slot `i`. One arm per physical encoding;
/// this is the Get surface of the type-dispatch engine.
///
/// Callers guarantee `i < data.len()`.
pub(crate) fn value_at(data: &Data, i: usize) -> Value {
    debug_assert!(i < data.len());
    match data.data_type() {
        DataType::Null => return Value::Null,
        // Unions carry no validity bitmap; nullness lives in the children.
        DataType::Union(_, _, _) => {}
        _ => {
            if !data.is_valid(i) {
                return Value::Null;
            }
        }
    }
    let phys = data.offset() + i;
    let values = || data.buffers().values.as_ref().expect("values buffer");
    match data.data_type() {
        DataType::Null => Value::Null,
        DataType::Union(mode, type_ids, _) => {
            let tid = data.buffers().type_ids.as_ref().expect("type ids").value::<i8>(phys);
            let child_idx = type_ids.iter().position(|t| *t == tid).unwrap_or(0);
            let child = data.child(child_idx);
            let inner = match mode {
                UnionMode::Sparse => value_at(child, phys),
                UnionMode::Dense => {
                    let offset =
                        data.buffers().offsets.as_ref().expect("offsets").value::<i32>(phys);
                    value_at(child, offset as usize)
                }
            };
            Value::Union(tid, Box::new(inner))
        }
        DataType::Bool => Value::Bool(values().bit(phys)),
        DataType::Int8 => Value::Int8(values().value(phys)),
        DataType::Int16 => Value::Int16(values().value(phys)),
        DataType::Int32 => Value::Int32(values().value(phys)),
        DataType::Int64 => Value::Int64(values().value(phys)),
        DataType::UInt8 => Value::UInt8(values().value(phys)),
        DataType::UInt16 => Value::UInt16(values().value(phys)),
        DataType::UInt32 => Value::UInt32(values().value(phys)),
        DataType::UInt64 => Value::UInt64(values().value(phys)),
        DataType::Float16 => Value::Float16(values().value(phys)),
        DataType::Float32 => Value::Float32(values().value(phys)),
        DataType::Float64 => Value::Float64(values().value(phys)),
        DataType::Decimal { bit_width, .. } => Value::Decimal(read_decimal(values(), *bit_width, phys)),
        DataType::Date(DateUnit::Day) => Value::Date32(values().value(phys)),
        DataType::Date(DateUnit::Millisecond) => Value::Date64(values().value(phys)),
        DataType::Time32(_) => Value::Time32(values().value(phys)),
        DataType::Time64(_) => Value::Time64(values().value(phys)),
        DataType::Timestamp(_, _) => Value::Timestamp(values().value(phys)),
        DataType::Interval(IntervalUnit::YearMonth) => Value::IntervalYearMonth(values().value(phys)),
        DataType::Interval(IntervalUnit::DayTime) => {
            let v = values();
            Value::IntervalDayTime { days: v.value(phys * 2), millis: v.value(phys * 2 + 1) }
        }
        DataType::Interval(IntervalUnit::MonthDayNano) => {
            let v = values();
            Value::IntervalMonthDayNano {
                months: v.value(phys * 4),
                days: v.value(phys * 4 + 1),
                nanos: i64::from_le_bytes(
                    v.as_slice()[phys * 16 + 8..phys * 16 + 16].try_into().unwrap(),
                ),
            }
        }
        DataType::Utf8 => {
            let (start, end) = value_range(data, phys);
            // The range was UTF-8 checked when the Data was constructed.
            let s = std::str::from_utf8(&values().as_slice()[start..end])
                .expect("utf8 payload validated at construction");
            Value::Utf8(s.to_owned())
        }
        DataType::Binary => {
            let (start, end) = value_range(data, phys);
            Value::Binary(values().as_slice()[start..end].to_vec())
        }
        DataType::FixedSizeBinary(w) => {
            let w = *w as usize;
            Value::FixedSizeBinary(values().as_slice()[phys * w..(phys + 1) * w].to_vec())
        }
        DataType::List(_) => {
            let (start, end) = value_range(data, phys);
            let child = data.child(0);
            Value::List((start..end).map(|j| value_at(child, j)).collect())
        }
        DataType::FixedSizeList(n, _) => {
            let n = *n as usize;
            let child = data.child(0);
            Value::List((phys * n..(phys + 1) * n).map(|j| value_at(child, j)).collect())
        }
        DataType::Struct(_) => {
            Value::Struct(data.children().iter().map(|c| value_at(c, phys)).collect())
        }
        DataType::Map(_, _) => {
            let (start, end) = value_range(data, phys);
            let entries = data.child(0);
            let pairs = (start..end)
                .map(|j| match value_at(entries, j) {
                    Value::Struct(mut kv) if kv.len() == 2 => {
                        let v = kv.pop().unwrap();
                        let k = kv.pop().unwrap();
                        (k, v)
                    }
                    other => (other, Value::Null),
                })
                .collect();
            Value::Map(pairs)
        }
        DataType::Dictionary { index, .. } => {
            let key = read_index(values(), index, phys);
            match data.dictionary() {
                Some(dict) if key < dict.len() => value_at(dict, key),
                _ => Value::Null,
            }
        }
    }
}

fn value_range(data: &Data, phys: usize) -> (usize, usize) {
    let offsets = data.buffers().offsets.as_ref().expect("offsets buffer");
    (offsets.value::<i32>(phys) as usize, offsets.value::<i32>(phys + 1) as usize)
}

fn read_decimal(values: &Buffer, bit_width: u16, phys: usize) -> i128 {
    match bit_width {
        32 => values.value::<i32>(phys) as i128,
        64 => values.value::<i64>(phys) as i128,
        _ => values.value::<i128>(phys),
    }
}

/// Decode a dictionary key from the index buffer, whatever its integer type.
pub(crate) fn read_index(values: &Buffer, index: &DataType, phys: usize) -> usize {
    match index {
        DataType::Int8 => values.value::<i8>(phys) as usize,
        DataType::Int16 => values.value::<i16>(phys) as usize,
        DataType::Int64 => values.value::<i64>(phys) as usize,
        DataType::UInt8 => values.value::<u8>(phys) as usize,
        DataType::UInt16 => values.value::<u16>(phys) as usize,
        DataType::UInt32 => values.value::<u32>(phys) as usize,
        DataType::UInt64 => values.value::<u64>(phys) as usize,
        _ => values.value::<i32>(phys) as usize,
    }
}
