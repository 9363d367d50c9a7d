//! Schema/Field/type-union metadata codec in the Arrow `Schema.fbs` field
//! layout, over the `flatbuffers` builder/table primitives.

use std::collections::BTreeMap;

use flatbuffers::{FlatBufferBuilder, ForwardsUOffset, Table};

use crate::core::PlumeError;
use crate::ipc::DictionaryMemo;
use crate::ipc::fb::{self, TableOffset};
use crate::types::{
    DataType, DateUnit, Field, IntervalUnit, Precision, Schema, TimeUnit, UnionMode,
};

// Type union tags from Schema.fbs.
const TYPE_NULL: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_FLOAT: u8 = 3;
const TYPE_BINARY: u8 = 4;
const TYPE_UTF8: u8 = 5;
const TYPE_BOOL: u8 = 6;
const TYPE_DECIMAL: u8 = 7;
const TYPE_DATE: u8 = 8;
const TYPE_TIME: u8 = 9;
const TYPE_TIMESTAMP: u8 = 10;
const TYPE_INTERVAL: u8 = 11;
const TYPE_LIST: u8 = 12;
const TYPE_STRUCT: u8 = 13;
const TYPE_UNION: u8 = 14;
const TYPE_FIXED_SIZE_BINARY: u8 = 15;
const TYPE_FIXED_SIZE_LIST: u8 = 16;
const TYPE_MAP: u8 = 17;

fn time_unit_code(unit: TimeUnit) -> i16 {
    match unit {
        TimeUnit::Second => 0,
        TimeUnit::Millisecond => 1,
        TimeUnit::Microsecond => 2,
        TimeUnit::Nanosecond => 3,
    }
}

fn time_unit_from(code: i16) -> Result<TimeUnit, PlumeError> {
    match code {
        0 => Ok(TimeUnit::Second),
        1 => Ok(TimeUnit::Millisecond),
        2 => Ok(TimeUnit::Microsecond),
        3 => Ok(TimeUnit::Nanosecond),
        other => Err(PlumeError::FormatError(format!("unknown time unit code {other}"))),
    }
}

/// (bit width, signedness) of an integer type, used by Int and dictionary
/// index encoding.
fn int_params(dt: &DataType) -> Option<(i32, bool)> {
    match dt {
        DataType::Int8 => Some((8, true)),
        DataType::Int16 => Some((16, true)),
        DataType::Int32 => Some((32, true)),
        DataType::Int64 => Some((64, true)),
        DataType::UInt8 => Some((8, false)),
        DataType::UInt16 => Some((16, false)),
        DataType::UInt32 => Some((32, false)),
        DataType::UInt64 => Some((64, false)),
        _ => None,
    }
}

fn int_from_params(bit_width: i32, signed: bool) -> Result<DataType, PlumeError> {
    match (bit_width, signed) {
        (8, true) => Ok(DataType::Int8),
        (16, true) => Ok(DataType::Int16),
        (32, true) => Ok(DataType::Int32),
        (64, true) => Ok(DataType::Int64),
        (8, false) => Ok(DataType::UInt8),
        (16, false) => Ok(DataType::UInt16),
        (32, false) => Ok(DataType::UInt32),
        (64, false) => Ok(DataType::UInt64),
        _ => Err(PlumeError::FormatError(format!("unknown int width {bit_width}"))),
    }
}

fn encode_metadata<'fbb>(
    fbb: &mut FlatBufferBuilder<'fbb>,
    metadata: &BTreeMap<String, String>,
) -> Option<flatbuffers::WIPOffset<flatbuffers::Vector<'fbb, ForwardsUOffset<flatbuffers::TableFinishedWIPOffset>>>> {
    if metadata.is_empty() {
        return None;
    }
    let mut entries = Vec::with_capacity(metadata.len());
    for (k, v) in metadata {
        let k = fbb.create_string(k);
        let v = fbb.create_string(v);
        let start = fbb.start_table();
        fbb.push_slot_always(fb::slot(0), k);
        fbb.push_slot_always(fb::slot(1), v);
        entries.push(fbb.end_table(start));
    }
    Some(fbb.create_vector(&entries))
}

fn decode_metadata(table: &Table, slot: usize) -> Result<BTreeMap<String, String>, PlumeError> {
    let mut out = BTreeMap::new();
    if let Some(entries) = fb::vector_field::<ForwardsUOffset<Table>>(table, slot) {
        for kv in entries.iter() {
            let key = fb::string_field(&kv, 0)?.unwrap_or_default();
            let value = fb::string_field(&kv, 1)?.unwrap_or_default();
            out.insert(key, value);
        }
    }
    Ok(out)
}

/// Emit the union-typed metadata table for one logical type; the type
/// assembler half of the codec. Dictionary types encode their *value* type
/// here, with the index carried by the field's DictionaryEncoding.
fn encode_type<'fbb>(
    fbb: &mut FlatBufferBuilder<'fbb>,
    dt: &DataType,
) -> Result<(u8, TableOffset), PlumeError> {
    let empty = |fbb: &mut FlatBufferBuilder<'fbb>| -> TableOffset {
        let start = fbb.start_table();
        fbb.end_table(start)
    };
    match dt {
        DataType::Null => Ok((TYPE_NULL, empty(fbb))),
        DataType::Bool => Ok((TYPE_BOOL, empty(fbb))),
        DataType::Utf8 => Ok((TYPE_UTF8, empty(fbb))),
        DataType::Binary => Ok((TYPE_BINARY, empty(fbb))),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let (bits, signed) = int_params(dt).ok_or_else(|| {
                PlumeError::InvalidError(format!("{dt:?} has no integer parameters"))
            })?;
            Ok((TYPE_INT, encode_int(fbb, bits, signed)))
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let precision = match dt {
                DataType::Float16 => Precision::Half,
                DataType::Float32 => Precision::Single,
                _ => Precision::Double,
            };
            let start = fbb.start_table();
            fbb.push_slot::<i16>(fb::slot(0), precision as i16, 0);
            Ok((TYPE_FLOAT, fbb.end_table(start)))
        }
        DataType::Decimal { precision, scale, bit_width } => {
            let start = fbb.start_table();
            fbb.push_slot::<i32>(fb::slot(0), *precision as i32, 0);
            fbb.push_slot::<i32>(fb::slot(1), *scale as i32, 0);
            fbb.push_slot::<i32>(fb::slot(2), *bit_width as i32, 128);
            Ok((TYPE_DECIMAL, fbb.end_table(start)))
        }
        DataType::Date(unit) => {
            let start = fbb.start_table();
            let code = match unit {
                DateUnit::Day => 0,
                DateUnit::Millisecond => 1,
            };
            fbb.push_slot::<i16>(fb::slot(0), code, 1);
            Ok((TYPE_DATE, fbb.end_table(start)))
        }
        DataType::Time32(unit) => {
            let start = fbb.start_table();
            fbb.push_slot::<i16>(fb::slot(0), time_unit_code(*unit), 1);
            fbb.push_slot::<i32>(fb::slot(1), 32, 32);
            Ok((TYPE_TIME, fbb.end_table(start)))
        }
        DataType::Time64(unit) => {
            let start = fbb.start_table();
            fbb.push_slot::<i16>(fb::slot(0), time_unit_code(*unit), 1);
            fbb.push_slot::<i32>(fb::slot(1), 64, 32);
            Ok((TYPE_TIME, fbb.end_table(start)))
        }
        DataType::Timestamp(unit, timezone) => {
            let tz = timezone.as_ref().map(|tz| fbb.create_string(tz));
            let start = fbb.start_table();
            fbb.push_slot::<i16>(fb::slot(0), time_unit_code(*unit), 0);
            if let Some(tz) = tz {
                fbb.push_slot_always(fb::slot(1), tz);
            }
            Ok((TYPE_TIMESTAMP, fbb.end_table(start)))
        }
        DataType::Interval(unit) => {
            let start = fbb.start_table();
            let code = match unit {
                IntervalUnit::YearMonth => 0,
                IntervalUnit::DayTime => 1,
                IntervalUnit::MonthDayNano => 2,
            };
            fbb.push_slot::<i16>(fb::slot(0), code, 0);
            Ok((TYPE_INTERVAL, fbb.end_table(start)))
        }
        DataType::List(_) => Ok((TYPE_LIST, empty(fbb))),
        DataType::Struct(_) => Ok((TYPE_STRUCT, empty(fbb))),
        DataType::Union(mode, type_ids, _) => {
            let ids: Vec<i32> = type_ids.iter().map(|t| *t as i32).collect();
            let ids = fbb.create_vector(&ids);
            let start = fbb.start_table();
            let mode_code = match mode {
                UnionMode::Sparse => 0,
                UnionMode::Dense => 1,
            };
            fbb.push_slot::<i16>(fb::slot(0), mode_code, 0);
            fbb.push_slot_always(fb::slot(1), ids);
            Ok((TYPE_UNION, fbb.end_table(start)))
        }
        DataType::FixedSizeBinary(w) => {
            let start = fbb.start_table();
            fbb.push_slot::<i32>(fb::slot(0), *w, 0);
            Ok((TYPE_FIXED_SIZE_BINARY, fbb.end_table(start)))
        }
        DataType::FixedSizeList(n, _) => {
            let start = fbb.start_table();
            fbb.push_slot::<i32>(fb::slot(0), *n, 0);
            Ok((TYPE_FIXED_SIZE_LIST, fbb.end_table(start)))
        }
        DataType::Map(_, keys_sorted) => {
            let start = fbb.start_table();
            fbb.push_slot::<bool>(fb::slot(0), *keys_sorted, false);
            Ok((TYPE_MAP, fbb.end_table(start)))
        }
        DataType::Dictionary { value, .. } => encode_type(fbb, value),
    }
}

fn encode_int<'fbb>(fbb: &mut FlatBufferBuilder<'fbb>, bits: i32, signed: bool) -> TableOffset {
    let start = fbb.start_table();
    fbb.push_slot::<i32>(fb::slot(0), bits, 0);
    fbb.push_slot::<bool>(fb::slot(1), signed, false);
    fbb.end_table(start)
}

pub fn encode_field<'fbb>(
    fbb: &mut FlatBufferBuilder<'fbb>,
    field: &Field,
) -> Result<TableOffset, PlumeError> {
    let name = fbb.create_string(&field.name);
    let (tag, type_off) = encode_type(fbb, &field.data_type)?;

    // Children reflect the value type for dictionary-encoded fields.
    let child_fields = match &field.data_type {
        DataType::Dictionary { value, .. } => value.children(),
        other => other.children(),
    };
    let children = if child_fields.is_empty() {
        None
    } else {
        let mut offs = Vec::with_capacity(child_fields.len());
        for child in child_fields {
            offs.push(encode_field(fbb, child)?);
        }
        Some(fbb.create_vector(&offs))
    };

    let dictionary = match &field.data_type {
        DataType::Dictionary { index, id, ordered, .. } => {
            let (bits, signed) = int_params(index).ok_or_else(|| {
                PlumeError::InvalidError(format!("dictionary index type {index:?} is not an integer"))
            })?;
            let index_off = encode_int(fbb, bits, signed);
            let start = fbb.start_table();
            fbb.push_slot::<i64>(fb::slot(0), *id, 0);
            fbb.push_slot_always(fb::slot(1), index_off);
            fbb.push_slot::<bool>(fb::slot(2), *ordered, false);
            Some(fbb.end_table(start))
        }
        _ => None,
    };

    let metadata = encode_metadata(fbb, &field.metadata);

    let start = fbb.start_table();
    fbb.push_slot_always(fb::slot(0), name);
    fbb.push_slot::<bool>(fb::slot(1), field.nullable, false);
    fbb.push_slot::<u8>(fb::slot(2), tag, 0);
    fbb.push_slot_always(fb::slot(3), type_off);
    if let Some(dictionary) = dictionary {
        fbb.push_slot_always(fb::slot(4), dictionary);
    }
    if let Some(children) = children {
        fbb.push_slot_always(fb::slot(5), children);
    }
    if let Some(metadata) = metadata {
        fbb.push_slot_always(fb::slot(6), metadata);
    }
    Ok(fbb.end_table(start))
}

pub fn encode_schema<'fbb>(
    fbb: &mut FlatBufferBuilder<'fbb>,
    schema: &Schema,
) -> Result<TableOffset, PlumeError> {
    let mut fields = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        fields.push(encode_field(fbb, field)?);
    }
    let fields = fbb.create_vector(&fields);
    let metadata = encode_metadata(fbb, &schema.metadata);
    let start = fbb.start_table();
    fbb.push_slot::<i16>(fb::slot(0), 0, 0); // little-endian
    fbb.push_slot_always(fb::slot(1), fields);
    if let Some(metadata) = metadata {
        fbb.push_slot_always(fb::slot(2), metadata);
    }
    Ok(fbb.end_table(start))
}

/// Reconstruct a logical type from the union tag and its metadata table,
/// recursing into the already-decoded children.
fn decode_field_type(
    tag: u8,
    type_table: Option<Table>,
    children: Vec<Field>,
) -> Result<DataType, PlumeError> {
    let table = || {
        type_table.as_ref().ok_or_else(|| {
            PlumeError::FormatError(format!("type tag {tag} without a type table"))
        })
    };
    let one_child = |mut children: Vec<Field>| -> Result<Box<Field>, PlumeError> {
        if children.len() != 1 {
            return Err(PlumeError::FormatError(format!(
                "type tag {tag} expects one child, found {}",
                children.len()
            )));
        }
        Ok(Box::new(children.remove(0)))
    };
    match tag {
        TYPE_NULL => Ok(DataType::Null),
        TYPE_BOOL => Ok(DataType::Bool),
        TYPE_UTF8 => Ok(DataType::Utf8),
        TYPE_BINARY => Ok(DataType::Binary),
        TYPE_INT => {
            let t = table()?;
            int_from_params(
                fb::scalar_field::<i32>(t, 0, 0),
                fb::scalar_field::<bool>(t, 1, false),
            )
        }
        TYPE_FLOAT => {
            let t = table()?;
            match fb::scalar_field::<i16>(t, 0, 0) {
                0 => Ok(DataType::Float16),
                1 => Ok(DataType::Float32),
                2 => Ok(DataType::Float64),
                p => Err(PlumeError::FormatError(format!("unknown float precision {p}"))),
            }
        }
        TYPE_DECIMAL => {
            let t = table()?;
            Ok(DataType::Decimal {
                precision: fb::scalar_field::<i32>(t, 0, 0) as u8,
                scale: fb::scalar_field::<i32>(t, 1, 0) as i8,
                bit_width: fb::scalar_field::<i32>(t, 2, 128) as u16,
            })
        }
        TYPE_DATE => {
            let t = table()?;
            match fb::scalar_field::<i16>(t, 0, 1) {
                0 => Ok(DataType::Date(DateUnit::Day)),
                1 => Ok(DataType::Date(DateUnit::Millisecond)),
                u => Err(PlumeError::FormatError(format!("unknown date unit {u}"))),
            }
        }
        TYPE_TIME => {
            let t = table()?;
            let unit = time_unit_from(fb::scalar_field::<i16>(t, 0, 1))?;
            match fb::scalar_field::<i32>(t, 1, 32) {
                32 => Ok(DataType::Time32(unit)),
                64 => Ok(DataType::Time64(unit)),
                w => Err(PlumeError::FormatError(format!("unknown time bit width {w}"))),
            }
        }
        TYPE_TIMESTAMP => {
            let t = table()?;
            let unit = time_unit_from(fb::scalar_field::<i16>(t, 0, 0))?;
            Ok(DataType::Timestamp(unit, fb::string_field(t, 1)?))
        }
        TYPE_INTERVAL => {
            let t = table()?;
            match fb::scalar_field::<i16>(t, 0, 0) {
                0 => Ok(DataType::Interval(IntervalUnit::YearMonth)),
                1 => Ok(DataType::Interval(IntervalUnit::DayTime)),
                2 => Ok(DataType::Interval(IntervalUnit::MonthDayNano)),
                u => Err(PlumeError::FormatError(format!("unknown interval unit {u}"))),
            }
        }
        TYPE_LIST => Ok(DataType::List(one_child(children)?)),
        TYPE_STRUCT => Ok(DataType::Struct(children)),
        TYPE_UNION => {
            let t = table()?;
            let mode = match fb::scalar_field::<i16>(t, 0, 0) {
                0 => UnionMode::Sparse,
                1 => UnionMode::Dense,
                m => return Err(PlumeError::FormatError(format!("unknown union mode {m}"))),
            };
            let type_ids = match fb::vector_field::<i32>(t, 1) {
                None => (0..children.len() as i8).collect(),
                Some(ids) => ids.iter().map(|id| id as i8).collect(),
            };
            Ok(DataType::Union(mode, type_ids, children))
        }
        TYPE_FIXED_SIZE_BINARY => {
            Ok(DataType::FixedSizeBinary(fb::scalar_field::<i32>(table()?, 0, 0)))
        }
        TYPE_FIXED_SIZE_LIST => {
            let t = table()?;
            Ok(DataType::FixedSizeList(fb::scalar_field::<i32>(t, 0, 0), one_child(children)?))
        }
        TYPE_MAP => {
            let t = table()?;
            Ok(DataType::Map(one_child(children)?, fb::scalar_field::<bool>(t, 0, false)))
        }
        other => Err(PlumeError::FormatError(format!("unknown type tag {other}"))),
    }
}

pub fn decode_field(table: &Table, memo: &mut DictionaryMemo) -> Result<Field, PlumeError> {
    let name = fb::string_field(table, 0)?.unwrap_or_default();
    let nullable = fb::scalar_field::<bool>(table, 1, false);
    let tag = fb::scalar_field::<u8>(table, 2, 0);
    let type_table = fb::table_field(table, 3);

    let mut children = Vec::new();
    if let Some(v) = fb::vector_field::<ForwardsUOffset<Table>>(table, 5) {
        for child in v.iter() {
            children.push(decode_field(&child, memo)?);
        }
    }

    let value_type = decode_field_type(tag, type_table, children)?;

    // A DictionaryEncoding wraps the decoded value type; ids resolve
    // through the shared per-stream memo.
    let data_type = match fb::table_field(table, 4) {
        None => value_type,
        Some(enc) => {
            let id = fb::scalar_field::<i64>(&enc, 0, 0);
            let index = match fb::table_field(&enc, 1) {
                None => DataType::Int32,
                Some(int) => int_from_params(
                    fb::scalar_field::<i32>(&int, 0, 0),
                    fb::scalar_field::<bool>(&int, 1, false),
                )?,
            };
            let ordered = fb::scalar_field::<bool>(&enc, 2, false);
            memo.bind(id, &value_type)?;
            DataType::Dictionary {
                index: Box::new(index),
                value: Box::new(value_type),
                id,
                ordered,
            }
        }
    };

    let metadata = decode_metadata(table, 6)?;
    Ok(Field { name, data_type, nullable, metadata })
}

pub fn decode_schema(table: &Table, memo: &mut DictionaryMemo) -> Result<Schema, PlumeError> {
    let mut fields = Vec::new();
    if let Some(v) = fb::vector_field::<ForwardsUOffset<Table>>(table, 1) {
        for field in v.iter() {
            fields.push(decode_field(&field, memo)?);
        }
    }
    let metadata = decode_metadata(table, 2)?;
    Schema::try_new_with_metadata(fields, metadata)
}
