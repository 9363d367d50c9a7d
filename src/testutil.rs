//! Test and benchmark utilities.
//!
//! This module is only available when the `testutil` feature is enabled.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::builder::Builder;
use crate::core::PlumeError;
use crate::ipc::FileWriter;
use crate::types::{DataType, Field, Schema};
use crate::value::Value;
use crate::vector::{RecordBatch, Vector};

/// RNG seed for deterministic data generation.
pub const TEST_RNG_SEED: u64 = 42;

pub fn make_schema(columns: Vec<(&str, DataType, bool)>) -> Arc<Schema> {
    let fields = columns
        .into_iter()
        .map(|(name, data_type, nullable)| Field::new(name, data_type, nullable))
        .collect();
    Arc::new(Schema::try_new(fields).unwrap())
}

/// Deterministic value for row `i`:
/// - string columns use the stringified row index ("0", "1", "2", ...)
/// - numeric columns use the row index cast to the column type
/// - boolean columns use true for odd indices, false for even
/// - dictionary columns cycle through 16 distinct values to force repeats
pub fn deterministic_value(data_type: &DataType, i: usize) -> Value {
    match data_type {
        DataType::Utf8 => Value::Utf8(i.to_string()),
        DataType::Binary => Value::Binary(i.to_le_bytes().to_vec()),
        DataType::Bool => Value::Bool(i % 2 == 1),
        DataType::Int8 => Value::Int8(i as i8),
        DataType::Int16 => Value::Int16(i as i16),
        DataType::Int32 => Value::Int32(i as i32),
        DataType::Int64 => Value::Int64(i as i64),
        DataType::UInt8 => Value::UInt8(i as u8),
        DataType::UInt16 => Value::UInt16(i as u16),
        DataType::UInt32 => Value::UInt32(i as u32),
        DataType::UInt64 => Value::UInt64(i as u64),
        DataType::Float32 => Value::Float32(i as f32),
        DataType::Float64 => Value::Float64(i as f64),
        DataType::Timestamp(_, _) => Value::Timestamp(i as i64),
        DataType::Dictionary { value, .. } => deterministic_value(value, i % 16),
        other => panic!("unsupported test column type: {other:?}"),
    }
}

pub fn generate_deterministic_vector(data_type: &DataType, num_rows: usize) -> Vector {
    let mut builder = Builder::new(data_type.clone());
    for i in 0..num_rows {
        builder.append(deterministic_value(data_type, i)).unwrap();
    }
    Vector::from_data(builder.flush().unwrap())
}

/// Like `generate_deterministic_vector`, with every third slot null.
pub fn generate_nullable_vector(data_type: &DataType, num_rows: usize) -> Vector {
    let mut builder = Builder::new(data_type.clone());
    for i in 0..num_rows {
        if i % 3 == 2 {
            builder.append_null().unwrap();
        } else {
            builder.append(deterministic_value(data_type, i)).unwrap();
        }
    }
    Vector::from_data(builder.flush().unwrap())
}

pub fn generate_batch(schema: &Arc<Schema>, num_rows: usize) -> RecordBatch {
    let columns = schema
        .fields
        .iter()
        .map(|field| {
            if field.nullable {
                generate_nullable_vector(&field.data_type, num_rows)
            } else {
                generate_deterministic_vector(&field.data_type, num_rows)
            }
        })
        .collect();
    RecordBatch::try_new(schema.clone(), columns).unwrap()
}

/// Write a deterministic IPC file with one batch per entry in `batch_sizes`.
pub fn generate_ipc_file(
    path: &Path,
    schema: &Arc<Schema>,
    batch_sizes: &[usize],
) -> Result<(), PlumeError> {
    let mut writer = FileWriter::create(path, schema.clone())?;
    for &num_rows in batch_sizes {
        writer.write(&generate_batch(schema, num_rows))?;
    }
    writer.finish()
}

/// Deterministic random strings for dictionary and lookup tests.
pub fn random_utf8_values(num: usize, max: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(TEST_RNG_SEED);
    (0..num).map(|_| rng.gen_range(0..max).to_string()).collect()
}
