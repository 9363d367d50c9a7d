use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use plume::builder::Builder;
use plume::core::PlumeError;
use plume::ipc::{FileReader, FileWriter};
use plume::testutil::{generate_batch, generate_ipc_file, make_schema};
use plume::types::{DataType, Field, Schema};
use plume::value::Value;
use plume::vector::{RecordBatch, Vector};

fn test_schema() -> Arc<Schema> {
    make_schema(vec![
        ("id", DataType::Int64, false),
        ("name", DataType::Utf8, true),
        ("score", DataType::Float64, true),
    ])
}

fn assert_batches_equal(written: &RecordBatch, read: &RecordBatch) {
    assert_eq!(read.num_rows(), written.num_rows());
    for col in 0..written.num_columns() {
        for row in 0..written.num_rows() {
            assert_eq!(read.value(row, col), written.value(row, col));
        }
    }
}

#[test]
fn test_file_round_trip_and_random_access() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.arrow");
    let schema = test_schema();
    generate_ipc_file(&path, &schema, &[4, 2, 6]).unwrap();

    let reader = FileReader::open(&path).unwrap();
    assert_eq!(reader.schema().fields, schema.fields);
    assert_eq!(reader.num_batches(), 3);

    // Batches decode independently of ordering.
    assert_eq!(reader.batch(2).unwrap().num_rows(), 6);
    assert_eq!(reader.batch(0).unwrap().num_rows(), 4);
    assert_batches_equal(&generate_batch(&schema, 2), &reader.batch(1).unwrap());

    let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
    assert_eq!(rows, 12);
}

#[test]
fn test_file_from_in_memory_bytes() {
    let schema = test_schema();
    let batch = generate_batch(&schema, 5);
    let mut writer = FileWriter::try_new(Vec::new(), schema.clone()).unwrap();
    writer.write(&batch).unwrap();
    writer.finish().unwrap();
    let bytes = writer.into_inner();

    let reader = FileReader::from_bytes(Bytes::from(bytes)).unwrap();
    assert_eq!(reader.num_batches(), 1);
    assert_batches_equal(&batch, &reader.batch(0).unwrap());
}

#[test]
fn test_file_with_dictionary_delta() {
    let dict_type = DataType::Dictionary {
        index: Box::new(DataType::Int32),
        value: Box::new(DataType::Utf8),
        id: 1,
        ordered: false,
    };
    let schema =
        Arc::new(Schema::try_new(vec![Field::new("tag", dict_type.clone(), true)]).unwrap());

    let mut builder = Builder::new(dict_type);
    for v in ["x", "y"] {
        builder.append(Value::Utf8(v.into())).unwrap();
    }
    let batch1 = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();
    for v in ["z", "x"] {
        builder.append(Value::Utf8(v.into())).unwrap();
    }
    let batch2 = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();

    let mut writer = FileWriter::try_new(Vec::new(), schema).unwrap();
    writer.write(&batch1).unwrap();
    writer.write(&batch2).unwrap();
    writer.finish().unwrap();

    // Dictionaries materialize at open, so the second batch decodes first.
    let reader = FileReader::from_bytes(Bytes::from(writer.into_inner())).unwrap();
    let read2 = reader.batch(1).unwrap();
    assert_eq!(read2.value(0, 0), Some(Value::Utf8("z".into())));
    assert_eq!(read2.value(1, 0), Some(Value::Utf8("x".into())));
    assert_batches_equal(&batch1, &reader.batch(0).unwrap());
}

#[test]
fn test_finish_is_idempotent() {
    let schema = test_schema();
    let mut writer = FileWriter::try_new(Vec::new(), schema).unwrap();
    writer.write(&generate_batch(&test_schema(), 1)).unwrap();
    writer.finish().unwrap();
    writer.finish().unwrap();
    let bytes = writer.into_inner();
    assert_eq!(FileReader::from_bytes(Bytes::from(bytes)).unwrap().num_batches(), 1);
}

#[test]
fn test_bad_leading_magic_rejected() {
    let schema = test_schema();
    let mut writer = FileWriter::try_new(Vec::new(), schema).unwrap();
    writer.finish().unwrap();
    let mut bytes = writer.into_inner();
    bytes[0] = b'X';
    let err = FileReader::from_bytes(Bytes::from(bytes)).unwrap_err();
    assert!(matches!(err, PlumeError::FormatError(_)));
}

#[test]
fn test_truncated_file_rejected() {
    let schema = test_schema();
    let mut writer = FileWriter::try_new(Vec::new(), schema).unwrap();
    writer.write(&generate_batch(&test_schema(), 3)).unwrap();
    writer.finish().unwrap();
    let bytes = writer.into_inner();
    // Dropping the tail removes the trailing magic.
    let err = FileReader::from_bytes(Bytes::copy_from_slice(&bytes[..bytes.len() - 4]))
        .unwrap_err();
    assert!(matches!(err, PlumeError::FormatError(_)));
}

#[test]
fn test_tiny_input_rejected() {
    let err = FileReader::from_bytes(Bytes::from_static(b"ARROW1")).unwrap_err();
    assert!(matches!(err, PlumeError::FormatError(_)));
}

#[test]
fn test_batch_index_out_of_range() {
    let schema = test_schema();
    let mut writer = FileWriter::try_new(Vec::new(), schema).unwrap();
    writer.finish().unwrap();
    let reader = FileReader::from_bytes(Bytes::from(writer.into_inner())).unwrap();
    assert_eq!(reader.num_batches(), 0);
    let err = reader.batch(0).unwrap_err();
    assert!(matches!(err, PlumeError::InvalidError(_)));
}
