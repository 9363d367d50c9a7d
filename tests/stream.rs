use std::sync::Arc;

use rstest::rstest;

use plume::builder::Builder;
use plume::core::PlumeError;
use plume::ipc::{FileWriter, StreamReader, StreamWriter, WriterOptions};
use plume::testutil::{generate_batch, make_schema};
use plume::types::{DataType, Field, Schema, TimeUnit};
use plume::value::Value;
use plume::vector::{RecordBatch, Table, Vector};

fn test_schema() -> Arc<Schema> {
    make_schema(vec![
        ("id", DataType::Int64, false),
        ("name", DataType::Utf8, true),
        ("score", DataType::Float64, true),
        ("flag", DataType::Bool, true),
        ("ts", DataType::Timestamp(TimeUnit::Microsecond, None), true),
    ])
}

fn write_stream(
    schema: &Arc<Schema>,
    batches: &[RecordBatch],
    options: WriterOptions,
) -> Vec<u8> {
    let mut writer = StreamWriter::with_options(Vec::new(), schema.clone(), options).unwrap();
    for batch in batches {
        writer.write(batch).unwrap();
    }
    writer.finish().unwrap();
    writer.into_inner()
}

fn assert_batches_equal(written: &RecordBatch, read: &RecordBatch) {
    assert_eq!(read.num_rows(), written.num_rows());
    assert_eq!(read.num_columns(), written.num_columns());
    for col in 0..written.num_columns() {
        for row in 0..written.num_rows() {
            assert_eq!(
                read.value(row, col),
                written.value(row, col),
                "mismatch at row {row} column {col}"
            );
        }
    }
}

#[test]
fn test_stream_round_trip_values_and_nulls() {
    let schema = test_schema();
    let batches = vec![generate_batch(&schema, 5), generate_batch(&schema, 3)];
    let bytes = write_stream(&schema, &batches, WriterOptions::default());

    let reader = StreamReader::try_new(bytes.as_slice()).unwrap();
    assert_eq!(reader.schema().fields, schema.fields);
    let read: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
    assert_eq!(read.len(), 2);
    for (written, read) in batches.iter().zip(&read) {
        assert_batches_equal(written, read);
    }
}

#[rstest]
#[case::current(false)]
#[case::legacy(true)]
fn test_round_trip_per_framing(#[case] write_legacy_format: bool) {
    let schema = test_schema();
    let batches = vec![generate_batch(&schema, 4)];
    let bytes = write_stream(&schema, &batches, WriterOptions { write_legacy_format });

    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 1);
    assert_batches_equal(&batches[0], &read[0]);
}

#[test]
fn test_legacy_framing_is_shorter() {
    let schema = test_schema();
    let batches = vec![generate_batch(&schema, 4)];
    let current = write_stream(&schema, &batches, WriterOptions::default());
    let legacy =
        write_stream(&schema, &batches, WriterOptions { write_legacy_format: true });
    // Legacy framing drops the 4-byte continuation marker per message.
    assert!(legacy.len() < current.len());
}

fn dict_type() -> DataType {
    DataType::Dictionary {
        index: Box::new(DataType::Int32),
        value: Box::new(DataType::Utf8),
        id: 0,
        ordered: false,
    }
}

#[test]
fn test_dictionary_delta_between_batches() {
    let schema = Arc::new(Schema::try_new(vec![Field::new("tag", dict_type(), true)]).unwrap());

    // One builder across both batches so the dictionary grows between
    // flushes: the second batch introduces "c" and "d".
    let mut builder = Builder::new(dict_type());
    for v in ["a", "b", "a"] {
        builder.append(Value::Utf8(v.into())).unwrap();
    }
    let batch1 = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();
    for v in ["c", "a", "d"] {
        builder.append(Value::Utf8(v.into())).unwrap();
    }
    let batch2 = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();

    let bytes = write_stream(
        &schema,
        &[batch1.clone(), batch2.clone()],
        WriterOptions::default(),
    );
    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 2);
    assert_batches_equal(&batch1, &read[0]);
    assert_batches_equal(&batch2, &read[1]);
    assert_eq!(read[1].value(2, 0), Some(Value::Utf8("d".into())));
}

#[test]
fn test_dictionary_with_many_repeats_round_trips() {
    let schema = Arc::new(Schema::try_new(vec![Field::new("tag", dict_type(), true)]).unwrap());
    let values = plume::testutil::random_utf8_values(200, 16);

    let mut builder = Builder::new(dict_type());
    for v in &values {
        builder.append(Value::Utf8(v.clone())).unwrap();
    }
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();

    let bytes = write_stream(&schema, &[batch], WriterOptions::default());
    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    for (i, v) in values.iter().enumerate() {
        assert_eq!(read[0].value(i, 0), Some(Value::Utf8(v.clone())));
    }
}

#[test]
fn test_writer_rejects_shrinking_dictionary() {
    let schema = Arc::new(Schema::try_new(vec![Field::new("tag", dict_type(), true)]).unwrap());

    let mut builder = Builder::new(dict_type());
    builder.append(Value::Utf8("a".into())).unwrap();
    let small = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();
    builder.append(Value::Utf8("b".into())).unwrap();
    let big = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();

    // Writing the two-value dictionary first makes the one-value batch a
    // shrink, which the session refuses.
    let mut writer = StreamWriter::try_new(Vec::new(), schema).unwrap();
    writer.write(&big).unwrap();
    let err = writer.write(&small).unwrap_err();
    assert!(matches!(err, PlumeError::ProtocolError(_)));
}

#[test]
fn test_schema_only_stream_yields_one_empty_batch() {
    let schema = test_schema();
    let bytes = write_stream(&schema, &[], WriterOptions::default());

    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].num_rows(), 0);
    assert_eq!(read[0].num_columns(), schema.fields.len());
}

#[test]
fn test_truncated_stream_is_format_error() {
    let schema = test_schema();
    let batches = vec![generate_batch(&schema, 8)];
    let bytes = write_stream(&schema, &batches, WriterOptions::default());

    // Cut inside the record batch message.
    let mut reader = StreamReader::try_new(&bytes[..bytes.len() - 21]).unwrap();
    let err = reader.next().unwrap().unwrap_err();
    assert!(matches!(err, PlumeError::FormatError(_)));
    // The reader fuses after an error.
    assert!(reader.next().is_none());
}

#[test]
fn test_empty_input_is_protocol_error() {
    let err = StreamReader::try_new([].as_slice()).unwrap_err();
    assert!(matches!(err, PlumeError::ProtocolError(_)));
}

#[test]
fn test_schema_change_mid_stream_resets_session() {
    let first = test_schema();
    let second = make_schema(vec![("x", DataType::Int32, true)]);
    let batch1 = generate_batch(&first, 3);
    let batch2 = generate_batch(&second, 2);

    // The writer switches to the new schema in place, emitting a fresh
    // schema message; the reader follows it.
    let mut writer = StreamWriter::try_new(Vec::new(), first.clone()).unwrap();
    writer.write(&batch1).unwrap();
    writer.write(&batch2).unwrap();
    assert_eq!(writer.schema().fields, second.fields);
    writer.finish().unwrap();
    let bytes = writer.into_inner();

    let reader = StreamReader::try_new(bytes.as_slice()).unwrap();
    assert_eq!(reader.schema().fields, first.fields);
    let read: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
    assert_eq!(read.len(), 2);
    assert_batches_equal(&batch1, &read[0]);
    assert_batches_equal(&batch2, &read[1]);
}

#[test]
fn test_file_writer_rejects_mismatched_batch_schema() {
    let schema = test_schema();
    let other = make_schema(vec![("x", DataType::Int32, true)]);
    let batch = generate_batch(&other, 2);
    let mut writer = FileWriter::try_new(Vec::new(), schema).unwrap();
    let err = writer.write(&batch).unwrap_err();
    assert!(matches!(err, PlumeError::SchemaConflict(_)));
}

#[test]
fn test_write_table_streams_every_batch() {
    let schema = test_schema();
    let table = Table::try_new(
        schema.clone(),
        vec![generate_batch(&schema, 4), generate_batch(&schema, 2)],
    )
    .unwrap();

    let mut writer = StreamWriter::try_new(Vec::new(), schema).unwrap();
    writer.write_table(&table).unwrap();
    writer.finish().unwrap();
    let bytes = writer.into_inner();

    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 2);
    for (written, read) in table.batches().iter().zip(&read) {
        assert_batches_equal(written, read);
    }
}

#[test]
fn test_write_after_finish_rejected() {
    let schema = test_schema();
    let batch = generate_batch(&schema, 1);
    let mut writer = StreamWriter::try_new(Vec::new(), schema).unwrap();
    writer.finish().unwrap();
    let err = writer.write(&batch).unwrap_err();
    assert!(matches!(err, PlumeError::ProtocolError(_)));
}

#[test]
fn test_backfilled_batch_round_trips() {
    let schema = Arc::new(
        Schema::try_new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("flag", DataType::Bool, true),
            Field::new("n", DataType::Int64, true),
            Field::new("note", DataType::Utf8, true),
        ])
        .unwrap(),
    );

    // Columns of uneven length: the short ones get null-padded and the
    // missing trailing column becomes all-null.
    let mut names = Builder::new(DataType::Utf8);
    names.append(Value::Utf8("ada".into())).unwrap();
    let mut flags = Builder::new(DataType::Bool);
    flags.append(Value::Bool(true)).unwrap();
    flags.append(Value::Bool(false)).unwrap();
    let mut ns = Builder::new(DataType::Int64);
    for v in [10, 20, 30] {
        ns.append(Value::Int64(v)).unwrap();
    }
    let batch = RecordBatch::try_new_backfill(
        schema.clone(),
        vec![
            Vector::from_data(names.flush().unwrap()),
            Vector::from_data(flags.flush().unwrap()),
            Vector::from_data(ns.flush().unwrap()),
        ],
    )
    .unwrap();
    assert_eq!(batch.num_rows(), 3);

    let bytes = write_stream(&schema, &[batch.clone()], WriterOptions::default());
    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 1);
    assert_batches_equal(&batch, &read[0]);
    assert_eq!(read[0].value(0, 0), Some(Value::Utf8("ada".into())));
    assert_eq!(read[0].value(2, 0), Some(Value::Null));
    assert_eq!(read[0].value(2, 1), Some(Value::Null));
    assert_eq!(read[0].value(2, 2), Some(Value::Int64(30)));
    assert_eq!(read[0].value(1, 3), Some(Value::Null));
}

#[test]
fn test_map_and_fixed_size_list_round_trip() {
    let map_type = DataType::Map(
        Box::new(Field::new(
            "entries",
            DataType::Struct(vec![
                Field::new("key", DataType::Utf8, false),
                Field::new("value", DataType::Int32, true),
            ]),
            false,
        )),
        false,
    );
    let fsl_type =
        DataType::FixedSizeList(3, Box::new(Field::new("item", DataType::Int32, true)));
    let schema = Arc::new(
        Schema::try_new(vec![
            Field::new("m", map_type.clone(), true),
            Field::new("xyz", fsl_type.clone(), true),
        ])
        .unwrap(),
    );

    let mut maps = Builder::new(map_type);
    maps.append(Value::Map(vec![
        (Value::Utf8("a".into()), Value::Int32(1)),
        (Value::Utf8("b".into()), Value::Int32(2)),
    ]))
    .unwrap();
    maps.append(Value::Null).unwrap();
    maps.append(Value::Map(vec![(Value::Utf8("c".into()), Value::Null)])).unwrap();

    let mut lists = Builder::new(fsl_type);
    lists
        .append(Value::List(vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]))
        .unwrap();
    lists
        .append(Value::List(vec![Value::Int32(4), Value::Null, Value::Int32(6)]))
        .unwrap();
    lists.append(Value::Null).unwrap();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Vector::from_data(maps.flush().unwrap()),
            Vector::from_data(lists.flush().unwrap()),
        ],
    )
    .unwrap();

    let bytes = write_stream(&schema, &[batch.clone()], WriterOptions::default());
    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 1);
    assert_batches_equal(&batch, &read[0]);
    assert_eq!(
        read[0].value(0, 0),
        Some(Value::Map(vec![
            (Value::Utf8("a".into()), Value::Int32(1)),
            (Value::Utf8("b".into()), Value::Int32(2)),
        ]))
    );
}

#[test]
fn test_sparse_union_round_trip() {
    let union_type = DataType::Union(
        plume::types::UnionMode::Sparse,
        vec![0, 1],
        vec![
            Field::new("i", DataType::Int32, true),
            Field::new("s", DataType::Utf8, true),
        ],
    );
    let schema =
        Arc::new(Schema::try_new(vec![Field::new("u", union_type.clone(), false)]).unwrap());

    let mut builder = Builder::new(union_type);
    builder.append(Value::Union(0, Box::new(Value::Int32(5)))).unwrap();
    builder.append(Value::Union(1, Box::new(Value::Utf8("five".into())))).unwrap();
    builder.append(Value::Union(0, Box::new(Value::Null))).unwrap();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Vector::from_data(builder.flush().unwrap())],
    )
    .unwrap();

    let bytes = write_stream(&schema, &[batch.clone()], WriterOptions::default());
    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 1);
    assert_batches_equal(&batch, &read[0]);
    assert_eq!(read[0].value(1, 0), Some(Value::Union(1, Box::new(Value::Utf8("five".into())))));
}

#[test]
fn test_sliced_batch_round_trips() {
    let schema = test_schema();
    let full = generate_batch(&schema, 10);
    let sliced = full.slice(3, 4).unwrap();
    let bytes = write_stream(&schema, &[sliced.clone()], WriterOptions::default());

    let read: Vec<RecordBatch> = StreamReader::try_new(bytes.as_slice())
        .unwrap()
        .map(|b| b.unwrap())
        .collect();
    assert_eq!(read.len(), 1);
    assert_batches_equal(&sliced, &read[0]);
}
