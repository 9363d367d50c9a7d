use std::sync::Arc;

use crate::core::PlumeError;
use crate::data::Data;
use crate::types::Schema;
use crate::value::Value;
use crate::vector::{Column, Vector};

/// Equal-length columns under one schema; the unit of IPC exchange.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    schema: Arc<Schema>,
    columns: Vec<Vector>,
    num_rows: usize,
}

impl RecordBatch {
    pub fn try_new(schema: Arc<Schema>, columns: Vec<Vector>) -> Result<Self, PlumeError> {
        if columns.len() != schema.fields.len() {
            return Err(PlumeError::InvalidError(format!(
                "{} columns for a schema of {} fields",
                columns.len(),
                schema.fields.len()
            )));
        }
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        for (field, column) in schema.fields.iter().zip(&columns) {
            if column.len() != num_rows {
                return Err(PlumeError::InvalidError(format!(
                    "column '{}' has {} rows, expected {num_rows}",
                    field.name,
                    column.len()
                )));
            }
            if column.data_type() != &field.data_type {
                return Err(PlumeError::InvalidError(format!(
                    "column '{}' is {:?}, schema declares {:?}",
                    field.name,
                    column.data_type(),
                    field.data_type
                )));
            }
        }
        Ok(Self { schema, columns, num_rows })
    }

    /// Lenient constructor: missing trailing columns become all-null and
    /// short columns are padded with nulls to the longest column's length.
    pub fn try_new_backfill(
        schema: Arc<Schema>,
        mut columns: Vec<Vector>,
    ) -> Result<Self, PlumeError> {
        if columns.len() > schema.fields.len() {
            return Err(PlumeError::InvalidError(format!(
                "{} columns for a schema of {} fields",
                columns.len(),
                schema.fields.len()
            )));
        }
        let num_rows = columns.iter().map(|c| c.len()).max().unwrap_or(0);
        for (i, column) in columns.iter_mut().enumerate() {
            if column.len() < num_rows {
                let padded = column.data().pad_length(num_rows - column.len())?;
                *column = Vector::from_data(padded);
            }
            if column.data_type() != &schema.fields[i].data_type {
                return Err(PlumeError::InvalidError(format!(
                    "column '{}' is {:?}, schema declares {:?}",
                    schema.fields[i].name,
                    column.data_type(),
                    schema.fields[i].data_type
                )));
            }
        }
        for field in schema.fields.iter().skip(columns.len()) {
            columns.push(Vector::from_data(Data::new_null(&field.data_type, num_rows)));
        }
        Ok(Self { schema, columns, num_rows })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Vector] {
        &self.columns
    }

    pub fn column(&self, i: usize) -> &Vector {
        &self.columns[i]
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Vector> {
        self.schema.index_of(name).map(|i| &self.columns[i])
    }

    /// Cell access by (row, column index); no dynamic row objects.
    pub fn value(&self, row: usize, column: usize) -> Option<Value> {
        self.columns.get(column)?.get(row)
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<RecordBatch, PlumeError> {
        let columns = self
            .columns
            .iter()
            .map(|c| c.slice(offset, len))
            .collect::<Result<Vec<_>, _>>()?;
        RecordBatch::try_new(self.schema.clone(), columns)
    }
}

/// Schema plus an ordered sequence of record batches.
#[derive(Debug, Clone)]
pub struct Table {
    schema: Arc<Schema>,
    batches: Vec<RecordBatch>,
}

impl Table {
    pub fn try_new(schema: Arc<Schema>, batches: Vec<RecordBatch>) -> Result<Self, PlumeError> {
        for batch in &batches {
            if batch.schema().fields != schema.fields {
                return Err(PlumeError::SchemaConflict(
                    "record batch schema differs from table schema".into(),
                ));
            }
        }
        Ok(Self { schema, batches })
    }

    pub fn empty(schema: Arc<Schema>) -> Self {
        Self { schema, batches: Vec::new() }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields.len()
    }

    /// Column `i` as a chunked view spanning every batch.
    pub fn column(&self, i: usize) -> Result<Column, PlumeError> {
        let chunks = self.batches.iter().map(|b| b.column(i).clone()).collect();
        Column::try_new(self.schema.fields[i].clone(), chunks)
    }

    pub fn column_by_name(&self, name: &str) -> Result<Column, PlumeError> {
        let i = self.schema.index_of(name).ok_or_else(|| {
            PlumeError::InvalidError(format!("no column named '{name}'"))
        })?;
        self.column(i)
    }
}
