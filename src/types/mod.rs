use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::PlumeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateUnit {
    Day,
    Millisecond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    YearMonth,
    DayTime,
    MonthDayNano,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnionMode {
    Sparse,
    Dense,
}

/// Floating point precision tag used by the wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    Single,
    Double,
}

/// The closed set of logical types. Every per-type operation in the crate is
/// an exhaustive match over this enum; there is no open registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
    Binary,
    Utf8,
    FixedSizeBinary(i32),
    Decimal { precision: u8, scale: i8, bit_width: u16 },
    Date(DateUnit),
    Time32(TimeUnit),
    Time64(TimeUnit),
    Timestamp(TimeUnit, Option<String>),
    Interval(IntervalUnit),
    List(Box<Field>),
    FixedSizeList(i32, Box<Field>),
    Struct(Vec<Field>),
    Union(UnionMode, Vec<i8>, Vec<Field>),
    Map(Box<Field>, bool),
    Dictionary { index: Box<DataType>, value: Box<DataType>, id: i64, ordered: bool },
}

/// Which of the four physical buffers a type carries. Buffer ordering on the
/// wire is fixed: validity first, then type ids, then offsets, then values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferLayout {
    pub validity: bool,
    pub type_ids: bool,
    pub offsets: bool,
    pub values: bool,
}

impl DataType {
    /// Fixed byte width of one value slot, `None` for bit-packed, nested and
    /// variable-width types.
    pub fn fixed_byte_width(&self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 | DataType::Float16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
            DataType::Decimal { bit_width, .. } => Some(*bit_width as usize / 8),
            DataType::FixedSizeBinary(w) => Some(*w as usize),
            DataType::Date(DateUnit::Day) => Some(4),
            DataType::Date(DateUnit::Millisecond) => Some(8),
            DataType::Time32(_) => Some(4),
            DataType::Time64(_) => Some(8),
            DataType::Timestamp(_, _) => Some(8),
            DataType::Interval(IntervalUnit::YearMonth) => Some(4),
            DataType::Interval(IntervalUnit::DayTime) => Some(8),
            DataType::Interval(IntervalUnit::MonthDayNano) => Some(16),
            DataType::Dictionary { index, .. } => index.fixed_byte_width(),
            _ => None,
        }
    }

    pub fn is_nested(&self) -> bool {
        matches!(
            self,
            DataType::List(_)
                | DataType::FixedSizeList(_, _)
                | DataType::Struct(_)
                | DataType::Union(_, _, _)
                | DataType::Map(_, _)
        )
    }

    pub fn is_variable_width(&self) -> bool {
        matches!(self, DataType::Binary | DataType::Utf8)
    }

    /// Child fields of nested types, empty otherwise.
    pub fn children(&self) -> &[Field] {
        match self {
            DataType::List(child) | DataType::Map(child, _) => std::slice::from_ref(child),
            DataType::FixedSizeList(_, child) => std::slice::from_ref(child),
            DataType::Struct(children) | DataType::Union(_, _, children) => children,
            _ => &[],
        }
    }

    pub fn buffer_layout(&self) -> BufferLayout {
        match self {
            DataType::Null => BufferLayout::default(),
            DataType::Struct(_) | DataType::FixedSizeList(_, _) => {
                BufferLayout { validity: true, ..Default::default() }
            }
            DataType::Union(UnionMode::Sparse, _, _) => {
                BufferLayout { type_ids: true, ..Default::default() }
            }
            DataType::Union(UnionMode::Dense, _, _) => {
                BufferLayout { type_ids: true, offsets: true, ..Default::default() }
            }
            DataType::List(_) | DataType::Map(_, _) => {
                BufferLayout { validity: true, offsets: true, ..Default::default() }
            }
            DataType::Binary | DataType::Utf8 => {
                BufferLayout { validity: true, offsets: true, values: true, ..Default::default() }
            }
            // Bool, all fixed widths and dictionary indices.
            _ => BufferLayout { validity: true, values: true, ..Default::default() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "Field::default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self { name: name.into(), data_type, nullable, metadata: BTreeMap::new() }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    fn default_nullable() -> bool {
        true
    }
}

/// Ordered field list plus stream-level metadata and the dictionary-id map.
/// The map is derived at construction by walking the field tree; two fields
/// sharing an id must agree on the dictionary value type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    pub fields: Vec<Field>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    dictionaries: BTreeMap<i64, DataType>,
}

// Deserialized by hand so the dictionary-id map is rebuilt from the field
// tree; a derived impl would leave it empty. Conflicting ids in the input
// surface as a deserialization error.
impl<'de> serde::Deserialize<'de> for Schema {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Parts {
            fields: Vec<Field>,
            #[serde(default)]
            metadata: BTreeMap<String, String>,
        }
        let parts = Parts::deserialize(deserializer)?;
        Schema::try_new_with_metadata(parts.fields, parts.metadata)
            .map_err(serde::de::Error::custom)
    }
}

impl Schema {
    pub fn try_new(fields: Vec<Field>) -> Result<Self, PlumeError> {
        Self::try_new_with_metadata(fields, BTreeMap::new())
    }

    pub fn try_new_with_metadata(
        fields: Vec<Field>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, PlumeError> {
        let mut dictionaries = BTreeMap::new();
        for field in &fields {
            collect_dictionaries(&field.data_type, &mut dictionaries)?;
        }
        Ok(Self { fields, metadata, dictionaries })
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new(), metadata: BTreeMap::new(), dictionaries: BTreeMap::new() }
    }

    /// Dictionary-id to dictionary value type, over the whole field tree.
    pub fn dictionaries(&self) -> &BTreeMap<i64, DataType> {
        &self.dictionaries
    }

    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Union of two schemas. Same-name fields must agree on type; the merged
    /// field is nullable if either side is.
    pub fn merge(&self, other: &Schema) -> Result<Schema, PlumeError> {
        let mut fields = self.fields.clone();
        for field in &other.fields {
            match fields.iter_mut().find(|f| f.name == field.name) {
                None => fields.push(field.clone()),
                Some(existing) => {
                    if existing.data_type != field.data_type {
                        return Err(PlumeError::SchemaConflict(format!(
                            "field '{}' declared as {:?} and {:?}",
                            field.name, existing.data_type, field.data_type
                        )));
                    }
                    existing.nullable |= field.nullable;
                }
            }
        }
        let mut metadata = self.metadata.clone();
        metadata.extend(other.metadata.clone());
        Schema::try_new_with_metadata(fields, metadata)
    }
}

fn collect_dictionaries(
    data_type: &DataType,
    out: &mut BTreeMap<i64, DataType>,
) -> Result<(), PlumeError> {
    if let DataType::Dictionary { value, id, .. } = data_type {
        match out.get(id) {
            None => {
                out.insert(*id, (**value).clone());
            }
            Some(existing) if existing == value.as_ref() => {}
            Some(existing) => {
                return Err(PlumeError::SchemaConflict(format!(
                    "dictionary id {id} declared as {existing:?} and {value:?}"
                )));
            }
        }
        return collect_dictionaries(value, out);
    }
    for child in data_type.children() {
        collect_dictionaries(&child.data_type, out)?;
    }
    Ok(())
}

/// Hands out dictionary ids explicitly; callers thread one allocator through
/// schema construction instead of relying on ambient state.
#[derive(Debug, Default)]
pub struct DictionaryIdAllocator {
    next: i64,
}

impl DictionaryIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> i64 {
        let id = self.next;
        self.next += 1;
        id
    }
}
