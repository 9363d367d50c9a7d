use half::f16;

/// Dynamic scalar used by the element-level get/set surfaces. One variant
/// per physical encoding; nested values carry their children by value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float16(f16),
    Float32(f32),
    Float64(f64),
    Binary(Vec<u8>),
    Utf8(String),
    FixedSizeBinary(Vec<u8>),
    Decimal(i128),
    Date32(i32),
    Date64(i64),
    Time32(i32),
    Time64(i64),
    Timestamp(i64),
    IntervalYearMonth(i32),
    IntervalDayTime { days: i32, millis: i32 },
    IntervalMonthDayNano { months: i32, days: i32, nanos: i64 },
    List(Vec<Value>),
    Struct(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Union(i8, Box<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Equality for null-sentinel matching: like `==` except NaN matches NaN
    /// (so a caller can declare NaN itself a null sentinel).
    pub fn sentinel_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float32(a), Value::Float32(b)) if a.is_nan() && b.is_nan() => true,
            (Value::Float64(a), Value::Float64(b)) if a.is_nan() && b.is_nan() => true,
            (Value::Float16(a), Value::Float16(b)) if a.is_nan() && b.is_nan() => true,
            _ => self == other,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            None => Value::Null,
            Some(v) => v.into(),
        }
    }
}
