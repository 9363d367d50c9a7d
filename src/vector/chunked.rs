use crate::core::PlumeError;
use crate::types::{DataType, Field};
use crate::value::Value;
use crate::vector::Vector;

/// Ordered sequence of same-typed vectors behaving as one logical vector.
/// A cumulative-offset array precomputed at construction makes global index
/// resolution an O(log n) binary search over chunk boundaries.
#[derive(Debug, Clone)]
pub struct Chunked {
    data_type: DataType,
    chunks: Vec<Vector>,
    // offsets[i] = first global index of chunk i; offsets[len] = total length.
    offsets: Vec<usize>,
}

impl Chunked {
    pub fn try_new(data_type: DataType, chunks: Vec<Vector>) -> Result<Self, PlumeError> {
        for chunk in &chunks {
            if *chunk.data_type() != data_type {
                return Err(PlumeError::InvalidError(format!(
                    "chunk of type {:?} in a chunked vector of {:?}",
                    chunk.data_type(),
                    data_type
                )));
            }
        }
        let mut offsets = Vec::with_capacity(chunks.len() + 1);
        let mut total = 0;
        offsets.push(0);
        for chunk in &chunks {
            total += chunk.len();
            offsets.push(total);
        }
        Ok(Self { data_type, chunks, offsets })
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn chunks(&self) -> &[Vector] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_count(&self) -> usize {
        self.chunks.iter().map(|c| c.null_count()).sum()
    }

    /// Resolve a global index to (chunk, local index). Zero-length chunks
    /// are never selected: the search lands on the chunk whose half-open
    /// range actually contains `i`.
    pub fn resolve(&self, i: usize) -> Option<(usize, usize)> {
        if i >= self.len() {
            return None;
        }
        let chunk = self.offsets.partition_point(|&start| start <= i) - 1;
        Some((chunk, i - self.offsets[chunk]))
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        let (chunk, local) = self.resolve(i)?;
        self.chunks[chunk].get(local)
    }

    pub fn is_valid(&self, i: usize) -> bool {
        match self.resolve(i) {
            Some((chunk, local)) => self.chunks[chunk].is_valid(local),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.chunks.iter().flat_map(|c| c.iter())
    }

    /// Zero-copy slice spanning chunk boundaries.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Chunked, PlumeError> {
        if offset + len > self.len() {
            return Err(PlumeError::InvalidError(format!(
                "slice [{offset}, {}) out of range for chunked vector of length {}",
                offset + len,
                self.len()
            )));
        }
        let mut out = Vec::new();
        let mut remaining = len;
        let mut pos = offset;
        while remaining > 0 {
            let (chunk, local) = self.resolve(pos).expect("in range");
            let take = remaining.min(self.chunks[chunk].len() - local);
            out.push(self.chunks[chunk].slice(local, take)?);
            pos += take;
            remaining -= take;
        }
        Chunked::try_new(self.data_type.clone(), out)
    }
}

/// A chunked vector paired with its field descriptor.
#[derive(Debug, Clone)]
pub struct Column {
    field: Field,
    chunked: Chunked,
}

impl Column {
    pub fn try_new(field: Field, chunks: Vec<Vector>) -> Result<Self, PlumeError> {
        let chunked = Chunked::try_new(field.data_type.clone(), chunks)?;
        Ok(Self { field, chunked })
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn chunked(&self) -> &Chunked {
        &self.chunked
    }

    pub fn len(&self) -> usize {
        self.chunked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunked.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        self.chunked.get(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;

    fn int32_chunk(values: &[i32]) -> Vector {
        let mut b = Builder::new(DataType::Int32);
        for v in values {
            b.append(Value::Int32(*v)).unwrap();
        }
        Vector::from_data(b.flush().unwrap())
    }

    #[test]
    fn test_boundary_search_with_zero_length_chunk() {
        let chunked = Chunked::try_new(
            DataType::Int32,
            vec![int32_chunk(&[0, 1, 2]), int32_chunk(&[]), int32_chunk(&[3, 4, 5, 6, 7])],
        )
        .unwrap();
        assert_eq!(chunked.len(), 8);
        for i in 0..8 {
            assert_eq!(chunked.get(i), Some(Value::Int32(i as i32)), "index {i}");
        }
        assert_eq!(chunked.get(8), None);
        // The empty chunk is never selected.
        assert_eq!(chunked.resolve(3), Some((2, 0)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = Chunked::try_new(DataType::Int64, vec![int32_chunk(&[1])]).unwrap_err();
        assert!(matches!(err, PlumeError::InvalidError(_)));
    }

    #[test]
    fn test_slice_across_chunks() {
        let chunked = Chunked::try_new(
            DataType::Int32,
            vec![int32_chunk(&[0, 1, 2]), int32_chunk(&[3, 4])],
        )
        .unwrap();
        let s = chunked.slice(2, 3).unwrap();
        assert_eq!(s.len(), 3);
        let got: Vec<Value> = s.iter().collect();
        assert_eq!(got, vec![Value::Int32(2), Value::Int32(3), Value::Int32(4)]);
    }

    #[test]
    fn test_iter_spans_chunks() {
        let chunked =
            Chunked::try_new(DataType::Int32, vec![int32_chunk(&[9]), int32_chunk(&[8])]).unwrap();
        assert_eq!(chunked.iter().count(), 2);
        assert_eq!(chunked.null_count(), 0);
    }
}
