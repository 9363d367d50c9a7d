use crate::builder::Builder;
use crate::core::PlumeError;
use crate::value::Value;
use crate::vector::Vector;

/// Caller-chosen flush points for `Chunks`: flush whenever either bound is
/// crossed. Purely a pull-side batching policy, not a schedule.
#[derive(Debug, Clone, Copy)]
pub struct ChunkWatermark {
    pub rows: Option<usize>,
    pub bytes: Option<usize>,
}

impl ChunkWatermark {
    pub fn rows(rows: usize) -> Self {
        Self { rows: Some(rows), bytes: None }
    }

    pub fn bytes(bytes: usize) -> Self {
        Self { rows: None, bytes: Some(bytes) }
    }

    fn reached(&self, builder: &Builder) -> bool {
        self.rows.is_some_and(|r| builder.len() >= r)
            || self.bytes.is_some_and(|b| builder.byte_len() >= b)
    }
}

/// Drives a builder from a value source, flushing and yielding a `Vector`
/// whenever the watermark is reached, then continuing with the remaining
/// values. The final partial chunk is yielded at source exhaustion.
pub struct Chunks<'a, I: Iterator<Item = Value>> {
    builder: &'a mut Builder,
    source: I,
    watermark: ChunkWatermark,
    done: bool,
}

impl<'a, I: Iterator<Item = Value>> Chunks<'a, I> {
    pub fn new(builder: &'a mut Builder, source: I, watermark: ChunkWatermark) -> Self {
        Self { builder, source, watermark, done: false }
    }
}

impl<I: Iterator<Item = Value>> Iterator for Chunks<'_, I> {
    type Item = Result<Vector, PlumeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.source.next() {
                Some(value) => {
                    if let Err(e) = self.builder.append(value) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    if self.watermark.reached(self.builder) {
                        return Some(self.builder.flush().map(Vector::from_data));
                    }
                }
                None => {
                    self.done = true;
                    if self.builder.is_empty() {
                        return None;
                    }
                    return Some(self.builder.flush().map(Vector::from_data));
                }
            }
        }
    }
}

impl Builder {
    /// Chunking helper: consume `source`, yielding one vector per watermark
    /// crossing. The builder stays usable afterwards.
    pub fn through_iter<I>(
        &mut self,
        source: I,
        watermark: ChunkWatermark,
    ) -> Chunks<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Value>,
    {
        Chunks::new(self, source.into_iter(), watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_row_watermark_chunks() {
        let mut builder = Builder::new(DataType::Int32);
        let values = (0..7).map(Value::Int32);
        let chunks: Vec<Vector> = builder
            .through_iter(values, ChunkWatermark::rows(3))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(chunks[2].get(0), Some(Value::Int32(6)));
    }

    #[test]
    fn test_byte_watermark_chunks() {
        let mut builder = Builder::new(DataType::Utf8);
        let values = (0..4).map(|i| Value::Utf8(format!("value-{i}-{}", "x".repeat(30))));
        let chunks: Vec<Vector> = builder
            .through_iter(values, ChunkWatermark::bytes(64))
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 4);
    }

    #[test]
    fn test_exact_multiple_leaves_no_trailing_chunk() {
        let mut builder = Builder::new(DataType::Int32);
        let chunks: Vec<Vector> = builder
            .through_iter((0..4).map(Value::Int32), ChunkWatermark::rows(2))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
    }
}
