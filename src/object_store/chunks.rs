//! Chunk planning for multipart transfers.
//!
//! A plan is `chunk_count` chunks of exactly `chunk_size` bytes, followed by at
//! most one trailing chunk holding the remainder.

use crate::error::{CourierError, Result};

/// One contiguous byte range of a multipart transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based, contiguous
    pub part_number: u32,
    pub size: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    chunk_size: u64,
    chunk_count: u64,
    trailing_chunk_size: u64,
    chunks: Vec<Chunk>,
}

impl ChunkPlan {
    /// Size of every non-trailing chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of full-size chunks, excluding the trailing chunk
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Size of the trailing remainder chunk, zero when there is none
    pub fn trailing_chunk_size(&self) -> u64 {
        self.trailing_chunk_size
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

impl IntoIterator for ChunkPlan {
    type Item = Chunk;
    type IntoIter = std::vec::IntoIter<Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}

/// Plan the chunks for a transfer of `size` bytes
pub fn plan(size: u64, minimum_chunk_size: u64, maximum_chunk_count: u64) -> Result<ChunkPlan> {
    if maximum_chunk_count < 1 {
        return Err(CourierError::Validation(format!(
            "Maximum chunk count must be at least 1 (got {})",
            maximum_chunk_count
        )));
    }
    if minimum_chunk_size < 1 {
        return Err(CourierError::Validation(
            "Minimum chunk size must be at least 1".to_string(),
        ));
    }
    if minimum_chunk_size > size {
        return Err(CourierError::Validation(format!(
            "Minimum chunk size {} exceeds the size {}",
            minimum_chunk_size, size
        )));
    }

    let chunk_size = (size / maximum_chunk_count).max(minimum_chunk_size);
    let chunk_count = size / chunk_size;
    let trailing_chunk_size = size - chunk_count * chunk_size;

    let mut chunks = Vec::with_capacity(chunk_count as usize + 1);
    let mut offset = 0u64;
    for index in 0..chunk_count {
        chunks.push(Chunk {
            part_number: part_number(index)?,
            size: chunk_size,
            offset,
        });
        offset += chunk_size;
    }
    if trailing_chunk_size > 0 {
        chunks.push(Chunk {
            part_number: part_number(chunk_count)?,
            size: trailing_chunk_size,
            offset,
        });
    }

    let plan = ChunkPlan {
        chunk_size,
        chunk_count,
        trailing_chunk_size,
        chunks,
    };
    check_invariants(&plan, size, minimum_chunk_size, maximum_chunk_count)?;
    Ok(plan)
}

fn part_number(index: u64) -> Result<u32> {
    u32::try_from(index + 1)
        .map_err(|_| CourierError::Invariant(format!("Part number {} out of range", index + 1)))
}

fn check_invariants(
    plan: &ChunkPlan,
    size: u64,
    minimum_chunk_size: u64,
    maximum_chunk_count: u64,
) -> Result<()> {
    let total = plan.total_size();
    if total != size {
        return Err(CourierError::Invariant(format!(
            "Chunk sizes sum to {} but the size is {}",
            total, size
        )));
    }
    if plan.chunk_count > maximum_chunk_count {
        return Err(CourierError::Invariant(format!(
            "Chunk count {} exceeds the maximum {}",
            plan.chunk_count, maximum_chunk_count
        )));
    }
    if plan.chunk_size < minimum_chunk_size {
        return Err(CourierError::Invariant(format!(
            "Chunk size {} is below the minimum {}",
            plan.chunk_size, minimum_chunk_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_exact_single_chunk() {
        let plan = plan(10_000_000, 10_000_000, 100).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.chunks()[0],
            Chunk {
                part_number: 1,
                size: 10_000_000,
                offset: 0
            }
        );
    }

    #[test]
    fn test_ten_chunks() {
        let plan = plan(100_000_000, 10_000_000, 100).unwrap();
        assert_eq!(plan.len(), 10);
        assert!(plan.chunks().iter().all(|c| c.size == 10_000_000));
        assert_eq!(plan.trailing_chunk_size(), 0);
    }

    #[test]
    fn test_count_limited_by_minimum() {
        let plan = plan(1_000_000_000, 5_000_000, 200).unwrap();
        assert_eq!(plan.len(), 200);
        assert!(plan.chunks().iter().all(|c| c.size == 5_000_000));
    }

    #[test]
    fn test_trailing_remainder() {
        let plan = plan(479_001_599, 10_000_000, 200).unwrap();
        assert_eq!(plan.len(), 48);
        for chunk in &plan.chunks()[..47] {
            assert_eq!(chunk.size, 10_000_000);
        }
        let last = plan.chunks()[47];
        assert_eq!(last.size, 9_001_599);
        assert_eq!(last.part_number, 48);
        assert_eq!(last.offset, 470_000_000);
    }

    #[test]
    fn test_parts_are_contiguous() {
        let plan = plan(123_456_789, 10_000_000, 7).unwrap();
        let mut expected_offset = 0;
        for (index, chunk) in plan.chunks().iter().enumerate() {
            assert_eq!(chunk.part_number as usize, index + 1);
            assert_eq!(chunk.offset, expected_offset);
            expected_offset += chunk.size;
        }
        assert_eq!(expected_offset, 123_456_789);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            plan(100, 10, 0),
            Err(CourierError::Validation(_))
        ));
        assert!(matches!(
            plan(100, 101, 10),
            Err(CourierError::Validation(_))
        ));
        assert!(matches!(plan(100, 0, 10), Err(CourierError::Validation(_))));
    }

    #[test]
    fn test_random_inputs_respect_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let size = rng.gen_range(10_000_000u64..=10_000_000_000);
            let minimum = rng.gen_range(10_000_000u64..=100_000_000).min(size);
            let maximum = rng.gen_range(1u64..=1000);

            let plan = plan(size, minimum, maximum).unwrap();
            assert!(plan.chunk_size() >= minimum);
            assert!(plan.chunk_count() <= maximum);
            assert_eq!(
                plan.chunk_count() * plan.chunk_size() + plan.trailing_chunk_size(),
                size
            );
            assert!(plan.trailing_chunk_size() < plan.chunk_size());
        }
    }
}
