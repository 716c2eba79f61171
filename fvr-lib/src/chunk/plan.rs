use crate::{FvrError, FvrResult};
use serde::{Deserialize, Serialize};

/// Byte range of one chunk inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDesc {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

impl ChunkDesc {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length
    }
}

/// Partitions a file into fixed size chunks; only the last one may be shorter.
///
/// Planning is a pure function of `(size, chunk_size)`, so a retried upload
/// always derives the same boundaries. A zero-length file has no chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    chunk_size: u64,
}

impl ChunkPlanner {
    pub fn new(chunk_size: u64) -> FvrResult<Self> {
        if chunk_size == 0 {
            return Err(FvrError::InvalidParam("chunk_size must be > 0".to_string()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size)
    }

    pub fn chunk_at(&self, index: u64, size: u64) -> FvrResult<ChunkDesc> {
        let offset = index
            .checked_mul(self.chunk_size)
            .ok_or_else(|| FvrError::InvalidParam(format!("chunk index overflow: {}", index)))?;
        if offset >= size {
            return Err(FvrError::InvalidParam(format!(
                "chunk index {} out of range for size {}",
                index, size
            )));
        }
        Ok(ChunkDesc {
            index,
            offset,
            length: self.chunk_size.min(size - offset),
        })
    }

    pub fn plan(&self, size: u64) -> Vec<ChunkDesc> {
        (0..self.chunk_count(size))
            .map(|index| {
                let offset = index * self.chunk_size;
                ChunkDesc {
                    index,
                    offset,
                    length: self.chunk_size.min(size - offset),
                }
            })
            .collect()
    }
}
