//! Cut an upload stream into fixed-size slices

use super::types::PlainSlice;
use crate::crypto::sha256;
use crate::error::{DcpError, Result};
use std::io::Read;
use uuid::Uuid;

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Slicer {
    block_size: usize,
}

impl Default for Slicer {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Slicer {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(DcpError::Param("slicer block size must be positive".into()));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Read the whole stream; only the last slice may be short
    pub fn slice<R: Read>(&self, mut reader: R) -> Result<Vec<PlainSlice>> {
        let mut slices = Vec::new();
        loop {
            let mut block = Vec::with_capacity(self.block_size);
            (&mut reader)
                .take(self.block_size as u64)
                .read_to_end(&mut block)?;
            if block.is_empty() {
                break;
            }
            let short = block.len() < self.block_size;
            slices.push(PlainSlice {
                id: Uuid::new_v4().to_string(),
                index: slices.len() as u64,
                hash: sha256(&block),
                data: block,
            });
            if short {
                break;
            }
        }
        log::debug!("sliced stream into {} blocks of {} bytes", slices.len(), self.block_size);
        Ok(slices)
    }
}
