use std::num::NonZeroUsize;
use std::sync::Arc;

/// One Data write worth of the image
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Block {
    pub index: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Splits an image into consecutive blocks of `block_size` bytes.
///
/// Blocks come out in ascending order with no gaps; only the last one may be
/// shorter. The source cannot be rewound, build a new one to start over.
#[derive(Debug)]
pub struct BlockSource {
    image: Arc<[u8]>,
    block_size: NonZeroUsize,
    offset: usize,
    index: usize,
}

impl BlockSource {
    pub fn new(image: Arc<[u8]>, block_size: NonZeroUsize) -> Self {
        Self {
            image,
            block_size,
            offset: 0,
            index: 0,
        }
    }

    pub fn next_block(&mut self) -> Option<Block> {
        if self.offset >= self.image.len() {
            return None;
        }
        let end = std::cmp::min(self.image.len(), self.offset + self.block_size.get());
        let block = Block {
            index: self.index,
            offset: self.offset,
            data: self.image[self.offset..end].to_vec(),
        };
        self.offset = end;
        self.index += 1;
        Some(block)
    }

    pub fn total_bytes(&self) -> usize {
        self.image.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.image.len().div_ceil(self.block_size.get())
    }

    pub fn block_size(&self) -> usize {
        self.block_size.get()
    }

    /// Bytes handed out so far
    pub fn position(&self) -> usize {
        self.offset
    }
}

impl Iterator for BlockSource {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        self.next_block()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total_blocks() - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for BlockSource {}
