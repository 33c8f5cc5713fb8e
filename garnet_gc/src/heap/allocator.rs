//! Per-size-class allocation.
//!
//! An `Allocator` owns every block of one cell size. Allocation pops a free
//! cell from the most recently used block that still has space, appending a
//! fresh block when none does.

use super::block::{Block, HeapBlock};
use std::ptr::NonNull;

/// Owns the blocks of one cell-size class.
pub struct Allocator {
    cell_size: usize,
    blocks: Vec<Block>,
    /// Blocks known to have at least one free cell. Stack discipline: the
    /// most recently touched block stays hot.
    free_blocks: Vec<NonNull<HeapBlock>>,
}

impl Allocator {
    /// Create an empty allocator for one cell size.
    pub fn new(cell_size: usize) -> Self {
        Self {
            cell_size,
            blocks: Vec::new(),
            free_blocks: Vec::new(),
        }
    }

    /// The cell size this allocator serves.
    #[inline]
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Total cells across all blocks.
    pub fn total_cells(&self) -> usize {
        self.blocks.iter().map(|b| b.header().cell_count()).sum()
    }

    /// Free cells across all blocks.
    pub fn free_cells(&self) -> usize {
        self.blocks.iter().map(|b| b.header().free_count()).sum()
    }

    /// Append a new block. Returns its base address and cell count so the
    /// heap can update its address bounds and counters.
    pub fn add_block(&mut self) -> (usize, usize) {
        let block = Block::new(self.cell_size).expect("out of memory mapping a heap block");
        let base = block.base();
        let cells = block.header().cell_count();
        self.free_blocks
            .push(NonNull::new(base as *mut HeapBlock).unwrap());
        self.blocks.push(block);
        (base, cells)
    }

    /// Pop a free cell, appending a block if every block is full.
    ///
    /// Returns the cell pointer and whether a new block was mapped (the heap
    /// uses that to refresh bounds/counters).
    pub fn allocate(&mut self) -> (*mut u8, Option<(usize, usize)>) {
        let mut added = None;
        if self.free_blocks.is_empty() {
            added = Some(self.add_block());
        }
        let mut block_ptr = *self.free_blocks.last().expect("free block");
        let block = unsafe { block_ptr.as_mut() };
        let cell = block.find_next_free_cell();
        if !block.has_free() {
            self.free_blocks.pop();
        }
        (cell, added)
    }

    /// Re-register a block that regained free space during sweep.
    pub fn note_block_has_free(&mut self, block: NonNull<HeapBlock>) {
        if !self.free_blocks.contains(&block) {
            self.free_blocks.push(block);
        }
    }

    /// Visit every block header.
    pub fn each_block(&self, mut f: impl FnMut(&HeapBlock)) {
        for block in &self.blocks {
            f(block.header());
        }
    }

    /// Visit every block header mutably.
    pub fn each_block_mut(&mut self, mut f: impl FnMut(&mut HeapBlock)) {
        for block in &mut self.blocks {
            f(block.header_mut());
        }
    }
}
