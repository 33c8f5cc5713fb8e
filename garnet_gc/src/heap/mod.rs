//! The process heap: a fixed set of size-class allocators.

pub mod allocator;
pub mod block;

pub use block::{HeapBlock, CELL_ALIGN, HEAP_BLOCK_SIZE};

use crate::config::GcConfig;
use crate::lock::gc_lock;
use crate::roots::ThreadRegistry;
use crate::stats::GcStats;
use allocator::Allocator;
use rustc_hash::FxHashSet;
use std::cell::UnsafeCell;
use std::sync::OnceLock;

/// Cell-size classes. The largest must cover the biggest heap payload the
/// runtime defines; `Heap::allocate` asserts this.
pub const CELL_SIZE_CLASSES: [usize; 5] = [64, 128, 256, 512, 1024];

/// The process-wide heap.
///
/// A singleton, like the GC lock that guards it. All mutating methods
/// require the caller to hold [`gc_lock`]; the public free functions in this
/// module take it themselves.
pub struct Heap {
    config: GcConfig,
    allocators: Vec<Allocator>,
    /// Base addresses of every mapped block, for conservative-scan probing.
    block_bases: FxHashSet<usize>,
    /// Lowest mapped block address (inclusive).
    lowest_block_addr: usize,
    /// Highest mapped block address (exclusive).
    highest_block_addr: usize,
    free_cells: usize,
    total_cells: usize,
    gc_enabled: bool,
    allocations_since_check: usize,
    stats: GcStats,
}

struct HeapSingleton(UnsafeCell<Heap>);

// Safety: every access to the heap happens under the GC lock.
unsafe impl Sync for HeapSingleton {}
unsafe impl Send for HeapSingleton {}

static HEAP: OnceLock<HeapSingleton> = OnceLock::new();

impl Heap {
    fn new(config: GcConfig) -> Self {
        Self {
            config,
            allocators: CELL_SIZE_CLASSES.iter().map(|&s| Allocator::new(s)).collect(),
            block_bases: FxHashSet::default(),
            lowest_block_addr: usize::MAX,
            highest_block_addr: 0,
            free_cells: 0,
            total_cells: 0,
            gc_enabled: false,
            allocations_since_check: 0,
            stats: GcStats::default(),
        }
    }

    /// The process heap. Callers must hold [`gc_lock`] around any use.
    #[allow(clippy::mut_from_ref)]
    pub fn the() -> &'static mut Heap {
        let singleton =
            HEAP.get_or_init(|| HeapSingleton(UnsafeCell::new(Heap::new(GcConfig::default()))));
        unsafe { &mut *singleton.0.get() }
    }

    /// Pick the smallest allocator whose cell size covers `size`.
    fn allocator_index_for(size: usize) -> usize {
        CELL_SIZE_CLASSES
            .iter()
            .position(|&s| s >= size)
            .unwrap_or_else(|| panic!("no cell-size class covers {size} bytes"))
    }

    /// Allocate a cell of at least `size` bytes.
    ///
    /// Runs the trigger policy first: every `check_free_every` allocations,
    /// collect if the free-cell ratio fell below `min_percent_free`. The
    /// caller must hold the GC lock.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        let index = Self::allocator_index_for(size);

        if self.allocators[index].total_cells() == 0 {
            for _ in 0..self.config.initial_blocks_per_allocator {
                let (base, cells) = self.allocators[index].add_block();
                self.note_new_block(base, cells);
            }
        }

        if self.gc_enabled {
            self.allocations_since_check += 1;
            if self.allocations_since_check >= self.config.check_free_every {
                self.allocations_since_check = 0;
                if self.total_cells > 0
                    && self.free_cells * 100 / self.total_cells < self.config.min_percent_free
                {
                    self.collect();
                }
            }
        }

        let (cell, added) = self.allocators[index].allocate();
        if let Some((base, cells)) = added {
            self.note_new_block(base, cells);
        }
        self.free_cells -= 1;
        cell
    }

    fn note_new_block(&mut self, base: usize, cells: usize) {
        self.block_bases.insert(base);
        self.lowest_block_addr = self.lowest_block_addr.min(base);
        self.highest_block_addr = self.highest_block_addr.max(base + HEAP_BLOCK_SIZE);
        self.free_cells += cells;
        self.total_cells += cells;
    }

    /// Enable automatic collection. Off during bootstrap.
    pub fn gc_enable(&mut self) {
        self.gc_enabled = true;
    }

    /// Disable automatic collection.
    pub fn gc_disable(&mut self) {
        self.gc_enabled = false;
    }

    /// Is automatic collection on?
    #[inline]
    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    /// Could `addr` lie within a mapped block?
    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        addr >= self.lowest_block_addr && addr < self.highest_block_addr
    }

    /// Is `ptr` the exact boundary of an in-use cell of a block this heap
    /// owns? This is the final promotion check of the conservative scan.
    pub fn is_cell_in_use(&self, ptr: *const ()) -> bool {
        let block = HeapBlock::from_cell(ptr);
        if !self.block_bases.contains(&(block as usize)) {
            return false;
        }
        unsafe { (*block).is_cell_in_use(ptr) }
    }

    /// Visit every in-use cell across every allocator.
    pub fn each_used_cell(&self, mut f: impl FnMut(*mut ())) {
        for allocator in &self.allocators {
            allocator.each_block(|block| block.each_used_cell(&mut f));
        }
    }

    /// Free cells across the heap.
    #[inline]
    pub fn free_cells(&self) -> usize {
        self.free_cells
    }

    /// Total cells across the heap.
    #[inline]
    pub fn total_cells(&self) -> usize {
        self.total_cells
    }

    /// In-use cells across the heap.
    pub fn used_cells(&self) -> usize {
        self.total_cells - self.free_cells
    }

    /// Collection counters.
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub(crate) fn allocators_mut(&mut self) -> &mut [Allocator] {
        &mut self.allocators
    }

    pub(crate) fn config(&self) -> &GcConfig {
        &self.config
    }

    pub(crate) fn stats_mut(&mut self) -> &mut GcStats {
        &mut self.stats
    }

    pub(crate) fn add_free_cells(&mut self, n: usize) {
        self.free_cells += n;
    }
}

/// Allocate a cell of at least `size` bytes, taking the GC lock.
///
/// A non-main thread publishes a safepoint before blocking on the lock:
/// while it waits, the collector may be holding the lock and stopping the
/// world, and the published snapshot is what lets it proceed.
pub fn allocate(size: usize) -> *mut u8 {
    let registry = ThreadRegistry::the();
    match registry.current() {
        Some(state) if !state.is_main() => {
            state.publish_safepoint();
            let guard = gc_lock();
            state.leave_safepoint();
            let cell = Heap::the().allocate(size);
            drop(guard);
            cell
        }
        _ => {
            let _guard = gc_lock();
            Heap::the().allocate(size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_selection() {
        assert_eq!(Heap::allocator_index_for(1), 0);
        assert_eq!(Heap::allocator_index_for(64), 0);
        assert_eq!(Heap::allocator_index_for(65), 1);
        assert_eq!(Heap::allocator_index_for(1024), 4);
    }

    #[test]
    #[should_panic(expected = "no cell-size class")]
    fn test_oversized_allocation_panics() {
        let _ = Heap::allocator_index_for(4096);
    }

    #[test]
    fn test_allocate_returns_aligned_cells() {
        let _guard = gc_lock();
        let heap = Heap::the();
        let a = heap.allocate(48);
        let b = heap.allocate(48);
        assert_ne!(a, b);
        assert_eq!(a as usize % CELL_ALIGN, 0);
        assert!(heap.is_cell_in_use(a as *const ()));
        assert!(heap.contains_address(a as usize));
    }

    #[test]
    fn test_foreign_pointer_is_not_a_cell() {
        let _guard = gc_lock();
        let heap = Heap::the();
        let _ = heap.allocate(32);
        let local: u64 = 0;
        assert!(!heap.is_cell_in_use(&local as *const u64 as *const ()));
    }
}
