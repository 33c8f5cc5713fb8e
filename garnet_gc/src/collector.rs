//! Stop-the-world conservative mark-and-sweep.
//!
//! The mark phase treats every word of every registered thread's stack (and
//! register snapshot) as a *potential* pointer. A candidate is promoted to a
//! root only if it is 8-byte aligned, lies within the heap's mapped address
//! range, and lands on the exact boundary of an in-use cell — the allocator
//! guarantees interior pointers are never promoted. Promoted roots and the
//! registered [`RootProvider`] roots are marked and their children traced
//! through the runtime's [`ObjectTracer`] until the work queue drains.
//!
//! The sweep phase walks every cell: unmarked collectible cells are
//! finalized and returned to their block's free list; surviving cells have
//! their mark bit cleared, so between collections no reachable cell is
//! marked.
//!
//! [`RootProvider`]: crate::trace::RootProvider
//! [`ObjectTracer`]: crate::trace::ObjectTracer

use crate::cell::header_of;
use crate::heap::{Heap, HeapBlock};
use crate::lock::gc_lock;
use crate::roots::{capture_registers, ThreadRegistry};
use crate::trace::{object_tracer, trace_provider_roots, ObjectTracer, Tracer};
use garnet_core::Value;
use std::collections::VecDeque;
use std::ptr::NonNull;

/// The marking work queue.
///
/// `visit_ptr` sets the cell's mark bit (idempotent) and enqueues newly
/// marked cells; the collector drains the queue through the object tracer.
pub struct MarkingPass {
    queue: VecDeque<*mut ()>,
    marked: usize,
}

impl MarkingPass {
    fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(1024),
            marked: 0,
        }
    }
}

impl Tracer for MarkingPass {
    #[inline]
    fn visit(&mut self, value: Value) {
        if let Some(ptr) = value.to_ptr() {
            self.visit_ptr(ptr);
        }
    }

    #[inline]
    fn visit_ptr(&mut self, ptr: *mut ()) {
        if ptr.is_null() {
            return;
        }
        // Safety: callers only pass verified cell pointers.
        if unsafe { header_of(ptr) }.mark() {
            self.marked += 1;
            self.queue.push_back(ptr);
        }
    }
}

impl Heap {
    /// Run a full collection using the registered object tracer.
    ///
    /// Collection only runs on the main thread: a non-main thread that trips
    /// the trigger policy skips collecting and lets the next main-thread
    /// allocation catch up. A process that never installed an object tracer
    /// (no runtime on top) also skips, because children cannot be traced.
    pub fn collect(&mut self) {
        if let Some(current) = ThreadRegistry::the().current() {
            if !current.is_main() {
                return;
            }
        }
        let Some(tracer) = object_tracer() else {
            return;
        };
        self.collect_with(tracer);
    }

    /// Run a full collection with an explicit object tracer.
    pub fn collect_with(&mut self, tracer: &dyn ObjectTracer) {
        let _guard = gc_lock();
        let registry = ThreadRegistry::the();

        registry.stop_the_world();

        let mut pass = MarkingPass::new();
        self.visit_thread_roots(&mut pass);
        trace_provider_roots(&mut pass);

        while let Some(ptr) = pass.queue.pop_front() {
            // Safety: every queued pointer was promoted as a live cell.
            unsafe { tracer.trace_object(ptr, &mut pass) };
        }

        registry.wake_the_world();

        let freed = self.sweep(tracer);
        let marked = pass.marked;
        self.stats_mut().record(marked, freed);
        if self.config().print_stats {
            let (free, total) = (self.free_cells(), self.total_cells());
            self.stats().dump(free, total);
        }
    }

    /// Conservatively scan every registered thread's stack and registers.
    fn visit_thread_roots(&self, pass: &mut MarkingPass) {
        let registry = ThreadRegistry::the();
        let current_id = registry.current().map(|t| t.id());

        for thread in registry.all() {
            if Some(thread.id()) == current_id {
                // The collecting thread scans itself live: everything below
                // this frame is dead to the mutator, everything above holds
                // its Values.
                let marker: usize = 0;
                let top = &marker as *const usize as usize;
                let start = thread.start_of_stack();
                if start > top {
                    self.scan_memory(pass, top, start);
                }
                let registers = capture_registers();
                self.scan_words(pass, registers.words());
            } else {
                // Stopped or sleeping thread: scan its published snapshot.
                let context = thread.saved_context();
                let start = thread.start_of_stack();
                if context.stack_top != 0 && start > context.stack_top {
                    self.scan_memory(pass, context.stack_top, start);
                }
                self.scan_words(pass, context.registers.words());
            }
        }
    }

    /// Scan `[start, end)` as a sequence of potential pointers.
    fn scan_memory(&self, pass: &mut MarkingPass, start: usize, end: usize) {
        let mut addr = (start + 7) & !7;
        while addr + std::mem::size_of::<usize>() <= end {
            // Safety: the range is a live (or parked) thread stack.
            let word = unsafe { (addr as *const usize).read_volatile() };
            self.visit_potential_cell(pass, word);
            addr += std::mem::size_of::<usize>();
        }
    }

    fn scan_words(&self, pass: &mut MarkingPass, words: &[usize]) {
        for &word in words {
            self.visit_potential_cell(pass, word);
        }
    }

    /// Promote `word` to a root if it passes every conservative check.
    #[inline]
    fn visit_potential_cell(&self, pass: &mut MarkingPass, word: usize) {
        if word == 0 || word & 0b111 != 0 {
            return;
        }
        if !self.contains_address(word) {
            return;
        }
        if self.is_cell_in_use(word as *const ()) {
            pass.visit_ptr(word as *mut ());
        }
    }

    /// Finalize and reclaim every unmarked collectible cell; clear the mark
    /// bit on everything else. Returns the number of cells freed.
    fn sweep(&mut self, tracer: &dyn ObjectTracer) -> usize {
        let mut freed = 0;
        for allocator in self.allocators_mut() {
            let mut regained: Vec<NonNull<HeapBlock>> = Vec::new();
            allocator.each_block_mut(|block| {
                let had_free = block.has_free();

                let mut dead: Vec<*mut ()> = Vec::new();
                block.each_used_cell(|cell| {
                    // Safety: the used bitmap only reports constructed cells.
                    let header = unsafe { header_of(cell) };
                    if header.is_marked() {
                        header.unmark();
                    } else if header.is_collectible() {
                        dead.push(cell);
                    }
                });

                for cell in dead {
                    // Safety: the cell is unreachable; finalize exactly once.
                    unsafe { tracer.finalize_object(cell) };
                    block.return_cell_to_free_list(cell);
                    freed += 1;
                }

                if !had_free && block.has_free() {
                    regained.push(NonNull::from(&mut *block));
                }
            });
            for block in regained {
                allocator.note_block_has_free(block);
            }
        }
        self.add_free_cells(freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A tracer for headers-only cells: no children, counts finalizations.
    struct PlainCellTracer {
        finalized: AtomicUsize,
    }

    impl ObjectTracer for PlainCellTracer {
        unsafe fn trace_object(&self, _ptr: *mut (), _tracer: &mut dyn Tracer) {}

        unsafe fn finalize_object(&self, _ptr: *mut ()) {
            self.finalized.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_sweep_reclaims_unreachable_cells() {
        let _guard = gc_lock();
        let heap = Heap::the();
        let tracer = PlainCellTracer {
            finalized: AtomicUsize::new(0),
        };

        // Allocate a cell and immediately forget the pointer so the only
        // reference is the local, which we overwrite below.
        let mut cell = heap.allocate(64) as usize;
        assert!(heap.is_cell_in_use(cell as *const ()));
        cell = 0;
        let _ = cell;

        let used_before = heap.used_cells();
        heap.collect_with(&tracer);

        // The cell may or may not survive depending on stale stack words —
        // conservative collection can only be asserted in one direction:
        // nothing reachable may be freed, and the heap stays consistent.
        assert!(heap.used_cells() <= used_before);
        assert_eq!(heap.total_cells(), heap.free_cells() + heap.used_cells());
    }

    #[test]
    fn test_uncollectible_cell_survives_sweep() {
        let _guard = gc_lock();
        let heap = Heap::the();
        let tracer = PlainCellTracer {
            finalized: AtomicUsize::new(0),
        };

        let cell = heap.allocate(64);
        unsafe { (cell as *mut CellHeader).write(CellHeader::uncollectible()) };

        heap.collect_with(&tracer);
        assert!(heap.is_cell_in_use(cell as *const ()));
    }

    #[test]
    fn test_marks_cleared_after_collection() {
        let _guard = gc_lock();
        let heap = Heap::the();
        let tracer = PlainCellTracer {
            finalized: AtomicUsize::new(0),
        };

        heap.collect_with(&tracer);
        let mut marked = 0;
        heap.each_used_cell(|cell| {
            if unsafe { header_of(cell as *const ()) }.is_marked() {
                marked += 1;
            }
        });
        assert_eq!(marked, 0, "sweep must clear every mark bit");
    }
}
