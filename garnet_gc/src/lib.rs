//! Garnet garbage collector.
//!
//! A stop-the-world, conservative, mark-and-sweep collector over a
//! size-segregated block heap.
//!
//! # Architecture
//!
//! - **Blocks**: 64 KiB power-of-two-aligned regions, each holding cells of
//!   one fixed size plus a used bitmap and an intrusive free list. Because
//!   blocks are aligned to their own size, the owning block of any cell
//!   pointer is recovered by masking the low bits ([`heap::HeapBlock::from_cell`]).
//!
//! - **Allocators**: one per cell-size class. Allocation pops a free cell
//!   from a block with free space, adding a fresh block when none has any.
//!
//! - **Collection**: triggered by allocation pressure. The world is stopped
//!   (every other thread parks at a safepoint and publishes its stack range
//!   and a register snapshot), every word of every thread stack and register
//!   buffer is treated as a potential pointer, and candidates that survive
//!   the alignment / bounds / in-use-cell checks become roots. Marking
//!   drains a work queue through the runtime's [`trace::ObjectTracer`];
//!   sweeping finalizes unmarked collectible cells and returns them to
//!   their block's free list.
//!
//! # The GC lock
//!
//! One process-wide re-entrant mutex ([`lock::gc_lock`]) serializes every
//! heap-mutating operation. It is coarse but correct; throughput is not a
//! design objective here. Re-acquiring it from a nested native call is legal.
//!
//! # What this crate does not know
//!
//! Object layout. Every cell begins with a [`cell::CellHeader`] (one byte of
//! GC state); everything after that belongs to `garnet_runtime`, which
//! implements [`trace::ObjectTracer`] to enumerate children and run
//! destructors, and registers [`trace::RootProvider`]s for the global
//! tables the conservative scan cannot see.

#![warn(clippy::all)]

pub mod cell;
pub mod collector;
pub mod config;
pub mod heap;
pub mod lock;
pub mod roots;
pub mod stats;
pub mod trace;

pub use cell::CellHeader;
pub use config::GcConfig;
pub use heap::Heap;
pub use lock::gc_lock;
pub use roots::{ThreadRegistry, ThreadState};
pub use stats::GcStats;
pub use trace::{ObjectTracer, RootProvider, Tracer};
