//! The GC ↔ runtime tracing seam.
//!
//! The collector walks memory it does not understand. Three contracts close
//! the gap:
//!
//! - [`Tracer`] — handed to objects so they can report their outgoing
//!   references during marking.
//! - [`ObjectTracer`] — implemented once by the runtime; given a cell
//!   pointer, enumerates that object's children and runs its destructor.
//!   Registered at bootstrap via [`set_object_tracer`].
//! - [`RootProvider`] — global tables the conservative scan cannot see
//!   (the global environment, the symbol registry, the thread list) register
//!   themselves and are visited at the start of every mark phase.

use garnet_core::Value;
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Visitor handed to objects during the mark phase.
pub trait Tracer {
    /// Report a value that may reference a heap object.
    fn visit(&mut self, value: Value);

    /// Report a raw cell pointer known to be a live heap cell.
    fn visit_ptr(&mut self, ptr: *mut ());
}

/// Type-aware object operations the runtime provides to the collector.
///
/// Every heap type must enumerate every outgoing `Value` it holds — class,
/// ivars, type-specific fields. Missing an edge means a reachable object
/// gets swept.
pub trait ObjectTracer: Sync {
    /// Visit all children of the object at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a live, constructed heap cell.
    unsafe fn trace_object(&self, ptr: *mut (), tracer: &mut dyn Tracer);

    /// Run the destructor of the object at `ptr` and tombstone it.
    ///
    /// # Safety
    /// `ptr` must point to a live, constructed heap cell; called at most
    /// once before the memory is reclaimed.
    unsafe fn finalize_object(&self, ptr: *mut ());
}

/// A source of GC roots outside the scanned stacks.
pub trait RootProvider: Sync {
    /// Report every root this provider holds.
    fn trace_roots(&self, tracer: &mut dyn Tracer);
}

static OBJECT_TRACER: OnceLock<&'static dyn ObjectTracer> = OnceLock::new();

/// Install the runtime's object tracer. Must happen before the first
/// collection; installing twice is a bug.
pub fn set_object_tracer(tracer: &'static dyn ObjectTracer) {
    if OBJECT_TRACER.set(tracer).is_err() {
        panic!("object tracer installed twice");
    }
}

/// The installed object tracer, if any.
pub fn object_tracer() -> Option<&'static dyn ObjectTracer> {
    OBJECT_TRACER.get().copied()
}

fn root_providers() -> &'static Mutex<Vec<&'static dyn RootProvider>> {
    static PROVIDERS: OnceLock<Mutex<Vec<&'static dyn RootProvider>>> = OnceLock::new();
    PROVIDERS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a permanent root provider.
pub fn register_root_provider(provider: &'static dyn RootProvider) {
    root_providers().lock().push(provider);
}

/// Visit the roots of every registered provider.
pub fn trace_provider_roots(tracer: &mut dyn Tracer) {
    for provider in root_providers().lock().iter() {
        provider.trace_roots(tracer);
    }
}

/// A tracer that counts what it sees. Test helper.
#[derive(Default)]
pub struct CountingTracer {
    /// Values reported via [`Tracer::visit`].
    pub values: usize,
    /// Pointers reported via [`Tracer::visit_ptr`].
    pub ptrs: usize,
}

impl Tracer for CountingTracer {
    fn visit(&mut self, _value: Value) {
        self.values += 1;
    }

    fn visit_ptr(&mut self, _ptr: *mut ()) {
        self.ptrs += 1;
    }
}
