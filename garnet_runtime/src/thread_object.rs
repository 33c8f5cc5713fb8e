//! Runtime threads.
//!
//! A `ThreadObject` wraps an OS thread registered with the GC's thread
//! registry. The spawned thread runs a block; `join` re-raises any
//! exception the thread died with. Cancellation is cooperative: `kill`
//! parks an exception in the target's pending slot and pokes its wake
//! pipe, and the target converts the pending exception into an unwind at
//! its next [`check_pending`] safepoint.

use crate::args::Args;
use crate::block::BlockRef;
use crate::env::EnvRef;
use crate::exception::{RResult, Unwind};
use crate::global_env::GlobalEnv;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::Value;
use garnet_gc::{RootProvider, ThreadRegistry, Tracer};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

/// Thread payload.
#[repr(C)]
pub struct ThreadObject {
    /// Shared header; class is `Thread`.
    pub header: ObjectHeader,
    /// GC registry id, set by the spawned thread once registered.
    registry_id: AtomicU64,
    /// The block the thread runs.
    block: Value,
    /// The block's return value once finished.
    result: Value,
    /// The exception the thread died with, if it did.
    failure: Value,
    /// Exception to deliver at the target's next safepoint.
    pending_exception: Value,
    finished: AtomicBool,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

/// Typed reference to a thread.
#[derive(Clone, Copy)]
pub struct ThreadRef(NonNull<ThreadObject>);

struct ThreadList {
    threads: Mutex<Vec<Value>>,
}

// Safety: word bit patterns behind a lock.
unsafe impl Send for ThreadList {}
unsafe impl Sync for ThreadList {}

impl RootProvider for ThreadList {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for &thread in self.threads.lock().iter() {
            tracer.visit(thread);
        }
    }
}

fn thread_list() -> &'static ThreadList {
    static LIST: OnceLock<ThreadList> = OnceLock::new();
    LIST.get_or_init(|| ThreadList {
        threads: Mutex::new(Vec::new()),
    })
}

pub(crate) fn register_root_provider() {
    garnet_gc::trace::register_root_provider(thread_list());
}

/// Every live runtime thread.
pub fn all_threads() -> Vec<Value> {
    thread_list().threads.lock().clone()
}

impl ThreadRef {
    /// Wrap a value already known to be a thread.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Thread));
        Self(NonNull::new(value.as_ptr() as *mut ThreadObject).expect("non-null thread"))
    }

    fn get(&self) -> &'static ThreadObject {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &'static mut ThreadObject {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// The thread as a value.
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }

    /// Has the thread finished running its block?
    pub fn is_finished(&self) -> bool {
        self.get().finished.load(Ordering::Acquire)
    }

    /// The block's value, `nil` until finished.
    pub fn result(&self) -> Value {
        self.get().result
    }

    /// Spawn a thread running `block`.
    pub fn spawn(_env: EnvRef, block: BlockRef) -> RResult {
        let ptr = alloc_cell(ThreadObject {
            header: ObjectHeader::new(ObjectType::Thread, GlobalEnv::the().thread_class()),
            registry_id: AtomicU64::new(0),
            block: block.as_value(),
            result: Value::nil(),
            failure: Value::nil(),
            pending_exception: Value::nil(),
            finished: AtomicBool::new(false),
            join_handle: None,
        });
        let thread = ThreadRef(ptr);
        let thread_value = thread.as_value();
        thread_list().threads.lock().push(thread_value);

        // Values cross the thread boundary as raw bits; the thread list
        // entry above is what keeps them alive meanwhile.
        let thread_bits = thread_value.bits();
        let handle = std::thread::spawn(move || {
            let stack_marker: usize = 0;
            let registry = ThreadRegistry::the();
            let state =
                registry.register_current(false, &stack_marker as *const usize as usize);

            let thread = ThreadRef::from_value(Value::from_bits(thread_bits));
            thread.get().registry_id.store(state.id(), Ordering::Release);

            let env = EnvRef::root();
            let block = BlockRef::from_value(thread.get().block);
            match block.run(env, &Args::empty(), None) {
                Ok(value) => thread.get_mut().result = value,
                Err(Unwind::Exception(exception)) => {
                    thread.get_mut().failure = exception.as_value();
                }
                Err(Unwind::Throw { .. }) => {
                    let unwound = env.raise("UncaughtThrowError", "uncaught throw");
                    if let Unwind::Exception(exception) = unwound {
                        thread.get_mut().failure = exception.as_value();
                    }
                }
            }
            thread.get().finished.store(true, Ordering::Release);
            registry.unregister_current();
        });
        thread.get_mut().join_handle = Some(handle);
        Ok(thread_value)
    }

    /// Wait for the thread; re-raises the exception it died with.
    pub fn join(&self, env: EnvRef) -> RResult {
        if let Some(handle) = self.get_mut().join_handle.take() {
            garnet_gc::roots::blocking_region(|| handle.join()).ok();
        }
        let failure = self.get().failure;
        if failure.is_exception() {
            return Err(env.raise_exception(failure.as_exception()));
        }
        Ok(self.result())
    }

    /// The exception parked for delivery at the next safepoint.
    pub fn pending_exception(&self) -> Value {
        self.get().pending_exception
    }

    /// Park an exception for this thread and poke its wake pipe so a
    /// blocking wait notices.
    pub fn deliver_exception(&self, exception: Value) {
        self.get_mut().pending_exception = exception;
        let id = self.get().registry_id.load(Ordering::Acquire);
        if id != 0 {
            for state in ThreadRegistry::the().all() {
                if state.id() == id {
                    if let Some(pipe) = state.wake_pipe() {
                        pipe.wake();
                    }
                }
            }
        }
    }

    /// `Thread#kill`: deliver a termination exception.
    pub fn kill(&self, _env: EnvRef) {
        let class = GlobalEnv::the().exception_class();
        let exception = crate::exception::ExceptionRef::create(class, "killed");
        self.deliver_exception(exception.as_value());
    }

    /// Cooperative delivery point: converts a parked exception into an
    /// unwind. Long-running native loops call this.
    pub fn check_pending(&self, env: EnvRef) -> RResult<()> {
        let pending = self.get().pending_exception;
        if pending.is_exception() {
            self.get_mut().pending_exception = Value::nil();
            return Err(env.raise_exception(pending.as_exception()));
        }
        Ok(())
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let thread = self.get();
        tracer.visit(thread.block);
        tracer.visit(thread.result);
        tracer.visit(thread.failure);
        tracer.visit(thread.pending_exception);
    }
}
