//! Heap call frames.
//!
//! Every call allocates an `EnvObject` recording its caller (dynamic chain,
//! for backtraces), its outer frame (lexical chain, for closure variable
//! resolution), the method being run, source position, locals and the block
//! handle. Frames are heap cells so closures can outlive the call that
//! created them.
//!
//! `EnvRef` also carries the raise helpers: constructing an exception needs
//! a frame for the backtrace and the implicit cause (`$!`).

use crate::exception::{current_exception, ExceptionRef, Unwind};
use crate::method::MethodRef;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::{Symbol, Value};
use garnet_gc::Tracer;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;

/// Call frame payload. Internal cell kind: frames have no class and are
/// not Ruby-visible values.
#[repr(C)]
pub struct EnvObject {
    /// Shared header.
    pub header: ObjectHeader,
    /// Lexical parent, for closure variable resolution.
    outer: Value,
    /// Dynamic parent, for backtraces.
    caller: Value,
    /// The method cell this frame executes, or `nil` at top level.
    method: Value,
    file: &'static str,
    line: u32,
    /// The block passed to this call, or `nil`.
    block: Value,
    locals: FxHashMap<Symbol, Value>,
    /// The exception currently unwinding through this frame, if any.
    exception_in_flight: Value,
}

/// Typed reference to a frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EnvRef(NonNull<EnvObject>);

impl EnvRef {
    /// Wrap a value already known to be a frame.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Env));
        Self(NonNull::new(value.as_ptr() as *mut EnvObject).expect("non-null env"))
    }

    /// Allocate a frame.
    pub fn create(outer: Option<EnvRef>, caller: Option<EnvRef>) -> Self {
        let (file, line) = caller
            .map(|c| (c.file(), c.line()))
            .unwrap_or(("(garnet)", 0));
        let ptr = alloc_cell(EnvObject {
            header: ObjectHeader::new(ObjectType::Env, Value::nil()),
            outer: outer.map(|e| e.as_value()).unwrap_or_default(),
            caller: caller.map(|e| e.as_value()).unwrap_or_default(),
            method: Value::nil(),
            file,
            line,
            block: Value::nil(),
            locals: FxHashMap::default(),
            exception_in_flight: Value::nil(),
        });
        Self(ptr)
    }

    /// The top-level frame.
    pub fn root() -> Self {
        let env = Self::create(None, None);
        env.set_position("main", 0);
        env
    }

    fn get(&self) -> &'static EnvObject {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &'static mut EnvObject {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// The frame as a value (for storage in other heap cells).
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }

    /// Lexical parent.
    pub fn outer(&self) -> Option<EnvRef> {
        let outer = self.get().outer;
        outer.is_ptr().then(|| EnvRef::from_value(outer))
    }

    /// Dynamic parent.
    pub fn caller(&self) -> Option<EnvRef> {
        let caller = self.get().caller;
        caller.is_ptr().then(|| EnvRef::from_value(caller))
    }

    pub(crate) fn set_caller(&self, caller: Option<EnvRef>) {
        self.get_mut().caller = caller.map(|e| e.as_value()).unwrap_or_default();
    }

    /// The method cell this frame runs, if any.
    pub fn method(&self) -> Option<MethodRef> {
        let method = self.get().method;
        (method.heap_type() == Some(ObjectType::Method)).then(|| MethodRef::from_value(method))
    }

    pub(crate) fn set_method(&self, method: MethodRef) {
        self.get_mut().method = method.as_value();
    }

    /// Source file.
    pub fn file(&self) -> &'static str {
        self.get().file
    }

    /// Source line.
    pub fn line(&self) -> u32 {
        self.get().line
    }

    /// Record a source position.
    pub fn set_position(&self, file: &'static str, line: u32) {
        let env = self.get_mut();
        env.file = file;
        env.line = line;
    }

    /// The block passed to this call.
    pub fn block(&self) -> Option<crate::block::BlockRef> {
        let block = self.get().block;
        (block.heap_type() == Some(ObjectType::Block)).then(|| block.as_block())
    }

    pub(crate) fn set_block(&self, block: Option<crate::block::BlockRef>) {
        self.get_mut().block = block.map(|b| b.as_value()).unwrap_or_default();
    }

    /// The exception unwinding through this frame.
    pub fn exception_in_flight(&self) -> Value {
        self.get().exception_in_flight
    }

    /// Record (or clear, with `nil`) the exception unwinding through here.
    pub fn set_exception_in_flight(&self, value: Value) {
        self.get_mut().exception_in_flight = value;
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Read a local, resolving through the lexical chain.
    pub fn var_get(&self, name: Symbol) -> Option<Value> {
        let mut env = Some(*self);
        while let Some(current) = env {
            if let Some(&value) = current.get().locals.get(&name) {
                return Some(value);
            }
            env = current.outer();
        }
        None
    }

    /// Write a local: assigns in the defining frame if the lexical chain
    /// already has one (closure mutation), else declares here.
    pub fn var_set(&self, name: Symbol, value: Value) {
        let _guard = garnet_gc::gc_lock();
        let mut env = Some(*self);
        while let Some(current) = env {
            if current.get().locals.contains_key(&name) {
                current.get_mut().locals.insert(name, value);
                return;
            }
            env = current.outer();
        }
        self.get_mut().locals.insert(name, value);
    }

    /// Declare a local in this frame, shadowing any outer binding.
    pub fn var_declare(&self, name: Symbol, value: Value) {
        let _guard = garnet_gc::gc_lock();
        self.get_mut().locals.insert(name, value);
    }

    // =========================================================================
    // Globals (delegated)
    // =========================================================================

    /// Read a `$global`.
    pub fn global_get(&self, name: Symbol) -> Value {
        crate::global_env::GlobalEnv::the().global_get(name)
    }

    /// Write a `$global`.
    pub fn global_set(&self, name: Symbol, value: Value) {
        crate::global_env::GlobalEnv::the().global_set(name, value);
    }

    // =========================================================================
    // Raising
    // =========================================================================

    /// Raise an exception of the class named `class_name`, resolved from
    /// `Object`'s constants. The in-flight exception (`$!`) becomes the
    /// cause; the backtrace is captured from this frame.
    pub fn raise(&self, class_name: &str, message: impl Into<String>) -> Unwind {
        let class = crate::global_env::GlobalEnv::the().exception_class_named(class_name);
        let exception = ExceptionRef::create(class, &message.into());
        self.raise_exception(exception)
    }

    /// Raise an already constructed exception object.
    pub fn raise_exception(&self, exception: ExceptionRef) -> Unwind {
        exception.capture_backtrace(*self);
        let in_flight = current_exception();
        if in_flight.is_exception() && in_flight != exception.as_value() {
            exception.set_cause(in_flight.as_exception());
        }
        self.set_exception_in_flight(exception.as_value());
        Unwind::Exception(exception)
    }

    /// `NameError`; the offending name is already in the message.
    pub fn raise_name_error(&self, message: impl Into<String>) -> Unwind {
        self.raise("NameError", message)
    }

    /// `FrozenError` carrying the receiver.
    pub fn raise_frozen_error(&self, receiver: Value) -> Unwind {
        let unwind = self.raise(
            "FrozenError",
            format!(
                "can't modify frozen {}: {}",
                receiver.class_name(),
                receiver.inspected()
            ),
        );
        if let Unwind::Exception(exception) = unwind {
            exception.set_receiver(receiver);
        }
        unwind
    }

    /// `NoMethodError` shaped by the method-missing reason.
    pub fn raise_no_method_error(
        &self,
        receiver: Value,
        name: Symbol,
        reason: crate::method::MethodMissingReason,
    ) -> Unwind {
        use crate::method::MethodMissingReason as Reason;
        let message = match reason {
            Reason::Undefined => {
                format!("undefined method '{name}' for {}", receiver.inspected())
            }
            Reason::Private => {
                format!("private method '{name}' called for {}", receiver.inspected())
            }
            Reason::Protected => format!(
                "protected method '{name}' called for {}",
                receiver.inspected()
            ),
        };
        let unwind = self.raise("NoMethodError", message);
        if let Unwind::Exception(exception) = unwind {
            exception.set_missing_reason(reason);
            exception.set_receiver(receiver);
        }
        unwind
    }

    /// `LocalJumpError` carrying a break-point tag and exit value.
    pub fn raise_local_jump_error(
        &self,
        message: impl Into<String>,
        break_point: u64,
        exit_value: Value,
    ) -> Unwind {
        let unwind = self.raise("LocalJumpError", message);
        if let Unwind::Exception(exception) = unwind {
            exception.set_non_local_return(break_point, exit_value);
        }
        unwind
    }

    /// A `SystemCallError` subclass keyed by errno, for native methods
    /// surfacing an OS failure.
    pub fn raise_errno(&self, errno: i32, name: &str, message: impl Into<String>) -> Unwind {
        let class = crate::global_env::GlobalEnv::the().errno_class(errno, name);
        let exception = ExceptionRef::create(class, &message.into());
        self.raise_exception(exception)
    }

    /// `SystemExit` with a status, for `exit`.
    pub fn raise_system_exit(&self, status: i32) -> Unwind {
        let unwind = self.raise("SystemExit", "exit");
        if let Unwind::Exception(exception) = unwind {
            exception.set_exit_status(status);
        }
        unwind
    }

    // =========================================================================
    // Backtraces
    // =========================================================================

    /// Render the dynamic chain, innermost frame first.
    pub fn backtrace(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut env = Some(*self);
        while let Some(current) = env {
            let location = match current.method() {
                Some(method) => format!(
                    "{}:{}:in '{}'",
                    current.file(),
                    current.line(),
                    method.name()
                ),
                None => format!("{}:{}:in '<main>'", current.file(), current.line()),
            };
            lines.push(location);
            env = current.caller();
        }
        lines
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let env = self.get();
        tracer.visit(env.outer);
        tracer.visit(env.caller);
        tracer.visit(env.method);
        tracer.visit(env.block);
        tracer.visit(env.exception_in_flight);
        for &value in env.locals.values() {
            tracer.visit(value);
        }
    }
}
