//! Method cells, visibility, and the method-missing reason.

use crate::args::Args;
use crate::block::BlockRef;
use crate::env::EnvRef;
use crate::exception::{RResult, Unwind};
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::{Symbol, Value};
use garnet_gc::Tracer;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// The native calling convention: every method and block body is a Rust
/// function over `(frame, self, args, block)`.
pub type NativeFn = fn(EnvRef, Value, &Args, Option<BlockRef>) -> RResult;

/// Method visibility.
///
/// Ordered so that `visibility >= floor` is the dispatch gate: a `send`
/// (floor `Private`) invokes anything, a `public_send` (floor `Public`)
/// only public methods.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    /// Callable only with an implicit receiver.
    Private = 0,
    /// Callable when the sender is_a the defining class.
    Protected = 1,
    /// Callable from anywhere.
    Public = 2,
}

/// Why the last dispatch failed, recorded per thread and consulted to
/// shape the `NoMethodError` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodMissingReason {
    /// No entry (or a tombstone) anywhere on the ancestor chain.
    Undefined,
    /// Found, but private and called with a floor above private.
    Private,
    /// Found, but protected and the sender failed the is_a check.
    Protected,
}

thread_local! {
    static METHOD_MISSING_REASON: Cell<MethodMissingReason> =
        const { Cell::new(MethodMissingReason::Undefined) };
}

/// Record why dispatch failed on this thread.
pub fn set_method_missing_reason(reason: MethodMissingReason) {
    METHOD_MISSING_REASON.with(|r| r.set(reason));
}

/// The last recorded dispatch-failure reason on this thread.
pub fn method_missing_reason() -> MethodMissingReason {
    METHOD_MISSING_REASON.with(|r| r.get())
}

/// One method-table entry: visibility plus the implementation, where `None`
/// is the `undef_method` tombstone that stops ancestor fall-through.
#[derive(Clone, Copy)]
pub struct MethodInfo {
    /// Entry visibility.
    pub visibility: Visibility,
    /// The implementation; `None` for the undefined sentinel.
    pub method: Option<MethodRef>,
}

static NEXT_BREAK_POINT: AtomicU64 = AtomicU64::new(1);

/// Method implementation cell. Internal kind: lives only in method tables
/// (and in `BoundMethod` wrappers) and has no class of its own.
#[repr(C)]
pub struct MethodObject {
    /// Shared header.
    pub header: ObjectHeader,
    name: Symbol,
    fn_: NativeFn,
    arity: i32,
    /// Captured lexical frame for block-backed methods, or `nil`.
    captured_env: Value,
    /// Bound self for methods that pin their receiver, or `nil`.
    self_override: Value,
    /// The module that defined this method.
    owner: Value,
    /// Non-local-return tag; 0 until a returning block is created under
    /// this method.
    break_point: AtomicU64,
}

/// Typed reference to a method cell.
#[derive(Clone, Copy)]
pub struct MethodRef(NonNull<MethodObject>);

impl MethodRef {
    /// Wrap a value already known to be a method cell.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Method));
        Self(NonNull::new(value.as_ptr() as *mut MethodObject).expect("non-null method"))
    }

    /// Allocate a method cell for a native function.
    pub fn create(name: Symbol, fn_: NativeFn, arity: i32) -> Self {
        let ptr = alloc_cell(MethodObject {
            header: ObjectHeader::new(ObjectType::Method, Value::nil()),
            name,
            fn_,
            arity,
            captured_env: Value::nil(),
            self_override: Value::nil(),
            owner: Value::nil(),
            break_point: AtomicU64::new(0),
        });
        Self(ptr)
    }

    /// Allocate a method cell carrying a captured lexical frame.
    pub fn create_with_env(name: Symbol, fn_: NativeFn, arity: i32, env: EnvRef) -> Self {
        let method = Self::create(name, fn_, arity);
        method.get_mut().captured_env = env.as_value();
        method
    }

    fn get(&self) -> &'static MethodObject {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &'static mut MethodObject {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// The method cell as a value.
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }

    /// Method name.
    pub fn name(&self) -> Symbol {
        self.get().name
    }

    /// Declared arity; negative means variadic with `-(arity + 1)` required.
    pub fn arity(&self) -> i32 {
        self.get().arity
    }

    /// The defining module.
    pub fn owner(&self) -> Value {
        self.get().owner
    }

    pub(crate) fn set_owner(&self, owner: Value) {
        self.get_mut().owner = owner;
    }

    /// The captured lexical frame, if any.
    pub fn captured_env(&self) -> Option<EnvRef> {
        let env = self.get().captured_env;
        (env.heap_type() == Some(ObjectType::Env)).then(|| EnvRef::from_value(env))
    }

    /// Pin the receiver this method always runs against.
    pub fn set_self_override(&self, self_: Value) {
        self.get_mut().self_override = self_;
    }

    /// Current break-point tag; 0 when no returning block exists.
    pub fn break_point(&self) -> u64 {
        self.get().break_point.load(Ordering::Relaxed)
    }

    /// The break-point tag, assigning one on first use. Blocks created
    /// under this method that may `return` carry this tag.
    pub fn ensure_break_point(&self) -> u64 {
        let method = self.get();
        let current = method.break_point.load(Ordering::Relaxed);
        if current != 0 {
            return current;
        }
        let fresh = NEXT_BREAK_POINT.fetch_add(1, Ordering::Relaxed);
        match method
            .break_point
            .compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }

    /// Invoke the method.
    ///
    /// Builds the callee frame (outer = captured lexical frame, caller =
    /// the calling frame), wires the block's calling env for the duration
    /// of the call, and converts a matching non-local block return into
    /// this call's return value.
    pub fn call(
        &self,
        env: EnvRef,
        self_: Value,
        args: &Args,
        block: Option<BlockRef>,
    ) -> RResult {
        let frame = EnvRef::create(self.captured_env(), Some(env));
        frame.set_method(*self);
        frame.set_position(env.file(), env.line());
        frame.set_block(block);

        let self_override = self.get().self_override;
        let receiver = if self_override.is_nil() { self_ } else { self_override };

        let adopted_calling_env = match block {
            Some(b) if b.calling_env().is_none() => {
                b.set_calling_env(env);
                true
            }
            _ => false,
        };

        let result = (self.get().fn_)(frame, receiver, args, block);

        if adopted_calling_env {
            if let Some(b) = block {
                b.clear_calling_env();
            }
        }

        let break_point = self.break_point();
        match result {
            Err(Unwind::Exception(exception))
                if break_point != 0 && exception.is_local_jump_with(break_point) =>
            {
                Ok(exception.exit_value())
            }
            other => other,
        }
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let method = self.get();
        tracer.visit(method.captured_env);
        tracer.visit(method.self_override);
        tracer.visit(method.owner);
    }
}

// =============================================================================
// Bound methods (Object#method)
// =============================================================================

/// A method extracted from a receiver: `obj.method(:name)`. Calls behave
/// like a lambda — strict arity, self pinned to the receiver.
#[repr(C)]
pub struct BoundMethodObject {
    /// Shared header; class is `Method`.
    pub header: ObjectHeader,
    receiver: Value,
    method: Value,
}

/// Typed reference to a bound method.
#[derive(Clone, Copy)]
pub struct BoundMethodRef(NonNull<BoundMethodObject>);

impl BoundMethodRef {
    /// Wrap a value already known to be a bound method.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::BoundMethod));
        Self(NonNull::new(value.as_ptr() as *mut BoundMethodObject).expect("non-null method"))
    }

    /// Bind `method` to `receiver`.
    pub fn create(receiver: Value, method: MethodRef) -> Value {
        let ptr = alloc_cell(BoundMethodObject {
            header: ObjectHeader::new(
                ObjectType::BoundMethod,
                crate::global_env::GlobalEnv::the().method_class(),
            ),
            receiver,
            method: method.as_value(),
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }

    /// The pinned receiver.
    pub fn receiver(&self) -> Value {
        unsafe { self.0.as_ref() }.receiver
    }

    /// The wrapped method cell.
    pub fn method(&self) -> MethodRef {
        MethodRef::from_value(unsafe { self.0.as_ref() }.method)
    }

    /// Invoke against the pinned receiver with strict arity.
    pub fn call(&self, env: EnvRef, args: &Args, block: Option<BlockRef>) -> RResult {
        let method = self.method();
        crate::block::check_strict_arity(env, method.arity(), args.len())?;
        method.call(env, self.receiver(), args, block)
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let bound = unsafe { self.0.as_ref() };
        tracer.visit(bound.receiver);
        tracer.visit(bound.method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use garnet_core::intern;

    fn return_self(_env: EnvRef, self_: Value, _args: &Args, _block: Option<BlockRef>) -> RResult {
        Ok(self_)
    }

    #[test]
    fn test_visibility_gate_ordering() {
        assert!(Visibility::Public >= Visibility::Private);
        assert!(Visibility::Public >= Visibility::Protected);
        assert!(Visibility::Protected >= Visibility::Private);
        assert!(Visibility::Private < Visibility::Public);
    }

    #[test]
    fn test_method_missing_reason_is_thread_local() {
        set_method_missing_reason(MethodMissingReason::Private);
        let other = std::thread::spawn(|| {
            set_method_missing_reason(MethodMissingReason::Protected);
            method_missing_reason()
        })
        .join()
        .unwrap();
        assert_eq!(other, MethodMissingReason::Protected);
        assert_eq!(method_missing_reason(), MethodMissingReason::Private);
    }

    #[test]
    fn test_method_call_passes_self() {
        let env = runtime_env();
        let method = MethodRef::create(intern("itself"), return_self, 0);
        let receiver = Value::fixnum_unchecked(7);
        let result = method.call(env, receiver, &Args::empty(), None).unwrap();
        assert_eq!(result, receiver);
    }

    #[test]
    fn test_break_point_assignment_is_stable() {
        let env = runtime_env();
        let _ = env;
        let method = MethodRef::create(intern("m"), return_self, 0);
        assert_eq!(method.break_point(), 0);
        let a = method.ensure_break_point();
        let b = method.ensure_break_point();
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_self_override_pins_receiver() {
        let env = runtime_env();
        let method = MethodRef::create(intern("pinned"), return_self, 0);
        method.set_self_override(Value::fixnum_unchecked(42));
        let result = method
            .call(env, Value::fixnum_unchecked(1), &Args::empty(), None)
            .unwrap();
        assert_eq!(result.as_fixnum(), 42);
    }
}
