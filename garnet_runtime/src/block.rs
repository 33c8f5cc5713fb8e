//! Blocks, procs and self-rebinding evaluation.
//!
//! A block is a heap cell capturing its lexical frame and `self`. Its kind
//! decides the calling convention:
//!
//! - **Proc**: loose arity; `return` inside the block returns from the
//!   enclosing method, delivered as a `LocalJumpError` tagged with that
//!   method's break-point id and caught by the method's invoker.
//! - **Lambda**: strict arity; `return` returns from the block itself.
//! - **Method**: a method body reified as a block — strict arity, `self`
//!   cannot be rebound.

use crate::args::Args;
use crate::env::EnvRef;
use crate::exception::{RResult, Unwind};
use crate::global_env::GlobalEnv;
use crate::method::NativeFn;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::Value;
use garnet_gc::Tracer;
use std::ptr::NonNull;

/// Block calling convention.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Loose arity, non-local return.
    Proc,
    /// Strict arity, local return.
    Lambda,
    /// Strict arity, pinned self.
    Method,
}

/// Closure payload. Internal cell kind.
#[repr(C)]
pub struct BlockObject {
    /// Shared header.
    pub header: ObjectHeader,
    fn_: NativeFn,
    arity: i32,
    /// Captured lexical frame.
    env: Value,
    /// Captured self.
    self_: Value,
    kind: BlockKind,
    /// Does the block body contain a `return`?
    has_return: bool,
    /// The frame of the call currently running this block, or `nil`.
    calling_env: Value,
    /// Non-local-return tag inherited from the enclosing method.
    break_point: u64,
}

/// Typed reference to a block.
#[derive(Clone, Copy)]
pub struct BlockRef(NonNull<BlockObject>);

impl BlockRef {
    /// Wrap a value already known to be a block.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Block));
        Self(NonNull::new(value.as_ptr() as *mut BlockObject).expect("non-null block"))
    }

    /// Create a `Proc`-kind block with no `return` in its body.
    pub fn create(env: EnvRef, self_: Value, fn_: NativeFn, arity: i32) -> Self {
        Self::create_with(env, self_, fn_, arity, BlockKind::Proc, false)
    }

    /// Create a block with full control over kind and return behavior.
    ///
    /// A returning `Proc`-kind block inherits (and if needed assigns) the
    /// enclosing method's break-point tag, so the method invoker can match
    /// the non-local return to the right frame.
    pub fn create_with(
        env: EnvRef,
        self_: Value,
        fn_: NativeFn,
        arity: i32,
        kind: BlockKind,
        has_return: bool,
    ) -> Self {
        let break_point = if has_return && kind == BlockKind::Proc {
            env.method().map(|m| m.ensure_break_point()).unwrap_or(0)
        } else {
            0
        };
        let ptr = alloc_cell(BlockObject {
            header: ObjectHeader::new(ObjectType::Block, Value::nil()),
            fn_,
            arity,
            env: env.as_value(),
            self_,
            kind,
            has_return,
            calling_env: Value::nil(),
            break_point,
        });
        Self(ptr)
    }

    fn get(&self) -> &'static BlockObject {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &'static mut BlockObject {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// The block as a value.
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }

    /// The calling convention.
    pub fn kind(&self) -> BlockKind {
        self.get().kind
    }

    /// Re-tag the block (proc → lambda conversion).
    pub fn set_kind(&self, kind: BlockKind) {
        self.get_mut().kind = kind;
    }

    /// Lambda or Method kind?
    pub fn is_lambda(&self) -> bool {
        matches!(self.kind(), BlockKind::Lambda | BlockKind::Method)
    }

    /// Declared arity.
    pub fn arity(&self) -> i32 {
        self.get().arity
    }

    /// The captured lexical frame.
    pub fn env(&self) -> EnvRef {
        EnvRef::from_value(self.get().env)
    }

    /// The captured (or rebound) self.
    pub fn self_value(&self) -> Value {
        self.get().self_
    }

    /// Rebind self. `instance_eval` restores the original on unwind;
    /// `Method`-kind blocks refuse.
    pub fn set_self(&self, self_: Value) {
        if self.kind() != BlockKind::Method {
            self.get_mut().self_ = self_;
        }
    }

    /// May the body `return` non-locally?
    pub fn has_return(&self) -> bool {
        self.get().has_return
    }

    /// The enclosing method's break-point tag; 0 when not returning.
    pub fn break_point(&self) -> u64 {
        self.get().break_point
    }

    /// The frame of the call currently running this block.
    pub fn calling_env(&self) -> Option<EnvRef> {
        let env = self.get().calling_env;
        (env.heap_type() == Some(ObjectType::Env)).then(|| EnvRef::from_value(env))
    }

    pub(crate) fn set_calling_env(&self, env: EnvRef) {
        self.get_mut().calling_env = env.as_value();
    }

    pub(crate) fn clear_calling_env(&self) {
        self.get_mut().calling_env = Value::nil();
    }

    /// Run the block.
    ///
    /// Adopts the captured frame as the lexical scope and links the new
    /// frame to the caller for backtraces. Lambda and Method kinds enforce
    /// arity strictly.
    pub fn run(&self, env: EnvRef, args: &Args, inner_block: Option<BlockRef>) -> RResult {
        if self.is_lambda() {
            check_strict_arity(env, self.arity(), args.len())?;
        }
        let frame = EnvRef::create(Some(self.env()), Some(env));
        frame.set_position(env.file(), env.line());
        frame.set_block(inner_block);
        (self.get().fn_)(frame, self.self_value(), args, inner_block)
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let block = self.get();
        tracer.visit(block.env);
        tracer.visit(block.self_);
        tracer.visit(block.calling_env);
    }
}

/// Strict arity check shared by lambdas, method blocks and bound methods.
pub fn check_strict_arity(env: EnvRef, arity: i32, given: usize) -> RResult<()> {
    let matches = if arity >= 0 {
        given == arity as usize
    } else {
        given >= (-arity - 1) as usize
    };
    if !matches {
        let expected = if arity >= 0 {
            arity.to_string()
        } else {
            format!("{}+", -arity - 1)
        };
        return Err(env.raise(
            "ArgumentError",
            format!("wrong number of arguments (given {given}, expected {expected})"),
        ));
    }
    Ok(())
}

/// `return` inside a `Proc`-kind block: a `LocalJumpError` tagged with the
/// enclosing method's break point. With no enclosing method the tag is 0
/// and nothing will catch it — `unexpected return` surfaces.
pub fn non_local_return(env: EnvRef, block: BlockRef, value: Value) -> Unwind {
    env.raise_local_jump_error("unexpected return", block.break_point(), value)
}

/// `return` written inside a block body that only has its frame: find the
/// enclosing method through the lexical chain and tag the jump with its
/// break point.
pub fn non_local_return_from(env: EnvRef, value: Value) -> Unwind {
    let mut frame = Some(env);
    while let Some(current) = frame {
        if let Some(method) = current.method() {
            return env.raise_local_jump_error(
                "unexpected return",
                method.ensure_break_point(),
                value,
            );
        }
        frame = current.outer();
    }
    env.raise_local_jump_error("unexpected return", 0, value)
}

// =============================================================================
// Procs
// =============================================================================

/// Ruby-visible wrapper around a block.
#[repr(C)]
pub struct ProcObject {
    /// Shared header; class is `Proc`.
    pub header: ObjectHeader,
    block: Value,
}

/// Typed reference to a proc.
#[derive(Clone, Copy)]
pub struct ProcRef(NonNull<ProcObject>);

impl ProcRef {
    /// Wrap a value already known to be a proc.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Proc));
        Self(NonNull::new(value.as_ptr() as *mut ProcObject).expect("non-null proc"))
    }

    /// Wrap a block into a proc value.
    pub fn create(block: BlockRef) -> Value {
        let ptr = alloc_cell(ProcObject {
            header: ObjectHeader::new(ObjectType::Proc, GlobalEnv::the().proc_class()),
            block: block.as_value(),
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }

    /// The wrapped block.
    pub fn block(&self) -> BlockRef {
        BlockRef::from_value(unsafe { self.0.as_ref() }.block)
    }

    /// `Proc#call`.
    pub fn call(&self, env: EnvRef, args: &Args, block: Option<BlockRef>) -> RResult {
        self.block().run(env, args, block)
    }

    /// `Proc#lambda?`.
    pub fn is_lambda(&self) -> bool {
        self.block().is_lambda()
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        tracer.visit(unsafe { self.0.as_ref() }.block);
    }
}

pub(crate) fn proc_duplicate(value: Value) -> Value {
    ProcRef::create(ProcRef::from_value(value).block())
}

// =============================================================================
// Self-rebinding evaluation
// =============================================================================

fn with_rebound_self(
    env: EnvRef,
    receiver: Value,
    block: BlockRef,
    args: &Args,
) -> RResult {
    let global = GlobalEnv::the();
    let original_self = block.self_value();
    global.push_instance_eval_context(env, original_self);
    block.set_self(receiver);

    let result = block.run(env, args, None);

    // Restore on both paths; a panic-free unwind is an Err, not an abort.
    block.set_self(original_self);
    global.pop_instance_eval_context();
    result
}

/// `Object#instance_eval { |receiver| … }`: run the block with `self`
/// rebound to the receiver, restoring the original self on unwind.
pub fn instance_eval(env: EnvRef, receiver: Value, block: Option<BlockRef>) -> RResult {
    let Some(block) = block else {
        return Err(env.raise("ArgumentError", "no block given"));
    };
    let args = [receiver];
    with_rebound_self(env, receiver, block, &Args::new(&args))
}

/// `Object#instance_exec(*args) { … }`: like `instance_eval` but passes
/// the arguments through.
pub fn instance_exec(
    env: EnvRef,
    receiver: Value,
    args: &Args,
    block: Option<BlockRef>,
) -> RResult {
    let Some(block) = block else {
        return Err(env.raise("LocalJumpError", "no block given"));
    };
    with_rebound_self(env, receiver, block, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::unwind_class_name;
    use crate::global_env::test_support::runtime_env;

    fn arg_count(_env: EnvRef, _self: Value, args: &Args, _b: Option<BlockRef>) -> RResult {
        Ok(Value::fixnum_unchecked(args.len() as i64))
    }

    fn return_captured_self(
        _env: EnvRef,
        self_: Value,
        _args: &Args,
        _b: Option<BlockRef>,
    ) -> RResult {
        Ok(self_)
    }

    #[test]
    fn test_proc_arity_is_loose() {
        let env = runtime_env();
        let block = BlockRef::create(env, Value::nil(), arg_count, 2);
        let args = [Value::fixnum_unchecked(1)];
        let result = block.run(env, &Args::new(&args), None).unwrap();
        assert_eq!(result.as_fixnum(), 1);
    }

    #[test]
    fn test_lambda_arity_is_strict() {
        let env = runtime_env();
        let block =
            BlockRef::create_with(env, Value::nil(), arg_count, 2, BlockKind::Lambda, false);
        let args = [Value::fixnum_unchecked(1)];
        let err = block.run(env, &Args::new(&args), None).unwrap_err();
        assert_eq!(unwind_class_name(&err), "ArgumentError");

        let args = [Value::fixnum_unchecked(1), Value::fixnum_unchecked(2)];
        assert_eq!(
            block.run(env, &Args::new(&args), None).unwrap().as_fixnum(),
            2
        );
    }

    #[test]
    fn test_variadic_arity() {
        let env = runtime_env();
        // arity -2: one required, rest variadic.
        let block =
            BlockRef::create_with(env, Value::nil(), arg_count, -2, BlockKind::Lambda, false);
        assert!(block.run(env, &Args::empty(), None).is_err());
        let args = [Value::nil(), Value::nil(), Value::nil()];
        assert_eq!(
            block.run(env, &Args::new(&args), None).unwrap().as_fixnum(),
            3
        );
    }

    #[test]
    fn test_instance_eval_rebinds_and_restores_self() {
        let env = runtime_env();
        let original = Value::fixnum_unchecked(10);
        let receiver = crate::object::create_object(GlobalEnv::the().object_class());

        let block = BlockRef::create(env, original, return_captured_self, 0);
        let seen = instance_eval(env, receiver, Some(block)).unwrap();
        assert_eq!(seen, receiver);
        // Restored after the call.
        assert_eq!(block.self_value(), original);
    }

    #[test]
    fn test_instance_eval_restores_self_on_unwind() {
        let env = runtime_env();
        fn boom(env: EnvRef, _s: Value, _a: &Args, _b: Option<BlockRef>) -> RResult {
            Err(env.raise("RuntimeError", "boom"))
        }
        let original = Value::fixnum_unchecked(1);
        let receiver = crate::object::create_object(GlobalEnv::the().object_class());
        let block = BlockRef::create(env, original, boom, 0);
        assert!(instance_eval(env, receiver, Some(block)).is_err());
        assert_eq!(block.self_value(), original);
    }

    #[test]
    fn test_method_kind_self_cannot_rebind() {
        let env = runtime_env();
        let pinned = Value::fixnum_unchecked(99);
        let block = BlockRef::create_with(
            env,
            pinned,
            return_captured_self,
            0,
            BlockKind::Method,
            false,
        );
        block.set_self(Value::fixnum_unchecked(1));
        assert_eq!(block.self_value(), pinned);
    }

    #[test]
    fn test_proc_wrapper_round_trip() {
        let env = runtime_env();
        let block = BlockRef::create(env, Value::nil(), arg_count, 0);
        let proc_value = ProcRef::create(block);
        let proc_ref = ProcRef::from_value(proc_value);
        assert!(!proc_ref.is_lambda());
        assert_eq!(
            proc_ref.call(env, &Args::empty(), None).unwrap().as_fixnum(),
            0
        );
    }
}
