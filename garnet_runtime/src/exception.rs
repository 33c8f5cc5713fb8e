//! Exceptions and non-local exits.
//!
//! Ruby-level control flow that escapes a frame travels as the error arm of
//! [`RResult`]:
//!
//! - [`Unwind::Exception`] — a raised exception object, matched by rescue
//!   clauses on class hierarchy.
//! - [`Unwind::Throw`] — `throw`/`catch`, matched by tag identity, and
//!   converted to `UncaughtThrowError` if it reaches the top.
//!
//! `ensure` is the [`ensure`] combinator: the clause runs on both paths and
//! an exception raised inside it supersedes the one in flight. Non-local
//! `return` from a `Proc`-kind block is a `LocalJumpError` tagged with the
//! enclosing method's break-point id; the method's invoker catches only
//! matching tags and converts them to its own return value.

use crate::env::EnvRef;
use crate::method::MethodMissingReason;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::string_object::StringObject;
use crate::value_ext::ValueExt;
use garnet_core::Value;
use garnet_gc::{RootProvider, Tracer};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// A non-local exit in flight.
#[derive(Clone, Copy, Debug)]
pub enum Unwind {
    /// A raised exception unwinding toward a rescue.
    Exception(ExceptionRef),
    /// `throw` looking for its `catch`, matched by tag identity.
    Throw {
        /// The tag thrown.
        tag: Value,
        /// The value carried to the catch.
        value: Value,
    },
}

/// The result type of every Ruby-visible operation.
pub type RResult<T = Value> = Result<T, Unwind>;

/// Exception payload.
#[repr(C)]
pub struct ExceptionObject {
    /// Shared header; the class decides rescue matching.
    pub header: ObjectHeader,
    message: Value,
    cause: Value,
    backtrace: Option<Vec<String>>,
    /// Break-point tag for non-local block return; 0 when unused.
    break_point: u64,
    /// Value carried by a non-local return.
    exit_value: Value,
    /// Process status for `SystemExit`.
    exit_status: i32,
    /// Why dispatch failed, for `NoMethodError`.
    missing_reason: Option<MethodMissingReason>,
    /// Receiver payload for `FrozenError` / `NoMethodError`.
    receiver: Value,
}

/// Typed reference to an exception object.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionRef(NonNull<ExceptionObject>);

impl ExceptionRef {
    /// Wrap a value already known to be an exception.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Exception));
        Self(NonNull::new(value.as_ptr() as *mut ExceptionObject).expect("non-null exception"))
    }

    /// Allocate a new exception of `class` with `message`.
    pub fn create(class: Value, message: &str) -> Self {
        let message_value = StringObject::create(message);
        let ptr = alloc_cell(ExceptionObject {
            header: ObjectHeader::new(ObjectType::Exception, class),
            message: message_value,
            cause: Value::nil(),
            backtrace: None,
            break_point: 0,
            exit_value: Value::nil(),
            exit_status: 0,
            missing_reason: None,
            receiver: Value::nil(),
        });
        Self(ptr)
    }

    fn get(&self) -> &'static ExceptionObject {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &'static mut ExceptionObject {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// The exception as a value.
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }

    /// The message string value.
    pub fn message(&self) -> Value {
        self.get().message
    }

    /// The message as a Rust string.
    pub fn message_str(&self) -> String {
        let message = self.get().message;
        if message.is_string() {
            message.as_string().contents().to_owned()
        } else {
            message.inspected()
        }
    }

    /// The exception's class name.
    pub fn class_name(&self) -> String {
        self.as_value().class_name()
    }

    /// The chained cause, if any.
    pub fn cause(&self) -> Option<ExceptionRef> {
        let cause = self.get().cause;
        cause.is_exception().then(|| cause.as_exception())
    }

    /// Chain a cause.
    pub fn set_cause(&self, cause: ExceptionRef) {
        if cause.as_value() != self.as_value() {
            self.get_mut().cause = cause.as_value();
        }
    }

    /// The captured backtrace, if capture has happened.
    pub fn backtrace(&self) -> Option<&[String]> {
        self.get().backtrace.as_deref()
    }

    /// Capture the backtrace from `env` unless already captured.
    pub fn capture_backtrace(&self, env: EnvRef) {
        if self.get().backtrace.is_none() {
            self.get_mut().backtrace = Some(env.backtrace());
        }
    }

    /// Break-point tag; 0 when this is not a non-local return.
    pub fn break_point(&self) -> u64 {
        self.get().break_point
    }

    /// The value a non-local return carries.
    pub fn exit_value(&self) -> Value {
        self.get().exit_value
    }

    pub(crate) fn set_non_local_return(&self, break_point: u64, exit_value: Value) {
        let exception = self.get_mut();
        exception.break_point = break_point;
        exception.exit_value = exit_value;
    }

    /// Is this a `LocalJumpError` carrying exactly this break point?
    pub fn is_local_jump_with(&self, break_point: u64) -> bool {
        break_point != 0
            && self.break_point() == break_point
            && self.as_value().is_a(crate::global_env::GlobalEnv::the().local_jump_error_class())
    }

    /// `SystemExit` status.
    pub fn exit_status(&self) -> i32 {
        self.get().exit_status
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        self.get_mut().exit_status = status;
    }

    /// The recorded method-missing reason, for `NoMethodError`.
    pub fn missing_reason(&self) -> Option<MethodMissingReason> {
        self.get().missing_reason
    }

    pub(crate) fn set_missing_reason(&self, reason: MethodMissingReason) {
        self.get_mut().missing_reason = Some(reason);
    }

    /// The receiver the failure was about, when recorded.
    pub fn receiver(&self) -> Value {
        self.get().receiver
    }

    pub(crate) fn set_receiver(&self, receiver: Value) {
        self.get_mut().receiver = receiver;
    }

    /// Shallow copy with the same class and message.
    pub fn duplicate(&self) -> Value {
        let source = self.get();
        let ptr = alloc_cell(ExceptionObject {
            header: ObjectHeader::new(ObjectType::Exception, self.as_value().klass()),
            message: source.message,
            cause: source.cause,
            backtrace: source.backtrace.clone(),
            break_point: source.break_point,
            exit_value: source.exit_value,
            exit_status: source.exit_status,
            missing_reason: source.missing_reason,
            receiver: source.receiver,
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let exception = self.get();
        tracer.visit(exception.message);
        tracer.visit(exception.cause);
        tracer.visit(exception.exit_value);
        tracer.visit(exception.receiver);
    }
}

// =============================================================================
// Per-thread current exception ($!)
// =============================================================================

/// Per-thread current-exception slot, keyed by the GC registry thread id so
/// the collector can treat every slot as a root.
struct CurrentExceptions {
    by_thread: Mutex<FxHashMap<u64, Value>>,
}

// Safety: values are word bit patterns behind a lock.
unsafe impl Send for CurrentExceptions {}
unsafe impl Sync for CurrentExceptions {}

impl RootProvider for CurrentExceptions {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for &value in self.by_thread.lock().values() {
            tracer.visit(value);
        }
    }
}

fn current_exceptions() -> &'static CurrentExceptions {
    static CURRENT: OnceLock<CurrentExceptions> = OnceLock::new();
    CURRENT.get_or_init(|| CurrentExceptions {
        by_thread: Mutex::new(FxHashMap::default()),
    })
}

pub(crate) fn register_root_provider() {
    garnet_gc::trace::register_root_provider(current_exceptions());
}

fn current_thread_key() -> u64 {
    garnet_gc::ThreadRegistry::the()
        .current()
        .map(|t| t.id())
        .unwrap_or(0)
}

/// The exception being handled on this thread (`$!`), or `nil`.
pub fn current_exception() -> Value {
    current_exceptions()
        .by_thread
        .lock()
        .get(&current_thread_key())
        .copied()
        .unwrap_or_default()
}

/// Set this thread's current exception. `nil` clears.
pub fn set_current_exception(value: Value) {
    let mut map = current_exceptions().by_thread.lock();
    if value.is_nil() {
        map.remove(&current_thread_key());
    } else {
        map.insert(current_thread_key(), value);
    }
}

// =============================================================================
// Control-flow combinators
// =============================================================================

/// `begin … ensure … end`: the clause runs whether or not the body unwound;
/// an exception raised inside the clause supersedes the one in flight.
pub fn ensure<R>(
    body: impl FnOnce() -> RResult<R>,
    ensure_clause: impl FnOnce() -> RResult<()>,
) -> RResult<R> {
    let result = body();
    match ensure_clause() {
        Ok(()) => result,
        Err(superseding) => Err(superseding),
    }
}

/// `begin … rescue <classes> => e … end`.
///
/// Runs `handler` when the body raised an exception matching any class in
/// `classes` on its ancestor chain. While the handler runs, the exception
/// is this thread's current exception (`$!`), restored afterwards. Throws
/// and unmatched exceptions pass through.
pub fn rescue(
    env: EnvRef,
    body: impl FnOnce() -> RResult,
    classes: &[Value],
    handler: impl FnOnce(EnvRef, Value) -> RResult,
) -> RResult {
    match body() {
        Err(Unwind::Exception(exception))
            if classes.iter().any(|&c| exception.as_value().is_a(c)) =>
        {
            let previous = current_exception();
            set_current_exception(exception.as_value());
            let result = handler(env, exception.as_value());
            set_current_exception(previous);
            result
        }
        other => other,
    }
}

/// `throw(tag, value)`.
pub fn throw_value(tag: Value, value: Value) -> Unwind {
    Unwind::Throw { tag, value }
}

/// `catch(tag) { … }`: stops a matching throw, by tag identity.
pub fn catch_tag(env: EnvRef, tag: Value, body: impl FnOnce(EnvRef) -> RResult) -> RResult {
    match body(env) {
        Err(Unwind::Throw { tag: thrown, value }) if thrown == tag => Ok(value),
        other => other,
    }
}

// =============================================================================
// Top level
// =============================================================================

/// Handle an unwind that escaped every frame. Prints (except `SystemExit`)
/// and returns the process exit code.
pub fn handle_top_level(env: EnvRef, unwind: Unwind) -> i32 {
    match unwind {
        Unwind::Throw { tag, .. } => {
            let error = env.raise(
                "UncaughtThrowError",
                format!("uncaught throw {}", tag.inspected()),
            );
            match error {
                Unwind::Exception(exception) => print_exception(&exception),
                Unwind::Throw { .. } => unreachable!("raise returns an exception"),
            }
            1
        }
        Unwind::Exception(exception) => {
            let global = crate::global_env::GlobalEnv::the();
            if exception.as_value().is_a(global.system_exit_class()) {
                return exception.exit_status();
            }
            print_exception(&exception);
            1
        }
    }
}

fn print_exception(exception: &ExceptionRef) {
    eprintln!("{}: {}", exception.class_name(), exception.message_str());
    if let Some(backtrace) = exception.backtrace() {
        for line in backtrace {
            eprintln!("\tfrom {line}");
        }
    }
    let mut cause = exception.cause();
    while let Some(current) = cause {
        eprintln!("caused by {}: {}", current.class_name(), current.message_str());
        cause = current.cause();
    }
}

/// The class name an unwind would present as. Test helper.
pub fn unwind_class_name(unwind: &Unwind) -> String {
    match unwind {
        Unwind::Exception(exception) => exception.class_name(),
        Unwind::Throw { .. } => "UncaughtThrowError".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use crate::global_env::GlobalEnv;
    use crate::symbol_object::symbol_value;
    use garnet_core::intern;

    #[test]
    fn test_ensure_runs_on_success_and_failure() {
        let env = runtime_env();
        let mut log: Vec<&str> = Vec::new();

        let ok = ensure(
            || Ok(Value::fixnum_unchecked(1)),
            || {
                log.push("a");
                Ok(())
            },
        );
        assert_eq!(ok.unwrap().as_fixnum(), 1);

        let err = ensure(
            || -> RResult { Err(env.raise("RuntimeError", "x")) },
            || {
                log.push("b");
                Ok(())
            },
        );
        assert!(err.is_err());
        assert_eq!(log, vec!["a", "b"]);
    }

    #[test]
    fn test_ensure_exception_supersedes() {
        let env = runtime_env();
        let result = ensure(
            || -> RResult { Err(env.raise("RuntimeError", "original")) },
            || Err(env.raise("TypeError", "superseding")),
        );
        assert_eq!(unwind_class_name(&result.unwrap_err()), "TypeError");
    }

    #[test]
    fn test_rescue_matches_on_hierarchy() {
        let env = runtime_env();
        let global = GlobalEnv::the();

        // TypeError rescued by StandardError: hierarchy match.
        let result = rescue(
            env,
            || Err(env.raise("TypeError", "t")),
            &[global.standard_error_class()],
            |_env, exception| {
                assert_eq!(exception.as_exception().class_name(), "TypeError");
                Ok(Value::fixnum_unchecked(9))
            },
        );
        assert_eq!(result.unwrap().as_fixnum(), 9);
    }

    #[test]
    fn test_rescue_passes_unmatched_through() {
        let env = runtime_env();
        let global = GlobalEnv::the();
        let result = rescue(
            env,
            || Err(env.raise("TypeError", "t")),
            &[global.name_error_class()],
            |_env, _e| Ok(Value::nil()),
        );
        assert_eq!(unwind_class_name(&result.unwrap_err()), "TypeError");
    }

    #[test]
    fn test_rescue_sets_and_restores_current_exception() {
        let env = runtime_env();
        let global = GlobalEnv::the();
        assert!(current_exception().is_nil());
        let _ = rescue(
            env,
            || Err(env.raise("RuntimeError", "boom")),
            &[global.standard_error_class()],
            |_env, exception| {
                assert_eq!(current_exception(), exception);
                Ok(Value::nil())
            },
        );
        assert!(current_exception().is_nil());
    }

    #[test]
    fn test_catch_stops_matching_throw() {
        let env = runtime_env();
        let tag = symbol_value(intern("done"));
        let result = catch_tag(env, tag, |_env| {
            Err(throw_value(tag, Value::fixnum_unchecked(5)))
        });
        assert_eq!(result.unwrap().as_fixnum(), 5);
    }

    #[test]
    fn test_catch_ignores_other_tags() {
        let env = runtime_env();
        let tag = symbol_value(intern("outer_tag"));
        let other = symbol_value(intern("inner_tag"));
        let result = catch_tag(env, tag, |_env| {
            Err(throw_value(other, Value::nil()))
        });
        match result {
            Err(Unwind::Throw { tag: thrown, .. }) => assert_eq!(thrown, other),
            _ => panic!("throw should pass through a non-matching catch"),
        }
    }

    #[test]
    fn test_nested_catch() {
        let env = runtime_env();
        let outer = symbol_value(intern("nest_outer"));
        let inner = symbol_value(intern("nest_inner"));
        let result = catch_tag(env, outer, |env| {
            let inner_result = catch_tag(env, inner, |_env| {
                Err(throw_value(outer, Value::fixnum_unchecked(1)))
            });
            // The inner catch must not intercept the outer tag.
            assert!(inner_result.is_err());
            inner_result
        });
        assert_eq!(result.unwrap().as_fixnum(), 1);
    }

    #[test]
    fn test_cause_chain() {
        let env = runtime_env();
        let global = GlobalEnv::the();
        let result = rescue(
            env,
            || Err(env.raise("TypeError", "first")),
            &[global.standard_error_class()],
            // Raising inside a rescue chains the in-flight exception as
            // the cause.
            |env, _exception| Err(env.raise("RuntimeError", "second")),
        );
        let unwound = match result.unwrap_err() {
            Unwind::Exception(e) => e,
            _ => panic!("expected exception"),
        };
        assert_eq!(unwound.class_name(), "RuntimeError");
        let cause = unwound.cause().expect("cause chained");
        assert_eq!(cause.class_name(), "TypeError");
    }

    #[test]
    fn test_system_exit_status_at_top_level() {
        let env = runtime_env();
        let exit = env.raise_system_exit(3);
        match exit {
            Unwind::Exception(exception) => {
                assert_eq!(handle_top_level(env, Unwind::Exception(exception)), 3);
            }
            _ => panic!("expected exception"),
        }
    }
}
