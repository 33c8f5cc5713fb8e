//! End-to-end behavior of the assembled runtime: dispatch, visibility,
//! exceptions, non-local exits, freezing, and the dispatch laws.
//!
//! Collection stays disabled here (no thread registration, no triggers),
//! so these tests are safe under the parallel test harness; collection
//! behavior lives in its own binary.

use garnet_runtime::args::Args;
use garnet_runtime::block::{self, BlockKind, BlockRef};
use garnet_runtime::dispatch;
use garnet_runtime::exception::{catch_tag, ensure, rescue, throw_value, RResult, Unwind};
use garnet_runtime::method::{MethodMissingReason, Visibility};
use garnet_runtime::module_object::ModuleRef;
use garnet_runtime::object::{self, create_object};
use garnet_runtime::string_object::StringObject;
use garnet_runtime::symbol_object::symbol_value;
use garnet_runtime::value_ext::ValueExt;
use garnet_runtime::{intern, numeric, EnvRef, GlobalEnv, Value};

fn boot() -> EnvRef {
    let _ = GlobalEnv::the();
    garnet_runtime::object_tracer::install();
    EnvRef::root()
}

fn fresh_class(name: &str) -> Value {
    ModuleRef::create_class(name, GlobalEnv::the().object_class())
}

// =============================================================================
// Scenario: fixnum arithmetic through dispatch, overflowing to bignum
// =============================================================================

fn integer_plus(env: EnvRef, self_: Value, args: &Args, _block: Option<BlockRef>) -> RResult {
    numeric::add(env, self_, args.at(0))
}

#[test]
fn test_fixnum_plus_fixnum_through_send() {
    let env = boot();
    let integer_class = GlobalEnv::the().integer_class().as_module();
    integer_class.define_method(intern("+"), integer_plus, 1);

    let args = [Value::fixnum_unchecked(2)];
    let three = dispatch::send(env, Value::fixnum_unchecked(1), intern("+"), &Args::new(&args), None)
        .unwrap();
    assert_eq!(three.as_fixnum(), 3);
}

#[test]
fn test_fixnum_overflow_produces_bignum() {
    let env = boot();
    let x = numeric::integer(1 << 62);
    let sum = numeric::add(env, x, x).unwrap();
    assert!(!sum.is_fixnum());
    assert!(sum.is_ptr());
    // 2**62 + 2**62 == 2**63.
    let expected = num_bigint::BigInt::from(1u128 << 63);
    assert_eq!(
        garnet_runtime::numeric::BignumRef::from_value(sum).value(),
        &expected
    );
}

// =============================================================================
// Scenario: private methods through send vs public_send
// =============================================================================

fn one(_env: EnvRef, _s: Value, _a: &Args, _b: Option<BlockRef>) -> RResult {
    Ok(Value::fixnum_unchecked(1))
}

#[test]
fn test_private_method_send_vs_public_send() {
    let env = boot();
    let class = fresh_class("PrivateFoo");
    class
        .as_module()
        .define_method_with_visibility(intern("foo"), one, 0, Visibility::Private);
    let obj = create_object(class);

    // obj.send(:foo) → 1
    assert_eq!(
        dispatch::send(env, obj, intern("foo"), &Args::empty(), None)
            .unwrap()
            .as_fixnum(),
        1
    );

    // obj.public_send(:foo) → NoMethodError mentioning "private"
    let err = dispatch::public_send(env, obj, intern("foo"), &Args::empty(), None).unwrap_err();
    match err {
        Unwind::Exception(exception) => {
            assert_eq!(exception.class_name(), "NoMethodError");
            assert!(exception.message_str().contains("private"));
            assert_eq!(exception.missing_reason(), Some(MethodMissingReason::Private));
        }
        _ => panic!("expected exception"),
    }
}

#[test]
fn test_send_equals_public_send_for_public_methods() {
    let env = boot();
    let class = fresh_class("PublicFoo");
    class.as_module().define_method(intern("foo"), one, 0);
    let obj = create_object(class);

    let a = dispatch::send(env, obj, intern("foo"), &Args::empty(), None).unwrap();
    let b = dispatch::public_send(env, obj, intern("foo"), &Args::empty(), None).unwrap();
    assert_eq!(a, b);
}

// =============================================================================
// Scenario: ensure ordering
// =============================================================================

#[test]
fn test_ensure_runs_then_reraises() {
    let env = boot();
    let log = std::cell::RefCell::new(Vec::new());

    let result = ensure(
        || -> RResult { Err(env.raise("RuntimeError", "x")) },
        || {
            log.borrow_mut().push("a");
            Ok(())
        },
    );

    assert_eq!(*log.borrow(), vec!["a"]);
    match result {
        Err(Unwind::Exception(exception)) => {
            assert_eq!(exception.message_str(), "x");
        }
        _ => panic!("the original exception must re-raise after ensure"),
    }
}

// =============================================================================
// Scenario: non-local block return
// =============================================================================

fn return_two_body(env: EnvRef, _self: Value, args: &Args, _b: Option<BlockRef>) -> RResult {
    // `return x if x == 2`
    if args.at(0).to_fixnum() == Some(2) {
        return Err(block::non_local_return_from(env, args.at(0)));
    }
    Ok(Value::nil())
}

fn method_with_each(env: EnvRef, self_: Value, _args: &Args, _b: Option<BlockRef>) -> RResult {
    // `[1,2,3].each { |x| return x if x == 2 }; 99`
    let each_block =
        BlockRef::create_with(env, self_, return_two_body, 1, BlockKind::Proc, true);
    for i in 1..=3 {
        let args = [Value::fixnum_unchecked(i)];
        each_block.run(env, &Args::new(&args), None)?;
    }
    Ok(Value::fixnum_unchecked(99))
}

#[test]
fn test_non_local_return_exits_enclosing_method() {
    let env = boot();
    let class = fresh_class("EachReturner");
    class.as_module().define_method(intern("m"), method_with_each, 0);
    let obj = create_object(class);

    let result = dispatch::send(env, obj, intern("m"), &Args::empty(), None).unwrap();
    assert_eq!(result.as_fixnum(), 2, "return inside the block exits `m`");
}

#[test]
fn test_unmatched_non_local_return_is_local_jump_error() {
    let env = boot();
    // A returning proc run with no enclosing method invocation.
    let block = BlockRef::create_with(env, Value::nil(), return_two_body, 1, BlockKind::Proc, true);
    let args = [Value::fixnum_unchecked(2)];
    let err = block.run(env, &Args::new(&args), None).unwrap_err();
    match err {
        Unwind::Exception(exception) => {
            assert_eq!(exception.class_name(), "LocalJumpError");
        }
        _ => panic!("expected LocalJumpError"),
    }
}

// =============================================================================
// Scenario: singleton class freezing
// =============================================================================

#[test]
fn test_frozen_object_singleton_class_is_frozen() {
    let env = boot();
    let obj = create_object(GlobalEnv::the().object_class());
    object::freeze(obj);
    let singleton = object::singleton_class_of(env, obj).unwrap();
    assert!(object::is_frozen(singleton));
}

#[test]
fn test_freeze_is_idempotent_and_monotone() {
    let _env = boot();
    let obj = create_object(GlobalEnv::the().object_class());
    assert!(!object::is_frozen(obj));
    object::freeze(obj);
    assert!(object::is_frozen(obj));
    object::freeze(obj);
    assert!(object::is_frozen(obj), "frozen? never goes back to false");
}

// =============================================================================
// Laws
// =============================================================================

#[test]
fn test_alias_then_remove_preserves_behavior() {
    let env = boot();
    let class = fresh_class("AliasLaw");
    class.as_module().define_method(intern("a"), one, 0);
    class.as_module().alias_method(env, intern("b"), intern("a")).unwrap();
    class.as_module().remove_method(env, intern("a")).unwrap();

    let obj = create_object(class);
    assert!(dispatch::send(env, obj, intern("a"), &Args::empty(), None).is_err());
    assert_eq!(
        dispatch::send(env, obj, intern("b"), &Args::empty(), None)
            .unwrap()
            .as_fixnum(),
        1
    );
}

#[test]
fn test_include_is_idempotent_law() {
    let env = boot();
    let class = fresh_class("IncludeLaw");
    let module = ModuleRef::create_module("IncludeLawM");
    class.as_module().include(env, module).unwrap();
    let before = class.as_module().ancestors();
    class.as_module().include(env, module).unwrap();
    assert_eq!(class.as_module().ancestors(), before);
}

#[test]
fn test_frozen_class_does_not_freeze_extracted_methods() {
    let env = boot();
    let class = fresh_class("FrozenExtraction");
    class.as_module().define_method(intern("m"), one, 0);
    let obj = create_object(class);

    let bound = dispatch::method_object(env, obj, intern("m")).unwrap();
    object::freeze(class);

    // The extracted method keeps dispatching after its class froze.
    let bound_ref = garnet_runtime::method::BoundMethodRef::from_value(bound);
    assert_eq!(
        bound_ref.call(env, &Args::empty(), None).unwrap().as_fixnum(),
        1
    );
    assert!(!object::is_frozen(bound));
}

#[test]
fn test_metaclass_tower_terminates() {
    let env = boot();
    let obj = create_object(GlobalEnv::the().object_class());

    let mut current = obj;
    let mut seen = Vec::new();
    for _ in 0..6 {
        let singleton = object::singleton_class_of(env, current).unwrap();
        assert!(singleton.is_class());
        assert!(
            !seen.contains(&singleton),
            "each level of the tower is a distinct class"
        );
        seen.push(singleton);
        current = singleton;
    }
}

#[test]
fn test_undef_blocks_inherited_method_via_send() {
    let env = boot();
    let parent = fresh_class("UndefLawParent");
    parent.as_module().define_method(intern("gone"), one, 0);
    let child = parent.as_module().subclass(env, Some("UndefLawChild")).unwrap();
    child.as_module().undef_method(intern("gone"));

    let obj = create_object(child);
    let err = dispatch::send(env, obj, intern("gone"), &Args::empty(), None).unwrap_err();
    match err {
        Unwind::Exception(exception) => {
            assert_eq!(exception.missing_reason(), Some(MethodMissingReason::Undefined));
        }
        _ => panic!("expected exception"),
    }
}

// =============================================================================
// throw/catch across dispatch
// =============================================================================

fn thrower(env: EnvRef, _self: Value, _args: &Args, _b: Option<BlockRef>) -> RResult {
    let tag = symbol_value(intern("deep_tag"));
    Err(throw_value(tag, StringObject::create("payload")))
}

#[test]
fn test_throw_unwinds_through_method_calls() {
    let env = boot();
    let class = fresh_class("Thrower");
    class.as_module().define_method(intern("dive"), thrower, 0);
    let obj = create_object(class);

    let tag = symbol_value(intern("deep_tag"));
    let result = catch_tag(env, tag, |env| {
        dispatch::send(env, obj, intern("dive"), &Args::empty(), None)
    })
    .unwrap();
    assert!(result.is_string());
    assert_eq!(result.as_string().contents(), "payload");
}

#[test]
fn test_rescue_does_not_intercept_throw() {
    let env = boot();
    let tag = symbol_value(intern("passthrough_tag"));
    let result = catch_tag(env, tag, |env| {
        rescue(
            env,
            || Err(throw_value(tag, Value::fixnum_unchecked(1))),
            &[GlobalEnv::the().standard_error_class()],
            |_env, _e| Ok(Value::fixnum_unchecked(0)),
        )
    });
    assert_eq!(result.unwrap().as_fixnum(), 1, "throw is not an exception");
}

// =============================================================================
// instance_eval / extend
// =============================================================================

fn read_tagged_ivar(env: EnvRef, self_: Value, _a: &Args, _b: Option<BlockRef>) -> RResult {
    object::ivar_get(env, self_, intern("@tag"))
}

#[test]
fn test_instance_eval_sees_receiver_ivars() {
    let env = boot();
    let obj = create_object(GlobalEnv::the().object_class());
    object::ivar_set(env, obj, intern("@tag"), Value::fixnum_unchecked(31)).unwrap();

    let block = BlockRef::create(env, Value::nil(), read_tagged_ivar, 0);
    let result = block::instance_eval(env, obj, Some(block)).unwrap();
    assert_eq!(result.as_fixnum(), 31);
}

#[test]
fn test_extend_adds_singleton_methods() {
    let env = boot();
    let module = ModuleRef::create_module("Greets");
    module.as_module().define_method(intern("greet"), one, 0);

    let obj = create_object(GlobalEnv::the().object_class());
    let peer = create_object(GlobalEnv::the().object_class());
    object::extend(env, obj, module).unwrap();

    assert_eq!(
        dispatch::send(env, obj, intern("greet"), &Args::empty(), None)
            .unwrap()
            .as_fixnum(),
        1
    );
    assert!(dispatch::send(env, peer, intern("greet"), &Args::empty(), None).is_err());
}
