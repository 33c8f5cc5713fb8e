//! The built-in self-test program.
//!
//! A small native program driven through the runtime's public contracts —
//! class creation, dispatch, visibility, exceptions, non-local returns and
//! an explicit collection — so a plain binary can prove the runtime is
//! alive without a script front-end.

use garnet_runtime::args::Args;
use garnet_runtime::block::{BlockKind, BlockRef};
use garnet_runtime::dispatch;
use garnet_runtime::exception::{catch_tag, ensure, rescue, throw_value, RResult};
use garnet_runtime::method::Visibility;
use garnet_runtime::module_object::ModuleRef;
use garnet_runtime::string_object::StringObject;
use garnet_runtime::symbol_object::symbol_value;
use garnet_runtime::value_ext::ValueExt;
use garnet_runtime::{intern, numeric, EnvRef, GlobalEnv, Value};

fn greeting(env: EnvRef, self_: Value, _args: &Args, _block: Option<BlockRef>) -> RResult {
    let name = garnet_runtime::object::ivar_get(env, self_, intern("@name"))?;
    let name_text = if name.is_string() {
        name.as_string().contents().to_owned()
    } else {
        "world".to_owned()
    };
    Ok(StringObject::create(format!("hello, {name_text}")))
}

fn initialize(env: EnvRef, self_: Value, args: &Args, _block: Option<BlockRef>) -> RResult {
    garnet_runtime::object::ivar_set(env, self_, intern("@name"), args.at(0))
}

fn check(condition: bool, what: &str) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(format!("self-test failed: {what}"))
    }
}

/// Run the self-test. Returns an error description on the first failure.
pub fn run(env: EnvRef) -> Result<(), String> {
    let global = GlobalEnv::the();

    // Class creation, initialize protocol, dispatch.
    let greeter = ModuleRef::create_class("Greeter", global.object_class());
    global
        .object_class()
        .as_module()
        .const_set(intern("Greeter"), greeter);
    let greeter_ref = greeter.as_module();
    greeter_ref.define_method_with_visibility(
        intern("initialize"),
        initialize,
        1,
        Visibility::Private,
    );
    greeter_ref.define_method(intern("greeting"), greeting, 0);

    let args = [StringObject::create("garnet")];
    let object = dispatch::new_instance(env, greeter, &Args::new(&args), None)
        .map_err(|_| "Greeter.new raised".to_owned())?;
    let answer = dispatch::send(env, object, intern("greeting"), &Args::empty(), None)
        .map_err(|_| "Greeter#greeting raised".to_owned())?;
    check(
        answer.is_string() && answer.as_string().contents() == "hello, garnet",
        "dispatch through a user-defined class",
    )?;

    // Fixnum overflow to bignum.
    let x = numeric::integer(1 << 62);
    let sum = numeric::add(env, x, x).map_err(|_| "integer add raised".to_owned())?;
    check(!sum.is_fixnum(), "63-bit overflow produced a heap integer")?;

    // Exceptions: raise, rescue, ensure ordering.
    let order = std::cell::RefCell::new(Vec::new());
    let rescued = rescue(
        env,
        || {
            ensure(
                || -> RResult { Err(env.raise("RuntimeError", "expected")) },
                || {
                    order.borrow_mut().push("ensure");
                    Ok(())
                },
            )
        },
        &[global.standard_error_class()],
        |_env, exception| {
            order.borrow_mut().push("rescue");
            Ok(exception)
        },
    );
    check(
        rescued.is_ok() && *order.borrow() == ["ensure", "rescue"],
        "ensure before rescue during unwinding",
    )?;

    // throw/catch by tag identity.
    let tag = symbol_value(intern("selftest"));
    let caught = catch_tag(env, tag, |_env| {
        Err(throw_value(tag, Value::fixnum_unchecked(7)))
    });
    check(
        matches!(caught, Ok(v) if v.as_fixnum() == 7),
        "throw reaches its catch",
    )?;

    // Lambda arity is strict.
    fn identity(_e: EnvRef, _s: Value, a: &Args, _b: Option<BlockRef>) -> RResult {
        Ok(a.at(0))
    }
    let lambda = BlockRef::create_with(env, Value::nil(), identity, 1, BlockKind::Lambda, false);
    check(
        lambda.run(env, &Args::empty(), None).is_err(),
        "lambda rejects missing arguments",
    )?;

    // Survive an explicit collection.
    let keeper = StringObject::create("still here");
    for i in 0..10_000 {
        let _ = StringObject::create(format!("garbage {i}"));
    }
    garnet_runtime::collect_now();
    check(
        keeper.is_string() && keeper.as_string().contents() == "still here",
        "reachable string survives collection",
    )?;

    Ok(())
}
