//! Method dispatch.
//!
//! A call resolves against the receiver's singleton class when one exists,
//! else its class, walking the flattened ancestor list for the first entry
//! under the name. Visibility gates the hit: the entry dispatches when its
//! visibility clears the call's floor, or when it is protected and the
//! sender is_a the lookup class. Failures record a per-thread
//! method-missing reason, fall back to `method_missing` when the receiver
//! responds to it, and otherwise raise `NoMethodError` shaped by the
//! reason.

use crate::args::Args;
use crate::block::BlockRef;
use crate::env::EnvRef;
use crate::exception::RResult;
use crate::global_env::GlobalEnv;
use crate::method::{
    method_missing_reason, set_method_missing_reason, BoundMethodRef, MethodMissingReason,
    MethodRef, Visibility,
};
use crate::module_object::ConstSearchMode;
use crate::object_type::ObjectType;
use crate::symbol_object::symbol_value;
use crate::value_ext::ValueExt;
use garnet_core::{intern, Symbol, Value};

/// The class dispatch starts from: the receiver's singleton class if it has
/// one, else its class.
pub fn lookup_class(receiver: Value) -> Value {
    match receiver.header().and_then(|h| h.singleton_class()) {
        Some(singleton) => singleton,
        None => receiver.klass(),
    }
}

/// Resolve `name` against `receiver` under the visibility floor.
///
/// Records the method-missing reason on this thread when resolution fails;
/// `None` means the caller should try `method_missing` or raise.
pub fn find_method(
    receiver: Value,
    name: Symbol,
    floor: Visibility,
    sent_from: Option<Value>,
) -> Option<MethodRef> {
    let lookup = lookup_class(receiver);
    if !lookup.is_module() {
        set_method_missing_reason(MethodMissingReason::Undefined);
        return None;
    }

    let Some((info, _owner)) = lookup.as_module().find_method_info(name) else {
        set_method_missing_reason(MethodMissingReason::Undefined);
        return None;
    };

    // The undef_method tombstone reads as not-found, and stops the walk.
    let Some(method) = info.method else {
        set_method_missing_reason(MethodMissingReason::Undefined);
        return None;
    };

    if info.visibility >= floor {
        return Some(method);
    }

    if info.visibility == Visibility::Protected
        && sent_from.is_some_and(|sender| sender.is_a(lookup))
    {
        return Some(method);
    }

    set_method_missing_reason(match info.visibility {
        Visibility::Private => MethodMissingReason::Private,
        Visibility::Protected => MethodMissingReason::Protected,
        Visibility::Public => unreachable!("public methods clear every floor"),
    });
    None
}

/// `send` with an explicit visibility floor and sender.
pub fn send_with(
    env: EnvRef,
    receiver: Value,
    name: Symbol,
    args: &Args,
    block: Option<BlockRef>,
    floor: Visibility,
    sent_from: Option<Value>,
) -> RResult {
    if let Some(method) = find_method(receiver, name, floor, sent_from) {
        return method.call(env, receiver, args, block);
    }
    let reason = method_missing_reason();

    if let Some(handler) = find_method(receiver, intern("method_missing"), Visibility::Private, None)
    {
        // Re-shape the call as method_missing(name, *args) with the
        // original block. The handler lookup clobbered the thread's
        // reason, so restore it for the handler to consult.
        let mut forwarded = Vec::with_capacity(args.len() + 1);
        forwarded.push(symbol_value(name));
        forwarded.extend_from_slice(args.as_slice());
        let forwarded_args = if args.has_keyword_hash() {
            Args::with_keyword_hash(&forwarded)
        } else {
            Args::new(&forwarded)
        };
        set_method_missing_reason(reason);
        return handler.call(env, receiver, &forwarded_args, block);
    }

    Err(env.raise_no_method_error(receiver, name, reason))
}

/// `Object#send`: private methods are callable.
pub fn send(
    env: EnvRef,
    receiver: Value,
    name: Symbol,
    args: &Args,
    block: Option<BlockRef>,
) -> RResult {
    send_with(env, receiver, name, args, block, Visibility::Private, None)
}

/// `Object#public_send`: only public methods are callable.
pub fn public_send(
    env: EnvRef,
    receiver: Value,
    name: Symbol,
    args: &Args,
    block: Option<BlockRef>,
) -> RResult {
    send_with(env, receiver, name, args, block, Visibility::Public, None)
}

/// `super`: resume the ancestor walk one past the defining module of the
/// currently running method, with the same name.
pub fn send_super(env: EnvRef, receiver: Value, args: &Args, block: Option<BlockRef>) -> RResult {
    let Some(current) = env.method() else {
        return Err(env.raise("RuntimeError", "super called outside of method"));
    };
    let name = current.name();
    let defining = current.owner();

    let lookup = lookup_class(receiver);
    let ancestors = lookup.as_module().ancestors();
    let start = ancestors
        .iter()
        .position(|&ancestor| ancestor == defining)
        .map(|index| index + 1)
        .unwrap_or(0);

    for &ancestor in &ancestors[start..] {
        if let Some(info) = ancestor.as_module().own_method_info(name) {
            match info.method {
                Some(method) => return method.call(env, receiver, args, block),
                None => break,
            }
        }
    }

    Err(env.raise(
        "NoMethodError",
        format!(
            "super: no superclass method '{name}' for {}",
            receiver.inspected()
        ),
    ))
}

/// `Object#respond_to?`. With `include_all`, private and protected methods
/// count.
pub fn respond_to(receiver: Value, name: Symbol, include_all: bool) -> bool {
    let floor = if include_all {
        Visibility::Private
    } else {
        Visibility::Public
    };
    find_method(receiver, name, floor, None).is_some()
}

/// `defined?` classifier: what kind of thing does `name` denote for this
/// receiver, if any?
pub fn defined(
    env: EnvRef,
    receiver: Value,
    name: Symbol,
    strict: bool,
) -> RResult<Option<&'static str>> {
    if name.is_const_name() {
        let found = if strict {
            if receiver.is_module() {
                receiver.as_module().const_get(name)
            } else {
                None
            }
        } else {
            receiver
                .klass()
                .as_module()
                .const_find(env, name, ConstSearchMode::NotStrict)?
        };
        return Ok(found.map(|_| "constant"));
    }
    if name.is_global_name() {
        let value = env.global_get(name);
        return Ok((!value.is_nil()).then_some("global-variable"));
    }
    if name.is_ivar_name() {
        let value = crate::object::ivar_get(env, receiver, name)?;
        return Ok((!value.is_nil()).then_some("instance-variable"));
    }
    if respond_to(receiver, name, true) {
        return Ok(Some("method"));
    }
    Ok(None)
}

/// `Object#method`: extract a bound method, private methods included.
pub fn method_object(env: EnvRef, receiver: Value, name: Symbol) -> RResult {
    match find_method(receiver, name, Visibility::Private, None) {
        Some(method) => Ok(BoundMethodRef::create(receiver, method)),
        None => Err(env.raise_name_error(format!(
            "undefined method '{name}' for {}",
            receiver.inspected()
        ))),
    }
}

/// Instantiate `class`: the `create` contract consumed by built-in types.
///
/// `Class` and `Module` receivers produce anonymous classes/modules;
/// everything else gets a plain object of that class.
pub fn create(env: EnvRef, class: Value) -> RResult {
    if !class.is_class() {
        return Err(env.raise(
            "TypeError",
            format!("{} is not a class", class.inspected()),
        ));
    }
    let global = GlobalEnv::the();
    if class == global.class_class() {
        return Ok(crate::module_object::ModuleRef::create_class_with(
            ObjectType::Class,
            global.object_class(),
            None,
            false,
        ));
    }
    if class == global.module_class() {
        return Ok(crate::module_object::ModuleRef::create_class_with(
            ObjectType::Module,
            Value::nil(),
            None,
            false,
        ));
    }
    Ok(crate::object::create_object(class))
}

/// `Class#new`: allocate, then run `initialize` (with any visibility) when
/// the class defines one. Returns the new object, never initialize's value.
pub fn new_instance(
    env: EnvRef,
    class: Value,
    args: &Args,
    block: Option<BlockRef>,
) -> RResult {
    let object = create(env, class)?;
    if find_method(object, intern("initialize"), Visibility::Private, None).is_some() {
        send(env, object, intern("initialize"), args, block)?;
    }
    Ok(object)
}
