//! The object header and the uniform object operations.
//!
//! Every heap payload begins with an [`ObjectHeader`]: GC cell state, the
//! type tag, the frozen bit, the class reference, the lazily created
//! singleton-class slot and the lazily allocated ivar map. The operations
//! here — ivars, freeze, dup/clone, singleton classes — work on any `Value`
//! and encode the receiver-kind special cases (immediates cannot carry
//! ivars; fixnums, floats and symbols cannot grow singleton classes).

use crate::env::EnvRef;
use crate::exception::RResult;
use crate::global_env::GlobalEnv;
use crate::module_object::ModuleRef;
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::{Symbol, Value};
use garnet_gc::CellHeader;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;

bitflags::bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Object refuses further mutation.
        const FROZEN = 1 << 0;
    }
}

/// Map from ivar name to value, allocated on first write.
pub type IvarMap = FxHashMap<Symbol, Value>;

/// Common header at the start of every heap cell.
///
/// `#[repr(C)]` with the GC's [`CellHeader`] first, so a cell pointer, an
/// object pointer and a GC header pointer are one address.
#[repr(C)]
pub struct ObjectHeader {
    cell: CellHeader,
    type_: ObjectType,
    flags: HeaderFlags,
    class: Value,
    singleton_class: Value,
    ivars: Option<Box<IvarMap>>,
}

impl ObjectHeader {
    /// A fresh header. `class` is `nil` only for internal cell kinds and
    /// for `Class` itself mid-bootstrap, before its metaclass cycle closes.
    pub fn new(type_: ObjectType, class: Value) -> Self {
        Self {
            cell: CellHeader::new(),
            type_,
            flags: HeaderFlags::empty(),
            class,
            singleton_class: Value::nil(),
            ivars: None,
        }
    }

    /// A header sweep must never reclaim (bootstrap classes, interned
    /// symbol objects).
    pub fn uncollectible(type_: ObjectType, class: Value) -> Self {
        Self {
            cell: CellHeader::uncollectible(),
            ..Self::new(type_, class)
        }
    }

    /// The payload kind.
    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.type_
    }

    pub(crate) fn set_object_type(&mut self, type_: ObjectType) {
        self.type_ = type_;
    }

    /// The class reference.
    #[inline]
    pub fn class(&self) -> Value {
        self.class
    }

    pub(crate) fn set_class(&mut self, class: Value) {
        self.class = class;
    }

    /// The singleton class, if one has been created.
    #[inline]
    pub fn singleton_class(&self) -> Option<Value> {
        if self.singleton_class.is_nil() {
            None
        } else {
            Some(self.singleton_class)
        }
    }

    pub(crate) fn set_singleton_class(&mut self, class: Value) {
        self.singleton_class = class;
    }

    /// Is the frozen bit set?
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.flags.contains(HeaderFlags::FROZEN)
    }

    pub(crate) fn set_frozen(&mut self) {
        self.flags |= HeaderFlags::FROZEN;
    }

    /// GC cell state.
    #[inline]
    pub fn cell(&self) -> &CellHeader {
        &self.cell
    }

    // Ivar table access. Name validity and frozen checks live in the
    // `Value`-level operations below.

    pub(crate) fn ivar_get_raw(&self, name: Symbol) -> Option<Value> {
        self.ivars.as_ref().and_then(|map| map.get(&name).copied())
    }

    pub(crate) fn ivar_set_raw(&mut self, name: Symbol, value: Value) {
        self.ivars
            .get_or_insert_with(Box::default)
            .insert(name, value);
    }

    pub(crate) fn ivar_remove_raw(&mut self, name: Symbol) -> Option<Value> {
        self.ivars.as_mut().and_then(|map| map.remove(&name))
    }

    pub(crate) fn copy_ivars_from(&mut self, other: &ObjectHeader) {
        self.ivars = other.ivars.clone();
    }

    /// Visit every ivar pair.
    pub fn each_ivar(&self, mut f: impl FnMut(Symbol, Value)) {
        if let Some(map) = &self.ivars {
            for (&name, &value) in map.iter() {
                f(name, value);
            }
        }
    }
}

/// A plain object: nothing beyond the header.
#[repr(C)]
pub struct RObject {
    /// Shared header.
    pub header: ObjectHeader,
}

/// Allocate a heap cell and move `payload` into it.
///
/// The payload must start with an [`ObjectHeader`] (`#[repr(C)]`). A
/// collection triggered by this allocation scans the caller's stack, so the
/// payload's own references are rooted while it sits in the caller's frame.
pub(crate) fn alloc_cell<T>(payload: T) -> NonNull<T> {
    let cell = garnet_gc::heap::allocate(std::mem::size_of::<T>()) as *mut T;
    unsafe {
        cell.write(payload);
        NonNull::new_unchecked(cell)
    }
}

/// Create a plain instance of `class`.
pub fn create_object(class: Value) -> Value {
    let ptr = alloc_cell(RObject {
        header: ObjectHeader::new(ObjectType::Object, class),
    });
    Value::from_ptr(ptr.as_ptr() as *const ())
}

// =============================================================================
// Instance variables
// =============================================================================

fn ensure_ivar_name(env: EnvRef, name: Symbol) -> RResult<()> {
    if !name.is_ivar_name() {
        return Err(env.raise(
            "NameError",
            format!("`{name}' is not allowed as an instance variable name"),
        ));
    }
    Ok(())
}

/// Can this receiver carry instance variables at all?
///
/// Integers (fixnum and bignum) and floats cannot; reads on them answer
/// `nil` and writes fail. Other immediates (`nil`, `true`, `false`) have no
/// header to store into either.
fn ivar_capable(receiver: Value) -> bool {
    match receiver.heap_type() {
        Some(ObjectType::Bignum) | Some(ObjectType::Float) => false,
        Some(_) => true,
        None => false,
    }
}

/// Read an instance variable; `nil` when unset or on ivar-less receivers.
pub fn ivar_get(env: EnvRef, receiver: Value, name: Symbol) -> RResult {
    let _guard = garnet_gc::gc_lock();
    ensure_ivar_name(env, name)?;
    if !ivar_capable(receiver) {
        return Ok(Value::nil());
    }
    Ok(receiver
        .header()
        .and_then(|h| h.ivar_get_raw(name))
        .unwrap_or_default())
}

/// Write an instance variable. Fails with `FrozenError` on a frozen
/// receiver and with `FrozenError`/`NameError` per the receiver rules.
pub fn ivar_set(env: EnvRef, receiver: Value, name: Symbol, value: Value) -> RResult {
    let _guard = garnet_gc::gc_lock();
    assert_not_frozen(env, receiver)?;
    ensure_ivar_name(env, name)?;
    if !ivar_capable(receiver) {
        return Err(env.raise(
            "FrozenError",
            format!("can't modify frozen {}", receiver.class_name()),
        ));
    }
    // Safety: ivar_capable proved a heap header; mutation is under the lock.
    unsafe { receiver.header_mut_unchecked() }.ivar_set_raw(name, value);
    Ok(value)
}

/// Is the instance variable set?
pub fn ivar_defined(env: EnvRef, receiver: Value, name: Symbol) -> RResult<bool> {
    ensure_ivar_name(env, name)?;
    if !ivar_capable(receiver) {
        return Ok(false);
    }
    Ok(receiver
        .header()
        .is_some_and(|h| h.ivar_get_raw(name).is_some()))
}

/// Remove and return an instance variable; `NameError` when unset.
pub fn ivar_remove(env: EnvRef, receiver: Value, name: Symbol) -> RResult {
    let _guard = garnet_gc::gc_lock();
    assert_not_frozen(env, receiver)?;
    ensure_ivar_name(env, name)?;
    let removed = if ivar_capable(receiver) {
        unsafe { receiver.header_mut_unchecked() }.ivar_remove_raw(name)
    } else {
        None
    };
    removed.ok_or_else(|| {
        env.raise(
            "NameError",
            format!("instance variable {name} not defined"),
        )
    })
}

// =============================================================================
// Freezing
// =============================================================================

/// Is the receiver frozen? Immediates always are.
pub fn is_frozen(receiver: Value) -> bool {
    match receiver.header() {
        Some(header) => header.is_frozen(),
        None => true,
    }
}

/// Freeze the receiver, and its singleton class if it has one. Idempotent;
/// immediates are already frozen.
pub fn freeze(receiver: Value) {
    let _guard = garnet_gc::gc_lock();
    let Some(header) = (unsafe { receiver.header_mut() }) else {
        return;
    };
    header.set_frozen();
    if let Some(singleton) = header.singleton_class() {
        if let Some(sheader) = unsafe { singleton.header_mut() } {
            sheader.set_frozen();
        }
    }
}

/// Fail with `FrozenError` (carrying the receiver) if frozen.
///
/// Immediates report frozen but never reach here from the ivar path; the
/// receiver-kind checks reject them first with their own error.
pub fn assert_not_frozen(env: EnvRef, receiver: Value) -> RResult<()> {
    if receiver.is_ptr() && is_frozen(receiver) {
        return Err(env.raise_frozen_error(receiver));
    }
    Ok(())
}

// =============================================================================
// Singleton classes
// =============================================================================

/// The receiver's singleton class, creating it on first use.
///
/// The new singleton's superclass is the singleton class of the receiver's
/// superclass (for class receivers) or the receiver's ordinary class
/// (otherwise). Fixnum, float and symbol receivers cannot have one. A
/// frozen receiver's fresh singleton class is born frozen.
pub fn singleton_class_of(env: EnvRef, receiver: Value) -> RResult {
    if receiver.is_fixnum()
        || matches!(
            receiver.heap_type(),
            Some(ObjectType::Float) | Some(ObjectType::Bignum) | Some(ObjectType::Symbol)
        )
    {
        return Err(env.raise("TypeError", "can't define singleton"));
    }

    // nil/true/false: their ordinary class doubles as the singleton.
    if !receiver.is_ptr() {
        return Ok(receiver.klass());
    }

    let _guard = garnet_gc::gc_lock();
    let header = receiver.header().expect("heap receiver");
    if let Some(existing) = header.singleton_class() {
        return Ok(existing);
    }

    let name = if receiver.is_module() {
        format!("#<Class:{}>", receiver.class_name_of_module())
    } else {
        format!("#<Class:{}>", receiver.inspected())
    };

    let singleton_superclass = if header.object_type() == ObjectType::Class {
        // Keep the metaclass tower aligned: the singleton of a class
        // inherits from the singleton of its superclass. The tower is
        // capped at `Class` itself, whose singleton inherits from `Class`.
        let superclass = receiver.as_module().superclass();
        if superclass.is_nil() {
            GlobalEnv::the().class_class()
        } else {
            singleton_class_of(env, superclass)?
        }
    } else {
        header.class()
    };

    let singleton = ModuleRef::create_class_with(
        ObjectType::Class,
        singleton_superclass,
        Some(&name),
        true,
    );

    let frozen = header.is_frozen();
    let receiver_header = unsafe { receiver.header_mut_unchecked() };
    receiver_header.set_singleton_class(singleton);
    if frozen {
        if let Some(sheader) = unsafe { singleton.header_mut() } {
            sheader.set_frozen();
        }
    }
    Ok(singleton)
}

/// `Object#extend`: include `module` into the receiver's singleton class.
pub fn extend(env: EnvRef, receiver: Value, module: Value) -> RResult<()> {
    if !module.is_module() {
        return Err(env.raise(
            "TypeError",
            format!("wrong argument type {} (expected Module)", module.class_name()),
        ));
    }
    let singleton = singleton_class_of(env, receiver)?;
    singleton.as_module().include(env, module)?;
    Ok(())
}

/// Define a method on the receiver's singleton class.
pub fn define_singleton_method(
    env: EnvRef,
    receiver: Value,
    name: Symbol,
    fn_: crate::method::NativeFn,
    arity: i32,
) -> RResult<Symbol> {
    let singleton = singleton_class_of(env, receiver)?;
    if is_frozen(singleton) {
        return Err(env.raise_frozen_error(receiver));
    }
    singleton.as_module().define_method(name, fn_, arity);
    Ok(name)
}

// =============================================================================
// Copying
// =============================================================================

/// Shallow copy: same class, fresh ivar map, never frozen, no singleton
/// class. Immediates and symbols return themselves.
pub fn duplicate(env: EnvRef, receiver: Value) -> RResult {
    let _guard = garnet_gc::gc_lock();
    crate::value_ext::copy_payload(env, receiver)
}

/// `Object#clone`: duplicate plus a copy of the singleton class, preserving
/// the frozen bit unless `freeze_override` says otherwise.
pub fn clone_object(env: EnvRef, receiver: Value, freeze_override: Option<bool>) -> RResult {
    if !receiver.is_ptr() {
        return Ok(receiver);
    }
    let _guard = garnet_gc::gc_lock();
    let copy = crate::value_ext::copy_payload(env, receiver)?;
    if !copy.is_ptr() {
        return Ok(copy);
    }

    let header = receiver.header().expect("heap receiver");
    if let Some(singleton) = header.singleton_class() {
        let singleton_copy = clone_object(env, singleton, None)?;
        unsafe { copy.header_mut_unchecked() }.set_singleton_class(singleton_copy);
    }

    let keep_frozen = freeze_override.unwrap_or_else(|| header.is_frozen());
    if keep_frozen && header.is_frozen() || freeze_override == Some(true) {
        freeze(copy);
    }
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use garnet_core::intern;

    #[test]
    fn test_ivar_get_set_round_trip() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        let name = intern("@x");

        assert!(ivar_get(env, obj, name).unwrap().is_nil());
        assert!(!ivar_defined(env, obj, name).unwrap());

        ivar_set(env, obj, name, Value::fixnum_unchecked(7)).unwrap();
        assert_eq!(ivar_get(env, obj, name).unwrap().as_fixnum(), 7);
        assert!(ivar_defined(env, obj, name).unwrap());

        let removed = ivar_remove(env, obj, name).unwrap();
        assert_eq!(removed.as_fixnum(), 7);
        assert!(!ivar_defined(env, obj, name).unwrap());
    }

    #[test]
    fn test_ivar_name_must_be_ivar_shaped() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        let err = ivar_set(env, obj, intern("x"), Value::nil()).unwrap_err();
        assert!(crate::exception::unwind_class_name(&err).contains("NameError"));
    }

    #[test]
    fn test_integer_receivers_cannot_carry_ivars() {
        let env = runtime_env();
        let fixnum = Value::fixnum_unchecked(3);
        assert!(ivar_get(env, fixnum, intern("@a")).unwrap().is_nil());
        assert!(ivar_set(env, fixnum, intern("@a"), Value::nil()).is_err());
    }

    #[test]
    fn test_freeze_is_idempotent_and_monotone() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        assert!(!is_frozen(obj));
        freeze(obj);
        assert!(is_frozen(obj));
        freeze(obj);
        assert!(is_frozen(obj));
        assert!(ivar_set(env, obj, intern("@x"), Value::nil()).is_err());
    }

    #[test]
    fn test_frozen_object_singleton_class_is_frozen() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        freeze(obj);
        let singleton = singleton_class_of(env, obj).unwrap();
        assert!(is_frozen(singleton));
    }

    #[test]
    fn test_singleton_class_is_cached() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        let a = singleton_class_of(env, obj).unwrap();
        let b = singleton_class_of(env, obj).unwrap();
        assert_eq!(a, b);
        assert!(a.as_module().is_singleton());
    }

    #[test]
    fn test_fixnum_singleton_class_is_a_type_error() {
        let env = runtime_env();
        let err = singleton_class_of(env, Value::fixnum_unchecked(1)).unwrap_err();
        assert!(crate::exception::unwind_class_name(&err).contains("TypeError"));
    }

    #[test]
    fn test_nil_singleton_class_is_nil_class() {
        let env = runtime_env();
        let singleton = singleton_class_of(env, Value::nil()).unwrap();
        assert_eq!(singleton, GlobalEnv::the().nil_class());
    }

    #[test]
    fn test_dup_resets_frozen_and_drops_singleton() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        ivar_set(env, obj, intern("@v"), Value::fixnum_unchecked(1)).unwrap();
        let _ = singleton_class_of(env, obj).unwrap();
        freeze(obj);

        let copy = duplicate(env, obj).unwrap();
        assert!(!is_frozen(copy));
        assert_eq!(ivar_get(env, copy, intern("@v")).unwrap().as_fixnum(), 1);
        assert!(copy.header().unwrap().singleton_class().is_none());
    }

    #[test]
    fn test_clone_preserves_frozen_and_singleton() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        let _ = singleton_class_of(env, obj).unwrap();
        freeze(obj);

        let copy = clone_object(env, obj, None).unwrap();
        assert!(is_frozen(copy));
        assert!(copy.header().unwrap().singleton_class().is_some());

        let thawed = clone_object(env, obj, Some(false)).unwrap();
        assert!(!is_frozen(thawed));
    }
}
