//! Runtime-side operations on the tagged value word.
//!
//! `garnet_core::Value` knows only its own encoding. This extension trait
//! layers the object model on top: header access, class resolution for
//! immediates, type predicates, `is_a?`, and inspection.

use crate::block::BlockRef;
use crate::env::EnvRef;
use crate::exception::{ExceptionRef, RResult};
use crate::global_env::GlobalEnv;
use crate::module_object::ModuleRef;
use crate::numeric::{BignumRef, FloatRef};
use crate::object::ObjectHeader;
use crate::object_type::ObjectType;
use crate::string_object::StringRef;
use crate::symbol_object::SymbolRef;
use garnet_core::Value;

/// Object-model operations on `Value`.
pub trait ValueExt: Copy {
    /// The payload kind, for heap values.
    fn heap_type(self) -> Option<ObjectType>;

    /// The object header, for heap values.
    fn header(self) -> Option<&'static ObjectHeader>;

    /// Mutable header access.
    ///
    /// # Safety
    /// Caller holds the GC lock and is the only mutator of this object.
    unsafe fn header_mut(self) -> Option<&'static mut ObjectHeader>;

    /// Mutable header access for a value known to be a heap pointer.
    ///
    /// # Safety
    /// As [`ValueExt::header_mut`], plus `self.is_ptr()`.
    unsafe fn header_mut_unchecked(self) -> &'static mut ObjectHeader;

    /// The value's class. Immediates resolve through the global env.
    fn klass(self) -> Value;

    /// The name of the value's class, for messages.
    fn class_name(self) -> String;

    /// For module/class values: their own name (not their class's).
    fn class_name_of_module(self) -> String;

    /// Is this a module or class object?
    fn is_module(self) -> bool;

    /// Is this a class object?
    fn is_class(self) -> bool;

    /// Is this a heap string?
    fn is_string(self) -> bool;

    /// Is this an exception object?
    fn is_exception(self) -> bool;

    /// `Object#is_a?`: does `class_value` appear in the ancestor list of
    /// this value's class (or singleton class)?
    fn is_a(self, class_value: Value) -> bool;

    /// Typed module reference. Debug-asserts the tag.
    fn as_module(self) -> ModuleRef;

    /// Typed string reference. Debug-asserts the tag.
    fn as_string(self) -> StringRef;

    /// Typed exception reference. Debug-asserts the tag.
    fn as_exception(self) -> ExceptionRef;

    /// Typed block reference. Debug-asserts the tag.
    fn as_block(self) -> BlockRef;

    /// Human-readable rendering for error messages.
    fn inspected(self) -> String;
}

impl ValueExt for Value {
    #[inline]
    fn heap_type(self) -> Option<ObjectType> {
        self.header().map(|h| h.object_type())
    }

    #[inline]
    fn header(self) -> Option<&'static ObjectHeader> {
        self.to_ptr()
            .map(|ptr| unsafe { &*(ptr as *const ObjectHeader) })
    }

    #[inline]
    unsafe fn header_mut(self) -> Option<&'static mut ObjectHeader> {
        self.to_ptr()
            .map(|ptr| unsafe { &mut *(ptr as *mut ObjectHeader) })
    }

    #[inline]
    unsafe fn header_mut_unchecked(self) -> &'static mut ObjectHeader {
        unsafe { &mut *(self.as_ptr() as *mut ObjectHeader) }
    }

    fn klass(self) -> Value {
        let global = GlobalEnv::the();
        if self.is_fixnum() {
            return global.integer_class();
        }
        if self.is_nil() {
            return global.nil_class();
        }
        if self.is_true() {
            return global.true_class();
        }
        if self.is_false() {
            return global.false_class();
        }
        self.header().map(|h| h.class()).unwrap_or_default()
    }

    fn class_name(self) -> String {
        let class = self.klass();
        if class.is_ptr() && class.heap_type().is_some_and(|t| t.is_module()) {
            class.as_module().name_or_anonymous()
        } else {
            "Object".to_owned()
        }
    }

    fn class_name_of_module(self) -> String {
        debug_assert!(self.is_module());
        self.as_module().name_or_anonymous()
    }

    #[inline]
    fn is_module(self) -> bool {
        self.heap_type().is_some_and(|t| t.is_module())
    }

    #[inline]
    fn is_class(self) -> bool {
        self.heap_type() == Some(ObjectType::Class)
    }

    #[inline]
    fn is_string(self) -> bool {
        self.heap_type() == Some(ObjectType::String)
    }

    #[inline]
    fn is_exception(self) -> bool {
        self.heap_type() == Some(ObjectType::Exception)
    }

    fn is_a(self, class_value: Value) -> bool {
        if !class_value.is_module() {
            return false;
        }
        let lookup = match self.header().and_then(|h| h.singleton_class()) {
            Some(singleton) => singleton,
            None => self.klass(),
        };
        if !lookup.is_module() {
            return false;
        }
        lookup
            .as_module()
            .ancestors()
            .iter()
            .any(|&ancestor| ancestor == class_value)
    }

    fn as_module(self) -> ModuleRef {
        ModuleRef::from_value(self)
    }

    fn as_string(self) -> StringRef {
        StringRef::from_value(self)
    }

    fn as_exception(self) -> ExceptionRef {
        ExceptionRef::from_value(self)
    }

    fn as_block(self) -> BlockRef {
        BlockRef::from_value(self)
    }

    fn inspected(self) -> String {
        if self.is_nil() {
            return "nil".to_owned();
        }
        if self.is_true() {
            return "true".to_owned();
        }
        if self.is_false() {
            return "false".to_owned();
        }
        if let Some(i) = self.to_fixnum() {
            return i.to_string();
        }
        match self.heap_type() {
            Some(ObjectType::String) => format!("{:?}", self.as_string().contents()),
            Some(ObjectType::Symbol) => format!(":{}", SymbolRef::from_value(self).symbol()),
            Some(ObjectType::Bignum) => BignumRef::from_value(self).value().to_string(),
            Some(ObjectType::Float) => FloatRef::from_value(self).value().to_string(),
            Some(ObjectType::Module) | Some(ObjectType::Class) => {
                self.as_module().name_or_anonymous()
            }
            Some(ObjectType::Exception) => {
                let exception = self.as_exception();
                format!("#<{}: {}>", self.class_name(), exception.message_str())
            }
            _ => format!("#<{}:{:#x}>", self.class_name(), self.bits()),
        }
    }
}

/// Payload-aware shallow copy used by `dup` and `clone`.
///
/// Same class, fresh ivar map, frozen bit clear, singleton class left
/// behind (clone re-copies it). Immediates and interned kinds return
/// themselves.
pub(crate) fn copy_payload(env: EnvRef, receiver: Value) -> RResult {
    if !receiver.is_ptr() {
        return Ok(receiver);
    }
    let copy = match receiver.heap_type().unwrap_or(ObjectType::Collected) {
        ObjectType::Object => crate::object::create_object(receiver.klass()),
        ObjectType::String => receiver.as_string().duplicate(),
        ObjectType::Array => crate::array_object::ArrayRef::from_value(receiver).duplicate(),
        ObjectType::Bignum => BignumRef::from_value(receiver).duplicate(),
        ObjectType::Float => {
            crate::numeric::FloatObject::create(FloatRef::from_value(receiver).value())
        }
        ObjectType::Symbol => return Ok(receiver),
        ObjectType::Module | ObjectType::Class => receiver.as_module().duplicate(),
        ObjectType::Exception => receiver.as_exception().duplicate(),
        ObjectType::Proc => crate::block::proc_duplicate(receiver),
        _ => {
            return Err(env.raise(
                "TypeError",
                format!("can't dup {}", receiver.class_name()),
            ))
        }
    };
    if let (Some(from), Some(to)) = (receiver.header(), unsafe { copy.header_mut() }) {
        to.copy_ivars_from(from);
    }
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use crate::object::create_object;
    use crate::string_object::StringObject;

    #[test]
    fn test_immediate_classes() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        assert_eq!(Value::nil().klass(), global.nil_class());
        assert_eq!(Value::truthy().klass(), global.true_class());
        assert_eq!(Value::falsy().klass(), global.false_class());
        assert_eq!(Value::fixnum_unchecked(1).klass(), global.integer_class());
    }

    #[test]
    fn test_is_a_walks_ancestors() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        let obj = create_object(global.object_class());
        assert!(obj.is_a(global.object_class()));
        assert!(!obj.is_a(global.string_class()));

        let s = StringObject::create("x");
        assert!(s.is_a(global.string_class()));
        assert!(s.is_a(global.object_class()));
    }

    #[test]
    fn test_inspected_immediates() {
        let _env = runtime_env();
        assert_eq!(Value::nil().inspected(), "nil");
        assert_eq!(Value::truthy().inspected(), "true");
        assert_eq!(Value::fixnum_unchecked(-3).inspected(), "-3");
    }

    #[test]
    fn test_inspected_string_quotes() {
        let _env = runtime_env();
        let s = StringObject::create("hi");
        assert_eq!(s.inspected(), "\"hi\"");
    }
}
