//! Minimal string payload.
//!
//! The full `String` method library is out of scope, but the core cannot do
//! without string storage: exception messages, class names, `inspect`
//! output and `ARGV` all live here.

use crate::global_env::GlobalEnv;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use garnet_core::Value;
use std::ptr::NonNull;

/// Heap string: header plus a byte buffer.
#[repr(C)]
pub struct StringObject {
    /// Shared header.
    pub header: ObjectHeader,
    contents: String,
}

/// Typed reference to a heap string.
#[derive(Clone, Copy)]
pub struct StringRef(NonNull<StringObject>);

impl StringObject {
    /// Allocate a new string of `String` class.
    pub fn create(contents: impl Into<String>) -> Value {
        let ptr = alloc_cell(StringObject {
            header: ObjectHeader::new(ObjectType::String, GlobalEnv::the().string_class()),
            contents: contents.into(),
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }
}

impl StringRef {
    /// Wrap a value already known to be a heap string.
    ///
    /// # Safety-adjacent contract
    /// Debug-asserts the tag; callers check `is_string` first.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(
            crate::value_ext::ValueExt::heap_type(value),
            Some(ObjectType::String)
        );
        Self(NonNull::new(value.as_ptr() as *mut StringObject).expect("non-null string"))
    }

    /// The byte contents as UTF-8.
    pub fn contents(&self) -> &str {
        unsafe { &self.0.as_ref().contents }
    }

    /// Duplicate the buffer into a fresh string object.
    pub fn duplicate(&self) -> Value {
        StringObject::create(self.contents().to_owned())
    }

    /// The underlying value.
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use crate::value_ext::ValueExt;

    #[test]
    fn test_string_round_trip() {
        let _env = runtime_env();
        let s = StringObject::create("hello");
        assert!(s.is_ptr());
        assert_eq!(s.heap_type(), Some(ObjectType::String));
        assert_eq!(StringRef::from_value(s).contents(), "hello");
    }

    #[test]
    fn test_string_class_is_string() {
        let _env = runtime_env();
        let s = StringObject::create("x");
        assert_eq!(s.klass(), crate::global_env::GlobalEnv::the().string_class());
    }

    #[test]
    fn test_duplicate_is_a_fresh_object() {
        let _env = runtime_env();
        let a = StringObject::create("abc");
        let b = StringRef::from_value(a).duplicate();
        assert_ne!(a, b);
        assert_eq!(StringRef::from_value(b).contents(), "abc");
    }
}
