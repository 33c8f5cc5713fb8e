//! Minimal array payload.
//!
//! Carried for the same reason as strings: `ARGV`, backtraces and block
//! iteration need a value vector even though the `Array` method library is
//! out of scope.

use crate::global_env::GlobalEnv;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use garnet_core::Value;
use std::ptr::NonNull;

/// Heap array: header plus a value vector.
#[repr(C)]
pub struct ArrayObject {
    /// Shared header.
    pub header: ObjectHeader,
    elements: Vec<Value>,
}

/// Typed reference to a heap array.
#[derive(Clone, Copy)]
pub struct ArrayRef(NonNull<ArrayObject>);

impl ArrayObject {
    /// Allocate a new array of `Array` class.
    pub fn create(elements: Vec<Value>) -> Value {
        let ptr = alloc_cell(ArrayObject {
            header: ObjectHeader::new(ObjectType::Array, GlobalEnv::the().array_class()),
            elements,
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }
}

impl ArrayRef {
    /// Wrap a value already known to be a heap array.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(
            crate::value_ext::ValueExt::heap_type(value),
            Some(ObjectType::Array)
        );
        Self(NonNull::new(value.as_ptr() as *mut ArrayObject).expect("non-null array"))
    }

    /// The elements.
    pub fn elements(&self) -> &[Value] {
        unsafe { &self.0.as_ref().elements }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.elements().len()
    }

    /// Is the array empty?
    pub fn is_empty(&self) -> bool {
        self.elements().is_empty()
    }

    /// Append a value. Caller holds the GC lock by convention.
    pub fn push(&self, value: Value) {
        unsafe { (*self.0.as_ptr()).elements.push(value) };
    }

    /// The element at `index`, or `nil` out of range.
    pub fn at(&self, index: usize) -> Value {
        self.elements().get(index).copied().unwrap_or_default()
    }

    /// Duplicate into a fresh array object.
    pub fn duplicate(&self) -> Value {
        ArrayObject::create(self.elements().to_vec())
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

    #[test]
    fn test_array_round_trip() {
        let _env = runtime_env();
        let a = ArrayObject::create(vec![Value::fixnum_unchecked(1), Value::nil()]);
        let array = ArrayRef::from_value(a);
        assert_eq!(array.len(), 2);
        assert_eq!(array.at(0).as_fixnum(), 1);
        assert!(array.at(1).is_nil());
        assert!(array.at(2).is_nil());
    }

    #[test]
    fn test_push_appends() {
        let _env = runtime_env();
        let array = ArrayRef::from_value(ArrayObject::create(Vec::new()));
        assert!(array.is_empty());
        array.push(Value::truthy());
        assert_eq!(array.len(), 1);
        assert!(array.at(0).is_true());
    }
}
