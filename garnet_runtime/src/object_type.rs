//! The closed set of heap payload kinds.

/// Discriminates every heap cell's payload for O(1) downcasts and for the
/// collector's type dispatch.
///
/// `Collected` must be first: reclaimed (and zeroed) cells read back as
/// `Collected`, which both tracing and finalization treat as a no-op.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// Tombstone for a reaped cell.
    Collected = 0,
    /// Plain object: header only.
    Object,
    /// Class payload (shares the module payload struct).
    Class,
    /// Module payload.
    Module,
    /// Byte-buffer string.
    String,
    /// Interned symbol wrapper.
    Symbol,
    /// Heap integer backing fixnum overflow.
    Bignum,
    /// Boxed double.
    Float,
    /// Value vector.
    Array,
    /// Callable wrapper around a block.
    Proc,
    /// Exception payload.
    Exception,
    /// Bound method extracted from a receiver.
    BoundMethod,
    /// Runtime thread handle.
    Thread,
    /// Internal: a lexical/dynamic call frame. Not a Ruby-visible object.
    Env,
    /// Internal: a block (closure) cell. Not a Ruby-visible object.
    Block,
    /// Internal: a method table entry's implementation cell.
    Method,
}

impl ObjectType {
    /// Rebuild from the raw tag byte, mapping anything unknown to
    /// `Collected` so garbage memory is inert.
    #[inline]
    pub fn from_raw(raw: u8) -> Self {
        if raw <= ObjectType::Method as u8 {
            // Safety: repr(u8) enum, raw is within the declared range.
            unsafe { std::mem::transmute::<u8, ObjectType>(raw) }
        } else {
            ObjectType::Collected
        }
    }

    /// Internal cell kinds have no class and never appear as Ruby values.
    #[inline]
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            ObjectType::Env | ObjectType::Block | ObjectType::Method | ObjectType::Collected
        )
    }

    /// Module or class payload?
    #[inline]
    pub fn is_module(self) -> bool {
        matches!(self, ObjectType::Module | ObjectType::Class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collected_is_zero() {
        // Zeroed cell memory must read back as the tombstone.
        assert_eq!(ObjectType::Collected as u8, 0);
        assert_eq!(ObjectType::from_raw(0), ObjectType::Collected);
    }

    #[test]
    fn test_from_raw_round_trip() {
        for t in [
            ObjectType::Object,
            ObjectType::Class,
            ObjectType::Module,
            ObjectType::String,
            ObjectType::Env,
        ] {
            assert_eq!(ObjectType::from_raw(t as u8), t);
        }
    }

    #[test]
    fn test_from_raw_garbage_is_inert() {
        assert_eq!(ObjectType::from_raw(0xff), ObjectType::Collected);
    }

    #[test]
    fn test_internal_kinds() {
        assert!(ObjectType::Env.is_internal());
        assert!(ObjectType::Block.is_internal());
        assert!(!ObjectType::Object.is_internal());
        assert!(ObjectType::Class.is_module());
        assert!(!ObjectType::String.is_module());
    }
}
