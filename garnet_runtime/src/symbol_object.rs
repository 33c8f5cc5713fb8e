//! Heap symbol values.
//!
//! Method and constant tables key on the interner's `Symbol` directly; a
//! `SymbolObject` exists only when a symbol is used as a Ruby value (a
//! `throw` tag, a `method_missing` argument). Symbol objects are interned
//! alongside their names and never collected, but the registry is still a
//! root provider so anything a symbol object references (its class) stays
//! reachable.

use crate::global_env::GlobalEnv;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::{Symbol, Value};
use garnet_gc::{RootProvider, Tracer};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Heap wrapper around an interned symbol.
#[repr(C)]
pub struct SymbolObject {
    /// Shared header.
    pub header: ObjectHeader,
    symbol: Symbol,
}

/// Typed reference to a heap symbol.
#[derive(Clone, Copy)]
pub struct SymbolRef(NonNull<SymbolObject>);

impl SymbolRef {
    /// Wrap a value already known to be a heap symbol.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(
            crate::value_ext::ValueExt::heap_type(value),
            Some(ObjectType::Symbol)
        );
        Self(NonNull::new(value.as_ptr() as *mut SymbolObject).expect("non-null symbol"))
    }

    /// The interned symbol.
    pub fn symbol(&self) -> Symbol {
        unsafe { self.0.as_ref().symbol }
    }
}

struct SymbolValues {
    by_symbol: Mutex<FxHashMap<Symbol, Value>>,
}

// Safety: the map holds word-sized value bit patterns; access is locked.
unsafe impl Send for SymbolValues {}
unsafe impl Sync for SymbolValues {}

impl RootProvider for SymbolValues {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for &value in self.by_symbol.lock().values() {
            tracer.visit(value);
        }
    }
}

fn registry() -> &'static SymbolValues {
    static REGISTRY: OnceLock<SymbolValues> = OnceLock::new();
    REGISTRY.get_or_init(|| SymbolValues {
        by_symbol: Mutex::new(FxHashMap::default()),
    })
}

pub(crate) fn register_root_provider() {
    garnet_gc::trace::register_root_provider(registry());
}

/// The unique heap value for `symbol`. Identity-stable: `:a.equal?(:a)`.
pub fn symbol_value(symbol: Symbol) -> Value {
    let reg = registry();
    if let Some(&value) = reg.by_symbol.lock().get(&symbol) {
        return value;
    }

    // Allocate outside the registry lock: allocation may collect, and the
    // collector takes this lock to trace the registry's roots.
    let ptr = alloc_cell(SymbolObject {
        header: ObjectHeader::new(ObjectType::Symbol, GlobalEnv::the().symbol_class()),
        symbol,
    });
    let value = Value::from_ptr(ptr.as_ptr() as *const ());

    let mut map = reg.by_symbol.lock();
    let winner = *map.entry(symbol).or_insert(value);
    if winner == value {
        // Interned symbols are permanent.
        value.header().expect("heap symbol").cell().set_uncollectible();
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use garnet_core::intern;

    #[test]
    fn test_symbol_values_are_identical() {
        let _env = runtime_env();
        let a = symbol_value(intern("tag_one"));
        let b = symbol_value(intern("tag_one"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_symbols_distinct_values() {
        let _env = runtime_env();
        assert_ne!(
            symbol_value(intern("tag_a")),
            symbol_value(intern("tag_b"))
        );
    }

    #[test]
    fn test_symbol_round_trip() {
        let _env = runtime_env();
        let sym = intern("round_trip");
        let value = symbol_value(sym);
        assert_eq!(SymbolRef::from_value(value).symbol(), sym);
    }
}
