//! Process-wide symbol interning.
//!
//! Symbols are interned once and never reclaimed — the collector treats the
//! symbol table as permanent and only traces the heap objects a symbol may
//! reference (its `SymbolObject` value, defined in `garnet_runtime`). A
//! `Symbol` is therefore a stable `u32` index, cheap to copy, hash and
//! compare, and safe to embed in method and constant tables.
//!
//! First use is thread-safe: the table is a concurrent map initialized on
//! demand, so any thread may intern without coordination.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::OnceLock;

/// An interned identifier.
///
/// Equality and hashing are index compares; the string is reachable through
/// [`Symbol::as_str`] for error messages and inspection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// The interned string.
    #[inline]
    pub fn as_str(self) -> &'static str {
        table().strings.read()[self.0 as usize]
    }

    /// The raw table index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Does this name the form of an instance variable (`@foo`)?
    pub fn is_ivar_name(self) -> bool {
        let s = self.as_str().as_bytes();
        s.len() >= 2
            && s[0] == b'@'
            && s[1] != b'@'
            && (s[1].is_ascii_alphabetic() || s[1] == b'_')
    }

    /// Does this name the form of a class variable (`@@foo`)?
    pub fn is_cvar_name(self) -> bool {
        let s = self.as_str().as_bytes();
        s.len() >= 3 && s[0] == b'@' && s[1] == b'@' && (s[2].is_ascii_alphabetic() || s[2] == b'_')
    }

    /// Does this name the form of a constant (`Foo`)?
    pub fn is_const_name(self) -> bool {
        self.as_str()
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
    }

    /// Does this name the form of a global variable (`$foo`)?
    pub fn is_global_name(self) -> bool {
        let s = self.as_str().as_bytes();
        s.len() >= 2 && s[0] == b'$'
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{}", self.as_str())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct InternTable {
    /// name → symbol, concurrent for lock-free interning of existing names.
    by_name: DashMap<&'static str, Symbol>,
    /// symbol index → name. Append-only.
    strings: RwLock<Vec<&'static str>>,
}

fn table() -> &'static InternTable {
    static TABLE: OnceLock<InternTable> = OnceLock::new();
    TABLE.get_or_init(|| InternTable {
        by_name: DashMap::new(),
        strings: RwLock::new(Vec::with_capacity(256)),
    })
}

/// Intern a name, returning its stable symbol.
pub fn intern(name: &str) -> Symbol {
    let t = table();
    if let Some(sym) = t.by_name.get(name) {
        return *sym;
    }

    // Slow path: leak the string so `as_str` can hand out 'static slices.
    // Symbols are permanent, so this is not a leak in practice.
    let mut strings = t.strings.write();
    // Re-check under the write lock: another thread may have won the race.
    if let Some(sym) = t.by_name.get(name) {
        return *sym;
    }
    let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
    let sym = Symbol(strings.len() as u32);
    strings.push(leaked);
    t.by_name.insert(leaked, sym);
    sym
}

/// Number of interned symbols.
pub fn symbol_count() -> usize {
    table().strings.read().len()
}

/// Iterate every interned symbol. Used by the collector to reach
/// symbol-referenced heap objects.
pub fn each_symbol(mut f: impl FnMut(Symbol)) {
    let count = symbol_count();
    for i in 0..count {
        f(Symbol(i as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let a = intern("foo_idem");
        let b = intern("foo_idem");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "foo_idem");
    }

    #[test]
    fn test_distinct_names_distinct_symbols() {
        assert_ne!(intern("alpha_x"), intern("beta_x"));
    }

    #[test]
    fn test_ivar_name_predicate() {
        assert!(intern("@foo").is_ivar_name());
        assert!(intern("@_foo").is_ivar_name());
        assert!(!intern("foo").is_ivar_name());
        assert!(!intern("@@foo").is_ivar_name());
        assert!(!intern("@1").is_ivar_name());
        assert!(!intern("@").is_ivar_name());
    }

    #[test]
    fn test_cvar_name_predicate() {
        assert!(intern("@@count").is_cvar_name());
        assert!(!intern("@count").is_cvar_name());
        assert!(!intern("@@").is_cvar_name());
    }

    #[test]
    fn test_const_name_predicate() {
        assert!(intern("Object").is_const_name());
        assert!(!intern("object").is_const_name());
        assert!(!intern("_Object").is_const_name());
    }

    #[test]
    fn test_global_name_predicate() {
        assert!(intern("$0").is_global_name());
        assert!(intern("$stdout").is_global_name());
        assert!(!intern("stdout").is_global_name());
    }

    #[test]
    fn test_concurrent_interning() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let shared = intern("shared_name");
                    let own = intern(&format!("thread_name_{i}"));
                    (shared, own)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = results[0].0;
        for (shared, _own) in &results {
            assert_eq!(*shared, first);
        }
    }
}
