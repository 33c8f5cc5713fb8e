//! Modules and classes: the ancestor graph, method tables, constants and
//! class variables.
//!
//! A class's *ancestor list* is the flattened lookup order: itself, its
//! included modules in reverse include order, then its superclass's
//! ancestor list. Lists are computed lazily and cached; `include`
//! invalidates by bumping a global epoch, which also catches subclasses
//! whose cached lists embedded the old chain.

use crate::env::EnvRef;
use crate::exception::RResult;
use crate::method::{MethodInfo, MethodRef, NativeFn, Visibility};
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::{Symbol, Value};
use garnet_gc::Tracer;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Most classes include at most a couple of modules; keep them inline.
type IncludeList = SmallVec<[Value; 2]>;

/// Bumped on every `include` anywhere; stale cached ancestor lists are
/// detected by comparing epochs.
static ANCESTOR_EPOCH: AtomicU64 = AtomicU64::new(1);

/// A constant table entry: resolved, or an autoload hook that resolves it.
#[derive(Clone)]
pub enum ConstEntry {
    /// A defined constant.
    Value(Value),
    /// Run `loader` (which must `const_set` the name) on first access.
    Autoload {
        /// The loader hook.
        loader: NativeFn,
        /// Where the constant is expected to come from, for messages.
        path: Box<str>,
    },
}

/// How far constant lookup may wander.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstSearchMode {
    /// This module's own table only.
    Strict,
    /// The ancestor list, then `Object`'s constants.
    NotStrict,
}

/// Module/class payload. `ObjectType::Class` and `ObjectType::Module`
/// share this struct; the type tag is the discriminator.
#[repr(C)]
pub struct ModuleObject {
    /// Shared header.
    pub header: ObjectHeader,
    superclass: Value,
    /// Included modules in include order.
    includes: IncludeList,
    methods: FxHashMap<Symbol, MethodInfo>,
    constants: FxHashMap<Symbol, ConstEntry>,
    class_variables: FxHashMap<Symbol, Value>,
    /// Cached flattened lookup order, tagged with the epoch it was built at.
    ancestors_cache: Option<(u64, Vec<Value>)>,
    is_singleton: bool,
    name: Option<Box<str>>,
}

/// Typed reference to a module or class.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ModuleRef(NonNull<ModuleObject>);

impl ModuleRef {
    /// Wrap a value already known to be a module or class.
    pub fn from_value(value: Value) -> Self {
        debug_assert!(value.heap_type().is_some_and(|t| t.is_module()));
        Self(NonNull::new(value.as_ptr() as *mut ModuleObject).expect("non-null module"))
    }

    /// Allocate a class or module payload.
    ///
    /// `class_of` resolution happens lazily through the global env, so this
    /// is also usable during bootstrap when `Class` itself is half-built.
    pub fn create_class_with(
        type_: ObjectType,
        superclass: Value,
        name: Option<&str>,
        is_singleton: bool,
    ) -> Value {
        debug_assert!(type_.is_module());
        let class_of = crate::global_env::GlobalEnv::the().class_class();
        let ptr = alloc_cell(ModuleObject {
            header: ObjectHeader::new(type_, class_of),
            superclass,
            includes: IncludeList::new(),
            methods: FxHashMap::default(),
            constants: FxHashMap::default(),
            class_variables: FxHashMap::default(),
            ancestors_cache: None,
            is_singleton,
            name: name.map(Into::into),
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }

    /// Allocate a named class under `superclass`.
    pub fn create_class(name: &str, superclass: Value) -> Value {
        Self::create_class_with(ObjectType::Class, superclass, Some(name), false)
    }

    /// Allocate a named module.
    pub fn create_module(name: &str) -> Value {
        Self::create_class_with(ObjectType::Module, Value::nil(), Some(name), false)
    }

    /// Bootstrap-only constructor: explicit metaclass, uncollectible cell.
    ///
    /// Used while `Class` itself is half-built, when the global env cannot
    /// be consulted.
    pub(crate) fn create_raw(
        type_: ObjectType,
        superclass: Value,
        name: Option<&str>,
        class_of: Value,
    ) -> Value {
        let ptr = alloc_cell(ModuleObject {
            header: ObjectHeader::uncollectible(type_, class_of),
            superclass,
            includes: IncludeList::new(),
            methods: FxHashMap::default(),
            constants: FxHashMap::default(),
            class_variables: FxHashMap::default(),
            ancestors_cache: None,
            is_singleton: false,
            name: name.map(Into::into),
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }

    pub(crate) fn set_superclass(&self, superclass: Value) {
        self.get_mut().superclass = superclass;
        ANCESTOR_EPOCH.fetch_add(1, Ordering::Release);
    }

    fn get(&self) -> &'static ModuleObject {
        unsafe { &*self.0.as_ptr() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &'static mut ModuleObject {
        unsafe { &mut *self.0.as_ptr() }
    }

    /// The module as a value.
    pub fn as_value(&self) -> Value {
        Value::from_ptr(self.0.as_ptr() as *const ())
    }

    /// The superclass link; `nil` for `BasicObject` and bare modules.
    pub fn superclass(&self) -> Value {
        self.get().superclass
    }

    /// Is this a singleton class?
    pub fn is_singleton(&self) -> bool {
        self.get().is_singleton
    }

    /// The module's name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.get().name.as_deref()
    }

    /// Name it (done by `const_set` for anonymous modules).
    pub fn set_name(&self, name: &str) {
        self.get_mut().name = Some(name.into());
    }

    /// The name, or an address-stamped placeholder.
    pub fn name_or_anonymous(&self) -> String {
        match self.name() {
            Some(name) => name.to_owned(),
            None => format!("#<Class:{:#x}>", self.as_value().bits()),
        }
    }

    // =========================================================================
    // Ancestors
    // =========================================================================

    /// The flattened lookup order.
    pub fn ancestors(&self) -> Vec<Value> {
        let epoch = ANCESTOR_EPOCH.load(Ordering::Acquire);
        if let Some((cached_epoch, cached)) = &self.get().ancestors_cache {
            if *cached_epoch == epoch {
                return cached.clone();
            }
        }

        let mut list = vec![self.as_value()];
        for &module in self.get().includes.iter().rev() {
            list.push(module);
        }
        let superclass = self.superclass();
        if superclass.is_module() {
            list.extend(superclass.as_module().ancestors());
        }

        self.get_mut().ancestors_cache = Some((epoch, list.clone()));
        list
    }

    /// `Module#include`: idempotent insertion just after `self` in the
    /// lookup order.
    pub fn include(&self, env: EnvRef, module: Value) -> RResult<()> {
        if !module.is_module() || module.is_class() {
            return Err(env.raise(
                "TypeError",
                format!("wrong argument type {} (expected Module)", module.class_name()),
            ));
        }
        let _guard = garnet_gc::gc_lock();
        if self.ancestors().contains(&module) {
            return Ok(());
        }
        self.get_mut().includes.push(module);
        ANCESTOR_EPOCH.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Create a subclass of this class.
    pub fn subclass(&self, env: EnvRef, name: Option<&str>) -> RResult {
        if !self.as_value().is_class() {
            return Err(env.raise(
                "TypeError",
                format!(
                    "superclass must be an instance of Class (given an instance of {})",
                    self.as_value().class_name()
                ),
            ));
        }
        Ok(Self::create_class_with(
            ObjectType::Class,
            self.as_value(),
            name,
            false,
        ))
    }

    // =========================================================================
    // Methods
    // =========================================================================

    /// Install a public method.
    pub fn define_method(&self, name: Symbol, fn_: NativeFn, arity: i32) -> Symbol {
        self.define_method_with_visibility(name, fn_, arity, Visibility::Public)
    }

    /// Install a method with explicit visibility.
    pub fn define_method_with_visibility(
        &self,
        name: Symbol,
        fn_: NativeFn,
        arity: i32,
        visibility: Visibility,
    ) -> Symbol {
        let _guard = garnet_gc::gc_lock();
        let method = MethodRef::create(name, fn_, arity);
        method.set_owner(self.as_value());
        self.get_mut().methods.insert(
            name,
            MethodInfo {
                visibility,
                method: Some(method),
            },
        );
        name
    }

    /// Install an already-built method cell (aliasing, Method#unbind-style
    /// transplants).
    pub fn install_method(&self, name: Symbol, info: MethodInfo) {
        let _guard = garnet_gc::gc_lock();
        self.get_mut().methods.insert(name, info);
    }

    /// `undef_method`: install the tombstone so ancestor lookup stops here.
    pub fn undef_method(&self, name: Symbol) {
        let _guard = garnet_gc::gc_lock();
        self.get_mut().methods.insert(
            name,
            MethodInfo {
                visibility: Visibility::Public,
                method: None,
            },
        );
    }

    /// `remove_method`: delete this class's own definition, exposing any
    /// inherited one.
    pub fn remove_method(&self, env: EnvRef, name: Symbol) -> RResult<()> {
        let _guard = garnet_gc::gc_lock();
        if self.get_mut().methods.remove(&name).is_none() {
            return Err(env.raise_name_error(format!(
                "method '{name}' not defined in {}",
                self.name_or_anonymous()
            )));
        }
        Ok(())
    }

    /// `alias_method(new, old)`: capture the currently resolved `old` and
    /// install it under `new` at this class.
    pub fn alias_method(&self, env: EnvRef, new_name: Symbol, old_name: Symbol) -> RResult<()> {
        let resolved = self.find_method_info(old_name);
        let info = match resolved {
            Some((info, _owner)) if info.method.is_some() => info,
            _ => {
                return Err(env.raise_name_error(format!(
                    "undefined method '{old_name}' for class '{}'",
                    self.name_or_anonymous()
                )))
            }
        };
        self.install_method(new_name, info);
        Ok(())
    }

    /// Change a method's visibility at this class, copying an inherited
    /// entry down if needed.
    pub fn set_method_visibility(
        &self,
        env: EnvRef,
        name: Symbol,
        visibility: Visibility,
    ) -> RResult<()> {
        let _guard = garnet_gc::gc_lock();
        if let Some(info) = self.get_mut().methods.get_mut(&name) {
            info.visibility = visibility;
            return Ok(());
        }
        match self.find_method_info(name) {
            Some((info, _owner)) if info.method.is_some() => {
                self.get_mut().methods.insert(
                    name,
                    MethodInfo {
                        visibility,
                        method: info.method,
                    },
                );
                Ok(())
            }
            _ => Err(env.raise_name_error(format!(
                "undefined method '{name}' for class '{}'",
                self.name_or_anonymous()
            ))),
        }
    }

    /// This module's own table entry, tombstones included.
    pub fn own_method_info(&self, name: Symbol) -> Option<MethodInfo> {
        self.get().methods.get(&name).copied()
    }

    /// Walk the ancestor list for the first entry under `name`.
    ///
    /// The first hit wins even when it is a tombstone — that is what makes
    /// `undef_method` opaque to inherited definitions.
    pub fn find_method_info(&self, name: Symbol) -> Option<(MethodInfo, Value)> {
        for ancestor in self.ancestors() {
            if let Some(info) = ancestor.as_module().own_method_info(name) {
                return Some((info, ancestor));
            }
        }
        None
    }

    /// Defined method names in this module's own table.
    pub fn own_method_names(&self) -> Vec<Symbol> {
        self.get()
            .methods
            .iter()
            .filter(|(_, info)| info.method.is_some())
            .map(|(&name, _)| name)
            .collect()
    }

    // =========================================================================
    // Constants
    // =========================================================================

    /// Define a constant. Names an anonymous module and fires the
    /// constant-defined hook, if one is registered.
    pub fn const_set(&self, name: Symbol, value: Value) {
        self.const_set_raw(name, value);
        crate::global_env::GlobalEnv::the().fire_const_set_hook(self.as_value(), name, value);
    }

    /// Constant insertion without the defined hook. Bootstrap runs before
    /// the global env exists and must use this path.
    pub(crate) fn const_set_raw(&self, name: Symbol, value: Value) {
        let _guard = garnet_gc::gc_lock();
        if value.is_module() {
            let module = value.as_module();
            if module.name().is_none() {
                module.set_name(name.as_str());
            }
        }
        self.get_mut().constants.insert(name, ConstEntry::Value(value));
    }

    /// Register an autoload hook for a constant.
    pub fn const_set_autoload(&self, name: Symbol, loader: NativeFn, path: &str) {
        let _guard = garnet_gc::gc_lock();
        self.get_mut().constants.insert(
            name,
            ConstEntry::Autoload {
                loader,
                path: path.into(),
            },
        );
    }

    /// This module's own resolved constant, without running autoloads.
    pub fn const_get(&self, name: Symbol) -> Option<Value> {
        match self.get().constants.get(&name) {
            Some(ConstEntry::Value(value)) => Some(*value),
            _ => None,
        }
    }

    /// Resolve `name` in this module's own table, running an autoload hook
    /// if one is registered.
    fn const_resolve_own(&self, env: EnvRef, name: Symbol) -> RResult<Option<Value>> {
        match self.get().constants.get(&name) {
            Some(ConstEntry::Value(value)) => Ok(Some(*value)),
            Some(ConstEntry::Autoload { loader, path }) => {
                let loader = *loader;
                let path = path.clone();
                // Drop the descriptor first so a lookup from inside the
                // loader does not recurse into it.
                self.get_mut().constants.remove(&name);
                loader(env, self.as_value(), &crate::args::Args::empty(), None)?;
                match self.const_get(name) {
                    Some(value) => Ok(Some(value)),
                    None => Err(env.raise_name_error(format!(
                        "uninitialized constant {} (autoload from {} did not define it)",
                        name, path
                    ))),
                }
            }
            None => Ok(None),
        }
    }

    /// Constant lookup per the search mode; `Ok(None)` is the null-failure
    /// result.
    pub fn const_find(
        &self,
        env: EnvRef,
        name: Symbol,
        mode: ConstSearchMode,
    ) -> RResult<Option<Value>> {
        match mode {
            ConstSearchMode::Strict => self.const_resolve_own(env, name),
            ConstSearchMode::NotStrict => {
                for ancestor in self.ancestors() {
                    if let Some(value) = ancestor.as_module().const_resolve_own(env, name)? {
                        return Ok(Some(value));
                    }
                }
                // Not found anywhere on the chain: fall through to Object
                // unless we *are* Object.
                let object = crate::global_env::GlobalEnv::the().object_class();
                if self.as_value() != object {
                    return object.as_module().const_resolve_own(env, name);
                }
                Ok(None)
            }
        }
    }

    /// Constant lookup with raise-failure semantics.
    pub fn const_find_or_raise(
        &self,
        env: EnvRef,
        name: Symbol,
        mode: ConstSearchMode,
    ) -> RResult {
        match self.const_find(env, name, mode)? {
            Some(value) => Ok(value),
            None => Err(env.raise_name_error(format!(
                "uninitialized constant {}::{}",
                self.name_or_anonymous(),
                name
            ))),
        }
    }

    // =========================================================================
    // Class variables
    // =========================================================================

    /// Read a class variable, walking up the superclass chain.
    pub fn cvar_get_opt(&self, name: Symbol) -> Option<Value> {
        let mut current = Some(*self);
        while let Some(module) = current {
            if let Some(&value) = module.get().class_variables.get(&name) {
                return Some(value);
            }
            let superclass = module.superclass();
            current = superclass.is_module().then(|| superclass.as_module());
        }
        None
    }

    /// Read a class variable; `NameError` when unset anywhere on the chain.
    pub fn cvar_get(&self, env: EnvRef, name: Symbol) -> RResult {
        self.cvar_get_opt(name).ok_or_else(|| {
            env.raise_name_error(format!(
                "uninitialized class variable {name} in {}",
                self.name_or_anonymous()
            ))
        })
    }

    /// Write a class variable into the class that already defines it, or
    /// into this class when none does.
    pub fn cvar_set(&self, name: Symbol, value: Value) {
        let _guard = garnet_gc::gc_lock();
        let mut current = Some(*self);
        while let Some(module) = current {
            if module.get().class_variables.contains_key(&name) {
                module.get_mut().class_variables.insert(name, value);
                return;
            }
            let superclass = module.superclass();
            current = superclass.is_module().then(|| superclass.as_module());
        }
        self.get_mut().class_variables.insert(name, value);
    }

    // =========================================================================
    // Copying and GC
    // =========================================================================

    /// Shallow copy: same tables, anonymous, not a singleton.
    pub fn duplicate(&self) -> Value {
        let _guard = garnet_gc::gc_lock();
        let source = self.get();
        let ptr = alloc_cell(ModuleObject {
            header: ObjectHeader::new(
                source.header.object_type(),
                crate::global_env::GlobalEnv::the().class_class(),
            ),
            superclass: source.superclass,
            includes: source.includes.clone(),
            methods: source.methods.clone(),
            constants: source.constants.clone(),
            class_variables: source.class_variables.clone(),
            ancestors_cache: None,
            is_singleton: false,
            name: None,
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }

    /// Children for the collector.
    pub(crate) fn visit_children(&self, tracer: &mut dyn Tracer) {
        let module = self.get();
        tracer.visit(module.superclass);
        for &included in &module.includes {
            tracer.visit(included);
        }
        for info in module.methods.values() {
            if let Some(method) = info.method {
                tracer.visit(method.as_value());
            }
        }
        for entry in module.constants.values() {
            if let ConstEntry::Value(value) = entry {
                tracer.visit(*value);
            }
        }
        for &value in module.class_variables.values() {
            tracer.visit(value);
        }
        if let Some((_, ancestors)) = &module.ancestors_cache {
            for &ancestor in ancestors {
                tracer.visit(ancestor);
            }
        }
    }
}
