//! The process-wide global environment.
//!
//! A lazily initialized singleton holding the bootstrap class graph
//! (`BasicObject` → `Object`, `Module` → `Class`, the exception hierarchy,
//! the value classes), the distinguished `main` object, global variables,
//! the instance-eval context stack and the at-exit hooks. First use is
//! thread-safe; there is no orderly teardown beyond the at-exit hooks —
//! the class graph is cyclic and is left to the collector (or process
//! exit) to reclaim.

use crate::env::EnvRef;
use crate::object::create_object;
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::{intern, Symbol, Value};
use garnet_gc::{RootProvider, Tracer};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::OnceLock;

/// Saved state for one `instance_eval`/`instance_exec` in flight.
pub struct InstanceEvalContext {
    /// The frame `instance_eval` was called from.
    pub caller_env: Value,
    /// The block's self before rebinding.
    pub block_original_self: Value,
}

/// Hook fired when a constant is defined.
pub type ConstSetHook = fn(module: Value, name: Symbol, value: Value);

/// The global environment singleton.
pub struct GlobalEnv {
    basic_object: Value,
    object: Value,
    module_class: Value,
    class_class: Value,

    exception: Value,
    standard_error: Value,
    runtime_error: Value,
    type_error: Value,
    argument_error: Value,
    name_error: Value,
    no_method_error: Value,
    frozen_error: Value,
    range_error: Value,
    zero_division_error: Value,
    local_jump_error: Value,
    uncaught_throw_error: Value,
    system_call_error: Value,
    system_exit: Value,

    integer: Value,
    float: Value,
    string: Value,
    symbol: Value,
    array: Value,
    nil_class: Value,
    true_class: Value,
    false_class: Value,
    proc_class: Value,
    method_class: Value,
    thread_class: Value,

    main_object: Value,

    globals: Mutex<FxHashMap<Symbol, Value>>,
    instance_eval_stack: Mutex<Vec<InstanceEvalContext>>,
    at_exit_hooks: Mutex<Vec<Value>>,
    const_set_hook: Mutex<Option<ConstSetHook>>,
    errno_classes: Mutex<FxHashMap<i32, Value>>,
}

// Safety: values are word bit patterns; the mutable tables are locked.
unsafe impl Send for GlobalEnv {}
unsafe impl Sync for GlobalEnv {}

impl GlobalEnv {
    /// The singleton, bootstrapping the class graph on first use.
    pub fn the() -> &'static GlobalEnv {
        static GLOBAL: OnceLock<GlobalEnv> = OnceLock::new();
        GLOBAL.get_or_init(GlobalEnv::bootstrap)
    }

    /// Build the core class graph.
    ///
    /// Runs inside `OnceLock::get_or_init`, so nothing here may call
    /// [`GlobalEnv::the`] — the raw module constructors take the metaclass
    /// explicitly, and constants are inserted without the defined hook.
    fn bootstrap() -> GlobalEnv {
        use crate::module_object::ModuleRef;

        let _guard = garnet_gc::gc_lock();

        // Class is its own class; its superclass (Module) does not exist
        // yet and is wired below.
        let class_class =
            ModuleRef::create_raw(ObjectType::Class, Value::nil(), Some("Class"), Value::nil());
        unsafe { class_class.header_mut_unchecked() }.set_class(class_class);

        let basic_object = ModuleRef::create_raw(
            ObjectType::Class,
            Value::nil(),
            Some("BasicObject"),
            class_class,
        );
        let object =
            ModuleRef::create_raw(ObjectType::Class, basic_object, Some("Object"), class_class);
        let module_class =
            ModuleRef::create_raw(ObjectType::Class, object, Some("Module"), class_class);
        class_class.as_module().set_superclass(module_class);

        let object_module = object.as_module();
        let define = |name: &str, superclass: Value| {
            let class =
                ModuleRef::create_raw(ObjectType::Class, superclass, Some(name), class_class);
            object_module.const_set_raw(intern(name), class);
            class
        };

        object_module.const_set_raw(intern("BasicObject"), basic_object);
        object_module.const_set_raw(intern("Object"), object);
        object_module.const_set_raw(intern("Module"), module_class);
        object_module.const_set_raw(intern("Class"), class_class);

        let exception = define("Exception", object);
        let standard_error = define("StandardError", exception);
        let runtime_error = define("RuntimeError", standard_error);
        let frozen_error = define("FrozenError", runtime_error);
        let type_error = define("TypeError", standard_error);
        let argument_error = define("ArgumentError", standard_error);
        let uncaught_throw_error = define("UncaughtThrowError", argument_error);
        let name_error = define("NameError", standard_error);
        let no_method_error = define("NoMethodError", name_error);
        let range_error = define("RangeError", standard_error);
        let zero_division_error = define("ZeroDivisionError", standard_error);
        let local_jump_error = define("LocalJumpError", standard_error);
        let system_call_error = define("SystemCallError", standard_error);
        let system_exit = define("SystemExit", exception);

        let integer = define("Integer", object);
        let float = define("Float", object);
        let string = define("String", object);
        let symbol = define("Symbol", object);
        let array = define("Array", object);
        let nil_class = define("NilClass", object);
        let true_class = define("TrueClass", object);
        let false_class = define("FalseClass", object);
        let proc_class = define("Proc", object);
        let method_class = define("Method", object);
        let thread_class = define("Thread", object);

        let main_object = create_object(object);

        GlobalEnv {
            basic_object,
            object,
            module_class,
            class_class,
            exception,
            standard_error,
            runtime_error,
            type_error,
            argument_error,
            name_error,
            no_method_error,
            frozen_error,
            range_error,
            zero_division_error,
            local_jump_error,
            uncaught_throw_error,
            system_call_error,
            system_exit,
            integer,
            float,
            string,
            symbol,
            array,
            nil_class,
            true_class,
            false_class,
            proc_class,
            method_class,
            thread_class,
            main_object,
            globals: Mutex::new(FxHashMap::default()),
            instance_eval_stack: Mutex::new(Vec::new()),
            at_exit_hooks: Mutex::new(Vec::new()),
            const_set_hook: Mutex::new(None),
            errno_classes: Mutex::new(FxHashMap::default()),
        }
    }

    // =========================================================================
    // Class accessors
    // =========================================================================

    /// `BasicObject`.
    pub fn basic_object_class(&self) -> Value {
        self.basic_object
    }

    /// `Object`.
    pub fn object_class(&self) -> Value {
        self.object
    }

    /// `Module`.
    pub fn module_class(&self) -> Value {
        self.module_class
    }

    /// `Class`.
    pub fn class_class(&self) -> Value {
        self.class_class
    }

    /// `Exception`.
    pub fn exception_class(&self) -> Value {
        self.exception
    }

    /// `StandardError`.
    pub fn standard_error_class(&self) -> Value {
        self.standard_error
    }

    /// `RuntimeError`.
    pub fn runtime_error_class(&self) -> Value {
        self.runtime_error
    }

    /// `NameError`.
    pub fn name_error_class(&self) -> Value {
        self.name_error
    }

    /// `NoMethodError`.
    pub fn no_method_error_class(&self) -> Value {
        self.no_method_error
    }

    /// `FrozenError`.
    pub fn frozen_error_class(&self) -> Value {
        self.frozen_error
    }

    /// `LocalJumpError`.
    pub fn local_jump_error_class(&self) -> Value {
        self.local_jump_error
    }

    /// `UncaughtThrowError`.
    pub fn uncaught_throw_error_class(&self) -> Value {
        self.uncaught_throw_error
    }

    /// `SystemCallError`.
    pub fn system_call_error_class(&self) -> Value {
        self.system_call_error
    }

    /// `SystemExit`.
    pub fn system_exit_class(&self) -> Value {
        self.system_exit
    }

    /// `Integer`.
    pub fn integer_class(&self) -> Value {
        self.integer
    }

    /// `Float`.
    pub fn float_class(&self) -> Value {
        self.float
    }

    /// `String`.
    pub fn string_class(&self) -> Value {
        self.string
    }

    /// `Symbol`.
    pub fn symbol_class(&self) -> Value {
        self.symbol
    }

    /// `Array`.
    pub fn array_class(&self) -> Value {
        self.array
    }

    /// `NilClass`.
    pub fn nil_class(&self) -> Value {
        self.nil_class
    }

    /// `TrueClass`.
    pub fn true_class(&self) -> Value {
        self.true_class
    }

    /// `FalseClass`.
    pub fn false_class(&self) -> Value {
        self.false_class
    }

    /// `Proc`.
    pub fn proc_class(&self) -> Value {
        self.proc_class
    }

    /// `Method`.
    pub fn method_class(&self) -> Value {
        self.method_class
    }

    /// `Thread`.
    pub fn thread_class(&self) -> Value {
        self.thread_class
    }

    /// The distinguished top-level `main` object.
    pub fn main_object(&self) -> Value {
        self.main_object
    }

    /// Resolve an exception class by name from `Object`'s constants,
    /// falling back to `RuntimeError` for unknown names.
    pub fn exception_class_named(&self, name: &str) -> Value {
        match self.object.as_module().const_get(intern(name)) {
            Some(class) if class.is_class() => class,
            _ => self.runtime_error,
        }
    }

    /// The `SystemCallError` subclass for one errno, created on first use
    /// and registered under `Object` as `name` (e.g. `"Errno::ENOENT"`).
    ///
    /// Native methods that surface an OS failure raise an instance of
    /// this class so rescue clauses can match on the specific errno.
    pub fn errno_class(&self, errno: i32, name: &str) -> Value {
        if let Some(&class) = self.errno_classes.lock().get(&errno) {
            return class;
        }
        let class = crate::module_object::ModuleRef::create_class(name, self.system_call_error);
        self.object
            .as_module()
            .const_set_raw(intern(name), class);
        self.errno_classes.lock().entry(errno).or_insert(class);
        class
    }

    // =========================================================================
    // Global variables
    // =========================================================================

    /// Read `$name`; unset globals are `nil`.
    pub fn global_get(&self, name: Symbol) -> Value {
        self.globals.lock().get(&name).copied().unwrap_or_default()
    }

    /// Write `$name`.
    pub fn global_set(&self, name: Symbol, value: Value) {
        self.globals.lock().insert(name, value);
    }

    // =========================================================================
    // Instance-eval context stack
    // =========================================================================

    /// Record an `instance_eval` entering.
    pub fn push_instance_eval_context(&self, caller_env: EnvRef, block_original_self: Value) {
        self.instance_eval_stack.lock().push(InstanceEvalContext {
            caller_env: caller_env.as_value(),
            block_original_self,
        });
    }

    /// Record an `instance_eval` leaving; returns the saved self.
    pub fn pop_instance_eval_context(&self) -> Option<Value> {
        self.instance_eval_stack
            .lock()
            .pop()
            .map(|context| context.block_original_self)
    }

    /// Is an `instance_eval` in flight on any thread?
    pub fn instance_evaling(&self) -> bool {
        !self.instance_eval_stack.lock().is_empty()
    }

    // =========================================================================
    // At-exit hooks
    // =========================================================================

    /// Register a proc to run at exit. Hooks run LIFO.
    pub fn push_at_exit(&self, proc_value: Value) {
        self.at_exit_hooks.lock().push(proc_value);
    }

    /// Run every at-exit hook, most recent first.
    ///
    /// A `SystemExit` raised in a hook sets the final status; any other
    /// exception is printed and the remaining hooks still run.
    pub fn run_at_exit_hooks(&self, env: EnvRef) -> Option<i32> {
        let mut status = None;
        loop {
            let Some(hook) = self.at_exit_hooks.lock().pop() else {
                break;
            };
            if hook.heap_type() != Some(ObjectType::Proc) {
                continue;
            }
            let result =
                crate::block::ProcRef::from_value(hook).call(env, &crate::args::Args::empty(), None);
            if let Err(unwind) = result {
                match unwind {
                    crate::exception::Unwind::Exception(exception)
                        if exception.as_value().is_a(self.system_exit) =>
                    {
                        status = Some(exception.exit_status());
                    }
                    other => {
                        eprintln!(
                            "error in at_exit hook: {}",
                            crate::exception::unwind_class_name(&other)
                        );
                    }
                }
            }
        }
        status
    }

    // =========================================================================
    // Constant-defined hook
    // =========================================================================

    /// Install the constant-defined hook.
    pub fn set_const_set_hook(&self, hook: Option<ConstSetHook>) {
        *self.const_set_hook.lock() = hook;
    }

    pub(crate) fn fire_const_set_hook(&self, module: Value, name: Symbol, value: Value) {
        if let Some(hook) = *self.const_set_hook.lock() {
            hook(module, name, value);
        }
    }
}

impl RootProvider for GlobalEnv {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for value in [
            self.basic_object,
            self.object,
            self.module_class,
            self.class_class,
            self.exception,
            self.standard_error,
            self.runtime_error,
            self.type_error,
            self.argument_error,
            self.name_error,
            self.no_method_error,
            self.frozen_error,
            self.range_error,
            self.zero_division_error,
            self.local_jump_error,
            self.uncaught_throw_error,
            self.system_call_error,
            self.system_exit,
            self.integer,
            self.float,
            self.string,
            self.symbol,
            self.array,
            self.nil_class,
            self.true_class,
            self.false_class,
            self.proc_class,
            self.method_class,
            self.thread_class,
            self.main_object,
        ] {
            tracer.visit(value);
        }
        for &value in self.globals.lock().values() {
            tracer.visit(value);
        }
        for context in self.instance_eval_stack.lock().iter() {
            tracer.visit(context.caller_env);
            tracer.visit(context.block_original_self);
        }
        for &hook in self.at_exit_hooks.lock().iter() {
            tracer.visit(hook);
        }
        for &class in self.errno_classes.lock().values() {
            tracer.visit(class);
        }
    }
}

/// Host initialization: bootstrap the global environment, install the GC
/// wiring, register the calling thread as the main (collecting) thread,
/// and enable automatic collection.
///
/// `start_of_stack` is the highest stack address of the calling thread,
/// captured as the address of a local in its outermost frame.
pub fn init_runtime(start_of_stack: usize) -> EnvRef {
    let _ = GlobalEnv::the();
    crate::object_tracer::install();

    let registry = garnet_gc::ThreadRegistry::the();
    if registry.current().is_none() {
        registry.register_current(true, start_of_stack);
    }

    {
        let _guard = garnet_gc::gc_lock();
        garnet_gc::Heap::the().gc_enable();
    }

    EnvRef::root()
}

#[cfg(test)]
pub mod test_support {
    //! Unit-test bootstrap: build the global env and GC wiring but leave
    //! automatic collection off and the thread unregistered, so parallel
    //! tests never stop each other's world.

    use super::*;

    /// A fresh top-level frame over a bootstrapped runtime.
    pub fn runtime_env() -> EnvRef {
        let _ = GlobalEnv::the();
        crate::object_tracer::install();
        EnvRef::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::runtime_env;

    #[test]
    fn test_bootstrap_class_wiring() {
        let _env = runtime_env();
        let global = GlobalEnv::the();

        // Class.class == Class; the chain Class < Module < Object <
        // BasicObject holds.
        assert_eq!(global.class_class().klass(), global.class_class());
        assert_eq!(
            global.class_class().as_module().superclass(),
            global.module_class()
        );
        assert_eq!(
            global.module_class().as_module().superclass(),
            global.object_class()
        );
        assert_eq!(
            global.object_class().as_module().superclass(),
            global.basic_object_class()
        );
        assert!(global.basic_object_class().as_module().superclass().is_nil());
    }

    #[test]
    fn test_every_class_is_reachable_from_object_constants() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        let object = global.object_class().as_module();
        for name in [
            "Exception",
            "StandardError",
            "TypeError",
            "NameError",
            "NoMethodError",
            "FrozenError",
            "ArgumentError",
            "RangeError",
            "ZeroDivisionError",
            "LocalJumpError",
            "UncaughtThrowError",
            "SystemExit",
            "Integer",
            "String",
            "Class",
        ] {
            assert!(
                object.const_get(intern(name)).is_some(),
                "{name} missing from Object's constants"
            );
        }
    }

    #[test]
    fn test_exception_hierarchy() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        let no_method = global.no_method_error_class();
        assert!(no_method.as_module().ancestors().contains(&global.name_error_class()));
        assert!(no_method.as_module().ancestors().contains(&global.standard_error_class()));
        assert!(no_method.as_module().ancestors().contains(&global.exception_class()));
        // SystemExit is not a StandardError.
        assert!(!global
            .system_exit_class()
            .as_module()
            .ancestors()
            .contains(&global.standard_error_class()));
    }

    #[test]
    fn test_globals_round_trip() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        let name = intern("$test_global");
        assert!(global.global_get(name).is_nil());
        global.global_set(name, Value::fixnum_unchecked(11));
        assert_eq!(global.global_get(name).as_fixnum(), 11);
    }

    #[test]
    fn test_errno_classes_are_cached_system_call_errors() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        let a = global.errno_class(2, "Errno::ENOENT");
        let b = global.errno_class(2, "Errno::ENOENT");
        assert_eq!(a, b);
        assert!(a.as_module().ancestors().contains(&global.system_call_error_class()));
        assert!(global
            .object_class()
            .as_module()
            .const_get(intern("Errno::ENOENT"))
            .is_some());
    }

    #[test]
    fn test_exception_class_named_fallback() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        assert_eq!(
            global.exception_class_named("TypeError"),
            global.type_error
        );
        assert_eq!(
            global.exception_class_named("NoSuchErrorClass"),
            global.runtime_error_class()
        );
    }
}
