//! The collector's view of runtime objects.
//!
//! `RuntimeObjectTracer` implements the GC's [`ObjectTracer`] contract by
//! reading the type tag out of the object header and dispatching to the
//! payload's `visit_children` (marking) or an in-place drop (sweeping).
//! Every heap type must enumerate every outgoing `Value` it holds — the
//! header's class, singleton class and ivars are common to all, and each
//! payload adds its own edges.

use crate::args::Args;
use crate::array_object::ArrayObject;
use crate::block::{BlockObject, BlockRef, ProcObject, ProcRef};
use crate::env::{EnvObject, EnvRef};
use crate::exception::{ExceptionObject, ExceptionRef};
use crate::method::{BoundMethodObject, BoundMethodRef, MethodObject, MethodRef};
use crate::module_object::{ModuleObject, ModuleRef};
use crate::numeric::{BignumObject, FloatObject};
use crate::object::{ObjectHeader, RObject};
use crate::object_type::ObjectType;
use crate::string_object::StringObject;
use crate::symbol_object::SymbolObject;
use crate::thread_object::{ThreadObject, ThreadRef};
use garnet_core::Value;
use garnet_gc::{ObjectTracer, Tracer};
use std::sync::Once;

/// Zero-sized tracer dispatching on the header's type tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeObjectTracer;

impl ObjectTracer for RuntimeObjectTracer {
    unsafe fn trace_object(&self, ptr: *mut (), tracer: &mut dyn Tracer) {
        if ptr.is_null() {
            return;
        }
        // Safety: the collector only hands us verified live cells.
        let header = unsafe { &*(ptr as *const ObjectHeader) };
        let type_ = header.object_type();
        if type_ == ObjectType::Collected {
            return;
        }

        // Edges every object has.
        tracer.visit(header.class());
        if let Some(singleton) = header.singleton_class() {
            tracer.visit(singleton);
        }
        header.each_ivar(|_name, value| tracer.visit(value));

        // Payload-specific edges.
        let value = Value::from_ptr(ptr as *const ());
        match type_ {
            ObjectType::Module | ObjectType::Class => {
                ModuleRef::from_value(value).visit_children(tracer)
            }
            ObjectType::Exception => ExceptionRef::from_value(value).visit_children(tracer),
            ObjectType::Env => EnvRef::from_value(value).visit_children(tracer),
            ObjectType::Block => BlockRef::from_value(value).visit_children(tracer),
            ObjectType::Method => MethodRef::from_value(value).visit_children(tracer),
            ObjectType::BoundMethod => {
                BoundMethodRef::from_value(value).visit_children(tracer)
            }
            ObjectType::Proc => ProcRef::from_value(value).visit_children(tracer),
            ObjectType::Array => {
                for &element in crate::array_object::ArrayRef::from_value(value).elements() {
                    tracer.visit(element);
                }
            }
            ObjectType::Thread => ThreadRef::from_value(value).visit_children(tracer),
            // Leaf payloads: no outgoing values beyond the header.
            ObjectType::Object
            | ObjectType::String
            | ObjectType::Symbol
            | ObjectType::Bignum
            | ObjectType::Float
            | ObjectType::Collected => {}
        }
    }

    unsafe fn finalize_object(&self, ptr: *mut ()) {
        if ptr.is_null() {
            return;
        }
        // Safety: called exactly once per unreachable cell.
        let header = unsafe { &mut *(ptr as *mut ObjectHeader) };
        let type_ = header.object_type();

        unsafe {
            match type_ {
                ObjectType::Collected => return,
                ObjectType::Object => std::ptr::drop_in_place(ptr as *mut RObject),
                ObjectType::Module | ObjectType::Class => {
                    std::ptr::drop_in_place(ptr as *mut ModuleObject)
                }
                ObjectType::String => std::ptr::drop_in_place(ptr as *mut StringObject),
                ObjectType::Symbol => std::ptr::drop_in_place(ptr as *mut SymbolObject),
                ObjectType::Bignum => std::ptr::drop_in_place(ptr as *mut BignumObject),
                ObjectType::Float => std::ptr::drop_in_place(ptr as *mut FloatObject),
                ObjectType::Array => std::ptr::drop_in_place(ptr as *mut ArrayObject),
                ObjectType::Proc => std::ptr::drop_in_place(ptr as *mut ProcObject),
                ObjectType::Exception => std::ptr::drop_in_place(ptr as *mut ExceptionObject),
                ObjectType::BoundMethod => {
                    std::ptr::drop_in_place(ptr as *mut BoundMethodObject)
                }
                ObjectType::Thread => std::ptr::drop_in_place(ptr as *mut ThreadObject),
                ObjectType::Env => std::ptr::drop_in_place(ptr as *mut EnvObject),
                ObjectType::Block => std::ptr::drop_in_place(ptr as *mut BlockObject),
                ObjectType::Method => std::ptr::drop_in_place(ptr as *mut MethodObject),
            }
        }

        // Tombstone the cell: a stale pointer now reads as reclaimed.
        let header = unsafe { &mut *(ptr as *mut ObjectHeader) };
        header.set_object_type(ObjectType::Collected);
    }
}

/// Install the tracer and every runtime root provider. Idempotent.
pub fn install() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        static TRACER: RuntimeObjectTracer = RuntimeObjectTracer;
        garnet_gc::trace::set_object_tracer(&TRACER);
        garnet_gc::trace::register_root_provider(crate::global_env::GlobalEnv::the());
        crate::symbol_object::register_root_provider();
        crate::exception::register_root_provider();
        crate::thread_object::register_root_provider();
    });
}

/// Run a collection now, regardless of allocation pressure.
///
/// The embedding's `GC.start`: grabs the GC lock and collects with the
/// runtime tracer.
pub fn collect_now() {
    install();
    let _guard = garnet_gc::gc_lock();
    static TRACER: RuntimeObjectTracer = RuntimeObjectTracer;
    garnet_gc::Heap::the().collect_with(&TRACER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_env::test_support::runtime_env;
    use crate::global_env::GlobalEnv;
    use crate::object::create_object;
    use crate::value_ext::ValueExt;

    struct Collecting {
        seen: Vec<Value>,
    }

    impl Tracer for Collecting {
        fn visit(&mut self, value: Value) {
            self.seen.push(value);
        }
        fn visit_ptr(&mut self, _ptr: *mut ()) {}
    }

    #[test]
    fn test_plain_object_traces_class_and_ivars() {
        let env = runtime_env();
        let obj = create_object(GlobalEnv::the().object_class());
        crate::object::ivar_set(env, obj, garnet_core::intern("@child"), Value::fixnum_unchecked(5))
            .unwrap();

        let tracer = RuntimeObjectTracer;
        let mut seen = Collecting { seen: Vec::new() };
        unsafe { tracer.trace_object(obj.as_ptr(), &mut seen) };

        assert!(seen.seen.contains(&GlobalEnv::the().object_class()));
        assert!(seen.seen.contains(&Value::fixnum_unchecked(5)));
    }

    #[test]
    fn test_module_traces_method_cells() {
        let _env = runtime_env();
        let global = GlobalEnv::the();
        let class = crate::module_object::ModuleRef::create_class(
            "TracedClass",
            global.object_class(),
        );
        fn noop(
            _e: crate::env::EnvRef,
            _s: Value,
            _a: &crate::args::Args,
            _b: Option<crate::block::BlockRef>,
        ) -> crate::exception::RResult {
            Ok(Value::nil())
        }
        class
            .as_module()
            .define_method(garnet_core::intern("traced_m"), noop, 0);

        let tracer = RuntimeObjectTracer;
        let mut seen = Collecting { seen: Vec::new() };
        unsafe { tracer.trace_object(class.as_ptr(), &mut seen) };

        // Superclass edge and at least one method cell.
        assert!(seen.seen.contains(&global.object_class()));
        assert!(seen
            .seen
            .iter()
            .any(|v| v.heap_type() == Some(crate::object_type::ObjectType::Method)));
    }

    #[test]
    fn test_collected_cells_are_inert() {
        let _env = runtime_env();
        let tracer = RuntimeObjectTracer;
        let mut seen = Collecting { seen: Vec::new() };

        let zeroed = [0u64; 8];
        unsafe { tracer.trace_object(zeroed.as_ptr() as *mut (), &mut seen) };
        assert!(seen.seen.is_empty());
    }
}
