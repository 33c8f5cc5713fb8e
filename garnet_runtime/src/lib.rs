//! Garnet runtime: the Ruby object model on top of the Garnet GC.
//!
//! # Architecture
//!
//! ```text
//! garnet_runtime
//! ├── object          object header, ivars, freeze/dup/clone, singleton classes
//! ├── module_object   class/module graph: ancestors, methods, constants, cvars
//! ├── method          method cells, visibility, method-missing reason
//! ├── dispatch        send/public_send, super, respond_to?, defined?
//! ├── block           Proc/Lambda/Method blocks, instance_eval/exec
//! ├── env             heap call frames: lexical + dynamic chains, raise helpers
//! ├── exception       exception payloads, throw/catch, ensure, unwinding
//! ├── global_env      bootstrap class graph, globals, at-exit hooks
//! ├── thread_object   runtime threads over the GC's registry
//! └── object_tracer   the GC's view of all of the above
//! ```
//!
//! Every heap payload is a `#[repr(C)]` struct whose first field is an
//! [`object::ObjectHeader`], so a cell pointer doubles as a header pointer
//! and the collector can dispatch on the [`object_type::ObjectType`] tag.
//!
//! Ruby-level failures propagate as `Result<Value, Unwind>` (`?` is the
//! unwinder); `ensure` and `rescue` are combinators in [`exception`]. All
//! heap mutation happens under the process GC lock.

#![warn(clippy::all)]

pub mod args;
pub mod array_object;
pub mod block;
pub mod dispatch;
pub mod env;
pub mod exception;
pub mod global_env;
pub mod method;
pub mod module_object;
pub mod numeric;
pub mod object;
pub mod object_tracer;
pub mod object_type;
pub mod string_object;
pub mod symbol_object;
pub mod thread_object;
pub mod value_ext;

pub use args::Args;
pub use block::{BlockKind, BlockRef};
pub use env::EnvRef;
pub use exception::{ExceptionRef, RResult, Unwind};
pub use global_env::{init_runtime, GlobalEnv};
pub use method::{MethodMissingReason, MethodRef, NativeFn, Visibility};
pub use module_object::ModuleRef;
pub use object_tracer::collect_now;
pub use object_type::ObjectType;
pub use value_ext::ValueExt;

pub use garnet_core::{intern, Symbol, Value};
