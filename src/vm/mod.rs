//! A small CIL interpreter that runs synthesized bodies.
#[macro_use]
mod macros;
pub mod error;
pub mod exceptions;
mod executor;
mod instructions;
pub mod intrinsics;
pub mod tracer;
pub mod value;

pub use error::{ExecutionError, ManagedException, VmError};
pub use executor::{Executor, ExecutorConfig, resolve_virtual};
pub use value::{HeapObject, ManagedPtr, ObjectRef, StackValue, ValueTypeInstance};
