use crate::vm::value::ObjectRef;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("unhandled exception: {0}")]
    Exception(ManagedException),

    #[error("interpreter fault: {0}")]
    Execution(#[from] ExecutionError),
}

impl VmError {
    /// The managed exception type name, if this is a managed exception.
    pub fn exception_type(&self) -> Option<&str> {
        match self {
            VmError::Exception(e) => Some(&e.type_name),
            VmError::Execution(_) => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("evaluation stack underflow")]
    StackUnderflow,

    #[error("instruction pointer {0} is outside the method body")]
    InvalidIP(usize),

    #[error("expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("no argument, local or field slot {0}")]
    InvalidSlot(u16),

    #[error("{0} has no body")]
    MissingBody(String),

    #[error("{type_name} does not implement {method}")]
    UnresolvedVirtual { method: String, type_name: String },

    #[error("call depth limit of {0} exceeded")]
    CallDepthExceeded(usize),

    #[error("unsupported: {0}")]
    NotImplemented(String),
}

/// A managed exception object that propagated out of the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedException {
    pub type_name: String,
    pub message: String,
    pub object: ObjectRef,
}

impl Display for ManagedException {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

pub(crate) fn type_mismatch(expected: &str, actual: impl fmt::Debug) -> VmError {
    ExecutionError::TypeMismatch {
        expected: expected.to_string(),
        actual: format!("{:?}", actual),
    }
    .into()
}
