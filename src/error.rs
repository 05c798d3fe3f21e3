use thiserror::Error;

/// Failures of a synthesis request. All are raised before the target type is touched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SynthError {
    #[error("Member access violation: {member} {reason}")]
    MemberAccess { member: String, reason: &'static str },

    #[error("Unsupported method shape for dynamic invocation: {method} {reason}")]
    UnsupportedShape { method: String, reason: &'static str },

    #[error("Emission failed: {0}")]
    Emit(#[from] EmitError),

    #[error("Type construction failed: {0}")]
    Build(#[from] BuildError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("Invalid type shape for load/store selection: {0}")]
    InvalidTypeShape(String),
    #[error("Operand {operand} does not fit opcode {opcode}")]
    OperandMismatch { opcode: &'static str, operand: String },
    #[error("Unknown label {0}")]
    UnknownLabel(u32),
    #[error("Label {0} was never marked")]
    UnmarkedLabel(u32),
    #[error("Label {0} was marked twice")]
    LabelAlreadyMarked(u32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Cannot derive from sealed type {0}")]
    SealedParent(String),
    #[error("Enum {name} has non-integral underlying type {underlying}")]
    InvalidEnumUnderlying { name: String, underlying: String },
    #[error("Duplicate member {0}")]
    DuplicateMember(String),
    #[error("Token does not belong to type {0}")]
    InvalidToken(String),
    #[error("Method {0} has no body")]
    MissingBody(String),
    #[error("Abstract method {method} is not implemented by {type_name}")]
    AbstractMemberNotImplemented { type_name: String, method: String },
    #[error("Method {0}: {1}")]
    Body(String, EmitError),
}
