//! Construction of the runtime's own managed exceptions.
//!
//! Exceptions never unwind to a handler inside the interpreter: a `throw` (explicit or raised
//! by an instruction) ends every active frame and surfaces as [`VmError::Exception`].
use crate::{
    types::{TypeDescription, TypeSig, corlib::corlib},
    vm::{
        error::{ManagedException, VmError},
        value::{ObjectRef, StackValue},
    },
};

/// The message an exception's parameterless constructor stores.
pub fn default_message(t: &TypeDescription) -> String {
    let lib = corlib();
    if *t == lib.not_implemented_exception {
        "The method or operation is not implemented.".to_string()
    } else if *t == lib.null_reference_exception {
        "Object reference not set to an instance of an object.".to_string()
    } else if *t == lib.index_out_of_range_exception {
        "Index was outside the bounds of the array.".to_string()
    } else if *t == lib.invalid_cast_exception {
        "Specified cast is not valid.".to_string()
    } else {
        format!("Exception of type '{}' was thrown.", t.type_name())
    }
}

/// Converts a thrown object into the error that propagates out of the interpreter.
pub fn thrown(object: ObjectRef) -> VmError {
    let Some(TypeSig::Type(t)) = object.runtime_type() else {
        return null_reference();
    };
    let message = object
        .field(corlib().exception_message.slot)
        .and_then(|m| m.as_object().ok().and_then(|s| s.as_str().map(str::to_string)))
        .unwrap_or_default();
    VmError::Exception(ManagedException {
        type_name: t.type_name(),
        message,
        object,
    })
}

/// Allocates and raises an exception of type `t` without running IL.
pub fn raise(t: &TypeDescription, message: Option<String>) -> VmError {
    let object = ObjectRef::allocate(t);
    let message = message.unwrap_or_else(|| default_message(t));
    let slot = corlib().exception_message.slot;
    if let Err(e) = object.set_field(slot, StackValue::ObjectRef(ObjectRef::string(&message))) {
        return e;
    }
    thrown(object)
}

pub fn null_reference() -> VmError {
    raise(&corlib().null_reference_exception, None)
}

pub fn index_out_of_range() -> VmError {
    raise(&corlib().index_out_of_range_exception, None)
}

pub fn invalid_cast(from: &TypeSig, to: &TypeSig) -> VmError {
    raise(
        &corlib().invalid_cast_exception,
        Some(format!("Unable to cast object of type '{}' to type '{}'.", from, to)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raised_exception_carries_type_and_message() {
        let err = null_reference();
        assert_eq!(err.exception_type(), Some("System.NullReferenceException"));
        match err {
            VmError::Exception(e) => {
                assert_eq!(e.message, "Object reference not set to an instance of an object.");
                assert!(!e.object.is_null());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_cast_message() {
        let err = invalid_cast(&TypeSig::String, &TypeSig::Int32.vector());
        assert_eq!(
            err.to_string(),
            "unhandled exception: System.InvalidCastException: Unable to cast object of type 'string' to type 'int32[]'."
        );
    }
}
