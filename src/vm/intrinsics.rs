//! Native bodies of the corelib methods.
use crate::vm::{
    Executor,
    error::{VmError, type_mismatch},
    exceptions,
    value::{DelegateData, DelegateEntry, HeapObject, ObjectRef, StackValue},
};
use crate::types::{TypeSig, corlib::corlib};

type NativeResult = Result<Option<StackValue>, VmError>;

pub fn object_ctor(_: &mut Executor, _args: Vec<StackValue>) -> NativeResult {
    Ok(None)
}

pub fn exception_ctor(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [this] = native_args!(args, 1);
    let this = this.into_object()?;
    let message = match this.heap() {
        Some(object) => exceptions::default_message(&object.dispatch_type()),
        None => return Err(exceptions::null_reference()),
    };
    this.set_field(
        corlib().exception_message.slot,
        ObjectRef::string(&message).into(),
    )?;
    Ok(None)
}

pub fn exception_message_ctor(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [this, message] = native_args!(args, 2);
    this.as_object()?
        .set_field(corlib().exception_message.slot, message)?;
    Ok(None)
}

pub fn exception_get_message(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [this] = native_args!(args, 1);
    let this = this.into_object()?;
    if this.is_null() {
        return Err(exceptions::null_reference());
    }
    Ok(this.field(corlib().exception_message.slot))
}

fn delegate_data(d: &ObjectRef) -> Result<Option<&DelegateData>, VmError> {
    match d.heap().map(|h| &**h) {
        None => Ok(None),
        Some(HeapObject::Delegate(data)) => Ok(Some(data)),
        Some(_) => Err(type_mismatch("delegate", d)),
    }
}

/// Concatenates two invocation lists. A null operand yields the other operand unchanged.
pub fn combine(a: &ObjectRef, b: &ObjectRef) -> Result<ObjectRef, VmError> {
    match (delegate_data(a)?, delegate_data(b)?) {
        (None, _) => Ok(b.clone()),
        (_, None) => Ok(a.clone()),
        (Some(first), Some(second)) => {
            let invocation_list = first
                .invocation_list
                .iter()
                .chain(&second.invocation_list)
                .cloned()
                .collect();
            Ok(ObjectRef::new(HeapObject::Delegate(DelegateData {
                description: first.description.clone(),
                invocation_list,
            })))
        }
    }
}

/// Removes the last occurrence of `value`'s invocation list from `source`'s. Yields null when
/// nothing remains and `source` itself when there is no occurrence.
pub fn remove(source: &ObjectRef, value: &ObjectRef) -> Result<ObjectRef, VmError> {
    let (Some(from), Some(what)) = (delegate_data(source)?, delegate_data(value)?) else {
        return Ok(source.clone());
    };
    let needle: &[DelegateEntry] = &what.invocation_list;
    if needle.is_empty() {
        return Ok(source.clone());
    }
    let found = from
        .invocation_list
        .windows(needle.len())
        .rposition(|w| w == needle);
    let Some(start) = found else {
        return Ok(source.clone());
    };
    let remaining: Vec<_> = from.invocation_list[..start]
        .iter()
        .chain(&from.invocation_list[start + needle.len()..])
        .cloned()
        .collect();
    if remaining.is_empty() {
        return Ok(ObjectRef::NULL);
    }
    Ok(ObjectRef::new(HeapObject::Delegate(DelegateData {
        description: from.description.clone(),
        invocation_list: remaining,
    })))
}

pub fn delegate_combine(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [a, b] = native_args!(args, 2);
    Ok(Some(combine(a.as_object()?, b.as_object()?)?.into()))
}

pub fn delegate_remove(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [source, value] = native_args!(args, 2);
    Ok(Some(remove(source.as_object()?, value.as_object()?)?.into()))
}

/// Calls every entry of the invocation list in order; the last call's result is returned.
pub fn delegate_invoke(executor: &mut Executor, mut args: Vec<StackValue>) -> NativeResult {
    if args.is_empty() {
        return Err(crate::vm::error::ExecutionError::StackUnderflow.into());
    }
    let this = args.remove(0).into_object()?;
    let Some(data) = delegate_data(&this)? else {
        return Err(exceptions::null_reference());
    };
    let mut result = None;
    for entry in &data.invocation_list {
        let mut call_args = Vec::with_capacity(args.len() + 1);
        if entry.method.signature.instance {
            call_args.push(entry.target.clone().into());
        }
        call_args.extend(args.iter().cloned());
        result = executor.invoke(&entry.method, call_args)?;
    }
    Ok(result)
}

pub fn type_from_handle(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [handle] = native_args!(args, 1);
    vm_expect_stack!(let TypeHandle(t) = handle);
    Ok(Some(ObjectRef::new(HeapObject::RuntimeType(t)).into()))
}

pub fn pointer_box(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [address, runtime_type] = native_args!(args, 2);
    vm_expect_stack!(let NativeInt(address) = address);
    let runtime_type = runtime_type.into_object()?;
    let pointer_type = match runtime_type.heap().map(|h| &**h) {
        Some(HeapObject::RuntimeType(t @ TypeSig::Pointer(_))) => t.clone(),
        None => return Err(exceptions::null_reference()),
        Some(_) => return Err(type_mismatch("pointer type", &runtime_type)),
    };
    Ok(Some(
        ObjectRef::new(HeapObject::Pointer {
            address,
            pointer_type,
        })
        .into(),
    ))
}

pub fn pointer_unbox(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [boxed] = native_args!(args, 1);
    let boxed = boxed.into_object()?;
    match boxed.heap().map(|h| &**h) {
        Some(HeapObject::Pointer { address, .. }) => Ok(Some(StackValue::NativeInt(*address))),
        None => Err(exceptions::null_reference()),
        Some(other) => Err(exceptions::invalid_cast(
            &other.runtime_type(),
            &TypeSig::Type(corlib().pointer.clone()),
        )),
    }
}

pub fn interlocked_compare_exchange(_: &mut Executor, args: Vec<StackValue>) -> NativeResult {
    let [location, value, comparand] = native_args!(args, 3);
    vm_expect_stack!(let ManagedPtr(location) = location);
    Ok(Some(location.compare_exchange(value, &comparand)?))
}
