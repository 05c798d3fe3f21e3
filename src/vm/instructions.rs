use crate::{
    emit::{IlBody, Instruction, OpCode, Operand, TypeCategory},
    types::{TypeSig, members::MethodDescription},
    vm::{
        Executor,
        error::{ExecutionError, VmError, type_mismatch},
        exceptions,
        tracer::tracer,
        value::{HeapObject, ManagedPtr, ObjectRef, StackValue, is_assignable, is_unbox_compatible},
    },
};
use parking_lot::Mutex;
use std::sync::Arc;

type Slot = Arc<Mutex<StackValue>>;

pub(super) enum Flow {
    Next,
    Jump(usize),
    Return(Option<StackValue>),
}

// I.12.3.2
pub(super) struct Frame<'a> {
    method: &'a MethodDescription,
    method_args: &'a [TypeSig],
    arg_types: Vec<TypeSig>,
    args: Vec<Slot>,
    local_types: Vec<TypeSig>,
    locals: Vec<Slot>,
    pub(super) stack: Vec<StackValue>,
}

impl<'a> Frame<'a> {
    pub(super) fn new(
        method: &'a MethodDescription,
        body: &IlBody,
        method_args: &'a [TypeSig],
        args: Vec<StackValue>,
    ) -> Result<Self, VmError> {
        let mut arg_types = Vec::with_capacity(args.len());
        if method.signature.instance {
            arg_types.push(TypeSig::Object);
        }
        arg_types.extend(
            method
                .signature
                .parameters
                .iter()
                .map(|p| substitute(&p.param_type, method_args)),
        );
        if arg_types.len() != args.len() {
            return Err(ExecutionError::StackUnderflow.into());
        }
        let args = args
            .into_iter()
            .zip(&arg_types)
            .map(|(v, t)| Ok(Arc::new(Mutex::new(v.coerce(t)?))))
            .collect::<Result<Vec<_>, VmError>>()?;
        let local_types: Vec<_> = body
            .locals
            .iter()
            .map(|t| substitute(t, method_args))
            .collect();
        let locals = local_types
            .iter()
            .map(|t| Arc::new(Mutex::new(StackValue::default_for(t))))
            .collect();
        Ok(Self {
            method,
            method_args,
            arg_types,
            args,
            local_types,
            locals,
            stack: vec![],
        })
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<StackValue>, VmError> {
        if self.stack.len() < n {
            return Err(ExecutionError::StackUnderflow.into());
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn arg(&self, index: u16) -> Result<&Slot, VmError> {
        self.args
            .get(index as usize)
            .ok_or_else(|| ExecutionError::InvalidSlot(index).into())
    }

    fn local(&self, index: u16) -> Result<&Slot, VmError> {
        self.locals
            .get(index as usize)
            .ok_or_else(|| ExecutionError::InvalidSlot(index).into())
    }

    fn type_operand(&self, instruction: &Instruction) -> Result<TypeSig, VmError> {
        match &instruction.operand {
            Operand::Type(t) => Ok(substitute(t, self.method_args)),
            other => Err(type_mismatch("type token", other)),
        }
    }
}

/// Replaces method generic parameters with the frame's instantiation.
fn substitute(t: &TypeSig, method_args: &[TypeSig]) -> TypeSig {
    match t {
        TypeSig::MethodGeneric(i) => method_args.get(*i as usize).cloned().unwrap_or(t.clone()),
        TypeSig::Vector(e) => substitute(e, method_args).vector(),
        TypeSig::ByRef(e) => substitute(e, method_args).by_ref(),
        TypeSig::Pointer(e) => substitute(e, method_args).pointer(),
        _ => t.clone(),
    }
}

/// Storage type of a width-specific load or store; `None` for forms that copy as-is.
fn access_type(opcode: OpCode) -> Option<TypeSig> {
    use OpCode::*;
    Some(match opcode {
        LdIndI1 | StIndI1 | LdElemI1 | StElemI1 => TypeSig::Int8,
        LdIndU1 | LdElemU1 => TypeSig::UInt8,
        LdIndI2 | StIndI2 | LdElemI2 | StElemI2 => TypeSig::Int16,
        LdIndU2 | LdElemU2 => TypeSig::UInt16,
        LdIndI4 | StIndI4 | LdElemI4 | StElemI4 => TypeSig::Int32,
        LdIndU4 | LdElemU4 => TypeSig::UInt32,
        LdIndI8 | StIndI8 | LdElemI8 | StElemI8 => TypeSig::Int64,
        LdIndI | StIndI | LdElemI | StElemI => TypeSig::IntPtr,
        LdIndR4 | StIndR4 | LdElemR4 | StElemR4 => TypeSig::Float32,
        LdIndR8 | StIndR8 | LdElemR8 | StElemR8 => TypeSig::Float64,
        _ => return None,
    })
}

fn convert_access(opcode: OpCode, value: StackValue) -> Result<StackValue, VmError> {
    match (access_type(opcode), &value) {
        // native-width slots may hold managed pointers
        (_, StackValue::ManagedPtr(_)) | (None, _) => Ok(value),
        (Some(t), _) => value.coerce(&t),
    }
}

fn branch_target(instruction: &Instruction) -> Result<usize, VmError> {
    match instruction.operand {
        Operand::Target(t) => Ok(t),
        ref other => Err(type_mismatch("resolved branch target", other)),
    }
}

fn values_equal(a: &StackValue, b: &StackValue) -> bool {
    use StackValue::*;
    match (a, b) {
        (Int32(x), NativeInt(y)) | (NativeInt(y), Int32(x)) => *x as isize == *y,
        _ => a == b,
    }
}

fn arithmetic(opcode: OpCode, a: StackValue, b: StackValue) -> Result<StackValue, VmError> {
    use StackValue::*;
    macro_rules! apply {
        ($x:expr, $y:expr) => {
            match opcode {
                OpCode::Add => $x.wrapping_add($y),
                OpCode::Sub => $x.wrapping_sub($y),
                _ => $x.wrapping_mul($y),
            }
        };
    }
    Ok(match (a, b) {
        (Int32(x), Int32(y)) => Int32(apply!(x, y)),
        (Int64(x), Int64(y)) => Int64(apply!(x, y)),
        (NativeInt(x), NativeInt(y)) => NativeInt(apply!(x, y)),
        (Int32(x), NativeInt(y)) => NativeInt(apply!(x as isize, y)),
        (NativeInt(x), Int32(y)) => NativeInt(apply!(x, y as isize)),
        (NativeFloat(x), NativeFloat(y)) => NativeFloat(match opcode {
            OpCode::Add => x + y,
            OpCode::Sub => x - y,
            _ => x * y,
        }),
        (a, b) => return Err(type_mismatch("matching numeric operands", (a, b))),
    })
}

fn element_index(index: StackValue, length: usize) -> Result<usize, VmError> {
    let index = match index {
        StackValue::Int32(i) => i as i64,
        StackValue::NativeInt(i) => i as i64,
        other => return Err(type_mismatch("array index", other)),
    };
    usize::try_from(index)
        .ok()
        .filter(|i| *i < length)
        .ok_or_else(exceptions::index_out_of_range)
}

fn vector_of(array: &StackValue) -> Result<&Arc<HeapObject>, VmError> {
    let array = array.as_object()?;
    match array.heap() {
        Some(object) if matches!(**object, HeapObject::Vector { .. }) => Ok(object),
        Some(_) => Err(type_mismatch("vector", array)),
        None => Err(exceptions::null_reference()),
    }
}

fn element_pointer(array: &StackValue, index: StackValue) -> Result<ManagedPtr, VmError> {
    let object = vector_of(array)?;
    let length = match &**object {
        HeapObject::Vector { elements, .. } => elements.lock().len(),
        _ => 0,
    };
    Ok(ManagedPtr::Element {
        array: object.clone(),
        index: element_index(index, length)?,
    })
}

/// `castclass` when `throw`, `isinst` otherwise. Null always passes.
fn cast(value: StackValue, target: &TypeSig, throw: bool) -> Result<StackValue, VmError> {
    let object = value.into_object()?;
    let Some(actual) = object.runtime_type() else {
        return Ok(StackValue::ObjectRef(object));
    };
    if is_assignable(&actual, target) {
        Ok(StackValue::ObjectRef(object))
    } else if throw {
        Err(exceptions::invalid_cast(&actual, target))
    } else {
        Ok(StackValue::null())
    }
}

impl Executor {
    fn call(
        &mut self,
        frame: &mut Frame<'_>,
        instruction: &Instruction,
        is_virtual: bool,
    ) -> Result<(), VmError> {
        let (method, method_args): (&MethodDescription, Vec<TypeSig>) = match &instruction.operand {
            Operand::Method(m) => (m, vec![]),
            Operand::MethodSpec(m, args) => (
                m,
                args.iter().map(|t| substitute(t, frame.method_args)).collect(),
            ),
            other => return Err(type_mismatch("method token", other)),
        };
        let count = method.signature.parameters.len() + method.signature.instance as usize;
        let args = frame.pop_n(count)?;
        if is_virtual && method.signature.instance {
            if let Some(StackValue::ObjectRef(this)) = args.first() {
                if this.is_null() {
                    return Err(exceptions::null_reference());
                }
            }
        }
        let result = if is_virtual && method.is_virtual() {
            self.invoke_virtual_generic(method, &method_args, args)?
        } else {
            self.invoke_generic(method, &method_args, args)?
        };
        if let Some(value) = result {
            vm_push!(frame, value);
        }
        Ok(())
    }

    pub(super) fn step(
        &mut self,
        frame: &mut Frame<'_>,
        instruction: &Instruction,
    ) -> Result<Flow, VmError> {
        use OpCode::*;

        macro_rules! load_arg {
            ($index:expr) => {{
                let value = frame.arg($index)?.lock().clone();
                vm_push!(frame, value);
            }};
        }
        macro_rules! load_local {
            ($index:expr) => {{
                let value = frame.local($index)?.lock().clone();
                vm_push!(frame, value);
            }};
        }
        macro_rules! store_local {
            ($index:expr) => {{
                let index = $index;
                let value = vm_pop!(frame);
                let t = frame
                    .local_types
                    .get(index as usize)
                    .ok_or(ExecutionError::InvalidSlot(index))?;
                let value = value.coerce(t)?;
                *frame.local(index)?.lock() = value;
            }};
        }
        macro_rules! conditional {
            ($condition:expr) => {{
                let target = branch_target(instruction)?;
                let taken = $condition;
                tracer().trace_branch(self.depth(), instruction.opcode.mnemonic(), target, taken);
                return Ok(if taken { Flow::Jump(target) } else { Flow::Next });
            }};
        }

        let short = || match instruction.operand {
            Operand::UInt8(i) => Ok(i as u16),
            Operand::UInt16(i) => Ok(i),
            ref other => Err(type_mismatch("slot index", other)),
        };

        match instruction.opcode {
            Nop => {}
            LdArg0 => load_arg!(0),
            LdArg1 => load_arg!(1),
            LdArg2 => load_arg!(2),
            LdArg3 => load_arg!(3),
            LdArgS | LdArg => load_arg!(short()?),
            LdArgaS | LdArga => {
                let slot = frame.arg(short()?)?.clone();
                vm_push!(frame, ManagedPtr(ManagedPtr::Slot(slot)));
            }
            StArgS | StArg => {
                let index = short()?;
                let value = vm_pop!(frame);
                let t = frame
                    .arg_types
                    .get(index as usize)
                    .ok_or(ExecutionError::InvalidSlot(index))?;
                let value = value.coerce(t)?;
                *frame.arg(index)?.lock() = value;
            }
            LdLoc0 => load_local!(0),
            LdLoc1 => load_local!(1),
            LdLoc2 => load_local!(2),
            LdLoc3 => load_local!(3),
            LdLocS | LdLoc => load_local!(short()?),
            LdLocaS | LdLoca => {
                let slot = frame.local(short()?)?.clone();
                vm_push!(frame, ManagedPtr(ManagedPtr::Slot(slot)));
            }
            StLoc0 => store_local!(0u16),
            StLoc1 => store_local!(1u16),
            StLoc2 => store_local!(2u16),
            StLoc3 => store_local!(3u16),
            StLocS | StLoc => store_local!(short()?),
            LdNull => vm_push!(frame, StackValue::null()),
            LdcI4M1 | LdcI4_0 | LdcI4_1 | LdcI4_2 | LdcI4_3 | LdcI4_4 | LdcI4_5 | LdcI4_6
            | LdcI4_7 | LdcI4_8 => {
                let value = instruction.opcode.macro_constant().unwrap_or_default();
                vm_push!(frame, Int32(value));
            }
            LdcI4S | LdcI4 | LdcI8 | LdcR4 | LdcR8 => {
                let value = match instruction.operand {
                    Operand::Int8(v) => StackValue::Int32(v as i32),
                    Operand::Int32(v) => StackValue::Int32(v),
                    Operand::Int64(v) => StackValue::Int64(v),
                    Operand::Float32(v) => StackValue::NativeFloat(v as f64),
                    Operand::Float64(v) => StackValue::NativeFloat(v),
                    ref other => return Err(type_mismatch("constant", other)),
                };
                vm_push!(frame, value);
            }
            Dup => {
                let value = frame
                    .stack
                    .last()
                    .cloned()
                    .ok_or(ExecutionError::StackUnderflow)?;
                vm_push!(frame, value);
            }
            Pop => {
                vm_pop!(frame);
            }
            Call => self.call(frame, instruction, false)?,
            CallVirt => self.call(frame, instruction, true)?,
            NewObj => {
                let Operand::Method(constructor) = &instruction.operand else {
                    return Err(type_mismatch("constructor token", &instruction.operand));
                };
                let args = frame.pop_n(constructor.signature.parameters.len())?;
                let instance = self.new_object(constructor, args)?;
                vm_push!(frame, instance);
            }
            Ret => {
                let value = match frame.method.signature.return_value.is_void() {
                    true => None,
                    false => Some(vm_pop!(frame)),
                };
                return Ok(Flow::Return(value));
            }
            BrS | Br => return Ok(Flow::Jump(branch_target(instruction)?)),
            BrFalseS | BrFalse => conditional!(!vm_pop!(frame).is_truthy()),
            BrTrueS | BrTrue => conditional!(vm_pop!(frame).is_truthy()),
            BeqS | Beq => {
                let b = vm_pop!(frame);
                let a = vm_pop!(frame);
                conditional!(values_equal(&a, &b))
            }
            BneUnS | BneUn => {
                let b = vm_pop!(frame);
                let a = vm_pop!(frame);
                conditional!(!values_equal(&a, &b))
            }
            Ceq => {
                let b = vm_pop!(frame);
                let a = vm_pop!(frame);
                vm_push!(frame, Int32(values_equal(&a, &b) as i32));
            }
            Add | Sub | Mul => {
                let b = vm_pop!(frame);
                let a = vm_pop!(frame);
                let result = arithmetic(instruction.opcode, a, b)?;
                vm_push!(frame, result);
            }
            ConvI => {
                let value = vm_pop!(frame).coerce(&TypeSig::IntPtr)?;
                vm_push!(frame, value);
            }
            ConvU => {
                let value = match vm_pop!(frame) {
                    StackValue::Int32(i) => StackValue::NativeInt(i as u32 as isize),
                    other => other.coerce(&TypeSig::UIntPtr)?,
                };
                vm_push!(frame, value);
            }
            LdIndI1 | LdIndU1 | LdIndI2 | LdIndU2 | LdIndI4 | LdIndU4 | LdIndI8 | LdIndI
            | LdIndR4 | LdIndR8 | LdIndRef | LdObj => {
                let address = vm_pop!(frame);
                let value = match address {
                    StackValue::ManagedPtr(p) => p.load()?,
                    StackValue::NativeInt(_) => {
                        return Err(ExecutionError::NotImplemented(
                            "load through unmanaged pointer".to_string(),
                        )
                        .into());
                    }
                    other => return Err(type_mismatch("address", other)),
                };
                let value = convert_access(instruction.opcode, value)?;
                vm_push!(frame, value);
            }
            StIndI1 | StIndI2 | StIndI4 | StIndI8 | StIndI | StIndR4 | StIndR8 | StIndRef
            | StObj => {
                let value = vm_pop!(frame);
                let address = vm_pop!(frame);
                vm_expect_stack!(let ManagedPtr(address) = address);
                address.store(convert_access(instruction.opcode, value)?)?;
            }
            LdStr => {
                let Operand::String(s) = &instruction.operand else {
                    return Err(type_mismatch("string literal", &instruction.operand));
                };
                vm_push!(frame, ObjectRef(ObjectRef::string(s)));
            }
            CastClass | IsInst => {
                let target = frame.type_operand(instruction)?;
                let value = vm_pop!(frame);
                let value = cast(value, &target, instruction.opcode == CastClass)?;
                vm_push!(frame, value);
            }
            Box => {
                let t = frame.type_operand(instruction)?;
                let value = vm_pop!(frame);
                let boxed = match (TypeCategory::of(&t).is_value_type(), value) {
                    (_, v @ StackValue::ObjectRef(_)) => v,
                    (true, v) => StackValue::ObjectRef(ObjectRef::boxed(t, v)?),
                    (false, v) => return Err(type_mismatch("object reference", v)),
                };
                vm_push!(frame, boxed);
            }
            Unbox | UnboxAny => {
                let t = frame.type_operand(instruction)?;
                let value = vm_pop!(frame);
                if instruction.opcode == UnboxAny && !TypeCategory::of(&t).is_value_type() {
                    let value = cast(value, &t, true)?;
                    vm_push!(frame, value);
                    return Ok(Flow::Next);
                }
                let object = value.into_object()?;
                let heap = object.heap().ok_or_else(exceptions::null_reference)?;
                let HeapObject::Boxed { value_type, value } = &**heap else {
                    return Err(exceptions::invalid_cast(&heap.runtime_type(), &t));
                };
                if !is_unbox_compatible(value_type, &t) {
                    return Err(exceptions::invalid_cast(value_type, &t));
                }
                let result = match instruction.opcode {
                    Unbox => StackValue::ManagedPtr(ManagedPtr::Boxed(heap.clone())),
                    _ => value.lock().clone().coerce(&t)?,
                };
                vm_push!(frame, result);
            }
            Throw => {
                let object = vm_pop!(frame).into_object()?;
                if object.is_null() {
                    return Err(exceptions::null_reference());
                }
                return Err(exceptions::thrown(object));
            }
            LdFld | LdFlda | StFld => {
                let Operand::Field(field) = &instruction.operand else {
                    return Err(type_mismatch("field token", &instruction.operand));
                };
                let value = match instruction.opcode {
                    StFld => Some(vm_pop!(frame).coerce(&field.field_type)?),
                    _ => None,
                };
                let target = vm_pop!(frame);
                let trace = |op: &str, v: &StackValue| {
                    if tracer().is_enabled() {
                        tracer().trace_field_access(self.depth(), op, &field.name, &format!("{:?}", v));
                    }
                };
                match (instruction.opcode, target, value) {
                    (LdFld, StackValue::ObjectRef(o), _) => {
                        if o.is_null() {
                            return Err(exceptions::null_reference());
                        }
                        let v = o.field(field.slot).ok_or_else(|| type_mismatch("object with fields", &o))?;
                        trace("load", &v);
                        vm_push!(frame, v);
                    }
                    (LdFld, StackValue::ManagedPtr(p), _) => {
                        let v = p.update(|outer| match outer {
                            StackValue::ValueType(vt) => vt.fields.get(field.slot).cloned(),
                            _ => None,
                        })?;
                        let v = v.ok_or_else(|| type_mismatch("value type", &p))?;
                        trace("load", &v);
                        vm_push!(frame, v);
                    }
                    (LdFld, StackValue::ValueType(vt), _) => {
                        let v = vt
                            .fields
                            .get(field.slot)
                            .cloned()
                            .ok_or(ExecutionError::InvalidSlot(field.slot as u16))?;
                        vm_push!(frame, v);
                    }
                    (LdFlda, StackValue::ObjectRef(o), _) => {
                        let object = o.heap().ok_or_else(exceptions::null_reference)?;
                        vm_push!(
                            frame,
                            ManagedPtr(ManagedPtr::Field {
                                object: object.clone(),
                                slot: field.slot,
                            })
                        );
                    }
                    (LdFlda, StackValue::ManagedPtr(p), _) => {
                        vm_push!(
                            frame,
                            ManagedPtr(ManagedPtr::Nested {
                                container: std::boxed::Box::new(p),
                                slot: field.slot,
                            })
                        );
                    }
                    (StFld, StackValue::ObjectRef(o), Some(v)) => {
                        if o.is_null() {
                            return Err(exceptions::null_reference());
                        }
                        trace("store", &v);
                        o.set_field(field.slot, v)?;
                    }
                    (StFld, StackValue::ManagedPtr(p), Some(v)) => {
                        trace("store", &v);
                        let stored = p.update(|outer| match outer {
                            StackValue::ValueType(vt) => match vt.fields.get_mut(field.slot) {
                                Some(slot) => {
                                    *slot = v;
                                    true
                                }
                                None => false,
                            },
                            _ => false,
                        })?;
                        if !stored {
                            return Err(type_mismatch("value type", &p));
                        }
                    }
                    (_, other, _) => return Err(type_mismatch("field owner", other)),
                }
            }
            NewArr => {
                let element = frame.type_operand(instruction)?;
                let length = match vm_pop!(frame) {
                    StackValue::Int32(n) => n as i64,
                    StackValue::NativeInt(n) => n as i64,
                    other => return Err(type_mismatch("array length", other)),
                };
                let length = usize::try_from(length).map_err(|_| exceptions::index_out_of_range())?;
                vm_push!(frame, ObjectRef(ObjectRef::new_vector(element, length)));
            }
            LdLen => {
                let array = vm_pop!(frame);
                let length = match &**vector_of(&array)? {
                    HeapObject::Vector { elements, .. } => elements.lock().len(),
                    _ => 0,
                };
                vm_push!(frame, NativeInt(length as isize));
            }
            LdElema => {
                let index = vm_pop!(frame);
                let array = vm_pop!(frame);
                let address = element_pointer(&array, index)?;
                vm_push!(frame, ManagedPtr(address));
            }
            LdElemI1 | LdElemU1 | LdElemI2 | LdElemU2 | LdElemI4 | LdElemU4 | LdElemI8
            | LdElemI | LdElemR4 | LdElemR8 | LdElemRef | LdElem => {
                let index = vm_pop!(frame);
                let array = vm_pop!(frame);
                let value = element_pointer(&array, index)?.load()?;
                let value = convert_access(instruction.opcode, value)?;
                vm_push!(frame, value);
            }
            StElemI | StElemI1 | StElemI2 | StElemI4 | StElemI8 | StElemR4 | StElemR8
            | StElemRef | StElem => {
                let value = vm_pop!(frame);
                let index = vm_pop!(frame);
                let array = vm_pop!(frame);
                element_pointer(&array, index)?.store(convert_access(instruction.opcode, value)?)?;
            }
            LdToken => {
                let t = frame.type_operand(instruction)?;
                vm_push!(frame, TypeHandle(t));
            }
        }
        Ok(Flow::Next)
    }
}
