//! Type-directed instruction selection.
//!
//! Every operation here is a pure mapping from a request (plus a [`TypeCategory`]) to the
//! instruction(s) that implement it; the only observable difference between two valid
//! encodings is their size.
use super::{
    InstructionStream, Label, Operand,
    category::{FloatWidth, IntegerWidth, TypeCategory},
    opcodes::OpCode,
};
use crate::{
    error::EmitError,
    types::{
        TypeSig,
        corlib::corlib,
        members::{FieldRef, MethodDescription},
    },
};
use std::sync::Arc;

/// The instruction chosen for a typed memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Plain(OpCode),
    /// The opcode carries the accessed type as its token.
    WithToken(OpCode),
}

impl Access {
    pub fn opcode(self) -> OpCode {
        match self {
            Access::Plain(op) | Access::WithToken(op) => op,
        }
    }
}

pub fn array_load_access(category: TypeCategory) -> Access {
    use Access::*;
    use IntegerWidth::*;
    use TypeCategory::*;
    match category {
        GenericParameter | ValueType => WithToken(OpCode::LdElem),
        ByRef | Pointer => Plain(OpCode::LdElemI),
        Signed(One) => Plain(OpCode::LdElemI1),
        Unsigned(One) => Plain(OpCode::LdElemU1),
        Signed(Two) => Plain(OpCode::LdElemI2),
        Unsigned(Two) => Plain(OpCode::LdElemU2),
        Signed(Four) => Plain(OpCode::LdElemI4),
        Unsigned(Four) => Plain(OpCode::LdElemU4),
        Signed(Eight) | Unsigned(Eight) => Plain(OpCode::LdElemI8),
        Signed(Native) | Unsigned(Native) => Plain(OpCode::LdElemI),
        Float(FloatWidth::Single) => Plain(OpCode::LdElemR4),
        Float(FloatWidth::Double) => Plain(OpCode::LdElemR8),
        Reference => Plain(OpCode::LdElemRef),
    }
}

pub fn array_store_access(category: TypeCategory) -> Access {
    use Access::*;
    use IntegerWidth::*;
    use TypeCategory::*;
    match category {
        GenericParameter | ValueType => WithToken(OpCode::StElem),
        ByRef | Pointer | Signed(Native) | Unsigned(Native) => Plain(OpCode::StElemI),
        Signed(One) | Unsigned(One) => Plain(OpCode::StElemI1),
        Signed(Two) | Unsigned(Two) => Plain(OpCode::StElemI2),
        Signed(Four) | Unsigned(Four) => Plain(OpCode::StElemI4),
        Signed(Eight) | Unsigned(Eight) => Plain(OpCode::StElemI8),
        Float(FloatWidth::Single) => Plain(OpCode::StElemR4),
        Float(FloatWidth::Double) => Plain(OpCode::StElemR8),
        Reference => Plain(OpCode::StElemRef),
    }
}

pub fn indirect_load_access(category: TypeCategory) -> Access {
    use Access::*;
    use IntegerWidth::*;
    use TypeCategory::*;
    match category {
        GenericParameter | ValueType => WithToken(OpCode::LdObj),
        ByRef | Pointer => Plain(OpCode::LdIndI),
        Signed(One) => Plain(OpCode::LdIndI1),
        Unsigned(One) => Plain(OpCode::LdIndU1),
        Signed(Two) => Plain(OpCode::LdIndI2),
        Unsigned(Two) => Plain(OpCode::LdIndU2),
        Signed(Four) => Plain(OpCode::LdIndI4),
        Unsigned(Four) => Plain(OpCode::LdIndU4),
        Signed(Eight) | Unsigned(Eight) => Plain(OpCode::LdIndI8),
        Signed(Native) | Unsigned(Native) => Plain(OpCode::LdIndI),
        Float(FloatWidth::Single) => Plain(OpCode::LdIndR4),
        Float(FloatWidth::Double) => Plain(OpCode::LdIndR8),
        Reference => Plain(OpCode::LdIndRef),
    }
}

pub fn indirect_store_access(category: TypeCategory) -> Access {
    use Access::*;
    use IntegerWidth::*;
    use TypeCategory::*;
    match category {
        GenericParameter | ValueType => WithToken(OpCode::StObj),
        ByRef | Pointer | Signed(Native) | Unsigned(Native) => Plain(OpCode::StIndI),
        Signed(One) | Unsigned(One) => Plain(OpCode::StIndI1),
        Signed(Two) | Unsigned(Two) => Plain(OpCode::StIndI2),
        Signed(Four) | Unsigned(Four) => Plain(OpCode::StIndI4),
        Signed(Eight) | Unsigned(Eight) => Plain(OpCode::StIndI8),
        Float(FloatWidth::Single) => Plain(OpCode::StIndR4),
        Float(FloatWidth::Double) => Plain(OpCode::StIndR8),
        Reference => Plain(OpCode::StIndRef),
    }
}

/// By-ref types may not nest: `T&&` and friends have no storage representation.
fn referent(t: &TypeSig) -> Result<&TypeSig, EmitError> {
    match t.element() {
        Some(inner) if !inner.is_by_ref() => Ok(inner),
        _ => Err(EmitError::InvalidTypeShape(t.to_string())),
    }
}

/// Appends type-selected instructions to a member body.
pub trait InstructionEncoder {
    /// Appends one instruction. Callers guarantee the operand fits the opcode.
    fn emit(&mut self, opcode: OpCode, operand: Operand);

    fn load_int32_constant(&mut self, value: i32) {
        if let Some(op) = OpCode::load_constant_macro(value) {
            self.emit(op, Operand::None);
        } else if let Ok(short) = i8::try_from(value) {
            self.emit(OpCode::LdcI4S, Operand::Int8(short));
        } else {
            self.emit(OpCode::LdcI4, Operand::Int32(value));
        }
    }

    fn load_argument(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::LdArg0, Operand::None),
            1 => self.emit(OpCode::LdArg1, Operand::None),
            2 => self.emit(OpCode::LdArg2, Operand::None),
            3 => self.emit(OpCode::LdArg3, Operand::None),
            i => match u8::try_from(i) {
                Ok(short) => self.emit(OpCode::LdArgS, Operand::UInt8(short)),
                Err(_) => self.emit(OpCode::LdArg, Operand::UInt16(i)),
            },
        }
    }

    fn load_argument_address(&mut self, index: u16) {
        match u8::try_from(index) {
            Ok(short) => self.emit(OpCode::LdArgaS, Operand::UInt8(short)),
            Err(_) => self.emit(OpCode::LdArga, Operand::UInt16(index)),
        }
    }

    fn store_argument(&mut self, index: u16) {
        match u8::try_from(index) {
            Ok(short) => self.emit(OpCode::StArgS, Operand::UInt8(short)),
            Err(_) => self.emit(OpCode::StArg, Operand::UInt16(index)),
        }
    }

    fn load_local(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::LdLoc0, Operand::None),
            1 => self.emit(OpCode::LdLoc1, Operand::None),
            2 => self.emit(OpCode::LdLoc2, Operand::None),
            3 => self.emit(OpCode::LdLoc3, Operand::None),
            i => match u8::try_from(i) {
                Ok(short) => self.emit(OpCode::LdLocS, Operand::UInt8(short)),
                Err(_) => self.emit(OpCode::LdLoc, Operand::UInt16(i)),
            },
        }
    }

    fn load_local_address(&mut self, index: u16) {
        match u8::try_from(index) {
            Ok(short) => self.emit(OpCode::LdLocaS, Operand::UInt8(short)),
            Err(_) => self.emit(OpCode::LdLoca, Operand::UInt16(index)),
        }
    }

    fn store_local(&mut self, index: u16) {
        match index {
            0 => self.emit(OpCode::StLoc0, Operand::None),
            1 => self.emit(OpCode::StLoc1, Operand::None),
            2 => self.emit(OpCode::StLoc2, Operand::None),
            3 => self.emit(OpCode::StLoc3, Operand::None),
            i => match u8::try_from(i) {
                Ok(short) => self.emit(OpCode::StLocS, Operand::UInt8(short)),
                Err(_) => self.emit(OpCode::StLoc, Operand::UInt16(i)),
            },
        }
    }

    fn load_null(&mut self) {
        self.emit(OpCode::LdNull, Operand::None);
    }

    fn load_string(&mut self, value: &str) {
        self.emit(OpCode::LdStr, Operand::String(value.into()));
    }

    fn duplicate(&mut self) {
        self.emit(OpCode::Dup, Operand::None);
    }

    fn pop(&mut self) {
        self.emit(OpCode::Pop, Operand::None);
    }

    fn ret(&mut self) {
        self.emit(OpCode::Ret, Operand::None);
    }

    fn throw(&mut self) {
        self.emit(OpCode::Throw, Operand::None);
    }

    fn call(&mut self, method: &MethodDescription) {
        self.emit(OpCode::Call, Operand::Method(method.clone()));
    }

    fn call_virtual(&mut self, method: &MethodDescription) {
        self.emit(OpCode::CallVirt, Operand::Method(method.clone()));
    }

    fn call_generic(&mut self, method: &MethodDescription, arguments: Vec<TypeSig>) {
        self.emit(
            OpCode::Call,
            Operand::MethodSpec(method.clone(), Arc::from(arguments)),
        );
    }

    fn new_object(&mut self, constructor: &MethodDescription) {
        self.emit(OpCode::NewObj, Operand::Method(constructor.clone()));
    }

    fn load_field(&mut self, field: &FieldRef) {
        self.emit(OpCode::LdFld, Operand::Field(field.clone()));
    }

    fn load_field_address(&mut self, field: &FieldRef) {
        self.emit(OpCode::LdFlda, Operand::Field(field.clone()));
    }

    fn store_field(&mut self, field: &FieldRef) {
        self.emit(OpCode::StFld, Operand::Field(field.clone()));
    }

    fn cast_class(&mut self, t: &TypeSig) {
        self.emit(OpCode::CastClass, Operand::Type(t.clone()));
    }

    fn load_token(&mut self, t: &TypeSig) {
        self.emit(OpCode::LdToken, Operand::Type(t.clone()));
    }

    /// `opcode` must be one of the branch opcodes.
    fn branch(&mut self, opcode: OpCode, target: Label) {
        debug_assert!(opcode.is_branch(), "{} is not a branch", opcode.mnemonic());
        self.emit(opcode, Operand::Label(target));
    }

    fn emit_access(&mut self, access: Access, t: &TypeSig) {
        match access {
            Access::Plain(op) => self.emit(op, Operand::None),
            Access::WithToken(op) => self.emit(op, Operand::Type(t.clone())),
        }
    }

    /// Stack: array, index -> value.
    fn array_load(&mut self, element: &TypeSig) {
        self.emit_access(array_load_access(TypeCategory::of(element)), element);
    }

    /// Stack: array, index, value -> .
    fn array_store(&mut self, element: &TypeSig) {
        self.emit_access(array_store_access(TypeCategory::of(element)), element);
    }

    /// Stack: address -> value.
    fn indirect_load(&mut self, t: &TypeSig) {
        self.emit_access(indirect_load_access(TypeCategory::of(t)), t);
    }

    /// Stack: address, value -> .
    fn indirect_store(&mut self, t: &TypeSig) {
        self.emit_access(indirect_store_access(TypeCategory::of(t)), t);
    }

    /// Converts the value on top of the stack into an object reference.
    fn box_value(&mut self, t: &TypeSig) -> Result<(), EmitError> {
        match TypeCategory::of(t) {
            TypeCategory::Reference => {}
            TypeCategory::ByRef => {
                let inner = referent(t)?;
                self.indirect_load(inner);
                self.box_value(inner)?;
            }
            TypeCategory::Pointer => {
                let lib = corlib();
                self.load_token(t);
                self.call(&lib.type_from_handle);
                self.call(&lib.pointer_box);
            }
            _ => self.emit(OpCode::Box, Operand::Type(t.clone())),
        }
        Ok(())
    }

    /// Converts the object reference on top of the stack into a value of type `t`.
    /// For by-ref types this yields the referent's value.
    fn unbox_value(&mut self, t: &TypeSig) -> Result<(), EmitError> {
        match TypeCategory::of(t) {
            TypeCategory::Reference => {
                if !t.is_object() {
                    self.cast_class(t);
                }
            }
            TypeCategory::ByRef => {
                let inner = referent(t)?;
                self.unbox_value(inner)?;
            }
            TypeCategory::Pointer => self.call(&corlib().pointer_unbox),
            _ => self.emit(OpCode::UnboxAny, Operand::Type(t.clone())),
        }
        Ok(())
    }
}

impl InstructionEncoder for InstructionStream {
    fn emit(&mut self, opcode: OpCode, operand: Operand) {
        debug_assert!(
            operand.fits(opcode.operand_kind()),
            "operand {:?} does not fit {}",
            operand,
            opcode.mnemonic()
        );
        self.push(super::Instruction { opcode, operand });
    }
}
