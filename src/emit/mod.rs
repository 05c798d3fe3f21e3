//! Instruction streams: the append-only bodies that synthesized members carry.
use crate::{
    error::EmitError,
    types::{
        TypeSig,
        members::{FieldRef, MethodDescription},
    },
    vm::{Executor, StackValue, VmError},
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

mod category;
mod encoder;
mod opcodes;

pub use category::*;
pub use encoder::*;
pub use opcodes::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Local(u16);

impl Local {
    pub fn index(self) -> u16 {
        self.0
    }
}

#[derive(Clone, PartialEq)]
pub enum Operand {
    None,
    Int8(i8),
    UInt8(u8),
    UInt16(u16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(Arc<str>),
    Type(TypeSig),
    Method(MethodDescription),
    /// A generic method instantiation.
    MethodSpec(MethodDescription, Arc<[TypeSig]>),
    Field(FieldRef),
    Label(Label),
    /// A resolved branch target, as an instruction index.
    Target(usize),
}

impl Operand {
    fn fits(&self, kind: OperandKind) -> bool {
        matches!(
            (kind, self),
            (OperandKind::None, Operand::None)
                | (OperandKind::Int8, Operand::Int8(_))
                | (OperandKind::UInt8, Operand::UInt8(_))
                | (OperandKind::UInt16, Operand::UInt16(_))
                | (OperandKind::Int32, Operand::Int32(_))
                | (OperandKind::Int64, Operand::Int64(_))
                | (OperandKind::Float32, Operand::Float32(_))
                | (OperandKind::Float64, Operand::Float64(_))
                | (OperandKind::String, Operand::String(_))
                | (OperandKind::Type, Operand::Type(_))
                | (OperandKind::Method, Operand::Method(_) | Operand::MethodSpec(..))
                | (OperandKind::Field, Operand::Field(_))
                | (
                    OperandKind::ShortBranch | OperandKind::Branch,
                    Operand::Label(_) | Operand::Target(_)
                )
        )
    }
}

impl Debug for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int8(v) => write!(f, "{}", v),
            Operand::UInt8(v) => write!(f, "{}", v),
            Operand::UInt16(v) => write!(f, "{}", v),
            Operand::Int32(v) => write!(f, "{}", v),
            Operand::Int64(v) => write!(f, "{}", v),
            Operand::Float32(v) => write!(f, "{}", v),
            Operand::Float64(v) => write!(f, "{}", v),
            Operand::String(s) => write!(f, "{:?}", s),
            Operand::Type(t) => write!(f, "{}", t),
            Operand::Method(m) => write!(f, "{:?}", m),
            Operand::MethodSpec(m, args) => write!(f, "{:?} with {:?}", m, args),
            Operand::Field(field) => write!(f, "{:?}", field),
            Operand::Label(l) => write!(f, "label {}", l.0),
            Operand::Target(t) => write!(f, "-> #{}", t),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    /// Pairs an opcode with its operand, rejecting operands of the wrong shape.
    pub fn new(opcode: OpCode, operand: Operand) -> Result<Self, EmitError> {
        if operand.fits(opcode.operand_kind()) {
            Ok(Self { opcode, operand })
        } else {
            Err(EmitError::OperandMismatch {
                opcode: opcode.mnemonic(),
                operand: format!("{:?}", operand),
            })
        }
    }

    pub fn encoded_size(&self) -> usize {
        self.opcode.encoded_size()
    }
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode.mnemonic()),
            _ => write!(f, "{} {:?}", self.opcode.mnemonic(), self.operand),
        }
    }
}

/// An append-only instruction list for one member body, with its locals and labels.
#[derive(Clone, Debug, Default)]
pub struct InstructionStream {
    instructions: Vec<Instruction>,
    locals: Vec<TypeSig>,
    labels: Vec<Option<usize>>,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn locals(&self) -> &[TypeSig] {
        &self.locals
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Total encoded size in bytes.
    pub fn code_size(&self) -> usize {
        self.instructions.iter().map(Instruction::encoded_size).sum()
    }

    pub fn declare_local(&mut self, local_type: TypeSig) -> Local {
        self.locals.push(local_type);
        Local((self.locals.len() - 1) as u16)
    }

    pub fn define_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Binds `label` to the next instruction appended.
    pub fn mark_label(&mut self, label: Label) -> Result<(), EmitError> {
        match self.labels.get_mut(label.0 as usize) {
            None => Err(EmitError::UnknownLabel(label.0)),
            Some(Some(_)) => Err(EmitError::LabelAlreadyMarked(label.0)),
            Some(slot) => {
                *slot = Some(self.instructions.len());
                Ok(())
            }
        }
    }

    /// Resolves labels to instruction indices and freezes the body.
    pub fn finish(self) -> Result<IlBody, EmitError> {
        let labels = self.labels;
        let instructions = self
            .instructions
            .into_iter()
            .map(|mut i| {
                if let Operand::Label(l) = i.operand {
                    let target = labels
                        .get(l.0 as usize)
                        .copied()
                        .ok_or(EmitError::UnknownLabel(l.0))?
                        .ok_or(EmitError::UnmarkedLabel(l.0))?;
                    i.operand = Operand::Target(target);
                }
                Ok(i)
            })
            .collect::<Result<Vec<_>, EmitError>>()?;
        Ok(IlBody {
            instructions,
            locals: self.locals,
        })
    }
}

/// A finished instruction body: labels resolved, immutable.
#[derive(Clone, Debug)]
pub struct IlBody {
    pub instructions: Vec<Instruction>,
    pub locals: Vec<TypeSig>,
}

impl IlBody {
    pub fn code_size(&self) -> usize {
        self.instructions.iter().map(Instruction::encoded_size).sum()
    }

    /// Byte offset of every instruction.
    pub fn offsets(&self) -> Vec<usize> {
        self.instructions
            .iter()
            .scan(0, |offset, i| {
                let here = *offset;
                *offset += i.encoded_size();
                Some(here)
            })
            .collect()
    }
}

impl Display for IlBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if !self.locals.is_empty() {
            let locals: Vec<_> = self.locals.iter().map(ToString::to_string).collect();
            writeln!(f, ".locals ({})", locals.join(", "))?;
        }
        let offsets = self.offsets();
        for (i, instruction) in self.instructions.iter().enumerate() {
            match instruction.operand {
                Operand::Target(t) => writeln!(
                    f,
                    "IL_{:04x}: {} IL_{:04x}",
                    offsets[i],
                    instruction.opcode.mnemonic(),
                    offsets.get(t).copied().unwrap_or(self.code_size())
                )?,
                _ => writeln!(f, "IL_{:04x}: {:?}", offsets[i], instruction)?,
            }
        }
        Ok(())
    }
}

/// A runtime-provided method implementation. Instance methods receive `this` first.
pub type NativeMethod = fn(&mut Executor, Vec<StackValue>) -> Result<Option<StackValue>, VmError>;

#[derive(Clone)]
pub enum MethodBody {
    Il(Arc<IlBody>),
    Native(NativeMethod),
}

impl Debug for MethodBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Il(body) => write!(f, "{} instructions", body.instructions.len()),
            MethodBody::Native(_) => write!(f, "<native>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_label_resolves_to_index() {
        let mut il = InstructionStream::new();
        let retry = il.define_label();
        il.emit(OpCode::Nop, Operand::None);
        il.mark_label(retry).unwrap();
        il.emit(OpCode::LdcI4_0, Operand::None);
        il.emit(OpCode::BrFalseS, Operand::Label(retry));
        il.emit(OpCode::Ret, Operand::None);
        let body = il.finish().unwrap();
        assert_eq!(body.instructions[2].operand, Operand::Target(1));
        assert_eq!(body.offsets(), vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_unmarked_label_is_rejected() {
        let mut il = InstructionStream::new();
        let label = il.define_label();
        il.emit(OpCode::Br, Operand::Label(label));
        assert_eq!(il.finish().unwrap_err(), EmitError::UnmarkedLabel(0));
    }

    #[test]
    fn test_label_marked_twice() {
        let mut il = InstructionStream::new();
        let label = il.define_label();
        il.mark_label(label).unwrap();
        assert_eq!(il.mark_label(label), Err(EmitError::LabelAlreadyMarked(0)));
    }

    #[test]
    fn test_operand_shape_is_checked() {
        assert!(Instruction::new(OpCode::LdcI4S, Operand::Int8(4)).is_ok());
        assert!(Instruction::new(OpCode::LdcI4S, Operand::Int32(4)).is_err());
        assert!(Instruction::new(OpCode::Ret, Operand::UInt8(1)).is_err());
    }
}
