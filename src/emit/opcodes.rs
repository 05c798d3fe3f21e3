//! The CIL opcode subset the synthesizer and the interpreter understand (ECMA-335 III).

/// Shape of the inline operand that follows an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int8,
    UInt8,
    UInt16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Type,
    Method,
    Field,
    ShortBranch,
    Branch,
}

impl OperandKind {
    /// Encoded operand width in bytes. Tokens are 4 bytes.
    pub fn size(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Int8 | OperandKind::UInt8 | OperandKind::ShortBranch => 1,
            OperandKind::UInt16 => 2,
            OperandKind::Int32
            | OperandKind::Float32
            | OperandKind::String
            | OperandKind::Type
            | OperandKind::Method
            | OperandKind::Field
            | OperandKind::Branch => 4,
            OperandKind::Int64 | OperandKind::Float64 => 8,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $value:literal, $mnemonic:literal, $kind:ident;)*) => {
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum OpCode {
            $($name,)*
        }

        impl OpCode {
            /// Encoded value; two-byte opcodes carry the `0xFE` prefix in the high byte.
            pub fn value(self) -> u16 {
                match self {
                    $(OpCode::$name => $value,)*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$name => $mnemonic,)*
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $(OpCode::$name => OperandKind::$kind,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", None;
    LdArg0 = 0x02, "ldarg.0", None;
    LdArg1 = 0x03, "ldarg.1", None;
    LdArg2 = 0x04, "ldarg.2", None;
    LdArg3 = 0x05, "ldarg.3", None;
    LdLoc0 = 0x06, "ldloc.0", None;
    LdLoc1 = 0x07, "ldloc.1", None;
    LdLoc2 = 0x08, "ldloc.2", None;
    LdLoc3 = 0x09, "ldloc.3", None;
    StLoc0 = 0x0A, "stloc.0", None;
    StLoc1 = 0x0B, "stloc.1", None;
    StLoc2 = 0x0C, "stloc.2", None;
    StLoc3 = 0x0D, "stloc.3", None;
    LdArgS = 0x0E, "ldarg.s", UInt8;
    LdArgaS = 0x0F, "ldarga.s", UInt8;
    StArgS = 0x10, "starg.s", UInt8;
    LdLocS = 0x11, "ldloc.s", UInt8;
    LdLocaS = 0x12, "ldloca.s", UInt8;
    StLocS = 0x13, "stloc.s", UInt8;
    LdNull = 0x14, "ldnull", None;
    LdcI4M1 = 0x15, "ldc.i4.m1", None;
    LdcI4_0 = 0x16, "ldc.i4.0", None;
    LdcI4_1 = 0x17, "ldc.i4.1", None;
    LdcI4_2 = 0x18, "ldc.i4.2", None;
    LdcI4_3 = 0x19, "ldc.i4.3", None;
    LdcI4_4 = 0x1A, "ldc.i4.4", None;
    LdcI4_5 = 0x1B, "ldc.i4.5", None;
    LdcI4_6 = 0x1C, "ldc.i4.6", None;
    LdcI4_7 = 0x1D, "ldc.i4.7", None;
    LdcI4_8 = 0x1E, "ldc.i4.8", None;
    LdcI4S = 0x1F, "ldc.i4.s", Int8;
    LdcI4 = 0x20, "ldc.i4", Int32;
    LdcI8 = 0x21, "ldc.i8", Int64;
    LdcR4 = 0x22, "ldc.r4", Float32;
    LdcR8 = 0x23, "ldc.r8", Float64;
    Dup = 0x25, "dup", None;
    Pop = 0x26, "pop", None;
    Call = 0x28, "call", Method;
    Ret = 0x2A, "ret", None;
    BrS = 0x2B, "br.s", ShortBranch;
    BrFalseS = 0x2C, "brfalse.s", ShortBranch;
    BrTrueS = 0x2D, "brtrue.s", ShortBranch;
    BeqS = 0x2E, "beq.s", ShortBranch;
    BneUnS = 0x33, "bne.un.s", ShortBranch;
    Br = 0x38, "br", Branch;
    BrFalse = 0x39, "brfalse", Branch;
    BrTrue = 0x3A, "brtrue", Branch;
    Beq = 0x3B, "beq", Branch;
    BneUn = 0x40, "bne.un", Branch;
    LdIndI1 = 0x46, "ldind.i1", None;
    LdIndU1 = 0x47, "ldind.u1", None;
    LdIndI2 = 0x48, "ldind.i2", None;
    LdIndU2 = 0x49, "ldind.u2", None;
    LdIndI4 = 0x4A, "ldind.i4", None;
    LdIndU4 = 0x4B, "ldind.u4", None;
    LdIndI8 = 0x4C, "ldind.i8", None;
    LdIndI = 0x4D, "ldind.i", None;
    LdIndR4 = 0x4E, "ldind.r4", None;
    LdIndR8 = 0x4F, "ldind.r8", None;
    LdIndRef = 0x50, "ldind.ref", None;
    StIndRef = 0x51, "stind.ref", None;
    StIndI1 = 0x52, "stind.i1", None;
    StIndI2 = 0x53, "stind.i2", None;
    StIndI4 = 0x54, "stind.i4", None;
    StIndI8 = 0x55, "stind.i8", None;
    StIndR4 = 0x56, "stind.r4", None;
    StIndR8 = 0x57, "stind.r8", None;
    Add = 0x58, "add", None;
    Sub = 0x59, "sub", None;
    Mul = 0x5A, "mul", None;
    CallVirt = 0x6F, "callvirt", Method;
    LdObj = 0x71, "ldobj", Type;
    LdStr = 0x72, "ldstr", String;
    NewObj = 0x73, "newobj", Method;
    CastClass = 0x74, "castclass", Type;
    IsInst = 0x75, "isinst", Type;
    Unbox = 0x79, "unbox", Type;
    Throw = 0x7A, "throw", None;
    LdFld = 0x7B, "ldfld", Field;
    LdFlda = 0x7C, "ldflda", Field;
    StFld = 0x7D, "stfld", Field;
    StObj = 0x81, "stobj", Type;
    Box = 0x8C, "box", Type;
    NewArr = 0x8D, "newarr", Type;
    LdLen = 0x8E, "ldlen", None;
    LdElema = 0x8F, "ldelema", Type;
    LdElemI1 = 0x90, "ldelem.i1", None;
    LdElemU1 = 0x91, "ldelem.u1", None;
    LdElemI2 = 0x92, "ldelem.i2", None;
    LdElemU2 = 0x93, "ldelem.u2", None;
    LdElemI4 = 0x94, "ldelem.i4", None;
    LdElemU4 = 0x95, "ldelem.u4", None;
    LdElemI8 = 0x96, "ldelem.i8", None;
    LdElemI = 0x97, "ldelem.i", None;
    LdElemR4 = 0x98, "ldelem.r4", None;
    LdElemR8 = 0x99, "ldelem.r8", None;
    LdElemRef = 0x9A, "ldelem.ref", None;
    StElemI = 0x9B, "stelem.i", None;
    StElemI1 = 0x9C, "stelem.i1", None;
    StElemI2 = 0x9D, "stelem.i2", None;
    StElemI4 = 0x9E, "stelem.i4", None;
    StElemI8 = 0x9F, "stelem.i8", None;
    StElemR4 = 0xA0, "stelem.r4", None;
    StElemR8 = 0xA1, "stelem.r8", None;
    StElemRef = 0xA2, "stelem.ref", None;
    LdElem = 0xA3, "ldelem", Type;
    StElem = 0xA4, "stelem", Type;
    UnboxAny = 0xA5, "unbox.any", Type;
    LdToken = 0xD0, "ldtoken", Type;
    ConvI = 0xD3, "conv.i", None;
    StIndI = 0xDF, "stind.i", None;
    ConvU = 0xE0, "conv.u", None;
    Ceq = 0xFE01, "ceq", None;
    LdArg = 0xFE09, "ldarg", UInt16;
    LdArga = 0xFE0A, "ldarga", UInt16;
    StArg = 0xFE0B, "starg", UInt16;
    LdLoc = 0xFE0C, "ldloc", UInt16;
    LdLoca = 0xFE0D, "ldloca", UInt16;
    StLoc = 0xFE0E, "stloc", UInt16;
}

impl OpCode {
    pub fn size(self) -> usize {
        if self.value() > 0xFF {
            2
        } else {
            1
        }
    }

    /// Opcode plus inline operand.
    pub fn encoded_size(self) -> usize {
        self.size() + self.operand_kind().size()
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self.operand_kind(),
            OperandKind::ShortBranch | OperandKind::Branch
        )
    }

    /// The zero-operand `ldc.i4.<n>` form for -1..=8.
    pub fn load_constant_macro(value: i32) -> Option<OpCode> {
        Some(match value {
            -1 => OpCode::LdcI4M1,
            0 => OpCode::LdcI4_0,
            1 => OpCode::LdcI4_1,
            2 => OpCode::LdcI4_2,
            3 => OpCode::LdcI4_3,
            4 => OpCode::LdcI4_4,
            5 => OpCode::LdcI4_5,
            6 => OpCode::LdcI4_6,
            7 => OpCode::LdcI4_7,
            8 => OpCode::LdcI4_8,
            _ => return None,
        })
    }

    /// Constant pushed by a `ldc.i4.<n>` form.
    pub fn macro_constant(self) -> Option<i32> {
        Some(match self {
            OpCode::LdcI4M1 => -1,
            OpCode::LdcI4_0 => 0,
            OpCode::LdcI4_1 => 1,
            OpCode::LdcI4_2 => 2,
            OpCode::LdcI4_3 => 3,
            OpCode::LdcI4_4 => 4,
            OpCode::LdcI4_5 => 5,
            OpCode::LdcI4_6 => 6,
            OpCode::LdcI4_7 => 7,
            OpCode::LdcI4_8 => 8,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_opcodes_are_two_bytes() {
        assert_eq!(OpCode::Ceq.size(), 2);
        assert_eq!(OpCode::LdLoca.encoded_size(), 4);
        assert_eq!(OpCode::LdLocaS.encoded_size(), 2);
        assert_eq!(OpCode::LdcI4.encoded_size(), 5);
        assert_eq!(OpCode::Ret.encoded_size(), 1);
    }

    #[test]
    fn test_macro_constants_round_trip() {
        for value in -1..=8 {
            let op = OpCode::load_constant_macro(value).unwrap();
            assert_eq!(op.macro_constant(), Some(value));
            assert_eq!(op.operand_kind(), OperandKind::None);
        }
        assert_eq!(OpCode::load_constant_macro(9), None);
        assert_eq!(OpCode::load_constant_macro(-2), None);
    }
}
