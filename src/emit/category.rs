use crate::types::TypeSig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntegerWidth {
    One,
    Two,
    Four,
    Eight,
    Native,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    Single,
    Double,
}

/// How a type is moved through memory: the key of every load/store selection table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    GenericParameter,
    ByRef,
    Pointer,
    Signed(IntegerWidth),
    Unsigned(IntegerWidth),
    Float(FloatWidth),
    /// Any value type that is not a primitive or an enum.
    ValueType,
    Reference,
}

impl TypeCategory {
    /// Enums classify as their underlying integral type.
    pub fn of(t: &TypeSig) -> TypeCategory {
        use IntegerWidth::*;
        use TypeCategory::*;
        match t {
            TypeSig::TypeGeneric(_) | TypeSig::MethodGeneric(_) => GenericParameter,
            TypeSig::ByRef(_) => ByRef,
            TypeSig::Pointer(_) => Pointer,
            TypeSig::Int8 => Signed(One),
            TypeSig::Boolean | TypeSig::UInt8 => Unsigned(One),
            TypeSig::Int16 => Signed(Two),
            TypeSig::Char | TypeSig::UInt16 => Unsigned(Two),
            TypeSig::Int32 => Signed(Four),
            TypeSig::UInt32 => Unsigned(Four),
            TypeSig::Int64 => Signed(Eight),
            TypeSig::UInt64 => Unsigned(Eight),
            TypeSig::IntPtr => Signed(Native),
            TypeSig::UIntPtr => Unsigned(Native),
            TypeSig::Float32 => Float(FloatWidth::Single),
            TypeSig::Float64 => Float(FloatWidth::Double),
            TypeSig::Object | TypeSig::String | TypeSig::Vector(_) => Reference,
            TypeSig::Type(d) => match d.is_enum() {
                Some(underlying) => TypeCategory::of(underlying),
                None if d.is_value_type() => ValueType,
                None => Reference,
            },
        }
    }

    pub fn is_value_type(self) -> bool {
        !matches!(self, TypeCategory::Reference | TypeCategory::GenericParameter)
    }
}
