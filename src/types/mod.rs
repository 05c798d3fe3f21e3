use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

pub mod corlib;
pub mod members;

use members::{
    EventDefinition, EventDescription, FieldDefinition, FieldDescription, GenericParameter,
    MemberDescription, MethodDefinition, MethodDescription, PropertyDefinition,
    PropertyDescription,
};

static NEXT_TYPE_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a type, assigned when its builder is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn fresh() -> Self {
        TypeId(NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// II.23.1.15, visibility subset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeVisibility {
    Public,
    NotPublic,
    NestedPublic,
    NestedPrivate,
    NestedFamily,
    NestedAssembly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Interface,
    ValueType,
    /// Carries the underlying integral type.
    Enum(TypeSig),
    Delegate,
}

pub struct TypeDefinition {
    pub id: TypeId,
    pub namespace: Option<String>,
    pub name: String,
    pub kind: TypeKind,
    pub visibility: TypeVisibility,
    pub sealed: bool,
    pub abstract_type: bool,
    pub enclosing: Option<TypeDescription>,
    pub extends: Option<TypeDescription>,
    pub implements: Vec<TypeDescription>,
    pub generic_parameters: Vec<GenericParameter>,
    pub fields: Vec<FieldDefinition>,
    pub methods: Vec<MethodDefinition>,
    pub properties: Vec<PropertyDefinition>,
    pub events: Vec<EventDefinition>,
    /// Number of instance field slots occupied by ancestors.
    pub field_base: usize,
}

/// Shared handle to a baked, immutable type. Compared by identity.
#[derive(Clone)]
pub struct TypeDescription(Arc<TypeDefinition>);

impl TypeDescription {
    pub(crate) fn new(definition: TypeDefinition) -> Self {
        Self(Arc::new(definition))
    }

    pub fn definition(&self) -> &TypeDefinition {
        &self.0
    }

    pub fn type_name(&self) -> String {
        let mut name = match &self.enclosing {
            Some(outer) => format!("{}+", outer.type_name()),
            None => match self.namespace.as_deref() {
                Some(ns) if !ns.is_empty() => format!("{}.", ns),
                _ => String::new(),
            },
        };
        name.push_str(&self.name);
        name
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.kind, TypeKind::Interface)
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, TypeKind::ValueType | TypeKind::Enum(_))
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.kind, TypeKind::Delegate)
    }

    pub fn is_enum(&self) -> Option<&TypeSig> {
        match &self.kind {
            TypeKind::Enum(underlying) => Some(underlying),
            _ => None,
        }
    }

    /// Mirrors `Type.IsVisible`: public, or nested public inside a visible type.
    pub fn is_externally_visible(&self) -> bool {
        match self.visibility {
            TypeVisibility::Public => true,
            TypeVisibility::NestedPublic => self
                .enclosing
                .as_ref()
                .is_none_or(|outer| outer.is_externally_visible()),
            _ => false,
        }
    }

    pub fn has_generic_parameters(&self) -> bool {
        !self.generic_parameters.is_empty()
    }

    pub fn instance_field_count(&self) -> usize {
        self.field_base + self.fields.len()
    }

    /// This type followed by its base types, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = TypeDescription> {
        std::iter::successors(Some(self.clone()), |t| t.extends.clone())
    }

    pub fn is_subtype_of(&self, other: &TypeDescription) -> bool {
        self.ancestors().any(|a| {
            &a == other || a.implements.iter().any(|i| i == other || i.is_subtype_of(other))
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = MethodDescription> + '_ {
        (0..self.methods.len()).map(|index| MethodDescription::new(self.clone(), index))
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldDescription> + '_ {
        (0..self.fields.len()).map(|index| FieldDescription::new(self.clone(), index))
    }

    pub fn properties(&self) -> impl Iterator<Item = PropertyDescription> + '_ {
        (0..self.properties.len()).map(|index| PropertyDescription::new(self.clone(), index))
    }

    pub fn events(&self) -> impl Iterator<Item = EventDescription> + '_ {
        (0..self.events.len()).map(|index| EventDescription::new(self.clone(), index))
    }

    /// Every declared member: methods, then fields, properties and events.
    pub fn members(&self) -> impl Iterator<Item = MemberDescription> + '_ {
        self.methods()
            .map(MemberDescription::from)
            .chain(self.fields().map(MemberDescription::from))
            .chain(self.properties().map(MemberDescription::from))
            .chain(self.events().map(MemberDescription::from))
    }

    pub fn constructors(&self) -> impl Iterator<Item = MethodDescription> + '_ {
        self.methods().filter(|m| m.is_constructor())
    }

    /// First method declared on this type with the given name.
    pub fn method(&self, name: &str) -> Option<MethodDescription> {
        self.methods().find(|m| m.name == name)
    }

    pub fn field(&self, name: &str) -> Option<FieldDescription> {
        self.fields().find(|f| f.name == name)
    }

    pub fn property(&self, name: &str) -> Option<PropertyDescription> {
        self.properties().find(|p| p.name == name)
    }

    pub fn event(&self, name: &str) -> Option<EventDescription> {
        self.events().find(|e| e.name == name)
    }

    /// Field declared on this type or any ancestor.
    pub fn find_field(&self, name: &str) -> Option<FieldDescription> {
        self.ancestors().find_map(|t| t.field(name))
    }
}

impl Deref for TypeDescription {
    type Target = TypeDefinition;
    fn deref(&self) -> &TypeDefinition {
        &self.0
    }
}

impl Debug for TypeDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl Display for TypeDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl PartialEq for TypeDescription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeDescription {}

impl Hash for TypeDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// A type as it appears in a signature (II.23.2.12).
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    IntPtr,
    UIntPtr,
    Object,
    String,
    Type(TypeDescription),
    Vector(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    Pointer(Box<TypeSig>),
    TypeGeneric(u16),
    MethodGeneric(u16),
}

impl TypeSig {
    pub fn by_ref(self) -> TypeSig {
        TypeSig::ByRef(Box::new(self))
    }

    pub fn pointer(self) -> TypeSig {
        TypeSig::Pointer(Box::new(self))
    }

    pub fn vector(self) -> TypeSig {
        TypeSig::Vector(Box::new(self))
    }

    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// The referent of a by-ref, pointer or vector type.
    pub fn element(&self) -> Option<&TypeSig> {
        match self {
            TypeSig::ByRef(e) | TypeSig::Pointer(e) | TypeSig::Vector(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_generic_parameter(&self) -> bool {
        matches!(self, TypeSig::TypeGeneric(_) | TypeSig::MethodGeneric(_))
    }

    pub fn contains_generic_parameters(&self) -> bool {
        match self {
            TypeSig::TypeGeneric(_) | TypeSig::MethodGeneric(_) => true,
            TypeSig::Vector(e) | TypeSig::ByRef(e) | TypeSig::Pointer(e) => {
                e.contains_generic_parameters()
            }
            _ => false,
        }
    }

    pub fn is_integral(&self) -> bool {
        use TypeSig::*;
        matches!(
            self,
            Boolean | Char | Int8 | UInt8 | Int16 | UInt16 | Int32 | UInt32 | Int64 | UInt64
                | IntPtr | UIntPtr
        )
    }

    /// Whether values of this type live inline rather than behind an object reference.
    pub fn is_value_type(&self) -> bool {
        match self {
            TypeSig::Object | TypeSig::String | TypeSig::Vector(_) => false,
            TypeSig::Type(t) => t.is_value_type(),
            TypeSig::TypeGeneric(_) | TypeSig::MethodGeneric(_) => false,
            _ => true,
        }
    }

    /// `System.Object` itself, the one reference type that needs no cast.
    pub fn is_object(&self) -> bool {
        matches!(self, TypeSig::Object)
    }
}

impl Debug for TypeSig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for TypeSig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use TypeSig::*;
        match self {
            Boolean => write!(f, "bool"),
            Char => write!(f, "char"),
            Int8 => write!(f, "int8"),
            UInt8 => write!(f, "uint8"),
            Int16 => write!(f, "int16"),
            UInt16 => write!(f, "uint16"),
            Int32 => write!(f, "int32"),
            UInt32 => write!(f, "uint32"),
            Int64 => write!(f, "int64"),
            UInt64 => write!(f, "uint64"),
            Float32 => write!(f, "float32"),
            Float64 => write!(f, "float64"),
            IntPtr => write!(f, "native int"),
            UIntPtr => write!(f, "native uint"),
            Object => write!(f, "object"),
            String => write!(f, "string"),
            Type(t) => write!(f, "{}", t.type_name()),
            Vector(e) => write!(f, "{}[]", e),
            ByRef(e) => write!(f, "{}&", e),
            Pointer(e) => write!(f, "{}*", e),
            TypeGeneric(i) => write!(f, "!{}", i),
            MethodGeneric(i) => write!(f, "!!{}", i),
        }
    }
}

impl From<TypeDescription> for TypeSig {
    fn from(t: TypeDescription) -> Self {
        TypeSig::Type(t)
    }
}
