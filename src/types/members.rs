use crate::{
    emit::MethodBody,
    types::{TypeDescription, TypeSig},
};
use enum_dispatch::enum_dispatch;
use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    ops::Deref,
};

// II.23.1.10, ordered from least to most accessible
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Accessibility {
    Private,
    FamilyAndAssembly,
    Assembly,
    Family,
    FamilyOrAssembly,
    Public,
}

impl Accessibility {
    /// Reachable from a derived type in another module.
    pub fn is_inheritable(self) -> bool {
        matches!(
            self,
            Accessibility::Public | Accessibility::Family | Accessibility::FamilyOrAssembly
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodAttributes {
    pub accessibility: Accessibility,
    pub static_member: bool,
    pub virtual_member: bool,
    pub final_member: bool,
    pub abstract_member: bool,
    pub new_slot: bool,
    pub hide_by_sig: bool,
    pub special_name: bool,
    pub runtime_special_name: bool,
}

impl MethodAttributes {
    pub fn new(accessibility: Accessibility) -> Self {
        Self {
            accessibility,
            static_member: false,
            virtual_member: false,
            final_member: false,
            abstract_member: false,
            new_slot: false,
            hide_by_sig: true,
            special_name: false,
            runtime_special_name: false,
        }
    }

    pub fn constructor(accessibility: Accessibility) -> Self {
        Self {
            special_name: true,
            runtime_special_name: true,
            ..Self::new(accessibility)
        }
    }

    pub fn virtual_method(accessibility: Accessibility) -> Self {
        Self {
            virtual_member: true,
            new_slot: true,
            ..Self::new(accessibility)
        }
    }

    pub fn abstract_method(accessibility: Accessibility) -> Self {
        Self {
            abstract_member: true,
            ..Self::virtual_method(accessibility)
        }
    }

    pub fn static_method(accessibility: Accessibility) -> Self {
        Self {
            static_member: true,
            ..Self::new(accessibility)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CallingConvention {
    #[default]
    Default,
    VarArg,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomModifier {
    pub required: bool,
    pub modifier: TypeDescription,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ParameterAttributes {
    pub input: bool,
    pub output: bool,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterDescription {
    pub name: Option<String>,
    /// By-reference parameters carry a `TypeSig::ByRef`.
    pub param_type: TypeSig,
    pub custom_modifiers: Vec<CustomModifier>,
    pub attributes: ParameterAttributes,
}

impl ParameterDescription {
    pub fn new(name: &str, param_type: TypeSig) -> Self {
        Self {
            name: Some(name.to_string()),
            param_type,
            custom_modifiers: vec![],
            attributes: ParameterAttributes::default(),
        }
    }

    pub fn is_by_ref(&self) -> bool {
        self.param_type.is_by_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ReturnDescription {
    /// `None` is `void`.
    pub return_type: Option<TypeSig>,
    pub custom_modifiers: Vec<CustomModifier>,
}

impl ReturnDescription {
    pub const VOID: ReturnDescription = ReturnDescription {
        return_type: None,
        custom_modifiers: vec![],
    };

    pub fn of(t: TypeSig) -> Self {
        Self {
            return_type: Some(t),
            custom_modifiers: vec![],
        }
    }

    pub fn is_void(&self) -> bool {
        self.return_type.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    pub instance: bool,
    pub calling_convention: CallingConvention,
    pub return_value: ReturnDescription,
    pub parameters: Vec<ParameterDescription>,
}

impl MethodSignature {
    pub fn instance(return_value: ReturnDescription, parameters: Vec<ParameterDescription>) -> Self {
        Self {
            instance: true,
            calling_convention: CallingConvention::Default,
            return_value,
            parameters,
        }
    }

    pub fn static_member(
        return_value: ReturnDescription,
        parameters: Vec<ParameterDescription>,
    ) -> Self {
        Self {
            instance: false,
            ..Self::instance(return_value, parameters)
        }
    }

    /// Same types in the same positions; names and attributes are ignored.
    pub fn same_shape(&self, other: &MethodSignature) -> bool {
        self.instance == other.instance
            && self.return_value.return_type == other.return_value.return_type
            && self.parameters.len() == other.parameters.len()
            && self
                .parameters
                .iter()
                .zip(&other.parameters)
                .all(|(a, b)| a.param_type == b.param_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenericParameter {
    pub name: String,
    pub constraints: Vec<TypeSig>,
    pub reference_type_constraint: bool,
    pub value_type_constraint: bool,
    pub default_constructor_constraint: bool,
}

impl GenericParameter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            constraints: vec![],
            reference_type_constraint: false,
            value_type_constraint: false,
            default_constructor_constraint: false,
        }
    }
}

pub struct MethodDefinition {
    pub name: String,
    pub attributes: MethodAttributes,
    pub signature: MethodSignature,
    pub generic_parameters: Vec<GenericParameter>,
    pub body: Option<MethodBody>,
    /// Explicit override bindings (II.22.27).
    pub overrides: Vec<MethodDescription>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: TypeSig,
    pub accessibility: Accessibility,
    pub init_only: bool,
    pub custom_modifiers: Vec<CustomModifier>,
    pub slot: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyDefinition {
    pub name: String,
    pub property_type: TypeSig,
    pub parameters: Vec<ParameterDescription>,
    pub getter: Option<usize>,
    pub setter: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDefinition {
    pub name: String,
    pub delegate_type: TypeSig,
    pub add: usize,
    pub remove: usize,
}

#[enum_dispatch]
pub trait MemberInfo {
    fn name(&self) -> &str;
    fn declaring_type(&self) -> &TypeDescription;
    fn accessibility(&self) -> Accessibility;
    fn is_static(&self) -> bool;
}

#[enum_dispatch(MemberInfo)]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberDescription {
    Method(MethodDescription),
    Field(FieldDescription),
    Property(PropertyDescription),
    Event(EventDescription),
}

impl Display for MemberDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type(), self.name())
    }
}

macro_rules! member_handle {
    ($handle:ident, $definition:ident, $list:ident) => {
        #[derive(Clone)]
        pub struct $handle {
            pub parent: TypeDescription,
            pub index: usize,
        }

        impl $handle {
            pub fn new(parent: TypeDescription, index: usize) -> Self {
                debug_assert!(index < parent.$list.len());
                Self { parent, index }
            }

            pub fn definition(&self) -> &$definition {
                &self.parent.definition().$list[self.index]
            }
        }

        impl Deref for $handle {
            type Target = $definition;
            fn deref(&self) -> &$definition {
                self.definition()
            }
        }

        impl PartialEq for $handle {
            fn eq(&self, other: &Self) -> bool {
                self.parent == other.parent && self.index == other.index
            }
        }

        impl Eq for $handle {}

        impl Hash for $handle {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.parent.hash(state);
                self.index.hash(state);
            }
        }
    };
}

member_handle!(MethodDescription, MethodDefinition, methods);
member_handle!(FieldDescription, FieldDefinition, fields);
member_handle!(PropertyDescription, PropertyDefinition, properties);
member_handle!(EventDescription, EventDefinition, events);

impl MethodDescription {
    pub fn is_constructor(&self) -> bool {
        self.attributes.runtime_special_name && self.name == ".ctor"
    }

    pub fn is_virtual(&self) -> bool {
        self.attributes.virtual_member
    }

    pub fn has_generic_parameters(&self) -> bool {
        !self.generic_parameters.is_empty()
    }

    /// Identity token, unique per method for the life of the process.
    pub fn token(&self) -> u64 {
        ((self.parent.id.0 as u64) << 32) | self.index as u64
    }

    /// Same name, generic arity and signature shape.
    pub fn same_slot_shape(&self, other: &MethodDescription) -> bool {
        self.name == other.name
            && self.generic_parameters.len() == other.generic_parameters.len()
            && self.signature.same_shape(&other.signature)
    }
}

impl Debug for MethodDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sig = &self.signature;
        if !sig.instance {
            write!(f, "static ")?;
        }
        match &sig.return_value.return_type {
            Some(t) => write!(f, "{} ", t)?,
            None => write!(f, "void ")?,
        }
        write!(f, "{}::{}", self.parent.type_name(), self.name)?;
        if !self.generic_parameters.is_empty() {
            let names: Vec<_> = self.generic_parameters.iter().map(|g| g.name.as_str()).collect();
            write!(f, "<{}>", names.join(", "))?;
        }
        let params: Vec<_> = sig.parameters.iter().map(|p| p.param_type.to_string()).collect();
        write!(f, "({})", params.join(", "))
    }
}

impl MemberInfo for MethodDescription {
    fn name(&self) -> &str {
        &self.definition().name
    }
    fn declaring_type(&self) -> &TypeDescription {
        &self.parent
    }
    fn accessibility(&self) -> Accessibility {
        self.attributes.accessibility
    }
    fn is_static(&self) -> bool {
        self.attributes.static_member
    }
}

impl FieldDescription {
    pub fn field_ref(&self) -> FieldRef {
        FieldRef {
            owner: self.parent.id,
            name: self.name.clone(),
            slot: self.slot,
            field_type: self.field_type.clone(),
        }
    }
}

impl Debug for FieldDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.field_type, self.parent.type_name(), self.name)
    }
}

impl MemberInfo for FieldDescription {
    fn name(&self) -> &str {
        &self.definition().name
    }
    fn declaring_type(&self) -> &TypeDescription {
        &self.parent
    }
    fn accessibility(&self) -> Accessibility {
        self.definition().accessibility
    }
    fn is_static(&self) -> bool {
        false
    }
}

impl PropertyDescription {
    pub fn getter(&self) -> Option<MethodDescription> {
        self.definition()
            .getter
            .map(|i| MethodDescription::new(self.parent.clone(), i))
    }

    pub fn setter(&self) -> Option<MethodDescription> {
        self.definition()
            .setter
            .map(|i| MethodDescription::new(self.parent.clone(), i))
    }

    pub fn accessors(&self) -> impl Iterator<Item = MethodDescription> {
        self.getter().into_iter().chain(self.setter())
    }
}

impl Debug for PropertyDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}::{}", self.property_type, self.parent.type_name(), self.name)
    }
}

impl MemberInfo for PropertyDescription {
    fn name(&self) -> &str {
        &self.definition().name
    }
    fn declaring_type(&self) -> &TypeDescription {
        &self.parent
    }
    fn accessibility(&self) -> Accessibility {
        self.accessors()
            .map(|m| m.attributes.accessibility)
            .max()
            .unwrap_or(Accessibility::Private)
    }
    fn is_static(&self) -> bool {
        self.accessors().any(|m| m.attributes.static_member)
    }
}

impl EventDescription {
    pub fn add_method(&self) -> MethodDescription {
        MethodDescription::new(self.parent.clone(), self.definition().add)
    }

    pub fn remove_method(&self) -> MethodDescription {
        MethodDescription::new(self.parent.clone(), self.definition().remove)
    }

    pub fn accessors(&self) -> [MethodDescription; 2] {
        [self.add_method(), self.remove_method()]
    }
}

impl Debug for EventDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "event {} {}::{}", self.delegate_type, self.parent.type_name(), self.name)
    }
}

impl MemberInfo for EventDescription {
    fn name(&self) -> &str {
        &self.definition().name
    }
    fn declaring_type(&self) -> &TypeDescription {
        &self.parent
    }
    fn accessibility(&self) -> Accessibility {
        self.accessors()
            .iter()
            .map(|m| m.attributes.accessibility)
            .max()
            .unwrap_or(Accessibility::Private)
    }
    fn is_static(&self) -> bool {
        self.add_method().attributes.static_member
    }
}

/// A field operand. Usable before the declaring type is baked.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub owner: crate::types::TypeId,
    pub name: String,
    pub slot: usize,
    pub field_type: TypeSig,
}

impl Debug for FieldRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field_type, self.name)
    }
}
