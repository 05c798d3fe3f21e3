//! Two-phase type construction: a mutable [`TypeBuilder`] staged by one owner, baked once
//! into an immutable [`TypeDescription`].
use crate::{
    emit::{InstructionStream, MethodBody, NativeMethod},
    error::BuildError,
    types::{
        TypeDefinition, TypeDescription, TypeId, TypeKind, TypeSig, TypeVisibility,
        members::{
            Accessibility, CustomModifier, EventDefinition, FieldDefinition, FieldRef,
            GenericParameter, MethodAttributes, MethodDefinition, MethodDescription,
            MethodSignature, ParameterDescription, PropertyDefinition,
        },
    },
};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodToken {
    owner: TypeId,
    index: usize,
}

impl MethodToken {
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldToken {
    owner: TypeId,
    index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PropertyToken {
    owner: TypeId,
    index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventToken {
    owner: TypeId,
    index: usize,
}

pub struct MethodBuilder {
    pub name: String,
    pub attributes: MethodAttributes,
    pub signature: MethodSignature,
    pub generic_parameters: Vec<GenericParameter>,
    body: Option<InstructionStream>,
    native: Option<NativeMethod>,
    overrides: Vec<MethodDescription>,
}

impl MethodBuilder {
    /// The body's instruction stream, created on first use.
    pub fn body(&mut self) -> &mut InstructionStream {
        self.native = None;
        self.body.get_or_insert_with(InstructionStream::new)
    }

    pub fn set_body(&mut self, body: InstructionStream) {
        self.native = None;
        self.body = Some(body);
    }

    pub fn set_native(&mut self, native: NativeMethod) {
        self.body = None;
        self.native = Some(native);
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some() || self.native.is_some()
    }

    pub fn instructions(&self) -> Option<&InstructionStream> {
        self.body.as_ref()
    }

    pub fn overrides(&self) -> &[MethodDescription] {
        &self.overrides
    }
}

pub struct TypeBuilder {
    id: TypeId,
    namespace: Option<String>,
    name: String,
    kind: TypeKind,
    visibility: TypeVisibility,
    sealed: bool,
    abstract_type: bool,
    enclosing: Option<TypeDescription>,
    extends: Option<TypeDescription>,
    implements: Vec<TypeDescription>,
    generic_parameters: Vec<GenericParameter>,
    fields: Vec<FieldDefinition>,
    methods: Vec<MethodBuilder>,
    properties: Vec<PropertyDefinition>,
    events: Vec<EventDefinition>,
    field_base: usize,
}

impl TypeBuilder {
    /// A public class deriving from `parent` (no parent only for the root type).
    pub fn new(
        namespace: Option<&str>,
        name: &str,
        parent: Option<&TypeDescription>,
    ) -> Result<Self, BuildError> {
        if let Some(p) = parent {
            if p.sealed {
                return Err(BuildError::SealedParent(p.type_name()));
            }
        }
        Ok(Self {
            id: TypeId::fresh(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            kind: TypeKind::Class,
            visibility: TypeVisibility::Public,
            sealed: false,
            abstract_type: false,
            enclosing: None,
            extends: parent.cloned(),
            implements: vec![],
            generic_parameters: vec![],
            fields: vec![],
            methods: vec![],
            properties: vec![],
            events: vec![],
            field_base: parent.map_or(0, TypeDescription::instance_field_count),
        })
    }

    pub fn new_interface(namespace: Option<&str>, name: &str) -> Self {
        Self {
            id: TypeId::fresh(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            kind: TypeKind::Interface,
            visibility: TypeVisibility::Public,
            sealed: false,
            abstract_type: true,
            enclosing: None,
            extends: None,
            implements: vec![],
            generic_parameters: vec![],
            fields: vec![],
            methods: vec![],
            properties: vec![],
            events: vec![],
            field_base: 0,
        }
    }

    pub fn new_enum(
        namespace: Option<&str>,
        name: &str,
        parent: &TypeDescription,
        underlying: TypeSig,
    ) -> Result<Self, BuildError> {
        if !underlying.is_integral() {
            return Err(BuildError::InvalidEnumUnderlying {
                name: name.to_string(),
                underlying: underlying.to_string(),
            });
        }
        let mut builder = Self::new(namespace, name, Some(parent))?;
        builder.kind = TypeKind::Enum(underlying);
        builder.sealed = true;
        Ok(builder)
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&TypeDescription> {
        self.extends.as_ref()
    }

    pub fn set_kind(&mut self, kind: TypeKind) -> &mut Self {
        self.kind = kind;
        self
    }

    pub fn set_visibility(&mut self, visibility: TypeVisibility) -> &mut Self {
        self.visibility = visibility;
        self
    }

    pub fn set_enclosing(&mut self, enclosing: &TypeDescription) -> &mut Self {
        self.enclosing = Some(enclosing.clone());
        self
    }

    pub fn set_sealed(&mut self, sealed: bool) -> &mut Self {
        self.sealed = sealed;
        self
    }

    pub fn set_abstract(&mut self, abstract_type: bool) -> &mut Self {
        self.abstract_type = abstract_type;
        self
    }

    pub fn add_interface(&mut self, interface: &TypeDescription) -> &mut Self {
        self.implements.push(interface.clone());
        self
    }

    pub fn add_generic_parameter(&mut self, parameter: GenericParameter) -> &mut Self {
        self.generic_parameters.push(parameter);
        self
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Total declared members of every kind.
    pub fn member_count(&self) -> usize {
        self.methods.len() + self.fields.len() + self.properties.len() + self.events.len()
    }

    fn duplicate(&self, name: &str) -> BuildError {
        BuildError::DuplicateMember(format!("{}::{}", self.name, name))
    }

    /// Fails if a field called `name` is already declared.
    pub fn ensure_field_free(&self, name: &str) -> Result<(), BuildError> {
        match self.fields.iter().any(|f| f.name == name) {
            true => Err(self.duplicate(name)),
            false => Ok(()),
        }
    }

    /// Fails if a method with this name and signature shape is already declared.
    pub fn ensure_method_free(
        &self,
        name: &str,
        signature: &MethodSignature,
    ) -> Result<(), BuildError> {
        let taken = self
            .methods
            .iter()
            .any(|m| m.name == name && m.signature.same_shape(signature));
        match taken {
            true => Err(self.duplicate(name)),
            false => Ok(()),
        }
    }

    pub fn ensure_property_free(&self, name: &str) -> Result<(), BuildError> {
        match self.properties.iter().any(|p| p.name == name) {
            true => Err(self.duplicate(name)),
            false => Ok(()),
        }
    }

    pub fn ensure_event_free(&self, name: &str) -> Result<(), BuildError> {
        match self.events.iter().any(|e| e.name == name) {
            true => Err(self.duplicate(name)),
            false => Ok(()),
        }
    }

    pub fn define_field(
        &mut self,
        name: &str,
        field_type: TypeSig,
        accessibility: Accessibility,
    ) -> Result<FieldToken, BuildError> {
        self.define_field_with_modifiers(name, field_type, accessibility, vec![])
    }

    pub fn define_field_with_modifiers(
        &mut self,
        name: &str,
        field_type: TypeSig,
        accessibility: Accessibility,
        custom_modifiers: Vec<CustomModifier>,
    ) -> Result<FieldToken, BuildError> {
        self.ensure_field_free(name)?;
        let slot = self.field_base + self.fields.len();
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            accessibility,
            init_only: false,
            custom_modifiers,
            slot,
        });
        Ok(FieldToken {
            owner: self.id,
            index: self.fields.len() - 1,
        })
    }

    pub fn field_ref(&self, token: FieldToken) -> Result<FieldRef, BuildError> {
        self.check_owner(token.owner)?;
        let field = &self.fields[token.index];
        Ok(FieldRef {
            owner: self.id,
            name: field.name.clone(),
            slot: field.slot,
            field_type: field.field_type.clone(),
        })
    }

    pub fn define_method(
        &mut self,
        name: &str,
        attributes: MethodAttributes,
        signature: MethodSignature,
    ) -> Result<MethodToken, BuildError> {
        self.ensure_method_free(name, &signature)?;
        debug!(type_name = %self.name, method = name, "defining method");
        self.methods.push(MethodBuilder {
            name: name.to_string(),
            attributes,
            signature,
            generic_parameters: vec![],
            body: None,
            native: None,
            overrides: vec![],
        });
        Ok(MethodToken {
            owner: self.id,
            index: self.methods.len() - 1,
        })
    }

    pub fn define_constructor(
        &mut self,
        accessibility: Accessibility,
        parameters: Vec<ParameterDescription>,
    ) -> Result<MethodToken, BuildError> {
        self.define_method(
            ".ctor",
            MethodAttributes::constructor(accessibility),
            MethodSignature::instance(Default::default(), parameters),
        )
    }

    pub fn method_mut(&mut self, token: MethodToken) -> Result<&mut MethodBuilder, BuildError> {
        self.check_owner(token.owner)?;
        Ok(&mut self.methods[token.index])
    }

    pub fn method(&self, token: MethodToken) -> Result<&MethodBuilder, BuildError> {
        self.check_owner(token.owner)?;
        Ok(&self.methods[token.index])
    }

    /// Registers `body` as the implementation of `declaration` (a method-impl binding).
    pub fn define_method_override(
        &mut self,
        body: MethodToken,
        declaration: &MethodDescription,
    ) -> Result<(), BuildError> {
        self.method_mut(body)?.overrides.push(declaration.clone());
        Ok(())
    }

    pub fn define_property(
        &mut self,
        name: &str,
        property_type: TypeSig,
        parameters: Vec<ParameterDescription>,
    ) -> Result<PropertyToken, BuildError> {
        self.ensure_property_free(name)?;
        self.properties.push(PropertyDefinition {
            name: name.to_string(),
            property_type,
            parameters,
            getter: None,
            setter: None,
        });
        Ok(PropertyToken {
            owner: self.id,
            index: self.properties.len() - 1,
        })
    }

    pub fn set_property_getter(
        &mut self,
        property: PropertyToken,
        getter: MethodToken,
    ) -> Result<(), BuildError> {
        self.check_owner(property.owner)?;
        self.check_owner(getter.owner)?;
        self.properties[property.index].getter = Some(getter.index);
        Ok(())
    }

    pub fn set_property_setter(
        &mut self,
        property: PropertyToken,
        setter: MethodToken,
    ) -> Result<(), BuildError> {
        self.check_owner(property.owner)?;
        self.check_owner(setter.owner)?;
        self.properties[property.index].setter = Some(setter.index);
        Ok(())
    }

    pub fn define_event(
        &mut self,
        name: &str,
        delegate_type: TypeSig,
        add: MethodToken,
        remove: MethodToken,
    ) -> Result<EventToken, BuildError> {
        self.check_owner(add.owner)?;
        self.check_owner(remove.owner)?;
        self.ensure_event_free(name)?;
        self.events.push(EventDefinition {
            name: name.to_string(),
            delegate_type,
            add: add.index,
            remove: remove.index,
        });
        Ok(EventToken {
            owner: self.id,
            index: self.events.len() - 1,
        })
    }

    fn check_owner(&self, owner: TypeId) -> Result<(), BuildError> {
        if owner == self.id {
            Ok(())
        } else {
            Err(BuildError::InvalidToken(self.name.clone()))
        }
    }

    /// Finalizes the type. Consumes the builder, so a type is baked exactly once.
    pub fn bake(self) -> Result<TypeDescription, BuildError> {
        let type_name = self.name.clone();
        let mut methods = Vec::with_capacity(self.methods.len());
        for m in self.methods {
            let body = match (m.body, m.native) {
                (Some(il), _) => Some(MethodBody::Il(Arc::new(
                    il.finish()
                        .map_err(|e| BuildError::Body(format!("{}::{}", type_name, m.name), e))?,
                ))),
                (None, Some(native)) => Some(MethodBody::Native(native)),
                (None, None) if m.attributes.abstract_member => None,
                (None, None) => {
                    return Err(BuildError::MissingBody(format!("{}::{}", type_name, m.name)));
                }
            };
            methods.push(MethodDefinition {
                name: m.name,
                attributes: m.attributes,
                signature: m.signature,
                generic_parameters: m.generic_parameters,
                body,
                overrides: m.overrides,
            });
        }

        let baked = TypeDescription::new(TypeDefinition {
            id: self.id,
            namespace: self.namespace,
            name: self.name,
            kind: self.kind,
            visibility: self.visibility,
            sealed: self.sealed,
            abstract_type: self.abstract_type,
            enclosing: self.enclosing,
            extends: self.extends,
            implements: self.implements,
            generic_parameters: self.generic_parameters,
            fields: self.fields,
            methods,
            properties: self.properties,
            events: self.events,
            field_base: self.field_base,
        });

        if !baked.abstract_type {
            if let Some(missing) = unimplemented_abstract_method(&baked) {
                return Err(BuildError::AbstractMemberNotImplemented {
                    type_name: baked.type_name(),
                    method: format!("{:?}", missing),
                });
            }
        }
        debug!(type_name = %baked.type_name(), methods = baked.methods.len(), "baked type");
        Ok(baked)
    }
}

/// Finds an abstract method reachable from `t` that nothing in `t`'s hierarchy implements.
fn unimplemented_abstract_method(t: &TypeDescription) -> Option<MethodDescription> {
    let mut required: Vec<MethodDescription> = vec![];
    for ancestor in t.ancestors() {
        required.extend(ancestor.methods().filter(|m| m.attributes.abstract_member));
        for interface in &ancestor.implements {
            required.extend(interface.methods().filter(|m| m.attributes.abstract_member));
        }
    }
    required
        .into_iter()
        .find(|m| crate::vm::resolve_virtual(t, m).is_none_or(|r| r.attributes.abstract_member))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emit::{InstructionEncoder, Operand},
        types::{corlib::corlib, members::ReturnDescription},
    };

    #[test]
    fn test_field_slots_follow_parent() {
        let lib = corlib();
        let mut base = TypeBuilder::new(Some("Tests"), "Base", Some(&lib.object)).unwrap();
        base.define_field("a", TypeSig::Int32, Accessibility::Public).unwrap();
        base.define_field("b", TypeSig::Int32, Accessibility::Public).unwrap();
        let base = base.bake().unwrap();

        let mut derived = TypeBuilder::new(Some("Tests"), "Derived", Some(&base)).unwrap();
        let c = derived.define_field("c", TypeSig::Object, Accessibility::Private).unwrap();
        assert_eq!(derived.field_ref(c).unwrap().slot, 2);
        let derived = derived.bake().unwrap();
        assert_eq!(derived.instance_field_count(), 3);
        assert_eq!(derived.find_field("a").unwrap().slot, 0);
    }

    #[test]
    fn test_sealed_parent_is_rejected() {
        let lib = corlib();
        assert!(matches!(
            TypeBuilder::new(None, "Nope", Some(&lib.string)),
            Err(BuildError::SealedParent(_))
        ));
    }

    #[test]
    fn test_tokens_are_bound_to_their_builder() {
        let lib = corlib();
        let mut a = TypeBuilder::new(None, "A", Some(&lib.object)).unwrap();
        let mut b = TypeBuilder::new(None, "B", Some(&lib.object)).unwrap();
        let token = a.define_field("x", TypeSig::Int32, Accessibility::Public).unwrap();
        assert!(matches!(b.field_ref(token), Err(BuildError::InvalidToken(_))));
        let m = a
            .define_method(
                "M",
                MethodAttributes::new(Accessibility::Public),
                MethodSignature::instance(ReturnDescription::VOID, vec![]),
            )
            .unwrap();
        assert!(b.method_mut(m).is_err());
    }

    #[test]
    fn test_bake_requires_bodies_and_resolves_labels() {
        let lib = corlib();
        let mut t = TypeBuilder::new(None, "Looping", Some(&lib.object)).unwrap();
        let m = t
            .define_method(
                "Spin",
                MethodAttributes::static_method(Accessibility::Public),
                MethodSignature::static_member(ReturnDescription::VOID, vec![]),
            )
            .unwrap();
        let il = t.method_mut(m).unwrap().body();
        let end = il.define_label();
        il.emit(crate::emit::OpCode::Br, Operand::Label(end));
        il.mark_label(end).unwrap();
        il.ret();
        let baked = t.bake().unwrap();
        match &baked.method("Spin").unwrap().body {
            Some(MethodBody::Il(body)) => assert_eq!(body.instructions[0].operand, Operand::Target(1)),
            other => panic!("unexpected body {:?}", other),
        }

        let mut t = TypeBuilder::new(None, "Bodiless", Some(&lib.object)).unwrap();
        t.define_method(
            "M",
            MethodAttributes::new(Accessibility::Public),
            MethodSignature::instance(ReturnDescription::VOID, vec![]),
        )
        .unwrap();
        assert!(matches!(t.bake(), Err(BuildError::MissingBody(_))));
    }

    #[test]
    fn test_concrete_type_must_implement_abstract_members() {
        let lib = corlib();
        let mut base = TypeBuilder::new(None, "Shape", Some(&lib.object)).unwrap();
        base.set_abstract(true);
        base.define_method(
            "Area",
            MethodAttributes::abstract_method(Accessibility::Public),
            MethodSignature::instance(ReturnDescription::of(TypeSig::Float64), vec![]),
        )
        .unwrap();
        let base = base.bake().unwrap();

        let t = TypeBuilder::new(None, "Blob", Some(&base)).unwrap();
        assert!(matches!(
            t.bake(),
            Err(BuildError::AbstractMemberNotImplemented { .. })
        ));
    }
}
