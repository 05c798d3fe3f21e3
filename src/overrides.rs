//! Same-shaped member declarations in a derived type, with canonical bodies.
//!
//! Every entry point checks legality first, so a rejected request never leaves a partial
//! member in the [`TypeBuilder`].
use crate::{
    builder::{EventToken, MethodToken, PropertyToken, TypeBuilder},
    emit::{InstructionEncoder, InstructionStream, OpCode},
    error::SynthError,
    types::{
        TypeDescription,
        corlib::corlib,
        members::{
            Accessibility, EventDescription, MemberInfo, MethodAttributes, MethodDescription,
            PropertyDescription,
        },
    },
};
use tracing::debug;

/// Visible to a derived type in another module: the declaring type is externally visible and
/// unsealed, and the member is an instance member with public or family access.
pub fn is_inheritable(member: &impl MemberInfo) -> bool {
    let owner = member.declaring_type();
    owner.is_externally_visible()
        && !owner.sealed
        && !member.is_static()
        && member.accessibility().is_inheritable()
}

pub fn is_overridable(method: &MethodDescription) -> bool {
    is_inheritable(method) && method.is_virtual() && !method.attributes.final_member
}

fn ensure_inheritable(member: &impl MemberInfo) -> Result<(), SynthError> {
    if is_inheritable(member) {
        Ok(())
    } else {
        Err(SynthError::MemberAccess {
            member: format!("{}::{}", member.declaring_type(), member.name()),
            reason: "is not inheritable",
        })
    }
}

fn ensure_overridable(method: &MethodDescription) -> Result<(), SynthError> {
    if is_overridable(method) {
        Ok(())
    } else {
        Err(SynthError::MemberAccess {
            member: format!("{:?}", method),
            reason: "is not overridable",
        })
    }
}

/// Name of an explicit implementation: unique per base member, never clashing with a
/// C#-visible name.
pub fn explicit_name(base: &MethodDescription) -> String {
    format!("{}.{}${:016x}", base.parent.type_name(), base.name, base.token())
}

fn override_name(base: &MethodDescription, explicit: bool) -> String {
    match explicit {
        true => explicit_name(base),
        false => base.name.clone(),
    }
}

/// Declared name of a mirrored property or event; explicit ones are prefixed with the
/// declaring type.
fn mirrored_name(parent: &TypeDescription, name: &str, explicit: bool) -> String {
    match explicit {
        true => format!("{}.{}", parent.type_name(), name),
        false => name.to_string(),
    }
}

/// Field behind an auto property declared as `property`.
pub fn backing_field_name(property: &str) -> String {
    format!("<{}>k__BackingField", property)
}

fn emit_not_implemented(il: &mut InstructionStream) {
    il.new_object(&corlib().not_implemented_ctor);
    il.throw();
}

/// Tokens of a mirrored property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyOverride {
    pub property: PropertyToken,
    pub getter: Option<MethodToken>,
    pub setter: Option<MethodToken>,
}

impl PropertyOverride {
    pub fn accessors(&self) -> impl Iterator<Item = MethodToken> {
        self.getter.into_iter().chain(self.setter)
    }
}

/// Tokens of a mirrored event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventOverride {
    pub event: EventToken,
    pub add: MethodToken,
    pub remove: MethodToken,
}

pub struct MemberOverrideBuilder<'t> {
    target: &'t mut TypeBuilder,
}

impl<'t> MemberOverrideBuilder<'t> {
    pub fn new(target: &'t mut TypeBuilder) -> Self {
        Self { target }
    }

    pub fn target(&mut self) -> &mut TypeBuilder {
        self.target
    }

    /// Declares a constructor with `base`'s attributes and parameters. No body.
    pub fn define_constructor_like(
        &mut self,
        base: &MethodDescription,
    ) -> Result<MethodToken, SynthError> {
        ensure_inheritable(base)?;
        if !base.is_constructor() {
            return Err(SynthError::MemberAccess {
                member: format!("{:?}", base),
                reason: "is not a constructor",
            });
        }
        debug!(base = ?base, "mirroring constructor");
        Ok(self
            .target
            .define_method(&base.name, base.attributes, base.signature.clone())?)
    }

    /// Declares a constructor that passes `this` and every argument straight to `base`.
    pub fn define_forwarding_constructor(
        &mut self,
        base: &MethodDescription,
    ) -> Result<MethodToken, SynthError> {
        let token = self.define_constructor_like(base)?;
        let il = self.target.method_mut(token)?.body();
        il.load_argument(0);
        for i in 1..=base.signature.parameters.len() {
            il.load_argument(i as u16);
        }
        il.call(base);
        il.ret();
        Ok(token)
    }

    /// Declares a method with `base`'s shape. The abstract flag is dropped and a new slot is
    /// only introduced for interface methods. An explicit override is private and final,
    /// carries a mangled name and is bound to `base` with a method-impl record.
    pub fn define_method_override(
        &mut self,
        base: &MethodDescription,
        explicit: bool,
    ) -> Result<MethodToken, SynthError> {
        ensure_overridable(base)?;
        Ok(self.declare_override(base, explicit)?)
    }

    fn declare_override(
        &mut self,
        base: &MethodDescription,
        explicit: bool,
    ) -> Result<MethodToken, SynthError> {
        let mut attributes = MethodAttributes {
            abstract_member: false,
            new_slot: base.parent.is_interface(),
            ..base.attributes
        };
        if explicit {
            attributes.accessibility = Accessibility::Private;
            attributes.final_member = true;
        }
        let name = override_name(base, explicit);
        debug!(base = ?base, name = %name, explicit, "declaring override");
        let token = self
            .target
            .define_method(&name, attributes, base.signature.clone())?;
        self.target.method_mut(token)?.generic_parameters = base.generic_parameters.clone();
        if explicit {
            self.target.define_method_override(token, base)?;
        }
        Ok(token)
    }

    pub fn define_not_implemented_method_override(
        &mut self,
        base: &MethodDescription,
        explicit: bool,
    ) -> Result<MethodToken, SynthError> {
        let token = self.define_method_override(base, explicit)?;
        emit_not_implemented(self.target.method_mut(token)?.body());
        Ok(token)
    }

    /// Checks every accessor and every name a mirror of `base` would declare, returning the
    /// property's declared name.
    fn check_property(
        &self,
        base: &PropertyDescription,
        explicit: bool,
    ) -> Result<String, SynthError> {
        for accessor in base.accessors() {
            ensure_overridable(&accessor)?;
            self.target
                .ensure_method_free(&override_name(&accessor, explicit), &accessor.signature)?;
        }
        let name = mirrored_name(&base.parent, &base.name, explicit);
        self.target.ensure_property_free(&name)?;
        Ok(name)
    }

    fn check_event(&self, base: &EventDescription, explicit: bool) -> Result<String, SynthError> {
        for accessor in base.accessors() {
            ensure_overridable(&accessor)?;
            self.target
                .ensure_method_free(&override_name(&accessor, explicit), &accessor.signature)?;
        }
        let name = mirrored_name(&base.parent, &base.name, explicit);
        self.target.ensure_event_free(&name)?;
        Ok(name)
    }

    /// Mirrors `base` and each accessor it has. Accessors get no body.
    pub fn define_property_override(
        &mut self,
        base: &PropertyDescription,
        explicit: bool,
    ) -> Result<PropertyOverride, SynthError> {
        let name = self.check_property(base, explicit)?;
        let property =
            self.target
                .define_property(&name, base.property_type.clone(), base.parameters.clone())?;
        let getter = base
            .getter()
            .map(|g| self.declare_override(&g, explicit))
            .transpose()?;
        let setter = base
            .setter()
            .map(|s| self.declare_override(&s, explicit))
            .transpose()?;
        if let Some(getter) = getter {
            self.target.set_property_getter(property, getter)?;
        }
        if let Some(setter) = setter {
            self.target.set_property_setter(property, setter)?;
        }
        Ok(PropertyOverride {
            property,
            getter,
            setter,
        })
    }

    pub fn define_not_implemented_property_override(
        &mut self,
        base: &PropertyDescription,
        explicit: bool,
    ) -> Result<PropertyOverride, SynthError> {
        let tokens = self.define_property_override(base, explicit)?;
        for accessor in tokens.accessors() {
            emit_not_implemented(self.target.method_mut(accessor)?.body());
        }
        Ok(tokens)
    }

    /// A property backed by a private `<Name>k__BackingField`, where `Name` is the declared
    /// property name.
    pub fn define_auto_property_override(
        &mut self,
        base: &PropertyDescription,
        explicit: bool,
    ) -> Result<PropertyOverride, SynthError> {
        let backing = backing_field_name(&self.check_property(base, explicit)?);
        self.target.ensure_field_free(&backing)?;
        let tokens = self.define_property_override(base, explicit)?;
        let field =
            self.target
                .define_field(&backing, base.property_type.clone(), Accessibility::Private)?;
        let field = self.target.field_ref(field)?;

        if let Some(getter) = tokens.getter {
            let il = self.target.method_mut(getter)?.body();
            il.load_argument(0);
            il.load_field(&field);
            il.ret();
        }
        if let Some(setter) = tokens.setter {
            let value = self.target.method(setter)?.signature.parameters.len() as u16;
            let il = self.target.method_mut(setter)?.body();
            il.load_argument(0);
            il.load_argument(value);
            il.store_field(&field);
            il.ret();
        }
        Ok(tokens)
    }

    /// Mirrors `base` and its add/remove accessors. Accessors get no body.
    pub fn define_event_override(
        &mut self,
        base: &EventDescription,
        explicit: bool,
    ) -> Result<EventOverride, SynthError> {
        let name = self.check_event(base, explicit)?;
        let [add, remove] = base.accessors();
        let add = self.declare_override(&add, explicit)?;
        let remove = self.declare_override(&remove, explicit)?;
        let event = self
            .target
            .define_event(&name, base.delegate_type.clone(), add, remove)?;
        Ok(EventOverride { event, add, remove })
    }

    pub fn define_not_implemented_event_override(
        &mut self,
        base: &EventDescription,
        explicit: bool,
    ) -> Result<EventOverride, SynthError> {
        let tokens = self.define_event_override(base, explicit)?;
        emit_not_implemented(self.target.method_mut(tokens.add)?.body());
        emit_not_implemented(self.target.method_mut(tokens.remove)?.body());
        Ok(tokens)
    }

    /// A field-backed event whose accessors update the handler chain with a
    /// compare-and-swap retry loop, so concurrent subscribers never lose an update. The
    /// field takes the event's declared name.
    pub fn define_default_event_override(
        &mut self,
        base: &EventDescription,
        explicit: bool,
    ) -> Result<EventOverride, SynthError> {
        let name = self.check_event(base, explicit)?;
        self.target.ensure_field_free(&name)?;
        let tokens = self.define_event_override(base, explicit)?;
        let delegate_type = base.delegate_type.clone();
        let field = self
            .target
            .define_field(&name, delegate_type.clone(), Accessibility::Private)?;
        let field = self.target.field_ref(field)?;

        let lib = corlib();
        for (accessor, compose) in [
            (tokens.add, &lib.delegate_combine),
            (tokens.remove, &lib.delegate_remove),
        ] {
            let il = self.target.method_mut(accessor)?.body();
            let current = il.declare_local(delegate_type.clone()).index();
            let expected = il.declare_local(delegate_type.clone()).index();
            let updated = il.declare_local(delegate_type.clone()).index();
            let retry = il.define_label();

            il.load_argument(0);
            il.load_field(&field);
            il.store_local(current);

            il.mark_label(retry)?;
            il.load_local(current);
            il.store_local(expected);
            il.load_local(expected);
            il.load_argument(1);
            il.call(compose);
            il.cast_class(&delegate_type);
            il.store_local(updated);

            il.load_argument(0);
            il.load_field_address(&field);
            il.load_local(updated);
            il.load_local(expected);
            il.call_generic(&lib.interlocked_compare_exchange, vec![delegate_type.clone()]);
            il.store_local(current);

            il.load_local(current);
            il.load_local(expected);
            il.branch(OpCode::BneUnS, retry);
            il.ret();
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::TypeBuilder,
        types::{
            TypeDescription, TypeSig, TypeVisibility,
            members::{MethodSignature, ParameterDescription, ReturnDescription},
        },
    };

    fn base_type(configure: impl FnOnce(&mut TypeBuilder)) -> TypeDescription {
        let mut t = TypeBuilder::new(Some("Tests"), "Base", Some(&corlib().object)).unwrap();
        t.set_abstract(true);
        for (name, attributes) in [
            ("Virtual", MethodAttributes::virtual_method(Accessibility::Public)),
            ("Abstract", MethodAttributes::abstract_method(Accessibility::Family)),
            ("Internal", MethodAttributes::virtual_method(Accessibility::Assembly)),
            ("Plain", MethodAttributes::new(Accessibility::Public)),
            (
                "Sealed",
                MethodAttributes {
                    final_member: true,
                    ..MethodAttributes::virtual_method(Accessibility::Public)
                },
            ),
        ] {
            let m = t
                .define_method(
                    name,
                    attributes,
                    MethodSignature::instance(ReturnDescription::VOID, vec![]),
                )
                .unwrap();
            if !attributes.abstract_member {
                t.method_mut(m).unwrap().body().ret();
            }
        }
        let s = t
            .define_method(
                "Static",
                MethodAttributes::static_method(Accessibility::Public),
                MethodSignature::static_member(ReturnDescription::VOID, vec![]),
            )
            .unwrap();
        t.method_mut(s).unwrap().body().ret();
        configure(&mut t);
        t.bake().unwrap()
    }

    #[test]
    fn test_legality_predicates() {
        let t = base_type(|_| {});
        let m = |name| t.method(name).unwrap();
        assert!(is_overridable(&m("Virtual")));
        assert!(is_overridable(&m("Abstract")));
        assert!(!is_overridable(&m("Internal")));
        assert!(!is_overridable(&m("Plain")));
        assert!(is_inheritable(&m("Plain")));
        assert!(!is_overridable(&m("Sealed")));
        assert!(!is_inheritable(&m("Static")));

        let hidden = base_type(|t| {
            t.set_visibility(TypeVisibility::NotPublic);
        });
        assert!(!is_inheritable(&hidden.method("Virtual").unwrap()));

        let sealed = base_type(|t| {
            t.set_sealed(true);
        });
        assert!(!is_overridable(&sealed.method("Virtual").unwrap()));
    }

    #[test]
    fn test_override_attributes() {
        let base = base_type(|_| {});
        let mut derived = TypeBuilder::new(Some("Tests"), "Derived", Some(&base)).unwrap();
        let mut overrides = MemberOverrideBuilder::new(&mut derived);
        let abstract_base = base.method("Abstract").unwrap();
        let implicit = overrides.define_method_override(&abstract_base, false).unwrap();
        let explicit = overrides
            .define_method_override(&base.method("Virtual").unwrap(), true)
            .unwrap();

        let m = derived.method(implicit).unwrap();
        assert_eq!(m.name, "Abstract");
        assert!(!m.attributes.abstract_member);
        assert!(!m.attributes.new_slot);
        assert!(m.attributes.virtual_member);
        assert_eq!(m.attributes.accessibility, Accessibility::Family);
        assert!(!m.has_body());

        let m = derived.method(explicit).unwrap();
        assert!(m.name.starts_with("Tests.Base.Virtual$"));
        assert_eq!(m.name.len(), "Tests.Base.Virtual$".len() + 16);
        assert_eq!(m.attributes.accessibility, Accessibility::Private);
        assert!(m.attributes.final_member);
        assert_eq!(m.overrides(), &[base.method("Virtual").unwrap()]);
    }

    #[test]
    fn test_rejection_leaves_builder_untouched() {
        let base = base_type(|_| {});
        let mut derived = TypeBuilder::new(Some("Tests"), "Derived", Some(&base)).unwrap();
        let before = derived.member_count();
        let mut overrides = MemberOverrideBuilder::new(&mut derived);
        for name in ["Internal", "Plain", "Sealed", "Static"] {
            let result = overrides.define_not_implemented_method_override(&base.method(name).unwrap(), false);
            assert!(
                matches!(result, Err(SynthError::MemberAccess { .. })),
                "{} should be rejected",
                name
            );
        }
        assert!(matches!(
            overrides.define_forwarding_constructor(&base.method("Virtual").unwrap()),
            Err(SynthError::MemberAccess { .. })
        ));
        assert_eq!(derived.member_count(), before);
    }

    #[test]
    fn test_forwarding_constructor_body() {
        let lib = corlib();
        let mut base = TypeBuilder::new(Some("Tests"), "Pair", Some(&lib.object)).unwrap();
        let ctor = base
            .define_constructor(
                Accessibility::Family,
                vec![
                    ParameterDescription::new("a", TypeSig::Int32),
                    ParameterDescription::new("b", TypeSig::String),
                ],
            )
            .unwrap();
        base.method_mut(ctor).unwrap().body().ret();
        let base = base.bake().unwrap();

        let mut derived = TypeBuilder::new(Some("Tests"), "Derived", Some(&base)).unwrap();
        let token = MemberOverrideBuilder::new(&mut derived)
            .define_forwarding_constructor(&base.method(".ctor").unwrap())
            .unwrap();
        let m = derived.method(token).unwrap();
        assert_eq!(m.attributes.accessibility, Accessibility::Family);
        let ops: Vec<_> = m
            .instructions()
            .unwrap()
            .instructions()
            .iter()
            .map(|i| i.opcode)
            .collect();
        assert_eq!(
            ops,
            vec![OpCode::LdArg0, OpCode::LdArg1, OpCode::LdArg2, OpCode::Call, OpCode::Ret]
        );
    }
}
