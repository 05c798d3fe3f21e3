//! The well-known runtime types synthesized code depends on.
//!
//! Built once per process with the ordinary [`TypeBuilder`]; every method body here is a
//! native intrinsic. Types cannot name themselves in their own member signatures, so the
//! few self-referential corelib signatures (`Delegate.Combine`, `Type.GetTypeFromHandle`)
//! are typed over `object`.
use crate::{
    builder::{MethodToken, TypeBuilder},
    emit::NativeMethod,
    error::BuildError,
    types::{
        TypeDescription, TypeKind, TypeSig,
        members::{
            Accessibility, FieldRef, GenericParameter, MethodAttributes, MethodDescription,
            MethodSignature, ParameterDescription, ReturnDescription,
        },
    },
    vm::intrinsics,
};
use std::sync::LazyLock;

static CORLIB: LazyLock<Corlib> =
    LazyLock::new(|| Corlib::build().expect("core library types must be well-formed"));

pub fn corlib() -> &'static Corlib {
    &CORLIB
}

pub struct Corlib {
    pub object: TypeDescription,
    pub value_type: TypeDescription,
    pub enum_type: TypeDescription,
    pub string: TypeDescription,
    pub delegate: TypeDescription,
    pub multicast_delegate: TypeDescription,
    pub action: TypeDescription,
    pub event_handler: TypeDescription,
    pub runtime_type_handle: TypeDescription,
    pub type_type: TypeDescription,
    pub pointer: TypeDescription,
    pub interlocked: TypeDescription,
    pub exception: TypeDescription,
    pub not_implemented_exception: TypeDescription,
    pub null_reference_exception: TypeDescription,
    pub invalid_cast_exception: TypeDescription,
    pub index_out_of_range_exception: TypeDescription,

    pub object_ctor: MethodDescription,
    pub delegate_combine: MethodDescription,
    pub delegate_remove: MethodDescription,
    pub type_from_handle: MethodDescription,
    pub pointer_box: MethodDescription,
    pub pointer_unbox: MethodDescription,
    pub interlocked_compare_exchange: MethodDescription,
    pub not_implemented_ctor: MethodDescription,
    pub exception_message: FieldRef,
}

fn native(
    builder: &mut TypeBuilder,
    name: &str,
    attributes: MethodAttributes,
    signature: MethodSignature,
    body: NativeMethod,
) -> Result<MethodToken, BuildError> {
    let token = builder.define_method(name, attributes, signature)?;
    builder.method_mut(token)?.set_native(body);
    Ok(token)
}

fn static_native(
    builder: &mut TypeBuilder,
    name: &str,
    return_type: Option<TypeSig>,
    parameters: Vec<ParameterDescription>,
    body: NativeMethod,
) -> Result<MethodToken, BuildError> {
    let return_value = ReturnDescription {
        return_type,
        custom_modifiers: vec![],
    };
    native(
        builder,
        name,
        MethodAttributes::static_method(Accessibility::Public),
        MethodSignature::static_member(return_value, parameters),
        body,
    )
}

fn method(t: &TypeDescription, name: &str) -> Result<MethodDescription, BuildError> {
    t.method(name)
        .ok_or_else(|| BuildError::MissingBody(format!("{}::{}", t.type_name(), name)))
}

fn delegate_type(
    name: &str,
    parent: &TypeDescription,
    parameters: Vec<ParameterDescription>,
) -> Result<TypeDescription, BuildError> {
    let mut builder = TypeBuilder::new(Some("System"), name, Some(parent))?;
    builder.set_kind(TypeKind::Delegate).set_sealed(true);
    native(
        &mut builder,
        "Invoke",
        MethodAttributes::virtual_method(Accessibility::Public),
        MethodSignature::instance(ReturnDescription::VOID, parameters),
        intrinsics::delegate_invoke,
    )?;
    builder.bake()
}

fn exception_type(name: &str, parent: &TypeDescription) -> Result<TypeDescription, BuildError> {
    let mut builder = TypeBuilder::new(Some("System"), name, Some(parent))?;
    native(
        &mut builder,
        ".ctor",
        MethodAttributes::constructor(Accessibility::Public),
        MethodSignature::instance(ReturnDescription::VOID, vec![]),
        intrinsics::exception_ctor,
    )?;
    native(
        &mut builder,
        ".ctor",
        MethodAttributes::constructor(Accessibility::Public),
        MethodSignature::instance(
            ReturnDescription::VOID,
            vec![ParameterDescription::new("message", TypeSig::String)],
        ),
        intrinsics::exception_message_ctor,
    )?;
    builder.bake()
}

impl Corlib {
    fn build() -> Result<Self, BuildError> {
        let mut object = TypeBuilder::new(Some("System"), "Object", None)?;
        native(
            &mut object,
            ".ctor",
            MethodAttributes::constructor(Accessibility::Public),
            MethodSignature::instance(ReturnDescription::VOID, vec![]),
            intrinsics::object_ctor,
        )?;
        let object = object.bake()?;

        let mut value_type = TypeBuilder::new(Some("System"), "ValueType", Some(&object))?;
        value_type.set_abstract(true);
        let value_type = value_type.bake()?;

        let mut enum_type = TypeBuilder::new(Some("System"), "Enum", Some(&value_type))?;
        enum_type.set_abstract(true);
        let enum_type = enum_type.bake()?;

        let mut string = TypeBuilder::new(Some("System"), "String", Some(&object))?;
        string.set_sealed(true);
        let string = string.bake()?;

        let mut delegate = TypeBuilder::new(Some("System"), "Delegate", Some(&object))?;
        delegate.set_abstract(true);
        let pair = || {
            vec![
                ParameterDescription::new("a", TypeSig::Object),
                ParameterDescription::new("b", TypeSig::Object),
            ]
        };
        static_native(
            &mut delegate,
            "Combine",
            Some(TypeSig::Object),
            pair(),
            intrinsics::delegate_combine,
        )?;
        static_native(
            &mut delegate,
            "Remove",
            Some(TypeSig::Object),
            pair(),
            intrinsics::delegate_remove,
        )?;
        let delegate = delegate.bake()?;

        let mut multicast_delegate =
            TypeBuilder::new(Some("System"), "MulticastDelegate", Some(&delegate))?;
        multicast_delegate.set_abstract(true);
        let multicast_delegate = multicast_delegate.bake()?;

        let action = delegate_type("Action", &multicast_delegate, vec![])?;
        let event_handler = delegate_type(
            "EventHandler",
            &multicast_delegate,
            vec![
                ParameterDescription::new("sender", TypeSig::Object),
                ParameterDescription::new("e", TypeSig::Object),
            ],
        )?;

        let mut runtime_type_handle =
            TypeBuilder::new(Some("System"), "RuntimeTypeHandle", Some(&value_type))?;
        runtime_type_handle
            .set_kind(TypeKind::ValueType)
            .set_sealed(true);
        let runtime_type_handle = runtime_type_handle.bake()?;

        let mut type_type = TypeBuilder::new(Some("System"), "Type", Some(&object))?;
        type_type.set_abstract(true);
        static_native(
            &mut type_type,
            "GetTypeFromHandle",
            Some(TypeSig::Object),
            vec![ParameterDescription::new(
                "handle",
                TypeSig::Type(runtime_type_handle.clone()),
            )],
            intrinsics::type_from_handle,
        )?;
        let type_type = type_type.bake()?;

        let mut pointer = TypeBuilder::new(Some("System.Reflection"), "Pointer", Some(&object))?;
        pointer.set_sealed(true);
        static_native(
            &mut pointer,
            "Box",
            Some(TypeSig::Object),
            vec![
                ParameterDescription::new("ptr", TypeSig::UInt8.pointer()),
                ParameterDescription::new("type", TypeSig::Type(type_type.clone())),
            ],
            intrinsics::pointer_box,
        )?;
        static_native(
            &mut pointer,
            "Unbox",
            Some(TypeSig::UInt8.pointer()),
            vec![ParameterDescription::new("ptr", TypeSig::Object)],
            intrinsics::pointer_unbox,
        )?;
        let pointer = pointer.bake()?;

        let mut interlocked =
            TypeBuilder::new(Some("System.Threading"), "Interlocked", Some(&object))?;
        interlocked.set_abstract(true).set_sealed(true);
        let compare_exchange = static_native(
            &mut interlocked,
            "CompareExchange",
            Some(TypeSig::MethodGeneric(0)),
            vec![
                ParameterDescription::new("location1", TypeSig::MethodGeneric(0).by_ref()),
                ParameterDescription::new("value", TypeSig::MethodGeneric(0)),
                ParameterDescription::new("comparand", TypeSig::MethodGeneric(0)),
            ],
            intrinsics::interlocked_compare_exchange,
        )?;
        interlocked
            .method_mut(compare_exchange)?
            .generic_parameters
            .push(GenericParameter {
                reference_type_constraint: true,
                ..GenericParameter::new("T")
            });
        let interlocked = interlocked.bake()?;

        let mut exception = TypeBuilder::new(Some("System"), "Exception", Some(&object))?;
        let message_field =
            exception.define_field("_message", TypeSig::String, Accessibility::Private)?;
        let exception_message = exception.field_ref(message_field)?;
        native(
            &mut exception,
            ".ctor",
            MethodAttributes::constructor(Accessibility::Public),
            MethodSignature::instance(ReturnDescription::VOID, vec![]),
            intrinsics::exception_ctor,
        )?;
        native(
            &mut exception,
            ".ctor",
            MethodAttributes::constructor(Accessibility::Public),
            MethodSignature::instance(
                ReturnDescription::VOID,
                vec![ParameterDescription::new("message", TypeSig::String)],
            ),
            intrinsics::exception_message_ctor,
        )?;
        let get_message = native(
            &mut exception,
            "get_Message",
            MethodAttributes {
                special_name: true,
                ..MethodAttributes::virtual_method(Accessibility::Public)
            },
            MethodSignature::instance(ReturnDescription::of(TypeSig::String), vec![]),
            intrinsics::exception_get_message,
        )?;
        let message = exception.define_property("Message", TypeSig::String, vec![])?;
        exception.set_property_getter(message, get_message)?;
        let exception = exception.bake()?;

        let not_implemented_exception = exception_type("NotImplementedException", &exception)?;
        let null_reference_exception = exception_type("NullReferenceException", &exception)?;
        let invalid_cast_exception = exception_type("InvalidCastException", &exception)?;
        let index_out_of_range_exception =
            exception_type("IndexOutOfRangeException", &exception)?;

        Ok(Self {
            object_ctor: method(&object, ".ctor")?,
            delegate_combine: method(&delegate, "Combine")?,
            delegate_remove: method(&delegate, "Remove")?,
            type_from_handle: method(&type_type, "GetTypeFromHandle")?,
            pointer_box: method(&pointer, "Box")?,
            pointer_unbox: method(&pointer, "Unbox")?,
            interlocked_compare_exchange: method(&interlocked, "CompareExchange")?,
            not_implemented_ctor: method(&not_implemented_exception, ".ctor")?,
            exception_message,
            object,
            value_type,
            enum_type,
            string,
            delegate,
            multicast_delegate,
            action,
            event_handler,
            runtime_type_handle,
            type_type,
            pointer,
            interlocked,
            exception,
            not_implemented_exception,
            null_reference_exception,
            invalid_cast_exception,
            index_out_of_range_exception,
        })
    }

    /// The parameterless constructor of an exception type.
    pub fn default_constructor(&self, t: &TypeDescription) -> Option<MethodDescription> {
        t.constructors().find(|c| c.signature.parameters.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy() {
        let lib = corlib();
        assert!(lib.not_implemented_exception.is_subtype_of(&lib.exception));
        assert!(lib.action.is_subtype_of(&lib.delegate));
        assert!(lib.action.is_delegate());
        assert!(lib.runtime_type_handle.is_value_type());
        assert_eq!(lib.interlocked.type_name(), "System.Threading.Interlocked");
        assert_eq!(lib.exception_message.slot, 0);
    }

    #[test]
    fn test_well_known_methods() {
        let lib = corlib();
        assert!(lib.not_implemented_ctor.is_constructor());
        assert!(lib.not_implemented_ctor.signature.parameters.is_empty());
        assert!(lib.interlocked_compare_exchange.has_generic_parameters());
        assert!(lib.delegate_combine.attributes.static_member);
        assert_eq!(
            format!("{:?}", lib.interlocked_compare_exchange),
            "static !!0 System.Threading.Interlocked::CompareExchange<T>(!!0&, !!0, !!0)"
        );
    }
}
