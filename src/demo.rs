//! The demonstration type the binary synthesizes and dumps.
use crate::{
    builder::TypeBuilder,
    emit::{InstructionEncoder, MethodBody},
    error::{BuildError, SynthError},
    invoke::{DynamicInvokeSynthesizer, DynamicInvoker},
    overrides::{MemberOverrideBuilder, is_inheritable},
    types::{
        TypeDescription, TypeSig,
        corlib::corlib,
        members::{
            Accessibility, MemberDescription, MethodAttributes, MethodSignature,
            ParameterDescription, ReturnDescription,
        },
    },
    vm::{Executor, ObjectRef, StackValue, VmError},
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error(transparent)]
    Synth(#[from] SynthError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

pub struct Demo {
    pub base: TypeDescription,
    pub widget: TypeDescription,
    pub doubler: Arc<DynamicInvoker>,
}

fn accessor() -> MethodAttributes {
    MethodAttributes {
        special_name: true,
        ..MethodAttributes::abstract_method(Accessibility::Public)
    }
}

/// `Demo.WidgetBase`: an abstract class with one of each overridable member kind.
fn build_base() -> Result<TypeDescription, BuildError> {
    let lib = corlib();
    let mut t = TypeBuilder::new(Some("Demo"), "WidgetBase", Some(&lib.object))?;
    t.set_abstract(true);
    let size = t.define_field("size", TypeSig::Int32, Accessibility::Family)?;
    let size = t.field_ref(size)?;

    let ctor = t.define_constructor(
        Accessibility::Family,
        vec![ParameterDescription::new("size", TypeSig::Int32)],
    )?;
    let il = t.method_mut(ctor)?.body();
    il.load_argument(0);
    il.call(&lib.object_ctor);
    il.load_argument(0);
    il.load_argument(1);
    il.store_field(&size);
    il.ret();

    t.define_method(
        "Describe",
        MethodAttributes::abstract_method(Accessibility::Public),
        MethodSignature::instance(ReturnDescription::of(TypeSig::String), vec![]),
    )?;

    let get_count = t.define_method(
        "get_Count",
        accessor(),
        MethodSignature::instance(ReturnDescription::of(TypeSig::Int32), vec![]),
    )?;
    let set_count = t.define_method(
        "set_Count",
        accessor(),
        MethodSignature::instance(
            ReturnDescription::VOID,
            vec![ParameterDescription::new("value", TypeSig::Int32)],
        ),
    )?;
    let count = t.define_property("Count", TypeSig::Int32, vec![])?;
    t.set_property_getter(count, get_count)?;
    t.set_property_setter(count, set_count)?;

    let handler = TypeSig::Type(lib.event_handler.clone());
    let handler_parameter = || vec![ParameterDescription::new("value", handler.clone())];
    let add = t.define_method(
        "add_Changed",
        accessor(),
        MethodSignature::instance(ReturnDescription::VOID, handler_parameter()),
    )?;
    let remove = t.define_method(
        "remove_Changed",
        accessor(),
        MethodSignature::instance(ReturnDescription::VOID, handler_parameter()),
    )?;
    t.define_event("Changed", handler.clone(), add, remove)?;

    let doubler = t.define_method(
        "Double",
        MethodAttributes::static_method(Accessibility::Public),
        MethodSignature::static_member(
            ReturnDescription::of(TypeSig::Int32),
            vec![ParameterDescription::new("x", TypeSig::Int32.by_ref())],
        ),
    )?;
    let il = t.method_mut(doubler)?.body();
    il.load_argument(0);
    il.load_argument(0);
    il.indirect_load(&TypeSig::Int32);
    il.load_int32_constant(2);
    il.emit(crate::emit::OpCode::Mul, crate::emit::Operand::None);
    il.indirect_store(&TypeSig::Int32);
    il.load_argument(0);
    il.indirect_load(&TypeSig::Int32);
    il.ret();

    t.bake()
}

/// Synthesizes `Demo.Widget` over `Demo.WidgetBase`, plus a shim for `WidgetBase.Double`.
pub fn build_demo(explicit: bool) -> Result<Demo, DemoError> {
    let base = build_base()?;
    let mut widget = TypeBuilder::new(Some("Demo"), "Widget", Some(&base))?;
    let mut overrides = MemberOverrideBuilder::new(&mut widget);
    for member in base.members().filter(|m| is_inheritable(m)) {
        match member {
            MemberDescription::Method(ctor) if ctor.is_constructor() => {
                overrides.define_forwarding_constructor(&ctor)?;
            }
            // accessors are covered by their property or event
            MemberDescription::Method(m)
                if m.attributes.abstract_member && !m.attributes.special_name =>
            {
                overrides.define_not_implemented_method_override(&m, explicit)?;
            }
            MemberDescription::Property(p) => {
                overrides.define_auto_property_override(&p, explicit)?;
            }
            MemberDescription::Event(e) => {
                overrides.define_default_event_override(&e, explicit)?;
            }
            _ => {}
        }
    }
    let widget = widget.bake()?;

    let double = base.method("Double").ok_or(BuildError::MissingBody("Double".into()))?;
    let doubler = DynamicInvokeSynthesizer::get_or_create(&double)?;
    Ok(Demo {
        base,
        widget,
        doubler,
    })
}

pub fn print_type_info(t: &TypeDescription) {
    println!("\n{}", t.type_name());
    println!("\nFields:");
    for field in t.fields() {
        println!("  - {}: {} ({:?})", field.name, field.field_type, field.accessibility);
    }

    println!("\nMethods:");
    for method in t.methods() {
        println!("  - {:?} [{:?}]", method, method.attributes.accessibility);
        for overridden in &method.overrides {
            println!("    overrides {:?}", overridden);
        }
        match &method.body {
            Some(MethodBody::Il(body)) => {
                println!("    Instructions ({} bytes):", body.code_size());
                for line in body.to_string().lines() {
                    println!("      {}", line);
                }
            }
            Some(MethodBody::Native(_)) => println!("    (Native)"),
            None => println!("    (No body)"),
        }
    }

    println!("\nProperties:");
    for property in t.properties() {
        println!(
            "  - {}: getter: {:?}, setter: {:?}",
            property.name,
            property.getter().map(|m| m.name.clone()),
            property.setter().map(|m| m.name.clone())
        );
    }

    println!("\nEvents:");
    for event in t.events() {
        println!("  - {:?}", event);
    }
}

/// Exercises the synthesized members in the interpreter and reports what they did.
pub fn run_demo(demo: &Demo) -> Result<(), DemoError> {
    let lib = corlib();
    let mut executor = Executor::new();
    let ctor = demo
        .widget
        .constructors()
        .next()
        .ok_or(BuildError::MissingBody(".ctor".into()))?;
    let widget = executor.new_object(&ctor, vec![StackValue::Int32(7)])?;

    let count = demo.base.property("Count").ok_or(BuildError::MissingBody("Count".into()))?;
    if let (Some(get), Some(set)) = (count.getter(), count.setter()) {
        executor.invoke_virtual(&set, vec![widget.clone(), StackValue::Int32(3)])?;
        let value = executor.invoke_virtual(&get, vec![widget.clone()])?;
        println!("Count after set(3): {:?}", value);
    }

    let changed = demo.base.event("Changed").ok_or(BuildError::MissingBody("Changed".into()))?;
    let describe = demo.base.method("Describe").ok_or(BuildError::MissingBody("Describe".into()))?;
    let handler = ObjectRef::delegate(&lib.event_handler, widget.as_object()?.clone(), describe.clone());
    for _ in 0..2 {
        executor.invoke_virtual(&changed.add_method(), vec![widget.clone(), handler.clone().into()])?;
    }
    executor.invoke_virtual(&changed.remove_method(), vec![widget.clone(), handler.into()])?;
    let field = demo.widget.events().next().and_then(|e| demo.widget.field(&e.name));
    if let Some(field) = field {
        let subscribers = widget
            .as_object()?
            .field(field.slot)
            .and_then(|v| v.into_object().ok())
            .and_then(|o| o.invocation_list().map(<[_]>::len))
            .unwrap_or(0);
        println!("Changed subscribers after add, add, remove: {}", subscribers);
    }

    match executor.invoke_virtual(&describe, vec![widget]) {
        Err(e) => println!("Describe(): {}", e),
        Ok(v) => println!("Describe() returned {:?}", v),
    }

    let arguments = ObjectRef::vector(
        TypeSig::Object,
        vec![ObjectRef::boxed(TypeSig::Int32, StackValue::Int32(5))?.into()],
    );
    let result = demo
        .doubler
        .invoke_with(&mut executor, &ObjectRef::NULL, &arguments)?;
    println!(
        "Double(ref 5) returned {:?}, argument now {:?}",
        result.unboxed(),
        arguments
            .elements()
            .and_then(|e| e.first().and_then(|v| v.as_object().ok().and_then(ObjectRef::unboxed)))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::backing_field_name;

    #[test]
    fn test_demo_builds_and_runs_in_both_modes() {
        for explicit in [false, true] {
            let demo = build_demo(explicit).unwrap();
            let (count, changed) = match explicit {
                true => ("Demo.WidgetBase.Count", "Demo.WidgetBase.Changed"),
                false => ("Count", "Changed"),
            };
            assert!(demo.widget.field(&backing_field_name(count)).is_some());
            assert!(demo.widget.field(changed).is_some());
            assert_eq!(demo.widget.constructors().count(), 1);
            let describe = demo
                .widget
                .methods()
                .find(|m| m.name == "Describe" || m.name.contains(".Describe$"));
            assert_eq!(describe.map(|m| m.attributes.final_member), Some(explicit));
            run_demo(&demo).unwrap();
        }
    }
}
