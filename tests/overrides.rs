use dotnet_synth::{
    BuildError, MemberOverrideBuilder, SynthError, TypeBuilder,
    emit::{InstructionEncoder, OpCode, Operand},
    overrides::{backing_field_name, explicit_name},
    types::{
        TypeDescription, TypeSig,
        corlib::corlib,
        members::{
            Accessibility, MethodAttributes, MethodDescription, MethodSignature,
            ParameterDescription, ReturnDescription,
        },
    },
    vm::{Executor, ObjectRef, StackValue},
};
use std::thread;

fn special(attributes: MethodAttributes) -> MethodAttributes {
    MethodAttributes {
        special_name: true,
        ..attributes
    }
}

/// `Tests.Gadget`: abstract, with a parameterless family constructor, an abstract
/// `int32 Measure(int32)`, an abstract `Count` property, an abstract `Changed` event and an
/// internal virtual `Hidden` property.
fn gadget() -> TypeDescription {
    let lib = corlib();
    let mut t = TypeBuilder::new(Some("Tests"), "Gadget", Some(&lib.object)).unwrap();
    t.set_abstract(true);
    let ctor = t.define_constructor(Accessibility::Family, vec![]).unwrap();
    let il = t.method_mut(ctor).unwrap().body();
    il.load_argument(0);
    il.call(&lib.object_ctor);
    il.ret();

    t.define_method(
        "Measure",
        MethodAttributes::abstract_method(Accessibility::Public),
        MethodSignature::instance(
            ReturnDescription::of(TypeSig::Int32),
            vec![ParameterDescription::new("x", TypeSig::Int32)],
        ),
    )
    .unwrap();

    let get = t
        .define_method(
            "get_Count",
            special(MethodAttributes::abstract_method(Accessibility::Public)),
            MethodSignature::instance(ReturnDescription::of(TypeSig::Int32), vec![]),
        )
        .unwrap();
    let set = t
        .define_method(
            "set_Count",
            special(MethodAttributes::abstract_method(Accessibility::Family)),
            MethodSignature::instance(
                ReturnDescription::VOID,
                vec![ParameterDescription::new("value", TypeSig::Int32)],
            ),
        )
        .unwrap();
    let count = t.define_property("Count", TypeSig::Int32, vec![]).unwrap();
    t.set_property_getter(count, get).unwrap();
    t.set_property_setter(count, set).unwrap();

    let hidden_get = t
        .define_method(
            "get_Hidden",
            special(MethodAttributes::virtual_method(Accessibility::Assembly)),
            MethodSignature::instance(ReturnDescription::of(TypeSig::Int32), vec![]),
        )
        .unwrap();
    let il = t.method_mut(hidden_get).unwrap().body();
    il.load_int32_constant(0);
    il.ret();
    let hidden = t.define_property("Hidden", TypeSig::Int32, vec![]).unwrap();
    t.set_property_getter(hidden, hidden_get).unwrap();

    let handler = TypeSig::Type(lib.event_handler.clone());
    let add = t
        .define_method(
            "add_Changed",
            special(MethodAttributes::abstract_method(Accessibility::Public)),
            MethodSignature::instance(
                ReturnDescription::VOID,
                vec![ParameterDescription::new("value", handler.clone())],
            ),
        )
        .unwrap();
    let remove = t
        .define_method(
            "remove_Changed",
            special(MethodAttributes::abstract_method(Accessibility::Public)),
            MethodSignature::instance(
                ReturnDescription::VOID,
                vec![ParameterDescription::new("value", handler.clone())],
            ),
        )
        .unwrap();
    t.define_event("Changed", handler, add, remove).unwrap();
    t.bake().unwrap()
}

/// Derives from `base`, forwarding constructors and filling in the rest with `configure`.
fn derive(
    base: &TypeDescription,
    name: &str,
    configure: impl FnOnce(&mut MemberOverrideBuilder<'_>),
) -> TypeDescription {
    let mut t = TypeBuilder::new(Some("Tests"), name, Some(base)).unwrap();
    let mut overrides = MemberOverrideBuilder::new(&mut t);
    for ctor in base.constructors() {
        overrides.define_forwarding_constructor(&ctor).unwrap();
    }
    configure(&mut overrides);
    t.bake().unwrap()
}

/// Fills every abstract member of `Tests.Gadget` with a throwing body.
fn stub_rest(overrides: &mut MemberOverrideBuilder<'_>, base: &TypeDescription, skip: &[&str]) {
    if !skip.contains(&"Measure") {
        let measure = base.method("Measure").unwrap();
        overrides.define_not_implemented_method_override(&measure, false).unwrap();
    }
    if !skip.contains(&"Count") {
        let count = base.property("Count").unwrap();
        overrides.define_not_implemented_property_override(&count, false).unwrap();
    }
    if !skip.contains(&"Changed") {
        let changed = base.event("Changed").unwrap();
        overrides.define_not_implemented_event_override(&changed, false).unwrap();
    }
}

fn instantiate(t: &TypeDescription, args: Vec<StackValue>) -> StackValue {
    let ctor = t.constructors().next().unwrap();
    Executor::default().new_object(&ctor, args).unwrap()
}

#[test]
fn test_forwarding_constructor_matches_base() {
    let lib = corlib();
    let mut point = TypeBuilder::new(Some("Tests"), "Point", Some(&lib.object)).unwrap();
    let x = point.define_field("x", TypeSig::Int32, Accessibility::Public).unwrap();
    let x = point.field_ref(x).unwrap();
    let label = point.define_field("label", TypeSig::String, Accessibility::Public).unwrap();
    let label = point.field_ref(label).unwrap();
    let ctor = point
        .define_constructor(
            Accessibility::Public,
            vec![
                ParameterDescription::new("x", TypeSig::Int32),
                ParameterDescription::new("label", TypeSig::String),
            ],
        )
        .unwrap();
    let il = point.method_mut(ctor).unwrap().body();
    il.load_argument(0);
    il.call(&lib.object_ctor);
    il.load_argument(0);
    il.load_argument(1);
    il.store_field(&x);
    il.load_argument(0);
    il.load_argument(2);
    il.store_field(&label);
    il.ret();
    let point = point.bake().unwrap();
    let derived = derive(&point, "NamedPoint", |_| {});

    let text = ObjectRef::string("origin");
    let args = || vec![StackValue::Int32(-4), text.clone().into()];
    let direct = instantiate(&point, args());
    let forwarded = instantiate(&derived, args());
    let (direct, forwarded) = (direct.as_object().unwrap(), forwarded.as_object().unwrap());
    for slot in [x.slot, label.slot] {
        assert_eq!(direct.field(slot), forwarded.field(slot), "slot {}", slot);
    }
    assert_eq!(forwarded.field(x.slot), Some(StackValue::Int32(-4)));

    let ctor = derived.constructors().next().unwrap();
    assert_eq!(ctor.signature, point.constructors().next().unwrap().signature);
    assert_eq!(ctor.attributes, point.constructors().next().unwrap().attributes);
}

#[test]
fn test_override_dispatches_through_base() {
    let base = gadget();
    for explicit in [false, true] {
        let derived = derive(&base, "Squarer", |o| {
            let measure = base.method("Measure").unwrap();
            let token = o.define_method_override(&measure, explicit).unwrap();
            let il = o.target().method_mut(token).unwrap().body();
            il.load_argument(1);
            il.load_argument(1);
            il.emit(OpCode::Mul, Operand::None);
            il.ret();
            stub_rest(o, &base, &["Measure"]);
        });

        let measure = base.method("Measure").unwrap();
        let name = if explicit { explicit_name(&measure) } else { "Measure".to_string() };
        let declared = derived.method(&name).unwrap();
        assert_eq!(declared.attributes.final_member, explicit);
        assert_eq!(declared.overrides.contains(&measure), explicit);
        assert!(!declared.attributes.abstract_member);
        assert!(!declared.attributes.new_slot);

        let object = instantiate(&derived, vec![]);
        let result = Executor::default()
            .invoke_virtual(&measure, vec![object, StackValue::Int32(6)])
            .unwrap();
        assert_eq!(result, Some(StackValue::Int32(36)));
    }
}

#[test]
fn test_not_implemented_members_throw() {
    let base = gadget();
    let derived = derive(&base, "Stub", |o| stub_rest(o, &base, &[]));
    let object = instantiate(&derived, vec![]);
    let mut executor = Executor::default();

    let measure = base.method("Measure").unwrap();
    let error = executor
        .invoke_virtual(&measure, vec![object.clone(), StackValue::Int32(1)])
        .unwrap_err();
    assert_eq!(error.exception_type(), Some("System.NotImplementedException"));

    let getter = base.property("Count").unwrap().getter().unwrap();
    let error = executor.invoke_virtual(&getter, vec![object.clone()]).unwrap_err();
    assert_eq!(error.exception_type(), Some("System.NotImplementedException"));

    let add = base.event("Changed").unwrap().add_method();
    let error = executor
        .invoke_virtual(&add, vec![object, ObjectRef::NULL.into()])
        .unwrap_err();
    assert_eq!(error.exception_type(), Some("System.NotImplementedException"));
}

#[test]
fn test_auto_property_round_trip() {
    let base = gadget();
    for explicit in [false, true] {
        let derived = derive(&base, "Counter", |o| {
            let count = base.property("Count").unwrap();
            let tokens = o.define_auto_property_override(&count, explicit).unwrap();
            assert_eq!(tokens.accessors().count(), 2);
            stub_rest(o, &base, &["Count"]);
        });

        let name = if explicit { "Tests.Gadget.Count" } else { "Count" };
        assert!(derived.property(name).is_some());
        let backing = derived.field(&backing_field_name(name)).unwrap();
        assert_eq!(backing.accessibility, Accessibility::Private);

        let count = base.property("Count").unwrap();
        let object = instantiate(&derived, vec![]);
        let mut executor = Executor::default();
        let get = count.getter().unwrap();
        let set = count.setter().unwrap();
        assert_eq!(
            executor.invoke_virtual(&get, vec![object.clone()]).unwrap(),
            Some(StackValue::Int32(0))
        );
        executor
            .invoke_virtual(&set, vec![object.clone(), StackValue::Int32(42)])
            .unwrap();
        assert_eq!(
            executor.invoke_virtual(&get, vec![object]).unwrap(),
            Some(StackValue::Int32(42))
        );
    }
}

#[test]
fn test_rejections_leave_target_untouched() {
    let base = gadget();
    let hidden = base.property("Hidden").unwrap();
    let ctor = base.constructors().next().unwrap();
    let measure = base.method("Measure").unwrap();

    for explicit in [false, true] {
        let mut t = TypeBuilder::new(Some("Tests"), "Rejected", Some(&base)).unwrap();
        let mut overrides = MemberOverrideBuilder::new(&mut t);
        assert!(matches!(
            overrides.define_auto_property_override(&hidden, explicit),
            Err(SynthError::MemberAccess { reason: "is not overridable", .. })
        ));
        assert!(matches!(
            overrides.define_not_implemented_property_override(&hidden, explicit),
            Err(SynthError::MemberAccess { .. })
        ));
        assert!(matches!(
            overrides.define_method_override(&ctor, explicit),
            Err(SynthError::MemberAccess { reason: "is not overridable", .. })
        ));
        assert!(matches!(
            overrides.define_constructor_like(&measure),
            Err(SynthError::MemberAccess { reason: "is not a constructor", .. })
        ));
        assert_eq!(t.member_count(), 0);
        assert_eq!(t.field_count(), 0);
    }
}

#[test]
fn test_default_event_survives_concurrent_subscribers() {
    const THREADS: usize = 8;
    const ADDS: usize = 25;
    const REMOVES: usize = 10;

    let lib = corlib();
    let base = gadget();
    let derived = derive(&base, "Publisher", |o| {
        let changed = base.event("Changed").unwrap();
        o.define_default_event_override(&changed, false).unwrap();
        stub_rest(o, &base, &["Changed"]);
    });
    let object = instantiate(&derived, vec![]);
    let changed = base.event("Changed").unwrap();
    let measure = base.method("Measure").unwrap();
    let handlers: Vec<ObjectRef> = (0..THREADS)
        .map(|i| {
            let target = ObjectRef::string(&format!("subscriber {}", i));
            ObjectRef::delegate(&lib.event_handler, target, measure.clone())
        })
        .collect();

    let run = |accessor: MethodDescription, times: usize| {
        thread::scope(|s| {
            for handler in &handlers {
                let (accessor, object) = (accessor.clone(), object.clone());
                s.spawn(move || {
                    let mut executor = Executor::default();
                    for _ in 0..times {
                        executor
                            .invoke_virtual(&accessor, vec![object.clone(), handler.clone().into()])
                            .unwrap();
                    }
                });
            }
        });
    };

    let field = derived.field("Changed").unwrap();
    let chain = || {
        object
            .as_object()
            .unwrap()
            .field(field.slot)
            .unwrap()
            .into_object()
            .unwrap()
    };
    let occurrences = |chain: &ObjectRef, handler: &ObjectRef| {
        let entry = &handler.invocation_list().unwrap()[0];
        chain.invocation_list().unwrap().iter().filter(|e| *e == entry).count()
    };

    run(changed.add_method(), ADDS);
    let after_adds = chain();
    assert_eq!(after_adds.invocation_list().unwrap().len(), THREADS * ADDS);
    for handler in &handlers {
        assert_eq!(occurrences(&after_adds, handler), ADDS);
    }

    run(changed.remove_method(), REMOVES);
    let after_removes = chain();
    assert_eq!(
        after_removes.invocation_list().unwrap().len(),
        THREADS * (ADDS - REMOVES)
    );
    for handler in &handlers {
        assert_eq!(occurrences(&after_removes, handler), ADDS - REMOVES);
    }

    run(changed.remove_method(), ADDS - REMOVES);
    assert!(chain().is_null());
}

/// An interface declaring an `int32 Count { get; set; }` property and a `Changed` event.
fn counted_interface(name: &str) -> TypeDescription {
    let handler = TypeSig::Type(corlib().event_handler.clone());
    let mut t = TypeBuilder::new_interface(Some("Tests"), name);
    let accessor = |ret: ReturnDescription, parameter: Option<TypeSig>| {
        MethodSignature::instance(
            ret,
            parameter.map(|p| ParameterDescription::new("value", p)).into_iter().collect(),
        )
    };
    let abstract_accessor = special(MethodAttributes::abstract_method(Accessibility::Public));
    let mut define = |name: &str, signature: MethodSignature| {
        t.define_method(name, abstract_accessor, signature).unwrap()
    };
    let get = define("get_Count", accessor(ReturnDescription::of(TypeSig::Int32), None));
    let set = define("set_Count", accessor(ReturnDescription::VOID, Some(TypeSig::Int32)));
    let add = define("add_Changed", accessor(ReturnDescription::VOID, Some(handler.clone())));
    let remove = define("remove_Changed", accessor(ReturnDescription::VOID, Some(handler.clone())));

    let count = t.define_property("Count", TypeSig::Int32, vec![]).unwrap();
    t.set_property_getter(count, get).unwrap();
    t.set_property_setter(count, set).unwrap();
    t.define_event("Changed", handler, add, remove).unwrap();
    t.bake().unwrap()
}

#[test]
fn test_explicit_members_of_two_interfaces_share_a_name() {
    let lib = corlib();
    let interfaces = [counted_interface("IA"), counted_interface("IB")];

    let mut t = TypeBuilder::new(Some("Tests"), "Both", Some(&lib.object)).unwrap();
    for interface in &interfaces {
        t.add_interface(interface);
    }
    let ctor = t.define_constructor(Accessibility::Public, vec![]).unwrap();
    let il = t.method_mut(ctor).unwrap().body();
    il.load_argument(0);
    il.call(&lib.object_ctor);
    il.ret();
    let mut overrides = MemberOverrideBuilder::new(&mut t);
    for interface in &interfaces {
        let count = interface.property("Count").unwrap();
        overrides.define_auto_property_override(&count, true).unwrap();
        let changed = interface.event("Changed").unwrap();
        overrides.define_default_event_override(&changed, true).unwrap();
    }
    let both = t.bake().unwrap();

    for name in ["Tests.IA", "Tests.IB"] {
        assert!(both.field(&format!("{}.Changed", name)).is_some());
        assert!(both.field(&backing_field_name(&format!("{}.Count", name))).is_some());
    }

    let object = instantiate(&both, vec![]);
    let mut executor = Executor::default();
    for (interface, value) in interfaces.iter().zip([5, 9]) {
        let count = interface.property("Count").unwrap();
        let set = count.setter().unwrap();
        executor
            .invoke_virtual(&set, vec![object.clone(), StackValue::Int32(value)])
            .unwrap();
    }
    for (interface, value) in interfaces.iter().zip([5, 9]) {
        let count = interface.property("Count").unwrap();
        let get = count.getter().unwrap();
        assert_eq!(
            executor.invoke_virtual(&get, vec![object.clone()]).unwrap(),
            Some(StackValue::Int32(value))
        );
    }

    let [ia, _] = &interfaces;
    let target = ObjectRef::string("subscriber");
    let handler = ObjectRef::delegate(&lib.event_handler, target, ia.method("get_Count").unwrap());
    let subscribe = ia.event("Changed").unwrap().add_method();
    executor
        .invoke_virtual(&subscribe, vec![object.clone(), handler.into()])
        .unwrap();
    let chain = |field: &str| {
        let field = both.field(field).unwrap();
        object.as_object().unwrap().field(field.slot).unwrap().into_object().unwrap()
    };
    assert_eq!(chain("Tests.IA.Changed").invocation_list().unwrap().len(), 1);
    assert!(chain("Tests.IB.Changed").is_null());
}

#[test]
fn test_name_collisions_are_rejected_before_anything_is_declared() {
    let base = gadget();
    let count = base.property("Count").unwrap();
    let changed = base.event("Changed").unwrap();

    let mut t = TypeBuilder::new(Some("Tests"), "Crowded", Some(&base)).unwrap();
    t.define_field("Changed", TypeSig::Object, Accessibility::Private).unwrap();
    t.define_field(&backing_field_name("Count"), TypeSig::Int32, Accessibility::Private)
        .unwrap();
    let before = t.member_count();
    let mut overrides = MemberOverrideBuilder::new(&mut t);
    assert!(matches!(
        overrides.define_default_event_override(&changed, false),
        Err(SynthError::Build(BuildError::DuplicateMember(_)))
    ));
    assert!(matches!(
        overrides.define_auto_property_override(&count, false),
        Err(SynthError::Build(BuildError::DuplicateMember(_)))
    ));
    assert_eq!(t.member_count(), before);

    let mut t = TypeBuilder::new(Some("Tests"), "Crowded", Some(&base)).unwrap();
    let mut overrides = MemberOverrideBuilder::new(&mut t);
    overrides.define_event_override(&changed, false).unwrap();
    let before = overrides.target().member_count();
    assert!(matches!(
        overrides.define_not_implemented_event_override(&changed, false),
        Err(SynthError::Build(BuildError::DuplicateMember(_)))
    ));
    assert_eq!(overrides.target().member_count(), before);
}
