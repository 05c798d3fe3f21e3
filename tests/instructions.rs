use dotnet_synth::{
    builder::TypeBuilder,
    emit::{InstructionEncoder, InstructionStream, OpCode, Operand, TypeCategory},
    types::{
        TypeKind, TypeSig,
        corlib::corlib,
        members::{
            Accessibility::Public, GenericParameter, MethodAttributes, MethodSignature,
            ParameterDescription, ReturnDescription,
        },
    },
    vm::{Executor, ObjectRef, StackValue, ValueTypeInstance, VmError},
};

/// Bakes `emit` into a static method returning `return_type` and runs it.
fn run(
    return_type: TypeSig,
    emit: impl FnOnce(&mut InstructionStream),
) -> Result<StackValue, VmError> {
    let mut t = TypeBuilder::new(Some("Tests"), "Harness", Some(&corlib().object)).unwrap();
    let m = t
        .define_method(
            "Test",
            MethodAttributes::static_method(Public),
            MethodSignature::static_member(ReturnDescription::of(return_type), vec![]),
        )
        .unwrap();
    emit(t.method_mut(m).unwrap().body());
    let t = t.bake().unwrap();
    let result = Executor::default().invoke(&t.method("Test").unwrap(), vec![])?;
    Ok(result.expect("non-void method returns a value"))
}

macro_rules! simple_test {
    ($ret:expr, |$il:ident| $body:block) => {
        run($ret, |$il: &mut InstructionStream| $body).unwrap()
    };
}

macro_rules! test_math {
    ($op:ident, $left:literal, $right:literal, $expected:literal) => {
        let result = simple_test!(TypeSig::Int32, |il| {
            il.load_int32_constant($left);
            il.load_int32_constant($right);
            il.emit(OpCode::$op, Operand::None);
            il.ret();
        });
        assert_eq!(result, StackValue::Int32($expected));
    };
}

#[test]
fn test_add() {
    test_math!(Add, 1, 2, 3);
}

#[test]
fn test_subtract() {
    test_math!(Sub, 1000, 1001, -1);
}

#[test]
fn test_multiply_wraps() {
    test_math!(Mul, 65536, 65536, 0);
}

#[test]
fn test_constants_survive_every_form() {
    let values = (-1..=8).chain([-129, -128, 127, 128, 1_000_000, i32::MIN, i32::MAX]);
    for value in values {
        let result = simple_test!(TypeSig::Int32, |il| {
            il.load_int32_constant(value);
            il.ret();
        });
        assert_eq!(result, StackValue::Int32(value), "constant {}", value);
    }
}

/// Pushes `value` of type `t` on the stack.
fn push(il: &mut InstructionStream, value: &StackValue) {
    match *value {
        StackValue::Int32(v) => il.load_int32_constant(v),
        StackValue::Int64(v) => il.emit(OpCode::LdcI8, Operand::Int64(v)),
        StackValue::NativeInt(v) => {
            il.load_int32_constant(v as i32);
            il.emit(OpCode::ConvI, Operand::None);
        }
        StackValue::NativeFloat(v) => il.emit(OpCode::LdcR8, Operand::Float64(v)),
        ref other => panic!("no constant form for {:?}", other),
    }
}

fn category_samples() -> Vec<(TypeSig, StackValue)> {
    let lib = corlib();
    let mut short_enum = TypeBuilder::new_enum(Some("Tests"), "Small", &lib.enum_type, TypeSig::Int16).unwrap();
    short_enum.define_field("value__", TypeSig::Int16, Public).unwrap();
    let short_enum = short_enum.bake().unwrap();
    vec![
        (TypeSig::Boolean, StackValue::Int32(1)),
        (TypeSig::Char, StackValue::Int32(0x263A)),
        (TypeSig::Int8, StackValue::Int32(-5)),
        (TypeSig::UInt8, StackValue::Int32(200)),
        (TypeSig::Int16, StackValue::Int32(-300)),
        (TypeSig::UInt16, StackValue::Int32(60000)),
        (TypeSig::Int32, StackValue::Int32(i32::MIN)),
        (TypeSig::UInt32, StackValue::Int32(-1)),
        (TypeSig::Int64, StackValue::Int64(i64::MIN)),
        (TypeSig::UInt64, StackValue::Int64(-1)),
        (TypeSig::IntPtr, StackValue::NativeInt(-42)),
        (TypeSig::UIntPtr, StackValue::NativeInt(42)),
        (TypeSig::Int32.pointer(), StackValue::NativeInt(4096)),
        (TypeSig::Float32, StackValue::NativeFloat(1.5)),
        (TypeSig::Float64, StackValue::NativeFloat(-2.25)),
        (TypeSig::Type(short_enum), StackValue::Int32(-7)),
    ]
}

#[test]
fn test_array_round_trip_by_category() {
    for (element, value) in category_samples() {
        let result = simple_test!(element.clone(), |il| {
            il.load_int32_constant(1);
            il.emit(OpCode::NewArr, Operand::Type(element.clone()));
            il.duplicate();
            il.load_int32_constant(0);
            push(il, &value);
            il.array_store(&element);
            il.load_int32_constant(0);
            il.array_load(&element);
            il.ret();
        });
        assert_eq!(result, value, "element type {}", element);
    }
}

#[test]
fn test_array_round_trip_of_references() {
    let result = simple_test!(TypeSig::String, |il| {
        il.load_int32_constant(2);
        il.emit(OpCode::NewArr, Operand::Type(TypeSig::String));
        il.duplicate();
        il.load_int32_constant(1);
        il.load_string("kept");
        il.array_store(&TypeSig::String);
        il.load_int32_constant(1);
        il.array_load(&TypeSig::String);
        il.ret();
    });
    assert_eq!(result.as_object().unwrap().as_str(), Some("kept"));
}

#[test]
fn test_indirect_round_trip_by_category() {
    for (t, value) in category_samples() {
        let result = simple_test!(t.clone(), |il| {
            let local = il.declare_local(t.clone()).index();
            il.load_local_address(local);
            push(il, &value);
            il.indirect_store(&t);
            il.load_local_address(local);
            il.indirect_load(&t);
            il.ret();
        });
        assert_eq!(result, value, "type {}", t);
    }
}

/// Runs `emit` as the body of a static `T Echo(T value)`; a non-empty `instantiation` makes
/// the method generic over `!!0` and invokes it with those arguments.
fn echo(
    parameter: TypeSig,
    instantiation: &[TypeSig],
    value: StackValue,
    emit: impl FnOnce(&mut InstructionStream, &TypeSig),
) -> StackValue {
    let mut t = TypeBuilder::new(Some("Tests"), "Echo", Some(&corlib().object)).unwrap();
    let m = t
        .define_method(
            "Echo",
            MethodAttributes::static_method(Public),
            MethodSignature::static_member(
                ReturnDescription::of(parameter.clone()),
                vec![ParameterDescription::new("value", parameter.clone())],
            ),
        )
        .unwrap();
    let method = t.method_mut(m).unwrap();
    if !instantiation.is_empty() {
        method.generic_parameters = vec![GenericParameter::new("T")];
    }
    emit(method.body(), &parameter);
    let t = t.bake().unwrap();
    Executor::default()
        .invoke_generic(&t.method("Echo").unwrap(), instantiation, vec![value])
        .unwrap()
        .expect("echo returns its argument")
}

fn echo_through_array(il: &mut InstructionStream, element: &TypeSig) {
    il.load_int32_constant(1);
    il.emit(OpCode::NewArr, Operand::Type(element.clone()));
    il.duplicate();
    il.load_int32_constant(0);
    il.load_argument(0);
    il.array_store(element);
    il.load_int32_constant(0);
    il.array_load(element);
    il.ret();
}

fn echo_through_local(il: &mut InstructionStream, t: &TypeSig) {
    let local = il.declare_local(t.clone()).index();
    il.load_local_address(local);
    il.load_argument(0);
    il.indirect_store(t);
    il.load_local_address(local);
    il.indirect_load(t);
    il.ret();
}

#[test]
fn test_struct_and_generic_round_trips() {
    let lib = corlib();
    let mut pair = TypeBuilder::new(Some("Tests"), "Pair", Some(&lib.value_type)).unwrap();
    pair.set_kind(TypeKind::ValueType).set_sealed(true);
    let left = pair.define_field("left", TypeSig::Int32, Public).unwrap();
    let left = pair.field_ref(left).unwrap();
    let right = pair.define_field("right", TypeSig::Int64, Public).unwrap();
    let right = pair.field_ref(right).unwrap();
    let pair = pair.bake().unwrap();

    let mut instance = ValueTypeInstance::new(&pair);
    instance.fields[left.slot] = StackValue::Int32(77);
    instance.fields[right.slot] = StackValue::Int64(-1);
    let instance = StackValue::ValueType(instance);
    let pair = TypeSig::Type(pair);
    let text: StackValue = ObjectRef::string("generic").into();

    assert_eq!(TypeCategory::of(&pair), TypeCategory::ValueType);
    assert_eq!(TypeCategory::of(&TypeSig::MethodGeneric(0)), TypeCategory::GenericParameter);

    let cases = [
        (pair.clone(), vec![], instance.clone()),
        (TypeSig::MethodGeneric(0), vec![pair.clone()], instance),
        (TypeSig::MethodGeneric(0), vec![TypeSig::Int64], StackValue::Int64(-5)),
        (TypeSig::MethodGeneric(0), vec![TypeSig::String], text),
    ];
    for (parameter, instantiation, value) in cases {
        let through_array = echo(parameter.clone(), &instantiation, value.clone(), echo_through_array);
        assert_eq!(through_array, value, "array of {} with {:?}", parameter, instantiation);
        let through_local = echo(parameter.clone(), &instantiation, value.clone(), echo_through_local);
        assert_eq!(through_local, value, "address of {} with {:?}", parameter, instantiation);
    }
}

#[test]
fn test_box_and_unbox() {
    let result = simple_test!(TypeSig::Int16, |il| {
        il.load_int32_constant(-3);
        il.box_value(&TypeSig::Int16).unwrap();
        il.unbox_value(&TypeSig::Int16).unwrap();
        il.ret();
    });
    assert_eq!(result, StackValue::Int32(-3));

    let result = simple_test!(TypeSig::Object, |il| {
        il.load_int32_constant(9);
        il.box_value(&TypeSig::Int32).unwrap();
        il.ret();
    });
    assert_eq!(result.as_object().unwrap().unboxed(), Some(StackValue::Int32(9)));
}

#[test]
fn test_box_through_by_ref() {
    let result = simple_test!(TypeSig::Int32, |il| {
        let local = il.declare_local(TypeSig::Int32).index();
        il.load_int32_constant(11);
        il.store_local(local);
        il.load_local_address(local);
        il.box_value(&TypeSig::Int32.by_ref()).unwrap();
        il.unbox_value(&TypeSig::Int32.by_ref()).unwrap();
        il.ret();
    });
    assert_eq!(result, StackValue::Int32(11));
}

#[test]
fn test_pointer_box_round_trip() {
    let pointer = TypeSig::UInt8.pointer();
    let boxed = simple_test!(TypeSig::Object, |il| {
        push(il, &StackValue::NativeInt(0x2000));
        il.box_value(&pointer).unwrap();
        il.ret();
    });
    assert_eq!(
        boxed.as_object().unwrap().runtime_type(),
        Some(TypeSig::Type(corlib().pointer.clone()))
    );

    let result = simple_test!(pointer.clone(), |il| {
        push(il, &StackValue::NativeInt(0x2000));
        il.box_value(&pointer).unwrap();
        il.unbox_value(&pointer).unwrap();
        il.ret();
    });
    assert_eq!(result, StackValue::NativeInt(0x2000));
}

#[test]
fn test_failed_downcast_raises_invalid_cast() {
    let exception = TypeSig::Type(corlib().exception.clone());
    let error = run(TypeSig::Object, |il| {
        il.load_string("not an exception");
        il.unbox_value(&exception).unwrap();
        il.ret();
    })
    .unwrap_err();
    assert_eq!(error.exception_type(), Some("System.InvalidCastException"));
}

#[test]
fn test_unbox_of_null_raises_null_reference() {
    let error = run(TypeSig::Int32, |il| {
        il.load_null();
        il.unbox_value(&TypeSig::Int32).unwrap();
        il.ret();
    })
    .unwrap_err();
    assert_eq!(error.exception_type(), Some("System.NullReferenceException"));
}

#[test]
fn test_array_index_is_checked() {
    let error = run(TypeSig::Int32, |il| {
        il.load_int32_constant(1);
        il.emit(OpCode::NewArr, Operand::Type(TypeSig::Int32));
        il.load_int32_constant(1);
        il.array_load(&TypeSig::Int32);
        il.ret();
    })
    .unwrap_err();
    assert_eq!(error.exception_type(), Some("System.IndexOutOfRangeException"));
}

#[test]
fn test_backward_branch_loop() {
    // counts down from 5, accumulating 5 + 4 + 3 + 2 + 1
    let result = simple_test!(TypeSig::Int32, |il| {
        let counter = il.declare_local(TypeSig::Int32).index();
        let sum = il.declare_local(TypeSig::Int32).index();
        let top = il.define_label();
        let done = il.define_label();
        il.load_int32_constant(5);
        il.store_local(counter);
        il.mark_label(top).unwrap();
        il.load_local(counter);
        il.branch(OpCode::BrFalseS, done);
        il.load_local(sum);
        il.load_local(counter);
        il.emit(OpCode::Add, Operand::None);
        il.store_local(sum);
        il.load_local(counter);
        il.load_int32_constant(-1);
        il.emit(OpCode::Add, Operand::None);
        il.store_local(counter);
        il.branch(OpCode::Br, top);
        il.mark_label(done).unwrap();
        il.load_local(sum);
        il.ret();
    });
    assert_eq!(result, StackValue::Int32(15));
}
