//! Evaluation-stack values and heap objects.
use crate::{
    emit::{FloatWidth, IntegerWidth, TypeCategory},
    types::{TypeDescription, TypeSig, corlib::corlib, members::MethodDescription},
    vm::error::{ExecutionError, VmError, type_mismatch},
};
use parking_lot::Mutex;
use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

/// A value on the evaluation stack, or in a local, argument, field or element slot.
#[derive(Clone, Debug, PartialEq)]
pub enum StackValue {
    Int32(i32),
    Int64(i64),
    NativeInt(isize),
    NativeFloat(f64),
    ObjectRef(ObjectRef),
    ManagedPtr(ManagedPtr),
    ValueType(ValueTypeInstance),
    /// The result of `ldtoken`.
    TypeHandle(TypeSig),
}

impl StackValue {
    pub fn null() -> Self {
        StackValue::ObjectRef(ObjectRef::NULL)
    }

    /// The zero value stored in a freshly allocated slot of type `t`.
    pub fn default_for(t: &TypeSig) -> Self {
        match TypeCategory::of(t) {
            TypeCategory::Signed(IntegerWidth::Eight)
            | TypeCategory::Unsigned(IntegerWidth::Eight) => StackValue::Int64(0),
            TypeCategory::Signed(IntegerWidth::Native)
            | TypeCategory::Unsigned(IntegerWidth::Native)
            | TypeCategory::Pointer
            | TypeCategory::ByRef => StackValue::NativeInt(0),
            TypeCategory::Signed(_) | TypeCategory::Unsigned(_) => StackValue::Int32(0),
            TypeCategory::Float(_) => StackValue::NativeFloat(0.0),
            TypeCategory::ValueType => match t {
                TypeSig::Type(d) => StackValue::ValueType(ValueTypeInstance::new(d)),
                _ => StackValue::null(),
            },
            TypeCategory::Reference | TypeCategory::GenericParameter => StackValue::null(),
        }
    }

    /// Normalizes a value for storage in a slot of type `t`: integers are truncated to the
    /// slot width and re-extended with the slot's signedness, `float32` is rounded.
    pub fn coerce(self, t: &TypeSig) -> Result<StackValue, VmError> {
        use IntegerWidth::*;
        use TypeCategory::*;
        Ok(match TypeCategory::of(t) {
            Signed(One) => StackValue::Int32(self.integer_bits()? as i8 as i32),
            Unsigned(One) => StackValue::Int32(self.integer_bits()? as u8 as i32),
            Signed(Two) => StackValue::Int32(self.integer_bits()? as i16 as i32),
            Unsigned(Two) => StackValue::Int32(self.integer_bits()? as u16 as i32),
            Signed(Four) | Unsigned(Four) => StackValue::Int32(self.integer_bits()? as i32),
            Signed(Eight) | Unsigned(Eight) => StackValue::Int64(self.integer_bits()?),
            Signed(Native) | Unsigned(Native) | Pointer => {
                StackValue::NativeInt(self.integer_bits()? as isize)
            }
            Float(FloatWidth::Single) => StackValue::NativeFloat(self.float()? as f32 as f64),
            Float(FloatWidth::Double) => StackValue::NativeFloat(self.float()?),
            ByRef | ValueType | GenericParameter | Reference => self,
        })
    }

    fn integer_bits(&self) -> Result<i64, VmError> {
        match *self {
            StackValue::Int32(i) => Ok(i as i64),
            StackValue::Int64(i) => Ok(i),
            StackValue::NativeInt(i) => Ok(i as i64),
            ref other => Err(type_mismatch("integer", other)),
        }
    }

    fn float(&self) -> Result<f64, VmError> {
        match *self {
            StackValue::NativeFloat(f) => Ok(f),
            ref other => Err(type_mismatch("float", other)),
        }
    }

    pub fn as_i32(&self) -> Result<i32, VmError> {
        match *self {
            StackValue::Int32(i) => Ok(i),
            StackValue::NativeInt(i) => Ok(i as i32),
            ref other => Err(type_mismatch("int32", other)),
        }
    }

    pub fn as_object(&self) -> Result<&ObjectRef, VmError> {
        match self {
            StackValue::ObjectRef(o) => Ok(o),
            other => Err(type_mismatch("object reference", other)),
        }
    }

    pub fn into_object(self) -> Result<ObjectRef, VmError> {
        match self {
            StackValue::ObjectRef(o) => Ok(o),
            other => Err(type_mismatch("object reference", other)),
        }
    }

    pub fn as_ptr(&self) -> Result<&ManagedPtr, VmError> {
        match self {
            StackValue::ManagedPtr(p) => Ok(p),
            other => Err(type_mismatch("managed pointer", other)),
        }
    }

    /// `brtrue` semantics.
    pub fn is_truthy(&self) -> bool {
        match self {
            StackValue::Int32(i) => *i != 0,
            StackValue::Int64(i) => *i != 0,
            StackValue::NativeInt(i) => *i != 0,
            StackValue::NativeFloat(f) => *f != 0.0,
            StackValue::ObjectRef(o) => !o.is_null(),
            StackValue::ManagedPtr(_) | StackValue::ValueType(_) | StackValue::TypeHandle(_) => {
                true
            }
        }
    }
}

impl From<i32> for StackValue {
    fn from(v: i32) -> Self {
        StackValue::Int32(v)
    }
}

impl From<i64> for StackValue {
    fn from(v: i64) -> Self {
        StackValue::Int64(v)
    }
}

impl From<f64> for StackValue {
    fn from(v: f64) -> Self {
        StackValue::NativeFloat(v)
    }
}

impl From<bool> for StackValue {
    fn from(v: bool) -> Self {
        StackValue::Int32(v as i32)
    }
}

impl From<ObjectRef> for StackValue {
    fn from(v: ObjectRef) -> Self {
        StackValue::ObjectRef(v)
    }
}

/// An unboxed instance of a user-defined value type.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueTypeInstance {
    pub description: TypeDescription,
    pub fields: Vec<StackValue>,
}

impl ValueTypeInstance {
    pub fn new(description: &TypeDescription) -> Self {
        Self {
            description: description.clone(),
            fields: field_defaults(description),
        }
    }
}

/// Default values for every instance field of `t`, indexed by slot.
fn field_defaults(t: &TypeDescription) -> Vec<StackValue> {
    let mut fields = vec![StackValue::null(); t.instance_field_count()];
    for ancestor in t.ancestors() {
        for f in &ancestor.fields {
            fields[f.slot] = StackValue::default_for(&f.field_type);
        }
    }
    fields
}

#[derive(Clone, Debug, PartialEq)]
pub struct DelegateEntry {
    pub target: ObjectRef,
    pub method: MethodDescription,
}

pub struct DelegateData {
    pub description: TypeDescription,
    pub invocation_list: Vec<DelegateEntry>,
}

pub enum HeapObject {
    Object {
        description: TypeDescription,
        fields: Mutex<Vec<StackValue>>,
    },
    Boxed {
        value_type: TypeSig,
        value: Mutex<StackValue>,
    },
    Vector {
        element: TypeSig,
        elements: Mutex<Vec<StackValue>>,
    },
    String(String),
    Delegate(DelegateData),
    RuntimeType(TypeSig),
    /// A raw pointer wrapped by `System.Reflection.Pointer.Box`.
    Pointer { address: isize, pointer_type: TypeSig },
}

impl HeapObject {
    pub fn runtime_type(&self) -> TypeSig {
        match self {
            HeapObject::Object { description, .. } => TypeSig::Type(description.clone()),
            HeapObject::Boxed { value_type, .. } => value_type.clone(),
            HeapObject::Vector { element, .. } => element.clone().vector(),
            HeapObject::String(_) => TypeSig::String,
            HeapObject::Delegate(d) => TypeSig::Type(d.description.clone()),
            HeapObject::RuntimeType(_) => TypeSig::Type(corlib().type_type.clone()),
            HeapObject::Pointer { .. } => TypeSig::Type(corlib().pointer.clone()),
        }
    }

    /// The type used for virtual dispatch.
    pub fn dispatch_type(&self) -> TypeDescription {
        match self {
            HeapObject::Object { description, .. } => description.clone(),
            HeapObject::Delegate(d) => d.description.clone(),
            HeapObject::String(_) => corlib().string.clone(),
            HeapObject::RuntimeType(_) => corlib().type_type.clone(),
            HeapObject::Pointer { .. } => corlib().pointer.clone(),
            HeapObject::Boxed { value_type: TypeSig::Type(t), .. } => t.clone(),
            HeapObject::Boxed { .. } => corlib().value_type.clone(),
            HeapObject::Vector { .. } => corlib().object.clone(),
        }
    }
}

/// A nullable, shared reference to a heap object. Compared by identity.
#[derive(Clone, Default)]
pub struct ObjectRef(pub Option<Arc<HeapObject>>);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(None);

    pub fn new(object: HeapObject) -> Self {
        ObjectRef(Some(Arc::new(object)))
    }

    /// A new instance of `t` with every field at its default value.
    pub fn allocate(t: &TypeDescription) -> Self {
        Self::new(HeapObject::Object {
            description: t.clone(),
            fields: Mutex::new(field_defaults(t)),
        })
    }

    pub fn string(value: &str) -> Self {
        Self::new(HeapObject::String(value.to_string()))
    }

    pub fn boxed(value_type: TypeSig, value: StackValue) -> Result<Self, VmError> {
        let value = value.coerce(&value_type)?;
        Ok(Self::new(HeapObject::Boxed {
            value_type,
            value: Mutex::new(value),
        }))
    }

    pub fn vector(element: TypeSig, elements: Vec<StackValue>) -> Self {
        Self::new(HeapObject::Vector {
            element,
            elements: Mutex::new(elements),
        })
    }

    /// A zero-initialized vector of `length` elements.
    pub fn new_vector(element: TypeSig, length: usize) -> Self {
        let zero = StackValue::default_for(&element);
        Self::vector(element, vec![zero; length])
    }

    pub fn delegate(description: &TypeDescription, target: ObjectRef, method: MethodDescription) -> Self {
        Self::new(HeapObject::Delegate(DelegateData {
            description: description.clone(),
            invocation_list: vec![DelegateEntry { target, method }],
        }))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn heap(&self) -> Option<&Arc<HeapObject>> {
        self.0.as_ref()
    }

    pub fn runtime_type(&self) -> Option<TypeSig> {
        self.0.as_deref().map(HeapObject::runtime_type)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.0.as_deref() {
            Some(HeapObject::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Copy of the boxed value, if this is a boxed value type.
    pub fn unboxed(&self) -> Option<StackValue> {
        match self.0.as_deref() {
            Some(HeapObject::Boxed { value, .. }) => Some(value.lock().clone()),
            _ => None,
        }
    }

    /// Copy of the vector's elements, if this is a vector.
    pub fn elements(&self) -> Option<Vec<StackValue>> {
        match self.0.as_deref() {
            Some(HeapObject::Vector { elements, .. }) => Some(elements.lock().clone()),
            _ => None,
        }
    }

    pub fn invocation_list(&self) -> Option<&[DelegateEntry]> {
        match self.0.as_deref() {
            Some(HeapObject::Delegate(d)) => Some(&d.invocation_list),
            _ => None,
        }
    }

    /// Reads an instance field by slot.
    pub fn field(&self, slot: usize) -> Option<StackValue> {
        match self.0.as_deref() {
            Some(HeapObject::Object { fields, .. }) => fields.lock().get(slot).cloned(),
            _ => None,
        }
    }

    pub fn set_field(&self, slot: usize, value: StackValue) -> Result<(), VmError> {
        match self.0.as_deref() {
            Some(HeapObject::Object { fields, .. }) => match fields.lock().get_mut(slot) {
                Some(f) => {
                    *f = value;
                    Ok(())
                }
                None => Err(ExecutionError::InvalidSlot(slot as u16).into()),
            },
            _ => Err(type_mismatch("object with fields", self)),
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0.as_deref() {
            None => write!(f, "null"),
            Some(HeapObject::String(s)) => write!(f, "{:?}", s),
            Some(HeapObject::Boxed { value_type, value }) => {
                write!(f, "box {}({:?})", value_type, value.lock())
            }
            Some(o) => write!(f, "{}@{:#x}", o.runtime_type(), self.address()),
        }
    }
}

impl ObjectRef {
    fn address(&self) -> usize {
        self.0.as_ref().map_or(0, |a| Arc::as_ptr(a) as usize)
    }
}

/// Whether a value of runtime type `actual` may be viewed as `target`.
pub fn is_assignable(actual: &TypeSig, target: &TypeSig) -> bool {
    if actual == target {
        return true;
    }
    let lib = corlib();
    match (actual, target) {
        (_, TypeSig::Object) => true,
        (_, TypeSig::Type(t)) if *t == lib.object => true,
        (TypeSig::Type(a), TypeSig::Type(b)) => a.is_subtype_of(b),
        (TypeSig::Vector(a), TypeSig::Vector(b)) => {
            !a.is_value_type() && !b.is_value_type() && is_assignable(a, b)
        }
        (a, TypeSig::Type(t)) if *t == lib.value_type => a.is_value_type(),
        _ => false,
    }
}

/// Whether a boxed `boxed` may be unboxed as `target`: identical, or sharing an enum's
/// underlying type.
pub fn is_unbox_compatible(boxed: &TypeSig, target: &TypeSig) -> bool {
    fn underlying(t: &TypeSig) -> &TypeSig {
        match t {
            TypeSig::Type(d) => d.is_enum().unwrap_or(t),
            _ => t,
        }
    }
    boxed == target || underlying(boxed) == underlying(target)
}

/// Address of a storage location.
#[derive(Clone)]
pub enum ManagedPtr {
    /// A local or argument slot.
    Slot(Arc<Mutex<StackValue>>),
    Field { object: Arc<HeapObject>, slot: usize },
    Element { array: Arc<HeapObject>, index: usize },
    /// The interior of a boxed value.
    Boxed(Arc<HeapObject>),
    /// A field of a value type reached through another pointer.
    Nested { container: Box<ManagedPtr>, slot: usize },
}

impl ManagedPtr {
    pub fn slot(value: StackValue) -> Self {
        ManagedPtr::Slot(Arc::new(Mutex::new(value)))
    }

    /// Runs `f` on the target location while holding the lock that guards it.
    pub fn update<R>(&self, f: impl FnOnce(&mut StackValue) -> R) -> Result<R, VmError> {
        let mut f = Some(f);
        let mut result = None;
        self.visit(&mut |v| {
            if let Some(f) = f.take() {
                result = Some(f(v));
            }
            Ok(())
        })?;
        result.ok_or_else(|| type_mismatch("resolvable location", self))
    }

    fn visit(
        &self,
        f: &mut dyn FnMut(&mut StackValue) -> Result<(), VmError>,
    ) -> Result<(), VmError> {
        match self {
            ManagedPtr::Slot(s) => f(&mut s.lock()),
            ManagedPtr::Field { object, slot } => match &**object {
                HeapObject::Object { fields, .. } => match fields.lock().get_mut(*slot) {
                    Some(v) => f(v),
                    None => Err(ExecutionError::InvalidSlot(*slot as u16).into()),
                },
                _ => Err(type_mismatch("object with fields", self)),
            },
            ManagedPtr::Element { array, index } => match &**array {
                HeapObject::Vector { elements, .. } => match elements.lock().get_mut(*index) {
                    Some(v) => f(v),
                    None => Err(ExecutionError::InvalidSlot(*index as u16).into()),
                },
                _ => Err(type_mismatch("vector", self)),
            },
            ManagedPtr::Boxed(object) => match &**object {
                HeapObject::Boxed { value, .. } => f(&mut value.lock()),
                _ => Err(type_mismatch("boxed value", self)),
            },
            ManagedPtr::Nested { container, slot } => container.visit(&mut |outer| match outer {
                StackValue::ValueType(v) => match v.fields.get_mut(*slot) {
                    Some(field) => f(field),
                    None => Err(ExecutionError::InvalidSlot(*slot as u16).into()),
                },
                other => Err(type_mismatch("value type", &*other)),
            }),
        }
    }

    pub fn load(&self) -> Result<StackValue, VmError> {
        self.update(|v| v.clone())
    }

    pub fn store(&self, value: StackValue) -> Result<(), VmError> {
        self.update(|v| *v = value)
    }

    /// Atomically replaces the target with `value` if it equals `comparand`; returns the
    /// original value either way.
    pub fn compare_exchange(
        &self,
        value: StackValue,
        comparand: &StackValue,
    ) -> Result<StackValue, VmError> {
        self.update(|v| {
            let original = v.clone();
            if original == *comparand {
                *v = value;
            }
            original
        })
    }
}

impl PartialEq for ManagedPtr {
    fn eq(&self, other: &Self) -> bool {
        use ManagedPtr::*;
        match (self, other) {
            (Slot(a), Slot(b)) => Arc::ptr_eq(a, b),
            (Field { object: a, slot: s }, Field { object: b, slot: t }) => {
                Arc::ptr_eq(a, b) && s == t
            }
            (Element { array: a, index: i }, Element { array: b, index: j }) => {
                Arc::ptr_eq(a, b) && i == j
            }
            (Boxed(a), Boxed(b)) => Arc::ptr_eq(a, b),
            (Nested { container: a, slot: s }, Nested { container: b, slot: t }) => {
                a == b && s == t
            }
            _ => false,
        }
    }
}

impl Debug for ManagedPtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManagedPtr::Slot(s) => write!(f, "&slot@{:#x}", Arc::as_ptr(s) as usize),
            ManagedPtr::Field { object, slot } => {
                write!(f, "&{}.field[{}]", object.runtime_type(), slot)
            }
            ManagedPtr::Element { index, .. } => write!(f, "&element[{}]", index),
            ManagedPtr::Boxed(object) => write!(f, "&unbox {}", object.runtime_type()),
            ManagedPtr::Nested { container, slot } => write!(f, "{:?}.field[{}]", container, slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_truncates_and_extends() {
        assert_eq!(StackValue::Int32(0x1FF).coerce(&TypeSig::Int8).unwrap(), StackValue::Int32(-1));
        assert_eq!(StackValue::Int32(-1).coerce(&TypeSig::UInt8).unwrap(), StackValue::Int32(255));
        assert_eq!(StackValue::Int32(-1).coerce(&TypeSig::Char).unwrap(), StackValue::Int32(0xFFFF));
        assert_eq!(StackValue::Int32(-3).coerce(&TypeSig::Int64).unwrap(), StackValue::Int64(-3));
        assert_eq!(
            StackValue::NativeFloat(0.1).coerce(&TypeSig::Float32).unwrap(),
            StackValue::NativeFloat(0.1f32 as f64)
        );
        assert!(StackValue::null().coerce(&TypeSig::Int32).is_err());
    }

    #[test]
    fn test_object_identity() {
        let a = ObjectRef::string("x");
        let b = ObjectRef::string("x");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(ObjectRef::NULL, ObjectRef::default());
    }

    #[test]
    fn test_compare_exchange_only_swaps_on_match() {
        let p = ManagedPtr::slot(StackValue::Int32(1));
        let seen = p.compare_exchange(StackValue::Int32(5), &StackValue::Int32(2)).unwrap();
        assert_eq!(seen, StackValue::Int32(1));
        assert_eq!(p.load().unwrap(), StackValue::Int32(1));
        let seen = p.compare_exchange(StackValue::Int32(5), &StackValue::Int32(1)).unwrap();
        assert_eq!(seen, StackValue::Int32(1));
        assert_eq!(p.load().unwrap(), StackValue::Int32(5));
    }

    #[test]
    fn test_field_pointer_writes_through() {
        let lib = corlib();
        let e = ObjectRef::allocate(&lib.exception);
        let slot = lib.exception_message.slot;
        let p = ManagedPtr::Field {
            object: e.heap().unwrap().clone(),
            slot,
        };
        p.store(ObjectRef::string("boom").into()).unwrap();
        assert_eq!(e.field(slot).unwrap().as_object().unwrap().as_str(), Some("boom"));
    }

    #[test]
    fn test_assignability() {
        let lib = corlib();
        let nie = TypeSig::Type(lib.not_implemented_exception.clone());
        let ex = TypeSig::Type(lib.exception.clone());
        assert!(is_assignable(&nie, &ex));
        assert!(!is_assignable(&ex, &nie));
        assert!(is_assignable(&TypeSig::String, &TypeSig::Object));
        assert!(is_assignable(&TypeSig::String.vector(), &TypeSig::Object.vector()));
        assert!(!is_assignable(&TypeSig::Int32.vector(), &TypeSig::Object.vector()));
        assert!(is_unbox_compatible(&TypeSig::Int32, &TypeSig::Int32));
        assert!(!is_unbox_compatible(&TypeSig::Int32, &TypeSig::Int64));
    }
}
