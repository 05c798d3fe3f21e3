//! Uniform-signature shims: `object Invoke(object target, object[] arguments)` for any
//! closed method, memoized per method for the life of the process.
use crate::{
    builder::TypeBuilder,
    emit::{InstructionEncoder, OpCode, Operand},
    error::SynthError,
    types::{
        TypeDescription, TypeSig,
        corlib::corlib,
        members::{
            Accessibility, MethodAttributes, MethodDescription, MethodSignature,
            ParameterDescription, ReturnDescription,
        },
    },
    vm::{Executor, ObjectRef, StackValue, VmError, error::type_mismatch},
};
use dashmap::DashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace};

static SHIM_CACHE: LazyLock<ShimCache> = LazyLock::new(ShimCache::new);

/// A synthesized shim together with the method it adapts.
pub struct DynamicInvoker {
    source: MethodDescription,
    host: TypeDescription,
    shim: MethodDescription,
}

impl DynamicInvoker {
    pub fn source(&self) -> &MethodDescription {
        &self.source
    }

    /// The static `Invoke` method on the synthesized host type.
    pub fn shim(&self) -> &MethodDescription {
        &self.shim
    }

    pub fn host(&self) -> &TypeDescription {
        &self.host
    }

    /// Calls the source method on `target` (null for static methods). By-ref arguments are
    /// written back into `arguments`; a void method yields null.
    pub fn invoke(&self, target: &ObjectRef, arguments: &ObjectRef) -> Result<ObjectRef, VmError> {
        self.invoke_with(&mut Executor::new(), target, arguments)
    }

    pub fn invoke_with(
        &self,
        executor: &mut Executor,
        target: &ObjectRef,
        arguments: &ObjectRef,
    ) -> Result<ObjectRef, VmError> {
        let result = executor.invoke(
            &self.shim,
            vec![target.clone().into(), arguments.clone().into()],
        )?;
        match result {
            Some(StackValue::ObjectRef(o)) => Ok(o),
            other => Err(type_mismatch("object reference", other)),
        }
    }

    pub fn bind(self: &Arc<Self>, target: ObjectRef) -> BoundInvoker {
        BoundInvoker {
            invoker: Arc::clone(self),
            target,
        }
    }

    /// The target-per-call form as a plain closure.
    pub fn to_fn(
        self: &Arc<Self>,
    ) -> impl Fn(&ObjectRef, &ObjectRef) -> Result<ObjectRef, VmError> + Send + Sync + 'static {
        let invoker = Arc::clone(self);
        move |target, arguments| invoker.invoke(target, arguments)
    }
}

/// A shim with its target fixed.
#[derive(Clone)]
pub struct BoundInvoker {
    invoker: Arc<DynamicInvoker>,
    target: ObjectRef,
}

impl BoundInvoker {
    pub fn target(&self) -> &ObjectRef {
        &self.target
    }

    pub fn invoke(&self, arguments: &ObjectRef) -> Result<ObjectRef, VmError> {
        self.invoker.invoke(&self.target, arguments)
    }

    pub fn invoke_with(
        &self,
        executor: &mut Executor,
        arguments: &ObjectRef,
    ) -> Result<ObjectRef, VmError> {
        self.invoker.invoke_with(executor, &self.target, arguments)
    }
}

/// Shims by source method. Entries are never evicted; when two threads race on the same
/// method both build, and the first insert wins.
#[derive(Default)]
pub struct ShimCache {
    shims: DashMap<MethodDescription, Arc<DynamicInvoker>>,
}

impl ShimCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ShimCache {
        &SHIM_CACHE
    }

    pub fn get_or_create(&self, method: &MethodDescription) -> Result<Arc<DynamicInvoker>, SynthError> {
        if let Some(existing) = self.shims.get(method) {
            trace!(method = ?method, "shim cache hit");
            return Ok(existing.value().clone());
        }
        let built = Arc::new(DynamicInvokeSynthesizer::synthesize(method)?);
        let entry = self.shims.entry(method.clone()).or_insert(built);
        Ok(entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.shims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shims.is_empty()
    }
}

pub struct DynamicInvokeSynthesizer;

impl DynamicInvokeSynthesizer {
    /// The process-wide shim for `method`.
    pub fn get_or_create(method: &MethodDescription) -> Result<Arc<DynamicInvoker>, SynthError> {
        ShimCache::global().get_or_create(method)
    }

    fn check_shape(method: &MethodDescription) -> Result<(), SynthError> {
        let unsupported = |reason| SynthError::UnsupportedShape {
            method: format!("{:?}", method),
            reason,
        };
        let signature = &method.signature;
        if method.has_generic_parameters()
            || method.parent.has_generic_parameters()
            || signature
                .parameters
                .iter()
                .any(|p| p.param_type.contains_generic_parameters())
            || signature
                .return_value
                .return_type
                .as_ref()
                .is_some_and(TypeSig::contains_generic_parameters)
        {
            return Err(unsupported("has unresolved generic parameters"));
        }
        if signature
            .return_value
            .return_type
            .as_ref()
            .is_some_and(TypeSig::is_by_ref)
        {
            return Err(unsupported("returns by reference"));
        }
        Ok(())
    }

    /// Builds a fresh shim without consulting the cache.
    pub fn synthesize(method: &MethodDescription) -> Result<DynamicInvoker, SynthError> {
        Self::check_shape(method)?;
        let lib = corlib();
        let owner = &method.parent;
        let signature = &method.signature;

        let mut host = TypeBuilder::new(
            Some("DynamicInvoke"),
            &format!("{}::{}${:016x}", owner.type_name(), method.name, method.token()),
            Some(&lib.object),
        )?;
        host.set_abstract(true).set_sealed(true);
        let token = host.define_method(
            "Invoke",
            MethodAttributes::static_method(Accessibility::Public),
            MethodSignature::static_member(
                ReturnDescription::of(TypeSig::Object),
                vec![
                    ParameterDescription::new("target", TypeSig::Object),
                    ParameterDescription::new("arguments", TypeSig::Object.vector()),
                ],
            ),
        )?;
        let il = host.method_mut(token)?.body();

        if signature.instance {
            let declaring = TypeSig::Type(owner.clone());
            il.load_argument(0);
            if owner.is_value_type() {
                il.emit(OpCode::Unbox, Operand::Type(declaring));
            } else if *owner != lib.object {
                il.cast_class(&declaring);
            }
        }

        let mut by_ref = vec![];
        for (index, parameter) in signature.parameters.iter().enumerate() {
            il.load_argument(1);
            il.load_int32_constant(index as i32);
            il.array_load(&TypeSig::Object);
            il.unbox_value(&parameter.param_type)?;
            if let TypeSig::ByRef(referent) = &parameter.param_type {
                let local = il.declare_local((**referent).clone()).index();
                il.store_local(local);
                il.load_local_address(local);
                by_ref.push((index, local, (**referent).clone()));
            }
        }

        if method.is_virtual() && !owner.is_value_type() {
            il.call_virtual(method);
        } else {
            il.call(method);
        }

        for (index, local, referent) in by_ref {
            il.load_argument(1);
            il.load_int32_constant(index as i32);
            il.load_local(local);
            il.box_value(&referent)?;
            il.array_store(&TypeSig::Object);
        }

        match &signature.return_value.return_type {
            None => il.load_null(),
            Some(t) => il.box_value(t)?,
        }
        il.ret();

        let host = host.bake()?;
        let shim = host
            .method("Invoke")
            .ok_or_else(|| SynthError::UnsupportedShape {
                method: format!("{:?}", method),
                reason: "lost its shim while baking",
            })?;
        debug!(method = ?method, host = %host, "synthesized dynamic-invoke shim");
        Ok(DynamicInvoker {
            source: method.clone(),
            host,
            shim,
        })
    }
}
