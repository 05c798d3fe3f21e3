use crate::{
    emit::{IlBody, MethodBody},
    types::{TypeDescription, TypeSig, members::MethodDescription},
    vm::{
        error::{ExecutionError, VmError, type_mismatch},
        exceptions,
        tracer::tracer,
        value::{ManagedPtr, ObjectRef, StackValue, ValueTypeInstance},
    },
};
use std::env;

const DEFAULT_MAX_CALL_DEPTH: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub max_call_depth: usize,
}

impl ExecutorConfig {
    /// Reads `DOTNET_SYNTH_MAX_CALL_DEPTH`, falling back to the default on absence or garbage.
    pub fn from_env() -> Self {
        let max_call_depth = env::var("DOTNET_SYNTH_MAX_CALL_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CALL_DEPTH);
        Self { max_call_depth }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// Runs baked method bodies. One executor per thread; the heap it touches is shared.
#[derive(Debug)]
pub struct Executor {
    config: ExecutorConfig,
    depth: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::from_env())
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        Self { config, depth: 0 }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Calls `method` non-virtually. Instance methods take `this` as the first argument.
    pub fn invoke(
        &mut self,
        method: &MethodDescription,
        args: Vec<StackValue>,
    ) -> Result<Option<StackValue>, VmError> {
        self.invoke_generic(method, &[], args)
    }

    pub fn invoke_generic(
        &mut self,
        method: &MethodDescription,
        method_args: &[TypeSig],
        args: Vec<StackValue>,
    ) -> Result<Option<StackValue>, VmError> {
        if self.depth >= self.config.max_call_depth {
            return Err(ExecutionError::CallDepthExceeded(self.depth).into());
        }
        let tracer = tracer();
        let name = if tracer.is_enabled() {
            format!("{:?}", method)
        } else {
            String::new()
        };
        tracer.trace_method_entry(self.depth, &name, "");

        self.depth += 1;
        let result = match &method.body {
            Some(MethodBody::Native(native)) => native(self, args),
            Some(MethodBody::Il(body)) => self.run(method, body, method_args, args),
            None => Err(ExecutionError::MissingBody(format!("{:?}", method)).into()),
        };
        self.depth -= 1;

        match &result {
            Err(VmError::Exception(e)) => tracer.trace_exception(self.depth, &e.type_name, &name),
            _ => tracer.trace_method_exit(self.depth, &name),
        }
        result
    }

    /// Calls `method` through the virtual table of the `this` argument.
    pub fn invoke_virtual(
        &mut self,
        method: &MethodDescription,
        args: Vec<StackValue>,
    ) -> Result<Option<StackValue>, VmError> {
        self.invoke_virtual_generic(method, &[], args)
    }

    pub fn invoke_virtual_generic(
        &mut self,
        method: &MethodDescription,
        method_args: &[TypeSig],
        args: Vec<StackValue>,
    ) -> Result<Option<StackValue>, VmError> {
        let runtime_type = match args.first() {
            Some(StackValue::ObjectRef(o)) => match o.heap() {
                Some(object) => object.dispatch_type(),
                None => return Err(exceptions::null_reference()),
            },
            // value-type receivers are never dispatched
            Some(StackValue::ManagedPtr(_)) | Some(StackValue::ValueType(_)) => {
                return self.invoke_generic(method, method_args, args);
            }
            Some(other) => return Err(type_mismatch("object reference", other)),
            None => return Err(ExecutionError::StackUnderflow.into()),
        };
        let target = resolve_virtual(&runtime_type, method)
            .filter(|m| !m.attributes.abstract_member)
            .ok_or_else(|| ExecutionError::UnresolvedVirtual {
                method: format!("{:?}", method),
                type_name: runtime_type.type_name(),
            })?;
        self.invoke_generic(&target, method_args, args)
    }

    /// Allocates an instance of the constructor's type and runs the constructor on it.
    pub fn new_object(
        &mut self,
        constructor: &MethodDescription,
        args: Vec<StackValue>,
    ) -> Result<StackValue, VmError> {
        let owner = &constructor.parent;
        if owner.is_value_type() {
            let this = ManagedPtr::slot(StackValue::ValueType(ValueTypeInstance::new(owner)));
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(StackValue::ManagedPtr(this.clone()));
            full.extend(args);
            self.invoke(constructor, full)?;
            return this.load();
        }
        let this = ObjectRef::allocate(owner);
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(StackValue::ObjectRef(this.clone()));
        full.extend(args);
        self.invoke(constructor, full)?;
        Ok(StackValue::ObjectRef(this))
    }

    fn run(
        &mut self,
        method: &MethodDescription,
        body: &IlBody,
        method_args: &[TypeSig],
        args: Vec<StackValue>,
    ) -> Result<Option<StackValue>, VmError> {
        let mut frame = super::instructions::Frame::new(method, body, method_args, args)?;
        let tracer = tracer();
        let mut ip = 0;
        loop {
            let instruction = body
                .instructions
                .get(ip)
                .ok_or(ExecutionError::InvalidIP(ip))?;
            tracer.trace_instruction(self.depth, ip, instruction);
            ip += 1;
            match self.step(&mut frame, instruction)? {
                super::instructions::Flow::Next => {}
                super::instructions::Flow::Jump(target) => ip = target,
                super::instructions::Flow::Return(value) => return Ok(value),
            }
        }
    }
}

/// Finds the implementation `t` uses for `method`: explicit override bindings first, then a
/// virtual method of the same name and shape that does not introduce a new slot. Walks from
/// `t` toward the root; `None` if nothing in the hierarchy provides one.
pub fn resolve_virtual(t: &TypeDescription, method: &MethodDescription) -> Option<MethodDescription> {
    if !method.is_virtual() {
        return Some(method.clone());
    }
    let through_interface = method.parent.is_interface();
    for ancestor in t.ancestors() {
        if let Some(m) = ancestor.methods().find(|m| m.overrides.contains(method)) {
            return Some(m);
        }
        let by_name = ancestor.methods().find(|m| {
            m == method
                || (m.is_virtual()
                    && m.same_slot_shape(method)
                    && (through_interface || !m.attributes.new_slot))
        });
        if by_name.is_some() {
            return by_name;
        }
    }
    None
}
