use crate::interpreter::{self, RuntimeError};
use crate::op::Width;
use crate::vm::Vm;

/// A host callback invokable from bytecode via `EXTERN`. Callbacks run
/// synchronously; the engine does not resume until they return.
pub type ExternFn = fn(&mut ExternCall<'_>) -> Result<(), RuntimeError>;

/// One registered callback, addressed by its composite key.
#[derive(Clone, Copy)]
pub struct ExtensionEntry {
    pub namespace: u8,
    pub method: u8,
    pub func: ExternFn,
}

/// Host extension table. Entries persist for the life of the instance,
/// across `reset`. Lookup is first-match on `(namespace, method)`, so a
/// duplicate registration is a dead entry rather than a shadowing one.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: Vec<ExtensionEntry>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, namespace: u8, method: u8, func: ExternFn) {
        self.entries.push(ExtensionEntry {
            namespace,
            method,
            func,
        });
    }

    /// Register a batch of callbacks under one namespace, assigning method
    /// ids sequentially starting at 1.
    pub fn register_namespace(&mut self, namespace: u8, callbacks: &[ExternFn]) {
        for (i, &func) in callbacks.iter().enumerate() {
            self.register(namespace, i as u8 + 1, func);
        }
    }

    pub fn lookup(&self, namespace: u8, method: u8) -> Option<ExternFn> {
        self.entries
            .iter()
            .find(|e| e.namespace == namespace && e.method == method)
            .map(|e| e.func)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The handle an extension callback receives. Exposes exactly the surface
/// the engine grants host code: popping typed arguments, heap access,
/// storing strings into the heap, and declaring a typed result for the
/// engine to push after the callback returns.
pub struct ExternCall<'a> {
    vm: &'a mut Vm,
    result: Option<(u32, Width)>,
}

impl<'a> ExternCall<'a> {
    pub(crate) fn new(vm: &'a mut Vm) -> Self {
        Self { vm, result: None }
    }

    /// Pop one argument of the given width off the operand stack.
    pub fn pop_arg(&mut self, width: Width) -> Result<u32, RuntimeError> {
        interpreter::pop(self.vm, width)
    }

    /// Read a sized value at a logical heap offset.
    pub fn heap_load(&self, width: Width, offset: usize) -> u32 {
        let addr = self.vm.memory.heap_address(offset);
        self.vm.memory.load(width, addr)
    }

    /// Write a sized value at a logical heap offset, moving the `rhp`
    /// watermark.
    pub fn heap_store(&mut self, width: Width, offset: usize, value: u32) {
        interpreter::heap_store(self.vm, width, offset, value);
    }

    /// Store a NUL-terminated string into the heap starting at `offset`.
    pub fn store_string(&mut self, offset: usize, s: &str) {
        for (i, byte) in s.bytes().enumerate() {
            interpreter::heap_store(self.vm, Width::W8, offset + i, u32::from(byte));
        }
        interpreter::heap_store(self.vm, Width::W8, offset + s.len(), 0);
    }

    /// Declare the value the engine should push once the callback returns.
    pub fn set_result(&mut self, value: u32, width: Width) {
        self.result = Some((value, width));
    }
}

/// `EXTERN` dispatch: resolve the composite key, run the callback, push its
/// declared result if any.
pub(crate) fn dispatch(vm: &mut Vm, namespace: u8, method: u8) -> Result<(), RuntimeError> {
    let func = vm
        .extensions
        .lookup(namespace, method)
        .ok_or(RuntimeError::UnknownExtern { namespace, method })?;

    let result = {
        let mut call = ExternCall::new(vm);
        func(&mut call)?;
        call.result
    };

    if let Some((value, width)) = result {
        interpreter::push(vm, width, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nothing(_call: &mut ExternCall<'_>) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn also_nothing(_call: &mut ExternCall<'_>) -> Result<(), RuntimeError> {
        Ok(())
    }

    #[test]
    fn namespace_method_ids_start_at_one() {
        let mut registry = ExtensionRegistry::new();
        registry.register_namespace(3, &[nothing as ExternFn, also_nothing as ExternFn]);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(3, 0).is_none());
        assert!(registry.lookup(3, 1).is_some());
        assert!(registry.lookup(3, 2).is_some());
        assert!(registry.lookup(3, 3).is_none());
        assert!(registry.lookup(4, 1).is_none());
    }

    #[test]
    fn duplicate_keys_resolve_to_first_registration() {
        let mut registry = ExtensionRegistry::new();
        registry.register(1, 1, nothing);
        registry.register(1, 1, also_nothing);
        let found = registry.lookup(1, 1).unwrap();
        assert!(std::ptr::fn_addr_eq(found, nothing as ExternFn));
    }
}
