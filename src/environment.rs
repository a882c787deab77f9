//! Scoped environment: a tree of name scopes plus the root's host-object table.
//!
//! Mirrors the original `env_t` one-to-one at the API level, with `Rc<RefCell<_>>`
//! standing in for the owning raw pointers of the reference implementation. A scope
//! keeps its parent alive by holding a clone of it, which is what guarantees a child
//! scope can never outlive the scope it was built from.

use crate::error::{EnvError, EnvResult, VmResult};
use crate::host::InvocationContext;
use crate::value::{CodeFunctionHandle, HostFunction, Value, ValueRef};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// An opaque object the host registers with the environment under an integer handle
/// (§4.2 `insert_object`, §6.3).
pub trait HostObject: fmt::Debug {
    /// Discriminator used by hosts to downcast or describe the object.
    fn type_name(&self) -> &str;

    /// Called once, right after insertion, with the root scope that now owns the handle.
    fn set_owner(&self, _root: Scope) {}
}

/// A registered host function: the callable plus the name/notes/signatures recovered
/// from its documentation-mode dry run.
#[derive(Debug)]
pub struct HostFunctionDescriptor {
    pub callable: Rc<dyn HostFunction>,
    pub name: String,
    pub notes: String,
}

/// The interpreter front-end a real implementation of this core delegates to for
/// `Scope::call`'s tree-walking re-entry (§4.2, §9 — "only the reentrant call entry
/// uses it"). The compiler AST and its evaluator are out of scope for this crate, so
/// callers supply one of these to bridge into whatever front-end they have.
pub trait CodeFunctionRunner {
    /// Runs the function denoted by `handle` in `call_scope` (already holding `__args`
    /// and any parameters the runner itself chooses to bind), writing the return value
    /// into `result`.
    fn run(&self, handle: CodeFunctionHandle, call_scope: &Scope, result: &ValueRef) -> VmResult<()>;
}

struct ScopeInner {
    vars: HashMap<String, ValueRef>,
    funcs: HashMap<String, Rc<HostFunctionDescriptor>>,
    parent: Option<Scope>,
    /// `Some` only on the root scope; owns every handle-addressed host object.
    objects: Option<Vec<Option<Rc<dyn HostObject>>>>,
    iter_keys: Vec<String>,
    iter_pos: usize,
}

/// A lexical scope: bindings, host functions, and (at the root) the object table.
#[derive(Clone)]
pub struct Scope(Rc<RefCell<ScopeInner>>);

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Scope")
            .field("vars", &inner.vars.len())
            .field("funcs", &inner.funcs.len())
            .field("is_root", &inner.parent.is_none())
            .finish()
    }
}

impl Scope {
    /// Creates a root scope (no parent), which alone owns the object table.
    pub fn new_root() -> Self {
        Scope(Rc::new(RefCell::new(ScopeInner {
            vars: HashMap::new(),
            funcs: HashMap::new(),
            parent: None,
            objects: Some(Vec::new()),
            iter_keys: Vec::new(),
            iter_pos: 0,
        })))
    }

    /// Creates a child scope of `parent`. The child holds a clone of `parent`, so the
    /// parent cannot be dropped while any descendant scope is still alive.
    pub fn new_child(parent: &Scope) -> Self {
        Scope(Rc::new(RefCell::new(ScopeInner {
            vars: HashMap::new(),
            funcs: HashMap::new(),
            parent: Some(parent.clone()),
            objects: None,
            iter_keys: Vec::new(),
            iter_pos: 0,
        })))
    }

    pub fn parent(&self) -> Option<Scope> {
        self.0.borrow().parent.clone()
    }

    /// Walks to the root of the scope tree; the object table lives here.
    pub fn global(&self) -> Scope {
        let mut current = self.clone();
        loop {
            let next = current.0.borrow().parent.clone();
            match next {
                Some(p) => current = p,
                None => return current,
            }
        }
    }

    /// Binds `name` to `value` in this scope, dropping whatever was bound before
    /// (unless it is the very same cell).
    pub fn assign(&self, name: &str, value: ValueRef) {
        let mut inner = self.0.borrow_mut();
        if let Some(existing) = inner.vars.get(name) {
            if Rc::ptr_eq(existing, &value) {
                return;
            }
        }
        inner.vars.insert(name.to_string(), value);
    }

    pub fn unassign(&self, name: &str) {
        self.0.borrow_mut().vars.remove(name);
    }

    /// Looks up `name` in this scope, and in ancestors too when `search_parents`.
    pub fn lookup(&self, name: &str, search_parents: bool) -> Option<ValueRef> {
        let inner = self.0.borrow();
        if let Some(v) = inner.vars.get(name) {
            return Some(v.clone());
        }
        if search_parents {
            if let Some(parent) = &inner.parent {
                return parent.lookup(name, true);
            }
        }
        None
    }

    pub fn size(&self) -> usize {
        self.0.borrow().vars.len()
    }

    /// Starts (or restarts) stateful iteration over this scope's own bindings.
    pub fn first(&self) -> Option<(String, ValueRef)> {
        let mut inner = self.0.borrow_mut();
        inner.iter_keys = inner.vars.keys().cloned().collect();
        inner.iter_pos = 0;
        let key = inner.iter_keys.first().cloned()?;
        let val = inner.vars.get(&key)?.clone();
        Some((key, val))
    }

    /// Advances the iterator started by [`Scope::first`].
    pub fn next(&self) -> Option<(String, ValueRef)> {
        let mut inner = self.0.borrow_mut();
        inner.iter_pos += 1;
        let key = inner.iter_keys.get(inner.iter_pos).cloned()?;
        let val = inner.vars.get(&key)?.clone();
        Some((key, val))
    }

    /// Registers `callable` under the name it reports from a documentation-mode dry
    /// run (§6.4). Failure to document is failure to register.
    pub fn register_func(&self, callable: Rc<dyn HostFunction>) -> EnvResult<()> {
        let mut ctx = InvocationContext::for_documentation(self.clone());
        callable.invoke(&mut ctx);
        let doc = ctx.into_doc().ok_or(EnvError::UndocumentedFunction)?;
        if doc.name.is_empty() {
            return Err(EnvError::UndocumentedFunction);
        }
        let descriptor = Rc::new(HostFunctionDescriptor {
            callable,
            name: doc.name.clone(),
            notes: doc.notes,
        });
        self.0.borrow_mut().funcs.insert(doc.name, descriptor);
        Ok(())
    }

    pub fn register_funcs(&self, callables: impl IntoIterator<Item = Rc<dyn HostFunction>>) -> EnvResult<()> {
        for callable in callables {
            self.register_func(callable)?;
        }
        Ok(())
    }

    /// Searches this scope then ancestors for a registered host function.
    pub fn lookup_func(&self, name: &str) -> Option<Rc<HostFunctionDescriptor>> {
        let inner = self.0.borrow();
        if let Some(f) = inner.funcs.get(name) {
            return Some(f.clone());
        }
        inner.parent.as_ref().and_then(|p| p.lookup_func(name))
    }

    /// Appends `obj` to the root's object table, deduplicating by pointer identity,
    /// and returns its 1-based handle (0 is reserved for "none").
    pub fn insert_object(&self, obj: Rc<dyn HostObject>) -> usize {
        let root = self.global();
        let handle = {
            let mut inner = root.0.borrow_mut();
            let objects = inner.objects.as_mut().expect("root scope always owns objects");
            if let Some(pos) = objects
                .iter()
                .position(|slot| matches!(slot, Some(existing) if Rc::ptr_eq(existing, &obj)))
            {
                pos + 1
            } else {
                objects.push(Some(obj.clone()));
                objects.len()
            }
        };
        obj.set_owner(root);
        handle
    }

    /// Tombstones the object at `handle` so later handles remain stable; returns
    /// `false` if the handle was never valid or already destroyed.
    pub fn destroy_object(&self, handle: usize) -> bool {
        let root = self.global();
        let mut inner = root.0.borrow_mut();
        let objects = inner.objects.as_mut().expect("root scope always owns objects");
        if handle == 0 {
            return false;
        }
        match objects.get_mut(handle - 1) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn query_object(&self, handle: usize) -> Option<Rc<dyn HostObject>> {
        if handle == 0 {
            return None;
        }
        let root = self.global();
        let inner = root.0.borrow();
        inner
            .objects
            .as_ref()
            .expect("root scope always owns objects")
            .get(handle - 1)
            .and_then(|slot| slot.clone())
    }

    /// Reentrant `call` (§4.2): looks up `name` as a code function, builds a child
    /// scope parented to `self` populated with `__args`, and delegates to `runner`
    /// for parameter binding and evaluation, since the AST/evaluator are out of scope
    /// here. Returns `EnvError::TooFewArguments` before delegating if `runner`
    /// reports arity failure via the returned `VmResult`.
    pub fn call(
        &self,
        name: &str,
        args: &[ValueRef],
        result: &ValueRef,
        runner: &dyn CodeFunctionRunner,
    ) -> VmResult<()> {
        let target = self
            .lookup(name, true)
            .ok_or_else(|| EnvError::Unassigned(name.to_string()))?;
        let handle = {
            let resolved = Value::deref_cell(&target)?;
            let borrowed = resolved.borrow();
            borrowed
                .code_function()
                .ok_or_else(|| EnvError::NotAFunction(name.to_string()))?
        };

        let call_scope = Scope::new_child(self);
        let args_vec = Value::null();
        let args_cell = args_vec.cell();
        args_cell.borrow_mut().empty_vector()?;
        for a in args {
            let deref = Value::deref_cell(a)?;
            let copy = deref.borrow().deep_clone().cell();
            args_cell.borrow_mut().as_vector_mut().unwrap().push(copy);
        }
        call_scope.assign("__args", args_cell);

        runner.run(handle, &call_scope, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_does_not_outlive_usage_and_shadows_parent() {
        let root = Scope::new_root();
        root.assign("x", Value::new_number(1.0).cell());
        let child = Scope::new_child(&root);
        child.assign("x", Value::new_number(2.0).cell());

        assert_eq!(child.lookup("x", true).unwrap().borrow().as_number(), 2.0);
        assert_eq!(root.lookup("x", true).unwrap().borrow().as_number(), 1.0);
        assert!(child.lookup("y", true).is_none());
    }

    #[test]
    fn object_handles_are_stable_after_destroy() {
        #[derive(Debug)]
        struct Dummy;
        impl HostObject for Dummy {
            fn type_name(&self) -> &str {
                "dummy"
            }
        }

        let root = Scope::new_root();
        let a = Rc::new(Dummy);
        let b = Rc::new(Dummy);
        let ha = root.insert_object(a.clone());
        let hb = root.insert_object(b);
        assert!(root.query_object(ha).is_some());
        assert!(root.destroy_object(ha));
        assert!(root.query_object(ha).is_none());
        assert!(root.query_object(hb).is_some());
    }

    #[test]
    fn insert_object_dedups_by_identity() {
        #[derive(Debug)]
        struct Dummy;
        impl HostObject for Dummy {
            fn type_name(&self) -> &str {
                "dummy"
            }
        }
        let root = Scope::new_root();
        let a = Rc::new(Dummy);
        let h1 = root.insert_object(a.clone());
        let h2 = root.insert_object(a);
        assert_eq!(h1, h2);
    }

    #[derive(Debug)]
    struct Double;
    impl HostFunction for Double {
        fn invoke(&self, ctx: &mut InvocationContext) {
            if ctx.doc_mode() {
                ctx.document(crate::value::FunctionDoc {
                    name: "double".to_string(),
                    notes: "doubles its first argument".to_string(),
                    signatures: Vec::new(),
                });
                return;
            }
            let arg = ctx.arg(0).expect("double requires one argument");
            let doubled = arg.borrow().as_number() * 2.0;
            ctx.result().borrow_mut().assign_number(doubled).unwrap();
        }
    }

    #[test]
    fn register_func_recovers_name_and_notes_from_documentation_mode() {
        let root = Scope::new_root();
        root.register_func(Rc::new(Double)).unwrap();

        let descriptor = root.lookup_func("double").expect("registered under its documented name");
        assert_eq!(descriptor.name, "double");
        assert_eq!(descriptor.notes, "doubles its first argument");

        let result = Value::null().cell();
        let mut ctx = InvocationContext::new(root.clone(), result.clone(), vec![Value::new_number(21.0).cell()], None);
        descriptor.callable.invoke(&mut ctx);
        assert!(!ctx.has_error());
        assert_eq!(result.borrow().as_number(), 42.0);
    }

    #[test]
    fn register_func_rejects_an_undocumented_callable() {
        #[derive(Debug)]
        struct Mute;
        impl HostFunction for Mute {
            fn invoke(&self, _ctx: &mut InvocationContext) {}
        }

        let root = Scope::new_root();
        assert!(matches!(root.register_func(Rc::new(Mute)), Err(EnvError::UndocumentedFunction)));
    }

    struct SumArgs;
    impl CodeFunctionRunner for SumArgs {
        fn run(&self, _handle: CodeFunctionHandle, call_scope: &Scope, result: &ValueRef) -> VmResult<()> {
            let args = call_scope.lookup("__args", false).expect("call binds __args");
            let args = Value::deref_cell(&args)?;
            let sum: f64 = args.borrow().as_vector().unwrap().iter().map(|c| c.borrow().as_number()).sum();
            result.borrow_mut().assign_number(sum)
        }
    }

    #[test]
    fn call_binds_deep_copied_args_and_delegates_to_runner() {
        let root = Scope::new_root();
        let mut target = Value::null();
        target.assign_code_function(7).unwrap();
        root.assign("f", target.cell());

        let a = Value::new_number(1.0).cell();
        let b = Value::new_number(2.0).cell();
        let result = Value::null().cell();
        root.call("f", &[a.clone(), b], &result, &SumArgs).unwrap();
        assert_eq!(result.borrow().as_number(), 3.0);

        a.borrow_mut().assign_number(99.0).unwrap();
        assert_eq!(result.borrow().as_number(), 3.0, "__args was a deep copy, not a live reference");
    }

    #[test]
    fn call_errors_on_an_unassigned_name() {
        let root = Scope::new_root();
        let result = Value::null().cell();
        assert!(matches!(root.call("missing", &[], &result, &SumArgs), Err(crate::error::VmError::Env(EnvError::Unassigned(_)))));
    }
}
