//! Host-call boundary: the context passed to a [`crate::value::HostFunction`] on every
//! invocation, including the documentation-mode dry run used to discover its name.

use crate::environment::Scope;
use crate::value::{FunctionDoc, Value, ValueRef};
use std::any::Any;
use std::rc::Rc;

/// Everything a host function sees when it is called, in either documentation mode
/// or a real invocation (§6.2, §6.4).
#[derive(Debug)]
pub struct InvocationContext {
    env: Scope,
    result: ValueRef,
    args: Vec<ValueRef>,
    user_data: Option<Rc<dyn Any>>,
    error: Option<String>,
    doc_mode: bool,
    doc: Option<FunctionDoc>,
}

impl InvocationContext {
    /// Builds a context for a real call.
    pub fn new(env: Scope, result: ValueRef, args: Vec<ValueRef>, user_data: Option<Rc<dyn Any>>) -> Self {
        InvocationContext {
            env,
            result,
            args,
            user_data,
            error: None,
            doc_mode: false,
            doc: None,
        }
    }

    /// Builds a context for the documentation-mode dry run used by `register_func`.
    pub fn for_documentation(env: Scope) -> Self {
        InvocationContext {
            env,
            result: Value::null().cell(),
            args: Vec::new(),
            user_data: None,
            error: None,
            doc_mode: true,
            doc: None,
        }
    }

    pub fn doc_mode(&self) -> bool {
        self.doc_mode
    }

    /// Publishes this function's description. Only meaningful in documentation mode.
    pub fn document(&mut self, doc: FunctionDoc) {
        self.doc = Some(doc);
    }

    pub fn into_doc(self) -> Option<FunctionDoc> {
        self.doc
    }

    pub fn env(&self) -> &Scope {
        &self.env
    }

    pub fn result(&self) -> &ValueRef {
        &self.result
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Dereferenced argument at `idx`; out-of-range is reported the same way a real
    /// call reports any other failure (§6.2: "out-of-range is an error").
    pub fn arg(&self, idx: usize) -> Option<ValueRef> {
        self.args.get(idx).cloned()
    }

    pub fn user_data(&self) -> Option<&Rc<dyn Any>> {
        self.user_data.as_ref()
    }

    pub fn set_error<S: Into<String>>(&mut self, message: S) {
        self.error = Some(message.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }
}
