//! # embervm
//!
//! Runtime core for an embeddable, dynamically-typed scripting language: a tagged
//! value model, a lexical environment of scopes, and a stack-based bytecode VM.
//!
//! This crate does not include a parser, compiler, or AST evaluator — it is the
//! runtime layer a front-end targets. Front-ends supply bytecode (`Vec<u32>`), a
//! constant pool, an identifier table, and optional debug-line info; embedders
//! supply host functions, host objects, and (optionally) handlers for the VM's
//! `GET`/`SET` special-variable opcodes and for the tree-walking re-entry used by
//! [`environment::Scope::call`].
//!
//! ## Architecture
//!
//! - [`value`] — the tagged [`value::Value`] datum and its `Rc<RefCell<_>>` cells
//! - [`environment`] — [`environment::Scope`], the lexical scope tree and host-object table
//! - [`host`] — [`host::InvocationContext`], the boundary host functions are called through
//! - [`instruction`] — the fixed-width bytecode instruction encoding
//! - [`frame`] — call-frame bookkeeping for the interpreter loop
//! - [`config`] — embedder-facing construction knobs
//! - [`vm`] — [`vm::VirtualMachine`], the opcode dispatch loop
//! - [`error`] — the crate's layered error types

pub mod config;
pub mod environment;
pub mod error;
pub mod frame;
pub mod host;
pub mod instruction;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use environment::{CodeFunctionRunner, HostFunctionDescriptor, HostObject, Scope};
pub use error::{EnvError, EnvResult, VmError, VmResult};
pub use host::InvocationContext;
pub use instruction::{Instruction, OpCode};
pub use value::{CodeFunctionHandle, FunctionDoc, HostFunction, Value, ValueFlags, ValueRef, ValueType};
pub use vm::{DebugPos, RunMode, SpecialVariables, VirtualMachine};
