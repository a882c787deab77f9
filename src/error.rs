//! Error types for the embervm crate.
//!
//! Errors are layered the way the engine that uses them is layered: scope-local
//! failures (`EnvError`) convert into the interpreter-wide `VmError`, which also
//! carries the instruction-level failures described for `run`.

use thiserror::Error;

/// Failures raised by [`crate::environment::Scope`] operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvError {
    /// `lookup`/`lookup_func` found nothing, including up the parent chain.
    #[error("unassigned variable: {0}")]
    Unassigned(String),

    /// A host callable did not document itself during registration.
    #[error("host function failed to document itself; not registered")]
    UndocumentedFunction,

    /// `destroy_object`/`query_object` given a handle that is not live.
    #[error("invalid object handle: {0}")]
    InvalidHandle(usize),

    /// `call` found the name but it was not bound to a code function.
    #[error("'{0}' is not a code function")]
    NotAFunction(String),

    /// `call` was given fewer arguments than the function declares.
    #[error("too few arguments provided to function: {0}")]
    TooFewArguments(String),
}

/// Result type returned by [`crate::value::Value`] and [`crate::environment::Scope`] operations.
pub type EnvResult<T> = Result<T, EnvError>;

/// VM execution errors.
///
/// Every opcode-level failure in §7 of the runtime's error model is represented here;
/// `run` never panics on a malformed program, it converts the failure into one of these
/// variants and returns it from the call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// A scope-level failure surfaced while executing an opcode.
    #[error("{0}")]
    Env(#[from] EnvError),

    /// A value-level operation rejected its operand's dynamic type.
    #[error("type error in '{op}': {reason}")]
    TypeError { op: String, reason: String },

    /// Vector/stack/constant/identifier index was out of range.
    #[error("{what} index {index} out of bounds (len {len})")]
    OutOfBounds {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// The operand stack would grow past its fixed capacity.
    #[error("stack overflow: capacity {capacity} exceeded")]
    StackOverflow { capacity: usize },

    /// An opcode needed more live operands than `sp` currently holds.
    #[error("stack underflow: needed {needed} operands, {available} available")]
    StackUnderflow { needed: usize, available: usize },

    /// A reference value dereferenced back onto itself.
    #[error("self referential reference")]
    SelfReference,

    /// Writing through a value marked constant and already assigned.
    #[error("cannot assign to constant value")]
    ConstantViolation,

    /// `ARG` fired more times than the call site supplied arguments.
    #[error("too few arguments passed to function")]
    ArityMismatch,

    /// `CALL`/`TCALL`/`RET` found the frame stack or stack pointer in an inconsistent state.
    #[error("stack corruption: {0}")]
    StackCorruption(String),

    /// `GET`/`SET` named a special variable the host does not handle.
    #[error("no mechanism to access special variable '{0}'")]
    SpecialVariableUnhandled(String),

    /// A host callable reported failure through the invocation context's error channel.
    #[error("host function error: {0}")]
    HostError(String),

    /// The low byte of an instruction word did not decode to a known opcode.
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// `run` called before `initialize`.
    #[error("vm not initialized")]
    NotInitialized,
}

/// Result type returned by [`crate::vm::VirtualMachine::run`] and value/instruction helpers.
pub type VmResult<T> = Result<T, VmError>;
