//! Call-frame bookkeeping for the interpreter loop (§3.3, §4.3.4).

use crate::environment::Scope;

/// One active invocation: the scope it owns and the bookkeeping needed to bind
/// arguments and clean up the stack on return.
#[derive(Debug)]
pub struct CallFrame {
    /// Child scope created for this call; parented to the caller's scope.
    pub scope: Scope,
    /// Stack index at the call site, used as the base for `ARG`'s offset arithmetic
    /// and as the cleanup target for `RET`.
    pub fp: usize,
    /// Program address to resume at once this frame returns.
    pub return_address: usize,
    /// Argument count this call was made with.
    pub nargs: u32,
    /// Index of the next argument `ARG` will bind.
    pub arg_index: u32,
    /// Set for `TCALL`; shifts the `ARG`/`RET` offset arithmetic by one slot for `this`.
    pub this_call: bool,
}

impl CallFrame {
    pub fn root(scope: Scope) -> Self {
        CallFrame {
            scope,
            fp: 0,
            return_address: 0,
            nargs: 0,
            arg_index: 0,
            this_call: false,
        }
    }

    pub fn call(scope: Scope, fp: usize, return_address: usize, nargs: u32, this_call: bool) -> Self {
        CallFrame {
            scope,
            fp,
            return_address,
            nargs,
            arg_index: 0,
            this_call,
        }
    }
}
