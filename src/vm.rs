//! The stack-based bytecode interpreter (§3.3, §4.3): operand stack, call frames,
//! and the opcode dispatch loop.

use crate::config::VmConfig;
use crate::environment::Scope;
use crate::error::{EnvError, VmError, VmResult};
use crate::frame::CallFrame;
use crate::host::InvocationContext;
use crate::instruction::{Instruction, OpCode};
use crate::value::{Value, ValueFlags, ValueRef};
use log::{trace, warn};

/// One (source file, line) pair, parallel to `program` (§6.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugPos {
    pub file: String,
    pub line: u32,
}

/// How far `run` should advance before returning (§4.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run to completion (or error, or a debug-mode break).
    Normal,
    /// Execute exactly one instruction then return.
    SingleStep,
    /// Run until an instruction whose debug line equals `break_line`, or completion.
    Debug,
}

/// Hook for the `GET`/`SET` opcodes' "special variable" mechanism (§4.3.3). With no
/// handler installed every `GET`/`SET` is a [`VmError::SpecialVariableUnhandled`].
pub trait SpecialVariables {
    fn get(&mut self, name: &str) -> VmResult<Value>;
    fn set(&mut self, name: &str, value: &Value) -> VmResult<()>;
}

/// The bytecode interpreter: immutable program/constant/identifier/debug tables,
/// a fixed-capacity operand stack, and a non-empty stack of call frames once
/// [`VirtualMachine::initialize`] has run.
pub struct VirtualMachine {
    program: Vec<u32>,
    constants: Vec<Value>,
    identifiers: Vec<String>,
    debug: Vec<DebugPos>,
    stack: Vec<ValueRef>,
    sp: usize,
    ip: usize,
    frames: Vec<CallFrame>,
    break_line: u32,
    config: VmConfig,
    special: Option<Box<dyn SpecialVariables>>,
    error: Option<VmError>,
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> Self {
        let stack = (0..config.stack_capacity).map(|_| Value::null().cell()).collect();
        VirtualMachine {
            program: Vec::new(),
            constants: Vec::new(),
            identifiers: Vec::new(),
            debug: Vec::new(),
            stack,
            sp: 0,
            ip: 0,
            frames: Vec::new(),
            break_line: 0,
            config,
            special: None,
            error: None,
        }
    }

    pub fn set_special_variables(&mut self, handler: Box<dyn SpecialVariables>) {
        self.special = Some(handler);
    }

    /// Replaces program state and drops all frames (§4.3.1).
    pub fn load(&mut self, program: Vec<u32>, constants: Vec<Value>, identifiers: Vec<String>, debug: Vec<DebugPos>) {
        self.program = program;
        self.constants = constants;
        self.identifiers = identifiers;
        self.debug = debug;
        self.frames.clear();
    }

    /// Clears the stack, resets `ip`/`sp`, pushes a single root frame parented to
    /// `env`, and clears the break line (§4.3.1).
    pub fn initialize(&mut self, env: Scope) {
        for cell in &self.stack {
            cell.borrow_mut().nullify();
        }
        self.sp = 0;
        self.ip = 0;
        self.break_line = 0;
        let root_scope = Scope::new_child(&env);
        self.frames.clear();
        self.frames.push(CallFrame::root(root_scope));
    }

    /// Sets `break_line` to the smallest debug line >= `line`; returns it, or -1 if
    /// no instruction has a line that large (§4.3.1).
    pub fn setbrk(&mut self, line: u32) -> i32 {
        for pos in &self.debug {
            if pos.line >= line {
                self.break_line = pos.line;
                return pos.line as i32;
            }
        }
        -1
    }

    pub fn error(&self) -> Option<&VmError> {
        self.error.as_ref()
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Reads the live stack slot `i` (`0 <= i < sp`), dereferencing it.
    pub fn stack_value(&self, i: usize) -> VmResult<ValueRef> {
        if i >= self.sp {
            return Err(VmError::OutOfBounds { what: "stack", index: i, len: self.sp });
        }
        Value::deref_cell(&self.stack[i])
    }

    pub fn root_scope(&self) -> Option<&Scope> {
        self.frames.first().map(|f| &f.scope)
    }

    /// Runs until the program ends, an error occurs, or (in debug mode) a matching
    /// break line is hit. Returns `true` on success (including a matched break or a
    /// completed single step); on `false` the error is available from [`Self::error`]
    /// and the stack/frames remain inspectable (§4.3.5, §7).
    pub fn run(&mut self, mode: RunMode) -> bool {
        self.error = None;
        match self.run_inner(mode) {
            Ok(()) => true,
            Err(err) => {
                warn!("vm fault at ip={}: {err}", self.ip);
                self.error = Some(err);
                false
            }
        }
    }

    fn run_inner(&mut self, mode: RunMode) -> VmResult<()> {
        if self.frames.is_empty() {
            return Err(VmError::NotInitialized);
        }
        let code_len = self.program.len();
        let mut executed = 0usize;
        while self.ip < code_len {
            if mode == RunMode::Debug && self.at_break_line() {
                return Ok(());
            }
            self.step()?;
            executed += 1;
            if mode == RunMode::SingleStep && executed > 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    fn at_break_line(&self) -> bool {
        if self.config.break_line_zero_is_none && self.break_line == 0 {
            return false;
        }
        self.debug.get(self.ip).map(|d| d.line == self.break_line).unwrap_or(false)
    }

    // --- stack helpers ---------------------------------------------------------

    fn check_overflow(&self) -> VmResult<()> {
        if self.sp >= self.stack.len() {
            Err(VmError::StackOverflow { capacity: self.stack.len() })
        } else {
            Ok(())
        }
    }

    fn check_args(&self, needed: usize) -> VmResult<()> {
        if self.sp < needed {
            Err(VmError::StackUnderflow { needed, available: self.sp })
        } else {
            Ok(())
        }
    }

    fn push_value(&mut self, v: Value) -> VmResult<()> {
        self.check_overflow()?;
        *self.stack[self.sp].borrow_mut() = v;
        self.sp += 1;
        Ok(())
    }

    fn rhs_cell(&self) -> ValueRef {
        self.stack[self.sp - 1].clone()
    }

    fn lhs_cell(&self) -> ValueRef {
        self.stack[self.sp - 2].clone()
    }

    fn identifier(&self, arg: u32) -> VmResult<String> {
        self.identifiers
            .get(arg as usize)
            .cloned()
            .ok_or(VmError::OutOfBounds { what: "identifier", index: arg as usize, len: self.identifiers.len() })
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("run_inner guarantees at least one frame")
    }

    fn current_scope(&self) -> Scope {
        self.current_frame().scope.clone()
    }

    // --- dispatch ----------------------------------------------------------

    fn step(&mut self) -> VmResult<()> {
        let word = self.program[self.ip];
        let Instruction { opcode, arg } = Instruction::decode(word)?;
        trace!("ip={} op={} arg={}", self.ip, opcode.mnemonic(), arg);
        let mut next_ip = self.ip + 1;

        match opcode {
            OpCode::Psh => {
                let idx = arg as usize;
                let src = self
                    .constants
                    .get(idx)
                    .ok_or(VmError::OutOfBounds { what: "constant", index: idx, len: self.constants.len() })?;
                let mut v = Value::null();
                v.deep_copy_from(src)?;
                self.push_value(v)?;
            }
            OpCode::Pop => {
                self.check_args(1)?;
                self.sp -= 1;
            }
            OpCode::Nul => {
                self.push_value(Value::null())?;
            }
            OpCode::Dup => {
                self.check_args(1)?;
                let top = Value::deref_cell(&self.rhs_cell())?;
                let copy = top.borrow().deep_clone();
                self.push_value(copy)?;
            }
            OpCode::J => {
                next_ip = arg as usize;
            }
            OpCode::Jt => {
                self.check_args(1)?;
                let truthy = Value::deref_cell(&self.rhs_cell())?.borrow().as_boolean();
                if truthy {
                    next_ip = arg as usize;
                }
                self.sp -= 1;
            }
            OpCode::Jf => {
                self.check_args(1)?;
                let truthy = Value::deref_cell(&self.rhs_cell())?.borrow().as_boolean();
                if !truthy {
                    next_ip = arg as usize;
                }
                self.sp -= 1;
            }
            OpCode::Rref | OpCode::Nref | OpCode::Cref => {
                self.resolve_ref(opcode, arg)?;
            }
            OpCode::Fref => {
                let mut v = Value::null();
                v.assign_internal_function(arg)?;
                self.push_value(v)?;
            }
            OpCode::Get => {
                let name = self.identifier(arg)?;
                let handler = self
                    .special
                    .as_deref_mut()
                    .ok_or_else(|| VmError::SpecialVariableUnhandled(name.clone()))?;
                let value = handler.get(&name)?;
                self.push_value(value)?;
            }
            OpCode::Set => {
                self.check_args(1)?;
                let name = self.identifier(arg)?;
                let value = Value::deref_cell(&self.rhs_cell())?.borrow().deep_clone();
                let handler = self
                    .special
                    .as_deref_mut()
                    .ok_or_else(|| VmError::SpecialVariableUnhandled(name.clone()))?;
                handler.set(&name, &value)?;
                self.sp -= 1;
            }
            OpCode::Typ => {
                let name = self.identifier(arg)?;
                let type_str = match self.current_scope().lookup(&name, true) {
                    Some(cell) => Value::deref_cell(&cell)?.borrow().type_str(),
                    None => "unknown",
                };
                self.push_value(Value::new_string(type_str))?;
            }
            OpCode::Add => {
                self.check_args(2)?;
                let lhs = Value::deref_cell(&self.lhs_cell())?;
                let rhs = Value::deref_cell(&self.rhs_cell())?;
                let is_string = lhs.borrow().value_type() == crate::value::ValueType::String
                    || rhs.borrow().value_type() == crate::value::ValueType::String;
                let result = if is_string {
                    Value::new_string(format!("{}{}", lhs.borrow().as_string(), rhs.borrow().as_string()))
                } else {
                    Value::new_number(lhs.borrow().as_number() + rhs.borrow().as_number())
                };
                *self.lhs_cell().borrow_mut() = result;
                self.sp -= 1;
            }
            OpCode::Sub => self.numeric_binop(|a, b| a - b)?,
            OpCode::Mul => self.numeric_binop(|a, b| a * b)?,
            OpCode::Exp => self.numeric_binop(|a, b| a.powf(b))?,
            OpCode::Div => self.numeric_binop(|a, b| a / b)?,
            OpCode::Lt => self.compare_binop(|lhs, rhs| lhs.less_than(rhs))?,
            OpCode::Le => self.compare_binop(|lhs, rhs| lhs.less_than(rhs) || lhs.equals(rhs))?,
            OpCode::Gt => self.compare_binop(|lhs, rhs| !lhs.less_than(rhs) && !lhs.equals(rhs))?,
            OpCode::Ge => self.compare_binop(|lhs, rhs| !lhs.less_than(rhs))?,
            OpCode::Eq => self.compare_binop(|lhs, rhs| lhs.equals(rhs))?,
            OpCode::Ne => self.compare_binop(|lhs, rhs| !lhs.equals(rhs))?,
            OpCode::And => {
                self.check_args(2)?;
                let lhs = Value::deref_cell(&self.lhs_cell())?.borrow().as_number() as i64;
                let rhs = Value::deref_cell(&self.rhs_cell())?.borrow().as_number() as i64;
                *self.lhs_cell().borrow_mut() = Value::new_number(if lhs != 0 && rhs != 0 { 1.0 } else { 0.0 });
                self.sp -= 1;
            }
            OpCode::Or => {
                self.check_args(2)?;
                let lhs = Value::deref_cell(&self.lhs_cell())?.borrow().as_number() as i64;
                let rhs = Value::deref_cell(&self.rhs_cell())?.borrow().as_number() as i64;
                *self.lhs_cell().borrow_mut() = Value::new_number(if lhs != 0 || rhs != 0 { 1.0 } else { 0.0 });
                self.sp -= 1;
            }
            OpCode::Not => {
                self.check_args(1)?;
                let n = Value::deref_cell(&self.rhs_cell())?.borrow().as_number();
                *self.rhs_cell().borrow_mut() = Value::new_number(if n != 0.0 { 0.0 } else { 1.0 });
            }
            OpCode::Neg => {
                self.check_args(1)?;
                let n = Value::deref_cell(&self.rhs_cell())?.borrow().as_number();
                *self.rhs_cell().borrow_mut() = Value::new_number(-n);
            }
            OpCode::Inc => {
                self.check_args(1)?;
                let target = Value::deref_cell(&self.rhs_cell())?;
                let n = target.borrow().as_number();
                target.borrow_mut().assign_number(n + 1.0)?;
            }
            OpCode::Dec => {
                self.check_args(1)?;
                let target = Value::deref_cell(&self.rhs_cell())?;
                let n = target.borrow().as_number();
                target.borrow_mut().assign_number(n - 1.0)?;
            }
            OpCode::Idx => {
                self.check_args(2)?;
                let index = Value::deref_cell(&self.rhs_cell())?.borrow().as_unsigned();
                let container = Value::deref_cell(&self.lhs_cell())?;
                let mutable = arg != 0;
                if mutable {
                    let needs_vector = !matches!(container.borrow().value_type(), crate::value::ValueType::Vector);
                    let too_short = container.borrow().as_vector().map(|v| v.len() <= index).unwrap_or(true);
                    if needs_vector || too_short {
                        container.borrow_mut().resize(index + 1)?;
                    }
                }
                let element = container.borrow().index(index)?;
                let mut reference = Value::null();
                reference.assign_reference(element)?;
                *self.lhs_cell().borrow_mut() = reference;
                self.sp -= 1;
            }
            OpCode::Key => {
                self.check_args(2)?;
                let key = Value::deref_cell(&self.rhs_cell())?.borrow().as_string();
                let container = Value::deref_cell(&self.lhs_cell())?;
                let mutable = arg != 0;
                if mutable && !matches!(container.borrow().value_type(), crate::value::ValueType::Table) {
                    container.borrow_mut().empty_table()?;
                }
                let element = {
                    let existing = container.borrow().lookup(&key);
                    match existing {
                        Some(cell) => cell,
                        None => container.borrow_mut().hash_item(&key)?,
                    }
                };
                let mut reference = Value::null();
                reference.assign_reference(element)?;
                *self.lhs_cell().borrow_mut() = reference;
                self.sp -= 1;
            }
            OpCode::Mat => {
                self.check_args(2)?;
                let selector = Value::deref_cell(&self.rhs_cell())?.borrow().deep_clone();
                let container = Value::deref_cell(&self.lhs_cell())?;
                container.borrow_mut().remove(&selector)?;
                self.sp -= 1;
            }
            OpCode::Wat => {
                self.check_args(2)?;
                let needle = Value::deref_cell(&self.rhs_cell())?;
                let haystack = Value::deref_cell(&self.lhs_cell())?;
                let result = self.membership(&haystack.borrow(), &needle.borrow())?;
                *self.lhs_cell().borrow_mut() = Value::new_number(result);
                self.sp -= 1;
            }
            OpCode::Sz => {
                self.check_args(1)?;
                let target = Value::deref_cell(&self.rhs_cell())?;
                let n = self.size_of(&target.borrow())?;
                *self.rhs_cell().borrow_mut() = Value::new_number(n as f64);
            }
            OpCode::Keys => {
                self.check_args(1)?;
                let target = Value::deref_cell(&self.rhs_cell())?;
                let borrowed = target.borrow();
                let table = borrowed.as_table().ok_or_else(|| VmError::TypeError {
                    op: "keys".into(),
                    reason: "operand must be a table".into(),
                })?;
                let mut keys = Vec::with_capacity(table.len());
                for (k, v) in table.iter() {
                    if !matches!(v.borrow().value_type(), crate::value::ValueType::Null) {
                        keys.push(Value::new_string(k.clone()).cell());
                    }
                }
                drop(borrowed);
                let mut result = Value::null();
                result.empty_vector()?;
                *result.as_vector_mut().expect("just created") = keys;
                *self.rhs_cell().borrow_mut() = result;
            }
            OpCode::Wr => {
                self.check_args(2)?;
                let source = Value::deref_cell(&self.lhs_cell())?.borrow().deep_clone();
                let target = Value::deref_cell(&self.rhs_cell())?;
                target.borrow_mut().deep_copy_from(&source)?;
                self.sp -= 1;
            }
            OpCode::Vec => self.construct_vector(arg)?,
            OpCode::Hash => self.construct_hash(arg)?,
            OpCode::Arg => self.bind_arg(arg)?,
            OpCode::Call | OpCode::Tcall => self.call(opcode, arg, &mut next_ip)?,
            OpCode::Ret => self.ret(arg, &mut next_ip)?,
            OpCode::End => {
                next_ip = self.program.len();
            }
        }

        self.ip = next_ip;
        Ok(())
    }

    fn numeric_binop(&mut self, f: impl Fn(f64, f64) -> f64) -> VmResult<()> {
        self.check_args(2)?;
        let lhs = Value::deref_cell(&self.lhs_cell())?.borrow().as_number();
        let rhs = Value::deref_cell(&self.rhs_cell())?.borrow().as_number();
        *self.lhs_cell().borrow_mut() = Value::new_number(f(lhs, rhs));
        self.sp -= 1;
        Ok(())
    }

    fn compare_binop(&mut self, f: impl Fn(&Value, &Value) -> bool) -> VmResult<()> {
        self.check_args(2)?;
        let lhs = Value::deref_cell(&self.lhs_cell())?;
        let rhs = Value::deref_cell(&self.rhs_cell())?;
        let result = f(&lhs.borrow(), &rhs.borrow());
        *self.lhs_cell().borrow_mut() = Value::new_number(if result { 1.0 } else { 0.0 });
        self.sp -= 1;
        Ok(())
    }

    fn membership(&self, haystack: &Value, needle: &Value) -> VmResult<f64> {
        use crate::value::ValueType;
        match haystack.value_type() {
            ValueType::Table => {
                let key = needle.as_string();
                Ok(if haystack.lookup(&key).is_some() { 1.0 } else { 0.0 })
            }
            ValueType::Vector => {
                let items = haystack.as_vector().expect("checked Vector above");
                for (i, item) in items.iter().enumerate() {
                    if item.borrow().equals(needle) {
                        return Ok(i as f64);
                    }
                }
                Ok(-1.0)
            }
            ValueType::String => {
                let hay = haystack.as_string();
                let needle_str = needle.as_string();
                match hay.find(&needle_str) {
                    Some(byte_pos) => Ok(byte_pos as f64),
                    None => Ok(-1.0),
                }
            }
            _ => Err(VmError::TypeError { op: "wat".into(), reason: "operand must be a table, vector, or string".into() }),
        }
    }

    fn size_of(&self, target: &Value) -> VmResult<usize> {
        use crate::value::ValueType;
        match target.value_type() {
            ValueType::Vector => Ok(target.as_vector().expect("checked Vector above").len()),
            ValueType::String => Ok(target.as_string().len()),
            ValueType::Table => {
                let table = target.as_table().expect("checked Table above");
                Ok(table.values().filter(|v| !matches!(v.borrow().value_type(), ValueType::Null)).count())
            }
            _ => Err(VmError::TypeError { op: "sz".into(), reason: "operand must be a vector, string, or table".into() }),
        }
    }

    fn resolve_ref(&mut self, opcode: OpCode, arg: u32) -> VmResult<()> {
        let name = self.identifier(arg)?;
        let scope = self.current_scope();
        if let Some(descriptor) = scope.lookup_func(&name) {
            let mut v = Value::null();
            v.assign_external_function(descriptor.callable.clone())?;
            self.push_value(v)?;
            return Ok(());
        }
        if let Some(cell) = scope.lookup(&name, opcode == OpCode::Rref) {
            let mut v = Value::null();
            v.assign_reference(cell)?;
            self.push_value(v)?;
            return Ok(());
        }
        if opcode == OpCode::Rref {
            return Err(EnvError::Unassigned(name).into());
        }
        let fresh = Value::null().cell();
        if opcode == OpCode::Cref {
            fresh.borrow_mut().set_flag(ValueFlags::CONSTANT);
        }
        scope.assign(&name, fresh.clone());
        let mut v = Value::null();
        v.assign_reference(fresh)?;
        self.push_value(v)?;
        Ok(())
    }

    fn construct_vector(&mut self, arg: u32) -> VmResult<()> {
        let n = arg as usize;
        if n == 0 {
            let mut v = Value::null();
            v.empty_vector()?;
            self.push_value(v)?;
            return Ok(());
        }
        self.check_args(n)?;
        let base = self.sp - n;
        let mut elements = Vec::with_capacity(n);
        for i in 0..n {
            let copy = Value::deref_cell(&self.stack[base + i])?.borrow().deep_clone();
            elements.push(copy.cell());
        }
        let mut v = Value::null();
        v.empty_vector()?;
        *v.as_vector_mut().expect("just created") = elements;
        *self.stack[base].borrow_mut() = v;
        self.sp -= n - 1;
        Ok(())
    }

    fn construct_hash(&mut self, arg: u32) -> VmResult<()> {
        let n = arg as usize;
        if n == 0 {
            let mut v = Value::null();
            v.empty_table()?;
            self.push_value(v)?;
            return Ok(());
        }
        let slots = n * 2;
        self.check_args(slots)?;
        let base = self.sp - slots;
        let mut pairs = Vec::with_capacity(n);
        for i in 0..n {
            let key = Value::deref_cell(&self.stack[base + i * 2])?.borrow().as_string();
            let value = Value::deref_cell(&self.stack[base + i * 2 + 1])?.borrow().deep_clone();
            pairs.push((key, value));
        }
        let mut v = Value::null();
        v.empty_table()?;
        for (key, value) in pairs {
            let cell = v.hash_item(&key)?;
            *cell.borrow_mut() = value;
        }
        *self.stack[base].borrow_mut() = v;
        self.sp -= slots - 1;
        Ok(())
    }

    /// Binds the next positional argument for the active frame (§4.3.4). Against the
    /// reference implementation's "reference into the caller's slot", this hands the
    /// callee a deep copy instead — see `DESIGN.md` for why plain re-referencing
    /// breaks caller/callee independence once the argument slot itself already holds
    /// a reference.
    fn bind_arg(&mut self, arg: u32) -> VmResult<()> {
        let name = self.identifier(arg)?;
        let (fp, nargs, arg_index, this_call) = {
            let f = self.current_frame();
            (f.fp, f.nargs as usize, f.arg_index as usize, f.this_call)
        };
        if arg_index >= nargs {
            return Err(VmError::ArityMismatch);
        }
        let offset = if this_call { 2 } else { 1 };
        let idx = fp - nargs - offset + arg_index;
        let source = self.stack.get(idx).cloned().ok_or(VmError::StackCorruption("ARG index out of range".into()))?;
        let copy = Value::deref_cell(&source)?.borrow().deep_clone();
        let scope = self.current_scope();
        scope.assign(&name, copy.cell());
        self.frames.last_mut().expect("checked above").arg_index += 1;
        Ok(())
    }

    fn call(&mut self, opcode: OpCode, arg: u32, next_ip: &mut usize) -> VmResult<()> {
        let nargs = arg as usize;
        self.check_args(nargs + 2)?;
        let callee_cell = self.rhs_cell();
        let callee = Value::deref_cell(&callee_cell)?;

        if opcode == OpCode::Call {
            if let Some(callable) = callee.borrow().external_function() {
                let retval_idx = self.sp - nargs - 2;
                let retval = self.stack[retval_idx].clone();
                let mut args = Vec::with_capacity(nargs);
                for i in 0..nargs {
                    let slot = &self.stack[self.sp - nargs - 1 + i];
                    let copy = Value::deref_cell(slot)?.borrow().deep_clone();
                    args.push(copy.cell());
                }
                let mut ctx = InvocationContext::new(self.current_scope(), retval, args, None);
                callable.invoke(&mut ctx);
                if let Some(message) = ctx.error() {
                    return Err(VmError::HostError(message.to_string()));
                }
                self.sp -= nargs + 1;
                return Ok(());
            }
        }

        if let Some(address) = callee.borrow().internal_function_address() {
            let this_call = opcode == OpCode::Tcall;
            let offset = if this_call { 2 } else { 1 };
            let this_value = if this_call {
                let cell = self.stack[self.sp - 2].clone();
                Some(Value::deref_cell(&cell)?.borrow().deep_clone())
            } else {
                None
            };
            let parent = self.current_scope();
            let child = Scope::new_child(&parent);
            let mut args_value = Value::null();
            args_value.empty_vector()?;
            let args_cell = args_value.cell();
            for i in 0..nargs {
                let idx = self.sp - nargs - offset + i;
                let copy = Value::deref_cell(&self.stack[idx])?.borrow().deep_clone();
                args_cell.borrow_mut().as_vector_mut().expect("just created").push(copy.cell());
            }
            child.assign("__args", args_cell);
            if let Some(this_value) = this_value {
                child.assign("this", this_value.cell());
            }
            self.frames.push(CallFrame::call(child, self.sp, self.ip + 1, arg, this_call));
            *next_ip = address as usize;
            return Ok(());
        }

        Err(VmError::TypeError { op: "call".into(), reason: "callee is not a function".into() })
    }

    fn ret(&mut self, arg: u32, next_ip: &mut usize) -> VmResult<()> {
        if self.frames.len() <= 1 {
            *next_ip = self.program.len();
            return Ok(());
        }
        self.check_args(1)?;
        let result_cell = self.rhs_cell();
        let (nargs, this_call, return_address) = {
            let f = self.current_frame();
            (f.nargs as usize, f.this_call, f.return_address)
        };
        let mut cleanup = nargs + 1 + arg as usize;
        if this_call {
            cleanup += 1;
        }
        if self.sp <= cleanup {
            return Err(VmError::StackCorruption(format!(
                "function return: sp={} cleanup={cleanup}",
                self.sp
            )));
        }
        let result = Value::deref_cell(&result_cell)?.borrow().deep_clone();
        self.sp -= cleanup;
        self.stack[self.sp - 1].borrow_mut().deep_copy_from(&result)?;
        *next_ip = return_address;
        self.frames.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::OpCode;

    fn encode(opcode: OpCode, arg: u32) -> u32 {
        Instruction::new(opcode, arg).encode()
    }

    fn new_vm(program: Vec<u32>, constants: Vec<Value>, identifiers: Vec<String>) -> VirtualMachine {
        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.load(program, constants, identifiers, Vec::new());
        vm.initialize(Scope::new_root());
        vm
    }

    #[test]
    fn arithmetic_assigns_root_scope_binding() {
        // x = 3 + 4 * 2;
        let program = vec![
            encode(OpCode::Psh, 0),
            encode(OpCode::Psh, 1),
            encode(OpCode::Psh, 2),
            encode(OpCode::Mul, 0),
            encode(OpCode::Add, 0),
            encode(OpCode::Nref, 0),
            encode(OpCode::Wr, 0),
            encode(OpCode::Pop, 0),
            encode(OpCode::End, 0),
        ];
        let constants = vec![Value::new_number(3.0), Value::new_number(4.0), Value::new_number(2.0)];
        let mut vm = new_vm(program, constants, vec!["x".to_string()]);
        assert!(vm.run(RunMode::Normal), "{:?}", vm.error());
        let x = vm.root_scope().unwrap().lookup("x", false).unwrap();
        assert_eq!(Value::deref_cell(&x).unwrap().borrow().as_number(), 11.0);
    }

    #[test]
    fn vector_growth_via_idx() {
        // v[3] = 9; starting from an empty (freshly created) vector binding.
        let program = vec![
            encode(OpCode::Psh, 0),
            encode(OpCode::Nref, 0),
            encode(OpCode::Psh, 1),
            encode(OpCode::Idx, 1),
            encode(OpCode::Wr, 0),
            encode(OpCode::Pop, 0),
            encode(OpCode::End, 0),
        ];
        let constants = vec![Value::new_number(9.0), Value::new_number(3.0)];
        let mut vm = new_vm(program, constants, vec!["v".to_string()]);
        assert!(vm.run(RunMode::Normal), "{:?}", vm.error());
        let v = vm.root_scope().unwrap().lookup("v", false).unwrap();
        let v = Value::deref_cell(&v).unwrap();
        let items = v.borrow();
        let items = items.as_vector().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[3].borrow().as_number(), 9.0);
        assert!(matches!(items[0].borrow().value_type(), crate::value::ValueType::Null));
    }

    #[test]
    fn division_by_zero_succeeds_with_nan() {
        let program = vec![
            encode(OpCode::Psh, 0),
            encode(OpCode::Psh, 1),
            encode(OpCode::Div, 0),
            encode(OpCode::Pop, 0),
            encode(OpCode::End, 0),
        ];
        let constants = vec![Value::new_number(1.0), Value::new_number(0.0)];
        let mut vm = new_vm(program, constants, vec![]);
        assert!(vm.run(RunMode::Normal), "{:?}", vm.error());
    }

    #[test]
    fn setbrk_picks_smallest_line_at_or_above_request() {
        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.load(
            vec![0, 0, 0],
            vec![],
            vec![],
            vec![
                DebugPos { file: "f".into(), line: 1 },
                DebugPos { file: "f".into(), line: 5 },
                DebugPos { file: "f".into(), line: 9 },
            ],
        );
        assert_eq!(vm.setbrk(3), 5);
        assert_eq!(vm.setbrk(100), -1);
    }
}
