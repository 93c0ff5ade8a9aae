//! Bytecode Interpreter
//!
//! A switch-dispatched stack machine over the typed value stack. Between
//! opcodes the only live state is the bytecode cursor and the stack; every
//! allocating opcode checks capacity first and faults with `stack_overflow`
//! at the configured maximum.
//!
//! ## Call protocol
//!
//! A call site pushes the callee id (the marker slot) followed by the
//! arguments. The call opcode replaces the marker with the encoded return PC
//! (high bit set) and jumps. `RETURN h` shifts the result into the marker
//! slot and resumes at the stored PC. The `CALL2` variants additionally push
//! `(return_pc_on_error, frame_base)` onto the error stack; `RETURN2`
//! delivers a `(result, error)` pair to the nearest error-stack entry, and
//! `CLEAN_CALL2` discards the entry after a successful single-result return
//! (pushing the zero error in its place).
//!
//! Host calls use the same machinery with a sentinel return PC of zero:
//! bytecode offset 0 is reserved, so reaching it ends the run loop.

use crate::error::{FixError, ScriptError};
use crate::heap::{Heap, SuspendState};
use crate::native::{Continuation, NativeResult};
use fixscript_core::Value;
use fixscript_core::bytecode::*;
use tracing::trace;

/// Outcome of starting or resuming a call: either a finished value or a
/// pending native suspension.
#[derive(Debug)]
pub enum CallOutcome {
    Done(Value),
    Suspended(Continuation),
}

/// Deadline checks happen once per this many back-edge counter hits.
const TIME_CHECK_INTERVAL: u32 = 256;

enum RunEnd {
    Finished,
    Suspended,
}

impl Heap {
    /// Call a function (by function reference value) with arguments,
    /// failing if the callee suspends.
    pub fn call(&mut self, func: Value, args: &[Value]) -> Result<Value, ScriptError> {
        match self.start_call(func, args)? {
            CallOutcome::Done(v) => Ok(v),
            CallOutcome::Suspended(_) => Err(ScriptError::new(
                Value::ZERO,
                "function suspended without an async host".to_string(),
            )),
        }
    }

    /// Look up `func_name` (mangled `name#arity`) in a loaded script and
    /// call it.
    pub fn call_by_name(
        &mut self,
        script_name: &str,
        func_name: &str,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        let func = self
            .get_function(script_name, func_name)
            .ok_or_else(|| ScriptError::new(Value::ZERO, format!("unknown function {}", func_name)))?;
        self.call(func, args)
    }

    /// Function reference for a loaded script's function.
    pub fn get_function(&self, script_name: &str, func_name: &str) -> Option<Value> {
        let id = self.script_by_name(script_name)?;
        let fid = *self.script(id).functions.get(func_name)?;
        Some(Value::func_ref(fid))
    }

    /// Begin a call that may suspend.
    pub fn start_call(&mut self, func: Value, args: &[Value]) -> Result<CallOutcome, ScriptError> {
        if self.suspended.is_some() {
            return Err(ScriptError::new(
                Value::ZERO,
                "a suspended call is already pending".to_string(),
            ));
        }
        let fid = self
            .resolve_callee(func)
            .map_err(|e| ScriptError::new(Value::ZERO, e.to_string()))?;
        let function = self
            .function(fid)
            .ok_or_else(|| ScriptError::new(Value::ZERO, "invalid function".to_string()))?;
        if function.num_params != args.len() {
            return Err(ScriptError::new(
                Value::ZERO,
                FixError::ImproperParams.to_string(),
            ));
        }
        let addr = function.addr as usize;
        trace!(function = %function.name, "script call");
        let base = self.stack.len();
        if !self.stack.push_pc(0) {
            return Err(ScriptError::new(Value::ZERO, FixError::StackOverflow.to_string()));
        }
        self.error_stack.push((0, base as u32));
        for &a in args {
            if !self.stack.push(a) {
                self.stack.truncate(base);
                self.error_stack.pop();
                return Err(ScriptError::new(Value::ZERO, FixError::StackOverflow.to_string()));
            }
        }
        let host_depth = self.error_stack.len();
        match self.run(addr) {
            RunEnd::Finished => self.finish_host_call(base, host_depth),
            RunEnd::Suspended => {
                if let Some(s) = &mut self.suspended {
                    s.host_base = base as u32;
                    s.host_depth = host_depth as u32;
                }
                Ok(CallOutcome::Suspended(Continuation::new()))
            }
        }
    }

    /// Deliver a `(result, error)` pair to a suspended call and continue.
    pub fn resume(
        &mut self,
        cont: Continuation,
        result: Value,
        error: Value,
    ) -> Result<CallOutcome, ScriptError> {
        let _ = cont;
        let Some(state) = self.suspended.take() else {
            return Err(ScriptError::new(
                Value::ZERO,
                "no suspended call to resume".to_string(),
            ));
        };
        let mut pc = state.resume_pc as usize;
        if state.push_result {
            if !error.is_null() {
                let err = self.wrap_error(error, pc);
                match self.raise_value(err) {
                    Some(next) => pc = next,
                    None => return self.finish_host_call(state.host_base as usize, state.host_depth as usize),
                }
            } else if !self.stack.push(result) {
                return Err(ScriptError::new(Value::ZERO, FixError::StackOverflow.to_string()));
            }
        }
        match self.run(pc) {
            RunEnd::Finished => {
                self.finish_host_call(state.host_base as usize, state.host_depth as usize)
            }
            RunEnd::Suspended => {
                if let Some(s) = &mut self.suspended {
                    s.host_base = state.host_base;
                    s.host_depth = state.host_depth;
                }
                Ok(CallOutcome::Suspended(Continuation::new()))
            }
        }
    }

    fn finish_host_call(
        &mut self,
        base: usize,
        host_depth: usize,
    ) -> Result<CallOutcome, ScriptError> {
        let read = |stack: &fixscript_core::ValueStack, idx: usize| {
            if idx < stack.len() { stack.get(idx) } else { Value::ZERO }
        };
        if self.error_stack.len() >= host_depth {
            // Entry still pending: the callee returned a single result.
            self.error_stack.truncate(host_depth - 1);
            let result = read(&self.stack, base);
            self.stack.truncate(base);
            Ok(CallOutcome::Done(result))
        } else {
            let result = read(&self.stack, base);
            let error = read(&self.stack, base + 1);
            self.stack.truncate(base);
            if error.is_null() {
                Ok(CallOutcome::Done(result))
            } else {
                let message = self.error_message(error);
                Err(ScriptError::new(error, message))
            }
        }
    }

    fn resolve_callee(&mut self, func: Value) -> Result<usize, FixError> {
        if let Some(id) = func.func_id() {
            return Ok(id);
        }
        if self.is_handle(func) {
            let fr: &crate::handle::FuncRefHandle = self.handle_data(func)?;
            let (script, name) = (fr.script_name.clone(), fr.func_name.clone());
            let v = self.resolve_func_ref(&script, &name)?;
            return v.func_id().ok_or(FixError::FuncRefLoad);
        }
        Err(FixError::InvalidAccess)
    }

    // -----------------------------------------------------------------
    // The dispatch loop
    // -----------------------------------------------------------------

    fn run(&mut self, mut pc: usize) -> RunEnd {
        let mut auto_counter = 0u32;
        loop {
            if pc == 0 {
                return RunEnd::Finished;
            }
            if let Some(limit) = self.auto_suspend {
                auto_counter += 1;
                if auto_counter >= limit {
                    self.suspended = Some(SuspendState {
                        resume_pc: pc as u32,
                        push_result: false,
                        host_base: 0,
                        host_depth: 0,
                    });
                    return RunEnd::Suspended;
                }
            }
            match self.step(pc) {
                Ok(StepResult::Next(next)) => pc = next,
                Ok(StepResult::Suspend) => return RunEnd::Suspended,
                Err(e) => {
                    let err = self.make_error(&e.to_string(), pc);
                    match self.raise_value(err) {
                        Some(next) => pc = next,
                        None => return RunEnd::Finished,
                    }
                }
            }
        }
    }

    #[inline]
    fn imm_u8(&self, pc: usize) -> u8 {
        self.code[pc]
    }

    #[inline]
    fn imm_u16(&self, pc: usize) -> u16 {
        u16::from_le_bytes([self.code[pc], self.code[pc + 1]])
    }

    #[inline]
    fn imm_i32(&self, pc: usize) -> i32 {
        i32::from_le_bytes([
            self.code[pc],
            self.code[pc + 1],
            self.code[pc + 2],
            self.code[pc + 3],
        ])
    }

    #[inline]
    fn pop(&mut self) -> Result<Value, FixError> {
        self.stack.pop().ok_or(FixError::StackOverflow)
    }

    #[inline]
    fn push(&mut self, v: Value) -> Result<(), FixError> {
        if self.stack.push(v) {
            Ok(())
        } else {
            Err(FixError::StackOverflow)
        }
    }

    fn step(&mut self, pc: usize) -> Result<StepResult, FixError> {
        let op = self.code[pc];
        match op {
            BC_POP => {
                self.pop()?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_POPN => {
                let n = self.imm_u8(pc + 1) as usize;
                let len = self.stack.len();
                if n > len {
                    return Err(FixError::StackOverflow);
                }
                self.stack.truncate(len - n);
                Ok(StepResult::Next(pc + 2))
            }
            BC_CHECK_STACK => {
                let n = self.imm_u16(pc + 1) as usize;
                if !self.stack.reserve(n) {
                    return Err(FixError::StackOverflow);
                }
                Ok(StepResult::Next(pc + 3))
            }
            BC_CONSTM1 => {
                self.push(Value::int(-1))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_CONST0..=0x24 => {
                self.push(Value::int((op - BC_CONST0) as i32))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_CONST_P8 => {
                self.push(Value::int(self.imm_u8(pc + 1) as i32))?;
                Ok(StepResult::Next(pc + 2))
            }
            BC_CONST_N8 => {
                self.push(Value::int(-(self.imm_u8(pc + 1) as i32) - 1))?;
                Ok(StepResult::Next(pc + 2))
            }
            BC_CONST_P16 => {
                self.push(Value::int(self.imm_u16(pc + 1) as i32))?;
                Ok(StepResult::Next(pc + 3))
            }
            BC_CONST_N16 => {
                self.push(Value::int(-(self.imm_u16(pc + 1) as i32) - 1))?;
                Ok(StepResult::Next(pc + 3))
            }
            BC_CONST_I32 => {
                self.push(Value::int(self.imm_i32(pc + 1)))?;
                Ok(StepResult::Next(pc + 5))
            }
            BC_CONST_F32 | BC_CONST_REF => {
                self.push(Value {
                    data: self.imm_i32(pc + 1),
                    is_ref: true,
                })?;
                Ok(StepResult::Next(pc + 5))
            }
            BC_ADD | BC_SUB | BC_MUL | BC_ADD_MOD | BC_SUB_MOD | BC_MUL_MOD | BC_DIV | BC_REM
            | BC_SHL | BC_SHR | BC_USHR | BC_AND | BC_OR | BC_XOR => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = int_binop(op, a.data, b.data)?;
                self.push(Value::int(r))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_LT | BC_LE | BC_GT | BC_GE => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = match op {
                    BC_LT => a.data < b.data,
                    BC_LE => a.data <= b.data,
                    BC_GT => a.data > b.data,
                    _ => a.data >= b.data,
                };
                self.push(Value::int(r as i32))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_EQ | BC_NE => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a == b;
                self.push(Value::int((eq == (op == BC_EQ)) as i32))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_EQ_VALUE | BC_NE_VALUE => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = self.values_equal(a, b)?;
                self.push(Value::int((eq == (op == BC_EQ_VALUE)) as i32))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_NOT => {
                let v = self.pop()?;
                self.push(Value::int(v.is_null() as i32))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_BITNOT => {
                let v = self.pop()?;
                self.push(Value::int(!v.data))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_NEG => {
                let v = self.pop()?;
                let r = v.data.checked_neg().ok_or(FixError::IntegerOverflow)?;
                self.push(Value::int(r))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_INC | BC_DEC => {
                let k = self.imm_u8(pc + 1) as i8 as i32;
                let slot = (self.stack.len() as i32 + k) as usize;
                let v = self.stack.get(slot);
                let delta = if op == BC_INC { 1 } else { -1 };
                let r = v.data.checked_add(delta).ok_or(FixError::IntegerOverflow)?;
                self.stack.set(slot, Value::int(r));
                Ok(StepResult::Next(pc + 2))
            }
            BC_FLOAT_ADD | BC_FLOAT_SUB | BC_FLOAT_MUL | BC_FLOAT_DIV => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                let r = match op {
                    BC_FLOAT_ADD => a + b,
                    BC_FLOAT_SUB => a - b,
                    BC_FLOAT_MUL => a * b,
                    _ => a / b,
                };
                self.push(Value::float(r))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_FLOAT_LT | BC_FLOAT_LE | BC_FLOAT_GT | BC_FLOAT_GE => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                let r = match op {
                    BC_FLOAT_LT => a < b,
                    BC_FLOAT_LE => a <= b,
                    BC_FLOAT_GT => a > b,
                    _ => a >= b,
                };
                self.push(Value::int(r as i32))?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_LOADN => {
                let n = self.pop()?;
                let slot = (self.stack.len() as i32 + n.data) as usize;
                if slot >= self.stack.len() {
                    return Err(FixError::OutOfBounds);
                }
                let v = self.stack.get(slot);
                self.push(v)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_STOREN => {
                let n = self.pop()?;
                let v = self.pop()?;
                let slot = (self.stack.len() as i32 + n.data) as usize;
                if slot >= self.stack.len() {
                    return Err(FixError::OutOfBounds);
                }
                self.stack.set(slot, v);
                Ok(StepResult::Next(pc + 1))
            }
            BC_LOAD_GLOBAL => {
                let idx = self.imm_u16(pc + 1) as usize;
                if idx >= self.globals.len() {
                    return Err(FixError::OutOfBounds);
                }
                let v = self.globals.get(idx);
                self.push(v)?;
                Ok(StepResult::Next(pc + 3))
            }
            BC_STORE_GLOBAL => {
                let idx = self.imm_u16(pc + 1) as usize;
                let v = self.pop()?;
                if idx >= self.globals.len() {
                    return Err(FixError::OutOfBounds);
                }
                self.globals.set(idx, v);
                Ok(StepResult::Next(pc + 3))
            }
            BC_ARRAY_GET => {
                let idx = self.pop()?;
                let arr = self.pop()?;
                if !idx.is_int() || idx.data < 0 {
                    return Err(FixError::OutOfBounds);
                }
                let v = self.get_array_elem(arr, idx.data as usize)?;
                self.push(v)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_ARRAY_SET => {
                let value = self.pop()?;
                let idx = self.pop()?;
                let arr = self.pop()?;
                if !idx.is_int() || idx.data < 0 {
                    return Err(FixError::OutOfBounds);
                }
                self.set_array_elem(arr, idx.data as usize, value)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_ARRAY_APPEND => {
                let value = self.pop()?;
                let arr = self.pop()?;
                self.append_array_elem(arr, value)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_HASH_GET => {
                let key = self.pop()?;
                let h = self.pop()?;
                let v = self.get_hash_elem(h, key)?;
                self.push(v)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_HASH_SET => {
                let value = self.pop()?;
                let key = self.pop()?;
                let h = self.pop()?;
                self.set_hash_elem(h, key, value)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_CREATE_ARRAY => {
                let n = self.imm_u16(pc + 1) as usize;
                let base = self.stack.len() - n;
                let arr = self.create_array(n)?;
                for i in 0..n {
                    self.set_array_elem(arr, i, self.stack.get(base + i))?;
                }
                self.stack.truncate(base);
                self.push(arr)?;
                Ok(StepResult::Next(pc + 3))
            }
            BC_CREATE_HASH => {
                let pairs = self.imm_u16(pc + 1) as usize;
                let base = self.stack.len() - pairs * 2;
                let h = self.create_hash()?;
                for i in 0..pairs {
                    let k = self.stack.get(base + i * 2);
                    let v = self.stack.get(base + i * 2 + 1);
                    self.set_hash_elem(h, k, v)?;
                }
                self.stack.truncate(base);
                self.push(h)?;
                Ok(StepResult::Next(pc + 3))
            }
            BC_CREATE_STRING => {
                let n = self.imm_u16(pc + 1) as usize;
                let base = self.stack.len() - n;
                let mut out = String::new();
                for i in 0..n {
                    out.push_str(&self.to_display_string(self.stack.get(base + i)));
                }
                let s = self.create_string(&out)?;
                self.stack.truncate(base);
                self.push(s)?;
                Ok(StepResult::Next(pc + 3))
            }
            BC_CALL_DIRECT | BC_CALL2_DIRECT => {
                let nargs = self.imm_u8(pc + 1) as usize;
                let marker = self.stack.len() - nargs - 1;
                // The protected form catches its own entry faults too.
                if op == BC_CALL2_DIRECT {
                    self.error_stack.push(((pc + 3) as u32, marker as u32));
                }
                let fid = self.stack.get(marker).data as usize;
                self.enter_function(fid, nargs, marker, pc + 2)
            }
            BC_CALL_DYNAMIC | BC_CALL2_DYNAMIC => {
                let nargs = self.imm_u8(pc + 1) as usize;
                let marker = self.stack.len() - nargs - 1;
                if op == BC_CALL2_DYNAMIC {
                    self.error_stack.push(((pc + 3) as u32, marker as u32));
                }
                let callee = self.stack.get(marker);
                let fid = self.resolve_callee(callee)?;
                self.enter_function(fid, nargs, marker, pc + 2)
            }
            BC_CALL_NATIVE | BC_CALL2_NATIVE => {
                let nargs = self.imm_u8(pc + 1) as usize;
                let marker = self.stack.len() - nargs - 1;
                let id = self.stack.get(marker).data as usize;
                let next_pc = pc + 2;
                if op == BC_CALL2_NATIVE {
                    self.error_stack.push(((next_pc + 1) as u32, marker as u32));
                }
                let entry = self
                    .natives
                    .get(id)
                    .ok_or(FixError::NativeNotPresent)?
                    .func
                    .clone();
                let args: Vec<Value> = (0..nargs)
                    .map(|i| self.stack.get(marker + 1 + i))
                    .collect();
                match entry.as_ref()(self, &args) {
                    NativeResult::Value(v) => {
                        self.stack.truncate(marker);
                        self.push(v)?;
                        Ok(StepResult::Next(next_pc))
                    }
                    NativeResult::Error(e) => {
                        self.stack.truncate(marker);
                        let err = self.wrap_error(e, pc);
                        match self.raise_value(err) {
                            Some(next) => Ok(StepResult::Next(next)),
                            None => Ok(StepResult::Next(0)),
                        }
                    }
                    NativeResult::Suspend => {
                        self.stack.truncate(marker);
                        self.suspended = Some(SuspendState {
                            resume_pc: next_pc as u32,
                            push_result: true,
                            host_base: 0,
                            host_depth: 0,
                        });
                        Ok(StepResult::Suspend)
                    }
                }
            }
            BC_CLEAN_CALL2 => {
                self.error_stack.pop().ok_or(FixError::InvalidAccess)?;
                self.push(Value::ZERO)?;
                Ok(StepResult::Next(pc + 1))
            }
            BC_RETURN => {
                let h = self.imm_u16(pc + 1) as usize;
                let result = self.pop()?;
                let marker = self.stack.len() - h - 1;
                let retpc = self.stack.get_pc(marker).ok_or(FixError::InvalidAccess)?;
                self.stack.truncate(marker);
                self.push(result)?;
                Ok(StepResult::Next(retpc as usize))
            }
            BC_RETURN2 => {
                let error = self.pop()?;
                let result = self.pop()?;
                let (retpc, base) = self.error_stack.pop().ok_or(FixError::InvalidAccess)?;
                self.stack.truncate(base as usize);
                let error = if error.is_null() {
                    error
                } else {
                    self.wrap_error(error, pc)
                };
                self.push(result)?;
                self.push(error)?;
                Ok(StepResult::Next(retpc as usize))
            }
            BC_BRANCH_LONG => {
                let off = self.imm_i32(pc + 1);
                let next = pc + 5;
                let cond = self.pop()?;
                if cond.is_null() {
                    Ok(StepResult::Next((next as i64 + off as i64) as usize))
                } else {
                    Ok(StepResult::Next(next))
                }
            }
            BC_JUMP_LONG => {
                let off = self.imm_i32(pc + 1);
                let next = pc + 5;
                Ok(StepResult::Next((next as i64 + off as i64) as usize))
            }
            BC_SWITCH => {
                let table = self.imm_i32(pc + 1) as usize;
                let v = self.pop()?;
                let target = self.switch_lookup(table, v)?;
                Ok(StepResult::Next(target))
            }
            BC_EXTENDED => match self.imm_u8(pc + 1) {
                EXT_CHECK_TIME_LIMIT => {
                    self.check_time_limit()?;
                    Ok(StepResult::Next(pc + 2))
                }
                _ => Err(FixError::InvalidAccess),
            },
            _ if (BC_BRANCH0..BC_BRANCH0 + 8).contains(&op) => {
                let off = (((op - BC_BRANCH0) as usize) << 8) | self.imm_u8(pc + 1) as usize;
                let next = pc + 2;
                let cond = self.pop()?;
                if cond.is_null() {
                    Ok(StepResult::Next(next + off))
                } else {
                    Ok(StepResult::Next(next))
                }
            }
            _ if (BC_JUMP0..BC_JUMP0 + 8).contains(&op) => {
                let off = (((op - BC_JUMP0) as usize) << 8) | self.imm_u8(pc + 1) as usize;
                Ok(StepResult::Next(pc + 2 - off))
            }
            _ if op >= BC_STOREM64 => {
                let k = op as i32 - BC_STOREM64 as i32 - 64;
                let v = self.pop()?;
                let slot = (self.stack.len() as i32 + k) as usize;
                self.stack.set(slot, v);
                Ok(StepResult::Next(pc + 1))
            }
            _ if op >= BC_LOADM64 => {
                let k = op as i32 - BC_LOADM64 as i32 - 64;
                let slot = (self.stack.len() as i32 + k) as usize;
                let v = self.stack.get(slot);
                self.push(v)?;
                Ok(StepResult::Next(pc + 1))
            }
            _ => Err(FixError::InvalidAccess),
        }
    }

    fn enter_function(
        &mut self,
        fid: usize,
        nargs: usize,
        marker: usize,
        next_pc: usize,
    ) -> Result<StepResult, FixError> {
        let func = self.function(fid).ok_or(FixError::InvalidAccess)?;
        if func.num_params != nargs {
            return Err(FixError::ImproperParams);
        }
        let addr = func.addr as usize;
        self.stack.set_pc(marker, next_pc as u32);
        Ok(StepResult::Next(addr))
    }

    fn pop_float(&mut self) -> Result<f32, FixError> {
        let v = self.pop()?;
        if !v.is_float() {
            return Err(FixError::InvalidAccess);
        }
        Ok(v.as_float())
    }

    fn switch_lookup(&self, table: usize, v: Value) -> Result<usize, FixError> {
        let count = self.imm_i32(table) as usize;
        let default = self.imm_i32(table + 4) as usize;
        if !v.is_int() {
            return Ok(default);
        }
        let entry = |i: usize| -> (i32, i32) {
            (
                self.imm_i32(table + 8 + i * 8),
                self.imm_i32(table + 12 + i * 8),
            )
        };
        // Binary search for the last entry with value <= v
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if entry(mid).0 <= v.data {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(default);
        }
        let (value, target) = entry(lo - 1);
        if target > 0 {
            if value == v.data {
                return Ok(target as usize);
            }
            return Ok(default);
        }
        if target < 0 {
            // Range start: the following entry carries the range end
            if lo < count {
                let (end, end_target) = entry(lo);
                if end_target == 0 && v.data <= end {
                    return Ok((-target) as usize);
                }
            }
            return Ok(default);
        }
        // Range end entry: exact hit resolves through the preceding start
        if value == v.data && lo >= 2 {
            let (_, start_target) = entry(lo - 2);
            if start_target < 0 {
                return Ok((-start_target) as usize);
            }
        }
        Ok(default)
    }

    fn check_time_limit(&mut self) -> Result<(), FixError> {
        if self.stop_flag.load(std::sync::atomic::Ordering::Acquire) {
            self.stop_flag
                .store(false, std::sync::atomic::Ordering::Release);
            return Err(FixError::ExecutionStop);
        }
        self.time_counter += 1;
        if self.time_counter >= TIME_CHECK_INTERVAL {
            self.time_counter = 0;
            if let Some(deadline) = self.deadline
                && std::time::Instant::now() > deadline
            {
                return Err(FixError::TimeLimit);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Error values
    // -----------------------------------------------------------------

    /// Unwind to the nearest error-stack entry, delivering `(0, error)`.
    /// Returns the new PC, or `None` when no entry exists.
    fn raise_value(&mut self, error: Value) -> Option<usize> {
        let (retpc, base) = self.error_stack.pop()?;
        self.stack.truncate(base as usize);
        let _ = self.stack.push(Value::ZERO);
        let _ = self.stack.push(error);
        Some(retpc as usize)
    }

    /// Build a `[message, stack_trace]` error value.
    fn make_error(&mut self, message: &str, pc: usize) -> Value {
        let msg = self.create_string(message).unwrap_or(Value::ZERO);
        self.wrap_error(msg, pc)
    }

    /// Wrap an arbitrary raised value into the error shape. Wrapping an
    /// existing `[message, stack_trace]` pair is idempotent.
    pub(crate) fn wrap_error(&mut self, v: Value, pc: usize) -> Value {
        if self.is_error_value(v) {
            return v;
        }
        // Pin the payload across the trace allocations.
        self.add_ref(v);
        let trace = self.capture_stack_trace(pc);
        self.add_ref(trace);
        let err = match self.create_array(2) {
            Ok(e) => e,
            Err(_) => {
                self.unref(trace);
                self.unref(v);
                return v;
            }
        };
        let _ = self.set_array_elem(err, 0, v);
        let _ = self.set_array_elem(err, 1, trace);
        self.unref(trace);
        self.unref(v);
        err
    }

    fn is_error_value(&self, v: Value) -> bool {
        if !self.is_array(v) || self.is_string(v) {
            return false;
        }
        if self.length(v) != Ok(2) {
            return false;
        }
        let first = self.get_array_elem(v, 0).unwrap_or(Value::ZERO);
        let second = self.get_array_elem(v, 1).unwrap_or(Value::ZERO);
        self.is_string(first) && self.is_array(second) && !self.is_string(second)
    }

    /// Walk the data stack for encoded return PCs and map them to
    /// function/line pairs.
    fn capture_stack_trace(&mut self, pc: usize) -> Value {
        let mut lines = vec![self.describe_pc(pc)];
        for i in (0..self.stack.len()).rev() {
            if let Some(ret) = self.stack.get_pc(i)
                && ret != 0
            {
                lines.push(self.describe_pc(ret as usize));
            }
        }
        let arr = match self.create_array(0) {
            Ok(a) => a,
            Err(_) => return Value::ZERO,
        };
        self.add_ref(arr);
        for line in lines {
            if let Ok(s) = self.create_string(&line) {
                let _ = self.append_array_elem(arr, s);
            }
        }
        self.unref(arr);
        arr
    }

    fn describe_pc(&self, pc: usize) -> String {
        let mut best: Option<&crate::script::Function> = None;
        for f in &self.functions {
            if f.addr as usize <= pc && best.is_none_or(|b| f.addr > b.addr) {
                best = Some(f);
            }
        }
        match best {
            Some(f) => {
                let script = self.script(f.script);
                match script.line_for_pc(pc as u32) {
                    Some(line) => format!("{} ({}:{})", f.name, script.name, line),
                    None => format!("{} ({})", f.name, script.name),
                }
            }
            None => format!("<pc {}>", pc),
        }
    }

    /// Printable single-line message for an error value: the message part
    /// of a `[message, stack_trace]` pair with control characters stripped.
    pub fn error_message(&self, error: Value) -> String {
        let msg = if self.is_error_value(error) {
            self.get_array_elem(error, 0).unwrap_or(error)
        } else {
            error
        };
        let text = if self.is_string(msg) {
            self.get_string(msg).unwrap_or_default()
        } else {
            self.to_display_string(msg)
        };
        text.chars().filter(|c| !c.is_control()).collect()
    }

    /// The line of the innermost frame, for diagnostics.
    pub fn error_stack_trace(&self, error: Value) -> Vec<String> {
        if !self.is_error_value(error) {
            return Vec::new();
        }
        let Ok(trace) = self.get_array_elem(error, 1) else {
            return Vec::new();
        };
        let Ok(len) = self.length(trace) else {
            return Vec::new();
        };
        (0..len)
            .filter_map(|i| self.get_array_elem(trace, i).ok())
            .filter_map(|v| self.get_string(v).ok())
            .collect()
    }
}

enum StepResult {
    Next(usize),
    Suspend,
}

fn int_binop(op: u8, a: i32, b: i32) -> Result<i32, FixError> {
    match op {
        BC_ADD => a.checked_add(b).ok_or(FixError::IntegerOverflow),
        BC_SUB => a.checked_sub(b).ok_or(FixError::IntegerOverflow),
        BC_MUL => a.checked_mul(b).ok_or(FixError::IntegerOverflow),
        BC_ADD_MOD => Ok(a.wrapping_add(b)),
        BC_SUB_MOD => Ok(a.wrapping_sub(b)),
        BC_MUL_MOD => Ok(a.wrapping_mul(b)),
        BC_DIV => {
            if b == 0 {
                Err(FixError::DivisionByZero)
            } else {
                a.checked_div(b).ok_or(FixError::IntegerOverflow)
            }
        }
        BC_REM => {
            if b == 0 {
                Err(FixError::DivisionByZero)
            } else {
                a.checked_rem(b).ok_or(FixError::IntegerOverflow)
            }
        }
        BC_SHL => Ok(a.wrapping_shl(b as u32 & 31)),
        BC_SHR => Ok(a.wrapping_shr(b as u32 & 31)),
        BC_USHR => Ok(((a as u32).wrapping_shr(b as u32 & 31)) as i32),
        BC_AND => Ok(a & b),
        BC_OR => Ok(a | b),
        _ => Ok(a ^ b),
    }
}
