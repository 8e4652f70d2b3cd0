pub mod chunk;
pub mod heap;
pub mod object;
pub mod value;

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::compiler;
use crate::diagnostic::Diagnostic;
use crate::vm::chunk::OpCode;
use crate::vm::heap::{Heap, ObjRef};
use crate::vm::object::{
    BoundMethod, Capture, Class, Closure, Instance, Native, NativeFn, Obj, Upvalue,
};
use crate::vm::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile(Vec<Diagnostic>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A runtime failure with the frame stack at the point of the error,
/// innermost first.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    pub name: String,
}

/// Per-call state: the running closure, the next bytecode offset in its
/// chunk, and the stack slot holding the callee (slot 0 of the frame).
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

pub struct Vm<'out> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    /// Head of the open-upvalue list, strictly descending by stack slot.
    open_upvalues: Option<ObjRef>,
    heap: Heap,
    output: Box<dyn Write + 'out>,
}

fn clock_native(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}

impl Vm<'static> {
    pub fn new() -> Self {
        Vm::with_output(Box::new(io::stdout()))
    }
}

impl Default for Vm<'static> {
    fn default() -> Self {
        Vm::new()
    }
}

impl<'out> Vm<'out> {
    /// A VM writing program output to the given sink instead of stdout.
    pub fn with_output(output: Box<dyn Write + 'out>) -> Self {
        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            open_upvalues: None,
            heap: Heap::new(),
            output,
        };
        vm.define_native("clock", 0, clock_native);
        vm
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        self.push(Value::Obj(function));
        let closure = self.heap.alloc(Obj::Closure(Closure { function, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure));
        if let Err(message) = self.call_closure(closure, 0) {
            return Err(InterpretError::Runtime(self.runtime_error(message)));
        }
        self.run().map_err(InterpretError::Runtime)
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let native = self.heap.alloc(Obj::Native(Native { name, arity, function }));
        self.globals.insert(name.to_string(), Value::Obj(native));
    }

    // ---- Stack ----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- Frame and bytecode access ----

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        let byte = self.heap.function(function).chunk.code[frame.ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_short(&mut self) -> usize {
        let hi = self.read_byte() as usize;
        let lo = self.read_byte() as usize;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string(&mut self) -> String {
        match self.read_constant() {
            Value::Obj(r) => self.heap.as_str(r).to_string(),
            _ => unreachable!("name constant is always a string"),
        }
    }

    // ---- Errors ----

    /// Builds the stack trace for a failure, then resets the VM to idle.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(n) => self.heap.as_str(n).to_string(),
                None => "script".to_string(),
            };
            trace.push(TraceFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        RuntimeError { message, trace }
    }

    // ---- Garbage collection ----

    /// Full mark-sweep cycle. Roots: the live stack, every frame's closure,
    /// the open-upvalue list, and the globals table.
    fn collect_garbage(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }
        for value in self.globals.values() {
            self.heap.mark_value(*value);
        }

        self.heap.trace();
        self.heap.sweep();
    }

    // ---- Calls ----

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), String> {
        let arity = {
            let function = self.heap.closure(closure).function;
            self.heap.function(function).arity as usize
        };
        if arg_count != arity {
            return Err(format!("Expected {arity} arguments but got {arg_count}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        if let Value::Obj(r) = callee {
            match self.heap.get(r) {
                Obj::Closure(_) => return self.call_closure(r, arg_count),
                Obj::Class(_) => {
                    let instance = self.heap.alloc(Obj::Instance(Instance {
                        class: r,
                        fields: HashMap::new(),
                    }));
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = Value::Obj(instance);
                    let init = match self.heap.get(r) {
                        Obj::Class(c) => c.methods.get("init").copied(),
                        _ => unreachable!(),
                    };
                    return match init {
                        Some(Value::Obj(m)) => self.call_closure(m, arg_count),
                        Some(_) => unreachable!("methods are always closures"),
                        None if arg_count != 0 => {
                            Err(format!("Expected 0 arguments but got {arg_count}."))
                        }
                        None => Ok(()),
                    };
                }
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                Obj::Native(native) => {
                    let arity = native.arity as usize;
                    let function = native.function;
                    if arg_count != arity {
                        return Err(format!("Expected {arity} arguments but got {arg_count}."));
                    }
                    let start = self.stack.len() - arg_count;
                    let result = function(&self.stack[start..]);
                    self.stack.truncate(start - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    /// Fused property-get + call: a callable field wins over a method.
    fn invoke(&mut self, name: &str, arg_count: usize) -> Result<(), String> {
        let receiver = self.peek(arg_count);
        let Some(r) = receiver.as_obj() else {
            return Err("Only instances have methods.".to_string());
        };
        let (class, field) = match self.heap.get(r) {
            Obj::Instance(instance) => (instance.class, instance.fields.get(name).copied()),
            _ => return Err("Only instances have methods.".to_string()),
        };
        if let Some(field) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: &str, arg_count: usize) -> Result<(), String> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name).copied(),
            _ => unreachable!("method lookup on a non-class"),
        };
        match method {
            Some(Value::Obj(m)) => self.call_closure(m, arg_count),
            _ => Err(format!("Undefined property '{name}'.")),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: &str) -> Result<(), String> {
        let method = match self.heap.get(class) {
            Obj::Class(c) => c.methods.get(name).copied(),
            _ => unreachable!("method lookup on a non-class"),
        };
        let Some(Value::Obj(m)) = method else {
            return Err(format!("Undefined property '{name}'."));
        };
        let receiver = self.peek(0);
        let bound = self.heap.alloc(Obj::BoundMethod(BoundMethod { receiver, method: m }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ---- Upvalues ----

    /// Shares the open upvalue for `slot` if one exists; otherwise inserts
    /// a new one, keeping the list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            let upvalue = self.heap.upvalue(r);
            let location = match upvalue.capture {
                Capture::Open(location) => location,
                Capture::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if location <= slot {
                if location == slot {
                    return r;
                }
                break;
            }
            prev = Some(r);
            current = upvalue.next;
        }

        let created = self.heap.alloc(Obj::Upvalue(Upvalue {
            capture: Capture::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `threshold`, hoisting the
    /// stack slot's value into the cell.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(r) = self.open_upvalues {
            let upvalue = self.heap.upvalue(r);
            let location = match upvalue.capture {
                Capture::Open(location) => location,
                Capture::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if location < threshold {
                break;
            }
            let next = upvalue.next;
            let value = self.stack[location];
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.capture = Capture::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    // ---- Arithmetic helpers ----

    fn binary_number_op(&mut self, op: fn(f64, f64) -> f64) -> Result<(), String> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare_op(&mut self, op: fn(f64, f64) -> bool) -> Result<(), String> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    /// Both operands truncate to 32-bit before the operation, then widen.
    fn bitwise_op(&mut self, op: fn(i32, i32) -> i32) -> Result<(), String> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a as i32, b as i32) as f64));
        Ok(())
    }

    // ---- Dispatch ----

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(format!("Unknown opcode {byte}."))),
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = *value;
                            self.push(value);
                        }
                        None => {
                            return Err(self.runtime_error(format!("Undefined variable '{name}'.")))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                    }
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).capture {
                        Capture::Open(location) => self.stack[location],
                        Capture::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    let capture = self.heap.upvalue(upvalue).capture;
                    match capture {
                        Capture::Open(location) => self.stack[location] = value,
                        Capture::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).capture = Capture::Closed(value)
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    self.binary_compare_op(|a, b| a > b)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::Less => {
                    self.binary_compare_op(|a, b| a < b)
                        .map_err(|m| self.runtime_error(m))?;
                }

                OpCode::Add => {
                    let (a, b) = (self.peek(1), self.peek(0));
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(x + y));
                        }
                        (Value::Obj(x), Value::Obj(y))
                            if matches!(self.heap.get(x), Obj::Str(_))
                                && matches!(self.heap.get(y), Obj::Str(_)) =>
                        {
                            let text =
                                format!("{}{}", self.heap.as_str(x), self.heap.as_str(y));
                            self.pop();
                            self.pop();
                            let s = self.heap.intern(&text);
                            self.push(Value::Obj(s));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ))
                        }
                    }
                }
                OpCode::Subtract => {
                    self.binary_number_op(|a, b| a - b)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::Multiply => {
                    self.binary_number_op(|a, b| a * b)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::Divide => {
                    self.binary_number_op(|a, b| a / b)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::Modulo => {
                    self.binary_number_op(|a, b| a % b)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::Power => {
                    self.binary_number_op(f64::powf)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::BitAnd => {
                    self.bitwise_op(|a, b| a & b).map_err(|m| self.runtime_error(m))?;
                }
                OpCode::BitOr => {
                    self.bitwise_op(|a, b| a | b).map_err(|m| self.runtime_error(m))?;
                }
                OpCode::BitXor => {
                    self.bitwise_op(|a, b| a ^ b).map_err(|m| self.runtime_error(m))?;
                }
                OpCode::ShiftLeft => {
                    self.bitwise_op(|a, b| a.wrapping_shl(b as u32))
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::ShiftRight => {
                    self.bitwise_op(|a, b| a.wrapping_shr(b as u32))
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::BitNot => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    };
                    self.pop();
                    self.push(Value::Number(!(n as i32) as f64));
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.value_to_string(value);
                    let _ = writeln!(self.output, "{text}");
                }

                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(&name, arg_count)
                        .map_err(|m| self.runtime_error(m))?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass slot holds a class"),
                    };
                    self.invoke_from_class(superclass, &name, arg_count)
                        .map_err(|m| self.runtime_error(m))?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant is a function"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.heap.alloc(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        match self.heap.get_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!(),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }

                OpCode::Class => {
                    let name = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => unreachable!("class name constant is a string"),
                    };
                    let class = self.heap.alloc(Obj::Class(Class {
                        name,
                        methods: HashMap::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let sup = match superclass.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
                        _ => {
                            return Err(
                                self.runtime_error("Superclass must be a class.".to_string())
                            )
                        }
                    };
                    let methods = match self.heap.get(sup) {
                        Obj::Class(c) => c.methods.clone(),
                        _ => unreachable!(),
                    };
                    let sub = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("subclass slot holds a class"),
                    };
                    match self.heap.get_mut(sub) {
                        Obj::Class(c) => c.methods.extend(methods),
                        _ => unreachable!(),
                    }
                    // The superclass stays behind as the scoped `super`.
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        _ => unreachable!("method target is a class"),
                    };
                    match self.heap.get_mut(class) {
                        Obj::Class(c) => {
                            c.methods.insert(name, method);
                        }
                        _ => unreachable!(),
                    }
                    self.pop();
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance = receiver
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)));
                    let Some(r) = instance else {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    };
                    let (class, field) = match self.heap.get(r) {
                        Obj::Instance(i) => (i.class, i.fields.get(&name).copied()),
                        _ => unreachable!(),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => self
                            .bind_method(class, &name)
                            .map_err(|m| self.runtime_error(m))?,
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    let instance = target
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)));
                    let Some(r) = instance else {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    };
                    let value = self.peek(0);
                    match self.heap.get_mut(r) {
                        Obj::Instance(i) => {
                            i.fields.insert(name, value);
                        }
                        _ => unreachable!(),
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass slot holds a class"),
                    };
                    self.bind_method(superclass, &name)
                        .map_err(|m| self.runtime_error(m))?;
                }

                OpCode::BuildList => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let items = self.stack.split_off(start);
                    let list = self.heap.alloc(Obj::List(items));
                    self.push(Value::Obj(list));
                }
                OpCode::GetSubscript => {
                    let index = self.pop();
                    let target = self.pop();
                    let list = target
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::List(_)));
                    let Some(r) = list else {
                        return Err(self.runtime_error("Can only subscript lists.".to_string()));
                    };
                    let Value::Number(n) = index else {
                        return Err(self.runtime_error("Index must be a number.".to_string()));
                    };
                    let len = match self.heap.get(r) {
                        Obj::List(items) => items.len(),
                        _ => unreachable!(),
                    };
                    let i = n as i64;
                    if i < 0 || i as usize >= len {
                        return Err(self.runtime_error("Index out of bounds.".to_string()));
                    }
                    let value = match self.heap.get(r) {
                        Obj::List(items) => items[i as usize],
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                OpCode::SetSubscript => {
                    let value = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    let list = target
                        .as_obj()
                        .filter(|&r| matches!(self.heap.get(r), Obj::List(_)));
                    let Some(r) = list else {
                        return Err(self.runtime_error("Can only subscript lists.".to_string()));
                    };
                    let Value::Number(n) = index else {
                        return Err(self.runtime_error("Index must be a number.".to_string()));
                    };
                    let len = match self.heap.get(r) {
                        Obj::List(items) => items.len(),
                        _ => unreachable!(),
                    };
                    let i = n as i64;
                    if i < 0 || i as usize >= len {
                        return Err(self.runtime_error("Index out of bounds.".to_string()));
                    }
                    match self.heap.get_mut(r) {
                        Obj::List(items) => items[i as usize] = value,
                        _ => unreachable!(),
                    }
                    self.push(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_program(source: &str) -> (String, Result<(), InterpretError>) {
        let mut output = Vec::new();
        let result = {
            let mut vm = Vm::with_output(Box::new(&mut output));
            vm.interpret(source)
        };
        (String::from_utf8(output).expect("utf8 output"), result)
    }

    fn run_ok(source: &str) -> String {
        let (output, result) = run_program(source);
        if let Err(e) = result {
            panic!("program failed: {e:?}\noutput so far: {output}");
        }
        output
    }

    fn run_err(source: &str) -> RuntimeError {
        match run_program(source).1 {
            Err(InterpretError::Runtime(e)) => e,
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    // -- The six end-to-end scenarios --

    #[test]
    fn prints_arithmetic() {
        assert_eq!(run_ok("print 1 + 2;"), "3\n");
    }

    #[test]
    fn concatenates_strings() {
        assert_eq!(
            run_ok(r#"var a = "hi"; var b = " there"; print a + b;"#),
            "hi there\n"
        );
    }

    #[test]
    fn closure_captures_argument() {
        let source = "fun mk(x){ fun g(){ return x; } return g; } var c = mk(42); print c();";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn super_dispatches_to_parent() {
        let source = r#"
            class A { m() { print "A.m"; } }
            class B < A { m() { super.m(); print "B.m"; } }
            B().m();
        "#;
        assert_eq!(run_ok(source), "A.m\nB.m\n");
    }

    #[test]
    fn for_loop_sums() {
        let source = "var n = 0; for (var i = 1; i <= 5; i = i + 1) n = n + i; print n;";
        assert_eq!(run_ok(source), "15\n");
    }

    #[test]
    fn list_subscript_assignment() {
        let source = "var xs = [10, 20, 30]; xs[1] = 99; print xs[0] + xs[1] + xs[2];";
        assert_eq!(run_ok(source), "139\n");
    }

    // -- Control flow and operators --

    #[test]
    fn if_else_branches() {
        assert_eq!(run_ok("if (1 < 2) print \"yes\"; else print \"no\";"), "yes\n");
        assert_eq!(run_ok("if (1 > 2) print \"yes\"; else print \"no\";"), "no\n");
    }

    #[test]
    fn while_loop_counts() {
        let source = "var i = 0; while (i < 3) { print i; i = i + 1; }";
        assert_eq!(run_ok(source), "0\n1\n2\n");
    }

    #[test]
    fn and_never_evaluates_rhs_when_false() {
        let source = r#"
            var called = false;
            fun e() { called = true; return true; }
            print false and e();
            print called;
        "#;
        assert_eq!(run_ok(source), "false\nfalse\n");
    }

    #[test]
    fn or_never_evaluates_rhs_when_true() {
        let source = r#"
            var called = false;
            fun e() { called = true; return false; }
            print true or e();
            print called;
        "#;
        assert_eq!(run_ok(source), "true\nfalse\n");
    }

    #[test]
    fn modulo_power_bitwise() {
        assert_eq!(run_ok("print 10 % 3;"), "1\n");
        assert_eq!(run_ok("print 2 ** 8;"), "256\n");
        assert_eq!(run_ok("print 6 & 3;"), "2\n");
        assert_eq!(run_ok("print 6 | 3;"), "7\n");
        assert_eq!(run_ok("print 6 ^ 3;"), "5\n");
        assert_eq!(run_ok("print 1 << 4;"), "16\n");
        assert_eq!(run_ok("print 32 >> 2;"), "8\n");
        assert_eq!(run_ok("print ~0;"), "-1\n");
    }

    #[test]
    fn negative_zero_prints_signed() {
        assert_eq!(run_ok("print -0;"), "-0\n");
    }

    #[test]
    fn equality_semantics() {
        assert_eq!(run_ok("print nil == nil;"), "true\n");
        assert_eq!(run_ok("print 0 == false;"), "false\n");
        assert_eq!(run_ok(r#"print "a" + "b" == "ab";"#), "true\n");
    }

    #[test]
    fn zero_and_empty_string_are_truthy() {
        assert_eq!(run_ok("if (0) print \"t\"; else print \"f\";"), "t\n");
        assert_eq!(run_ok("if (\"\") print \"t\"; else print \"f\";"), "t\n");
    }

    // -- Classes --

    #[test]
    fn init_sets_fields() {
        let source = r#"
            class Point {
                init(x, y) { this.x = x; this.y = y; }
                sum() { return this.x + this.y; }
            }
            print Point(3, 4).sum();
        "#;
        assert_eq!(run_ok(source), "7\n");
    }

    #[test]
    fn bound_method_keeps_receiver() {
        let source = r#"
            class Point {
                init(x) { this.x = x; }
                get() { return this.x; }
            }
            var m = Point(9).get;
            print m();
        "#;
        assert_eq!(run_ok(source), "9\n");
    }

    #[test]
    fn inherit_copies_methods() {
        let source = r#"
            class A { hi() { print "hi"; } }
            class B < A {}
            B().hi();
        "#;
        assert_eq!(run_ok(source), "hi\n");
    }

    #[test]
    fn callable_field_shadows_method() {
        let source = r#"
            class A { m() { print "method"; } }
            fun f() { print "field"; }
            var a = A();
            a.m = f;
            a.m();
        "#;
        assert_eq!(run_ok(source), "field\n");
    }

    #[test]
    fn init_returns_instance_implicitly() {
        let source = r#"
            class A { init() { this.x = 1; } }
            print A().x;
        "#;
        assert_eq!(run_ok(source), "1\n");
    }

    // -- Closures and upvalues --

    #[test]
    fn two_closures_share_one_upvalue() {
        let source = r#"
            fun mk() {
                var x = 0;
                fun inc() { x = x + 1; }
                fun get() { return x; }
                return [inc, get];
            }
            var fns = mk();
            fns[0]();
            fns[0]();
            print fns[1]();
        "#;
        assert_eq!(run_ok(source), "2\n");
    }

    #[test]
    fn counter_closures_are_independent() {
        let source = r#"
            fun counter() {
                var n = 0;
                fun inc() { n = n + 1; return n; }
                return inc;
            }
            var a = counter();
            var b = counter();
            a(); a();
            print a();
            print b();
        "#;
        assert_eq!(run_ok(source), "3\n1\n");
    }

    #[test]
    fn upvalue_closes_at_scope_exit() {
        let source = r#"
            var f = nil;
            {
                var captured = "inside";
                fun g() { print captured; }
                f = g;
            }
            f();
        "#;
        assert_eq!(run_ok(source), "inside\n");
    }

    // -- Printing --

    #[test]
    fn value_representations() {
        assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
        assert_eq!(run_ok("class A {} print A;"), "A\n");
        assert_eq!(run_ok("class A {} print A();"), "A instance\n");
        assert_eq!(run_ok("print [1, \"a\", nil];"), "[1, a, nil]\n");
        assert_eq!(run_ok("print clock;"), "<native fn clock>\n");
    }

    #[test]
    fn clock_returns_seconds() {
        assert_eq!(run_ok("print clock() > 0;"), "true\n");
    }

    // -- Runtime errors --

    #[test]
    fn undefined_variable() {
        let e = run_err("print missing;");
        assert_eq!(e.message, "Undefined variable 'missing'.");
        assert_eq!(e.trace.len(), 1);
        assert_eq!(e.trace[0].name, "script");
    }

    #[test]
    fn operand_type_mismatch_has_trace() {
        let e = run_err("fun f(a) { return a + 1; }\nf(\"x\");");
        assert_eq!(e.message, "Operands must be two numbers or two strings.");
        assert_eq!(e.trace.len(), 2);
        assert_eq!(e.trace[0].name, "f");
        assert_eq!(e.trace[0].line, 1);
        assert_eq!(e.trace[1].name, "script");
        assert_eq!(e.trace[1].line, 2);
    }

    #[test]
    fn wrong_arity() {
        let e = run_err("fun f(a) {} f();");
        assert_eq!(e.message, "Expected 1 arguments but got 0.");
    }

    #[test]
    fn call_of_non_callable() {
        let e = run_err("var a = 1; a();");
        assert_eq!(e.message, "Can only call functions and classes.");
    }

    #[test]
    fn property_on_non_instance() {
        let e = run_err("var a = 1; print a.b;");
        assert_eq!(e.message, "Only instances have properties.");
    }

    #[test]
    fn undefined_property() {
        let e = run_err("class A {} print A().missing;");
        assert_eq!(e.message, "Undefined property 'missing'.");
    }

    #[test]
    fn stack_overflow_at_frame_limit() {
        let e = run_err("fun f() { f(); } f();");
        assert_eq!(e.message, "Stack overflow.");
        assert_eq!(e.trace.len(), FRAMES_MAX);
    }

    #[test]
    fn subscript_errors() {
        assert_eq!(run_err("var a = 1; print a[0];").message, "Can only subscript lists.");
        assert_eq!(
            run_err("var a = [1]; print a[\"x\"];").message,
            "Index must be a number."
        );
        assert_eq!(run_err("var a = [1]; print a[3];").message, "Index out of bounds.");
        assert_eq!(run_err("var a = [1]; print a[0 - 1];").message, "Index out of bounds.");
    }

    // -- VM state invariants --

    #[test]
    fn vm_is_idle_after_success() {
        let mut vm = Vm::new();
        vm.interpret("var a = 1; { var b = 2; fun f() { return b; } f(); }")
            .expect("program should succeed");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_none());
    }

    #[test]
    fn vm_resets_after_runtime_error() {
        let mut vm = Vm::new();
        assert!(vm.interpret("missing;").is_err());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_none());
    }

    #[test]
    fn repl_state_persists_across_interprets() {
        let mut output = Vec::new();
        {
            let mut vm = Vm::with_output(Box::new(&mut output));
            vm.interpret("var a = 20;").expect("define");
            vm.interpret("var b = 22;").expect("define");
            vm.interpret("print a + b;").expect("use");
        }
        assert_eq!(String::from_utf8(output).unwrap(), "42\n");
    }

    #[test]
    fn running_twice_gives_identical_output() {
        let source = r#"
            fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
            print fib(12);
        "#;
        let mut output = Vec::new();
        {
            let mut vm = Vm::with_output(Box::new(&mut output));
            vm.interpret(source).expect("first run");
            vm.interpret(source).expect("second run");
        }
        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], lines[1]);
        assert_eq!(lines[0], "144");
    }

    // -- Garbage collection --

    #[test]
    fn collection_at_every_instruction_preserves_semantics() {
        let source = r#"
            fun mk(x) { fun g() { return x; } return g; }
            var keep = mk("kept");
            var i = 0;
            var s = "";
            while (i < 20) { s = s + "x"; i = i + 1; }
            class A { init() { this.v = [1, 2, 3]; } total() { return this.v[0] + this.v[1] + this.v[2]; } }
            print keep();
            print A().total();
        "#;
        let mut output = Vec::new();
        {
            let mut vm = Vm::with_output(Box::new(&mut output));
            vm.heap.set_stress(true);
            vm.interpret(source).expect("program should survive GC stress");
        }
        assert_eq!(String::from_utf8(output).unwrap(), "kept\n6\n");
    }

    #[test]
    fn collection_reclaims_garbage() {
        let mut vm = Vm::new();
        // Each iteration builds a longer string; only the last stays live.
        vm.interpret(
            r#"
            var s = "";
            var i = 0;
            while (i < 100) { s = s + "x"; i = i + 1; }
            "#,
        )
        .expect("program should succeed");
        let before = vm.heap.bytes_allocated();
        vm.collect_garbage();
        assert!(vm.heap.bytes_allocated() < before);
    }
}
