// Quill Virtual Machine
// Stack-based bytecode interpreter with self-patching inline caches

use super::globals::Globals;
use super::natives::{self, NativeFn, NativeFunction};
use super::value::{BoundMethod, Class, Closure, Instance, Upvalue, Value};
use crate::compiler::{Chunk, Constant, Function, OpCode};
use crate::error::{ErrorKind, QuillError, QuillResult, Span, StackFrame};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace};

pub const STACK_MAX: usize = 65536;
pub const FRAMES_MAX: usize = 1024;

/// One active invocation
#[derive(Debug)]
struct CallFrame {
    /// `None` while a native function runs
    closure: Option<Rc<Closure>>,
    ip: usize,
    /// Stack index of slot 0 (the callee or receiver)
    base: usize,
    /// Field-chain frames leave nothing behind when they return
    discard_result: bool,
}

/// The topmost script frame, held outside the frame stack while dispatching
struct ActiveFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

impl ActiveFrame {
    fn chunk(&self) -> &Chunk {
        &self.closure.function.chunk
    }

    fn read_byte(&mut self) -> u8 {
        let byte = self.closure.function.chunk.read_byte(self.ip);
        self.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let value = self.closure.function.chunk.read_u16(self.ip);
        self.ip += 2;
        value
    }

    fn read_name(&mut self) -> Result<Rc<str>, Fault> {
        let index = self.read_byte() as usize;
        match self.chunk().constants.get(index) {
            Some(Constant::String(name)) => Ok(name.clone()),
            _ => Err(Fault::new(ErrorKind::RuntimeError, "Expected string constant")),
        }
    }
}

/// An error raised inside the dispatch loop, before span and trace are attached
#[derive(Debug)]
struct Fault {
    kind: ErrorKind,
    message: String,
}

impl Fault {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }
}

/// Where `print` output goes
enum Output {
    Stdout,
    Captured(Vec<String>),
}

/// The Quill virtual machine
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Globals,
    /// Open upvalue cells sorted by stack slot, highest last
    open_upvalues: Vec<(usize, Rc<RefCell<Upvalue>>)>,
    output: Output,
    file: String,
    source: Option<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: Globals::new(),
            open_upvalues: Vec::new(),
            output: Output::Stdout,
            file: "<script>".to_string(),
            source: None,
        };
        natives::install_defaults(&mut vm);
        vm
    }

    /// A VM whose `print` output is buffered instead of written to stdout
    pub fn with_captured_output() -> Self {
        let mut vm = Self::new();
        vm.output = Output::Captured(Vec::new());
        vm
    }

    /// Drain captured output lines; empty when printing to stdout
    pub fn take_output(&mut self) -> Vec<String> {
        match &mut self.output {
            Output::Captured(lines) => std::mem::take(lines),
            Output::Stdout => Vec::new(),
        }
    }

    // ==================== Host API ====================

    /// Register a host function as a global
    pub fn define_native(&mut self, name: &str, arity: Option<usize>, function: NativeFn) {
        let native = NativeFunction::new(name, arity, function);
        let value = Value::Native(Rc::new(native));
        if self.globals.define(Rc::from(name), value).is_none() {
            debug!(name, "globals table full, native not registered");
        }
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.lookup(name).cloned()
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> QuillResult<()> {
        match self.globals.define(Rc::from(name), value) {
            Some(_) => Ok(()),
            None => Err(QuillError::runtime_error(
                "Too many global variables",
                Span::default(),
                &self.file,
            )),
        }
    }

    /// Argument `index` of the running native function, or null if absent
    pub fn arg(&self, index: usize) -> Value {
        self.frames
            .last()
            .and_then(|frame| self.stack.get(frame.base + 1 + index))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Compile and run source text
    pub fn run_source(&mut self, source: &str, file: &str) -> QuillResult<Value> {
        let program = crate::compile(source, file)?;
        self.run_compiled(program.function, source, file)
    }

    /// Run an already compiled script; `source` is used for error context
    pub fn run_compiled(
        &mut self,
        function: Rc<Function>,
        source: &str,
        file: &str,
    ) -> QuillResult<Value> {
        self.file = file.to_string();
        self.source = Some(source.to_string());
        self.interpret(function)
    }

    /// Run a compiled top-level function
    pub fn interpret(&mut self, function: Rc<Function>) -> QuillResult<Value> {
        let closure = Rc::new(Closure::new(function, Vec::new()));
        self.call_function(Value::Closure(closure), &[])
    }

    /// Call any callable value from the host and run it to completion
    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> QuillResult<Value> {
        let base_frames = self.frames.len();
        let slot = self.stack.len();

        self.push(callee.clone());
        self.stack.extend(args.iter().cloned());

        if let Err(fault) = self.call_value(callee, args.len()) {
            let error = self.to_error(fault);
            self.unwind(base_frames, slot);
            return Err(error);
        }

        // Natives and construction without field chains complete immediately
        if self.frames.len() == base_frames {
            return Ok(self.pop());
        }

        match self.run(base_frames) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.unwind(base_frames, slot);
                Err(error)
            }
        }
    }

    /// Restore the stack and frames to a call boundary after an error
    fn unwind(&mut self, base_frames: usize, slot: usize) {
        self.frames.truncate(base_frames);
        self.close_upvalues(slot);
        self.stack.truncate(slot);
    }

    // ==================== Dispatch ====================

    fn run(&mut self, stop_depth: usize) -> QuillResult<Value> {
        let mut frame = match self.active_frame() {
            Ok(frame) => frame,
            Err(fault) => return Err(self.to_error(fault)),
        };

        match self.execute(stop_depth, &mut frame) {
            Ok(value) => Ok(value),
            Err(fault) => {
                if let Some(top) = self.frames.last_mut() {
                    let same_frame = top.base == frame.base
                        && top
                            .closure
                            .as_ref()
                            .is_some_and(|c| Rc::ptr_eq(c, &frame.closure));
                    if same_frame {
                        top.ip = frame.ip;
                    }
                }
                Err(self.to_error(fault))
            }
        }
    }

    fn active_frame(&self) -> Result<ActiveFrame, Fault> {
        match self.frames.last() {
            Some(CallFrame {
                closure: Some(closure),
                ip,
                base,
                ..
            }) => Ok(ActiveFrame {
                closure: closure.clone(),
                ip: *ip,
                base: *base,
            }),
            _ => Err(Fault::new(ErrorKind::RuntimeError, "No active script frame")),
        }
    }

    fn store_ip(&mut self, frame: &ActiveFrame) {
        if let Some(top) = self.frames.last_mut() {
            top.ip = frame.ip;
        }
    }

    fn execute(&mut self, stop_depth: usize, frame: &mut ActiveFrame) -> Result<Value, Fault> {
        loop {
            let op_offset = frame.ip;
            let byte = frame.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(Fault::new(
                    ErrorKind::RuntimeError,
                    format!("Unknown opcode {}", byte),
                ));
            };

            match op {
                OpCode::Constant => {
                    let index = frame.read_byte() as usize;
                    let value = match frame.chunk().constants.get(index) {
                        Some(Constant::Number(n)) => Value::Number(*n),
                        Some(Constant::String(s)) => Value::String(s.clone()),
                        _ => {
                            return Err(Fault::new(
                                ErrorKind::RuntimeError,
                                "Invalid constant operand",
                            ))
                        }
                    };
                    self.push(value);
                }
                OpCode::SmallInt => {
                    let value = frame.read_byte();
                    self.push(Value::Number(value as f64));
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Null => self.push(Value::Null),
                OpCode::True => self.push(Value::Boolean(true)),
                OpCode::False => self.push(Value::Boolean(false)),

                // ----- Globals -----
                OpCode::DefineGlobal => {
                    let name = frame.read_name()?;
                    let value = self.pop();
                    if self.globals.define(name, value).is_none() {
                        return Err(Fault::new(
                            ErrorKind::RuntimeError,
                            "Too many global variables",
                        ));
                    }
                }
                OpCode::GetGlobal => {
                    let name = frame.read_name()?;
                    frame.ip += 2;
                    let value = self.get_global_slow(frame.chunk(), op_offset, &name)?;
                    self.push(value);
                }
                OpCode::GetGlobalCached => {
                    let name = frame.read_name()?;
                    let slot = frame.read_u16();
                    // Slots are per VM; a chunk shared between VMs may carry a foreign one
                    let value = match self.globals.named(slot, &name) {
                        Some(value) => value.clone(),
                        None => self.get_global_slow(frame.chunk(), op_offset, &name)?,
                    };
                    self.push(value);
                }
                OpCode::SetGlobal => {
                    let name = frame.read_name()?;
                    frame.ip += 2;
                    self.set_global_slow(frame.chunk(), op_offset, name)?;
                }
                OpCode::SetGlobalCached => {
                    let name = frame.read_name()?;
                    let slot = frame.read_u16();
                    let value = self.peek(0).clone();
                    if !self.globals.set_named(slot, &name, value) {
                        self.set_global_slow(frame.chunk(), op_offset, name)?;
                    }
                }

                // ----- Locals and upvalues -----
                OpCode::GetLocal => {
                    let slot = frame.read_byte() as usize;
                    let value = self.stack[frame.base + slot].clone();
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = frame.read_byte() as usize;
                    self.stack[frame.base + slot] = self.peek(0).clone();
                }
                OpCode::GetUpvalue => {
                    let index = frame.read_byte() as usize;
                    let value = match &*frame.closure.upvalues[index].borrow() {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = frame.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let mut cell = frame.closure.upvalues[index].borrow_mut();
                    match &mut *cell {
                        Upvalue::Open(slot) => self.stack[*slot] = value,
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                // ----- Properties -----
                OpCode::GetProperty => {
                    let name = frame.read_name()?;
                    frame.ip += 2;
                    self.get_property(frame.chunk(), op_offset, &name)?;
                }
                OpCode::GetFieldCached => {
                    let name = frame.read_name()?;
                    let index = frame.read_u16() as usize;
                    let cached = match self.peek(0) {
                        Value::Instance(instance) => {
                            instance.borrow().field_named(index, &name).cloned()
                        }
                        _ => None,
                    };
                    match cached {
                        Some(value) => self.replace_top(value),
                        None => self.get_property(frame.chunk(), op_offset, &name)?,
                    }
                }
                OpCode::GetMethodCached => {
                    let name = frame.read_name()?;
                    let index = frame.read_u16() as usize;
                    let cached = match self.peek(0) {
                        Value::Instance(instance) => cached_method(instance, index, &name),
                        _ => None,
                    };
                    match cached {
                        Some(method) => {
                            let receiver = self.peek(0).clone();
                            let bound = BoundMethod { receiver, method };
                            self.replace_top(Value::BoundMethod(Rc::new(bound)));
                        }
                        None => self.get_property(frame.chunk(), op_offset, &name)?,
                    }
                }
                OpCode::SetProperty => {
                    let name = frame.read_name()?;
                    frame.ip += 2;
                    self.set_property(frame.chunk(), op_offset, name)?;
                }
                OpCode::SetFieldCached => {
                    let name = frame.read_name()?;
                    let index = frame.read_u16() as usize;
                    let value = self.peek(0).clone();
                    let updated = match self.peek(1) {
                        Value::Instance(instance) => {
                            let mut instance = instance.borrow_mut();
                            let entry = instance.fields.get_mut(index);
                            match entry {
                                Some((field, slot)) if **field == *name => {
                                    *slot = value.clone();
                                    true
                                }
                                _ => false,
                            }
                        }
                        _ => false,
                    };
                    if updated {
                        self.pop();
                        self.replace_top(value);
                    } else {
                        self.set_property(frame.chunk(), op_offset, name)?;
                    }
                }
                OpCode::GetSuper => {
                    let name = frame.read_name()?;
                    let superclass = self.pop();
                    let receiver = self.pop();
                    let Value::Class(superclass) = superclass else {
                        return Err(Fault::type_error("Superclass must be a class"));
                    };
                    let method = {
                        let class = superclass.borrow();
                        class.find_method(&name).map(|index| class.methods[index].1.clone())
                    };
                    let Some(method) = method else {
                        return Err(Fault::new(
                            ErrorKind::AttributeError,
                            format!("Undefined superclass method '{}'", name),
                        ));
                    };
                    self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })));
                }

                // ----- Arithmetic -----
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                        (Value::String(a), Value::String(b)) => {
                            let mut joined = String::with_capacity(a.len() + b.len());
                            joined.push_str(a);
                            joined.push_str(b);
                            Value::String(Rc::from(joined))
                        }
                        _ => {
                            return Err(Fault::type_error(format!(
                                "Cannot add '{}' and '{}'",
                                a.type_name(),
                                b.type_name()
                            )))
                        }
                    };
                    self.push(result);
                }
                OpCode::Sub => self.binary_number_op(|a, b| a - b)?,
                OpCode::Mul => self.binary_number_op(|a, b| a * b)?,
                // A zero divisor follows IEEE 754: inf, -inf or NaN
                OpCode::Div => self.binary_number_op(|a, b| a / b)?,
                OpCode::Mod => self.binary_number_op(|a, b| a % b)?,
                OpCode::Negate => match self.pop() {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    other => {
                        return Err(Fault::type_error(format!(
                            "Cannot negate '{}'",
                            other.type_name()
                        )))
                    }
                },

                // ----- Comparison -----
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Boolean(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Boolean(a != b));
                }
                OpCode::Less => self.comparison_op(|a, b| a < b)?,
                OpCode::LessEqual => self.comparison_op(|a, b| a <= b)?,
                OpCode::Greater => self.comparison_op(|a, b| a > b)?,
                OpCode::GreaterEqual => self.comparison_op(|a, b| a >= b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Boolean(!value.is_truthy()));
                }

                // ----- Statements -----
                OpCode::Print => {
                    let value = self.pop();
                    self.write_line(value.to_string());
                }
                OpCode::Throw => {
                    let value = self.pop();
                    return Err(Fault::new(ErrorKind::Panic, value.to_string()));
                }

                // ----- Control flow -----
                OpCode::Jump => {
                    let offset = frame.read_u16() as usize;
                    frame.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = frame.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        frame.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = frame.read_u16() as usize;
                    frame.ip -= offset;
                }

                // ----- Calls -----
                OpCode::Call => {
                    let argc = frame.read_byte() as usize;
                    let callee = self.peek(argc).clone();
                    self.store_ip(frame);
                    self.call_value(callee, argc)?;
                    *frame = self.active_frame()?;
                }
                OpCode::Invoke => {
                    let name = frame.read_name()?;
                    let argc = frame.read_byte() as usize;
                    frame.ip += 2;
                    self.store_ip(frame);
                    self.invoke(frame.chunk(), op_offset, &name, argc)?;
                    *frame = self.active_frame()?;
                }
                OpCode::InvokeCached => {
                    let name = frame.read_name()?;
                    let argc = frame.read_byte() as usize;
                    let index = frame.read_u16() as usize;
                    self.store_ip(frame);

                    let cached = match self.peek(argc) {
                        Value::Instance(instance) => cached_method(instance, index, &name),
                        _ => None,
                    };
                    match cached {
                        Some(method) => self.call_closure(method, argc, false)?,
                        None => self.invoke(frame.chunk(), op_offset, &name, argc)?,
                    }
                    *frame = self.active_frame()?;
                }
                OpCode::Closure => {
                    let index = frame.read_byte() as usize;
                    let Some(Constant::Function(function)) = frame.chunk().constants.get(index)
                    else {
                        return Err(Fault::new(
                            ErrorKind::RuntimeError,
                            "Expected function constant",
                        ));
                    };
                    let function = function.clone();

                    let mut upvalues = Vec::with_capacity(function.upvalue_count());
                    for _ in 0..function.upvalue_count() {
                        let is_local = frame.read_byte() == 1;
                        let index = frame.read_byte() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(frame.base + index));
                        } else {
                            upvalues.push(frame.closure.upvalues[index].clone());
                        }
                    }
                    self.push(Value::Closure(Rc::new(Closure::new(function, upvalues))));
                }
                OpCode::Return => {
                    let result = self.pop();
                    let Some(finished) = self.frames.pop() else {
                        return Err(Fault::new(ErrorKind::RuntimeError, "Return without frame"));
                    };
                    self.close_upvalues(finished.base);
                    self.stack.truncate(finished.base);
                    if !finished.discard_result {
                        self.push(result);
                    }

                    if self.frames.len() == stop_depth {
                        // A discarded result leaves the constructed instance on top
                        return Ok(self.pop());
                    }
                    *frame = self.active_frame()?;
                }

                // ----- Classes -----
                OpCode::Class => {
                    let name = frame.read_name()?;
                    let class = Class::new(name);
                    self.push(Value::Class(Rc::new(RefCell::new(class))));
                }
                OpCode::Inherit => {
                    let subclass = self.pop();
                    let (Value::Class(superclass), Value::Class(subclass)) =
                        (self.peek(0), &subclass)
                    else {
                        return Err(Fault::type_error("Superclass must be a class"));
                    };
                    subclass.borrow_mut().inherit_from(&superclass.borrow());
                }
                OpCode::Method => {
                    let name = frame.read_name()?;
                    let method = self.pop();
                    match (self.peek(0), method) {
                        (Value::Class(class), Value::Closure(method)) => {
                            class.borrow_mut().add_method(name, method);
                        }
                        _ => return Err(Fault::type_error("Methods must be defined on a class")),
                    }
                }
                OpCode::Field => {
                    let name = frame.read_name()?;
                    match self.peek(0) {
                        Value::Class(class) => class.borrow_mut().declare_field(name),
                        _ => return Err(Fault::type_error("Fields must be declared on a class")),
                    }
                }
                OpCode::FieldChain => {
                    let chain = self.pop();
                    match (self.peek(0), chain) {
                        (Value::Class(class), Value::Closure(chain)) => {
                            class.borrow_mut().field_chains.push(chain);
                        }
                        _ => return Err(Fault::type_error("Field chains belong to a class")),
                    }
                }
            }
        }
    }

    // ==================== Calls ====================

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), Fault> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc, false),
            Value::Native(native) => self.call_native(native, argc),
            Value::Class(class) => self.construct(class, argc),
            Value::BoundMethod(bound) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bound.receiver.clone();
                self.call_closure(bound.method.clone(), argc, false)
            }
            other => Err(Fault::type_error(format!(
                "'{}' is not callable",
                other.type_name()
            ))),
        }
    }

    fn check_depth(&self) -> Result<(), Fault> {
        if self.frames.len() >= FRAMES_MAX || self.stack.len() >= STACK_MAX {
            return Err(Fault::new(ErrorKind::RuntimeError, "Stack overflow"));
        }
        Ok(())
    }

    fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        argc: usize,
        discard_result: bool,
    ) -> Result<(), Fault> {
        if argc != closure.function.arity {
            return Err(Fault::new(
                ErrorKind::ArgumentError,
                format!(
                    "Expected {} arguments but got {}",
                    closure.function.arity, argc
                ),
            ));
        }
        self.check_depth()?;

        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure: Some(closure),
            ip: 0,
            base,
            discard_result,
        });
        Ok(())
    }

    fn call_native(&mut self, native: Rc<NativeFunction>, argc: usize) -> Result<(), Fault> {
        if let Some(arity) = native.arity {
            if argc != arity {
                return Err(Fault::new(
                    ErrorKind::ArgumentError,
                    format!("Expected {} arguments but got {}", arity, argc),
                ));
            }
        }
        self.check_depth()?;

        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure: None,
            ip: 0,
            base,
            discard_result: false,
        });
        let result = (native.function)(self, argc);
        self.frames.pop();

        match result {
            Ok(value) => {
                self.stack.truncate(base);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(Fault::new(ErrorKind::RuntimeError, message)),
        }
    }

    /// Replace the class in the callee slot with a new instance, then schedule
    /// `init` and one frame per field chain. Chains sit above `init` on the
    /// frame stack, so every field initializer runs before `init` does.
    fn construct(&mut self, class: Rc<RefCell<Class>>, argc: usize) -> Result<(), Fault> {
        let slot = self.stack.len() - argc - 1;
        let instance = Value::Instance(Rc::new(RefCell::new(Instance::new(class.clone()))));
        self.stack[slot] = instance.clone();

        let (initializer, chains) = {
            let class = class.borrow();
            debug!(
                class = %class.name,
                argc,
                chains = class.field_chains.len(),
                "constructing instance"
            );
            (class.initializer.clone(), class.field_chains.clone())
        };

        match initializer {
            Some(init) => self.call_closure(init, argc, false)?,
            None if argc != 0 => {
                return Err(Fault::new(
                    ErrorKind::ArgumentError,
                    format!("Expected 0 arguments but got {}", argc),
                ))
            }
            None => {}
        }

        for chain in chains.into_iter().rev() {
            self.push(instance.clone());
            self.call_closure(chain, 0, true)?;
        }
        Ok(())
    }

    /// Uncached `receiver.name(args)`; caches the method slot on success
    fn invoke(
        &mut self,
        chunk: &Chunk,
        op_offset: usize,
        name: &str,
        argc: usize,
    ) -> Result<(), Fault> {
        let receiver = self.peek(argc).clone();
        let Value::Instance(instance) = receiver else {
            return Err(Fault::type_error(format!(
                "Only instances have methods, not '{}'",
                receiver.type_name()
            )));
        };

        // A field holding a callable shadows a method of the same name
        let field = instance.borrow().get_field(name).cloned();
        if let Some(field) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field.clone();
            return self.call_value(field, argc);
        }

        let class = instance.borrow().class.clone();
        let found = {
            let class = class.borrow();
            class
                .find_method(name)
                .map(|index| (index, class.methods[index].1.clone()))
        };
        let Some((index, method)) = found else {
            return Err(undefined_property(&class, name));
        };

        cache_instruction(chunk, op_offset, OpCode::InvokeCached, index as u16);
        self.call_closure(method, argc, false)
    }

    // ==================== Properties ====================

    /// Uncached property read on the value on top of the stack
    fn get_property(&mut self, chunk: &Chunk, op_offset: usize, name: &str) -> Result<(), Fault> {
        let Value::Instance(instance) = self.peek(0).clone() else {
            return Err(Fault::type_error(format!(
                "Only instances have properties, not '{}'",
                self.peek(0).type_name()
            )));
        };

        let field = {
            let instance = instance.borrow();
            instance
                .field_index(name)
                .map(|index| (index, instance.fields[index].1.clone()))
        };
        if let Some((index, value)) = field {
            cache_instruction(chunk, op_offset, OpCode::GetFieldCached, index as u16);
            self.replace_top(value);
            return Ok(());
        }

        let class = instance.borrow().class.clone();
        let found = {
            let class = class.borrow();
            class
                .find_method(name)
                .map(|index| (index, class.methods[index].1.clone()))
        };
        let Some((index, method)) = found else {
            return Err(undefined_property(&class, name));
        };

        cache_instruction(chunk, op_offset, OpCode::GetMethodCached, index as u16);
        let bound = BoundMethod {
            receiver: Value::Instance(instance),
            method,
        };
        self.replace_top(Value::BoundMethod(Rc::new(bound)));
        Ok(())
    }

    /// Uncached `instance.name = value`; stack is [instance, value] -> [value]
    fn set_property(&mut self, chunk: &Chunk, op_offset: usize, name: Rc<str>) -> Result<(), Fault> {
        let value = self.pop();
        let Value::Instance(instance) = self.pop() else {
            return Err(Fault::type_error(format!(
                "Only instances have fields, cannot set '{}'",
                name
            )));
        };

        let index = instance.borrow_mut().set_field(name, value.clone());
        cache_instruction(chunk, op_offset, OpCode::SetFieldCached, index as u16);
        self.push(value);
        Ok(())
    }

    // ==================== Upvalues ====================

    /// Reuse the open cell for `slot` or open a new one
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        match self.open_upvalues.binary_search_by_key(&slot, |(s, _)| *s) {
            Ok(index) => self.open_upvalues[index].1.clone(),
            Err(index) => {
                let cell = Rc::new(RefCell::new(Upvalue::Open(slot)));
                self.open_upvalues.insert(index, (slot, cell.clone()));
                cell
            }
        }
    }

    /// Close every open cell at or above `from`
    fn close_upvalues(&mut self, from: usize) {
        while let Some((slot, _)) = self.open_upvalues.last() {
            if *slot < from {
                break;
            }
            if let Some((slot, cell)) = self.open_upvalues.pop() {
                let value = self.stack.get(slot).cloned().unwrap_or(Value::Null);
                *cell.borrow_mut() = Upvalue::Closed(value);
            }
        }
    }

    // ==================== Helper Methods ====================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn replace_top(&mut self, value: Value) {
        if let Some(top) = self.stack.last_mut() {
            *top = value;
        }
    }

    /// Look a global up by name and cache its slot at `op_offset`
    fn get_global_slow(&self, chunk: &Chunk, op_offset: usize, name: &str) -> Result<Value, Fault> {
        let found = self
            .globals
            .slot(name)
            .and_then(|slot| self.globals.get(slot).map(|value| (slot, value)));
        let Some((slot, value)) = found else {
            return Err(Fault::new(
                ErrorKind::NameError,
                format!("Undefined variable '{}'", name),
            ));
        };
        cache_instruction(chunk, op_offset, OpCode::GetGlobalCached, slot);
        Ok(value.clone())
    }

    /// Assign the top of stack to a global by name, defining it if needed
    fn set_global_slow(&mut self, chunk: &Chunk, op_offset: usize, name: Rc<str>) -> Result<(), Fault> {
        let value = self.peek(0).clone();
        let Some(slot) = self.globals.define(name, value) else {
            return Err(Fault::new(
                ErrorKind::RuntimeError,
                "Too many global variables",
            ));
        };
        cache_instruction(chunk, op_offset, OpCode::SetGlobalCached, slot);
        Ok(())
    }

    fn binary_number_op(&mut self, op: fn(f64, f64) -> f64) -> Result<(), Fault> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Number(op(*a, *b)));
                Ok(())
            }
            _ => Err(Fault::type_error(format!(
                "Cannot perform operation on '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn comparison_op(&mut self, op: fn(f64, f64) -> bool) -> Result<(), Fault> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Boolean(op(*a, *b)));
                Ok(())
            }
            _ => Err(Fault::type_error(format!(
                "Cannot compare '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn write_line(&mut self, line: String) {
        match &mut self.output {
            Output::Stdout => println!("{}", line),
            Output::Captured(lines) => lines.push(line),
        }
    }

    /// Attach the current span, source and stack trace to a fault
    fn to_error(&self, fault: Fault) -> QuillError {
        let script_frames = self
            .frames
            .iter()
            .rev()
            .filter_map(|frame| frame.closure.as_ref().map(|c| (c, frame.ip)));

        let mut span = Span::default();
        let mut trace = Vec::new();
        for (closure, ip) in script_frames {
            let frame_span = closure.function.chunk.get_span(ip.saturating_sub(1));
            if trace.is_empty() {
                span = frame_span;
            }
            trace.push(StackFrame::new(
                closure.function.name.to_string(),
                frame_span.start.line,
                frame_span.start.column,
            ));
        }

        debug!(kind = %fault.kind, message = %fault.message, "runtime error");

        let mut error = QuillError::new(fault.kind, fault.message, span, &self.file)
            .with_stack_trace(trace);
        if let Some(source) = &self.source {
            error = error.with_source(source);
        }
        error
    }
}

/// Rewrite the instruction at `offset` into its cached form
fn cache_instruction(chunk: &Chunk, offset: usize, cached: OpCode, slot: u16) {
    // The slot follows the name operand, and the argc for invokes
    let operand = match cached {
        OpCode::InvokeCached => offset + 3,
        _ => offset + 2,
    };
    chunk.patch_op(offset, cached);
    chunk.patch_u16(operand, slot);
    trace!(offset, op = ?cached, slot, "inline cache updated");
}

/// Method at a cached index, unless the instance's class has changed shape
fn cached_method(instance: &Rc<RefCell<Instance>>, index: usize, name: &str) -> Option<Rc<Closure>> {
    let instance = instance.borrow();
    if instance.get_field(name).is_some() {
        return None;
    }
    let class = instance.class.borrow();
    class.method_named(index, name).cloned()
}

fn undefined_property(class: &Rc<RefCell<Class>>, name: &str) -> Fault {
    Fault::new(
        ErrorKind::AttributeError,
        format!(
            "Undefined property '{}' on '{}' instance",
            name,
            class.borrow().name
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn ops(function: &Function) -> Vec<OpCode> {
        let chunk = &function.chunk;
        let mut out = String::new();
        let mut offset = 0;
        let mut found = Vec::new();
        while offset < chunk.code.len() {
            if let Some(op) = OpCode::from_byte(chunk.read_byte(offset)) {
                found.push(op);
            }
            offset = chunk.disassemble_instruction(offset, &mut out);
        }
        found
    }

    fn nested(function: &Function, name: &str) -> Rc<Function> {
        function
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if &*f.name == name => Some(f.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn globals_rewrite_after_first_use() {
        let program = compile("var x = 1; x = x + 1; print x;", "<test>").unwrap();
        let before = ops(&program.function);
        assert!(before.contains(&OpCode::GetGlobal));
        assert!(before.contains(&OpCode::SetGlobal));

        let mut vm = Vm::with_captured_output();
        vm.interpret(program.function.clone()).unwrap();

        let after = ops(&program.function);
        assert!(!after.contains(&OpCode::GetGlobal));
        assert!(after.contains(&OpCode::GetGlobalCached));
        assert!(after.contains(&OpCode::SetGlobalCached));
        assert_eq!(before.len(), after.len());
        assert_eq!(vm.take_output(), vec!["2".to_string()]);
    }

    #[test]
    fn property_sites_rewrite_by_kind() {
        let source = r#"
            class C {
                init() { this.v = 3; }
                m() { return this.v; }
            }
            fun use(o) {
                o.v = o.v + 1;
                var bound = o.m;
                return o.m() + bound();
            }
            print use(C());
        "#;
        let program = compile(source, "<test>").unwrap();
        let mut vm = Vm::with_captured_output();
        vm.interpret(program.function.clone()).unwrap();
        assert_eq!(vm.take_output(), vec!["8".to_string()]);

        let after = ops(&nested(&program.function, "use"));
        for op in [
            OpCode::SetFieldCached,
            OpCode::GetFieldCached,
            OpCode::GetMethodCached,
            OpCode::InvokeCached,
        ] {
            assert!(after.contains(&op), "missing {:?}", op);
        }
    }

    #[test]
    fn failed_lookup_leaves_site_uncached() {
        let program = compile("class C {} var c = C(); print c.missing;", "<test>").unwrap();
        let mut vm = Vm::with_captured_output();
        assert!(vm.interpret(program.function.clone()).is_err());
        assert!(ops(&program.function).contains(&OpCode::GetProperty));
    }

    #[test]
    fn error_unwinds_to_a_clean_stack() {
        let mut vm = Vm::with_captured_output();
        let err = vm
            .run_source("fun f(a) { var b = a; return b + null; } f(1);", "<test>")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn closed_upvalues_outlive_their_frame() {
        let mut vm = Vm::with_captured_output();
        let source = r#"
            fun make() {
                var hidden = "kept";
                fun reveal() { return hidden; }
                return reveal;
            }
            var r = make();
            print r();
        "#;
        vm.run_source(source, "<test>").unwrap();
        assert!(vm.open_upvalues.is_empty());
        assert_eq!(vm.take_output(), vec!["kept".to_string()]);
    }
}
