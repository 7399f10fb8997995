// File: src/vm.rs
//
// The stack machine that executes a compiled `Chunk` (spec.md §4.H). Call
// frames index into one flat value stack; dispatch is a byte-by-byte match
// over `chunk::OpCode`. Every object this file allocates is pushed onto the
// stack (or otherwise reachable from a `VmRoots` view) before the next
// allocation can run a collection -- the same GC-safety discipline
// `compiler.rs` follows with `CompilerRoots` (spec.md §5).

use std::time::Instant;

use crate::chunk::OpCode;
use crate::compiler;
use crate::errors::{CompileError, RuntimeError, TraceFrame};
use crate::gc::{Heap, ObjRef, Roots};
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeFn, NativeObj, Obj, UpvalueObj,
    UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

/// `FRAMES_MAX` bounds call depth; `STACK_MAX` is the nominal value-stack
/// budget those frames are sized against (spec.md §3 "VM state"). Unlike a
/// fixed C array, the backing `Vec<Value>` itself grows on demand -- the
/// frame-count check is what actually guards against runaway recursion.
pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

/// Either tier of failure `Vm::interpret` can report (spec.md §7).
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    pub(crate) start_time: Instant,
    pub trace_execution: bool,
    /// When set, `OP_PRINT` appends here instead of writing to stdout.
    /// Used by tests that need to assert on a program's output; production
    /// use (the CLI, the REPL) leaves this `None`.
    captured_output: Option<String>,
}

/// Everything the VM itself keeps alive, for `Heap::alloc`/`Heap::collect`
/// (spec.md §4.G's GC-root enumeration: stack slots, frame closures, open
/// upvalues, the globals table, and the cached `"init"` sentinel).
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [ObjRef],
    init_string: ObjRef,
}

impl Roots for VmRoots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for &v in self.stack {
            heap.mark_value(v);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for &r in self.open_upvalues {
            heap.mark_object(r);
        }
        heap.mark_table(self.globals);
        heap.mark_object(self.init_string);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let (init_string, _) = heap.intern_str("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            start_time: Instant::now(),
            trace_execution: false,
            captured_output: None,
        };
        crate::builtins::define_natives(&mut vm);
        vm
    }

    /// Builds a `Vm` whose `print` statements are captured in memory rather
    /// than written to stdout, for tests that assert on program output.
    pub fn new_capturing() -> Self {
        let mut vm = Self::new();
        vm.captured_output = Some(String::new());
        vm
    }

    /// Drains and returns everything printed since the last call (or since
    /// construction). Panics if this `Vm` wasn't built with
    /// [`Vm::new_capturing`].
    pub fn take_output(&mut self) -> String {
        std::mem::take(
            self.captured_output.as_mut().expect("Vm was not constructed with new_capturing()"),
        )
    }

    /// Compiles `source` and runs the resulting script as the body of an
    /// implicit top-level function, mirroring `interpret()` in the original
    /// this was distilled from. On a runtime error the VM's stack is reset
    /// so the next call starts clean (spec.md §7), which matters for the
    /// REPL, where one `Vm` outlives many calls to this method.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_ref =
            compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        self.push(Value::Obj(function_ref));
        let closure_ref =
            self.heap_alloc(Obj::Closure(ClosureObj { function: function_ref, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure_ref));

        if let Err(e) = self.call_closure(closure_ref, 0) {
            self.reset_stack();
            return Err(InterpretError::Runtime(e));
        }
        match self.run() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_stack();
                Err(InterpretError::Runtime(e))
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // --- stack helpers -------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("VM stack underflow (compiler bug)")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // --- GC-aware allocation wrappers -----------------------------------
    //
    // Each of these borrows only the non-`heap` fields of `self` to build a
    // `VmRoots`, then calls into `self.heap` -- two disjoint field borrows
    // the compiler accepts within one function body (spec.md §5).

    fn heap_alloc(&mut self, data: Obj) -> ObjRef {
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: self.init_string,
        };
        self.heap.alloc(data, &roots)
    }

    fn concat_strings(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: self.init_string,
        };
        self.heap.concat_strings(a, b, &roots)
    }

    fn string_text(&self, r: ObjRef) -> String {
        self.heap.get(r).as_string().unwrap().value.to_string()
    }

    // --- error construction ----------------------------------------------

    /// Builds a `RuntimeError` with a frame-by-frame trace, top frame first
    /// then unwinding to the script (spec.md §4.H "Runtime errors", mirrors
    /// the original's `runtimeError`).
    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::new(message.into());
        for frame in self.frames.iter().rev() {
            let function_ref = self.heap.get(frame.closure).as_closure().unwrap().function;
            let function = self.heap.get(function_ref).as_function().unwrap();
            let line = function.chunk.get_line(frame.ip.saturating_sub(1));
            let function_name =
                function.name.map(|n| self.heap.get(n).as_string().unwrap().value.to_string());
            err.trace.push(TraceFrame { line, function_name });
        }
        err
    }

    // --- bytecode readers ------------------------------------------------

    fn current_frame_index(&self) -> usize {
        self.frames.len() - 1
    }

    fn current_function(&self, frame_idx: usize) -> ObjRef {
        self.heap.get(self.frames[frame_idx].closure).as_closure().unwrap().function
    }

    fn read_byte(&mut self) -> u8 {
        let idx = self.current_frame_index();
        let function_ref = self.current_function(idx);
        let ip = self.frames[idx].ip;
        let byte = self.heap.get(function_ref).as_function().unwrap().chunk.code[ip];
        self.frames[idx].ip = ip + 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_u24(&mut self) -> u32 {
        let a = self.read_byte() as u32;
        let b = self.read_byte() as u32;
        let c = self.read_byte() as u32;
        (a << 16) | (b << 8) | c
    }

    fn read_operand_index(&mut self, short: bool) -> usize {
        if short {
            self.read_byte() as usize
        } else {
            self.read_u24() as usize
        }
    }

    fn read_constant(&mut self, short: bool) -> Value {
        let idx = self.read_operand_index(short);
        let idx_frame = self.current_frame_index();
        let function_ref = self.current_function(idx_frame);
        self.heap.get(function_ref).as_function().unwrap().chunk.constants[idx]
    }

    fn jump_forward(&mut self, offset: u16) {
        let idx = self.current_frame_index();
        self.frames[idx].ip += offset as usize;
    }

    fn jump_backward(&mut self, offset: u16) {
        let idx = self.current_frame_index();
        self.frames[idx].ip -= offset as usize;
    }

    // --- upvalues ----------------------------------------------------------

    /// `captureUpvalue`: returns an existing open upvalue at `slot`, or
    /// creates one. `open_upvalues` stays sorted by descending stack
    /// location so `close_upvalues` can pop from the front (spec.md §4.H
    /// "Upvalues").
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            match self.heap.get(r).as_upvalue().unwrap().state {
                UpvalueState::Open(loc) if loc == slot => return r,
                UpvalueState::Open(loc) if loc < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let r = self.heap_alloc(Obj::Upvalue(UpvalueObj { state: UpvalueState::Open(slot) }));
        self.open_upvalues.insert(insert_at, r);
        r
    }

    /// `closeUpvalues`: hoists every open upvalue at or above `threshold`
    /// off the stack and into its own storage.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let loc = match self.heap.get(r).as_upvalue().unwrap().state {
                UpvalueState::Open(loc) => loc,
                UpvalueState::Closed(_) => unreachable!("closed upvalue left in the open list"),
            };
            if loc < threshold {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.stack[loc];
            self.heap.get_mut(r).as_upvalue_mut().unwrap().state = UpvalueState::Closed(value);
        }
    }

    fn read_upvalue(&self, closure_ref: ObjRef, slot: usize) -> Value {
        let uv_ref = self.heap.get(closure_ref).as_closure().unwrap().upvalues[slot];
        match self.heap.get(uv_ref).as_upvalue().unwrap().state {
            UpvalueState::Open(loc) => self.stack[loc],
            UpvalueState::Closed(v) => v,
        }
    }

    fn write_upvalue(&mut self, closure_ref: ObjRef, slot: usize, value: Value) {
        let uv_ref = self.heap.get(closure_ref).as_closure().unwrap().upvalues[slot];
        match self.heap.get(uv_ref).as_upvalue().unwrap().state {
            UpvalueState::Open(loc) => self.stack[loc] = value,
            UpvalueState::Closed(_) => {
                self.heap.get_mut(uv_ref).as_upvalue_mut().unwrap().state =
                    UpvalueState::Closed(value);
            }
        }
    }

    // --- call dispatch -------------------------------------------------

    /// `callValue`: dispatches on the callee's heap kind (spec.md §4.H
    /// "Call dispatch").
    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        if let Value::Obj(r) = callee {
            enum Kind {
                Closure,
                Native,
                Class,
                BoundMethod,
                Other,
            }
            let kind = match self.heap.get(r) {
                Obj::Closure(_) => Kind::Closure,
                Obj::Native(_) => Kind::Native,
                Obj::Class(_) => Kind::Class,
                Obj::BoundMethod(_) => Kind::BoundMethod,
                _ => Kind::Other,
            };
            return match kind {
                Kind::Closure => self.call_closure(r, arg_count),
                Kind::Native => self.call_native(r, arg_count),
                Kind::Class => self.call_class(r, arg_count),
                Kind::BoundMethod => self.call_bound_method(r, arg_count),
                Kind::Other => Err(self.runtime_error("Can only call functions and classes.")),
            };
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_closure(&mut self, closure_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let function_ref = self.heap.get(closure_ref).as_closure().unwrap().function;
        let arity = self.heap.get(function_ref).as_function().unwrap().arity;
        if arity != arg_count {
            return Err(
                self.runtime_error(format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let function: NativeFn = self.heap.get(native_ref).as_native().unwrap().function;
        let start = self.stack.len() - arg_count as usize;
        let args: Vec<Value> = self.stack[start..].to_vec();
        match function(self, &args) {
            Ok(result) => {
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    /// `OP_CALL` on a class value constructs an instance, then re-dispatches
    /// to its `init` method if one exists; otherwise the call must be
    /// zero-argument (spec.md §4.H "Call dispatch", "Class").
    fn call_class(&mut self, class_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let instance_ref =
            self.heap_alloc(Obj::Instance(InstanceObj { class: class_ref, fields: Table::new() }));
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance_ref);

        let init_hash = self.heap.string_hash(self.init_string);
        let initializer =
            self.heap.get(class_ref).as_class().unwrap().methods.get(self.init_string, init_hash);
        if let Some(Value::Obj(init_ref)) = initializer {
            return self.call_closure(init_ref, arg_count);
        }
        if arg_count != 0 {
            return Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")));
        }
        Ok(())
    }

    fn call_bound_method(&mut self, bound_ref: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let bound = self.heap.get(bound_ref).as_bound_method().unwrap();
        let receiver = bound.receiver;
        let method = bound.method;
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = receiver;
        self.call_closure(method, arg_count)
    }

    /// `OP_INVOKE`: the `receiver.method(args)` fast path -- looks up
    /// `name` as a field first (a field can hold a callable value), then
    /// falls back to the class's method table without materializing a
    /// `BoundMethod` (spec.md §4.H "Invoke").
    fn invoke(&mut self, name: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count as usize);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.heap.string_hash(name);
        let field_value = self.heap.get(instance_ref).as_instance().unwrap().fields.get(name, hash);
        if let Some(value) = field_value {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        let class_ref = self.heap.get(instance_ref).as_instance().unwrap().class;
        let method = self.heap.get(class_ref).as_class().unwrap().methods.get(name, hash);
        match method {
            Some(Value::Obj(closure_ref)) => self.call_closure(closure_ref, arg_count),
            _ => {
                let name_text = self.string_text(name);
                Err(self.runtime_error(format!("Undefined property '{name_text}'.")))
            }
        }
    }

    // --- the dispatch loop -----------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace_execution {
                let idx = self.current_frame_index();
                eprintln!("ip={} stack_depth={}", self.frames[idx].ip, self.stack.len());
            }

            let op = OpCode::from_byte(self.read_byte());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant(true);
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let v = self.read_constant(false);
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_byte() as usize + 2;
                    let new_len = self.stack.len() - n;
                    self.stack.truncate(new_len);
                }
                OpCode::GetLocal | OpCode::GetLocalLong => {
                    let slot = self.read_operand_index(op == OpCode::GetLocal);
                    let base = self.frames[self.current_frame_index()].slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal | OpCode::SetLocalLong => {
                    let slot = self.read_operand_index(op == OpCode::SetLocal);
                    let base = self.frames[self.current_frame_index()].slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name_ref = self.read_constant(op == OpCode::GetGlobal).as_obj().unwrap();
                    let hash = self.heap.string_hash(name_ref);
                    match self.globals.get(name_ref, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let name = self.string_text(name_ref);
                            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                        }
                    }
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name_ref = self.read_constant(op == OpCode::DefineGlobal).as_obj().unwrap();
                    let hash = self.heap.string_hash(name_ref);
                    let value = self.peek(0);
                    if self.globals.set_if_new(name_ref, hash, value) {
                        self.pop();
                    } else {
                        let name = self.string_text(name_ref);
                        return Err(
                            self.runtime_error(format!("Global named '{name}' already exists."))
                        );
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name_ref = self.read_constant(op == OpCode::SetGlobal).as_obj().unwrap();
                    let hash = self.heap.string_hash(name_ref);
                    let value = self.peek(0);
                    if !self.globals.set_if_exists(name_ref, hash, value) {
                        let name = self.string_text(name_ref);
                        return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
                    }
                }
                OpCode::GetUpvalue | OpCode::GetUpvalueLong => {
                    let slot = self.read_operand_index(op == OpCode::GetUpvalue);
                    let closure_ref = self.frames[self.current_frame_index()].closure;
                    self.push(self.read_upvalue(closure_ref, slot));
                }
                OpCode::SetUpvalue | OpCode::SetUpvalueLong => {
                    let slot = self.read_operand_index(op == OpCode::SetUpvalue);
                    let closure_ref = self.frames[self.current_frame_index()].closure;
                    let value = self.peek(0);
                    self.write_upvalue(closure_ref, slot, value);
                }
                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    self.op_get_property(op == OpCode::GetProperty)?;
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    self.op_set_property(op == OpCode::SetProperty)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.binary_numeric(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_numeric(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_numeric(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    let text = crate::value::ValueDisplay { value: v, heap: &self.heap }.to_string();
                    match &mut self.captured_output {
                        Some(buf) => {
                            buf.push_str(&text);
                            buf.push('\n');
                        }
                        None => println!("{text}"),
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.jump_forward(offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.jump_forward(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.jump_backward(offset);
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let name_ref = self.read_constant(op == OpCode::Invoke).as_obj().unwrap();
                    let arg_count = self.read_byte();
                    self.invoke(name_ref, arg_count)?;
                }
                OpCode::Closure | OpCode::ClosureLong => {
                    self.op_closure(op == OpCode::Closure);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slot_base = self.frames.last().unwrap().slot_base;
                    self.close_upvalues(slot_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(());
                    }
                    self.stack.truncate(slot_base);
                    self.push(result);
                }
                OpCode::Class | OpCode::ClassLong => {
                    let name_ref = self.read_constant(op == OpCode::Class).as_obj().unwrap();
                    let class_ref =
                        self.heap_alloc(Obj::Class(ClassObj { name: name_ref, methods: Table::new() }));
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Method | OpCode::MethodLong => {
                    let name_ref = self.read_constant(op == OpCode::Method).as_obj().unwrap();
                    let hash = self.heap.string_hash(name_ref);
                    let method_val = self.pop();
                    let class_ref = self.peek(0).as_obj().unwrap();
                    self.heap.with_object_mut(class_ref, |obj| {
                        obj.as_class_mut().unwrap().methods.set(name_ref, hash, method_val)
                    });
                }
            }
        }
    }

    fn binary_numeric(&mut self, f: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(na), Some(nb)) => {
                self.pop();
                self.pop();
                self.push(f(na, nb));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    /// `OP_ADD`: number + number, or string + string (concatenation).
    /// Operands stay on the stack through the potentially-allocating
    /// concat call so they remain GC roots (spec.md §5).
    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb))
                if matches!(self.heap.get(ra), Obj::Str(_)) && matches!(self.heap.get(rb), Obj::Str(_)) =>
            {
                let result = self.concat_strings(ra, rb);
                self.pop();
                self.pop();
                self.push(Value::Obj(result));
                Ok(())
            }
            _ => match (a.as_number(), b.as_number()) {
                (Some(na), Some(nb)) => {
                    self.pop();
                    self.pop();
                    self.push(Value::Number(na + nb));
                    Ok(())
                }
                _ => Err(self.runtime_error("Operands must be two numbers or two strings")),
            },
        }
    }

    /// `OP_GET_PROPERTY`: field lookup first; on a miss, binds a matching
    /// class method into a `BoundMethod` rather than erroring, so a method
    /// can be read out as a first-class value (e.g. `var m = p.sum;`).
    fn op_get_property(&mut self, short: bool) -> Result<(), RuntimeError> {
        let name_ref = self.read_constant(short).as_obj().unwrap();
        let receiver = self.peek(0);
        let instance_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => {
                return Err(
                    self.runtime_error("Trying to access a property on a non-instance object.")
                )
            }
        };
        let hash = self.heap.string_hash(name_ref);
        let field_value = self.heap.get(instance_ref).as_instance().unwrap().fields.get(name_ref, hash);
        if let Some(v) = field_value {
            self.pop();
            self.push(v);
            return Ok(());
        }
        let class_ref = self.heap.get(instance_ref).as_instance().unwrap().class;
        let method = self.heap.get(class_ref).as_class().unwrap().methods.get(name_ref, hash);
        match method {
            Some(Value::Obj(closure_ref)) => {
                let bound_ref =
                    self.heap_alloc(Obj::BoundMethod(BoundMethodObj { receiver, method: closure_ref }));
                self.pop();
                self.push(Value::Obj(bound_ref));
                Ok(())
            }
            _ => {
                let name_text = self.string_text(name_ref);
                Err(self.runtime_error(format!("Undefined property '{name_text}'.")))
            }
        }
    }

    fn op_set_property(&mut self, short: bool) -> Result<(), RuntimeError> {
        let name_ref = self.read_constant(short).as_obj().unwrap();
        let target = self.peek(1);
        let instance_ref = match target {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => {
                return Err(self.runtime_error("Trying to set a property on a non-instance object."))
            }
        };
        let hash = self.heap.string_hash(name_ref);
        let value = self.peek(0);
        self.heap.with_object_mut(instance_ref, |obj| {
            obj.as_instance_mut().unwrap().fields.set(name_ref, hash, value)
        });
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// `OP_CLOSURE`: the closure is pushed before its upvalue array is
    /// filled in, so capturing a local (which may itself allocate a fresh
    /// open upvalue) never leaves the new closure unrooted (spec.md §5,
    /// §4.H "Closure").
    fn op_closure(&mut self, short: bool) {
        let function_ref = self.read_constant(short).as_obj().unwrap();
        let upvalue_count = self.heap.get(function_ref).as_function().unwrap().upvalue_count;

        let closure_ref = self.heap_alloc(Obj::Closure(ClosureObj {
            function: function_ref,
            upvalues: Vec::with_capacity(upvalue_count as usize),
        }));
        self.push(Value::Obj(closure_ref));

        let enclosing_closure = self.frames[self.current_frame_index()].closure;

        for _ in 0..upvalue_count {
            let flag = self.read_byte();
            let is_local = flag & 0x1 != 0;
            let is_long = flag & 0x2 != 0;
            let index = if is_long { self.read_u24() } else { self.read_byte() as u32 };
            let captured = if is_local {
                let base = self.frames[self.current_frame_index()].slot_base;
                self.capture_upvalue(base + index as usize)
            } else {
                self.heap.get(enclosing_closure).as_closure().unwrap().upvalues[index as usize]
            };
            self.heap.get_mut(closure_ref).as_closure_mut().unwrap().upvalues.push(captured);
        }
    }

    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let (name_ref, _) = self.heap.intern_str(name);
        self.push(Value::Obj(name_ref));
        let native_ref = self.heap_alloc(Obj::Native(NativeObj { name: name_ref, function }));
        self.push(Value::Obj(native_ref));
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
        self.pop();
        self.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> Vm {
        let mut vm = Vm::new();
        run_ok_with(&mut vm, source);
        vm
    }

    fn run_ok_with(vm: &mut Vm, source: &str) {
        match vm.interpret(source) {
            Ok(()) => {}
            Err(InterpretError::Compile(errs)) => panic!(
                "compile error: {:?}",
                errs.iter().map(|e| e.to_string()).collect::<Vec<_>>()
            ),
            Err(InterpretError::Runtime(e)) => panic!("runtime error: {e}"),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        run_ok("var x = 1 + 2 * 3 - 4 / 2;");
    }

    #[test]
    fn global_redefinition_is_an_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = 1; var x = 2;");
        assert!(matches!(err, Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn undefined_variable_read_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("print nope;");
        match err {
            Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Undefined variable")),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn closures_capture_and_mutate_shared_upvalues() {
        run_ok(
            r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = makeCounter();
            counter();
            counter();
            "#,
        );
    }

    #[test]
    fn classes_construct_and_call_methods() {
        run_ok(
            r#"
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
                sum() {
                    return this.x + this.y;
                }
            }
            var p = Point(1, 2);
            print p.sum();
            "#,
        );
    }

    #[test]
    fn stress_gc_does_not_free_live_values() {
        let mut vm = Vm::new();
        vm.heap.stress_gc = true;
        run_ok_with(&mut vm, "var a = \"hello\" + \" \" + \"world\"; print a;");
        assert!(vm.heap.collections_run() > 0);
    }
}
