//! The Yan virtual machine
//!
//! One owned [`Vm`] value holds the whole execution state: value stack,
//! call frames, globals, open upvalues, and the heap. The dispatch loop
//! caches the current frame's instruction pointer in a local; any
//! operation that enters or leaves a frame flushes the cached pointer
//! back into the frame first, and so does every error path, so reported
//! lines always match the failing instruction.
//!
//! Allocations made while the VM runs go through [`Vm::alloc`] /
//! [`Vm::intern`], which run a collection first when the heap's byte
//! counter says so. Operands stay on the stack across allocation points,
//! which is what keeps them rooted.

use std::fmt;

use tracing::trace;
use yan_core::{
    Heap, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjList, ObjNative,
    ObjRef, ObjUpvalue, OpCode, Table, Value,
};

use crate::natives;

/// Call depth ceiling; recursion past this reports 堆栈溢出.
pub const FRAMES_MAX: usize = 64;
/// Value-stack ceiling: frame count times per-frame slots.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of one [`Vm::interpret`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// A runtime error with its stack trace, deepest frame first.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Interpreter tuning knobs, typically loaded from `yan.toml`.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub gc_threshold: usize,
    pub gc_growth: usize,
    /// Collect before every allocation; for shaking out rooting bugs.
    pub gc_stress: bool,
    /// Emit a trace event per executed instruction.
    pub trace_execution: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            gc_threshold: yan_core::heap::DEFAULT_GC_THRESHOLD,
            gc_growth: yan_core::heap::DEFAULT_GC_GROWTH,
            gc_stress: false,
            trace_execution: false,
        }
    }
}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Stack index of slot 0: the callee (receiver or function) below the
    /// first argument.
    slots: usize,
    /// Marks a frame entered through [`Vm::run_closure`]; its return
    /// exits the dispatch loop instead of unwinding further.
    is_callback: bool,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues ordered by strictly descending stack slot.
    open_upvalues: Vec<ObjRef>,
    heap: Heap,
    init_string: ObjRef,
    last_error: Option<String>,
    gc_stress: bool,
    trace_execution: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::with_config(options.gc_threshold, options.gc_growth);
        let init_string = heap.intern("初始化");
        let mut vm = Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            last_error: None,
            gc_stress: options.gc_stress,
            trace_execution: options.trace_execution,
        };
        natives::install(&mut vm);
        vm
    }

    /// Compile and run one source text. Errors are reported on stderr;
    /// the message is also kept for [`Vm::take_error`].
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match yan_compiler::compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(message) => {
                eprintln!("{message}");
                self.last_error = Some(message);
                return InterpretResult::CompileError;
            }
        };

        self.stack.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));
        if let Err(e) = self.call_closure(closure, 0) {
            return self.report(e);
        }
        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(e) => self.report(e),
        }
    }

    fn report(&mut self, e: RuntimeError) -> InterpretResult {
        eprintln!("{e}");
        self.last_error = Some(e.to_string());
        InterpretResult::RuntimeError
    }

    /// Message of the most recent compile or runtime error.
    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Read a global by name, without allocating.
    pub fn global(&self, name: &str) -> Option<Value> {
        let name_ref = self.heap.find_interned(name)?;
        self.globals.get(name_ref, self.heap.str_hash(name_ref))
    }

    // ----- external interface for native extensions -----

    /// Install a native method on a class.
    pub fn define_native(
        &mut self,
        class: ObjRef,
        name: &str,
        arity: Option<u8>,
        function: NativeFn,
    ) {
        let name_ref = self.heap.intern(name);
        let hash = self.heap.str_hash(name_ref);
        let native = self.heap.alloc(Obj::Native(ObjNative { function, arity }));
        self.heap
            .class_mut(class)
            .methods
            .set(name_ref, hash, Value::Obj(native));
    }

    /// Install a global singleton instance.
    pub fn define_native_instance(&mut self, name: &str, instance: ObjRef) {
        let name_ref = self.heap.intern(name);
        let hash = self.heap.str_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(instance));
    }

    /// Seed a field on an instance, bypassing the static-mutation guard.
    pub fn define_property(&mut self, instance: ObjRef, name: &str, value: Value) {
        let name_ref = self.heap.intern(name);
        let hash = self.heap.str_hash(name_ref);
        self.heap
            .instance_mut(instance)
            .fields
            .set(name_ref, hash, value);
    }

    // ----- stack primitives -----

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => unreachable!("value stack underflow"),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn truncate_stack(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    // ----- allocation funnel -----

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(text)
    }

    pub(crate) fn intern_chars(&mut self, chars: Vec<char>) -> ObjRef {
        self.maybe_collect();
        self.heap.intern_chars(chars)
    }

    fn maybe_collect(&mut self) {
        if self.gc_stress || self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Mark the VM roots, trace, drop dead intern keys, sweep.
    pub fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.heap.mark_object(upvalue);
        }
        self.globals.mark(&mut self.heap);
        self.heap.mark_object(self.init_string);
        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();
    }

    // ----- error construction -----

    /// Build a runtime error with the stack trace, then reset the stack.
    /// Callers flush the cached instruction pointer first.
    pub(crate) fn error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let index = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(index).copied().unwrap_or(0);
            let location = match function.name {
                Some(name) => format!("{}（）", self.heap.string(name).to_text()),
                None => "脚本".to_string(),
            };
            trace.push(format!("【行 {line}】在 {location}"));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    // ----- calls -----

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = usize::from(self.heap.function(function).arity);
        if arg_count != arity {
            return Err(self.error(format!("需要 {arity} 个参数，但得到 {arg_count}。")));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error("堆栈溢出。"));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
            is_callback: false,
        });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let (function, arity) = {
            let n = self.heap.native(native);
            (n.function, n.arity)
        };
        if let Some(expected) = arity {
            if arg_count != usize::from(expected) {
                return Err(self.error(format!("需要 {expected} 个参数，但得到 {arg_count}。")));
            }
        }
        let args: Vec<Value> = self.stack[self.stack.len() - arg_count..].to_vec();
        match function(&mut self.heap, &args) {
            Ok(result) => {
                let base = self.stack.len() - arg_count - 1;
                self.stack.truncate(base);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.error(message)),
        }
    }

    fn call_method(&mut self, method: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        match self.heap.get(method) {
            Obj::Closure(_) => self.call_closure(method, arg_count),
            Obj::Native(_) => self.call_native(method, arg_count),
            _ => Err(self.error("只能调用功能和类。")),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        enum Kind {
            Bound(Value, ObjRef),
            Class,
            Closure,
            Other,
        }
        let Value::Obj(r) = callee else {
            return Err(self.error("只能调用功能和类。"));
        };
        let kind = match self.heap.get(r) {
            Obj::BoundMethod(b) => Kind::Bound(b.receiver, b.method),
            Obj::Class(_) => Kind::Class,
            Obj::Closure(_) => Kind::Closure,
            _ => Kind::Other,
        };
        match kind {
            Kind::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_method(method, arg_count)
            }
            Kind::Class => {
                let instance = self.alloc(Obj::Instance(ObjInstance {
                    class: r,
                    fields: Table::new(),
                    is_static: false,
                }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);
                let init_hash = self.heap.str_hash(self.init_string);
                let initializer = self.heap.class(r).methods.get(self.init_string, init_hash);
                match initializer {
                    Some(Value::Obj(init)) => self.call_method(init, arg_count),
                    Some(_) | None if arg_count != 0 => {
                        Err(self.error(format!("需要 0 个参数，但得到 {arg_count}。")))
                    }
                    _ => Ok(()),
                }
            }
            Kind::Closure => self.call_closure(r, arg_count),
            Kind::Other => Err(self.error("只能调用功能和类。")),
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        if let Some(instance) = self.heap.as_instance_ref(receiver) {
            let hash = self.heap.str_hash(name);
            // Fields shadow methods.
            if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = field;
                return self.call_value(field, arg_count);
            }
            let class = self.heap.instance(instance).class;
            self.invoke_from_class(class, name, arg_count)
        } else if let Some(string) = self.heap.as_string_ref(receiver) {
            self.invoke_string_method(string, name, arg_count)
        } else if let Some(list) = self.heap.as_list_ref(receiver) {
            self.invoke_list_method(list, name, arg_count)
        } else {
            Err(self.error("只有实例、字符串和列表有方法。"))
        }
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.str_hash(name);
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name, hash) else {
            let text = self.heap.string(name).to_text();
            return Err(self.error(format!("未定义的属性「{text}」。")));
        };
        self.call_method(method, arg_count)
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let hash = self.heap.str_hash(name);
        let Some(Value::Obj(method)) = self.heap.class(class).methods.get(name, hash) else {
            let text = self.heap.string(name).to_text();
            return Err(self.error(format!("未定义的属性「{text}」。")));
        };
        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ----- upvalues -----

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        // The list is sorted by descending slot; find the insertion point
        // and dedup on an exact match.
        let mut index = 0;
        while index < self.open_upvalues.len() {
            let existing = self.open_upvalues[index];
            match self.heap.upvalue(existing) {
                ObjUpvalue::Open(s) if *s > slot => index += 1,
                ObjUpvalue::Open(s) if *s == slot => return existing,
                _ => break,
            }
        }
        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(index, created);
        created
    }

    /// Close every open upvalue at or above `from_slot`: copy the stack
    /// value into the upvalue and redirect it to its own storage.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(first) {
                ObjUpvalue::Open(s) => *s,
                ObjUpvalue::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(first) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        match self.heap.upvalue(upvalue) {
            ObjUpvalue::Open(slot) => self.stack[*slot],
            ObjUpvalue::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        match self.heap.upvalue(upvalue) {
            ObjUpvalue::Open(slot) => {
                let slot = *slot;
                self.stack[slot] = value;
            }
            ObjUpvalue::Closed(_) => {
                *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
            }
        }
    }

    // ----- re-entrant execution -----

    /// Call back into the VM from built-in code (list 过滤 and 排序).
    /// Pushes the arguments, runs the closure in a callback frame, and
    /// restores the stack before returning the result.
    pub fn run_closure(
        &mut self,
        closure: ObjRef,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        for &arg in args {
            self.push(arg);
        }
        self.call_closure(closure, args.len())?;
        self.frame_mut().is_callback = true;
        self.run()?;
        let result = self.pop();
        let len = self.stack.len() - args.len();
        self.stack.truncate(len);
        Ok(result)
    }

    // ----- bytecode readers -----

    fn current_function(&self) -> ObjRef {
        self.heap.closure(self.frame().closure).function
    }

    fn read_byte(&self, function: ObjRef, ip: &mut usize) -> u8 {
        let byte = self.heap.function(function).chunk.code[*ip];
        *ip += 1;
        byte
    }

    fn read_u16(&self, function: ObjRef, ip: &mut usize) -> u16 {
        let chunk = &self.heap.function(function).chunk;
        let value = (u16::from(chunk.code[*ip]) << 8) | u16::from(chunk.code[*ip + 1]);
        *ip += 2;
        value
    }

    fn read_constant(&self, function: ObjRef, ip: &mut usize) -> Value {
        let index = self.read_byte(function, ip);
        self.heap.function(function).chunk.constants[usize::from(index)]
    }

    /// Name constants are always interned strings.
    fn read_string(&self, function: ObjRef, ip: &mut usize) -> ObjRef {
        match self.read_constant(function, ip) {
            Value::Obj(r) => r,
            _ => unreachable!("name constant is not a string"),
        }
    }

    // ----- the dispatch loop -----

    fn run(&mut self) -> Result<(), RuntimeError> {
        let mut function = self.current_function();
        let mut ip = self.frame().ip;

        macro_rules! flush {
            () => {
                self.frame_mut().ip = ip
            };
        }
        macro_rules! reload {
            () => {{
                function = self.current_function();
                ip = self.frame().ip;
            }};
        }
        macro_rules! numeric_binary {
            ($op:tt, $wrap:expr) => {{
                let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
                    flush!();
                    return Err(self.error("操作数必须是数字。"));
                };
                self.pop();
                self.pop();
                self.push($wrap(a $op b));
            }};
        }
        macro_rules! bitwise_binary {
            ($body:expr) => {{
                let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
                    flush!();
                    return Err(self.error("操作数必须是数字。"));
                };
                self.pop();
                self.pop();
                let (a, b) = (a as i32, b as i32);
                #[allow(clippy::redundant_closure_call)]
                self.push(Value::Number(f64::from($body(a, b))));
            }};
        }

        loop {
            if self.trace_execution {
                let chunk = &self.heap.function(function).chunk;
                let (text, _) = crate::debug::disassemble_instruction(&self.heap, chunk, ip);
                trace!(target: "yan::vm", "{text}");
            }
            let op_byte = self.read_byte(function, &mut ip);
            let Ok(op) = OpCode::try_from(op_byte) else {
                flush!();
                return Err(self.error(format!("未知的操作码 {op_byte}。")));
            };
            match op {
                OpCode::Constant => {
                    let constant = self.read_constant(function, &mut ip);
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = usize::from(self.read_byte(function, &mut ip));
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = usize::from(self.read_byte(function, &mut ip));
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string(function, &mut ip);
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            flush!();
                            let text = self.heap.string(name).to_text();
                            return Err(self.error(format!("未定义的变量「{text}」。")));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string(function, &mut ip);
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string(function, &mut ip);
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        flush!();
                        let text = self.heap.string(name).to_text();
                        return Err(self.error(format!("未定义的变量「{text}」。")));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = usize::from(self.read_byte(function, &mut ip));
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.read_upvalue(upvalue);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = usize::from(self.read_byte(function, &mut ip));
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string(function, &mut ip);
                    let Some(instance) = self.heap.as_instance_ref(self.peek(0)) else {
                        flush!();
                        return Err(self.error("只有实例有属性。"));
                    };
                    let hash = self.heap.str_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        flush!();
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string(function, &mut ip);
                    let Some(instance) = self.heap.as_instance_ref(self.peek(1)) else {
                        flush!();
                        return Err(self.error("只有实例有字段。"));
                    };
                    if self.heap.instance(instance).is_static {
                        flush!();
                        return Err(self.error("不能修改常量属性。"));
                    }
                    let hash = self.heap.str_hash(name);
                    let value = self.peek(0);
                    self.heap
                        .instance_mut(instance)
                        .fields
                        .set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string(function, &mut ip);
                    let superclass = self.pop();
                    let Some(class) = self.heap.as_class_ref(superclass) else {
                        flush!();
                        return Err(self.error("超类必须是个类。"));
                    };
                    flush!();
                    self.bind_method(class, name)?;
                }
                OpCode::BuildList => {
                    let count = usize::from(self.read_byte(function, &mut ip));
                    let start = self.stack.len() - count;
                    let items = self.stack[start..].to_vec();
                    let list = self.alloc(Obj::List(ObjList { items }));
                    self.stack.truncate(start);
                    self.push(Value::Obj(list));
                }
                OpCode::GetIndex => {
                    let index = self.pop();
                    let target = self.pop();
                    flush!();
                    let value = self.index_value(target, index)?;
                    self.push(value);
                }
                OpCode::SetIndex => {
                    let item = self.pop();
                    let index = self.pop();
                    let target = self.pop();
                    flush!();
                    self.store_index(target, index, item)?;
                    self.push(item);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => numeric_binary!(>, Value::Bool),
                OpCode::Less => numeric_binary!(<, Value::Bool),
                OpCode::Add => {
                    let (a, b) = (self.peek(1), self.peek(0));
                    let strings = (self.heap.as_string_ref(a), self.heap.as_string_ref(b));
                    if let (Some(a), Some(b)) = strings {
                        let mut chars: Vec<char> = self.heap.string(a).chars.to_vec();
                        chars.extend_from_slice(&self.heap.string(b).chars);
                        let result = self.intern_chars(chars);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    } else if let (Value::Number(a), Value::Number(b)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    } else {
                        flush!();
                        return Err(self.error("操作数必须是两个数字或两个字符串。"));
                    }
                }
                OpCode::Subtract => numeric_binary!(-, Value::Number),
                OpCode::Multiply => numeric_binary!(*, Value::Number),
                OpCode::Divide => numeric_binary!(/, Value::Number),
                OpCode::Modulo => numeric_binary!(%, Value::Number),
                OpCode::BitwiseAnd => bitwise_binary!(|a: i32, b: i32| a & b),
                OpCode::BitwiseOr => bitwise_binary!(|a: i32, b: i32| a | b),
                OpCode::BitwiseXor => bitwise_binary!(|a: i32, b: i32| a ^ b),
                OpCode::ShiftLeft => bitwise_binary!(|a: i32, b: i32| a.wrapping_shl(b as u32)),
                OpCode::ShiftRight => bitwise_binary!(|a: i32, b: i32| a.wrapping_shr(b as u32)),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        flush!();
                        return Err(self.error("操作数必须是数字。"));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::BitwiseNot => {
                    let Value::Number(n) = self.peek(0) else {
                        flush!();
                        return Err(self.error("操作数必须是数字。"));
                    };
                    self.pop();
                    self.push(Value::Number(f64::from(!(n as i32))));
                }
                OpCode::Increment => {
                    let Value::Number(n) = self.peek(0) else {
                        flush!();
                        return Err(self.error("操作数必须是数字。"));
                    };
                    self.pop();
                    self.push(Value::Number(n + 1.0));
                }
                OpCode::Decrement => {
                    let Value::Number(n) = self.peek(0) else {
                        flush!();
                        return Err(self.error("操作数必须是数字。"));
                    };
                    self.pop();
                    self.push(Value::Number(n - 1.0));
                }
                OpCode::Jump => {
                    let offset = usize::from(self.read_u16(function, &mut ip));
                    ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = usize::from(self.read_u16(function, &mut ip));
                    if self.peek(0).is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = usize::from(self.read_u16(function, &mut ip));
                    ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = usize::from(self.read_byte(function, &mut ip));
                    flush!();
                    self.call_value(self.peek(arg_count), arg_count)?;
                    reload!();
                }
                OpCode::Invoke => {
                    let name = self.read_string(function, &mut ip);
                    let arg_count = usize::from(self.read_byte(function, &mut ip));
                    flush!();
                    self.invoke(name, arg_count)?;
                    reload!();
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string(function, &mut ip);
                    let arg_count = usize::from(self.read_byte(function, &mut ip));
                    flush!();
                    let superclass = self.pop();
                    let Some(class) = self.heap.as_class_ref(superclass) else {
                        return Err(self.error("超类必须是个类。"));
                    };
                    self.invoke_from_class(class, name, arg_count)?;
                    reload!();
                }
                OpCode::Closure => {
                    let function_ref = match self.read_constant(function, &mut ip) {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant is not a function"),
                    };
                    let upvalue_count = self.heap.function(function_ref).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function: function_ref,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte(function, &mut ip) != 0;
                        let index = usize::from(self.read_byte(function, &mut ip));
                        let upvalue = if is_local {
                            let base = self.frame().slots;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let Some(frame) = self.frames.pop() else {
                        unreachable!("return without a frame");
                    };
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    if frame.is_callback {
                        self.push(result);
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                    reload!();
                }
                OpCode::Class => {
                    let name = self.read_string(function, &mut ip);
                    let class = self.alloc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let Some(superclass) = self.heap.as_class_ref(self.peek(1)) else {
                        flush!();
                        return Err(self.error("超类必须是个类。"));
                    };
                    let Some(subclass) = self.heap.as_class_ref(self.peek(0)) else {
                        flush!();
                        return Err(self.error("超类必须是个类。"));
                    };
                    let methods = self.heap.class(superclass).methods.clone();
                    methods.add_all(&mut self.heap.class_mut(subclass).methods);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string(function, &mut ip);
                    let hash = self.heap.str_hash(name);
                    let method = self.peek(0);
                    let Some(class) = self.heap.as_class_ref(self.peek(1)) else {
                        unreachable!("method target is not a class");
                    };
                    self.heap
                        .class_mut(class)
                        .methods
                        .set(name, hash, method);
                    self.pop();
                }
                OpCode::Dup => {
                    let top = self.peek(0);
                    self.push(top);
                }
                OpCode::DoubleDup => {
                    let under = self.peek(1);
                    self.push(under);
                    let under = self.peek(1);
                    self.push(under);
                }
            }
        }
    }

    // ----- subscripts -----

    fn index_value(&mut self, target: Value, index: Value) -> Result<Value, RuntimeError> {
        if let Some(string) = self.heap.as_string_ref(target) {
            let Value::Number(raw) = index else {
                return Err(self.error("字符串索引不是数字。"));
            };
            let len = self.heap.string(string).len();
            let Some(at) = resolve_index(raw, len) else {
                return Err(self.error("字符串索引超出范围。"));
            };
            let c = self.heap.string(string).chars[at];
            let result = self.intern_chars(vec![c]);
            Ok(Value::Obj(result))
        } else if let Some(list) = self.heap.as_list_ref(target) {
            let Value::Number(raw) = index else {
                return Err(self.error("列表索引不是数字。"));
            };
            let len = self.heap.list(list).items.len();
            let Some(at) = resolve_index(raw, len) else {
                return Err(self.error("列表索引超出范围。"));
            };
            Ok(self.heap.list(list).items[at])
        } else {
            Err(self.error("无效类型索引到。"))
        }
    }

    fn store_index(
        &mut self,
        target: Value,
        index: Value,
        item: Value,
    ) -> Result<(), RuntimeError> {
        if self.heap.as_string_ref(target).is_some() {
            // Strings are interned and therefore immutable; an in-place
            // store would silently alias every equal string.
            Err(self.error("字符串不可变，无法按索引赋值。"))
        } else if let Some(list) = self.heap.as_list_ref(target) {
            let Value::Number(raw) = index else {
                return Err(self.error("列表索引不是数字。"));
            };
            let len = self.heap.list(list).items.len();
            let Some(at) = resolve_index(raw, len) else {
                return Err(self.error("列表索引无效。"));
            };
            self.heap.list_mut(list).items[at] = item;
            Ok(())
        } else {
            Err(self.error("无法存储值：变量不是字符串或列表。"))
        }
    }
}

/// Map a possibly negative index onto `0..len`.
pub(crate) fn resolve_index(raw: f64, len: usize) -> Option<usize> {
    let mapped = if raw < 0.0 { raw + len as f64 } else { raw };
    if mapped < 0.0 || mapped >= len as f64 || mapped.fract() != 0.0 {
        return None;
    }
    Some(mapped as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_index_maps_negatives() {
        assert_eq!(resolve_index(0.0, 3), Some(0));
        assert_eq!(resolve_index(2.0, 3), Some(2));
        assert_eq!(resolve_index(-1.0, 3), Some(2));
        assert_eq!(resolve_index(-3.0, 3), Some(0));
        assert_eq!(resolve_index(3.0, 3), None);
        assert_eq!(resolve_index(-4.0, 3), None);
        assert_eq!(resolve_index(0.5, 3), None);
    }

    #[test]
    fn test_global_lookup_without_allocation() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("变量 甲 = 42；"), InterpretResult::Ok);
        assert_eq!(vm.global("甲"), Some(Value::Number(42.0)));
        assert_eq!(vm.global("不存在"), None);
    }

    #[test]
    fn test_stack_resets_after_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("1 + 真；"), InterpretResult::RuntimeError);
        assert_eq!(vm.stack.len(), 0);
        assert_eq!(vm.frames.len(), 0);
        // The VM stays usable.
        assert_eq!(vm.interpret("变量 乙 = 2；"), InterpretResult::Ok);
        assert_eq!(vm.global("乙"), Some(Value::Number(2.0)));
    }
}
