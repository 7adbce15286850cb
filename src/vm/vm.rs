//! The execution engine: state, dispatch loop, and embedding surface.

use std::rc::Rc;

use ahash::AHashMap;
use colored::Colorize;

use crate::bytecode::{Capture, Opcode, Stub};
use crate::error::RuntimeFault;
use crate::store::{Signature, TypeId, Value, ValueStore};

use super::frame::{RestartCondition, StackFrame};
use super::vm_calls::CallBind;
use super::vm_catchable::{Catchable, CatchableKind};

/// Hard bound on call nesting. Exceeding it raises a catchable instead of
/// exhausting the native stack.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Host implementation of an external function. Receives the engine, the
/// function value being called, and the bound arguments in declaration
/// order (Empty where the caller supplied nothing).
pub type ExternalHandler = Rc<dyn Fn(&mut Vm, Value, &[Value]) -> Value>;

/// Resolves a module name to its bytecode, or None when unknown.
pub type Importer = Rc<dyn Fn(&mut Vm, &str) -> Option<Vec<u8>>>;

/// Called with every uncaught catchable that reaches the outermost call.
pub type UnhandledCallback = Rc<dyn Fn(&mut Vm, CatchableKind, Value)>;

pub(crate) struct External {
    pub(crate) name: Box<str>,
    pub(crate) value: Value,
    pub(crate) handler: ExternalHandler,
}

/// The virtual machine. Owns the value store, the frame pool, loaded
/// stubs, the external-function registry and the import cache; one engine
/// per thread of execution.
pub struct Vm {
    pub(crate) store: ValueStore,
    pub(crate) stubs: AHashMap<(u32, u32), Rc<Stub>>,
    /// Per-stub interned string pools, retained for the engine's lifetime.
    pub(crate) stub_strings: AHashMap<(u32, u32), Rc<Vec<Value>>>,
    /// Frame pool; entries `0..depth` are live.
    pub(crate) frames: Vec<StackFrame>,
    pub(crate) depth: usize,
    pub(crate) externals: Vec<External>,
    pub(crate) external_names: AHashMap<Box<str>, u32>,
    pub(crate) files: AHashMap<Box<str>, u32>,
    pub(crate) file_names: Vec<Box<str>>,
    pub(crate) imports: AHashMap<u32, Value>,
    pub(crate) pending: Option<Catchable>,
    /// Restart condition staged by a loop builtin for the frame its body
    /// call is about to create.
    pub(crate) pending_restart: Option<RestartCondition>,
    /// Values engine code holds in host locals across a nested call,
    /// traced as GC roots alongside the frames.
    pub(crate) transient_roots: Vec<Value>,
    pub(crate) call_nesting: usize,
    pub(crate) fault_reported: bool,
    pub(crate) importer: Option<Importer>,
    pub(crate) print_callback: Rc<dyn Fn(&str)>,
    pub(crate) debug_callback: Option<Rc<dyn Fn(u32, u32, &str)>>,
    pub(crate) unhandled_callback: UnhandledCallback,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            store: ValueStore::new(),
            stubs: AHashMap::new(),
            stub_strings: AHashMap::new(),
            frames: Vec::with_capacity(64),
            depth: 0,
            externals: Vec::new(),
            external_names: AHashMap::new(),
            files: AHashMap::new(),
            file_names: Vec::new(),
            imports: AHashMap::new(),
            pending: None,
            pending_restart: None,
            transient_roots: Vec::new(),
            call_nesting: 0,
            fault_reported: false,
            importer: None,
            print_callback: Rc::new(|text| println!("{}", text)),
            debug_callback: None,
            unhandled_callback: Rc::new(default_unhandled),
        };
        vm.register_builtins();
        vm
    }

    // --- Embedding surface ---

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ValueStore {
        &mut self.store
    }

    /// Register a host function. Returns its registry index, loadable via
    /// the external-load instruction. The function value is lock-rooted
    /// for the engine's lifetime.
    pub fn register_external(
        &mut self,
        name: &str,
        arg_names: &[&str],
        handler: ExternalHandler,
    ) -> u32 {
        let index = self.externals.len() as u32;
        let stub = Rc::new(Stub::native(index, arg_names));
        let value = self.store.create_function(stub);
        self.store.push_lock(&value);
        self.externals.push(External {
            name: name.into(),
            value,
            handler,
        });
        self.external_names.insert(name.into(), index);
        index
    }

    /// The function value of a registered external, by name.
    pub fn external_function(&self, name: &str) -> Option<Value> {
        self.external_names
            .get(name)
            .and_then(|i| self.externals.get(*i as usize))
            .map(|e| e.value)
    }

    pub fn set_print_callback(&mut self, callback: Rc<dyn Fn(&str)>) {
        self.print_callback = callback;
    }

    /// Receives `(file_id, line, message)` for every fault the engine
    /// raises at a bytecode site.
    pub fn set_debug_callback(&mut self, callback: Rc<dyn Fn(u32, u32, &str)>) {
        self.debug_callback = Some(callback);
    }

    pub fn set_unhandled_callback(&mut self, callback: UnhandledCallback) {
        self.unhandled_callback = callback;
    }

    pub fn set_importer(&mut self, importer: Importer) {
        self.importer = Some(importer);
    }

    /// Run a full collection with the engine's roots: live frames, the
    /// import cache, registered externals, any pending catchable, and
    /// values protected by in-flight engine code.
    pub fn collect_garbage(&mut self) {
        self.collect_garbage_with(&[]);
    }

    pub(crate) fn collect_garbage_with(&mut self, extra: &[Value]) {
        let mut roots: Vec<Value> = Vec::with_capacity(64);
        roots.extend_from_slice(extra);
        for frame in &self.frames[..self.depth] {
            roots.push(frame.context);
            roots.push(frame.private_binding);
            roots.extend(frame.stack.iter().copied());
            if let Some(cond) = &frame.restart {
                cond.trace(&mut roots);
            }
        }
        roots.extend_from_slice(&self.transient_roots);
        for value in self.imports.values() {
            roots.push(*value);
        }
        for external in &self.externals {
            roots.push(external.value);
        }
        if let Some(catchable) = &self.pending {
            roots.push(catchable.value);
        }
        if let Some(cond) = &self.pending_restart {
            cond.trace(&mut roots);
        }
        self.store.collect(&roots);
    }

    /// Root a value held only in a host local while a nested call runs.
    /// Collections triggered inside the call trace it like a frame slot.
    /// Pair with [`Vm::unprotect`].
    pub(crate) fn protect(&mut self, value: Value) {
        self.transient_roots.push(value);
    }

    pub(crate) fn unprotect(&mut self, count: usize) {
        let keep = self.transient_roots.len().saturating_sub(count);
        self.transient_roots.truncate(keep);
    }

    // --- Operand stack ---

    #[inline]
    pub(crate) fn push(&mut self, at: usize, value: Value) {
        self.frames[at].stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self, at: usize) -> Value {
        match self.frames[at].stack.pop() {
            Some(value) => value,
            None => {
                self.raise_fault(RuntimeFault::StackUnderflow);
                Value::Empty
            }
        }
    }

    #[inline]
    pub(crate) fn peek(&mut self, at: usize) -> Value {
        match self.frames[at].stack.last() {
            Some(value) => *value,
            None => {
                self.raise_fault(RuntimeFault::StackUnderflow);
                Value::Empty
            }
        }
    }

    // --- Referrables ---

    /// Read a referrable. Indices below the stub's own slot count resolve
    /// in this frame's activation; higher indices address the capture
    /// table and walk the live call stack.
    pub(crate) fn load_referrable(&mut self, at: usize, stub: &Stub, index: u32) -> Value {
        let own = stub.referrable_count();
        if (index as usize) < own {
            let context = self.frames[at].context;
            match self.store.referrable(&context, index as usize) {
                Some(value) => value,
                None => {
                    self.raise_fault(RuntimeFault::InvalidReferrable(index));
                    Value::Empty
                }
            }
        } else {
            match stub.captures.get(index as usize - own).copied() {
                Some(capture) => self.load_capture(stub, capture),
                None => {
                    self.raise_fault(RuntimeFault::InvalidReferrable(index));
                    Value::Empty
                }
            }
        }
    }

    pub(crate) fn store_referrable(&mut self, at: usize, stub: &Stub, index: u32, value: Value) {
        let own = stub.referrable_count();
        if (index as usize) < own {
            let context = self.frames[at].context;
            if let Err(fault) = self.store.set_referrable(&context, index as usize, value) {
                self.raise_fault(fault);
            }
        } else {
            match stub.captures.get(index as usize - own).copied() {
                Some(capture) => self.store_capture(stub, capture, value),
                None => self.raise_fault(RuntimeFault::InvalidReferrable(index)),
            }
        }
    }

    /// Innermost live frame whose stub matches the capture's origin, in
    /// the capturing stub's file.
    fn capture_context(&mut self, stub: &Stub, capture: Capture) -> Option<Value> {
        for i in (0..self.depth).rev() {
            let context = self.frames[i].context;
            let Some(frame_stub) = self.store.function_stub(&context) else {
                continue;
            };
            if frame_stub.file_id == stub.file_id && frame_stub.stub_id == capture.stub_id {
                return Some(context);
            }
        }
        self.raise_fault(RuntimeFault::InvalidCapture);
        None
    }

    fn load_capture(&mut self, stub: &Stub, capture: Capture) -> Value {
        let Some(context) = self.capture_context(stub, capture) else {
            return Value::Empty;
        };
        match self.store.referrable(&context, capture.referrable as usize) {
            Some(value) => value,
            None => {
                self.raise_fault(RuntimeFault::InvalidReferrable(capture.referrable));
                Value::Empty
            }
        }
    }

    fn store_capture(&mut self, stub: &Stub, capture: Capture, value: Value) {
        let Some(context) = self.capture_context(stub, capture) else {
            return;
        };
        if let Err(fault) = self
            .store
            .set_referrable(&context, capture.referrable as usize, value)
        {
            self.raise_fault(fault);
        }
    }

    // --- Dispatch ---

    /// Drive the frame at `base` to completion and return its result.
    ///
    /// Bytecode callees bind a frame and continue this loop instead of
    /// recursing on the host stack, so pure bytecode nesting is bounded by
    /// [`MAX_CALL_DEPTH`] alone, in any build profile. Host re-entry
    /// (natives, attribute hooks, listen handlers) still nests, one host
    /// frame per hook.
    pub(crate) fn run_frames(&mut self, base: usize) -> Value {
        loop {
            let at = self.depth - 1;
            let context = self.frames[at].context;
            let ended = match self.store.function_stub(&context) {
                Some(stub) => {
                    let pool = self.stub_strings.get(&(stub.file_id, stub.stub_id)).cloned();
                    self.step_frame(at, &stub, pool.as_deref())
                }
                None => true,
            };
            if !ended {
                continue;
            }
            let result = self.finish_frame(at);
            if self.depth == base {
                return result;
            }
            let caller = self.depth - 1;
            self.frames[caller].stack.push(result);
            if self.pending.is_some() {
                self.report_call_site(caller);
            }
        }
    }

    /// Run instructions of the frame at `at` until it completes (true) or
    /// binds a callee frame to descend into (false). The catchable slot is
    /// checked after every instruction; a set slot stops the frame without
    /// inspecting its operand stack.
    fn step_frame(&mut self, at: usize, stub: &Rc<Stub>, pool: Option<&Vec<Value>>) -> bool {
        loop {
            if self.pending.is_some() {
                return true;
            }
            let pc = self.frames[at].pc;
            if pc >= stub.instructions.len() {
                if self.try_restart(at, stub) {
                    continue;
                }
                return true;
            }
            self.frames[at].pc = pc + 1;
            let instruction = stub.instructions[pc];
            self.execute(at, stub, pool, instruction.op);
            if self.pending.is_some() {
                self.report_fault_site(stub, instruction.line);
            }
            if self.depth > at + 1 {
                return false;
            }
        }
    }

    /// A fault raised while retiring a callee (a failed return-type check)
    /// has no instruction of its own; attribute it to the caller's call
    /// site.
    fn report_call_site(&mut self, at: usize) {
        let context = self.frames[at].context;
        let Some(stub) = self.store.function_stub(&context) else {
            return;
        };
        let pc = self.frames[at].pc;
        if let Some(instruction) = stub.instructions.get(pc.saturating_sub(1)) {
            let line = instruction.line;
            self.report_fault_site(&stub, line);
        }
    }

    fn execute(&mut self, at: usize, stub: &Rc<Stub>, pool: Option<&Vec<Value>>, op: Opcode) {
        match op {
            Opcode::Noop => {}

            Opcode::PushEmpty => self.push(at, Value::Empty),
            Opcode::PushNumber(n) => self.push(at, Value::Number(n)),
            Opcode::PushBoolean(b) => self.push(at, Value::Boolean(b)),
            Opcode::PushString(index) => {
                match pool.and_then(|p| p.get(index as usize)).copied() {
                    Some(value) => self.push(at, value),
                    None => self.raise_fault(RuntimeFault::InvalidStringIndex(index)),
                }
            }
            Opcode::NewObject => {
                let value = self.store.create_object();
                self.push(at, value);
            }
            Opcode::NewFunction { file_id, stub_id } => {
                match self.stubs.get(&(file_id, stub_id)).cloned() {
                    Some(target) => {
                        let value = self.store.create_function(target);
                        self.push(at, value);
                    }
                    None => self.raise_fault(RuntimeFault::unknown_stub(file_id, stub_id)),
                }
            }
            Opcode::NewFunctionTyped { file_id, stub_id } => {
                self.new_function_typed(at, file_id, stub_id);
            }
            Opcode::PushBuiltinType(code) => match TypeId::from_builtin_code(code) {
                Some(id) => self.push(at, Value::Type(id)),
                None => self.raise_fault(RuntimeFault::type_error("unknown built-in type code")),
            },

            Opcode::ReferrableLoad(index) => {
                let value = self.load_referrable(at, stub, index);
                if self.pending.is_none() {
                    self.push(at, value);
                }
            }
            Opcode::ReferrableAssign { index, op } => {
                let value = self.pop(at);
                if self.pending.is_some() {
                    return;
                }
                let final_value = match op.operator() {
                    None => value,
                    Some(binary) => {
                        let current = self.load_referrable(at, stub, index);
                        if self.pending.is_some() {
                            return;
                        }
                        let combined = self.binary_operator(binary, current, value);
                        if self.pending.is_some() {
                            return;
                        }
                        combined
                    }
                };
                self.store_referrable(at, stub, index, final_value);
            }

            Opcode::MemberLoad { bracket } => {
                let key = self.pop(at);
                let object = self.pop(at);
                if self.pending.is_some() {
                    return;
                }
                let value = self.member_load(object, key, bracket);
                if self.pending.is_none() {
                    self.push(at, value);
                }
            }
            Opcode::MemberAssign { op, bracket } => {
                let value = self.pop(at);
                let key = self.pop(at);
                let object = self.pop(at);
                if self.pending.is_some() {
                    return;
                }
                self.member_assign(object, key, value, op, bracket);
            }

            Opcode::Call(argc) => {
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let value = self.pop(at);
                    let name = self.pop(at);
                    args.push((name, value));
                }
                if self.pending.is_some() {
                    return;
                }
                args.reverse();
                let callee = self.pop(at);
                // A bound frame is driven by the dispatch loop; its result
                // lands on this stack when it completes.
                if let CallBind::Done(result) = self.bind_call(callee, &args, Value::Empty) {
                    self.push(at, result);
                }
            }
            Opcode::CallVarArg => {
                let spread = self.pop(at);
                let callee = self.pop(at);
                if self.pending.is_some() {
                    return;
                }
                let pairs = match self.store.object_pairs(&spread) {
                    Ok(pairs) => pairs,
                    Err(fault) => {
                        self.raise_fault(fault);
                        return;
                    }
                };
                let mut args = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    if !matches!(key, Value::String(_)) {
                        self.raise_fault(RuntimeFault::InvalidKey(
                            "var-arg spread requires String keys",
                        ));
                        return;
                    }
                    args.push((key, value));
                }
                if let CallBind::Done(result) = self.bind_call(callee, &args, Value::Empty) {
                    self.push(at, result);
                }
            }
            Opcode::PushPrivateBinding => {
                let binding = self.frames[at].private_binding;
                self.push(at, binding);
            }
            Opcode::ExternalLoad(index) => match self.externals.get(index as usize) {
                Some(external) => {
                    let value = external.value;
                    self.push(at, value);
                }
                None => self.raise_fault(RuntimeFault::UnknownExternal(index)),
            },

            Opcode::Skip(n) => {
                self.frames[at].pc += n as usize;
            }
            Opcode::SkipIfFalse(n) => {
                let value = self.pop(at);
                if self.pending.is_some() {
                    return;
                }
                if !self.store.as_boolean(&value) {
                    self.frames[at].pc += n as usize;
                }
            }
            Opcode::AndSkip(n) => {
                let value = self.peek(at);
                if self.pending.is_some() {
                    return;
                }
                if !self.store.as_boolean(&value) {
                    self.frames[at].pc += n as usize;
                }
            }
            Opcode::OrSkip(n) => {
                let value = self.peek(at);
                if self.pending.is_some() {
                    return;
                }
                if self.store.as_boolean(&value) {
                    self.frames[at].pc += n as usize;
                }
            }
            Opcode::Operator(code) => {
                if code.is_unary() {
                    let a = self.pop(at);
                    if self.pending.is_some() {
                        return;
                    }
                    let result = self.unary_operator(code, a);
                    if self.pending.is_none() {
                        self.push(at, result);
                    }
                } else {
                    let b = self.pop(at);
                    let a = self.pop(at);
                    if self.pending.is_some() {
                        return;
                    }
                    let result = self.binary_operator(code, a, b);
                    if self.pending.is_none() {
                        self.push(at, result);
                    }
                }
            }
            Opcode::Listen => {
                let response = self.pop(at);
                let callee = self.pop(at);
                if self.pending.is_some() {
                    return;
                }
                let result = self.listen(callee, response);
                if self.pending.is_none() {
                    self.push(at, result);
                }
            }
            Opcode::Return => {
                self.frames[at].pc = stub.instructions.len();
            }

            Opcode::Pop(n) => {
                for _ in 0..n {
                    self.pop(at);
                    if self.pending.is_some() {
                        return;
                    }
                }
            }
            Opcode::Copy => {
                let value = self.peek(at);
                if self.pending.is_none() {
                    self.push(at, value);
                }
            }
        }
    }

    fn new_function_typed(&mut self, at: usize, file_id: u32, stub_id: u32) {
        let Some(target) = self.stubs.get(&(file_id, stub_id)).cloned() else {
            self.raise_fault(RuntimeFault::unknown_stub(file_id, stub_id));
            return;
        };
        let argc = target.arguments.len();
        let returns = self.pop(at);
        let mut parameters = Vec::with_capacity(argc);
        for _ in 0..argc {
            parameters.push(self.pop(at));
        }
        if self.pending.is_some() {
            return;
        }
        parameters.reverse();
        let Value::Type(return_type) = returns else {
            self.raise_fault(RuntimeFault::type_error(
                "function signature requires Type values",
            ));
            return;
        };
        let mut parameter_types = Vec::with_capacity(argc);
        for value in parameters {
            let Value::Type(id) = value else {
                self.raise_fault(RuntimeFault::type_error(
                    "function signature requires Type values",
                ));
                return;
            };
            parameter_types.push(id);
        }
        let function = self.store.create_function(target);
        let signature = Signature {
            parameters: parameter_types,
            returns: return_type,
        };
        if let Err(fault) = self.store.set_signature(&function, signature) {
            self.raise_fault(fault);
            return;
        }
        self.push(at, function);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn default_unhandled(vm: &mut Vm, kind: CatchableKind, value: Value) {
    let rendered = vm.store.as_display_string(&value);
    match kind {
        CatchableKind::Error => {
            eprintln!("{} {}", "unhandled error:".red().bold(), rendered);
        }
        CatchableKind::Message => {
            eprintln!("{} {}", "unhandled message:".yellow().bold(), rendered);
        }
    }
}
