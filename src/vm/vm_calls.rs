//! Call protocol: argument binding, activation, frame management, and the
//! built-in functions every engine starts with.

use std::rc::Rc;

use crate::bytecode::{Stub, DYNAMIC_BIND_TOKEN};
use crate::error::RuntimeFault;
use crate::store::Value;

use super::frame::{RestartCondition, StackFrame};
use super::vm::{ExternalHandler, Vm, MAX_CALL_DEPTH};

/// Outcome of binding a call target.
pub(crate) enum CallBind {
    /// The call completed on the spot: a native ran, or binding failed
    /// and raised. Carries the call's result.
    Done(Value),
    /// A bytecode frame was bound and pushed at this index; it has not
    /// executed yet.
    Frame(usize),
}

impl Vm {
    /// Call a function value with named arguments. `private_binding`, when
    /// not Empty, overrides the binding stored on the function for the
    /// duration of this call.
    pub fn call(&mut self, function: Value, args: &[(&str, Value)], private_binding: Value) -> Value {
        let pairs: Vec<(Value, Value)> = args
            .iter()
            .map(|(name, value)| (self.store.intern(name), *value))
            .collect();
        self.call_with_values(function, &pairs, private_binding)
    }

    /// Same as [`Vm::call`] with names already interned as String values.
    /// The nesting counter makes the unhandled callback fire only once the
    /// outermost call unwinds, so nested calls propagate freely.
    pub(crate) fn call_with_values(
        &mut self,
        function: Value,
        args: &[(Value, Value)],
        private_binding: Value,
    ) -> Value {
        self.call_nesting += 1;
        let result = self.call_inner(function, args, private_binding);
        self.call_nesting -= 1;
        if self.call_nesting == 0 {
            self.flush_unhandled();
        }
        result
    }

    fn call_inner(&mut self, function: Value, args: &[(Value, Value)], private_binding: Value) -> Value {
        match self.bind_call(function, args, private_binding) {
            CallBind::Done(result) => result,
            CallBind::Frame(at) => self.run_frames(at),
        }
    }

    /// Resolve a call target and bind its arguments without executing it.
    /// Bytecode callees get a frame pushed for the dispatch loop to drive;
    /// natives run to completion here, since they are host code anyway.
    pub(crate) fn bind_call(
        &mut self,
        function: Value,
        args: &[(Value, Value)],
        private_binding: Value,
    ) -> CallBind {
        // A restart condition staged by a loop builtin belongs to the very
        // next bind, never to a later one.
        let staged_restart = self.pending_restart.take();

        let Some(stub) = self.store.function_stub(&function) else {
            self.raise_fault(RuntimeFault::not_callable(function.tag_name()));
            return CallBind::Done(Value::Empty);
        };

        for (name, _) in args {
            if !matches!(name, Value::String(_)) {
                self.raise_fault(RuntimeFault::type_error("argument names must be Strings"));
                return CallBind::Done(Value::Empty);
            }
        }

        if stub.is_native() {
            return CallBind::Done(self.call_native(&stub, function, args));
        }

        if self.depth >= MAX_CALL_DEPTH {
            self.raise_fault(RuntimeFault::StackLimit(MAX_CALL_DEPTH));
            return CallBind::Done(Value::Empty);
        }

        let signature = self.store.signature(&function);
        let strict = signature.is_some();

        let mut referrables = vec![Value::Empty; stub.referrable_count()];
        if stub.is_vararg {
            // Every caller pair lands in one pack object bound to the
            // single declared argument.
            let pack = self.store.create_object();
            for (name, value) in args {
                if let Err(fault) = self.store.object_set(&pack, name, *value) {
                    self.raise_fault(fault);
                    return CallBind::Done(Value::Empty);
                }
            }
            if !stub.arguments.is_empty() {
                referrables[1] = pack;
            }
        } else {
            for (name, value) in args {
                match self.match_argument(&stub, name) {
                    Some(slot) => referrables[slot] = *value,
                    None if strict => {
                        let shown = self.store.as_display_string(name);
                        self.raise_fault(RuntimeFault::type_error(format!(
                            "function has no argument named '{}'",
                            shown
                        )));
                        return CallBind::Done(Value::Empty);
                    }
                    None => {}
                }
            }
        }
        if stub.is_dynamic_bind() {
            if let Some(slot) = stub.argument_slot(DYNAMIC_BIND_TOKEN) {
                if let Some(origin) = self.store.bound_origin(&function) {
                    referrables[slot] = origin;
                }
            }
        }

        if let Some(sig) = &signature {
            for (i, expected) in sig.parameters.iter().enumerate() {
                let bound = referrables.get(1 + i).copied().unwrap_or(Value::Empty);
                if !self.store.is_a(&bound, *expected) {
                    let name = stub
                        .arguments
                        .get(i)
                        .map(|n| n.as_ref())
                        .unwrap_or("?");
                    let fault = RuntimeFault::type_error(format!(
                        "argument '{}' requires {}, got {}",
                        name,
                        self.store.type_name(*expected),
                        self.store.type_name(self.store.type_of(&bound)),
                    ));
                    self.raise_fault(fault);
                    return CallBind::Done(Value::Empty);
                }
            }
        }

        let context = match self.store.activate(function, referrables) {
            Ok(context) => context,
            Err(fault) => {
                self.raise_fault(fault);
                return CallBind::Done(Value::Empty);
            }
        };
        let binding = if binding_is_set(private_binding) {
            private_binding
        } else {
            self.store.private_binding(&context).unwrap_or(Value::Empty)
        };

        if self.depth == self.frames.len() {
            self.frames.push(StackFrame::new());
        }
        let at = self.depth;
        self.depth += 1;
        {
            let frame = &mut self.frames[at];
            frame.pc = 0;
            frame.context = context;
            frame.private_binding = binding;
            frame.restart = staged_restart;
        }
        CallBind::Frame(at)
    }

    /// The return half of the protocol: pop the result, retire the frame,
    /// enforce the declared return type, and collect if allocation
    /// pressure built up during the call.
    pub(crate) fn finish_frame(&mut self, at: usize) -> Value {
        let mut result = self.frames[at].stack.pop().unwrap_or(Value::Empty);
        if self.pending.is_some() {
            result = Value::Empty;
        }
        let context = self.frames[at].context;
        self.frames[at].reset();
        self.depth -= 1;

        if self.pending.is_none() {
            if let Some(sig) = self.store.signature(&context) {
                if !self.store.is_a(&result, sig.returns) {
                    let fault = RuntimeFault::type_error(format!(
                        "function requires a {} return, got {}",
                        self.store.type_name(sig.returns),
                        self.store.type_name(self.store.type_of(&result)),
                    ));
                    self.raise_fault(fault);
                    result = Value::Empty;
                }
            }
        }

        if self.store.should_collect() {
            self.collect_garbage_with(&[result]);
        }
        result
    }

    /// Natives bind by name like bytecode functions but run on the host
    /// stack with no frame of their own.
    fn call_native(&mut self, stub: &Rc<Stub>, function: Value, args: &[(Value, Value)]) -> Value {
        let mut bound = vec![Value::Empty; stub.arguments.len()];
        for (name, value) in args {
            if let Some(slot) = self.match_argument(stub, name) {
                bound[slot - 1] = *value;
            }
        }
        let handler: ExternalHandler = match self.externals.get(stub.stub_id as usize) {
            Some(external) => Rc::clone(&external.handler),
            None => {
                self.raise_fault(RuntimeFault::UnknownExternal(stub.stub_id));
                return Value::Empty;
            }
        };
        // Handlers may re-enter the engine; the bound slice has no frame
        // to root it.
        self.transient_roots.extend_from_slice(&bound);
        let result = handler(self, function, &bound);
        self.unprotect(bound.len());
        result
    }

    fn match_argument(&self, stub: &Stub, name: &Value) -> Option<usize> {
        let content = self.store.string_content(name)?;
        stub.argument_slot(content)
    }

    // --- Loop restarts ---

    /// Decide whether an exhausted frame starts another iteration. The
    /// finished iteration's top-of-stack value is consulted first: a For
    /// body returning a Number overrides the counter before stepping.
    pub(crate) fn try_restart(&mut self, at: usize, stub: &Rc<Stub>) -> bool {
        let Some(condition) = self.frames[at].restart.take() else {
            return false;
        };
        let result = self.frames[at].stack.last().copied().unwrap_or(Value::Empty);
        match condition {
            RestartCondition::For {
                mut counter,
                end,
                increment,
            } => {
                if let Value::Number(n) = result {
                    counter = n;
                }
                counter += increment;
                let done = if increment > 0.0 {
                    counter >= end
                } else {
                    counter <= end
                };
                if done {
                    return false;
                }
                if !stub.arguments.is_empty() {
                    let context = self.frames[at].context;
                    if let Err(fault) = self.store.set_referrable(&context, 1, Value::Number(counter)) {
                        self.raise_fault(fault);
                        return false;
                    }
                }
                self.frames[at].restart = Some(RestartCondition::For {
                    counter,
                    end,
                    increment,
                });
                self.restart_frame(at);
                true
            }
            RestartCondition::Forever => {
                self.frames[at].restart = Some(RestartCondition::Forever);
                self.restart_frame(at);
                true
            }
            RestartCondition::Foreach { pairs, index } => {
                let next = index + 1;
                let Some((key, value)) = pairs.get(next).copied() else {
                    return false;
                };
                let context = self.frames[at].context;
                if !stub.arguments.is_empty() {
                    if let Err(fault) = self.store.set_referrable(&context, 1, key) {
                        self.raise_fault(fault);
                        return false;
                    }
                }
                if stub.arguments.len() >= 2 {
                    if let Err(fault) = self.store.set_referrable(&context, 2, value) {
                        self.raise_fault(fault);
                        return false;
                    }
                }
                self.frames[at].restart = Some(RestartCondition::Foreach { pairs, index: next });
                self.restart_frame(at);
                true
            }
        }
    }

    fn restart_frame(&mut self, at: usize) {
        let frame = &mut self.frames[at];
        frame.pc = 0;
        frame.stack.clear();
    }

    // --- Builtins ---

    pub(crate) fn register_builtins(&mut self) {
        self.register_external("noop", &[], Rc::new(|_vm, _function, _args| Value::Empty));
        self.register_external("for", &["from", "to", "do"], Rc::new(builtin_for));
        self.register_external("forever", &["do"], Rc::new(builtin_forever));
        self.register_external("foreach", &["in", "do"], Rc::new(builtin_foreach));
        self.register_external("import", &["module"], Rc::new(builtin_import));
        self.register_external("print", &["message"], Rc::new(builtin_print));
        self.register_external("send", &["message"], Rc::new(builtin_send));
        self.register_external("error", &["detail"], Rc::new(builtin_error));
    }
}

fn binding_is_set(value: Value) -> bool {
    !value.is_empty()
}

/// Stage a For restart and run the first iteration. `from == to` iterates
/// zero times. The direction of travel picks the step sign; the end bound
/// is exclusive.
fn builtin_for(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    let from = match vm.store.as_number(&args[0]) {
        Ok(n) => n,
        Err(fault) => {
            vm.raise_fault(fault);
            return Value::Empty;
        }
    };
    let to = match vm.store.as_number(&args[1]) {
        Ok(n) => n,
        Err(fault) => {
            vm.raise_fault(fault);
            return Value::Empty;
        }
    };
    let body = args[2];
    let Some(stub) = vm.store.function_stub(&body) else {
        vm.raise_fault(RuntimeFault::not_callable(body.tag_name()));
        return Value::Empty;
    };
    if from == to {
        return Value::Empty;
    }
    let increment = if from < to { 1.0 } else { -1.0 };
    vm.pending_restart = Some(RestartCondition::For {
        counter: from,
        end: to,
        increment,
    });
    let mut call_args = Vec::with_capacity(1);
    if let Some(name) = stub.arguments.first() {
        call_args.push((vm.store.intern(name), Value::Number(from)));
    }
    vm.call_with_values(body, &call_args, Value::Empty);
    Value::Empty
}

fn builtin_forever(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    let body = args[0];
    if vm.store.function_stub(&body).is_none() {
        vm.raise_fault(RuntimeFault::not_callable(body.tag_name()));
        return Value::Empty;
    }
    vm.pending_restart = Some(RestartCondition::Forever);
    vm.call_with_values(body, &[], Value::Empty);
    Value::Empty
}

/// Iterates a snapshot of the subject's pairs, so bodies that mutate the
/// subject see a stable traversal.
fn builtin_foreach(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    let subject = args[0];
    let body = args[1];
    let pairs = match vm.store.object_pairs(&subject) {
        Ok(pairs) => pairs,
        Err(fault) => {
            vm.raise_fault(fault);
            return Value::Empty;
        }
    };
    let Some(stub) = vm.store.function_stub(&body) else {
        vm.raise_fault(RuntimeFault::not_callable(body.tag_name()));
        return Value::Empty;
    };
    let Some((key, value)) = pairs.first().copied() else {
        return Value::Empty;
    };
    let mut call_args = Vec::with_capacity(2);
    if let Some(name) = stub.arguments.first() {
        call_args.push((vm.store.intern(name), key));
    }
    if let Some(name) = stub.arguments.get(1) {
        call_args.push((vm.store.intern(name), value));
    }
    vm.pending_restart = Some(RestartCondition::Foreach { pairs, index: 0 });
    vm.call_with_values(body, &call_args, Value::Empty);
    Value::Empty
}

fn builtin_import(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    let Some(name) = vm.store.string_content(&args[0]).map(|s| s.to_owned()) else {
        vm.raise_fault(RuntimeFault::type_error("import requires a String module name"));
        return Value::Empty;
    };
    vm.import(&name)
}

fn builtin_print(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    let text = vm.store.as_display_string(&args[0]);
    let callback = Rc::clone(&vm.print_callback);
    callback(&text);
    Value::Empty
}

fn builtin_send(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    vm.raise_message(args[0]);
    Value::Empty
}

fn builtin_error(vm: &mut Vm, _function: Value, args: &[Value]) -> Value {
    vm.raise_error(args[0]);
    Value::Empty
}
