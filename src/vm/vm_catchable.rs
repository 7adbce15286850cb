//! The catchable protocol: a single pending error-or-message slot,
//! checked after every instruction, intercepted only by `listen`.

use std::rc::Rc;

use crate::bytecode::Stub;
use crate::error::RuntimeFault;
use crate::store::Value;

use super::vm::Vm;

/// Distinguishes a raised error from a sent message. Both travel through
/// the same pending slot; only their interception handler differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchableKind {
    Error,
    Message,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Catchable {
    pub(crate) kind: CatchableKind,
    pub(crate) value: Value,
}

impl Vm {
    /// Raise a value as an error. A no-op while another catchable is
    /// pending: the first raised wins until handled or surfaced.
    pub fn raise_error(&mut self, value: Value) {
        if self.pending.is_none() {
            self.pending = Some(Catchable {
                kind: CatchableKind::Error,
                value,
            });
            self.fault_reported = false;
        }
    }

    /// Raise a value as a message.
    pub fn raise_message(&mut self, value: Value) {
        if self.pending.is_none() {
            self.pending = Some(Catchable {
                kind: CatchableKind::Message,
                value,
            });
            self.fault_reported = false;
        }
    }

    /// Internal faults surface in-language as error catchables carrying
    /// the rendered fault text.
    pub(crate) fn raise_fault(&mut self, fault: RuntimeFault) {
        if self.pending.is_none() {
            let text = fault.to_string();
            let value = self.store.intern(&text);
            self.pending = Some(Catchable {
                kind: CatchableKind::Error,
                value,
            });
            self.fault_reported = false;
        }
    }

    /// The pending catchable, if any, without clearing it.
    pub fn pending_catchable(&self) -> Option<(CatchableKind, Value)> {
        self.pending.map(|c| (c.kind, c.value))
    }

    /// Take the pending catchable, clearing the slot.
    pub fn take_catchable(&mut self) -> Option<(CatchableKind, Value)> {
        self.pending.take().map(|c| (c.kind, c.value))
    }

    /// Call `callee` with no arguments and intercept what it raises. A
    /// response object's `onError`/`onSend` entry matching the caught
    /// kind is called with the caught value bound to `message`, and its
    /// result becomes the listen result. Without a matching handler the
    /// catchable re-propagates to the caller.
    pub(crate) fn listen(&mut self, callee: Value, response: Value) -> Value {
        if self.store.function_stub(&callee).is_none() {
            self.raise_fault(RuntimeFault::not_callable(callee.tag_name()));
            return Value::Empty;
        }
        // The response is reachable only from this host frame while the
        // callee runs; a collection at a nested return must still see it.
        self.protect(response);
        let result = self.call_with_values(callee, &[], Value::Empty);
        let outcome = match self.pending.take() {
            None => result,
            Some(catchable) => {
                let handler_name = match catchable.kind {
                    CatchableKind::Error => "onError",
                    CatchableKind::Message => "onSend",
                };
                let handler = if response.is_object() {
                    match self.store.object_get_str(&response, handler_name) {
                        Ok(value) if self.store.is_function(&value) => Some(value),
                        _ => None,
                    }
                } else {
                    None
                };
                match handler {
                    Some(handler) => {
                        let message_key = self.store.intern("message");
                        self.call_with_values(
                            handler,
                            &[(message_key, catchable.value)],
                            Value::Empty,
                        )
                    }
                    None => {
                        self.pending = Some(catchable);
                        Value::Empty
                    }
                }
            }
        };
        self.unprotect(1);
        outcome
    }

    /// Fires the unhandled callback for a catchable that survived to the
    /// outermost call, then clears it so the engine stays usable.
    pub(crate) fn flush_unhandled(&mut self) {
        if let Some(catchable) = self.pending.take() {
            self.fault_reported = false;
            let callback = Rc::clone(&self.unhandled_callback);
            callback(self, catchable.kind, catchable.value);
        }
    }

    /// Notify the debug callback once per raise, at the innermost
    /// bytecode site where the pending slot was first observed set.
    pub(crate) fn report_fault_site(&mut self, stub: &Stub, line: u32) {
        if self.fault_reported {
            return;
        }
        self.fault_reported = true;
        let Some(callback) = self.debug_callback.clone() else {
            return;
        };
        let text = match &self.pending {
            Some(catchable) => self.store.as_display_string(&catchable.value),
            None => String::new(),
        };
        callback(stub.file_id, line, &text);
    }
}
