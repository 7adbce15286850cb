//! Stack frames and the loop-restart protocol.

use crate::store::Value;

/// Why a finished frame should run again instead of returning.
///
/// Installed by the loop builtins before they invoke the body function.
/// When the body's instruction stream exhausts with no catchable pending,
/// the engine consults the condition: on continue it resets the program
/// counter and reuses the same frame, context and referrables, so bindings
/// mutated by one iteration stay visible to the next.
#[derive(Debug, Clone)]
pub enum RestartCondition {
    /// Counted loop. A Number result from the body overrides the counter
    /// before the increment is applied.
    For {
        counter: f64,
        end: f64,
        increment: f64,
    },
    /// Unconditional restart; only a catchable exits.
    Forever,
    /// Iteration over a snapshot of an object's key/value pairs, taken
    /// when the loop started.
    Foreach {
        pairs: Vec<(Value, Value)>,
        index: usize,
    },
}

impl RestartCondition {
    /// Values a collection must treat as reachable while the condition is
    /// pending.
    pub fn trace(&self, out: &mut Vec<Value>) {
        if let RestartCondition::Foreach { pairs, .. } = self {
            for (k, v) in pairs {
                out.push(*k);
                out.push(*v);
            }
        }
    }
}

/// One level of the call stack.
///
/// Frames are pooled: the engine keeps a `Vec<StackFrame>` whose entries
/// `0..depth` are live, and a returning call resets its frame for reuse
/// instead of dropping it. The referrable storage is not here; it lives in
/// the context value's activation so captures can reach it.
#[derive(Debug)]
pub struct StackFrame {
    pub pc: usize,
    /// Operand stack.
    pub stack: Vec<Value>,
    /// The activated function this frame executes.
    pub context: Value,
    /// Value readable via the push-private-binding instruction.
    pub private_binding: Value,
    pub restart: Option<RestartCondition>,
}

impl StackFrame {
    pub fn new() -> Self {
        Self {
            pc: 0,
            stack: Vec::with_capacity(16),
            context: Value::Empty,
            private_binding: Value::Empty,
            restart: None,
        }
    }

    /// Clear for reuse. Dropping the values here matters: a parked frame
    /// must not pin garbage through the root scan.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.stack.clear();
        self.context = Value::Empty;
        self.private_binding = Value::Empty;
        self.restart = None;
    }
}

impl Default for StackFrame {
    fn default() -> Self {
        Self::new()
    }
}
