//! Object bodies: keyed and dense storage, attributes, activation state.

use std::any::Any;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::Stub;

use super::value::{Key, TypeId, Value};

/// Finalizer hook run exactly once when an object is swept. Receives the
/// object's userdata, if any was attached.
pub type Finalizer = Box<dyn FnOnce(Option<Box<dyn Any>>)>;

/// The typed signature attached to a strict function.
#[derive(Debug, Clone)]
pub struct Signature {
    /// One type per declared parameter, in declaration order.
    pub parameters: Vec<TypeId>,
    /// Required type of the return value.
    pub returns: TypeId,
}

/// State carried by an object that wraps a function.
pub struct FunctionState {
    /// The bytecode template this function was created from.
    pub stub: Rc<Stub>,
    /// Referrable storage once activated: slot 0 is the context value,
    /// slots 1..=argc the arguments, the rest locals. Length is fixed at
    /// activation.
    pub referrables: Vec<Value>,
    /// Whether this object has been activated. A second call through an
    /// activated function clones a fresh activation instead of clobbering
    /// this one's referrables.
    pub activated: bool,
    /// Originating object for dynamic-bind ("$") functions.
    pub bound_origin: Option<Value>,
    /// Private binding carried into calls, readable only via the
    /// push-private-binding instruction.
    pub private_binding: Option<Value>,
    /// Present on strict functions; checked before and after each call.
    pub signature: Option<Signature>,
}

impl FunctionState {
    pub fn new(stub: Rc<Stub>) -> Self {
        Self {
            stub,
            referrables: Vec::new(),
            activated: false,
            bound_origin: None,
            private_binding: None,
            signature: None,
        }
    }

    /// A fresh, unactivated copy sharing the stub and bindings.
    pub fn clone_unactivated(&self) -> Self {
        Self {
            stub: Rc::clone(&self.stub),
            referrables: Vec::new(),
            activated: false,
            bound_origin: self.bound_origin,
            private_binding: self.private_binding,
            signature: self.signature.clone(),
        }
    }
}

/// An object body.
///
/// The keyed part is insertion-ordered; the dense part shadows the
/// contiguous numeric keys `0..dense.len()` for array-like access. A
/// numeric key equal to the dense length appends, keeping the range
/// contiguous; anything past that falls into the keyed part until the
/// range grows to reach it.
pub struct Object {
    keyed: IndexMap<Key, Value, ahash::RandomState>,
    dense: Vec<Value>,
    /// Operator hook table, itself an object keyed by symbol strings.
    pub attributes: Option<Value>,
    pub userdata: Option<Box<dyn Any>>,
    pub finalizer: Option<Finalizer>,
    /// Root-pinning depth. Nonzero means the object is a GC root.
    pub lock_count: u32,
    /// Alias bookkeeping for copy/recycle. Does not root the object.
    pub ref_count: u32,
    pub marked: bool,
    pub function: Option<FunctionState>,
}

impl Object {
    pub fn new() -> Self {
        Self {
            keyed: IndexMap::default(),
            dense: Vec::new(),
            attributes: None,
            userdata: None,
            finalizer: None,
            lock_count: 0,
            ref_count: 1,
            marked: false,
            function: None,
        }
    }

    pub fn new_function(state: FunctionState) -> Self {
        let mut obj = Self::new();
        obj.function = Some(state);
        obj
    }

    pub fn is_function(&self) -> bool {
        self.function.is_some()
    }

    pub fn get(&self, key: &Key) -> Value {
        if let Some(i) = key.dense_index() {
            if i < self.dense.len() {
                return self.dense[i];
            }
        }
        self.keyed.get(key).copied().unwrap_or(Value::Empty)
    }

    pub fn set(&mut self, key: Key, value: Value) {
        if let Some(i) = key.dense_index() {
            if i < self.dense.len() {
                self.dense[i] = value;
                return;
            }
            if i == self.dense.len() {
                self.dense.push(value);
                self.absorb_keyed_run();
                return;
            }
        }
        self.keyed.insert(key, value);
    }

    /// Keyed entries that continue the numeric range move into the dense
    /// part whenever growth reaches them; an index never lives in both
    /// parts at once.
    fn absorb_keyed_run(&mut self) {
        loop {
            let next = Key::from_value(&Value::Number(self.dense.len() as f64));
            match self.keyed.shift_remove(&next) {
                Some(value) => self.dense.push(value),
                None => break,
            }
        }
    }

    pub fn remove(&mut self, key: &Key) -> Value {
        if let Some(i) = key.dense_index() {
            if i < self.dense.len() {
                // Truncating would shift later indices; hole the slot instead.
                let old = self.dense[i];
                self.dense[i] = Value::Empty;
                return old;
            }
        }
        self.keyed.shift_remove(key).unwrap_or(Value::Empty)
    }

    /// Total number of stored entries, dense and keyed.
    pub fn key_count(&self) -> usize {
        self.dense.len() + self.keyed.len()
    }

    /// Length of the contiguous numeric range.
    pub fn dense_len(&self) -> usize {
        self.dense.len()
    }

    pub fn dense_push(&mut self, value: Value) {
        self.dense.push(value);
        self.absorb_keyed_run();
    }

    /// All keys in iteration order: dense indices first, then keyed
    /// insertion order.
    pub fn keys(&self) -> Vec<Value> {
        let mut out = Vec::with_capacity(self.key_count());
        for i in 0..self.dense.len() {
            out.push(Value::Number(i as f64));
        }
        for key in self.keyed.keys() {
            out.push(key.to_value());
        }
        out
    }

    /// All key/value pairs in iteration order.
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(self.key_count());
        for (i, v) in self.dense.iter().enumerate() {
            out.push((Value::Number(i as f64), *v));
        }
        for (k, v) in self.keyed.iter() {
            out.push((k.to_value(), *v));
        }
        out
    }

    /// Append every value reachable from this body to `out`. Keys count as
    /// reachable: an object used as a key must outlive the table.
    pub fn trace(&self, out: &mut Vec<Value>) {
        out.extend(self.dense.iter().copied());
        for (k, v) in self.keyed.iter() {
            out.push(k.to_value());
            out.push(*v);
        }
        if let Some(attrs) = self.attributes {
            out.push(attrs);
        }
        if let Some(state) = &self.function {
            out.extend(state.referrables.iter().copied());
            if let Some(origin) = state.bound_origin {
                out.push(origin);
            }
            if let Some(binding) = state.private_binding {
                out.push(binding);
            }
        }
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::value::StringId;

    fn key(n: f64) -> Key {
        Key::from_value(&Value::Number(n))
    }

    #[test]
    fn test_dense_routing() {
        let mut obj = Object::new();
        obj.set(key(0.0), Value::Number(10.0));
        obj.set(key(1.0), Value::Number(11.0));
        assert_eq!(obj.dense_len(), 2);
        assert_eq!(obj.get(&key(1.0)), Value::Number(11.0));
    }

    #[test]
    fn test_sparse_number_key_goes_keyed() {
        let mut obj = Object::new();
        obj.set(key(5.0), Value::Boolean(true));
        assert_eq!(obj.dense_len(), 0);
        assert_eq!(obj.key_count(), 1);
        assert_eq!(obj.get(&key(5.0)), Value::Boolean(true));
    }

    #[test]
    fn test_append_extends_dense() {
        let mut obj = Object::new();
        obj.set(key(0.0), Value::Number(1.0));
        obj.set(key(1.0), Value::Number(2.0));
        obj.set(key(2.0), Value::Number(3.0));
        assert_eq!(obj.dense_len(), 3);
    }

    #[test]
    fn test_growth_reaching_keyed_index_absorbs_it() {
        let mut obj = Object::new();
        obj.set(key(5.0), Value::Number(50.0));
        for i in 0..5 {
            obj.set(key(i as f64), Value::Number(i as f64));
        }
        obj.set(key(5.0), Value::Number(99.0));
        assert_eq!(obj.key_count(), 6);
        assert_eq!(obj.get(&key(5.0)), Value::Number(99.0));
        let pairs = obj.pairs();
        assert_eq!(pairs.len(), 6);
        assert_eq!(pairs[5], (Value::Number(5.0), Value::Number(99.0)));
    }

    #[test]
    fn test_growth_absorbs_contiguous_keyed_run() {
        let mut obj = Object::new();
        obj.set(key(6.0), Value::Number(60.0));
        obj.set(key(5.0), Value::Number(50.0));
        obj.set(key(8.0), Value::Number(80.0));
        for i in 0..5 {
            obj.set(key(i as f64), Value::Number(i as f64));
        }
        assert_eq!(obj.dense_len(), 7);
        assert_eq!(obj.key_count(), 8);
        assert_eq!(obj.get(&key(5.0)), Value::Number(50.0));
        assert_eq!(obj.get(&key(6.0)), Value::Number(60.0));
        assert_eq!(obj.get(&key(8.0)), Value::Number(80.0));
    }

    #[test]
    fn test_push_past_keyed_index_absorbs_it() {
        let mut obj = Object::new();
        obj.set(key(1.0), Value::Number(10.0));
        obj.dense_push(Value::Number(0.0));
        assert_eq!(obj.dense_len(), 2);
        obj.dense_push(Value::Number(2.0));
        assert_eq!(obj.key_count(), 3);
        assert_eq!(obj.get(&key(1.0)), Value::Number(10.0));
        assert_eq!(obj.get(&key(2.0)), Value::Number(2.0));
    }

    #[test]
    fn test_missing_key_reads_empty() {
        let obj = Object::new();
        let k = Key::String(StringId {
            index: 0,
            generation: 0,
        });
        assert_eq!(obj.get(&k), Value::Empty);
    }

    #[test]
    fn test_keys_order_dense_then_insertion() {
        let mut obj = Object::new();
        obj.set(Key::Boolean(true), Value::Number(1.0));
        obj.set(key(0.0), Value::Number(2.0));
        let keys = obj.keys();
        assert_eq!(keys[0], Value::Number(0.0));
        assert_eq!(keys[1], Value::Boolean(true));
    }
}
