//! The value store: pools, interning, conversions and the type registry.

pub mod gc;
pub mod heap;
pub mod object;
pub mod value;

use std::any::Any;
use std::rc::Rc;

use ahash::AHashMap;

use crate::bytecode::Stub;
use crate::error::RuntimeFault;

use heap::Pool;
pub use object::{Finalizer, FunctionState, Object, Signature};
pub use value::{Key, ObjectId, StringId, TypeId, Value};

/// An interned string body. Strings are immutable; the reference count
/// tracks external retention (embedder copies, stub pools) and the mark bit
/// tracks reachability during a collection. Either keeps the body alive.
pub(crate) struct StringBody {
    pub(crate) text: Box<str>,
    pub(crate) refs: u32,
    pub(crate) marked: bool,
}

struct TypeEntry {
    name: Box<str>,
}

const INITIAL_GC_THRESHOLD: usize = 256;

/// Owns every composite value body. One store per engine; handles from one
/// store are meaningless in another.
pub struct ValueStore {
    pub(crate) objects: Pool<Object>,
    pub(crate) strings: Pool<StringBody>,
    pub(crate) interned: AHashMap<Box<str>, StringId>,
    types: Vec<TypeEntry>,
    pub(crate) allocations: usize,
    pub(crate) gc_threshold: usize,
    pub(crate) collections: usize,
}

impl ValueStore {
    pub fn new() -> Self {
        let builtin_names = [
            "Any", "Empty", "Boolean", "Number", "String", "Object", "Function", "Type",
        ];
        Self {
            objects: Pool::new(),
            strings: Pool::new(),
            interned: AHashMap::new(),
            types: builtin_names
                .iter()
                .map(|n| TypeEntry { name: (*n).into() })
                .collect(),
            allocations: 0,
            gc_threshold: INITIAL_GC_THRESHOLD,
            collections: 0,
        }
    }

    // --- Creation ---

    pub fn empty(&self) -> Value {
        Value::Empty
    }

    pub fn boolean(&self, b: bool) -> Value {
        Value::Boolean(b)
    }

    pub fn number(&self, n: f64) -> Value {
        Value::Number(n)
    }

    /// Intern `text` without taking a reference. The result stays alive
    /// only while reachable from a root; callers that outlive the next
    /// collection must retain it via [`ValueStore::copy_value`].
    pub(crate) fn intern(&mut self, text: &str) -> Value {
        if let Some(id) = self.interned.get(text) {
            if self.strings.get(id.index, id.generation).is_some() {
                return Value::String(*id);
            }
        }
        let (index, generation) = self.strings.insert(StringBody {
            text: text.into(),
            refs: 0,
            marked: false,
        });
        let id = StringId { index, generation };
        self.interned.insert(text.into(), id);
        self.allocations += 1;
        Value::String(id)
    }

    /// Create (or find) the interned string for `text` and hand the caller
    /// a reference to it. Release with [`ValueStore::recycle_value`].
    pub fn create_string(&mut self, text: &str) -> Value {
        let v = self.intern(text);
        self.copy_value(&v)
    }

    pub fn create_object(&mut self) -> Value {
        let (index, generation) = self.objects.insert(Object::new());
        self.allocations += 1;
        Value::Object(ObjectId { index, generation })
    }

    /// Create an unactivated function object from a stub.
    pub fn create_function(&mut self, stub: Rc<Stub>) -> Value {
        let (index, generation) = self.objects.insert(Object::new_function(FunctionState::new(stub)));
        self.allocations += 1;
        Value::Object(ObjectId { index, generation })
    }

    pub fn create_type(&mut self, name: &str) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeEntry { name: name.into() });
        id
    }

    // --- Reference bookkeeping ---

    /// Alias a value. Scalars copy; strings and objects gain a reference
    /// and share their body.
    pub fn copy_value(&mut self, value: &Value) -> Value {
        match value {
            Value::String(id) => {
                if let Some(body) = self.strings.get_mut(id.index, id.generation) {
                    body.refs += 1;
                }
            }
            Value::Object(id) => {
                if let Some(obj) = self.objects.get_mut(id.index, id.generation) {
                    obj.ref_count += 1;
                }
            }
            _ => {}
        }
        *value
    }

    /// Drop a reference. Never frees eagerly; reclamation happens only in
    /// a collection pass, since cycles make eager freeing unsound.
    pub fn recycle_value(&mut self, value: &Value) {
        match value {
            Value::String(id) => {
                if let Some(body) = self.strings.get_mut(id.index, id.generation) {
                    body.refs = body.refs.saturating_sub(1);
                }
            }
            Value::Object(id) => {
                if let Some(obj) = self.objects.get_mut(id.index, id.generation) {
                    obj.ref_count = obj.ref_count.saturating_sub(1);
                }
            }
            _ => {}
        }
    }

    /// Alias count recorded by copy/recycle for a string or object body.
    /// A retained string survives collection; an object is reclaimed by
    /// reachability alone, so its count is diagnostic.
    pub fn reference_count(&self, value: &Value) -> u32 {
        match value {
            Value::String(id) => self
                .strings
                .get(id.index, id.generation)
                .map_or(0, |body| body.refs),
            Value::Object(id) => self
                .objects
                .get(id.index, id.generation)
                .map_or(0, |obj| obj.ref_count),
            _ => 0,
        }
    }

    /// Pin an object as a GC root. Nestable; objects only (strings are
    /// pinned by retaining them).
    pub fn push_lock(&mut self, value: &Value) {
        if let Value::Object(id) = value {
            if let Some(obj) = self.objects.get_mut(id.index, id.generation) {
                obj.lock_count += 1;
            }
        }
    }

    pub fn pop_lock(&mut self, value: &Value) {
        if let Value::Object(id) = value {
            if let Some(obj) = self.objects.get_mut(id.index, id.generation) {
                obj.lock_count = obj.lock_count.saturating_sub(1);
            }
        }
    }

    /// Whether the value's body is still present in its pool.
    pub fn is_live(&self, value: &Value) -> bool {
        match value {
            Value::String(id) => self.strings.get(id.index, id.generation).is_some(),
            Value::Object(id) => self.objects.get(id.index, id.generation).is_some(),
            _ => true,
        }
    }

    // --- Strings ---

    pub fn string_content(&self, value: &Value) -> Option<&str> {
        match value {
            Value::String(id) => self
                .strings
                .get(id.index, id.generation)
                .map(|body| body.text.as_ref()),
            _ => None,
        }
    }

    // --- Objects ---

    fn object(&self, value: &Value) -> Result<&Object, RuntimeFault> {
        match value {
            Value::Object(id) => self
                .objects
                .get(id.index, id.generation)
                .ok_or_else(|| RuntimeFault::type_error("object has been released")),
            other => Err(RuntimeFault::type_error(format!(
                "expected an Object, got {}",
                other.tag_name()
            ))),
        }
    }

    fn object_mut(&mut self, value: &Value) -> Result<&mut Object, RuntimeFault> {
        match value {
            Value::Object(id) => self
                .objects
                .get_mut(id.index, id.generation)
                .ok_or_else(|| RuntimeFault::type_error("object has been released")),
            other => Err(RuntimeFault::type_error(format!(
                "expected an Object, got {}",
                other.tag_name()
            ))),
        }
    }

    pub fn object_get(&self, object: &Value, key: &Value) -> Result<Value, RuntimeFault> {
        let obj = self.object(object)?;
        Ok(obj.get(&Key::from_value(key)))
    }

    pub fn object_set(
        &mut self,
        object: &Value,
        key: &Value,
        value: Value,
    ) -> Result<(), RuntimeFault> {
        let obj = self.object_mut(object)?;
        obj.set(Key::from_value(key), value);
        Ok(())
    }

    pub fn object_remove(&mut self, object: &Value, key: &Value) -> Result<Value, RuntimeFault> {
        let obj = self.object_mut(object)?;
        Ok(obj.remove(&Key::from_value(key)))
    }

    /// Get a member by string name, interning the name.
    pub fn object_get_str(&mut self, object: &Value, name: &str) -> Result<Value, RuntimeFault> {
        let key = self.intern(name);
        self.object_get(object, &key)
    }

    /// Set a member by string name, interning the name.
    pub fn object_set_str(
        &mut self,
        object: &Value,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeFault> {
        let key = self.intern(name);
        self.object_set(object, &key, value)
    }

    pub fn object_key_count(&self, object: &Value) -> Result<usize, RuntimeFault> {
        Ok(self.object(object)?.key_count())
    }

    pub fn object_dense_len(&self, object: &Value) -> Result<usize, RuntimeFault> {
        Ok(self.object(object)?.dense_len())
    }

    pub fn object_push(&mut self, object: &Value, value: Value) -> Result<(), RuntimeFault> {
        self.object_mut(object)?.dense_push(value);
        Ok(())
    }

    pub fn object_keys(&self, object: &Value) -> Result<Vec<Value>, RuntimeFault> {
        Ok(self.object(object)?.keys())
    }

    pub fn object_pairs(&self, object: &Value) -> Result<Vec<(Value, Value)>, RuntimeFault> {
        Ok(self.object(object)?.pairs())
    }

    // --- Attributes ---

    pub fn set_attributes(&mut self, object: &Value, attributes: Value) -> Result<(), RuntimeFault> {
        let obj = self.object_mut(object)?;
        obj.attributes = if attributes.is_empty() {
            None
        } else {
            Some(attributes)
        };
        Ok(())
    }

    pub fn attributes(&self, object: &Value) -> Option<Value> {
        self.object(object).ok().and_then(|obj| obj.attributes)
    }

    /// Look up an operator hook by symbol. Absence means "no override".
    pub fn attribute(&mut self, object: &Value, symbol: &str) -> Option<Value> {
        let attrs = self.attributes(object)?;
        let key = self.intern(symbol);
        match self.object_get(&attrs, &key) {
            Ok(Value::Empty) | Err(_) => None,
            Ok(v) => Some(v),
        }
    }

    // --- Userdata & finalizers ---

    pub fn set_userdata(&mut self, object: &Value, data: Box<dyn Any>) -> Result<(), RuntimeFault> {
        self.object_mut(object)?.userdata = Some(data);
        Ok(())
    }

    pub fn userdata(&self, object: &Value) -> Option<&dyn Any> {
        self.object(object)
            .ok()
            .and_then(|obj| obj.userdata.as_deref())
    }

    pub fn take_userdata(&mut self, object: &Value) -> Option<Box<dyn Any>> {
        self.object_mut(object).ok().and_then(|obj| obj.userdata.take())
    }

    /// Attach a finalizer, run exactly once when the object is swept.
    pub fn set_finalizer(&mut self, object: &Value, finalizer: Finalizer) -> Result<(), RuntimeFault> {
        self.object_mut(object)?.finalizer = Some(finalizer);
        Ok(())
    }

    // --- Functions ---

    pub fn is_function(&self, value: &Value) -> bool {
        self.object(value).map(|o| o.is_function()).unwrap_or(false)
    }

    pub fn function_stub(&self, value: &Value) -> Option<Rc<Stub>> {
        self.object(value)
            .ok()
            .and_then(|obj| obj.function.as_ref())
            .map(|state| Rc::clone(&state.stub))
    }

    /// Activate a function with its referrable storage, returning the
    /// context value. Activation is at-most-once per object: activating
    /// through an already-activated value clones a fresh activation so
    /// re-entrant calls get independent referrables. Slot 0 is overwritten
    /// with the context value itself.
    pub fn activate(
        &mut self,
        function: Value,
        mut referrables: Vec<Value>,
    ) -> Result<Value, RuntimeFault> {
        let needs_clone = {
            let obj = self.object(&function)?;
            match &obj.function {
                Some(state) => state.activated,
                None => {
                    return Err(RuntimeFault::type_error(
                        "cannot activate a non-function object",
                    ))
                }
            }
        };

        let context = if needs_clone {
            let cloned_state = {
                let obj = self.object(&function)?;
                obj.function
                    .as_ref()
                    .map(|s| s.clone_unactivated())
                    .ok_or_else(|| RuntimeFault::type_error("cannot activate a non-function object"))?
            };
            let (index, generation) = self.objects.insert(Object::new_function(cloned_state));
            self.allocations += 1;
            Value::Object(ObjectId { index, generation })
        } else {
            function
        };

        if !referrables.is_empty() {
            referrables[0] = context;
        }
        let obj = self.object_mut(&context)?;
        let state = obj
            .function
            .as_mut()
            .ok_or_else(|| RuntimeFault::type_error("cannot activate a non-function object"))?;
        state.referrables = referrables;
        state.activated = true;
        Ok(context)
    }

    pub fn referrable(&self, context: &Value, index: usize) -> Option<Value> {
        self.object(context)
            .ok()
            .and_then(|obj| obj.function.as_ref())
            .and_then(|state| state.referrables.get(index).copied())
    }

    pub fn set_referrable(
        &mut self,
        context: &Value,
        index: usize,
        value: Value,
    ) -> Result<(), RuntimeFault> {
        let obj = self.object_mut(context)?;
        let state = obj
            .function
            .as_mut()
            .ok_or_else(|| RuntimeFault::type_error("not a function"))?;
        match state.referrables.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeFault::InvalidReferrable(index as u32)),
        }
    }

    pub fn set_bound_origin(&mut self, function: &Value, origin: Value) -> Result<(), RuntimeFault> {
        let obj = self.object_mut(function)?;
        match obj.function.as_mut() {
            Some(state) => {
                state.bound_origin = Some(origin);
                Ok(())
            }
            None => Err(RuntimeFault::type_error("not a function")),
        }
    }

    pub fn bound_origin(&self, function: &Value) -> Option<Value> {
        self.object(function)
            .ok()
            .and_then(|obj| obj.function.as_ref())
            .and_then(|state| state.bound_origin)
    }

    pub fn set_private_binding(
        &mut self,
        function: &Value,
        binding: Value,
    ) -> Result<(), RuntimeFault> {
        let obj = self.object_mut(function)?;
        match obj.function.as_mut() {
            Some(state) => {
                state.private_binding = Some(binding);
                Ok(())
            }
            None => Err(RuntimeFault::type_error("not a function")),
        }
    }

    pub fn private_binding(&self, function: &Value) -> Option<Value> {
        self.object(function)
            .ok()
            .and_then(|obj| obj.function.as_ref())
            .and_then(|state| state.private_binding)
    }

    pub fn set_signature(
        &mut self,
        function: &Value,
        signature: Signature,
    ) -> Result<(), RuntimeFault> {
        let obj = self.object_mut(function)?;
        match obj.function.as_mut() {
            Some(state) => {
                state.signature = Some(signature);
                Ok(())
            }
            None => Err(RuntimeFault::type_error("not a function")),
        }
    }

    pub fn signature(&self, function: &Value) -> Option<Signature> {
        self.object(function)
            .ok()
            .and_then(|obj| obj.function.as_ref())
            .and_then(|state| state.signature.clone())
    }

    // --- Conversions ---

    pub fn as_boolean(&self, value: &Value) -> bool {
        match value {
            Value::Empty => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(_) | Value::Object(_) | Value::Type(_) => true,
        }
    }

    pub fn as_number(&self, value: &Value) -> Result<f64, RuntimeFault> {
        match value {
            Value::Empty => Ok(0.0),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Ok(*n),
            Value::String(_) => {
                let text = self
                    .string_content(value)
                    .ok_or_else(|| RuntimeFault::type_error("string has been released"))?;
                text.trim().parse::<f64>().map_err(|_| {
                    RuntimeFault::type_error(format!("'{}' is not a number", text))
                })
            }
            other => Err(RuntimeFault::type_error(format!(
                "cannot convert {} to Number",
                other.tag_name()
            ))),
        }
    }

    pub fn as_display_string(&self, value: &Value) -> String {
        match value {
            Value::Empty => "empty".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(_) => self
                .string_content(value)
                .unwrap_or("<released string>")
                .to_string(),
            Value::Object(_) => {
                if self.is_function(value) {
                    "<function>".to_string()
                } else {
                    "<object>".to_string()
                }
            }
            Value::Type(id) => self.type_name(*id).to_string(),
        }
    }

    // --- Types ---

    pub fn type_name(&self, id: TypeId) -> &str {
        self.types
            .get(id.0 as usize)
            .map(|entry| entry.name.as_ref())
            .unwrap_or("<unknown type>")
    }

    pub fn type_of(&self, value: &Value) -> TypeId {
        match value {
            Value::Empty => TypeId::EMPTY,
            Value::Boolean(_) => TypeId::BOOLEAN,
            Value::Number(_) => TypeId::NUMBER,
            Value::String(_) => TypeId::STRING,
            Value::Object(_) => {
                if self.is_function(value) {
                    TypeId::FUNCTION
                } else {
                    TypeId::OBJECT
                }
            }
            Value::Type(_) => TypeId::TYPE,
        }
    }

    /// Type conformance. `Any` accepts everything; function values also
    /// conform to `Object`.
    pub fn is_a(&self, value: &Value, expected: TypeId) -> bool {
        if expected == TypeId::ANY {
            return true;
        }
        let actual = self.type_of(value);
        if actual == expected {
            return true;
        }
        expected == TypeId::OBJECT && matches!(value, Value::Object(_))
    }

    // --- Statistics ---

    pub fn live_object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn live_string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn collection_count(&self) -> usize {
        self.collections
    }

    /// Whether allocation pressure warrants a collection. The engine polls
    /// this at call-return boundaries.
    pub fn should_collect(&self) -> bool {
        self.allocations >= self.gc_threshold
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number the way the language prints it: integral values without
/// a fractional part, everything else through the shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n == (n as i64) as f64 {
        itoa::Buffer::new().format(n as i64).to_string()
    } else {
        ryu::Buffer::new().format(n).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_string_interning_identity() {
        let mut store = ValueStore::new();
        let a = store.create_string("hello");
        let b = store.create_string("hello");
        assert_eq!(a, b);
        assert_eq!(store.live_string_count(), 1);
    }

    #[test]
    fn test_string_content() {
        let mut store = ValueStore::new();
        let v = store.create_string("matte");
        assert_eq!(store.string_content(&v), Some("matte"));
    }

    #[test]
    fn test_object_member_round_trip() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        store.object_set_str(&obj, "x", Value::Number(4.0)).unwrap();
        assert_eq!(store.object_get_str(&obj, "x").unwrap(), Value::Number(4.0));
        assert_eq!(store.object_get_str(&obj, "y").unwrap(), Value::Empty);
    }

    #[test]
    fn test_reference_count_tracks_copy_and_recycle() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        assert_eq!(store.reference_count(&obj), 1);
        store.copy_value(&obj);
        store.copy_value(&obj);
        assert_eq!(store.reference_count(&obj), 3);
        store.recycle_value(&obj);
        assert_eq!(store.reference_count(&obj), 2);

        let s = store.create_string("alias");
        assert_eq!(store.reference_count(&s), 1);
        store.copy_value(&s);
        assert_eq!(store.reference_count(&s), 2);
        store.recycle_value(&s);
        store.recycle_value(&s);
        store.recycle_value(&s);
        assert_eq!(store.reference_count(&s), 0);
        assert_eq!(store.reference_count(&Value::Number(1.0)), 0);
    }

    #[test]
    fn test_object_get_on_scalar_is_type_error() {
        let store = ValueStore::new();
        let err = store.object_get(&Value::Number(1.0), &Value::Number(0.0));
        assert!(matches!(err, Err(RuntimeFault::Type(_))));
    }

    #[test]
    fn test_as_number_coercions() {
        let mut store = ValueStore::new();
        assert_eq!(store.as_number(&Value::Empty).unwrap(), 0.0);
        assert_eq!(store.as_number(&Value::Boolean(true)).unwrap(), 1.0);
        let s = store.create_string(" 41.5 ");
        assert_eq!(store.as_number(&s).unwrap(), 41.5);
        let bad = store.create_string("nope");
        assert!(store.as_number(&bad).is_err());
    }

    #[test]
    fn test_as_boolean() {
        let mut store = ValueStore::new();
        assert!(!store.as_boolean(&Value::Empty));
        assert!(!store.as_boolean(&Value::Number(0.0)));
        assert!(store.as_boolean(&Value::Number(2.0)));
        let s = store.create_string("");
        assert!(store.as_boolean(&s));
        let obj = store.create_object();
        assert!(store.as_boolean(&obj));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(1.5), "1.5");
    }

    #[test]
    fn test_type_of_and_is_a() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        assert_eq!(store.type_of(&Value::Number(1.0)), TypeId::NUMBER);
        assert_eq!(store.type_of(&obj), TypeId::OBJECT);
        assert!(store.is_a(&obj, TypeId::ANY));
        assert!(store.is_a(&obj, TypeId::OBJECT));
        assert!(!store.is_a(&obj, TypeId::NUMBER));
        assert!(store.is_a(&Value::Empty, TypeId::EMPTY));
        assert!(!store.is_a(&Value::Empty, TypeId::OBJECT));
    }

    #[test]
    fn test_custom_type_registration() {
        let mut store = ValueStore::new();
        let t = store.create_type("Point");
        assert_eq!(store.type_name(t), "Point");
        assert!(t.0 >= TypeId::BUILTIN_COUNT);
    }

    #[test]
    fn test_attribute_lookup() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        assert_eq!(store.attribute(&obj, "+"), None);

        let attrs = store.create_object();
        let marker = store.create_object();
        store.object_set_str(&attrs, "+", marker).unwrap();
        store.set_attributes(&obj, attrs).unwrap();
        assert_eq!(store.attribute(&obj, "+"), Some(marker));
        assert_eq!(store.attribute(&obj, "-"), None);
    }

    #[test]
    fn test_dense_length_tracks_contiguous_range() {
        let mut store = ValueStore::new();
        let obj = store.create_object();
        for i in 0..4 {
            store
                .object_set(&obj, &Value::Number(i as f64), Value::Number(i as f64 * 10.0))
                .unwrap();
        }
        assert_eq!(store.object_dense_len(&obj).unwrap(), 4);
        // A gap falls into the keyed part and does not extend the range.
        store
            .object_set(&obj, &Value::Number(9.0), Value::Empty)
            .unwrap();
        assert_eq!(store.object_dense_len(&obj).unwrap(), 4);
        assert_eq!(store.object_key_count(&obj).unwrap(), 5);
    }
}
