//! The tagged value representation and pool handles.

/// A generation-checked handle into the store's string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId {
    pub index: u32,
    pub generation: u32,
}

/// A generation-checked handle into the store's object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub index: u32,
    pub generation: u32,
}

/// A handle into the store's type registry. Types live for the store's
/// lifetime, so no generation is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const ANY: TypeId = TypeId(0);
    pub const EMPTY: TypeId = TypeId(1);
    pub const BOOLEAN: TypeId = TypeId(2);
    pub const NUMBER: TypeId = TypeId(3);
    pub const STRING: TypeId = TypeId(4);
    pub const OBJECT: TypeId = TypeId(5);
    pub const FUNCTION: TypeId = TypeId(6);
    pub const TYPE: TypeId = TypeId(7);

    /// Number of built-in types seeded into every store.
    pub const BUILTIN_COUNT: u32 = 8;

    /// Map a bytecode built-in type code to its id.
    pub fn from_builtin_code(code: u8) -> Option<TypeId> {
        if u32::from(code) < Self::BUILTIN_COUNT {
            Some(TypeId(u32::from(code)))
        } else {
            None
        }
    }
}

/// A runtime value. Scalars carry their payload directly; strings, objects
/// and types carry handles into the owning store's pools, so copying a
/// `Value` never copies a body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Empty,
    Boolean(bool),
    Number(f64),
    String(StringId),
    Object(ObjectId),
    Type(TypeId),
}

impl Value {
    /// Tag name for diagnostics.
    pub fn tag_name(&self) -> &'static str {
        match self {
            Value::Empty => "Empty",
            Value::Boolean(_) => "Boolean",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Object(_) => "Object",
            Value::Type(_) => "Type",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            Value::String(id) => Some(*id),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

/// A hashable key for an object's keyed part.
///
/// Numbers are keyed by their bit pattern so that `f64` can participate in
/// `Eq`/`Hash`; negative zero folds onto zero and every NaN folds onto the
/// canonical NaN so equal-looking keys collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Empty,
    Boolean(bool),
    Number(u64),
    String(StringId),
    Object(ObjectId),
    Type(TypeId),
}

impl Key {
    pub fn from_value(value: &Value) -> Key {
        match value {
            Value::Empty => Key::Empty,
            Value::Boolean(b) => Key::Boolean(*b),
            Value::Number(n) => Key::Number(canonical_bits(*n)),
            Value::String(id) => Key::String(*id),
            Value::Object(id) => Key::Object(*id),
            Value::Type(id) => Key::Type(*id),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Empty => Value::Empty,
            Key::Boolean(b) => Value::Boolean(*b),
            Key::Number(bits) => Value::Number(f64::from_bits(*bits)),
            Key::String(id) => Value::String(*id),
            Key::Object(id) => Value::Object(*id),
            Key::Type(id) => Value::Type(*id),
        }
    }

    /// The dense-part index this key routes to, if it is a non-negative
    /// integral number.
    pub fn dense_index(&self) -> Option<usize> {
        match self {
            Key::Number(bits) => {
                let n = f64::from_bits(*bits);
                if n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 {
                    Some(n as usize)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

fn canonical_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_is_copy_cheap() {
        let a = Value::Number(4.5);
        let b = a;
        assert_eq!(a, b);
        assert_eq!(std::mem::size_of::<Value>(), 16);
    }

    #[test]
    fn test_key_folds_negative_zero() {
        let a = Key::from_value(&Value::Number(0.0));
        let b = Key::from_value(&Value::Number(-0.0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_dense_index() {
        assert_eq!(Key::from_value(&Value::Number(3.0)).dense_index(), Some(3));
        assert_eq!(Key::from_value(&Value::Number(3.5)).dense_index(), None);
        assert_eq!(Key::from_value(&Value::Number(-1.0)).dense_index(), None);
        assert_eq!(Key::from_value(&Value::Boolean(true)).dense_index(), None);
    }

    #[test]
    fn test_key_round_trip() {
        let v = Value::Number(12.25);
        assert_eq!(Key::from_value(&v).to_value(), v);
    }
}
