//! Operator semantics and member access, including the attribute hooks
//! that let objects override operators and intercept reads and writes.

use std::cmp::Ordering;

use crate::bytecode::{AssignOp, OperatorCode};
use crate::error::RuntimeFault;
use crate::store::Value;

use super::vm::Vm;

impl Vm {
    /// Apply a binary operator. An Object left operand consults its
    /// attribute table first: an entry under the operator's symbol is
    /// called with the right operand bound to `value`, and its result is
    /// the operation's result. Without an override only equality compares
    /// work on objects.
    pub(crate) fn binary_operator(&mut self, code: OperatorCode, a: Value, b: Value) -> Value {
        if a.is_object() {
            if let Some(handler) = self.store.attribute(&a, code.symbol()) {
                let value_key = self.store.intern("value");
                // The receiver has no frame slot while its handler runs.
                self.protect(a);
                let result = self.call_with_values(handler, &[(value_key, b)], Value::Empty);
                self.unprotect(1);
                return result;
            }
            return match code {
                OperatorCode::Eq => Value::Boolean(a == b),
                OperatorCode::NotEq => Value::Boolean(a != b),
                _ => {
                    self.raise_fault(RuntimeFault::type_error(format!(
                        "object has no '{}' operator",
                        code.symbol()
                    )));
                    Value::Empty
                }
            };
        }
        match code {
            OperatorCode::Add => self.op_add(a, b),
            OperatorCode::Sub => self.numeric_binary(a, b, |x, y| x - y),
            OperatorCode::Mul => self.numeric_binary(a, b, |x, y| x * y),
            OperatorCode::Div => self.numeric_binary(a, b, |x, y| x / y),
            OperatorCode::Mod => self.numeric_binary(a, b, |x, y| x % y),
            OperatorCode::Pow => self.numeric_binary(a, b, f64::powf),
            OperatorCode::Eq => Value::Boolean(a == b),
            OperatorCode::NotEq => Value::Boolean(a != b),
            OperatorCode::Less
            | OperatorCode::LessEq
            | OperatorCode::Greater
            | OperatorCode::GreaterEq => self.op_compare(code, a, b),
            OperatorCode::BitAnd => self.numeric_binary(a, b, |x, y| ((x as i64) & (y as i64)) as f64),
            OperatorCode::BitOr => self.numeric_binary(a, b, |x, y| ((x as i64) | (y as i64)) as f64),
            OperatorCode::BitXor => self.numeric_binary(a, b, |x, y| ((x as i64) ^ (y as i64)) as f64),
            OperatorCode::Shl => self.numeric_binary(a, b, |x, y| {
                (x as i64).wrapping_shl((y as i64) as u32) as f64
            }),
            OperatorCode::Shr => self.numeric_binary(a, b, |x, y| {
                (x as i64).wrapping_shr((y as i64) as u32) as f64
            }),
            OperatorCode::Arrow | OperatorCode::Question | OperatorCode::Diamond => {
                self.raise_fault(RuntimeFault::type_error(format!(
                    "operator '{}' requires an object override",
                    code.symbol()
                )));
                Value::Empty
            }
            OperatorCode::Not | OperatorCode::BitNot | OperatorCode::Negate | OperatorCode::Count => {
                self.unary_operator(code, a)
            }
        }
    }

    /// Unary operators are not overridable, with one exception: `#` on an
    /// object defers to a `#` attribute when present, else reports the
    /// dense length.
    pub(crate) fn unary_operator(&mut self, code: OperatorCode, a: Value) -> Value {
        match code {
            OperatorCode::Not => Value::Boolean(!self.store.as_boolean(&a)),
            OperatorCode::BitNot => match self.store.as_number(&a) {
                Ok(n) => Value::Number(!(n as i64) as f64),
                Err(fault) => {
                    self.raise_fault(fault);
                    Value::Empty
                }
            },
            OperatorCode::Negate => match self.store.as_number(&a) {
                Ok(n) => Value::Number(-n),
                Err(fault) => {
                    self.raise_fault(fault);
                    Value::Empty
                }
            },
            OperatorCode::Count => self.op_count(a),
            _ => {
                self.raise_fault(RuntimeFault::type_error(format!(
                    "operator '{}' is not unary",
                    code.symbol()
                )));
                Value::Empty
            }
        }
    }

    /// A String left operand concatenates with the rendered right operand.
    /// Everything else coerces numerically.
    fn op_add(&mut self, a: Value, b: Value) -> Value {
        if let Value::String(_) = a {
            let mut text = self
                .store
                .string_content(&a)
                .unwrap_or_default()
                .to_string();
            text.push_str(&self.store.as_display_string(&b));
            return self.store.intern(&text);
        }
        self.numeric_binary(a, b, |x, y| x + y)
    }

    fn numeric_binary(&mut self, a: Value, b: Value, f: impl Fn(f64, f64) -> f64) -> Value {
        let x = match self.store.as_number(&a) {
            Ok(n) => n,
            Err(fault) => {
                self.raise_fault(fault);
                return Value::Empty;
            }
        };
        let y = match self.store.as_number(&b) {
            Ok(n) => n,
            Err(fault) => {
                self.raise_fault(fault);
                return Value::Empty;
            }
        };
        Value::Number(f(x, y))
    }

    /// Orderings are defined between two Numbers and between two Strings
    /// (code point order). Any other pairing is a type fault. Comparisons
    /// against NaN are false.
    fn op_compare(&mut self, code: OperatorCode, a: Value, b: Value) -> Value {
        let ordering = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
            (Value::String(_), Value::String(_)) => {
                let x = self.store.string_content(&a).unwrap_or_default();
                let y = self.store.string_content(&b).unwrap_or_default();
                Some(x.cmp(y))
            }
            _ => {
                self.raise_fault(RuntimeFault::type_error(format!(
                    "cannot order {} against {}",
                    a.tag_name(),
                    b.tag_name()
                )));
                return Value::Empty;
            }
        };
        let holds = match ordering {
            Some(ordering) => compare_matches(code, ordering),
            None => false,
        };
        Value::Boolean(holds)
    }

    fn op_count(&mut self, a: Value) -> Value {
        match a {
            Value::String(_) => {
                let count = self
                    .store
                    .string_content(&a)
                    .map(|s| s.chars().count())
                    .unwrap_or(0);
                Value::Number(count as f64)
            }
            Value::Object(_) => {
                if let Some(handler) = self.store.attribute(&a, "#") {
                    self.protect(a);
                    let result = self.call_with_values(handler, &[], Value::Empty);
                    self.unprotect(1);
                    return result;
                }
                match self.store.object_dense_len(&a) {
                    Ok(len) => Value::Number(len as f64),
                    Err(fault) => {
                        self.raise_fault(fault);
                        Value::Empty
                    }
                }
            }
            other => {
                self.raise_fault(RuntimeFault::type_error(format!(
                    "operator '#' is not defined for {}",
                    other.tag_name()
                )));
                Value::Empty
            }
        }
    }

    // --- Member access ---

    /// Read `object[key]`. An `accessor` attribute intercepts every read
    /// and is called with the key bound to `key`; otherwise the object's
    /// own tables answer. Dot access requires a String key.
    pub(crate) fn member_load(&mut self, object: Value, key: Value, bracket: bool) -> Value {
        if !bracket && !matches!(key, Value::String(_)) {
            self.raise_fault(RuntimeFault::InvalidKey("dot access requires a String key"));
            return Value::Empty;
        }
        if !object.is_object() {
            self.raise_fault(RuntimeFault::type_error(format!(
                "cannot read a member of {}",
                object.tag_name()
            )));
            return Value::Empty;
        }
        if let Some(accessor) = self.store.attribute(&object, "accessor") {
            let key_name = self.store.intern("key");
            self.protect(object);
            let result = self.call_with_values(accessor, &[(key_name, key)], Value::Empty);
            self.unprotect(1);
            return result;
        }
        match self.store.object_get(&object, &key) {
            Ok(value) => value,
            Err(fault) => {
                self.raise_fault(fault);
                Value::Empty
            }
        }
    }

    /// Write `object[key] = value`, applying a compound operator against
    /// the current member first when one is attached. An `assigner`
    /// attribute intercepts the final write.
    pub(crate) fn member_assign(
        &mut self,
        object: Value,
        key: Value,
        value: Value,
        op: AssignOp,
        bracket: bool,
    ) {
        if !bracket && !matches!(key, Value::String(_)) {
            self.raise_fault(RuntimeFault::InvalidKey("dot access requires a String key"));
            return;
        }
        if !object.is_object() {
            self.raise_fault(RuntimeFault::type_error(format!(
                "cannot assign a member of {}",
                object.tag_name()
            )));
            return;
        }
        // A compound read or an attribute hook can run script between the
        // pops and the final write; no frame holds the triple until then.
        self.protect(object);
        self.protect(key);
        self.protect(value);
        self.member_assign_inner(object, key, value, op, bracket);
        self.unprotect(3);
    }

    fn member_assign_inner(
        &mut self,
        object: Value,
        key: Value,
        value: Value,
        op: AssignOp,
        bracket: bool,
    ) {
        let final_value = match op.operator() {
            None => value,
            Some(binary) => {
                let current = self.member_load(object, key, bracket);
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
        if let Some(assigner) = self.store.attribute(&object, "assigner") {
            let key_name = self.store.intern("key");
            let value_name = self.store.intern("value");
            self.call_with_values(
                assigner,
                &[(key_name, key), (value_name, final_value)],
                Value::Empty,
            );
            return;
        }
        if let Err(fault) = self.store.object_set(&object, &key, final_value) {
            self.raise_fault(fault);
        }
    }
}

fn compare_matches(code: OperatorCode, ordering: Ordering) -> bool {
    match code {
        OperatorCode::Less => ordering == Ordering::Less,
        OperatorCode::LessEq => ordering != Ordering::Greater,
        OperatorCode::Greater => ordering == Ordering::Greater,
        OperatorCode::GreaterEq => ordering != Ordering::Less,
        _ => false,
    }
}
