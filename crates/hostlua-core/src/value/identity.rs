//! Hashing and raw equality
//!
//! Values compare the way the VM compares them without metamethods: integral floats equal
//! the matching integer, text compares bytewise, heap objects compare by identity. Stack slots
//! and registry handles compare by the VM value they denote.

use super::{float_to_integer, text_of, Value};
use crate::opaque::OpaqueCell;
use crate::text::Text;
use crate::vm::RawValue;
use std::hash::{Hash, Hasher};

/// Equality key of a value
#[derive(Debug, Clone)]
pub(crate) enum Identity {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(Text),
    Light(usize),
    Object(usize),
}

impl Identity {
    fn number(n: f64) -> Identity {
        match float_to_integer(n) {
            Some(i) => Identity::Integer(i),
            None => Identity::Float(n),
        }
    }

    pub(crate) fn of_raw(raw: &RawValue) -> Identity {
        match raw {
            RawValue::Nil => Identity::Nil,
            RawValue::Boolean(b) => Identity::Boolean(*b),
            RawValue::Integer(i) => Identity::Integer(i64::from(*i)),
            RawValue::Number(n) => Identity::number(*n),
            RawValue::String(s) => Identity::Text(text_of(s)),
            RawValue::LightUserData(p) => Identity::Light(p.0 as usize),
            // Userdata standing for a native object is that object.
            RawValue::UserData(ud) => match ud.borrow::<OpaqueCell>() {
                Ok(cell) => Identity::Object(cell.object().addr()),
                Err(_) => Identity::Object(raw.to_pointer() as usize),
            },
            other => Identity::Object(other.to_pointer() as usize),
        }
    }

    pub(crate) fn of(value: &Value<'_>) -> Identity {
        match value {
            Value::Nil => Identity::Nil,
            Value::Boolean(b) => Identity::Boolean(*b),
            Value::Integer(i) => Identity::Integer(*i),
            Value::Number(n) => Identity::number(*n),
            Value::LightPointer(p) => Identity::Light(*p),
            Value::Text(t) => Identity::Text(t.clone()),
            Value::StackSlot(slot) => Identity::of_raw(&slot.get()),
            Value::Registry(handle) => Identity::of_raw(&handle.get()),
            Value::Heap(handle) => Identity::Object(handle.addr()),
            Value::Opaque(object) => Identity::Object(object.addr()),
        }
    }

    pub(crate) fn is_nil(&self) -> bool {
        matches!(self, Identity::Nil)
    }

    pub(crate) fn is_nan(&self) -> bool {
        matches!(self, Identity::Float(n) if n.is_nan())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Identity::Nil, Identity::Nil) => true,
            (Identity::Boolean(a), Identity::Boolean(b)) => a == b,
            (Identity::Integer(a), Identity::Integer(b)) => a == b,
            (Identity::Float(a), Identity::Float(b)) => a == b,
            (Identity::Text(a), Identity::Text(b)) => a == b,
            (Identity::Light(a), Identity::Light(b)) => a == b,
            (Identity::Object(a), Identity::Object(b)) => a == b,
            _ => false,
        }
    }
}

// NaN keys are rejected before insertion.
impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Identity::Nil => {}
            Identity::Boolean(b) => b.hash(state),
            Identity::Integer(i) => i.hash(state),
            Identity::Float(n) => n.to_bits().hash(state),
            Identity::Text(t) => t.hash(state),
            Identity::Light(p) | Identity::Object(p) => p.hash(state),
        }
    }
}

impl<'a, 'b> PartialEq<Value<'b>> for Value<'a> {
    fn eq(&self, other: &Value<'b>) -> bool {
        Identity::of(self) == Identity::of(other)
    }
}

impl Eq for Value<'_> {}

impl Hash for Value<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Identity::of(self).hash(state)
    }
}
