//! VM-dispatching operators
//!
//! Each operator marshals its operands into the context's state, runs the matching helper of
//! the runtime chunk with full metamethod and capability dispatch, and hands back an owned
//! result.

use super::{text_of, HeapPayload, OwnedValue, Value};
use crate::context::Context;
use crate::error::{Unwind, VmResult};
use crate::text::Text;
use crate::vm::RawValue;

/// Arithmetic operators with metamethod and capability dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    pub const ALL: [ArithOp; 8] = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Div,
        ArithOp::IDiv,
        ArithOp::Mod,
        ArithOp::Pow,
        ArithOp::Unm,
    ];

    /// Metamethod name
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::IDiv => "__idiv",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::Unm => "__unm",
        }
    }

    /// Short name used in error messages
    pub fn label(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::IDiv => "idiv",
            ArithOp::Mod => "mod",
            ArithOp::Pow => "pow",
            ArithOp::Unm => "unm",
        }
    }
}

/// Run operator helper `name` on `operands`, returning its first result
fn apply(ctx: &Context, name: &str, operands: &[&Value<'_>]) -> VmResult<RawValue> {
    let state = ctx.state();
    let op = state.runtime().op(name).map_err(Unwind::from_lua)?;
    let args = operands
        .iter()
        .map(|operand| operand.to_raw(state))
        .collect::<VmResult<Vec<_>>>()?;
    let results = ctx.call_raw(RawValue::Function(op), args)?;
    Ok(results.into_iter().next().unwrap_or(RawValue::Nil))
}

fn apply_bool(ctx: &Context, name: &str, operands: &[&Value<'_>]) -> VmResult<bool> {
    Ok(matches!(apply(ctx, name, operands)?, RawValue::Boolean(true)))
}

impl Value<'_> {
    /// `op` applied to `self` and `other`; `other` is ignored by [`ArithOp::Unm`]
    pub fn arith(&self, ctx: &Context, op: ArithOp, other: &Value<'_>) -> VmResult<OwnedValue> {
        let result = match op {
            ArithOp::Unm => apply(ctx, op.label(), &[self])?,
            _ => apply(ctx, op.label(), &[self, other])?,
        };
        Value::from_raw(result, ctx.state())
    }

    pub fn add(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Add, other)
    }

    pub fn sub(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Sub, other)
    }

    pub fn mul(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Mul, other)
    }

    /// Float division
    pub fn div(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Div, other)
    }

    /// Floor division
    pub fn idiv(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::IDiv, other)
    }

    /// Floored modulo
    pub fn modulo(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Mod, other)
    }

    pub fn pow(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Pow, other)
    }

    pub fn neg(&self, ctx: &Context) -> VmResult<OwnedValue> {
        self.arith(ctx, ArithOp::Unm, &Value::Nil)
    }

    pub fn concat(&self, ctx: &Context, other: &Value<'_>) -> VmResult<OwnedValue> {
        Value::from_raw(apply(ctx, "concat", &[self, other])?, ctx.state())
    }

    /// `#value` with `__len` and the length capability
    pub fn len(&self, ctx: &Context) -> VmResult<OwnedValue> {
        if let Some(table) = self.native_table_len() {
            return Ok(Value::Integer(table));
        }
        Value::from_raw(apply(ctx, "len", &[self])?, ctx.state())
    }

    /// `==` with `__eq`
    pub fn equals(&self, ctx: &Context, other: &Value<'_>) -> VmResult<bool> {
        if self == other {
            return Ok(true);
        }
        apply_bool(ctx, "eq", &[self, other])
    }

    /// `<` with `__lt`
    pub fn less_than(&self, ctx: &Context, other: &Value<'_>) -> VmResult<bool> {
        apply_bool(ctx, "lt", &[self, other])
    }

    /// `<=` with `__le`
    pub fn less_equal(&self, ctx: &Context, other: &Value<'_>) -> VmResult<bool> {
        apply_bool(ctx, "le", &[self, other])
    }

    /// `value[key]`; native tables are read in place
    pub fn index(&self, ctx: &Context, key: &Value<'_>) -> VmResult<OwnedValue> {
        if let Some(value) = self.native_get(key) {
            return Ok(value);
        }
        Value::from_raw(apply(ctx, "index", &[self, key])?, ctx.state())
    }

    /// `value[key] = new`; native tables are written in place
    pub fn set_index(&self, ctx: &Context, key: &Value<'_>, new: &Value<'_>) -> VmResult<()> {
        if let Some(done) = self.native_set(key, new) {
            return done;
        }
        apply(ctx, "newindex", &[self, key, new]).map(drop)
    }

    /// `rawget`; no metamethods
    pub fn rawget(&self, ctx: &Context, key: &Value<'_>) -> VmResult<OwnedValue> {
        if let Some(value) = self.native_get(key) {
            return Ok(value);
        }
        Value::from_raw(apply(ctx, "rawget", &[self, key])?, ctx.state())
    }

    /// `rawset`; no metamethods
    pub fn rawset(&self, ctx: &Context, key: &Value<'_>, new: &Value<'_>) -> VmResult<()> {
        if let Some(done) = self.native_set(key, new) {
            return done;
        }
        apply(ctx, "rawset", &[self, key, new]).map(drop)
    }

    /// `rawlen`: border of a table, byte length of text or a buffer
    pub fn rawlen(&self, ctx: &Context) -> VmResult<i64> {
        if let Some(len) = self.native_table_len() {
            return Ok(len);
        }
        match apply(ctx, "rawlen", &[self])? {
            RawValue::Integer(n) => Ok(i64::from(n)),
            RawValue::Number(n) => Ok(n as i64),
            _ => Ok(0),
        }
    }

    /// `tostring` with `__tostring` and the stringify capability
    pub fn tostring(&self, ctx: &Context) -> VmResult<Text> {
        match apply(ctx, "tostring", &[self])? {
            RawValue::String(s) => Ok(text_of(&s)),
            other => Err(Unwind::runtime(format!(
                "'tostring' returned a {} value",
                other.type_name()
            ))),
        }
    }

    /// Call this value with `args`, returning the first result
    pub fn call<'a>(
        &self,
        ctx: &Context,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<OwnedValue> {
        ctx.call(self, args)
    }

    fn native_table_len(&self) -> Option<i64> {
        match &*self.as_heap()?.read() {
            HeapPayload::Table(table) => Some(table.array_len()),
            _ => None,
        }
    }

    /// Read of a native table that has not been handed to a state
    fn native_get(&self, key: &Value<'_>) -> Option<OwnedValue> {
        match &*self.as_heap()?.read() {
            HeapPayload::Table(table) => Some(table.get(key)),
            _ => None,
        }
    }

    fn native_set(&self, key: &Value<'_>, new: &Value<'_>) -> Option<VmResult<()>> {
        match &mut *self.as_heap()?.write() {
            HeapPayload::Table(table) => Some(
                table
                    .set(key.clone_owned(), new.clone_owned())
                    .map_err(Unwind::from),
            ),
            _ => None,
        }
    }
}
