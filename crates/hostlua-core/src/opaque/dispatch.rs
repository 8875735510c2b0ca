//! VM-side entry points for operators on opaque userdata
//!
//! An opaque object reaches a state as one [`OpaqueCell`] userdata, reused for as long as the
//! state keeps it alive. The userdata metatable routes each operator to a native entry that
//! checks the object's capabilities before dispatching.

use super::{unsupported, Capabilities, Opaque, OpaqueObject};
use crate::context::FunctionContext;
use crate::error::{Unwind, VmResult};
use crate::function::Function;
use crate::rc::Shared;
use crate::text::Text;
use crate::value::{ArithOp, Value};
use crate::vm::{Outcome, RawValue, VmState};
use mlua::{LightUserData, UserData, UserDataFields};
use std::ffi::c_void;
use std::sync::Arc;

/// Userdata standing for an opaque object inside a state
pub struct OpaqueCell(Shared<OpaqueObject>);

impl OpaqueCell {
    pub(crate) fn object(&self) -> Shared<OpaqueObject> {
        self.0.clone()
    }
}

impl UserData for OpaqueCell {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        meta(fields, "__index", index);
        meta(fields, "__newindex", set_index);
        meta(fields, "__tostring", stringify);
        meta(fields, "__len", len);
        meta(fields, "__call", call);
        for op in ArithOp::ALL {
            meta(fields, op.event(), move |ctx| arith(ctx, op));
        }
    }
}

fn meta<M, F>(fields: &mut M, event: &'static str, entry: F)
where
    M: UserDataFields<OpaqueCell>,
    F: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
{
    fields.add_meta_field_with(event, move |lua| {
        let state = VmState::from_lua(lua)
            .ok_or_else(|| mlua::Error::runtime("VM state has been closed"))?;
        Function::new(event, entry)
            .to_function(&state)
            .map_err(|err| mlua::Error::runtime(err.to_string()))
    });
}

/// The userdata for `object` inside `state`
pub(crate) fn to_raw(object: &Shared<OpaqueObject>, state: &VmState) -> VmResult<RawValue> {
    let cache = state.runtime().cache();
    let key = LightUserData(object.addr() as *mut c_void);
    if let Ok(cached @ RawValue::UserData(_)) = cache.raw_get::<RawValue>(key) {
        return Ok(cached);
    }
    let userdata = state
        .lua()
        .create_userdata(OpaqueCell(object.clone()))
        .map_err(Unwind::from_lua)?;
    cache.raw_set(key, userdata.clone()).map_err(Unwind::from_lua)?;
    Ok(RawValue::UserData(userdata))
}

fn require(
    obj: &Shared<OpaqueObject>,
    capability: Capabilities,
    name: &str,
) -> VmResult<Arc<dyn Opaque>> {
    let object = obj.read().handle();
    if !object.capabilities().contains(capability) {
        return Err(unsupported(object.kind(), name));
    }
    Ok(object)
}

/// The object a metamethod was invoked on
fn receiver(ctx: &FunctionContext) -> VmResult<Shared<OpaqueObject>> {
    receiver_at(ctx, 1)
}

fn receiver_at(ctx: &FunctionContext, n: usize) -> VmResult<Shared<OpaqueObject>> {
    ctx.argument(n)
        .as_opaque()
        .ok_or_else(|| Unwind::runtime("expected an opaque object"))
}

fn index(ctx: &FunctionContext) -> VmResult<Outcome> {
    let object = require(&receiver(ctx)?, Capabilities::INDEX, "index")?;
    let result = object.index(ctx, &ctx.argument(2))?;
    ctx.return_values([result])
}

fn set_index(ctx: &FunctionContext) -> VmResult<Outcome> {
    let object = require(&receiver(ctx)?, Capabilities::SET_INDEX, "newindex")?;
    object.set_index(ctx, &ctx.argument(2), &ctx.argument(3))?;
    ctx.return_values([])
}

/// `tostring` of userdata; objects without the capability print their kind and address
fn stringify(ctx: &FunctionContext) -> VmResult<Outcome> {
    let obj = receiver(ctx)?;
    let object = obj.read().handle();
    let text = if object.capabilities().contains(Capabilities::STRINGIFY) {
        object.stringify(ctx)?
    } else {
        Text::from(format!("{}: 0x{:016x}", object.kind(), obj.addr()))
    };
    ctx.return_values([Value::Text(text)])
}

fn arith(ctx: &FunctionContext, op: ArithOp) -> VmResult<Outcome> {
    let (obj, other, reversed) = match ctx.argument(1).as_opaque() {
        Some(obj) => (obj, 2, false),
        None => (receiver_at(ctx, 2)?, 1, true),
    };
    let object = require(&obj, Capabilities::ARITH, op.label())?;
    let other = if op == ArithOp::Unm {
        Value::Nil
    } else {
        ctx.argument(other)
    };
    let result = object.arith(ctx, op, &other, reversed)?;
    ctx.return_values([result])
}

fn len(ctx: &FunctionContext) -> VmResult<Outcome> {
    let object = require(&receiver(ctx)?, Capabilities::LEN, "len")?;
    let result = object.len(ctx)?;
    ctx.return_values([result])
}

/// The object is passed on as argument 1
fn call(ctx: &FunctionContext) -> VmResult<Outcome> {
    let object = require(&receiver(ctx)?, Capabilities::CALL, "call")?;
    object.call(ctx)
}
