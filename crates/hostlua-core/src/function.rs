//! Native function descriptors
//!
//! A [`Function`] is either native code that has not been placed in any state yet, or a handle
//! to a function object living in a VM state. Native descriptors are materialised as VM
//! functions each time they are pushed; every materialisation gets its own upvalue storage.

use crate::context::{FunctionContext, Upvalues};
use crate::error::{Unwind, VmResult};
use crate::value::OwnedValue;
use crate::vm::{Outcome, RawValue, RegistryRef, Tag, VmState};
use mlua::{Lua, MultiValue};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Native code callable from scripts
pub type HostFn = dyn Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync;

#[derive(Clone)]
pub enum Function {
    /// Native code with its upvalues
    Native(NativeFunction),
    /// A function object pinned in a VM state
    Vm(RegistryRef),
}

#[derive(Clone)]
pub struct NativeFunction {
    name: Arc<str>,
    entry: Arc<HostFn>,
    continuation: Option<Arc<HostFn>>,
    upvalues: Vec<OwnedValue>,
}

impl NativeFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upvalues(&self) -> &[OwnedValue] {
        &self.upvalues
    }

    pub fn has_continuation(&self) -> bool {
        self.continuation.is_some()
    }

    /// Same code with different upvalues
    pub fn with_upvalues(&self, upvalues: Vec<OwnedValue>) -> NativeFunction {
        NativeFunction {
            upvalues,
            ..self.clone()
        }
    }
}

fn tagged(tag: Tag, values: Vec<RawValue>) -> MultiValue {
    MultiValue::from_vec(std::iter::once(tag.raw()).chain(values).collect())
}

/// Answer for a native entry that unwound
fn unwound(state: &VmState, err: Unwind) -> mlua::Result<MultiValue> {
    match err {
        Unwind::Error(err) => match err.into_value().to_raw(state) {
            Ok(value) => Ok(tagged(Tag::Raise, vec![value])),
            Err(inner) => unwound(state, inner),
        },
        Unwind::Terminate => Ok(tagged(Tag::Terminate, Vec::new())),
        Unwind::OutOfMemory => Err(mlua::Error::MemoryError(String::from("not enough memory"))),
    }
}

/// Run `entry` for one call from the VM
///
/// The runtime chunk passes the running coroutine first (`nil` on the main thread). The
/// arguments become a fresh frame on that thread's shadow stack, left again on every path.
fn dispatch(
    lua: &Lua,
    entry: &HostFn,
    upvalues: &Upvalues,
    args: MultiValue,
) -> mlua::Result<MultiValue> {
    let state = VmState::from_lua(lua).ok_or_else(|| mlua::Error::runtime("VM state has been closed"))?;
    let mut args = args.into_vec().into_iter();
    let thread = state.running_thread(args.next().unwrap_or(RawValue::Nil));
    let args: Vec<RawValue> = args.collect();
    let argc = args.len();
    let base = match thread.enter_frame(args) {
        Ok(base) => base,
        Err(err) => return unwound(&state, err),
    };

    let outcome = {
        let ctx = FunctionContext::enter(&thread, &state, argc, Arc::clone(upvalues));
        entry(&ctx)
    };
    match outcome {
        Ok(Outcome::Return(n)) => Ok(tagged(Tag::Return, thread.leave_frame(base, n))),
        Ok(Outcome::Yield(n)) => Ok(tagged(Tag::Yield, thread.leave_frame(base, n))),
        Err(err) => {
            thread.leave_frame(base, 0);
            unwound(&state, err)
        }
    }
}

fn entry_point(lua: &Lua, entry: Arc<HostFn>, upvalues: Upvalues) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, args: MultiValue| dispatch(lua, &*entry, &upvalues, args))
}

impl Function {
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
    {
        Function::Native(NativeFunction {
            name: Arc::from(name),
            entry: Arc::new(f),
            continuation: None,
            upvalues: Vec::new(),
        })
    }

    /// Run `k` instead of returning the resume arguments when the function is resumed after
    /// yielding
    pub fn with_continuation<F>(self, k: F) -> Self
    where
        F: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
    {
        match self {
            Function::Native(native) => Function::Native(NativeFunction {
                continuation: Some(Arc::new(k)),
                ..native
            }),
            vm => vm,
        }
    }

    pub fn with_upvalues(self, upvalues: Vec<OwnedValue>) -> Self {
        match self {
            Function::Native(native) => Function::Native(NativeFunction { upvalues, ..native }),
            vm => vm,
        }
    }

    pub(crate) fn from_vm(handle: RegistryRef) -> Self {
        Function::Vm(handle)
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Function::Native(_))
    }

    /// Debug name
    pub fn name(&self) -> String {
        match self {
            Function::Native(native) => native.name.to_string(),
            Function::Vm(handle) => match handle.get() {
                RawValue::Function(function) => {
                    function.info().name.unwrap_or_else(|| String::from("?"))
                }
                _ => String::from("?"),
            },
        }
    }

    /// VM function for this descriptor inside `state`
    pub(crate) fn to_function(&self, state: &VmState) -> VmResult<mlua::Function> {
        match self {
            Function::Native(native) => {
                let upvalues = native
                    .upvalues
                    .iter()
                    .map(|upvalue| upvalue.to_raw(state))
                    .collect::<VmResult<Vec<_>>>()?;
                let upvalues: Upvalues = Arc::new(Mutex::new(upvalues));
                let lua = state.lua();
                let entry = entry_point(lua, Arc::clone(&native.entry), Arc::clone(&upvalues))
                    .map_err(Unwind::from_lua)?;
                let k = native
                    .continuation
                    .as_ref()
                    .map(|k| entry_point(lua, Arc::clone(k), Arc::clone(&upvalues)))
                    .transpose()
                    .map_err(Unwind::from_lua)?;
                state.runtime().bind(entry, k).map_err(Unwind::from_lua)
            }
            Function::Vm(handle) => {
                if !handle.belongs_to(state) {
                    return Err(Unwind::runtime(
                        "attempt to call a function that belongs to another VM state",
                    ));
                }
                match handle.get() {
                    RawValue::Function(function) => Ok(function),
                    other => Err(Unwind::runtime(format!(
                        "attempt to call a {} value",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    /// VM value for this descriptor inside `state`
    pub(crate) fn materialize(&self, state: &VmState) -> VmResult<RawValue> {
        self.to_function(state).map(RawValue::Function)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Native(native) => f
                .debug_struct("Function")
                .field("name", &native.name)
                .field("upvalues", &native.upvalues.len())
                .field("continuation", &native.continuation.is_some())
                .finish(),
            Function::Vm(handle) => f.debug_tuple("Function").field(&handle.id()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::options::VmOptions;
    use crate::value::Value;

    fn state() -> VmState {
        VmState::new(VmOptions::default()).unwrap()
    }

    #[test]
    fn test_materialize_carries_upvalues() {
        let state = state();
        let function = Function::new("adder", |ctx| {
            let base = ctx.upvalue(1)?.as_integer().unwrap_or(0);
            let n = ctx.argument(1).as_integer().unwrap_or(0);
            ctx.return_values([Value::from(base + n)])
        })
        .with_upvalues(vec![Value::from(40)]);
        let adder = function.to_function(&state).unwrap();
        assert_eq!(adder.call::<i64>(2).unwrap(), 42);
    }

    #[test]
    fn test_continuation_only_on_native() {
        let function = Function::new("f", |ctx| ctx.return_values([]))
            .with_continuation(|ctx| ctx.return_values([]));
        match &function {
            Function::Native(native) => assert!(native.has_continuation()),
            Function::Vm(_) => panic!("expected a native descriptor"),
        }
    }

    #[test]
    fn test_frames_are_left_on_error() {
        let state = state();
        let ctx = Context::main(&state);
        let failing = ctx
            .create_function("failing", |ctx| {
                ctx.push(1)?;
                Err(ctx.error(&Value::from("bad")))
            })
            .unwrap();
        let before = state.main_thread().abs_top();
        assert!(ctx.pcall(&failing, [Value::from(1), Value::from(2)]).unwrap().is_err());
        assert_eq!(state.main_thread().abs_top(), before);
        assert_eq!(state.main_thread().frame_depth(), 0);
    }

    #[test]
    fn test_yield_resumes_into_continuation() {
        let state = state();
        let ctx = Context::main(&state);
        let step = ctx
            .create_function_k(
                "step",
                |ctx| ctx.yield_values([Value::from("paused")]),
                |ctx| {
                    let resumed = ctx.argument(1).as_integer().unwrap_or(0);
                    ctx.return_values([Value::from(resumed * 2)])
                },
            )
            .unwrap();
        ctx.set_global("step", &step).unwrap();
        let body = ctx.load("return step() + 1", "body").unwrap();
        let thread = Value::from(crate::scheduler::ScriptThread::attach(
            state.new_thread_with(&body).unwrap(),
        ));
        assert_eq!(ctx.resume(&thread, []).unwrap(), Value::from("paused"));
        assert_eq!(ctx.resume(&thread, [Value::from(20)]).unwrap(), Value::from(41));
    }
}
