//! Context of a running native function

use super::Context;
use crate::error::VmResult;
use crate::opaque::OpaqueKind;
use crate::value::{Kind, OwnedValue, StackSlot, Value};
use crate::vm::{Outcome, RawValue, VmState, VmThread};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

/// Upvalue storage shared by every call of one materialised native function
pub(crate) type Upvalues = Arc<Mutex<Vec<RawValue>>>;

/// Context bound at the top of a native function
///
/// The arguments occupy frame positions `1..=argument_count()`. Results are left on the stack,
/// so dropping this context never truncates.
pub struct FunctionContext {
    ctx: Context,
    argc: usize,
    upvalues: Upvalues,
}

impl FunctionContext {
    pub(crate) fn enter(
        thread: &VmThread,
        state: &VmState,
        argc: usize,
        upvalues: Upvalues,
    ) -> FunctionContext {
        FunctionContext {
            ctx: Context {
                base: thread.abs_top(),
                thread: thread.clone(),
                state: state.clone(),
                restore: false,
            },
            argc,
            upvalues,
        }
    }

    pub fn argument_count(&self) -> usize {
        self.argc
    }

    /// Argument `n` (1-based); missing arguments read as `Nil`
    pub fn argument(&self, n: usize) -> Value<'_> {
        if n == 0 || n > self.argc {
            return Value::Nil;
        }
        let pos = self.ctx.thread.frame_base() + n - 1;
        Value::StackSlot(StackSlot::new(&self.ctx.thread, pos))
    }

    /// Arguments from position `from` onwards
    pub fn arguments(&self, from: usize) -> Vec<Value<'_>> {
        (from.max(1)..=self.argc).map(|n| self.argument(n)).collect()
    }

    /// Argument `n`, which must be of `kind`
    pub fn expect(&self, n: usize, kind: Kind) -> VmResult<Value<'_>> {
        let value = self.argument(n);
        let actual = value.kind();
        if actual.satisfies(kind) {
            Ok(value)
        } else {
            Err(self.type_error(n, kind.name(), actual.name()))
        }
    }

    /// Argument `n`, which must be an opaque object of `kind`
    pub fn expect_opaque(&self, n: usize, kind: OpaqueKind) -> VmResult<Value<'_>> {
        let value = self.argument(n);
        match value.opaque_kind() {
            Some(actual) if actual == kind => Ok(value),
            Some(actual) => Err(self.type_error(n, kind.name(), actual.name())),
            None => Err(self.type_error(n, kind.name(), value.kind().name())),
        }
    }

    fn type_error(&self, n: usize, expected: &str, actual: &str) -> crate::error::Unwind {
        self.errorf(
            "expected argument #%d to be of type %s, got %s",
            [Value::from(n as i64), Value::from(expected), Value::from(actual)],
        )
    }

    pub fn expect_argn(&self, n: usize) -> VmResult<()> {
        if self.argc == n {
            Ok(())
        } else {
            Err(self.errorf(
                "expected %d arguments, got %d",
                [Value::from(n as i64), Value::from(self.argc as i64)],
            ))
        }
    }

    pub fn expect_argn_range(&self, min: usize, max: usize) -> VmResult<()> {
        if (min..=max).contains(&self.argc) {
            Ok(())
        } else {
            Err(self.errorf(
                "expected between %d and %d arguments, got %d",
                [
                    Value::from(min as i64),
                    Value::from(max as i64),
                    Value::from(self.argc as i64),
                ],
            ))
        }
    }

    pub fn expect_argn_min(&self, min: usize) -> VmResult<()> {
        if self.argc >= min {
            Ok(())
        } else {
            Err(self.errorf(
                "expected a minimum of %d arguments, got %d",
                [Value::from(min as i64), Value::from(self.argc as i64)],
            ))
        }
    }

    /// Upvalue `n` (1-based) of the running function
    pub fn upvalue(&self, n: usize) -> VmResult<OwnedValue> {
        let raw = n
            .checked_sub(1)
            .and_then(|i| self.upvalues.lock().get(i).cloned())
            .unwrap_or(RawValue::Nil);
        Value::from_raw(raw, &self.ctx.state)
    }

    /// Replace upvalue `n`; returns `false` when the function has no such upvalue
    pub fn set_upvalue(&self, n: usize, value: &Value<'_>) -> VmResult<bool> {
        let raw = value.to_raw(&self.ctx.state)?;
        let mut upvalues = self.upvalues.lock();
        match n.checked_sub(1).and_then(|i| upvalues.get_mut(i)) {
            Some(slot) => {
                *slot = raw;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Push `values` and return them to the caller
    pub fn return_values<'a>(
        &self,
        values: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Outcome> {
        let n = self.ctx.push_all(values)?;
        Ok(Outcome::Return(n))
    }
}

impl Deref for FunctionContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::options::VmOptions;
    use crate::value::{Kind, Value};
    use crate::vm::VmState;

    #[test]
    fn test_arity_messages() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let ctx = Context::main(&state);
        let checked = ctx
            .create_function("checked", |ctx| {
                ctx.expect_argn_range(1, 2)?;
                ctx.expect(1, Kind::Number)?;
                ctx.return_values([])
            })
            .unwrap();

        let err = ctx.call(&checked, []).unwrap_err();
        assert_eq!(err.to_string(), "expected between 1 and 2 arguments, got 0");

        let err = ctx.call(&checked, [Value::from("x")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected argument #1 to be of type number, got string"
        );

        assert!(ctx.call(&checked, [Value::from(1.5)]).is_ok());
    }

    #[test]
    fn test_arity_errors_are_raised_values() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let ctx = Context::main(&state);
        let exact = ctx
            .create_function("exact", |ctx| {
                ctx.expect_argn(2)?;
                ctx.return_values([])
            })
            .unwrap();
        ctx.set_global("exact", &exact).unwrap();
        let caught = ctx
            .exec("local ok, err = pcall(exact, 1) return err", "arity")
            .unwrap();
        assert_eq!(caught[0], Value::from("expected 2 arguments, got 1"));
    }

    #[test]
    fn test_upvalues_visible() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let ctx = Context::main(&state);
        let counter = ctx
            .create_closure(
                "counter",
                |ctx| {
                    let next = ctx.upvalue(1)?.as_integer().unwrap_or(0) + 1;
                    ctx.set_upvalue(1, &Value::from(next))?;
                    ctx.return_values([Value::from(next)])
                },
                vec![Value::from(0)],
            )
            .unwrap();
        assert_eq!(ctx.call(&counter, []).unwrap(), Value::from(1));
        assert_eq!(ctx.call(&counter, []).unwrap(), Value::from(2));
        assert_eq!(ctx.call(&counter, []).unwrap(), Value::from(3));
    }
}
