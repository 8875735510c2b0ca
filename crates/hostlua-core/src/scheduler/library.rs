//! The script-facing `task` library

use super::Domain;
use crate::context::{Context, FunctionContext};
use crate::error::VmResult;
use crate::function::Function;
use crate::table::Table;
use crate::value::{Kind, OwnedValue, Value};
use crate::vm::Outcome;

type Entry = fn(&FunctionContext) -> VmResult<Outcome>;

const FUNCTIONS: &[(&str, Entry)] = &[
    ("spawn", spawn),
    ("defer", defer),
    ("delay", delay),
    ("wait", wait),
    ("cancel", cancel),
    ("synchronize", synchronize),
    ("desynchronize", desynchronize),
    ("terminate", terminate),
];

/// Register the read-only `task` global
pub(crate) fn install(ctx: &Context) -> VmResult<()> {
    let mut task = Table::new();
    for &(name, entry) in FUNCTIONS {
        task.set(Value::from(name), Value::from(Function::new(name, entry)))?;
    }
    task.freeze();
    ctx.set_global("task", &Value::from(task))
}

/// Trailing arguments from position `from`, owned
fn rest(ctx: &FunctionContext, from: usize) -> Vec<OwnedValue> {
    ctx.arguments(from).iter().map(Value::clone_owned).collect()
}

/// Domain for a new coroutine: the caller's; existing threads keep their own
fn domain_for(ctx: &FunctionContext, target: &Value<'_>) -> Option<Domain> {
    if target.is_kind(Kind::Thread) {
        None
    } else {
        Some(ctx.current_thread().domain())
    }
}

fn spawn(ctx: &FunctionContext) -> VmResult<Outcome> {
    ctx.expect_argn_min(1)?;
    let target = ctx.argument(1);
    let thread = ctx
        .scheduler()
        .spawn(&target, rest(ctx, 2), domain_for(ctx, &target))?;
    ctx.return_values([Value::from(thread)])
}

fn defer(ctx: &FunctionContext) -> VmResult<Outcome> {
    ctx.expect_argn_min(1)?;
    let target = ctx.argument(1);
    let thread = ctx
        .scheduler()
        .defer(&target, rest(ctx, 2), domain_for(ctx, &target))?;
    ctx.return_values([Value::from(thread)])
}

fn delay(ctx: &FunctionContext) -> VmResult<Outcome> {
    ctx.expect_argn_min(2)?;
    let duration = ctx.expect(1, Kind::Number)?.as_number().unwrap_or(0.0);
    let target = ctx.argument(2);
    let thread = ctx
        .scheduler()
        .delay(duration, &target, rest(ctx, 3), domain_for(ctx, &target))?;
    ctx.return_values([Value::from(thread)])
}

/// `task.wait([duration])`; the thread is resumed with the elapsed time
fn wait(ctx: &FunctionContext) -> VmResult<Outcome> {
    ctx.expect_argn_range(0, 1)?;
    let duration = if ctx.argument(1).is_nil() {
        None
    } else {
        ctx.expect(1, Kind::Number)?.as_number()
    };
    ctx.scheduler()
        .wait_with(&ctx.current_thread(), duration, true)?;
    Ok(Outcome::Yield(0))
}

fn cancel(ctx: &FunctionContext) -> VmResult<Outcome> {
    ctx.expect_argn(1)?;
    let target = ctx.expect(1, Kind::Thread)?;
    if let Some(thread) = target.as_thread() {
        ctx.scheduler().cancel(&thread)?;
    }
    ctx.return_values([])
}

fn switch_to(ctx: &FunctionContext, domain: Domain) -> VmResult<Outcome> {
    ctx.expect_argn(0)?;
    let current = ctx.current_thread();
    if current.domain() == domain {
        return ctx.return_values([]);
    }
    ctx.scheduler().switch_domain(&current, domain)?;
    Ok(Outcome::Yield(0))
}

fn synchronize(ctx: &FunctionContext) -> VmResult<Outcome> {
    switch_to(ctx, Domain::Synchronized)
}

fn desynchronize(ctx: &FunctionContext) -> VmResult<Outcome> {
    switch_to(ctx, Domain::Desynchronized)
}

fn terminate(ctx: &FunctionContext) -> VmResult<Outcome> {
    ctx.terminate()
}

#[cfg(test)]
mod tests {
    use crate::context::Context;
    use crate::options::VmOptions;
    use crate::value::{Kind, Value};
    use crate::vm::VmState;

    #[test]
    fn test_task_library_is_readonly() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let ctx = Context::main(&state);
        let task = ctx.get_global("task").unwrap();
        assert!(task.is_kind(Kind::Table));
        for name in ["spawn", "defer", "delay", "wait", "cancel", "terminate"] {
            let f = task.index(&ctx, &Value::from(name)).unwrap();
            assert!(f.is_kind(Kind::Function), "task.{} missing", name);
        }
        assert!(task
            .set_index(&ctx, &Value::from("spawn"), &Value::Nil)
            .is_err());
    }

    #[test]
    fn test_task_wait_from_main_thread_raises() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let ctx = Context::main(&state);
        let task = ctx.get_global("task").unwrap();
        let wait = task.index(&ctx, &Value::from("wait")).unwrap();
        let err = ctx.call(&wait, []).unwrap_err();
        assert_eq!(err.to_string(), "the main thread cannot be scheduled");
    }
}
