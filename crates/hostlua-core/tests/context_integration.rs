//! Integration tests for calling contexts: stack balance, protected calls, coroutines

use hostlua_core::{
    Buffer, Context, Kind, OwnedValue, ScriptThread, ThreadStatus, Unwind, Value, VmOptions, VmState,
};

fn state() -> VmState {
    VmState::new(VmOptions::default()).unwrap()
}

fn echo(ctx: &Context) -> OwnedValue {
    ctx.create_function("echo", |ctx| ctx.return_values(ctx.arguments(1)))
        .unwrap()
}

fn thrower(ctx: &Context) -> OwnedValue {
    ctx.create_function("thrower", |ctx| Err(ctx.errorf("failed: %s", [ctx.argument(1)])))
        .unwrap()
}

#[test]
fn test_every_call_variant_restores_stack() {
    let state = state();
    let ctx = Context::main(&state);
    let echo = echo(&ctx);
    let thrower = thrower(&ctx);
    let handler = ctx
        .create_function("handler", |ctx| ctx.return_values([ctx.argument(1)]))
        .unwrap();
    let top = ctx.top();
    let args = || [Value::from(1), Value::from("two"), Value::from(3.5)];

    ctx.call(&echo, args()).unwrap();
    assert_eq!(ctx.top(), top);
    ctx.call_n(2, &echo, args()).unwrap();
    assert_eq!(ctx.top(), top);
    assert_eq!(ctx.call_multi(&echo, args()).unwrap().len(), 3);
    assert_eq!(ctx.top(), top);
    ctx.pcall(&echo, args()).unwrap().unwrap();
    assert_eq!(ctx.top(), top);
    ctx.pcall_n(4, &thrower, args()).unwrap().unwrap_err();
    assert_eq!(ctx.top(), top);
    ctx.pcall_multi(&thrower, args()).unwrap().unwrap_err();
    assert_eq!(ctx.top(), top);
    ctx.xpcall(&thrower, &handler, args()).unwrap().unwrap_err();
    assert_eq!(ctx.top(), top);
    ctx.xpcall_n(1, &echo, &handler, args()).unwrap().unwrap();
    assert_eq!(ctx.top(), top);
    ctx.xpcall_multi(&thrower, &handler, args()).unwrap().unwrap_err();
    assert_eq!(ctx.top(), top);
    ctx.call(&thrower, args()).unwrap_err();
    assert_eq!(ctx.top(), top);
}

#[test]
fn test_call_multi_keeps_all_results_in_order() {
    let state = state();
    let ctx = Context::main(&state);
    let echo = echo(&ctx);
    let results = ctx
        .call_multi(&echo, [Value::from(1), Value::Nil, Value::from("x")])
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], Value::from(1));
    assert!(results[1].is_nil());
    assert_eq!(results[2], Value::from("x"));
}

#[test]
fn test_xpcall_routes_error_through_handler() {
    let state = state();
    let ctx = Context::main(&state);
    let thrower = thrower(&ctx);
    let handler = ctx
        .create_function("handler", |ctx| {
            let message = ctx.argument(1).as_string().unwrap_or_default();
            ctx.return_values([Value::from(format!("handled({})", message))])
        })
        .unwrap();

    let caught = ctx
        .xpcall(&thrower, &handler, [Value::from("disk")])
        .unwrap();
    assert_eq!(caught, Err(Value::from("handled(failed: disk)")));

    let plain = ctx.pcall(&thrower, [Value::from("disk")]).unwrap();
    assert_eq!(plain, Err(Value::from("failed: disk")));
}

#[test]
fn test_nested_protected_calls_catch_innermost() {
    let state = state();
    let ctx = Context::main(&state);
    let thrower = thrower(&ctx);
    ctx.set_global("thrower", &thrower).unwrap();
    let outer = ctx
        .create_function("outer", |ctx| {
            let thrower = ctx.get_global("thrower")?;
            let inner = ctx.pcall(&thrower, [Value::from("inner")])?;
            let message = inner.err().and_then(|v| v.as_string()).unwrap_or_default();
            ctx.return_values([Value::from(message)])
        })
        .unwrap();
    let result = ctx.pcall(&outer, []).unwrap();
    assert_eq!(result, Ok(Value::from("failed: inner")));
}

#[test]
fn test_out_of_memory_is_not_caught_by_pcall() {
    let state = VmState::new(VmOptions::with_memory_limit(4 * 1024 * 1024)).unwrap();
    let ctx = Context::main(&state);
    let hog = ctx
        .create_function("hog", |ctx| {
            ctx.return_values([Value::from(Buffer::zeroed(8 << 20))])
        })
        .unwrap();
    let top = ctx.top();
    let result = ctx.pcall(&hog, []);
    assert!(matches!(result, Err(Unwind::OutOfMemory)));
    assert_eq!(ctx.top(), top);
}

#[test]
fn test_coroutine_yield_and_resume_through_continuation() {
    let state = state();
    let ctx = Context::main(&state);
    let body = ctx
        .create_function_k(
            "generator",
            |ctx| {
                let first = ctx.argument(1).as_integer().unwrap_or(0);
                ctx.yield_values([Value::from(first * 10)])
            },
            |ctx| {
                // Resume arguments sit on top of the frame.
                let resumed = ctx
                    .argument(ctx.argument_count())
                    .as_integer()
                    .unwrap_or(0);
                ctx.return_values([Value::from(resumed + 1), Value::from("done")])
            },
        )
        .unwrap();
    let co = Value::from(ScriptThread::attach(
        state.new_thread_with(&body).unwrap(),
    ));
    let yielded = ctx.resume(&co, [Value::from(4)]).unwrap();
    assert_eq!(yielded, Value::from(40));
    assert_eq!(co.as_thread().unwrap().status(), ThreadStatus::Suspended);

    let finished = ctx.resume_multi(&co, [Value::from(7)]).unwrap();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[0], Value::from(8));
    assert_eq!(finished[1], Value::from("done"));
    assert_eq!(co.as_thread().unwrap().status(), ThreadStatus::Completed);

    let err = ctx.resume(&co, []).unwrap_err();
    assert_eq!(err.to_string(), "cannot resume dead coroutine");
}

#[test]
fn test_yield_inside_nested_call_is_rejected() {
    let state = state();
    let ctx = Context::main(&state);
    let yielder = ctx
        .create_function("yielder", |ctx| ctx.yield_values([]))
        .unwrap();
    ctx.set_global("yielder", &yielder).unwrap();
    let body = ctx
        .create_function("body", |ctx| {
            let yielder = ctx.get_global("yielder")?;
            ctx.call(&yielder, [])?;
            ctx.return_values([])
        })
        .unwrap();
    let co = Value::from(ScriptThread::attach(
        state.new_thread_with(&body).unwrap(),
    ));
    let err = ctx.resume(&co, []).unwrap_err();
    assert!(err.to_string().contains("attempt to yield"));
    assert_eq!(co.as_thread().unwrap().status(), ThreadStatus::Errored);
}

#[test]
fn test_terminate_ends_coroutine_without_error() {
    let state = state();
    let ctx = Context::main(&state);
    let body = ctx
        .create_function("quitter", |ctx| ctx.terminate())
        .unwrap();
    let co = Value::from(ScriptThread::attach(
        state.new_thread_with(&body).unwrap(),
    ));
    let results = ctx.resume_multi(&co, []).unwrap();
    assert!(results.is_empty());
    assert_eq!(co.as_thread().unwrap().status(), ThreadStatus::Cancelled);
}

#[test]
fn test_argument_type_errors_use_uniform_message() {
    let state = state();
    let ctx = Context::main(&state);
    let typed = ctx
        .create_function("typed", |ctx| {
            ctx.expect(2, Kind::Text)?;
            ctx.return_values([])
        })
        .unwrap();
    let caught = ctx
        .pcall(&typed, [Value::from(1), Value::from(true)])
        .unwrap();
    assert_eq!(
        caught,
        Err(Value::from("expected argument #2 to be of type string, got boolean"))
    );
}

#[test]
fn test_scripts_call_native_functions() {
    let state = state();
    let ctx = Context::main(&state);
    let echo = echo(&ctx);
    ctx.set_global("echo", &echo).unwrap();
    let results = ctx
        .exec("local a, b = echo(1, 'two') return b, a", "caller")
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], Value::from("two"));
    assert_eq!(results[1], Value::from(1));
}

#[test]
fn test_script_pcall_catches_native_errors() {
    let state = state();
    let ctx = Context::main(&state);
    let thrower = thrower(&ctx);
    ctx.set_global("thrower", &thrower).unwrap();
    let message = ctx
        .exec("local ok, err = pcall(thrower, 'x') return err", "catcher")
        .unwrap();
    assert_eq!(message[0], Value::from("failed: x"));
}

#[test]
fn test_script_coroutines_drive_native_yields() {
    let state = state();
    let ctx = Context::main(&state);
    let pause = ctx
        .create_function("pause", |ctx| ctx.yield_values(ctx.arguments(1)))
        .unwrap();
    ctx.set_global("pause", &pause).unwrap();
    let results = ctx
        .exec(
            "local co = coroutine.create(function(a) local b = pause(a + 1) return b * 2 end)\n\
             local _, first = coroutine.resume(co, 1)\n\
             local _, second = coroutine.resume(co, 10)\n\
             return first, second, coroutine.status(co)",
            "driver",
        )
        .unwrap();
    assert_eq!(results[0], Value::from(2));
    assert_eq!(results[1], Value::from(20));
    assert_eq!(results[2], Value::from("dead"));
}
