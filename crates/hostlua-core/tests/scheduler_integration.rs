//! Integration tests for the cooperative scheduler

use hostlua_core::{
    Context, Domain, FunctionContext, OwnedValue, ScriptThread, SchedulerError, ThreadIdentity,
    ThreadStatus, Value, VmOptions, VmState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn state() -> VmState {
    VmState::new(VmOptions::default()).unwrap()
}

/// Route scheduler logs to the test output; `RUST_LOG=hostlua_core=debug` to see them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Body that waits `duration` once, then records its resume arguments
fn waiting_body(
    ctx: &Context,
    duration: Option<f64>,
    resumes: &Arc<AtomicUsize>,
    seen_args: &Arc<Mutex<Vec<usize>>>,
) -> OwnedValue {
    let resumes = Arc::clone(resumes);
    let seen_args = Arc::clone(seen_args);
    ctx.create_function_k(
        "waiter",
        move |ctx| ctx.wait(duration),
        move |ctx| {
            resumes.fetch_add(1, Ordering::SeqCst);
            seen_args.lock().push(ctx.argument_count());
            ctx.return_values([])
        },
    )
    .unwrap()
}

fn recorder(ctx: &Context, name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> OwnedValue {
    let log = Arc::clone(log);
    ctx.create_function(name, move |ctx| {
        log.lock().push(name);
        ctx.return_values([])
    })
    .unwrap()
}

#[test]
fn test_wait_scenario_resumes_once_without_arguments() {
    let state = state();
    let ctx = Context::main(&state);
    let resumes = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let body = waiting_body(&ctx, Some(0.5), &resumes, &seen);

    let thread = state.scheduler().defer(&body, Vec::new(), None).unwrap();

    state.scheduler().frame_step(0.2).unwrap();
    assert_eq!(resumes.load(Ordering::SeqCst), 0);
    assert_eq!(thread.status(), ThreadStatus::Suspended);

    state.scheduler().frame_step(0.4).unwrap();
    assert_eq!(resumes.load(Ordering::SeqCst), 1);
    assert_eq!(thread.status(), ThreadStatus::Completed);

    // A wait queued by the initial yield holds no arguments; the frame only keeps its own.
    assert_eq!(seen.lock().as_slice(), &[0]);

    state.scheduler().frame_step(1.0).unwrap();
    assert_eq!(resumes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wait_without_duration_is_next_step() {
    let state = state();
    let ctx = Context::main(&state);
    let resumes = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let body = waiting_body(&ctx, None, &resumes, &seen);

    state.scheduler().defer(&body, Vec::new(), None).unwrap();
    // The defer pass runs the body, which queues its wait; that wait belongs to the next step.
    state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(resumes.load(Ordering::SeqCst), 0);
    state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(resumes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_defer_is_fifo_within_domain() {
    let state = state();
    let ctx = Context::main(&state);
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b", "c"] {
        let body = recorder(&ctx, name, &log);
        state.scheduler().defer(&body, Vec::new(), None).unwrap();
    }
    let report = state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(report.resumed, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(log.lock().as_slice(), &["a", "b", "c"]);
}

#[test]
fn test_delays_resume_in_wake_order() {
    let state = state();
    let ctx = Context::main(&state);
    let log = Arc::new(Mutex::new(Vec::new()));
    let late = recorder(&ctx, "late", &log);
    let early = recorder(&ctx, "early", &log);
    state.scheduler().delay(0.3, &late, Vec::new(), None).unwrap();
    state.scheduler().delay(0.1, &early, Vec::new(), None).unwrap();

    state.scheduler().frame_step(0.5).unwrap();
    assert_eq!(log.lock().as_slice(), &["early", "late"]);
}

#[test]
fn test_self_deferring_thread_runs_once_per_step() {
    let state = state();
    let ctx = Context::main(&state);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let again = move |ctx: &FunctionContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        let current = ctx.current_thread();
        ctx.scheduler()
            .defer(&Value::from(current), Vec::new(), None)?;
        ctx.yield_values([])
    };
    let again_k = again.clone();
    let body = ctx.create_function_k("again", again, again_k).unwrap();
    state.scheduler().defer(&body, Vec::new(), None).unwrap();

    for expected in 1..=3 {
        state.scheduler().frame_step(0.016).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), expected);
    }
}

#[test]
fn test_uncaught_error_is_reported() {
    init_tracing();
    let state = state();
    let ctx = Context::main(&state);
    let body = ctx
        .create_function("broken", |ctx| Err(ctx.errorf("broken on purpose", [])))
        .unwrap();
    let thread = state.scheduler().defer(&body, Vec::new(), None).unwrap();
    let report = state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.errored, 1);
    assert_eq!(thread.status(), ThreadStatus::Errored);
}

#[test]
fn test_resume_arguments_are_passed() {
    let state = state();
    let ctx = Context::main(&state);
    let total = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&total);
    let body = ctx
        .create_function("sum", move |ctx| {
            let sum: i64 = ctx
                .arguments(1)
                .iter()
                .filter_map(|v| v.as_integer())
                .sum();
            sink.store(sum as usize, Ordering::SeqCst);
            ctx.return_values([])
        })
        .unwrap();
    state
        .scheduler()
        .defer(&body, vec![Value::from(2), Value::from(5)], None)
        .unwrap();
    state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 7);
}

#[test]
fn test_synchronized_domain_needs_primary_driver() {
    let state = state();
    let ctx = Context::main(&state);
    let log = Arc::new(Mutex::new(Vec::new()));
    let synced = recorder(&ctx, "sync", &log);
    let desynced = recorder(&ctx, "desync", &log);
    state.scheduler().defer(&synced, Vec::new(), None).unwrap();
    state
        .scheduler()
        .defer(&desynced, Vec::new(), Some(Domain::Desynchronized))
        .unwrap();

    let remote = state.clone();
    let report = thread::spawn(move || remote.scheduler().frame_step(0.0).unwrap())
        .join()
        .unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(log.lock().as_slice(), &["desync"]);
    assert_eq!(state.scheduler().pending(Domain::Synchronized).deferred, 1);

    state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(log.lock().as_slice(), &["desync", "sync"]);
}

#[test]
fn test_any_driver_steps_both_domains() {
    let state = VmState::new(VmOptions::any_driver()).unwrap();
    let ctx = Context::main(&state);
    let log = Arc::new(Mutex::new(Vec::new()));
    let body = recorder(&ctx, "sync", &log);
    state.scheduler().defer(&body, Vec::new(), None).unwrap();

    let remote = state.clone();
    thread::spawn(move || remote.scheduler().frame_step(0.0).unwrap())
        .join()
        .unwrap();
    assert_eq!(log.lock().as_slice(), &["sync"]);
}

#[test]
fn test_queue_membership_is_exclusive() {
    let state = state();
    let ctx = Context::main(&state);
    let log = Arc::new(Mutex::new(Vec::new()));
    let body = recorder(&ctx, "once", &log);
    let thread = state.scheduler().defer(&body, Vec::new(), None).unwrap();
    state
        .scheduler()
        .delay(5.0, &Value::from(thread.clone()), Vec::new(), None)
        .unwrap();

    let pending = state.scheduler().pending(Domain::Synchronized);
    assert_eq!(pending.deferred, 0);
    assert_eq!(pending.delayed, 1);
    assert_eq!(pending.total(), 1);

    state.scheduler().frame_step(1.0).unwrap();
    assert!(log.lock().is_empty());
    state.scheduler().frame_step(4.0).unwrap();
    assert_eq!(log.lock().as_slice(), &["once"]);
}

#[test]
fn test_cancel_running_thread_closes_at_suspension() {
    init_tracing();
    let state = state();
    let ctx = Context::main(&state);
    let body = ctx
        .create_function("self_cancel", |ctx| {
            let current = ctx.current_thread();
            ctx.scheduler().cancel(&current)?;
            ctx.wait(Some(1.0))
        })
        .unwrap();
    let thread = state.scheduler().spawn(&body, Vec::new(), None).unwrap();
    assert_eq!(thread.status(), ThreadStatus::Cancelled);

    let report = state.scheduler().frame_step(2.0).unwrap();
    assert_eq!(report.resumed, 0);
}

#[test]
fn test_task_library_defer_and_wait() {
    let state = state();
    let ctx = Context::main(&state);
    let task = ctx.get_global("task").unwrap();
    let wait = task.index(&ctx, &Value::from("wait")).unwrap();
    let defer = task.index(&ctx, &Value::from("defer")).unwrap();

    // `task.wait` as a coroutine body resumes with the elapsed time and returns it.
    let co = ctx.call(&defer, [wait, Value::from(0.25)]).unwrap();
    let co = co.as_thread().unwrap();
    state.scheduler().frame_step(0.0).unwrap();
    assert_eq!(co.status(), ThreadStatus::Suspended);
    state.scheduler().frame_step(0.3).unwrap();
    assert_eq!(co.status(), ThreadStatus::Completed);
}

#[test]
fn test_task_desynchronize_moves_thread() {
    let state = state();
    let ctx = Context::main(&state);
    let task = ctx.get_global("task").unwrap();
    let desync = task.index(&ctx, &Value::from("desynchronize")).unwrap();
    let spawn = task.index(&ctx, &Value::from("spawn")).unwrap();

    let co = ctx.call(&spawn, [desync]).unwrap().as_thread().unwrap();
    assert_eq!(co.domain(), Domain::Desynchronized);
    assert_eq!(co.status(), ThreadStatus::Suspended);
    assert_eq!(state.scheduler().pending(Domain::Desynchronized).deferred, 1);

    let remote = state.clone();
    thread::spawn(move || remote.scheduler().frame_step(0.0).unwrap())
        .join()
        .unwrap();
    assert_eq!(co.status(), ThreadStatus::Completed);
}

#[test]
fn test_identity_is_per_thread() {
    let state = state();
    let a = ScriptThread::attach(state.new_thread().unwrap());
    let b = ScriptThread::attach(state.new_thread().unwrap());
    a.set_identity(ThreadIdentity::Plugin);
    assert_eq!(a.identity(), ThreadIdentity::Plugin);
    assert_eq!(b.identity(), ThreadIdentity::Anonymous);
}

#[test]
fn test_foreign_thread_rejected() {
    let a = state();
    let b = state();
    let foreign = ScriptThread::attach(b.new_thread().unwrap());
    assert!(matches!(
        a.scheduler().cancel(&foreign),
        Err(SchedulerError::ForeignThread)
    ));
}
