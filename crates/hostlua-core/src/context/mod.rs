//! Calling contexts
//!
//! A [`Context`] is bound to one execution handle. It records the stack depth when it is
//! created and truncates the stack back to it when dropped, so every value pushed through it
//! is released on every exit path. [`FunctionContext`] is the variant handed to native
//! functions, which leave their results on the stack instead.

mod function;

pub use function::FunctionContext;
pub(crate) use function::Upvalues;

use crate::error::{Unwind, VmResult};
use crate::function::Function;
use crate::scheduler::{ScriptThread, Scheduler};
use crate::text::Text;
use crate::value::{text_of, Kind, OwnedValue, StackSlot, Value, ValueSeq};
use crate::vm::{Outcome, RawValue, Resumed, VmState, VmThread};
use mlua::MultiValue;

/// Stack-balanced view of one execution handle
pub struct Context {
    thread: VmThread,
    state: VmState,
    /// Absolute stack height at construction
    base: usize,
    restore: bool,
}

impl Context {
    /// Bind to `thread`; fails when its state is gone
    pub fn new(thread: &VmThread) -> VmResult<Context> {
        let state = thread
            .state()
            .ok_or_else(|| Unwind::runtime("VM state has been closed"))?;
        Ok(Context {
            base: thread.abs_top(),
            thread: thread.clone(),
            state,
            restore: true,
        })
    }

    /// Bind to the main thread of `state`
    pub fn main(state: &VmState) -> Context {
        let thread = state.main_thread().clone();
        Context {
            base: thread.abs_top(),
            thread,
            state: state.clone(),
            restore: true,
        }
    }

    pub fn thread(&self) -> &VmThread {
        &self.thread
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.state.scheduler()
    }

    /// The running thread as a script thread
    pub fn current_thread(&self) -> ScriptThread {
        ScriptThread::attach(self.thread.clone())
    }

    // ========================================================================
    // Stack discipline
    // ========================================================================

    /// Number of values in the current frame
    pub fn top(&self) -> usize {
        self.thread.top()
    }

    /// Push a value, returning its frame-relative index
    pub fn push<'a>(&self, value: impl Into<Value<'a>>) -> VmResult<usize> {
        let raw = value.into().to_raw(&self.state)?;
        self.thread.push(raw)?;
        Ok(self.thread.top())
    }

    /// Push every value, returning how many were pushed
    pub fn push_all<'a>(&self, values: impl IntoIterator<Item = Value<'a>>) -> VmResult<usize> {
        let mut count = 0;
        for value in values {
            self.thread.push(value.to_raw(&self.state)?)?;
            count += 1;
        }
        Ok(count)
    }

    /// Live view of a stack position; positions outside the frame read as `Nil`
    pub fn local(&self, index: i32) -> Value<'_> {
        match self.thread.abs_index(index) {
            Some(pos) if pos < self.thread.abs_top() => {
                Value::StackSlot(StackSlot::new(&self.thread, pos))
            }
            _ => Value::Nil,
        }
    }

    /// Push `value` and return a live view of its slot
    pub fn make_local(&self, value: &Value<'_>) -> VmResult<Value<'_>> {
        self.stage(value.to_raw(&self.state)?)
    }

    pub(crate) fn stage(&self, raw: RawValue) -> VmResult<Value<'_>> {
        self.thread.push(raw)?;
        let pos = self.thread.abs_top() - 1;
        Ok(Value::StackSlot(StackSlot::new(&self.thread, pos)))
    }

    pub fn pop(&self, n: usize) {
        self.thread.pop(n);
    }

    /// Convert VM results to owned values
    fn adopt(&self, values: Vec<RawValue>) -> VmResult<ValueSeq> {
        values
            .into_iter()
            .map(|raw| Value::from_raw(raw, &self.state))
            .collect()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call `callee` under `pcall`, or under an `xpcall` routed through `handler`
    ///
    /// The outer `Err` carries termination, allocation failures and marshalling errors; the
    /// inner one the value a script error raised.
    pub(crate) fn invoke_raw(
        &self,
        callee: RawValue,
        handler: Option<RawValue>,
        args: Vec<RawValue>,
    ) -> VmResult<Result<Vec<RawValue>, RawValue>> {
        let runtime = self.state.runtime();
        let mut call = Vec::with_capacity(args.len() + 2);
        call.push(callee);
        let protect = match handler {
            Some(handler) => {
                call.push(handler);
                runtime.xpcall()
            }
            None => runtime.pcall(),
        };
        call.extend(args);
        let results = protect
            .call::<MultiValue>(MultiValue::from_vec(call))
            .map_err(Unwind::from_lua)?;
        let mut results = results.into_vec().into_iter();
        match results.next() {
            Some(RawValue::Boolean(true)) => Ok(Ok(results.collect())),
            _ => {
                let error = results.next().unwrap_or(RawValue::Nil);
                match runtime.fatal(&error) {
                    Some(fatal) => Err(fatal),
                    None => Ok(Err(error)),
                }
            }
        }
    }

    /// Call `callee`, raising script errors again as [`Unwind::Error`]
    pub(crate) fn call_raw(&self, callee: RawValue, args: Vec<RawValue>) -> VmResult<Vec<RawValue>> {
        match self.invoke_raw(callee, None, args)? {
            Ok(results) => Ok(results),
            Err(error) => Err(Unwind::raise(Value::from_raw(error, &self.state)?)),
        }
    }

    /// Marshal `f` and `args` into the state
    fn prepare_call<'a>(
        &self,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<(RawValue, Vec<RawValue>)> {
        if f.is_nil() {
            return Err(Unwind::runtime("cannot call nil value."));
        }
        let callee = f.to_raw(&self.state)?;
        let args = args
            .into_iter()
            .map(|arg| arg.to_raw(&self.state))
            .collect::<VmResult<Vec<_>>>()?;
        Ok((callee, args))
    }

    /// Keep exactly `n` results, or all of them
    fn fit(&self, nresults: Option<usize>, values: Vec<RawValue>) -> VmResult<ValueSeq> {
        let mut results = self.adopt(values)?.into_vec();
        if let Some(n) = nresults {
            results.resize_with(n, Value::default);
        }
        Ok(ValueSeq::from(results))
    }

    fn call_with<'a>(
        &self,
        nresults: Option<usize>,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<ValueSeq> {
        let (callee, args) = self.prepare_call(f, args)?;
        let results = self.call_raw(callee, args)?;
        self.fit(nresults, results)
    }

    /// Call `f`, returning its first result
    ///
    /// Script errors propagate to the enclosing native frame.
    pub fn call<'a>(
        &self,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<OwnedValue> {
        let results = self.call_with(Some(1), f, args)?;
        Ok(results.into_vec().into_iter().next().unwrap_or_default())
    }

    /// Call `f`, keeping exactly `n` results
    pub fn call_n<'a>(
        &self,
        n: usize,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<ValueSeq> {
        self.call_with(Some(n), f, args)
    }

    /// Call `f`, keeping every result
    pub fn call_multi<'a>(
        &self,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<ValueSeq> {
        self.call_with(None, f, args)
    }

    fn protected<'a>(
        &self,
        nresults: Option<usize>,
        f: &Value<'_>,
        handler: Option<&Value<'_>>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<ValueSeq, OwnedValue>> {
        let handler = handler.map(|h| h.to_raw(&self.state)).transpose()?;
        let (callee, args) = self.prepare_call(f, args)?;
        match self.invoke_raw(callee, handler, args)? {
            Ok(results) => Ok(Ok(self.fit(nresults, results)?)),
            Err(error) => Ok(Err(Value::from_raw(error, &self.state)?)),
        }
    }

    /// Protected call returning the first result, or the raised value
    ///
    /// Out-of-memory and termination are not caught and surface as the outer `Err`.
    pub fn pcall<'a>(
        &self,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<OwnedValue, OwnedValue>> {
        Ok(self
            .protected(Some(1), f, None, args)?
            .map(|results| results.into_vec().into_iter().next().unwrap_or_default()))
    }

    pub fn pcall_n<'a>(
        &self,
        n: usize,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<ValueSeq, OwnedValue>> {
        self.protected(Some(n), f, None, args)
    }

    pub fn pcall_multi<'a>(
        &self,
        f: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<ValueSeq, OwnedValue>> {
        self.protected(None, f, None, args)
    }

    /// Protected call whose errors pass through `handler` before the stack unwinds
    pub fn xpcall<'a>(
        &self,
        f: &Value<'_>,
        handler: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<OwnedValue, OwnedValue>> {
        Ok(self
            .protected(Some(1), f, Some(handler), args)?
            .map(|results| results.into_vec().into_iter().next().unwrap_or_default()))
    }

    pub fn xpcall_n<'a>(
        &self,
        n: usize,
        f: &Value<'_>,
        handler: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<ValueSeq, OwnedValue>> {
        self.protected(Some(n), f, Some(handler), args)
    }

    pub fn xpcall_multi<'a>(
        &self,
        f: &Value<'_>,
        handler: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Result<ValueSeq, OwnedValue>> {
        self.protected(None, f, Some(handler), args)
    }

    // ========================================================================
    // Scripts
    // ========================================================================

    /// Compile `source` into a function; `name` appears in error positions
    pub fn load(&self, source: &str, name: &str) -> VmResult<OwnedValue> {
        self.state.load(source, name)
    }

    /// Compile and run `source`, returning every result
    pub fn exec(&self, source: &str, name: &str) -> VmResult<ValueSeq> {
        let chunk = self.load(source, name)?;
        self.call_multi(&chunk, [])
    }

    // ========================================================================
    // Coroutines
    // ========================================================================

    /// Push `values` and suspend; the result must be returned from the native function
    pub fn yield_values<'a>(
        &self,
        values: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Outcome> {
        let n = self.push_all(values)?;
        Ok(Outcome::Yield(n))
    }

    /// Queue the current thread on the wait queue and suspend
    ///
    /// `None` resumes it on the next step. The result must be returned from the native
    /// function.
    pub fn wait(&self, duration: Option<f64>) -> VmResult<Outcome> {
        self.scheduler().wait(&self.current_thread(), duration)?;
        Ok(Outcome::Yield(0))
    }

    /// Abort the current thread; cannot be caught by protected calls
    pub fn terminate(&self) -> VmResult<Outcome> {
        Err(Unwind::Terminate)
    }

    /// Resume `thread`, returning its first yielded or returned value
    pub fn resume<'a>(
        &self,
        thread: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<OwnedValue> {
        let results = self.resume_multi(thread, args)?;
        Ok(results.into_iter().next().unwrap_or_default())
    }

    /// Resume `thread`, returning every yielded or returned value
    ///
    /// A script error raised inside the coroutine is raised again here.
    pub fn resume_multi<'a>(
        &self,
        thread: &Value<'_>,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<ValueSeq> {
        let co = match thread.as_thread() {
            Some(co) => co,
            None => {
                return Err(Unwind::runtime(format!(
                    "resume(): expected type thread, got {}",
                    thread.kind().name()
                )))
            }
        };
        if !co.vm().belongs_to(&self.state) {
            return Err(Unwind::runtime(
                "attempt to resume a thread that belongs to another VM state",
            ));
        }
        let args = args
            .into_iter()
            .map(|arg| arg.to_raw(&self.state))
            .collect::<VmResult<Vec<_>>>()?;
        match co.vm().resume(&self.state, args)? {
            Resumed::Yielded(values) | Resumed::Returned(values) => self.adopt(values),
            Resumed::Cancelled => Ok(ValueSeq::new()),
        }
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Format through the state's `string.format`
    pub fn format<'a>(
        &self,
        fmt: &str,
        args: impl IntoIterator<Item = Value<'a>>,
    ) -> VmResult<Text> {
        let format = RawValue::Function(self.state.runtime().format().clone());
        let args = std::iter::once(Value::from(fmt))
            .chain(args)
            .map(|arg| arg.to_raw(&self.state))
            .collect::<VmResult<Vec<_>>>()?;
        match self.call_raw(format, args)?.into_iter().next() {
            Some(RawValue::String(s)) => Ok(text_of(&s)),
            other => Err(Unwind::runtime(format!(
                "string.format returned a {} value",
                other.map_or("nil", |raw| raw.type_name())
            ))),
        }
    }

    /// Error carrying a formatted message; formatting failures are returned instead
    pub fn errorf<'a>(&self, fmt: &str, args: impl IntoIterator<Item = Value<'a>>) -> Unwind {
        match self.format(fmt, args) {
            Ok(message) => Unwind::raise(Value::Text(message)),
            Err(err) => err,
        }
    }

    /// Error carrying any value
    pub fn error(&self, value: &Value<'_>) -> Unwind {
        Unwind::raise(value.clone_owned())
    }

    // ========================================================================
    // State access
    // ========================================================================

    /// The globals table
    pub fn globals(&self) -> VmResult<OwnedValue> {
        Value::from_raw(RawValue::Table(self.state.globals()), &self.state)
    }

    pub fn get_global(&self, name: &str) -> VmResult<OwnedValue> {
        let value = self
            .state
            .globals()
            .get::<RawValue>(name)
            .map_err(Unwind::from_lua)?;
        Value::from_raw(value, &self.state)
    }

    pub fn set_global(&self, name: &str, value: &Value<'_>) -> VmResult<()> {
        let value = value.to_raw(&self.state)?;
        self.state
            .globals()
            .set(name, value)
            .map_err(Unwind::from_lua)
    }

    pub fn registry_len(&self) -> usize {
        self.state.registry_len()
    }

    /// Scheduler clock in seconds
    pub fn clock(&self) -> f64 {
        self.scheduler().clock()
    }

    /// VM function running `f`
    pub fn create_function<F>(&self, name: &str, f: F) -> VmResult<OwnedValue>
    where
        F: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
    {
        self.create(Function::new(name, f))
    }

    /// VM function running `f` with `upvalues`
    pub fn create_closure<F>(
        &self,
        name: &str,
        f: F,
        upvalues: Vec<OwnedValue>,
    ) -> VmResult<OwnedValue>
    where
        F: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
    {
        self.create(Function::new(name, f).with_upvalues(upvalues))
    }

    /// VM function running `f`, continued by `k` when resumed after a yield
    pub fn create_function_k<F, K>(&self, name: &str, f: F, k: K) -> VmResult<OwnedValue>
    where
        F: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
        K: Fn(&FunctionContext) -> VmResult<Outcome> + Send + Sync + 'static,
    {
        self.create(Function::new(name, f).with_continuation(k))
    }

    fn create(&self, function: Function) -> VmResult<OwnedValue> {
        let raw = function.materialize(&self.state)?;
        Value::from_raw(raw, &self.state)
    }

    /// Whether `value` denotes no function at all: nil, or a handle into a closed state
    pub fn is_null(&self, value: &Value<'_>) -> bool {
        match value {
            Value::Registry(handle) => handle.state().is_none() || value.is_nil(),
            _ => !value.is_kind(Kind::Function),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.restore {
            self.thread.truncate_abs(self.base);
        }
    }
}
