//! The Luau runtime chunk loaded into every state

use super::RawValue;
use crate::error::Unwind;
use mlua::{Function, Lua, Table};

const SOURCE: &str = include_str!("runtime.luau");

/// How a native entry left its frame; the first value it hands back to the runtime chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Return,
    Raise,
    Yield,
    Terminate,
}

impl Tag {
    pub(crate) fn raw(self) -> RawValue {
        RawValue::Integer(match self {
            Tag::Return => 0,
            Tag::Raise => 1,
            Tag::Yield => 2,
            Tag::Terminate => 3,
        })
    }
}

/// Functions and tables of the runtime chunk plus the globals it relies on
pub(crate) struct Runtime {
    bind: Function,
    routed: Function,
    pcall: Function,
    resume: Function,
    close: Function,
    format: Function,
    idle: Function,
    ops: Table,
    cache: Table,
    terminated: Table,
    globals: Table,
}

impl Runtime {
    pub(crate) fn load(lua: &Lua) -> mlua::Result<Runtime> {
        let isfatal = lua.create_function(|_, value: RawValue| Ok(is_out_of_memory(&value)))?;
        let exports: Table = lua.load(SOURCE).set_name("=hostlua").call(isfatal)?;
        let globals = lua.globals();
        let coroutine: Table = globals.get("coroutine")?;
        let string: Table = globals.get("string")?;
        Ok(Runtime {
            bind: exports.get("bind")?,
            routed: exports.get("routed")?,
            idle: exports.get("idle")?,
            ops: exports.get("ops")?,
            cache: exports.get("cache")?,
            terminated: exports.get("terminated")?,
            pcall: exports.get("pcall")?,
            resume: coroutine.get("resume")?,
            close: coroutine.get("close")?,
            format: string.get("format")?,
            globals,
        })
    }

    /// VM function calling `entry`, continued by `k` after a yield
    pub(crate) fn bind(&self, entry: Function, k: Option<Function>) -> mlua::Result<Function> {
        self.bind.call((entry, k))
    }

    pub(crate) fn pcall(&self) -> &Function {
        &self.pcall
    }

    /// `xpcall` through a handler that lets fatal errors pass untouched
    pub(crate) fn xpcall(&self) -> &Function {
        &self.routed
    }

    pub(crate) fn resume(&self) -> &Function {
        &self.resume
    }

    pub(crate) fn close(&self) -> &Function {
        &self.close
    }

    /// `string.format`
    pub(crate) fn format(&self) -> &Function {
        &self.format
    }

    /// A body that returns immediately
    pub(crate) fn idle(&self) -> &Function {
        &self.idle
    }

    pub(crate) fn globals(&self) -> &Table {
        &self.globals
    }

    /// Weak-valued table mapping native object addresses to their userdata
    pub(crate) fn cache(&self) -> &Table {
        &self.cache
    }

    /// Operator helper `name`, e.g. `"add"` or `"index"`
    pub(crate) fn op(&self, name: &str) -> mlua::Result<Function> {
        self.ops.raw_get(name)
    }

    pub(crate) fn is_terminated(&self, value: &RawValue) -> bool {
        matches!(value, RawValue::Table(_)) && value.to_pointer() == self.terminated.to_pointer()
    }

    /// Fatal exit a caught error value stands for, if any
    pub(crate) fn fatal(&self, value: &RawValue) -> Option<Unwind> {
        if self.is_terminated(value) {
            Some(Unwind::Terminate)
        } else if is_out_of_memory(value) {
            Some(Unwind::OutOfMemory)
        } else {
            None
        }
    }
}

/// Whether a caught error value reports an allocation failure
pub(crate) fn is_out_of_memory(value: &RawValue) -> bool {
    match value {
        RawValue::Error(err) => is_memory_error(err),
        RawValue::String(s) => &*s.as_bytes() == b"not enough memory".as_slice(),
        _ => false,
    }
}

pub(crate) fn is_memory_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            is_memory_error(cause)
        }
        _ => false,
    }
}
