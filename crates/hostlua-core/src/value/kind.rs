//! Effective value kinds

use crate::vm::{RawValue, VmState};
use std::fmt;

/// Kind of a value as scripts observe it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Nil,
    Boolean,
    Integer,
    Number,
    Text,
    LightPointer,
    Opaque,
    Table,
    Buffer,
    Function,
    Thread,
    /// The globals table of a state
    GlobalEnv,
}

impl Kind {
    /// VM type name, as `type()` would report it
    pub fn name(self) -> &'static str {
        match self {
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::Integer | Kind::Number => "number",
            Kind::Text => "string",
            Kind::LightPointer | Kind::Opaque => "userdata",
            Kind::Table | Kind::GlobalEnv => "table",
            Kind::Buffer => "buffer",
            Kind::Function => "function",
            Kind::Thread => "thread",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Kind::Integer | Kind::Number)
    }

    /// Kind of a raw VM value; the state is needed to recognise its globals table
    pub(crate) fn of_raw(raw: &RawValue, state: Option<&VmState>) -> Kind {
        match raw {
            RawValue::Nil => Kind::Nil,
            RawValue::Boolean(_) => Kind::Boolean,
            RawValue::Integer(_) => Kind::Integer,
            RawValue::Number(_) => Kind::Number,
            RawValue::String(_) | RawValue::Error(_) => Kind::Text,
            RawValue::LightUserData(_) => Kind::LightPointer,
            RawValue::Table(_) => match state {
                Some(state) if raw.to_pointer() == state.runtime().globals().to_pointer() => {
                    Kind::GlobalEnv
                }
                _ => Kind::Table,
            },
            RawValue::Buffer(_) => Kind::Buffer,
            RawValue::Function(_) => Kind::Function,
            RawValue::Thread(_) => Kind::Thread,
            _ => Kind::Opaque,
        }
    }

    /// Whether a value of kind `self` satisfies a test for `wanted`
    pub fn satisfies(self, wanted: Kind) -> bool {
        match wanted {
            Kind::Integer | Kind::Number => self.is_numeric(),
            Kind::Table => matches!(self, Kind::Table | Kind::GlobalEnv),
            other => self == other,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_kinds_satisfy_each_other() {
        assert!(Kind::Integer.satisfies(Kind::Number));
        assert!(Kind::Number.satisfies(Kind::Integer));
        assert!(!Kind::Text.satisfies(Kind::Number));
    }

    #[test]
    fn test_global_env_is_a_table() {
        assert!(Kind::GlobalEnv.satisfies(Kind::Table));
        assert!(!Kind::Table.satisfies(Kind::GlobalEnv));
        assert_eq!(Kind::GlobalEnv.name(), "table");
    }

    #[test]
    fn test_raw_kinds() {
        let state = VmState::new(crate::options::VmOptions::default()).unwrap();
        let lua = state.lua();
        let plain = RawValue::Table(lua.create_table().unwrap());
        let globals = RawValue::Table(state.globals());
        assert_eq!(Kind::of_raw(&plain, Some(&state)), Kind::Table);
        assert_eq!(Kind::of_raw(&globals, Some(&state)), Kind::GlobalEnv);
        assert_eq!(Kind::of_raw(&globals, None), Kind::Table);
        let buffer = RawValue::Buffer(lua.create_buffer(b"ab").unwrap());
        assert_eq!(Kind::of_raw(&buffer, None), Kind::Buffer);
        let text = RawValue::String(lua.create_string("x").unwrap());
        assert_eq!(Kind::of_raw(&text, None), Kind::Text);
    }
}
