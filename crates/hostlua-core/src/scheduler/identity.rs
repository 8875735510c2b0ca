//! Thread identities and the capabilities they grant

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Who started a script thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThreadIdentity {
    #[default]
    Anonymous,
    UserInit,
    Script,
    ScriptInPlace,
    ScriptByHost,
    CommandBar,
    Plugin,
    WebService,
    Repl,
}

impl ThreadIdentity {
    /// Capabilities granted to threads running under this identity
    pub fn security(self) -> SecurityContext {
        use SecurityContext as S;
        match self {
            ThreadIdentity::Anonymous | ThreadIdentity::Script => S::NONE,
            ThreadIdentity::UserInit | ThreadIdentity::CommandBar => {
                S::PLUGIN | S::PLACE | S::LOCAL_USER
            }
            ThreadIdentity::ScriptInPlace => S::PLACE,
            ThreadIdentity::ScriptByHost => S::PLUGIN | S::PLACE | S::LOCAL_USER | S::SCRIPT,
            ThreadIdentity::Plugin => S::PLUGIN,
            ThreadIdentity::WebService => S::FULL,
            ThreadIdentity::Repl => S::WRITE_PLAYER | S::PLACE | S::SCRIPT,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> ThreadIdentity {
        match raw {
            1 => ThreadIdentity::UserInit,
            2 => ThreadIdentity::Script,
            3 => ThreadIdentity::ScriptInPlace,
            4 => ThreadIdentity::ScriptByHost,
            5 => ThreadIdentity::CommandBar,
            6 => ThreadIdentity::Plugin,
            7 => ThreadIdentity::WebService,
            8 => ThreadIdentity::Repl,
            _ => ThreadIdentity::Anonymous,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Capability bits checked by privileged native APIs
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SecurityContext(u8);

impl SecurityContext {
    pub const NONE: SecurityContext = SecurityContext(0x00);
    pub const PLUGIN: SecurityContext = SecurityContext(0x01);
    pub const PLACE: SecurityContext = SecurityContext(0x02);
    pub const WRITE_PLAYER: SecurityContext = SecurityContext(0x04);
    pub const LOCAL_USER: SecurityContext = SecurityContext(0x10);
    /// Host-authored scripts; includes `PLUGIN`, `WRITE_PLAYER` and `LOCAL_USER`
    pub const SCRIPT: SecurityContext = SecurityContext(0x1D);
    /// Every capability
    pub const FULL: SecurityContext = SecurityContext(0x1F);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: SecurityContext) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SecurityContext {
    type Output = SecurityContext;

    fn bitor(self, rhs: SecurityContext) -> SecurityContext {
        SecurityContext(self.0 | rhs.0)
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityContext({:#04x})", self.0)
    }
}
