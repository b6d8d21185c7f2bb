//! State and mode enums shared by workers, balancers and the status interface.
//!
//! Each enum has a short display text used by the status interface and a
//! stable numeric code used in the shared runtime image.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::error::AjpError;

macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal, $text:literal, [$($alias:literal),*] ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Display text used by the status interface.
            pub fn as_str(self) -> &'static str {
                match self { $( $name::$variant => $text ),+ }
            }

            /// Numeric code used in the shared runtime image.
            pub fn code(self) -> u8 {
                match self { $( $name::$variant => $code ),+ }
            }

            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AjpError;

            /// Accepts the display text, the variant name or an alias,
            /// case-insensitively, or the numeric code.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if let Ok(code) = s.parse::<u8>() {
                    if let Some(v) = Self::from_code(code) {
                        return Ok(v);
                    }
                }
                $(
                    if s.eq_ignore_ascii_case($text)
                        || s.eq_ignore_ascii_case(stringify!($variant))
                        $( || s.eq_ignore_ascii_case($alias) )*
                    {
                        return Ok($name::$variant);
                    }
                )+
                Err(AjpError::Config(format!(
                    "invalid {} '{}'",
                    stringify!($name),
                    s
                )))
            }
        }
    };
}

coded_enum! {
    /// Health of an AJP worker as seen by its connection layer.
    WorkerState {
        #[default]
        Idle = 0, "OK/IDLE", [],
        Ok = 1, "OK", [],
        Error = 2, "ERR", ["error"],
        Probe = 3, "ERR/PRB", [],
    }
}

coded_enum! {
    /// Runtime state of a balancer member.
    MemberState {
        #[default]
        Idle = 0, "OK/IDLE", [],
        Ok = 1, "OK", [],
        Recover = 2, "ERR/REC", [],
        Force = 3, "ERR/FRC", [],
        Busy = 4, "OK/BUSY", [],
        Error = 5, "ERR", [],
        Probe = 6, "ERR/PRB", [],
    }
}

impl MemberState {
    /// States in which a member is quarantined from selection.
    pub fn is_quarantined(self) -> bool {
        matches!(self, MemberState::Error | MemberState::Force | MemberState::Probe)
    }
}

coded_enum! {
    /// Administrative activation of a balancer member.
    Activation {
        #[default]
        Active = 0, "ACT", ["a"],
        Disabled = 1, "DIS", ["d"],
        Stopped = 2, "STP", ["s"],
    }
}

coded_enum! {
    /// How a balancer accounts load when choosing a member.
    LbMethod {
        #[default]
        Requests = 0, "Request", ["r"],
        Traffic = 1, "Traffic", ["t"],
        Busyness = 2, "Busyness", ["b"],
        Sessions = 3, "Sessions", ["s"],
    }
}

coded_enum! {
    /// Locking discipline around the shared runtime store.
    LockMode {
        #[default]
        Optimistic = 0, "Optimistic", ["o"],
        Pessimistic = 1, "Pessimistic", ["p"],
    }
}
