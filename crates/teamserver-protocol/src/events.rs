//! Event categories and their sub-event codes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ============================================================================
// Categories
// ============================================================================

/// Top-level event category carried in `Head.Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum EventCategory {
    InitConnection,
    Listener,
    Credentials,
    Chat,
    Gate,
    HostFile,
    Agent,
    Service,
    Teamserver,
    Audit,
}

impl EventCategory {
    /// Numeric code used on the wire.
    pub const fn code(self) -> i32 {
        match self {
            Self::InitConnection => 0x1,
            Self::Listener => 0x2,
            Self::Credentials => 0x3,
            Self::Chat => 0x4,
            Self::Gate => 0x5,
            Self::HostFile => 0x6,
            Self::Agent => 0x7,
            Self::Service => 0x9,
            Self::Teamserver => 0x10,
            Self::Audit => 0x11,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::InitConnection => "InitConnection",
            Self::Listener => "Listener",
            Self::Credentials => "Credentials",
            Self::Chat => "Chat",
            Self::Gate => "Gate",
            Self::HostFile => "HostFile",
            Self::Agent => "Agent",
            Self::Service => "Service",
            Self::Teamserver => "Teamserver",
            Self::Audit => "Audit",
        }
    }
}

impl From<EventCategory> for i32 {
    fn from(category: EventCategory) -> Self {
        category.code()
    }
}

impl TryFrom<i32> for EventCategory {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, ProtocolError> {
        Ok(match code {
            0x1 => Self::InitConnection,
            0x2 => Self::Listener,
            0x3 => Self::Credentials,
            0x4 => Self::Chat,
            0x5 => Self::Gate,
            0x6 => Self::HostFile,
            0x7 => Self::Agent,
            0x9 => Self::Service,
            0x10 => Self::Teamserver,
            0x11 => Self::Audit,
            other => return Err(ProtocolError::UnknownCategory(other)),
        })
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Sub-events
// ============================================================================

/// Defines a sub-event enum bound to one category, with wire-code conversions.
macro_rules! sub_events {
    (
        $(#[$meta:meta])*
        $name:ident => $category:ident {
            $($variant:ident = $code:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Category this sub-event belongs to.
            pub const CATEGORY: EventCategory = EventCategory::$category;

            pub const fn code(self) -> i32 {
                match self {
                    $(Self::$variant => $code),+
                }
            }
        }

        impl From<$name> for i32 {
            fn from(event: $name) -> Self {
                event.code()
            }
        }

        impl TryFrom<i32> for $name {
            type Error = ProtocolError;

            fn try_from(code: i32) -> Result<Self, ProtocolError> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    other => Err(ProtocolError::UnknownSubEvent {
                        category: EventCategory::$category.name(),
                        code: other,
                    }),
                }
            }
        }
    };
}

sub_events! {
    /// Connection handshake between an operator client and the server.
    InitConnectionEvent => InitConnection {
        Success = 1,
        Error = 2,
        Login = 3,
        Token = 4,
    }
}

sub_events! {
    ListenerEvent => Listener {
        Add = 1,
        Edit = 2,
        Remove = 3,
        Mark = 4,
        Error = 5,
    }
}

sub_events! {
    CredentialsEvent => Credentials {
        Add = 1,
        Edit = 2,
        Remove = 3,
    }
}

sub_events! {
    /// Operator chat and presence notifications.
    ChatEvent => Chat {
        NewMessage = 1,
        NewListener = 2,
        NewSession = 3,
        NewUser = 4,
        UserDisconnected = 5,
    }
}

sub_events! {
    GateEvent => Gate {
        Stageless = 1,
        Stager = 2,
    }
}

sub_events! {
    HostFileEvent => HostFile {
        Add = 1,
        Remove = 2,
    }
}

sub_events! {
    /// Agent lifecycle and I/O.
    AgentEvent => Agent {
        New = 1,
        Remove = 2,
        Input = 3,
        Output = 4,
        Checkin = 5,
    }
}

sub_events! {
    ServiceEvent => Service {
        AgentRegister = 1,
        ListenerAdd = 2,
    }
}

sub_events! {
    /// Server-level requests and notices.
    TeamserverEvent => Teamserver {
        Logger = 1,
        Profile = 2,
        Kick = 3,
        AuditHistory = 4,
        Refused = 5,
    }
}

sub_events! {
    AuditEvent => Audit {
        Append = 1,
    }
}
