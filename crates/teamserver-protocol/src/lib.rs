//! Wire protocol shared by the teamserver and operator clients.
//!
//! Every state change the server pushes to an operator, and every request an
//! operator sends, travels as an [`Envelope`]:
//!
//! ```text
//! { "Head": { "Event": <category>, "Time": "DD/MM/YYYY HH:MM:SS" },
//!   "Body": { "SubEvent": <code>, "Info": { ... } } }
//! ```
//!
//! The same envelope shape is used for live broadcasts and for audit records
//! replayed from storage, so a reconnecting client cannot tell the two apart.

pub mod envelope;
pub mod error;
pub mod events;

// Re-exported for the `payload!` macro.
pub use serde_json;

pub use envelope::{Body, Envelope, Head, Info, TIME_FORMAT};
pub use error::ProtocolError;
pub use events::{
    AgentEvent, AuditEvent, ChatEvent, CredentialsEvent, EventCategory, GateEvent,
    HostFileEvent, InitConnectionEvent, ListenerEvent, ServiceEvent, TeamserverEvent,
};
