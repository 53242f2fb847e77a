//! Teamserver Library
//!
//! The control-plane core of a multi-operator teamserver: authenticated
//! operator sessions, workspace-scoped RBAC, an append-only audit trail, and
//! fan-out of typed events to connected operators.

pub mod api;
pub mod audit;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod ports;
pub mod rbac;
pub mod registry;
pub mod server;
pub mod session;
pub mod user;

pub use error::StorageError;
pub use server::Teamserver;
