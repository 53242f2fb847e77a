//! User management module.
//!
//! Operator accounts, credential verification and password management.

mod models;
mod repository;
mod service;

pub use models::{User, UserInfo};
pub use repository::UserRepository;
pub use service::UserService;
