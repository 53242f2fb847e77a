//! Application state shared across handlers.

use std::sync::Arc;

use crate::server::Teamserver;

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Teamserver>,
}

impl AppState {
    pub fn new(server: Arc<Teamserver>) -> Self {
        Self { server }
    }
}
