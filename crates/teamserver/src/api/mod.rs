//! HTTP and WebSocket surface.
//!
//! `/auth/login` issues session tokens, `/ws` carries the operator event
//! protocol and `/health` reports liveness.

mod error;
mod handlers;
mod routes;
mod state;
mod ws;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, LoginRequest, LoginResponse};
pub use routes::create_router;
pub use state::AppState;
pub use ws::WsTransport;
