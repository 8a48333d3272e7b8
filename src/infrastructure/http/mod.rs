//! HTTP gateway: routing, auth, and wire types

pub mod auth;
pub mod handlers;
pub mod server;
pub mod types;

pub use auth::AuthSettings;
pub use server::{router, serve, AppState};
pub use types::{ApiError, HealthResponse};
