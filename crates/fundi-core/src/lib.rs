//! fundi-core - Core client library for Fundi
//!
//! This crate contains the session/token-refresh and request-resilience layer
//! shared by the Fundi client shells (customer app, provider/admin app, CLI):
//! the token manager, the authenticated request wrapper, connection recovery,
//! the labour-access cache, and the admin dashboard stats state.

pub mod access;
pub mod api;
pub mod auth;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod recovery;
pub mod util;

pub use api::ApiClient;
pub use auth::{AuthClient, SessionState, TokenManager, TokenPair};
pub use error::{ApiError, ApiResult};
