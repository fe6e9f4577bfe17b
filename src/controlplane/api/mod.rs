//! API Module
//!
//! REST API for domain reports, quota and capacity edits, and discovery.

pub mod auth;
pub mod rest;
pub mod server;

pub use auth::{Authorizer, TrustedHeaderAuthorizer};
pub use rest::RestRouter;
pub use server::{ApiServer, ApiServerConfig};
