//! Control Plane Module
//!
//! Engine facade over the per-cluster reconcilers and editors, the REST
//! API in front of it, and the scheduler driving periodic scrapes.

pub mod api;
pub mod engine;
pub mod scheduler;

pub use api::{ApiServer, ApiServerConfig, Authorizer, RestRouter, TrustedHeaderAuthorizer};
pub use engine::{ClusterRuntime, Engine, CURRENT_CLUSTER};
pub use scheduler::Scheduler;
