//! Quota Reconciler - Hierarchical Quota and Capacity Engine
//!
//! Tracks how much of each resource every cluster, domain and project may
//! consume and actually consumes, keeps that hierarchy consistent while
//! facts arrive from pluggable backend drivers, validates operator edits,
//! and emits an audit trail of every accepted or rejected change.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Control Plane (engine)                         │
//! │  ┌───────────────┐   ┌─────────────────┐   ┌──────────────────────┐  │
//! │  │   REST API    │   │    Scheduler    │   │   Metrics exporter   │  │
//! │  └───────┬───────┘   └────────┬────────┘   └──────────┬───────────┘  │
//! │          │                    │                       │              │
//! │  ┌───────┴───────┐   ┌────────┴────────┐              │              │
//! │  │ Operator edits│   │   Reconciler    │──────────────┘              │
//! │  └───┬───────┬───┘   └────────┬────────┘                             │
//! │      │       │                │                                      │
//! │      │  ┌────┴────────────────┴────┐      ┌───────────────────────┐  │
//! │      │  │     Hierarchy Store      │      │  Capacity / Quota     │  │
//! │      │  │ cluster→domain→project   │      │  drivers (plugins)    │  │
//! │      │  └──────────────────────────┘      └───────────────────────┘  │
//! │  ┌───┴──────────────────────────────┐                                │
//! │  │ Audit pipeline (queue per cluster)│──▶ audit sink                  │
//! │  └──────────────────────────────────┘                                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Units, hierarchy records and driver ports
//! - [`store`]: Transactional hierarchy store
//! - [`drivers`]: Driver registry and built-in drivers
//! - [`reconciler`]: Scrapes, merges, discovery and staleness
//! - [`edits`]: Operator quota and capacity edits
//! - [`audit`]: Audit events and the per-cluster pipeline
//! - [`controlplane`]: Engine, REST API and scheduler
//! - [`error`]: Error types and handling

pub mod audit;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod drivers;
pub mod edits;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditPipeline, Observer, WebhookSink, AUDIT_QUEUE_DEPTH};

pub use config::Configuration;

pub use controlplane::{
    ApiServer, ApiServerConfig, Authorizer, Engine, RestRouter, Scheduler,
    TrustedHeaderAuthorizer,
};

pub use domain::ports::{
    AuditSink, CapacityDriver, DomainDiscoverer, QuotaDriver, RequestContext, Token,
};
pub use domain::units::{InputValue, Unit, ValueWithUnit};

pub use drivers::{ClusterDrivers, DriverFactory};

pub use edits::{DomainReport, QuotaEditor};

pub use error::{Error, ErrorAction, Result};

pub use metrics::EngineMetrics;

pub use reconciler::Reconciler;

pub use store::{wait_for_schema, HierarchyStore, SchemaVersionSource, Transaction};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
