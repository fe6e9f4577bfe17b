//! Audit trail
//!
//! Every accepted or rejected operator change becomes a CADF event that is
//! logged locally and published asynchronously per cluster.

mod event;
mod pipeline;
mod sink;
mod target;

pub use event::{
    Attachment, AuditEvent, EventParameters, Host, Observer, Reason, Resource, TargetRenderer,
    ACTION_UPDATE,
};
pub use pipeline::{AuditPipeline, AUDIT_QUEUE_DEPTH};
pub use sink::WebhookSink;
pub use target::{CapacityEventTarget, QuotaEventTarget};
