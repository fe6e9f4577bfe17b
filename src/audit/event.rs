//! CADF audit events
//!
//! Wire shape of the events published to the audit sink. Field names follow
//! the CADF schema consumed by the downstream audit service.

use crate::domain::ports::{RequestContext, Token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const EVENT_TYPE_URI: &str = "http://schemas.dmtf.org/cloud/audit/1.0/event";
pub const INITIATOR_TYPE_URI: &str = "service/security/account/user";
pub const OBSERVER_TYPE_URI: &str = "service/resources";

/// Action verb of every change recorded by the engine
pub const ACTION_UPDATE: &str = "update";

/// Microsecond precision with an explicit UTC offset
const EVENT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

// =============================================================================
// Event
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    pub id: String,
    #[serde(rename = "eventTime")]
    pub event_time: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub action: String,
    pub outcome: String,
    pub reason: Reason,
    pub initiator: Resource,
    pub target: Resource,
    pub observer: Resource,
    #[serde(rename = "requestPath")]
    pub request_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    #[serde(rename = "reasonType")]
    pub reason_type: String,
    #[serde(rename = "reasonCode")]
    pub reason_code: String,
}

/// Initiator, target or observer of an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "typeURI")]
    pub type_uri: String,
    /// JSON document encoded as a string
    pub content: String,
}

// =============================================================================
// Construction
// =============================================================================

/// Renders the target section of an event
pub trait TargetRenderer {
    fn render(&self) -> Resource;
}

/// Identity of this engine instance in the observer section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observer {
    pub name: String,
    /// Generated once per process
    pub id: String,
}

impl Observer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Everything needed to build one event
pub struct EventParameters<'a> {
    pub time: DateTime<Utc>,
    pub request: &'a RequestContext,
    pub token: &'a Token,
    /// HTTP status the triggering request was answered with
    pub reason_code: u16,
    pub action: &'a str,
    pub observer: &'a Observer,
    pub target: &'a dyn TargetRenderer,
}

impl AuditEvent {
    pub fn new(p: EventParameters<'_>) -> Self {
        let outcome = if (200..300).contains(&p.reason_code) {
            "success"
        } else {
            "failure"
        };

        Self {
            type_uri: EVENT_TYPE_URI.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            event_time: p.time.format(EVENT_TIME_FORMAT).to_string(),
            event_type: "activity".to_string(),
            action: p.action.to_string(),
            outcome: outcome.to_string(),
            reason: Reason {
                reason_type: "HTTP".to_string(),
                reason_code: p.reason_code.to_string(),
            },
            initiator: Resource {
                type_uri: INITIATOR_TYPE_URI.to_string(),
                name: p.token.user_name.clone(),
                domain: p.token.user_domain_name.clone(),
                id: p.token.user_id.clone(),
                host: Some(Host {
                    address: strip_port(&p.request.remote_addr),
                    agent: p.request.user_agent.clone(),
                }),
                project_id: p.token.project_id.clone().unwrap_or_default(),
                domain_id: p.token.user_domain_id.clone(),
                ..Default::default()
            },
            target: p.target.render(),
            observer: Resource {
                type_uri: OBSERVER_TYPE_URI.to_string(),
                name: p.observer.name.clone(),
                id: p.observer.id.clone(),
                ..Default::default()
            },
            request_path: p.request.request_path.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == "success"
    }
}

/// Strip the port from `host:port` or `[v6]:port`, leaving other input untouched
fn strip_port(addr: &str) -> String {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    // a bare IPv6 address has more than one colon
    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host.to_string()
        }
        _ => addr.to_string(),
    }
}
