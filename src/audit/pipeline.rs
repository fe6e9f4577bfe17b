//! Audit Pipeline
//!
//! One bounded queue and one publishing worker per cluster with an audit
//! trail. Events are logged locally before they are queued; a full queue
//! blocks the producer.

use super::event::{AuditEvent, EventParameters, Observer, TargetRenderer, ACTION_UPDATE};
use crate::domain::ports::{AuditSinkRef, RequestContext, Token};
use crate::metrics::EngineMetrics;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of each per-cluster audit queue
pub const AUDIT_QUEUE_DEPTH: usize = 20;

/// Audit state of one cluster
enum ClusterTrail {
    Disabled { silent: bool },
    Enabled {
        silent: bool,
        queue: mpsc::Sender<AuditEvent>,
    },
}

impl ClusterTrail {
    fn silent(&self) -> bool {
        match self {
            ClusterTrail::Disabled { silent } | ClusterTrail::Enabled { silent, .. } => *silent,
        }
    }
}

/// Per-cluster audit trail, constructed once at startup
pub struct AuditPipeline {
    observer: Observer,
    metrics: Arc<EngineMetrics>,
    trails: BTreeMap<String, ClusterTrail>,
}

impl AuditPipeline {
    pub fn new(observer: Observer, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            observer,
            metrics,
            trails: BTreeMap::new(),
        }
    }

    /// Register a cluster without publishing
    pub fn disable_cluster(&mut self, cluster_id: &str, silent: bool) {
        self.trails
            .insert(cluster_id.to_string(), ClusterTrail::Disabled { silent });
    }

    /// Register a cluster and start its publishing worker
    ///
    /// Must be called inside a tokio runtime. The worker runs until the
    /// pipeline is dropped.
    pub fn enable_cluster(&mut self, cluster_id: &str, sink: AuditSinkRef, silent: bool) {
        let (queue, receiver) = mpsc::channel(AUDIT_QUEUE_DEPTH);
        self.metrics.init_audit_counters(cluster_id);

        info!(
            "Starting audit trail for cluster {} with sink {}",
            cluster_id,
            sink.name()
        );
        tokio::spawn(run_worker(
            cluster_id.to_string(),
            receiver,
            sink,
            self.metrics.clone(),
        ));

        self.trails.insert(
            cluster_id.to_string(),
            ClusterTrail::Enabled { silent, queue },
        );
    }

    pub fn is_enabled(&self, cluster_id: &str) -> bool {
        matches!(
            self.trails.get(cluster_id),
            Some(ClusterTrail::Enabled { .. })
        )
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Build an update event for one change
    pub fn event(
        &self,
        request: &RequestContext,
        token: &Token,
        reason_code: u16,
        target: &dyn TargetRenderer,
    ) -> AuditEvent {
        AuditEvent::new(EventParameters {
            time: Utc::now(),
            request,
            token,
            reason_code,
            action: ACTION_UPDATE,
            observer: &self.observer,
            target,
        })
    }

    /// Log an event and queue it for publishing
    ///
    /// Waits while the cluster's queue is full.
    pub async fn emit(&self, cluster_id: &str, event: AuditEvent) {
        let trail = self.trails.get(cluster_id);

        if !trail.is_some_and(ClusterTrail::silent) {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "audit", "{}", json),
                Err(e) => error!("Failed to serialize audit event {}: {}", event.id, e),
            }
        }

        if let Some(ClusterTrail::Enabled { queue, .. }) = trail {
            if queue.send(event).await.is_err() {
                error!("Audit worker for cluster {} is gone, event not queued", cluster_id);
            }
        }
    }

    /// Log and queue several events in order
    pub async fn emit_all(&self, cluster_id: &str, events: Vec<AuditEvent>) {
        for event in events {
            self.emit(cluster_id, event).await;
        }
    }
}

/// Drain one cluster's queue into the sink; failed events are counted, not retried
async fn run_worker(
    cluster_id: String,
    mut receiver: mpsc::Receiver<AuditEvent>,
    sink: AuditSinkRef,
    metrics: Arc<EngineMetrics>,
) {
    while let Some(event) = receiver.recv().await {
        match sink.publish(&event).await {
            Ok(()) => {
                debug!("Published audit event {} for cluster {}", event.id, cluster_id);
                metrics.record_audit_publish(&cluster_id, true);
            }
            Err(e) => {
                warn!(
                    "Failed to publish audit event {} for cluster {}: {}",
                    event.id, cluster_id, e
                );
                metrics.record_audit_publish(&cluster_id, false);
            }
        }
    }
    debug!("Audit worker for cluster {} stopped", cluster_id);
}
