//! Audit trail for relay and import operations
//!
//! Every create, update, delete and conflict along the export/import path is
//! appended as a record against the intent object it was done for. In a cluster
//! the records become Kubernetes Events; in tests they are collected in memory.
//!
//! Recording is fire-and-forget: a failed record is logged and never fails the
//! reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tokio::sync::RwLock;
use tracing::warn;

/// Severity of an audit record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// One entry of the audit trail
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditRecord {
    pub severity: Severity,
    /// Machine-readable reason, see [`reasons`]
    pub reason: &'static str,
    /// What was attempted, see [`actions`]
    pub action: &'static str,
    /// Human-readable subject and outcome
    pub note: String,
}

impl AuditRecord {
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: Severity::Normal,
            reason,
            action,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            reason,
            action,
            note: note.into(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append `record` to the trail of the object referenced by `subject`
    async fn record(&self, subject: &ObjectReference, record: AuditRecord);
}

/// Publishes audit records as Kubernetes Events
pub struct KubeAuditSink {
    client: Client,
    reporter: Reporter,
}

impl KubeAuditSink {
    /// The controller name appears as the reporting component of each Event
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: None,
            },
        }
    }

    /// A recorder is bound to one regarding object
    fn recorder(&self, subject: &ObjectReference) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), subject.clone())
    }
}

#[async_trait]
impl AuditSink for KubeAuditSink {
    async fn record(&self, subject: &ObjectReference, record: AuditRecord) {
        let event = Event {
            type_: match record.severity {
                Severity::Normal => EventType::Normal,
                Severity::Warning => EventType::Warning,
            },
            reason: record.reason.to_string(),
            note: Some(record.note),
            action: record.action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder(subject).publish(event).await {
            warn!(
                reason = record.reason,
                action = record.action,
                error = %e,
                "failed to publish audit event"
            );
        }
    }
}

/// Collects audit records in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<(ObjectReference, AuditRecord)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Records carrying `reason`
    pub async fn with_reason(&self, reason: &str) -> Vec<AuditRecord> {
        self.records()
            .await
            .into_iter()
            .filter(|record| record.reason == reason)
            .collect()
    }

    /// Name of the object each record was filed against, in order
    pub async fn subjects(&self) -> Vec<String> {
        self.records
            .read()
            .await
            .iter()
            .map(|(subject, _)| subject.name.clone().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, subject: &ObjectReference, record: AuditRecord) {
        self.records.write().await.push((subject.clone(), record));
    }
}

/// Well-known reason strings
pub mod reasons {
    pub const RELAY_CREATED: &str = "RelayCreated";
    pub const RELAY_UPDATED: &str = "RelayUpdated";
    pub const RELAY_DELETED: &str = "RelayDeleted";
    /// All relays of an export removed in one bulk delete
    pub const RELAYS_WITHDRAWN: &str = "RelaysWithdrawn";
    pub const RELAY_SYNC_FAILED: &str = "RelaySyncFailed";

    pub const SERVICE_CREATED: &str = "DerivedServiceCreated";
    pub const SERVICE_UPDATED: &str = "DerivedServiceUpdated";
    /// An unmanaged Service already holds the derived name
    pub const SERVICE_CONFLICT: &str = "DerivedServiceConflict";
    /// The import lists no ports, so no Service can be derived
    pub const SERVICE_PORTS_MISSING: &str = "DerivedServicePortsMissing";

    pub const SLICE_CREATED: &str = "DerivedEndpointSliceCreated";
    pub const SLICE_UPDATED: &str = "DerivedEndpointSliceUpdated";
    pub const SLICE_DELETED: &str = "DerivedEndpointSliceDeleted";
    pub const SLICE_SYNC_FAILED: &str = "DerivedEndpointSliceSyncFailed";
    /// A relay template could not be decoded
    pub const TEMPLATE_INVALID: &str = "RelayTemplateInvalid";
}

/// Well-known action strings
pub mod actions {
    pub const CREATE: &str = "Create";
    pub const UPDATE: &str = "Update";
    pub const DELETE: &str = "Delete";
    pub const DECODE: &str = "Decode";
}
