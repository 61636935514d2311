//! Audit trail of lifecycle operations.
//!
//! The controller reports every lifecycle operation explicitly through an
//! [`AuditSink`]: what ran, against which instance, whether it succeeded,
//! how long it took and any operation-specific metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Maximum number of events kept by [`MemoryAuditSink`]
const DEFAULT_CAPACITY: usize = 1000;

/// Audited lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Provision,
    RetryProvisioning,
    Start,
    Stop,
    Suspend,
    Reboot,
    Extend,
    Terminate,
    Archive,
    CreateSnapshot,
    RollbackSnapshot,
    DeleteSnapshot,
    Console,
    UpdateResources,
    UpdatePlacement,
    RestoreBackup,
    Link,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::Provision => "provision",
            AuditAction::RetryProvisioning => "retry_provisioning",
            AuditAction::Start => "start",
            AuditAction::Stop => "stop",
            AuditAction::Suspend => "suspend",
            AuditAction::Reboot => "reboot",
            AuditAction::Extend => "extend",
            AuditAction::Terminate => "terminate",
            AuditAction::Archive => "archive",
            AuditAction::CreateSnapshot => "create_snapshot",
            AuditAction::RollbackSnapshot => "rollback_snapshot",
            AuditAction::DeleteSnapshot => "delete_snapshot",
            AuditAction::Console => "console",
            AuditAction::UpdateResources => "update_resources",
            AuditAction::UpdatePlacement => "update_placement",
            AuditAction::RestoreBackup => "restore_backup",
            AuditAction::Link => "link",
        };
        write!(f, "{}", s)
    }
}

/// One audited operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub instance_id: Uuid,
    pub action: AuditAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_seconds: f64,
    /// Operation-specific details
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(instance_id: Uuid, action: AuditAction, duration_seconds: f64) -> Self {
        Self {
            instance_id,
            action,
            success: true,
            error_message: None,
            duration_seconds,
            metadata: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Receiver of audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

// =============================================================================
// SINKS
// =============================================================================

/// Writes audit events to the log.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        if event.success {
            info!(
                instance_id = %event.instance_id,
                action = %event.action,
                duration_seconds = event.duration_seconds,
                metadata = %event.metadata,
                "Audit"
            );
        } else {
            warn!(
                instance_id = %event.instance_id,
                action = %event.action,
                duration_seconds = event.duration_seconds,
                error = event.error_message.as_deref().unwrap_or(""),
                "Audit"
            );
        }
    }
}

/// In-memory ring buffer of the most recent audit events.
pub struct MemoryAuditSink {
    events: RwLock<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// All events, newest first.
    pub fn get_all(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| events.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Events of one instance, newest first.
    pub fn for_instance(&self, instance_id: Uuid) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.instance_id == instance_id)
                    .rev()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.write() {
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_buffer_drops_oldest() {
        let sink = MemoryAuditSink::with_capacity(2);
        let vm = Uuid::new_v4();
        sink.record(AuditEvent::new(vm, AuditAction::Start, 0.1)).await;
        sink.record(AuditEvent::new(vm, AuditAction::Stop, 0.1)).await;
        sink.record(AuditEvent::new(vm, AuditAction::Reboot, 0.1)).await;

        let actions: Vec<AuditAction> = sink.get_all().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Reboot, AuditAction::Stop]);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(Uuid::nil(), AuditAction::CreateSnapshot, 1.5)
            .failed("unsupported")
            .with_metadata(serde_json::json!({"snapshot": "pre-upgrade"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "create_snapshot");
        assert_eq!(json["success"], false);
        assert_eq!(json["error_message"], "unsupported");
        assert_eq!(json["metadata"]["snapshot"], "pre-upgrade");
    }
}
