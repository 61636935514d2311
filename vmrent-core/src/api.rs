//! Customer-facing operations returning a uniform response envelope.
//!
//! Nothing here returns an error: every outcome, failures included, is an
//! [`ApiResponse`] the portal layer can render directly.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::controller::{PowerAction, VmController};
use crate::error::Result;
use crate::model::VmInstance;

const ACCESS_DENIED: &str = "VM not found or access denied";

/// `{"success": bool, "error"?: string, ...fields}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ApiResponse {
    /// Success carrying the fields of `data` when it is an object.
    pub fn ok(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            success: true,
            error: None,
            data,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: Map::new(),
        }
    }

    fn from_result<T, F>(result: Result<T>, render: F) -> Self
    where
        F: FnOnce(T) -> Value,
    {
        match result {
            Ok(value) => Self::ok(render(value)),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// Lifecycle operations scoped to the calling customer.
pub struct CustomerApi {
    controller: Arc<VmController>,
}

impl CustomerApi {
    pub fn new(controller: Arc<VmController>) -> Self {
        Self { controller }
    }

    /// The instance, if it exists and belongs to `customer_id`.
    async fn owned(&self, customer_id: Uuid, vm_id: Uuid) -> std::result::Result<VmInstance, ApiResponse> {
        match self.controller.instance(vm_id).await {
            Ok(vm) if vm.customer_id == customer_id => Ok(vm),
            Ok(_) => {
                debug!(vm_id = %vm_id, customer_id = %customer_id, "Access to foreign instance refused");
                Err(ApiResponse::failure(ACCESS_DENIED))
            }
            Err(_) => Err(ApiResponse::failure(ACCESS_DENIED)),
        }
    }

    /// Every instance of the customer.
    pub async fn list_vms(&self, customer_id: Uuid) -> ApiResponse {
        let result = self.controller.repository().list_instances().await;
        ApiResponse::from_result(result, |instances| {
            let vms: Vec<Value> = instances
                .iter()
                .filter(|vm| vm.customer_id == customer_id)
                .map(|vm| {
                    json!({
                        "id": vm.id,
                        "name": vm.name,
                        "state": vm.state,
                        "end_date": vm.end_date,
                        "cores": vm.resources.cores,
                        "memory_mib": vm.resources.memory_mib,
                        "disk_gib": vm.resources.disk_gib,
                    })
                })
                .collect();
            json!({ "vms": vms })
        })
    }

    pub async fn provision(&self, customer_id: Uuid, vm_id: Uuid) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.provision(vm_id).await;
        ApiResponse::from_result(result, |outcome| json!(outcome))
    }

    pub async fn start(&self, customer_id: Uuid, vm_id: Uuid) -> ApiResponse {
        self.power(customer_id, vm_id, PowerAction::Start).await
    }

    pub async fn stop(&self, customer_id: Uuid, vm_id: Uuid) -> ApiResponse {
        self.power(customer_id, vm_id, PowerAction::Stop).await
    }

    pub async fn suspend(&self, customer_id: Uuid, vm_id: Uuid) -> ApiResponse {
        self.power(customer_id, vm_id, PowerAction::Suspend).await
    }

    pub async fn reboot(&self, customer_id: Uuid, vm_id: Uuid) -> ApiResponse {
        self.power(customer_id, vm_id, PowerAction::Reboot).await
    }

    async fn power(&self, customer_id: Uuid, vm_id: Uuid, action: PowerAction) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.power(vm_id, action).await;
        ApiResponse::from_result(result, |vm| json!({ "state": vm.state }))
    }

    pub async fn extend(&self, customer_id: Uuid, vm_id: Uuid, months: u32) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.extend(vm_id, months).await;
        ApiResponse::from_result(result, |vm| json!({ "end_date": vm.end_date, "state": vm.state }))
    }

    pub async fn create_snapshot(&self, customer_id: Uuid, vm_id: Uuid, name: &str, description: &str) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.create_snapshot(vm_id, name, description).await;
        ApiResponse::from_result(result, |snapshot| json!({ "snapshot": snapshot.name }))
    }

    pub async fn rollback_snapshot(&self, customer_id: Uuid, vm_id: Uuid, name: &str) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.rollback_snapshot(vm_id, name).await;
        ApiResponse::from_result(result, |()| json!({ "snapshot": name }))
    }

    pub async fn delete_snapshot(&self, customer_id: Uuid, vm_id: Uuid, name: &str) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.delete_snapshot(vm_id, name).await;
        ApiResponse::from_result(result, |()| json!({ "snapshot": name }))
    }

    pub async fn console_url(&self, customer_id: Uuid, vm_id: Uuid) -> ApiResponse {
        if let Err(denied) = self.owned(customer_id, vm_id).await {
            return denied;
        }
        let result = self.controller.console_url(vm_id).await;
        ApiResponse::from_result(result, |url| json!({ "url": url }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_flattens_fields() {
        let response = ApiResponse::ok(json!({"state": "active"}));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"success": true, "state": "active"})
        );

        let response = ApiResponse::failure("boom");
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"success": false, "error": "boom"})
        );
    }
}
