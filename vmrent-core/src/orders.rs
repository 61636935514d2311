//! Instance creation from confirmed order lines.

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::controller::VmController;
use crate::error::Result;
use crate::model::{VmInstance, VmState};
use crate::resources::ResourceSpec;

/// Placement a product provisions onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductPlacement {
    pub server_id: Uuid,
    pub node_id: Option<Uuid>,
    pub storage_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    /// Product is sold with a trial period
    #[serde(default)]
    pub trial: bool,
}

/// One confirmed line of a sales order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Order reference, e.g. `S00042`
    pub order: String,
    /// Line description
    pub line: String,
    pub customer_id: Uuid,
    pub placement: ProductPlacement,
}

impl OrderLine {
    /// Instance name derived from order and line.
    pub fn instance_name(&self) -> String {
        format!("{}-{}", self.order, self.line.trim().replace(' ', "-"))
    }
}

impl VmController {
    /// Create a pending instance for an order line and provision it at once.
    ///
    /// The record is kept when provisioning fails; it is left `failed` for
    /// an operator to retry. Errors are only returned when the record itself
    /// could not be created.
    #[instrument(skip(self, line, resources), fields(order = %line.order, customer_id = %line.customer_id))]
    pub async fn create_from_order(&self, line: &OrderLine, resources: ResourceSpec) -> Result<VmInstance> {
        let placement = &line.placement;
        let mut vm = VmInstance::new(line.instance_name(), line.customer_id, placement.server_id, resources)
            .with_trial(placement.trial);
        vm.node_id = placement.node_id;
        vm.storage_id = placement.storage_id;
        vm.template_id = placement.template_id;
        if let Some(template_id) = placement.template_id {
            if let Some(template) = self.repository().get_template(template_id).await? {
                vm.kind = template.kind;
            }
        }

        let vm = self.create_instance(vm).await?;

        match self.provision(vm.id).await {
            Ok(outcome) => info!(vm_id = %vm.id, reference = %outcome.reference, "Order fulfilled"),
            Err(e) => {
                error!(vm_id = %vm.id, error = %e, "Could not create virtual machine for order");
                // Failures before the backend call leave the record pending.
                let mut current = self.instance(vm.id).await?;
                if current.state == VmState::Pending {
                    current.state = VmState::Failed;
                    current.last_error = Some(e.to_string());
                    self.repository().save_instance(&current).await?;
                }
            }
        }
        self.instance(vm.id).await
    }
}
