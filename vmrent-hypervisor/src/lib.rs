//! # vmrent Hypervisor
//!
//! Backend abstraction for rented VMs and containers.
//!
//! Every backend is reached through one contract, [`HypervisorClient`]:
//! - **Proxmox-style** - node/VMID addressing, clone or template-file
//!   provisioning, VMs and containers
//! - **vCenter-style** - instance UUID addressing, clone provisioning,
//!   asynchronous tasks polled to completion
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            HypervisorClient Trait           │
//! │  (list_nodes, create_vm, start, snapshots)  │
//! └──────────────────────┬──────────────────────┘
//!                        │
//!         ┌──────────────┼───────────────┐
//!         ▼              ▼               ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ProxmoxAdapter│ │VcenterAdapter│ │ MockBackend  │
//! │ (REST+token) │ │ (VsphereApi) │ │ (in memory)  │
//! └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! Adapters are built by an [`AdapterFactory`]; [`AdapterCache`] keeps one
//! connected adapter per server until it is invalidated.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmrent_hypervisor::{BackendKind, CreateRequest, HypervisorClient, MockBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::demo(BackendKind::Proxmox);
//!     let id = backend.get_next_instance_id().await.unwrap();
//!
//!     let request = CreateRequest::new("pve1", "web-01", "9000", "local-lvm")
//!         .with_id(id)
//!         .with_resources(2, 2048, 20);
//!     let reference = backend.create_vm(&request).await.unwrap();
//!     backend.stop("pve1", &reference).await.unwrap();
//! }
//! ```

pub mod error;
pub mod factory;
pub mod mock;
pub mod poll;
pub mod proxmox;
pub mod retry;
pub mod traits;
pub mod types;
pub mod vcenter;

pub use error::{HypervisorError, Result, TransportError};
pub use factory::{AdapterCache, AdapterFactory, BackendConnector};
pub use mock::{MockBackend, MockConnector};
pub use poll::{TaskPoller, TaskProgress};
pub use proxmox::{HttpProxmoxTransport, ProxmoxAdapter, ProxmoxTransport};
pub use retry::RetryPolicy;
pub use traits::HypervisorClient;
pub use types::*;
pub use vcenter::{RestVsphereApi, VcenterAdapter, VsphereApi};
