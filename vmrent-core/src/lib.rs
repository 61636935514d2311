//! # vmrent Core
//!
//! Rental lifecycle of VMs and containers on top of
//! [`vmrent_hypervisor`].
//!
//! - [`VmController`] - provisioning, power, rental period, snapshots,
//!   config backups, termination
//! - [`InventorySynchronizer`] - reconciles cached nodes, storages and
//!   templates with a live backend
//! - [`LinkingJob`] - imports instances that already exist on a backend
//! - [`CustomerApi`] - customer-scoped operations returning [`ApiResponse`]
//! - Sweeps - expiry, auto-provisioning, stale cleanup, health checks and
//!   automatic backups
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmrent_core::{MemoryRepository, RentalSettings, TracingAuditSink, VmController};
//! use vmrent_hypervisor::{AdapterCache, BackendConnector};
//!
//! let adapters = Arc::new(AdapterCache::new(Arc::new(BackendConnector::default())));
//! let controller = VmController::new(
//!     Arc::new(MemoryRepository::new()),
//!     adapters,
//!     Arc::new(TracingAuditSink),
//!     RentalSettings::default(),
//! );
//! let outcome = controller.provision(vm_id).await?;
//! ```

pub mod api;
pub mod audit;
pub mod controller;
pub mod error;
pub mod linking;
pub mod model;
pub mod orders;
pub mod repository;
pub mod resources;
pub mod settings;
pub mod sweeps;
pub mod sync;

pub use api::{ApiResponse, CustomerApi};
pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use controller::{PowerAction, ProvisionOutcome, VmController};
pub use error::{RentalError, Result};
pub use linking::LinkReport;
pub use model::*;
pub use orders::{OrderLine, ProductPlacement};
pub use repository::{MemoryRepository, RentalRepository};
pub use resources::{ResourceLimits, ResourcePreset, ResourceSpec, MIN_MEMORY_MIB};
pub use settings::RentalSettings;
pub use sweeps::BatchReport;
pub use sync::{InventorySynchronizer, SyncReport};
