//! Application Services
//!
//! - `StateCoordinator`: descriptor store, SOC estimation, notifications
//! - `QuotaManager`: persisted rolling-window API quota

pub mod coordinator;
pub mod quota;

pub use coordinator::{
    CoordinatorConfig, CoordinatorSnapshot, SocCache, StateCoordinator, VehicleSnapshot,
};
pub use quota::{QuotaError, QuotaManager};
