//! Concrete task workflows over the engine.
//!
//! Resource shapes are deliberately narrow; the workflows carry the
//! interesting semantics (fan-out, placement, reservation capacity,
//! thresholds), not the resource schemas.

pub mod compute;
pub mod load_balancer;
pub mod network;
pub mod placement;
pub mod reservation;
pub mod resources;

pub use self::compute::{
    ComputeAllocationTask, ComputeProvisionTask, ComputeRemovalTask,
};
pub use self::load_balancer::{
    LoadBalancerAllocationTask, LoadBalancerProvisionTask, LoadBalancerRemovalTask,
};
pub use self::network::{NetworkAllocationTask, NetworkProvisionTask, NetworkRemovalTask};
pub use self::placement::PlacementSelectionTask;
pub use self::reservation::ReservationTask;
