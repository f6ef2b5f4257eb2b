pub mod control_plane;
pub mod manager;
pub mod reconciler;

pub use control_plane::{AssignmentResponse, ControlPlane, EnclaveAssignment, HttpControlPlane};
pub use manager::{AssignmentManager, ManagerHandle, ManagerOptions};
pub use reconciler::{Action, Event, Phase, Reconciler, SelectedModel};
