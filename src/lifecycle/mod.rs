//! Container lifecycle: launch strategies, port allocation and the manager
//! that deduplicates starts.

mod launcher;
mod manager;
mod ports;

pub use launcher::{ConfirmedLauncher, ContainerLauncher, OptimisticLauncher};
pub use manager::ContainerLifecycleManager;
pub use ports::free_port;
