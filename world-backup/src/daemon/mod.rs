//! Process lifecycle: the backup timer and signal handling.

pub mod scheduler;
pub mod shutdown;

pub use scheduler::Scheduler;
pub use shutdown::ShutdownCoordinator;
