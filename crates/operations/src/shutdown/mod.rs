//! Graceful shutdown: termination signals, the components they stop and the
//! order they stop in.

mod components;
mod coordinator;
mod signals;

pub use components::{ShutdownAware, TaskGroup};
pub use coordinator::ShutdownCoordinator;
pub use signals::{ShutdownReason, SignalHandler};
