pub mod clock;
pub mod domain;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::Domain;
pub use tracing;

/// Lifecycle notifications broadcast to long-running services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
