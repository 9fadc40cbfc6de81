//! Coordination of many tokens for one operation.

pub mod fleet;
pub mod progress;
pub mod stage;

pub use fleet::{FleetError, MultiTokenCoordinator};
pub use progress::{Progress, ProgressNotifier};
pub use stage::{DeviceStage, SignStage, StageContext};
