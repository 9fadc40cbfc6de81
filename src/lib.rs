//! Enrollment and signing coordination for fleets of hardware security keys.
//!
//! Layers, leaves first:
//!
//! - **`token`**: status codes, challenges, deadlines, and the abstract
//!   `TokenFactory`/`DeviceHandle` interfaces
//! - **`signer`**: one device walked through an ordered challenge set
//! - **`coordinator`**: every enumerated device in parallel, one outcome
//! - **`enroll`**: check-then-register flow on top of the coordinator
//! - **`sim`**: scripted in-memory fleet for tests and the CLI
//! - **`config`**: timeouts and retry delays from TOML

pub mod config;
pub mod coordinator;
pub mod enroll;
pub mod signer;
pub mod sim;
pub mod token;

pub use config::{FleetConfig, Timing};
pub use coordinator::{
    DeviceStage, FleetError, MultiTokenCoordinator, Progress, ProgressNotifier, SignStage,
};
pub use enroll::{EnrollChallenge, EnrollCoordinator, Enrollment};
pub use signer::{OperationContext, SignerMode, SignerSuccess, SingleTokenSigner};
pub use token::{
    Challenge, ChallengeSet, Countdown, Deadline, DeviceHandle, DeviceId, KeyHandle, StatusCode,
    TokenFactory,
};
