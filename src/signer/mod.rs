//! Per-device signers.
//!
//! [`policy`] holds the pure decision table; [`single`] drives one device
//! through it.

pub mod policy;
pub mod single;

pub use policy::{next_step, Position, SignerMode, Step};
pub use single::{
    DeviceFailure, OperationContext, SignerControl, SignerState, SignerSuccess,
    SingleTokenSigner,
};
