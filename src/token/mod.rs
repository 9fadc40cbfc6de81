//! Token primitives: status codes, challenges, deadlines, and the
//! abstract device interfaces the coordination layer drives.

pub mod challenge;
pub mod countdown;
pub mod device;
pub mod status;

pub use challenge::{Challenge, ChallengeFeed, ChallengeSet, FeedView, KeyHandle};
pub use countdown::{Countdown, Deadline, ManualCountdown};
pub use device::{DeviceHandle, DeviceId, TokenFactory};
pub use status::StatusCode;
