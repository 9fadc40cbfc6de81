//! Per-answer decision table for a single signer.
//!
//! [`next_step`] is a pure function of the signer mode, the status the
//! device gave for one challenge, and where that challenge sits in the
//! set. The async driver in [`super::single`] performs the I/O and asks
//! this table what to do next.

use crate::token::StatusCode;
use serde::{Deserialize, Serialize};

/// What the signer is trying to prove about its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerMode {
    /// Find a challenge this device can sign.
    Sign,
    /// Prove the device holds none of the challenges, so it can be
    /// enrolled without creating a duplicate credential.
    Enroll,
}

impl SignerMode {
    pub fn for_enroll(self) -> bool {
        matches!(self, Self::Enroll)
    }
}

/// Where the answered challenge sits in the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub index: usize,
    pub len: usize,
    pub finalized: bool,
}

impl Position {
    fn has_next(&self) -> bool {
        self.index + 1 < self.len
    }
}

/// Next move for the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Ask the same challenge again.
    Retry,
    /// Move to the next challenge, which exists.
    Advance,
    /// Nothing left to try yet; wait for more challenges.
    AwaitMore,
    /// Terminal success, reported with this status.
    Succeed(StatusCode),
    /// Terminal failure with this status.
    Fail(StatusCode),
}

/// Decide what follows `status` for the challenge at `position`.
///
/// An index past the end of the set is answered as `WrongData` by the
/// caller, so running out of challenges follows the same branch as a
/// device saying "not mine".
pub fn next_step(mode: SignerMode, status: StatusCode, position: Position) -> Step {
    match status {
        StatusCode::Gone => Step::Fail(status),
        StatusCode::Timeout | StatusCode::Busy => Step::Retry,
        // A device that recognises an enroll challenge is already enrolled.
        StatusCode::Ok | StatusCode::WaitTouch => match mode {
            SignerMode::Sign => Step::Succeed(status),
            SignerMode::Enroll => Step::Fail(StatusCode::WrongData),
        },
        status if status.is_not_mine() => {
            if position.has_next() {
                Step::Advance
            } else if !position.finalized {
                Step::AwaitMore
            } else {
                match mode {
                    SignerMode::Enroll => Step::Succeed(status),
                    SignerMode::Sign => Step::Fail(status),
                }
            }
        }
        other => match mode {
            SignerMode::Enroll => Step::Fail(other),
            SignerMode::Sign if position.has_next() => Step::Advance,
            SignerMode::Sign if !position.finalized => Step::AwaitMore,
            SignerMode::Sign => Step::Fail(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(index: usize, len: usize, finalized: bool) -> Position {
        Position {
            index,
            len,
            finalized,
        }
    }

    #[test]
    fn gone_is_fatal_in_both_modes() {
        for mode in [SignerMode::Sign, SignerMode::Enroll] {
            assert_eq!(
                next_step(mode, StatusCode::Gone, at(0, 3, false)),
                Step::Fail(StatusCode::Gone)
            );
        }
    }

    #[test]
    fn busy_and_timeout_retry_same_challenge() {
        for status in [StatusCode::Busy, StatusCode::Timeout] {
            assert_eq!(next_step(SignerMode::Sign, status, at(2, 3, true)), Step::Retry);
            assert_eq!(next_step(SignerMode::Enroll, status, at(0, 1, true)), Step::Retry);
        }
    }

    #[test]
    fn recognised_challenge_succeeds_sign_and_fails_enroll() {
        for status in [StatusCode::Ok, StatusCode::WaitTouch] {
            assert_eq!(
                next_step(SignerMode::Sign, status, at(0, 2, false)),
                Step::Succeed(status)
            );
            assert_eq!(
                next_step(SignerMode::Enroll, status, at(0, 2, false)),
                Step::Fail(StatusCode::WrongData)
            );
        }
    }

    #[test]
    fn wrong_data_advances_while_challenges_remain() {
        for mode in [SignerMode::Sign, SignerMode::Enroll] {
            assert_eq!(
                next_step(mode, StatusCode::WrongData, at(0, 2, true)),
                Step::Advance
            );
            assert_eq!(
                next_step(mode, StatusCode::WrongLength, at(0, 2, false)),
                Step::Advance
            );
        }
    }

    #[test]
    fn wrong_data_on_last_open_challenge_waits() {
        for mode in [SignerMode::Sign, SignerMode::Enroll] {
            assert_eq!(
                next_step(mode, StatusCode::WrongData, at(1, 2, false)),
                Step::AwaitMore
            );
        }
    }

    #[test]
    fn exhausted_final_set_splits_by_mode() {
        assert_eq!(
            next_step(SignerMode::Enroll, StatusCode::WrongData, at(1, 2, true)),
            Step::Succeed(StatusCode::WrongData)
        );
        assert_eq!(
            next_step(SignerMode::Sign, StatusCode::WrongData, at(1, 2, true)),
            Step::Fail(StatusCode::WrongData)
        );
    }

    #[test]
    fn past_the_end_of_an_empty_final_set() {
        // No existing registrations: nothing to check, device is eligible.
        assert_eq!(
            next_step(SignerMode::Enroll, StatusCode::WrongData, at(0, 0, true)),
            Step::Succeed(StatusCode::WrongData)
        );
        assert_eq!(
            next_step(SignerMode::Sign, StatusCode::WrongData, at(0, 0, false)),
            Step::AwaitMore
        );
    }

    #[test]
    fn unknown_status_is_fatal_for_enroll_only() {
        let odd = StatusCode::Other(0x6d00);
        assert_eq!(next_step(SignerMode::Enroll, odd, at(0, 3, false)), Step::Fail(odd));
        assert_eq!(next_step(SignerMode::Sign, odd, at(0, 3, false)), Step::Advance);
        assert_eq!(next_step(SignerMode::Sign, odd, at(2, 3, false)), Step::AwaitMore);
        assert_eq!(next_step(SignerMode::Sign, odd, at(2, 3, true)), Step::Fail(odd));
    }

    #[test]
    fn invalid_data_follows_the_unknown_branch() {
        assert_eq!(
            next_step(SignerMode::Sign, StatusCode::InvalidData, at(0, 2, true)),
            Step::Advance
        );
        assert_eq!(
            next_step(SignerMode::Enroll, StatusCode::InvalidData, at(0, 2, true)),
            Step::Fail(StatusCode::InvalidData)
        );
    }
}
