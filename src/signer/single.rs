//! Async driver for one token.
//!
//! A [`SingleTokenSigner`] opens its device, fetches the protocol version,
//! then walks the shared challenge set in index order, asking
//! [`policy::next_step`] what each answer means. It ends with exactly one
//! outcome: a [`SignerSuccess`] that owns the still-open device, or a
//! [`DeviceFailure`] after the device has been closed.
//!
//! ```text
//! Init ─▸ Opening ─┬─▸ Busy ─(delay)─▸ Opening
//!                  └─▸ Idle ◂──▸ Signing ─┬─▸ Success ─┐
//!                                         └─▸ Error ───┴─▸ Closing ─▸ Closed
//! ```

use super::policy::{self, Position, SignerMode, Step};
use crate::config::Timing;
use crate::token::{
    Challenge, ChallengeFeed, Countdown, DeviceHandle, DeviceId, KeyHandle, StatusCode,
    TokenFactory,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shortest plausible signature: presence byte, 4-byte counter, and a
/// minimal DER signature. Anything shorter is a malformed answer.
const MIN_SIGNATURE_LEN: usize = 7;

// ── Shared operation context ─────────────────────────────────────

/// Collaborators shared by every signer of one operation.
#[derive(Clone)]
pub struct OperationContext {
    pub factory: Arc<dyn TokenFactory>,
    pub countdown: Arc<dyn Countdown>,
    pub timing: Timing,
}

impl OperationContext {
    pub fn new(
        factory: Arc<dyn TokenFactory>,
        countdown: Arc<dyn Countdown>,
        timing: Timing,
    ) -> Self {
        Self {
            factory,
            countdown,
            timing,
        }
    }
}

// ── States and outcomes ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignerState {
    /// Waiting for the first challenges.
    Init,
    Opening,
    /// Device busy on open; waiting to retry.
    Busy,
    /// Open and versioned; no challenge in flight.
    Idle,
    Signing,
    Success,
    Error,
    Closing,
    Closed,
}

impl SignerState {
    /// States a signer never leaves for a non-terminal one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Closing | Self::Closed
        )
    }
}

/// A device that answered the challenge set favourably.
pub struct SignerSuccess {
    pub device_id: DeviceId,
    /// Still open; the receiver is responsible for closing it.
    pub device: Box<dyn DeviceHandle>,
    /// `Ok` or `WaitTouch` for sign; the last "not mine" answer for enroll.
    pub status: StatusCode,
    pub version: String,
    /// The challenge the device recognised (sign mode).
    pub challenge: Option<Challenge>,
    pub signature: Option<Vec<u8>>,
}

impl SignerSuccess {
    pub fn close(self) {
        self.device.close();
    }
}

impl std::fmt::Debug for SignerSuccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerSuccess")
            .field("device_id", &self.device_id)
            .field("status", &self.status)
            .field("version", &self.version)
            .field("challenge", &self.challenge)
            .field("signature_len", &self.signature.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Why a device produced no usable outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceFailure {
    #[error("device reported {0}")]
    Status(StatusCode),
    #[error("closed before completion")]
    Closed,
}

impl DeviceFailure {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status(status) => *status,
            Self::Closed => StatusCode::Failed,
        }
    }
}

/// Remote control for a running signer.
#[derive(Debug, Clone)]
pub struct SignerControl {
    cancel: CancellationToken,
    state: watch::Receiver<SignerState>,
}

impl SignerControl {
    /// Ask the signer to stop. An in-flight device call is allowed to
    /// finish; the device is then closed. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SignerState {
        *self.state.borrow()
    }

    /// Wait until the signer reaches `Closed`.
    pub async fn closed(&mut self) {
        // Err means the signer was dropped, which also ends it.
        let _ = self
            .state
            .wait_for(|state| *state == SignerState::Closed)
            .await;
    }
}

/// What one challenge trial produced.
struct Trial {
    status: StatusCode,
    challenge: Option<Challenge>,
    signature: Option<Vec<u8>>,
}

impl Trial {
    fn skipped(status: StatusCode, challenge: Option<Challenge>) -> Self {
        Self {
            status,
            challenge,
            signature: None,
        }
    }
}

// ── Signer ───────────────────────────────────────────────────────

/// Drives one token through an ordered, growing challenge set.
pub struct SingleTokenSigner {
    device_id: DeviceId,
    mode: SignerMode,
    ctx: OperationContext,
    feed: ChallengeFeed,
    cancel: CancellationToken,
    state: watch::Sender<SignerState>,
    device: Option<Box<dyn DeviceHandle>>,
    version: Option<String>,
    index: usize,
    /// Key handles this device has already disowned.
    rejected: HashMap<KeyHandle, StatusCode>,
}

impl SingleTokenSigner {
    pub fn new(
        device_id: DeviceId,
        mode: SignerMode,
        ctx: OperationContext,
        feed: ChallengeFeed,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SignerState::Init);
        Self {
            device_id,
            mode,
            ctx,
            feed,
            cancel,
            state,
            device: None,
            version: None,
            index: 0,
            rejected: HashMap::new(),
        }
    }

    pub fn control(&self) -> SignerControl {
        SignerControl {
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn mode(&self) -> SignerMode {
        self.mode
    }

    pub fn state(&self) -> SignerState {
        *self.state.borrow()
    }

    /// Run to completion. Exactly one outcome is returned; on failure the
    /// device has already been closed.
    pub async fn run(mut self) -> Result<SignerSuccess, DeviceFailure> {
        let outcome = self.drive().await;
        match &outcome {
            Ok(success) => {
                tracing::debug!(
                    device = %self.device_id,
                    mode = ?self.mode,
                    status = %success.status,
                    "Signer succeeded"
                );
                self.set_state(SignerState::Success);
            }
            Err(DeviceFailure::Closed) => {
                tracing::debug!(device = %self.device_id, "Signer closed before completion");
            }
            Err(DeviceFailure::Status(status)) => {
                tracing::debug!(
                    device = %self.device_id,
                    mode = ?self.mode,
                    status = %status,
                    "Signer failed"
                );
                self.set_state(SignerState::Error);
            }
        }
        self.close();
        outcome
    }

    /// Close the device (if still owned) and move to `Closed`. Idempotent:
    /// the device's close is invoked at most once.
    pub fn close(&mut self) {
        if self.state() == SignerState::Closed {
            return;
        }
        self.set_state(SignerState::Closing);
        if let Some(device) = self.device.take() {
            device.close();
        }
        self.set_state(SignerState::Closed);
    }

    /// Open the device and fetch its version. Does nothing unless the
    /// signer is still in `Init`.
    pub async fn open(&mut self) -> Result<(), DeviceFailure> {
        if self.state() != SignerState::Init {
            return Ok(());
        }
        loop {
            self.set_state(SignerState::Opening);
            let opened = self
                .ctx
                .factory
                .open(&self.device_id, self.mode.for_enroll())
                .await;
            match opened {
                Ok(device) => {
                    if self.cancel.is_cancelled() {
                        device.close();
                        return Err(DeviceFailure::Closed);
                    }
                    self.device = Some(device);
                    break;
                }
                Err(StatusCode::Busy) => {
                    tracing::debug!(device = %self.device_id, "Device busy on open, retrying");
                    self.set_state(SignerState::Busy);
                    self.back_off(self.ctx.timing.open_retry).await?;
                }
                Err(status) => return Err(DeviceFailure::Status(status)),
            }
        }
        self.fetch_version().await?;
        self.set_state(SignerState::Idle);
        Ok(())
    }

    async fn fetch_version(&mut self) -> Result<(), DeviceFailure> {
        loop {
            let answer = match self.device.as_ref() {
                Some(device) => device.version().await,
                None => return Err(DeviceFailure::Status(StatusCode::Failed)),
            };
            if self.cancel.is_cancelled() {
                return Err(DeviceFailure::Closed);
            }
            match answer {
                Ok(version) => {
                    tracing::debug!(device = %self.device_id, version = %version, "Device opened");
                    self.version = Some(version);
                    return Ok(());
                }
                Err(StatusCode::Busy) => self.back_off(self.ctx.timing.open_retry).await?,
                Err(status) => return Err(DeviceFailure::Status(status)),
            }
        }
    }

    async fn drive(&mut self) -> Result<SignerSuccess, DeviceFailure> {
        while !self.feed.view().started {
            self.wait_for_update().await?;
        }
        self.open().await?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DeviceFailure::Closed);
            }
            // An unresolved outcome at the deadline is indistinguishable from busy.
            if self.ctx.countdown.expired() {
                return Err(DeviceFailure::Status(StatusCode::Busy));
            }

            let trial = self.try_sign(self.index).await?;
            let view = self.feed.view();
            let position = Position {
                index: self.index,
                len: view.len,
                finalized: view.finalized,
            };
            let step = policy::next_step(self.mode, trial.status, position);
            tracing::debug!(
                device = %self.device_id,
                index = self.index,
                status = %trial.status,
                step = ?step,
                "Challenge answered"
            );

            match step {
                Step::Retry => tokio::task::yield_now().await,
                Step::Advance => self.index += 1,
                Step::AwaitMore => {
                    self.index = (self.index + 1).min(view.len);
                    self.await_more().await?;
                }
                Step::Succeed(status) => return self.succeed(status, trial),
                Step::Fail(status) => return Err(DeviceFailure::Status(status)),
            }
        }
    }

    async fn try_sign(&mut self, index: usize) -> Result<Trial, DeviceFailure> {
        let Some(challenge) = self.feed.get(index) else {
            return Ok(Trial::skipped(StatusCode::WrongData, None));
        };
        if let Some(&cached) = self.rejected.get(&challenge.key_handle) {
            return Ok(Trial::skipped(cached, Some(challenge)));
        }
        if let Some(wanted) = &challenge.version {
            if self.version.as_ref() != Some(wanted) {
                return Ok(Trial::skipped(StatusCode::WrongData, Some(challenge)));
            }
        }

        self.set_state(SignerState::Signing);
        let answer = match self.device.as_ref() {
            Some(device) => {
                device
                    .sign(
                        &challenge.challenge_hash,
                        &challenge.app_id_hash,
                        &challenge.key_handle,
                        false,
                    )
                    .await
            }
            None => return Err(DeviceFailure::Status(StatusCode::Failed)),
        };
        if self.cancel.is_cancelled() {
            return Err(DeviceFailure::Closed);
        }

        let (status, signature) = match answer {
            Ok(signature) => {
                if self.mode == SignerMode::Sign && signature.len() < MIN_SIGNATURE_LEN {
                    tracing::warn!(
                        device = %self.device_id,
                        len = signature.len(),
                        "Short response to sign request"
                    );
                    return Err(DeviceFailure::Status(StatusCode::InvalidData));
                }
                (StatusCode::Ok, Some(signature))
            }
            Err(status) => (status, None),
        };
        if status.is_not_mine() {
            self.rejected.insert(challenge.key_handle.clone(), status);
        }
        Ok(Trial {
            status,
            challenge: Some(challenge),
            signature,
        })
    }

    /// Idle until more challenges arrive. A final set with nothing new
    /// leaves nothing to decide on.
    async fn await_more(&mut self) -> Result<(), DeviceFailure> {
        self.set_state(SignerState::Idle);
        loop {
            self.wait_for_update().await?;
            let view = self.feed.view();
            if self.index < view.len {
                return Ok(());
            }
            if view.finalized {
                return Err(DeviceFailure::Status(StatusCode::WrongData));
            }
        }
    }

    async fn wait_for_update(&mut self) -> Result<(), DeviceFailure> {
        if self.ctx.countdown.expired() {
            return Err(DeviceFailure::Status(StatusCode::Busy));
        }
        let remaining = self.ctx.countdown.remaining();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DeviceFailure::Closed),
            _ = tokio::time::sleep(remaining) => Err(DeviceFailure::Status(StatusCode::Busy)),
            _ = self.feed.changed() => Ok(()),
        }
    }

    async fn back_off(&self, delay: Duration) -> Result<(), DeviceFailure> {
        if self.ctx.countdown.expired() {
            return Err(DeviceFailure::Status(StatusCode::Busy));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DeviceFailure::Closed),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn succeed(
        &mut self,
        status: StatusCode,
        trial: Trial,
    ) -> Result<SignerSuccess, DeviceFailure> {
        let device = self
            .device
            .take()
            .ok_or(DeviceFailure::Status(StatusCode::Failed))?;
        Ok(SignerSuccess {
            device_id: self.device_id.clone(),
            device,
            status,
            version: self.version.clone().unwrap_or_default(),
            challenge: trial.challenge,
            signature: trial.signature,
        })
    }

    fn set_state(&self, next: SignerState) {
        self.state.send_if_modified(|state| {
            if *state == next || (state.is_terminal() && !next.is_terminal()) {
                return false;
            }
            *state = next;
            true
        });
    }
}
