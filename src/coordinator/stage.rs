//! Work a device does after its signer succeeds.
//!
//! The coordinator runs a [`DeviceStage`] on each signer success before
//! treating the device as the operation's winner. Sign operations use
//! [`SignStage`]; enroll operations use [`crate::enroll::EnrollStage`].

use super::progress::ProgressNotifier;
use crate::config::Timing;
use crate::signer::{DeviceFailure, SignerSuccess};
use crate::token::{Countdown, StatusCode};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-device view of the operation handed to a stage.
#[derive(Clone)]
pub struct StageContext {
    pub countdown: Arc<dyn Countdown>,
    pub timing: Timing,
    /// Cancelled when the operation ends or another device wins.
    pub cancel: CancellationToken,
    pub progress: ProgressNotifier,
}

impl StageContext {
    /// Sleep for `delay` unless cancelled first. Returns false on cancel.
    pub async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[async_trait]
pub trait DeviceStage: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Finish the device's work. Owns the device from here on: it must be
    /// closed on failure, and either closed or moved into the output on
    /// success.
    async fn complete(
        &self,
        success: SignerSuccess,
        ctx: &StageContext,
    ) -> Result<Self::Output, DeviceFailure>;

    /// Dispose of an output that lost the race to another device.
    fn release(&self, output: Self::Output);
}

// ── Sign ─────────────────────────────────────────────────────────

/// Completes sign operations, optionally holding a device that asked for
/// touch until it signs.
#[derive(Debug, Clone, Copy)]
pub struct SignStage {
    await_touch: bool,
}

impl SignStage {
    pub fn new(await_touch: bool) -> Self {
        Self { await_touch }
    }

    pub fn awaits_touch(&self) -> bool {
        self.await_touch
    }

    async fn wait_for_touch(
        &self,
        mut success: SignerSuccess,
        ctx: &StageContext,
    ) -> Result<SignerSuccess, DeviceFailure> {
        let Some(challenge) = success.challenge.clone() else {
            success.close();
            return Err(DeviceFailure::Status(StatusCode::Failed));
        };
        tracing::info!(device = %success.device_id, "Waiting for touch");

        loop {
            ctx.progress.notify(StatusCode::WaitTouch);
            if ctx.countdown.expired() {
                success.close();
                return Err(DeviceFailure::Status(StatusCode::WaitTouch));
            }
            if !ctx.pause(ctx.timing.touch_retry).await {
                success.close();
                return Err(DeviceFailure::Closed);
            }

            let answer = success
                .device
                .sign(
                    &challenge.challenge_hash,
                    &challenge.app_id_hash,
                    &challenge.key_handle,
                    true,
                )
                .await;
            if ctx.cancel.is_cancelled() {
                success.close();
                return Err(DeviceFailure::Closed);
            }
            match answer {
                Ok(signature) => {
                    tracing::info!(device = %success.device_id, "Touch confirmed");
                    success.status = StatusCode::Ok;
                    success.signature = Some(signature);
                    return Ok(success);
                }
                Err(
                    status @ (StatusCode::WaitTouch | StatusCode::Busy | StatusCode::Timeout),
                ) => {
                    tracing::debug!(
                        device = %success.device_id,
                        status = %status,
                        "Still waiting for touch"
                    );
                }
                Err(status) => {
                    tracing::warn!(
                        device = %success.device_id,
                        status = %status,
                        "Device failed while waiting for touch"
                    );
                    success.close();
                    return Err(DeviceFailure::Status(status));
                }
            }
        }
    }
}

#[async_trait]
impl DeviceStage for SignStage {
    type Output = SignerSuccess;

    async fn complete(
        &self,
        success: SignerSuccess,
        ctx: &StageContext,
    ) -> Result<SignerSuccess, DeviceFailure> {
        if success.status == StatusCode::WaitTouch && self.await_touch {
            self.wait_for_touch(success, ctx).await
        } else {
            Ok(success)
        }
    }

    fn release(&self, output: SignerSuccess) {
        tracing::debug!(device = %output.device_id, "Releasing losing device");
        output.close();
    }
}
