//! Fleet-level coordination.
//!
//! ## Design
//!
//! ```text
//!   enumerate ──▸ spawn one task per new device ──▸ JoinSet
//!       ▲                                             │
//!       │ (timer, only while no device is live)       ▼
//!       └──── last device was GONE ◂────── device outcome
//!                                             │
//!                    first success ──▸ cancel others, drain, return
//! ```
//!
//! Each device task runs a [`SingleTokenSigner`] and then the
//! coordinator's [`DeviceStage`]. The coordinator task selects over task
//! completion, the re-enumeration timer and cancellation, and folds the
//! device outcomes into a single result.

use super::progress::ProgressNotifier;
use super::stage::{DeviceStage, SignStage, StageContext};
use crate::signer::{DeviceFailure, OperationContext, SignerMode, SingleTokenSigner};
use crate::token::{Challenge, ChallengeSet, DeviceId, StatusCode};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

/// Why an operation produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    #[error("device enumeration failed: {status}")]
    Enumeration {
        status: StatusCode,
        any_devices_found: bool,
    },
    #[error("no device completed the operation: {status}")]
    Failed {
        status: StatusCode,
        any_devices_found: bool,
    },
    #[error("operation cancelled")]
    Cancelled { any_devices_found: bool },
}

impl FleetError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Enumeration { status, .. } | Self::Failed { status, .. } => *status,
            Self::Cancelled { .. } => StatusCode::Failed,
        }
    }

    pub fn any_devices_found(&self) -> bool {
        match self {
            Self::Enumeration {
                any_devices_found, ..
            }
            | Self::Failed {
                any_devices_found, ..
            }
            | Self::Cancelled { any_devices_found } => *any_devices_found,
        }
    }
}

// ── Outcome bookkeeping ──────────────────────────────────────────

/// Keep the more informative of two statuses.
fn prefer(current: Option<StatusCode>, next: StatusCode) -> StatusCode {
    match (current, next) {
        (Some(current), StatusCode::Gone) => current,
        (Some(current @ (StatusCode::WaitTouch | StatusCode::Timeout)), StatusCode::Busy) => {
            current
        }
        _ => next,
    }
}

#[derive(Debug)]
struct Outcomes {
    last: Option<StatusCode>,
    /// The live set last emptied because a device disappeared (or nothing
    /// was found), not because a device turned the operation down.
    churned: bool,
}

impl Outcomes {
    fn new() -> Self {
        Self {
            last: None,
            churned: true,
        }
    }

    fn record(&mut self, status: StatusCode) {
        self.last = Some(prefer(self.last, status));
        self.churned = status == StatusCode::Gone;
    }

    fn status(&self) -> StatusCode {
        self.last.unwrap_or(StatusCode::Failed)
    }

    /// Status reported when the deadline ends the operation.
    fn status_at_expiry(&self) -> StatusCode {
        match self.last {
            None | Some(StatusCode::Gone) => StatusCode::Timeout,
            Some(status) => status,
        }
    }
}

/// Which device each task drives, and which devices are done for good.
#[derive(Debug, Default)]
struct Roster {
    running: HashMap<task::Id, DeviceId>,
    /// Failed for a reason other than disappearing; never respawned.
    rejected: HashSet<DeviceId>,
}

impl Roster {
    fn admits(&self, id: &DeviceId) -> bool {
        !self.rejected.contains(id) && !self.running.values().any(|running| running == id)
    }

    fn finish(&mut self, task: task::Id) -> Option<DeviceId> {
        self.running.remove(&task)
    }
}

/// What to do once no device task is live.
#[derive(Debug, PartialEq, Eq)]
enum Idle {
    Reenumerate,
    Fail(StatusCode),
}

// ── Coordinator ──────────────────────────────────────────────────

type DeviceOutcome<O> = Result<O, DeviceFailure>;

/// Runs one operation across every connected token.
pub struct MultiTokenCoordinator<S: DeviceStage> {
    ctx: OperationContext,
    mode: SignerMode,
    stage: Arc<S>,
    challenges: ChallengeSet,
    cancel: CancellationToken,
    progress: ProgressNotifier,
}

impl MultiTokenCoordinator<SignStage> {
    /// Coordinator for a sign operation.
    pub fn sign(ctx: OperationContext, await_touch: bool, progress: ProgressNotifier) -> Self {
        Self::new(ctx, SignerMode::Sign, SignStage::new(await_touch), progress)
    }
}

impl<S: DeviceStage> MultiTokenCoordinator<S> {
    pub fn new(
        ctx: OperationContext,
        mode: SignerMode,
        stage: S,
        progress: ProgressNotifier,
    ) -> Self {
        Self {
            ctx,
            mode,
            stage: Arc::new(stage),
            challenges: ChallengeSet::new(),
            cancel: CancellationToken::new(),
            progress,
        }
    }

    pub fn mode(&self) -> SignerMode {
        self.mode
    }

    /// Extend the challenge set seen by every device. Returns false once
    /// the set is final.
    pub fn add_challenges(&self, challenges: Vec<Challenge>, is_final: bool) -> bool {
        self.challenges.add_challenges(challenges, is_final)
    }

    /// Cancel the operation. `run` returns once every device is closed.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn any_devices_found(&self) -> bool {
        self.progress.any_devices_found()
    }

    /// Run until a device succeeds, every device has failed, the deadline
    /// passes, or the operation is closed.
    pub async fn run(&self) -> Result<S::Output, FleetError> {
        let devices = self.cancel.child_token();
        let mut tasks: JoinSet<DeviceOutcome<S::Output>> = JoinSet::new();
        let mut roster = Roster::default();
        let mut outcomes = Outcomes::new();

        tracing::info!(mode = ?self.mode, "Starting operation");
        if let Err(e) = self.enumerate(&devices, &mut tasks, &mut roster).await {
            self.shutdown(&devices, &mut tasks).await;
            return Err(e);
        }

        let mut retry_at = None;
        loop {
            if tasks.is_empty() && retry_at.is_none() {
                match self.when_idle(&outcomes) {
                    Idle::Reenumerate => {
                        let delay = self
                            .ctx
                            .timing
                            .enumerate_retry
                            .min(self.ctx.countdown.remaining());
                        tracing::debug!(
                            delay_ms = delay.as_millis() as u64,
                            "No live device, re-enumerating"
                        );
                        retry_at = Some(tokio::time::Instant::now() + delay);
                    }
                    Idle::Fail(status) => {
                        tracing::info!(status = %status, "Operation failed");
                        return Err(self.failed(status));
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Operation cancelled");
                    self.shutdown(&devices, &mut tasks).await;
                    return Err(FleetError::Cancelled {
                        any_devices_found: self.any_devices_found(),
                    });
                }
                Some(joined) = tasks.join_next_with_id() => {
                    match joined {
                        Ok((task, Ok(output))) => {
                            let id = roster.finish(task);
                            tracing::info!(device = ?id, "Device completed the operation");
                            self.shutdown(&devices, &mut tasks).await;
                            return Ok(output);
                        }
                        Ok((task, Err(failure))) => {
                            let status = failure.status();
                            if let Some(id) = roster.finish(task) {
                                tracing::debug!(
                                    device = %id,
                                    status = %status,
                                    "Device dropped out"
                                );
                                if status != StatusCode::Gone {
                                    roster.rejected.insert(id);
                                }
                            }
                            outcomes.record(status);
                        }
                        Err(e) => {
                            let id = roster.finish(e.id());
                            tracing::warn!(device = ?id, "Device task aborted: {e}");
                            outcomes.record(StatusCode::Failed);
                        }
                    }
                }
                _ = sleep_until(retry_at), if retry_at.is_some() => {
                    retry_at = None;
                    if self.ctx.countdown.expired() {
                        continue;
                    }
                    if let Err(e) = self.enumerate(&devices, &mut tasks, &mut roster).await {
                        self.shutdown(&devices, &mut tasks).await;
                        return Err(e);
                    }
                }
            }
        }
    }

    fn when_idle(&self, outcomes: &Outcomes) -> Idle {
        if self.ctx.countdown.expired() {
            Idle::Fail(outcomes.status_at_expiry())
        } else if outcomes.churned {
            Idle::Reenumerate
        } else {
            Idle::Fail(outcomes.status())
        }
    }

    fn failed(&self, status: StatusCode) -> FleetError {
        FleetError::Failed {
            status,
            any_devices_found: self.any_devices_found(),
        }
    }

    async fn enumerate(
        &self,
        devices: &CancellationToken,
        tasks: &mut JoinSet<DeviceOutcome<S::Output>>,
        roster: &mut Roster,
    ) -> Result<(), FleetError> {
        let found = self
            .ctx
            .factory
            .enumerate()
            .await
            .map_err(|status| {
                tracing::warn!(status = %status, "Enumeration failed");
                FleetError::Enumeration {
                    status,
                    any_devices_found: self.any_devices_found(),
                }
            })?;
        tracing::debug!(count = found.len(), "Enumerated devices");
        if !found.is_empty() {
            self.progress.mark_devices_found();
        }

        for id in found {
            if !roster.admits(&id) {
                continue;
            }
            tracing::info!(device = %id, "Device found");
            let cancel = devices.child_token();
            let signer = SingleTokenSigner::new(
                id.clone(),
                self.mode,
                self.ctx.clone(),
                self.challenges.subscribe(),
                cancel.clone(),
            );
            let stage = Arc::clone(&self.stage);
            let stage_ctx = StageContext {
                countdown: Arc::clone(&self.ctx.countdown),
                timing: self.ctx.timing,
                cancel,
                progress: self.progress.clone(),
            };
            let handle = tasks.spawn(async move {
                run_device(signer, stage.as_ref(), &stage_ctx).await
            });
            roster.running.insert(handle.id(), id);
        }
        Ok(())
    }

    /// Cancel every device and wait for them to close. Late successes are
    /// handed back to the stage.
    async fn shutdown(
        &self,
        devices: &CancellationToken,
        tasks: &mut JoinSet<DeviceOutcome<S::Output>>,
    ) {
        devices.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Ok(output)) = joined {
                self.stage.release(output);
            }
        }
    }
}

async fn run_device<S: DeviceStage>(
    signer: SingleTokenSigner,
    stage: &S,
    ctx: &StageContext,
) -> Result<S::Output, DeviceFailure> {
    let success = signer.run().await?;
    if ctx.cancel.is_cancelled() {
        success.close();
        return Err(DeviceFailure::Closed);
    }
    stage.complete(success, ctx).await
}

async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::coordinator::Progress;
    use crate::sim::{SimDevice, SimFleet};
    use crate::signer::SignerSuccess;
    use crate::token::{Countdown, Deadline, KeyHandle, ManualCountdown};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn key(tag: u8) -> KeyHandle {
        KeyHandle::new(vec![tag; 8])
    }

    fn challenge(tag: u8) -> Challenge {
        Challenge {
            challenge_hash: vec![tag; 32],
            app_id_hash: vec![0xab; 32],
            key_handle: key(tag),
            version: None,
        }
    }

    fn context(fleet: &SimFleet, countdown: Arc<dyn Countdown>) -> OperationContext {
        OperationContext::new(Arc::new(fleet.clone()), countdown, Timing::default())
    }

    fn sign_coordinator(fleet: &SimFleet, timeout: Duration) -> MultiTokenCoordinator<SignStage> {
        let ctx = context(fleet, Arc::new(Deadline::after(timeout)));
        MultiTokenCoordinator::sign(ctx, true, ProgressNotifier::disabled())
    }

    async fn sign(
        coordinator: &MultiTokenCoordinator<SignStage>,
        challenges: Vec<Challenge>,
    ) -> Result<SignerSuccess, FleetError> {
        coordinator.add_challenges(challenges, true);
        coordinator.run().await
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn informative_status_is_preferred() {
        assert_eq!(prefer(None, StatusCode::Gone), StatusCode::Gone);
        assert_eq!(prefer(Some(StatusCode::WrongData), StatusCode::Gone), StatusCode::WrongData);
        assert_eq!(prefer(Some(StatusCode::WaitTouch), StatusCode::Busy), StatusCode::WaitTouch);
        assert_eq!(prefer(Some(StatusCode::Timeout), StatusCode::Busy), StatusCode::Timeout);
        assert_eq!(prefer(Some(StatusCode::Busy), StatusCode::WaitTouch), StatusCode::WaitTouch);
        assert_eq!(prefer(Some(StatusCode::WrongData), StatusCode::Busy), StatusCode::Busy);
    }

    #[test]
    fn expiry_after_only_disappearances_reports_timeout() {
        let mut outcomes = Outcomes::new();
        assert_eq!(outcomes.status_at_expiry(), StatusCode::Timeout);
        assert!(outcomes.churned);
        outcomes.record(StatusCode::Gone);
        assert_eq!(outcomes.status_at_expiry(), StatusCode::Timeout);
        assert!(outcomes.churned);
        outcomes.record(StatusCode::WaitTouch);
        assert_eq!(outcomes.status_at_expiry(), StatusCode::WaitTouch);
        assert!(!outcomes.churned);
    }

    #[tokio::test]
    async fn roster_skips_running_and_rejected_devices() {
        let mut set = JoinSet::new();
        let first = set.spawn(std::future::pending::<()>()).id();
        let mut roster = Roster::default();
        roster.running.insert(first, DeviceId::new("usb-1"));
        roster.rejected.insert(DeviceId::new("usb-2"));

        assert!(!roster.admits(&DeviceId::new("usb-1")));
        assert!(!roster.admits(&DeviceId::new("usb-2")));
        assert!(roster.admits(&DeviceId::new("usb-3")));
        assert_eq!(roster.finish(first), Some(DeviceId::new("usb-1")));
        assert!(roster.admits(&DeviceId::new("usb-1")));
        set.abort_all();
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins_and_others_are_closed() {
        let fleet = SimFleet::new();
        let slow = fleet.plug(
            SimDevice::new("usb-slow")
                .latency(Duration::from_millis(50))
                .default_sign(StatusCode::Ok),
        );
        let fast = fleet.plug(SimDevice::new("usb-fast").on_sign(&key(2), [StatusCode::Ok]));
        let idle = fleet.plug(SimDevice::new("usb-idle"));
        let coordinator = sign_coordinator(&fleet, TIMEOUT);

        let success = sign(&coordinator, vec![challenge(1), challenge(2)]).await.unwrap();
        assert_eq!(success.device_id, DeviceId::new("usb-fast"));
        assert_eq!(success.challenge, Some(challenge(2)));

        // Everything but the winner is closed before run returns.
        assert_eq!(slow.open_handles(), 0);
        assert_eq!(idle.open_handles(), 0);
        assert_eq!(fast.open_handles(), 1);
        success.close();
        assert_eq!(fleet.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_devices_reenumerates_after_delay() {
        let fleet = SimFleet::new();
        fleet.script_enumerations([Ok(Vec::new())]);
        fleet.plug(SimDevice::new("usb-1").default_sign(StatusCode::Ok));
        let coordinator = sign_coordinator(&fleet, TIMEOUT);

        let started = Instant::now();
        let success = sign(&coordinator, vec![challenge(1)]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(fleet.enumerate_calls(), 2);
        assert!(coordinator.any_devices_found());
        success.close();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_devices_until_deadline_times_out() {
        let fleet = SimFleet::new();
        let coordinator = sign_coordinator(&fleet, Duration::from_secs(1));

        let started = Instant::now();
        let err = sign(&coordinator, vec![challenge(1)]).await.unwrap_err();
        assert_eq!(
            err,
            FleetError::Failed {
                status: StatusCode::Timeout,
                any_devices_found: false,
            }
        );
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        // Initial enumeration plus one every 200 ms up to the deadline.
        assert_eq!(fleet.enumerate_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn enumeration_failure_is_fatal() {
        let fleet = SimFleet::new();
        fleet.script_enumerations([Err(StatusCode::Failed)]);
        fleet.plug(SimDevice::new("usb-1").default_sign(StatusCode::Ok));
        let coordinator = sign_coordinator(&fleet, TIMEOUT);

        let err = sign(&coordinator, vec![challenge(1)]).await.unwrap_err();
        assert!(matches!(err, FleetError::Enumeration { .. }));
        assert_eq!(err.status(), StatusCode::Failed);
        assert_eq!(fleet.enumerate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_device_falls_back_to_reenumeration() {
        let fleet = SimFleet::new();
        let lost = fleet.plug(
            SimDevice::new("usb-lost")
                .on_sign(&key(1), [StatusCode::Gone])
                .gone_after(Duration::from_millis(100)),
        );
        let late = fleet.plug(
            SimDevice::new("usb-late")
                .appear_after(Duration::from_millis(500))
                .default_sign(StatusCode::Ok),
        );
        let coordinator = sign_coordinator(&fleet, TIMEOUT);

        let success = sign(&coordinator, vec![challenge(1)]).await.unwrap();
        assert_eq!(success.device_id, DeviceId::new("usb-late"));
        assert!(fleet.enumerate_calls() > 2);
        assert_eq!(lost.stats().close_calls, 1);
        assert_eq!(late.open_handles(), 1);
        success.close();
    }

    #[tokio::test(start_paused = true)]
    async fn gone_device_at_deadline_reports_timeout() {
        let fleet = SimFleet::new();
        fleet.plug(SimDevice::new("usb-1").on_sign(&key(1), [StatusCode::Gone]));
        let coordinator = sign_coordinator(&fleet, Duration::from_secs(1));

        let err = sign(&coordinator, vec![challenge(1)]).await.unwrap_err();
        // The device keeps coming back and vanishing; the deadline decides.
        assert_eq!(err.status(), StatusCode::Timeout);
        assert!(err.any_devices_found());
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_failures_end_the_operation() {
        let fleet = SimFleet::new();
        fleet.plug(SimDevice::new("usb-1"));
        fleet.plug(SimDevice::new("usb-2"));
        let coordinator = sign_coordinator(&fleet, TIMEOUT);

        let started = Instant::now();
        let err = sign(&coordinator, vec![challenge(1)]).await.unwrap_err();
        assert_eq!(
            err,
            FleetError::Failed {
                status: StatusCode::WrongData,
                any_devices_found: true,
            }
        );
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(fleet.enumerate_calls(), 1);
        assert_eq!(fleet.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_does_not_mask_earlier_failure() {
        let fleet = SimFleet::new();
        fleet.plug(
            SimDevice::new("usb-1")
                .latency(Duration::from_millis(1))
                .on_sign(&key(1), [StatusCode::Other(0x6d00)]),
        );
        fleet.plug(
            SimDevice::new("usb-2")
                .latency(Duration::from_millis(20))
                .on_sign(&key(1), [StatusCode::Gone]),
        );
        let coordinator = sign_coordinator(&fleet, Duration::from_secs(2));

        // usb-2 keeps vanishing, so the deadline ends the operation.
        let err = sign(&coordinator, vec![challenge(1)]).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::Other(0x6d00));
    }

    #[tokio::test(start_paused = true)]
    async fn last_device_gone_reenumerates_past_rejecting_devices() {
        let fleet = SimFleet::new();
        let rejecting = fleet.plug(SimDevice::new("usb-a"));
        fleet.plug(
            SimDevice::new("usb-b")
                .on_sign(&key(1), [StatusCode::Busy])
                .gone_after(Duration::from_millis(100)),
        );
        fleet.plug(
            SimDevice::new("usb-c")
                .appear_after(Duration::from_millis(400))
                .default_sign(StatusCode::Ok),
        );
        let coordinator = sign_coordinator(&fleet, TIMEOUT);

        let success = sign(&coordinator, vec![challenge(1)]).await.unwrap();
        assert_eq!(success.device_id, DeviceId::new("usb-c"));
        assert!(fleet.enumerate_calls() > 2);
        // A device that turned the operation down is not tried again.
        assert_eq!(rejecting.stats().opens, 1);
        success.close();
    }

    /// Sign stage whose first completion panics.
    struct CrashOnceStage {
        crashed: AtomicBool,
    }

    #[async_trait]
    impl DeviceStage for CrashOnceStage {
        type Output = SignerSuccess;

        async fn complete(
            &self,
            success: SignerSuccess,
            ctx: &StageContext,
        ) -> Result<SignerSuccess, DeviceFailure> {
            if !self.crashed.swap(true, Ordering::SeqCst) {
                success.close();
                panic!("stage crashed");
            }
            SignStage::new(true).complete(success, ctx).await
        }

        fn release(&self, output: SignerSuccess) {
            output.close();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_device_task_can_be_respawned() {
        let fleet = SimFleet::new();
        let crashing = fleet.plug(
            SimDevice::new("usb-1")
                .latency(Duration::from_millis(1))
                .default_sign(StatusCode::Ok),
        );
        fleet.plug(
            SimDevice::new("usb-2")
                .latency(Duration::from_millis(20))
                .on_sign(&key(1), [StatusCode::Gone]),
        );
        let ctx = context(&fleet, Arc::new(Deadline::after(TIMEOUT)));
        let stage = CrashOnceStage {
            crashed: AtomicBool::new(false),
        };
        let coordinator =
            MultiTokenCoordinator::new(ctx, SignerMode::Sign, stage, ProgressNotifier::disabled());
        coordinator.add_challenges(vec![challenge(1)], true);

        let success = coordinator.run().await.unwrap();
        assert_eq!(success.device_id, DeviceId::new("usb-1"));
        assert_eq!(crashing.stats().opens, 2);
        success.close();
    }

    #[tokio::test(start_paused = true)]
    async fn touch_pending_device_keeps_operation_alive() {
        let fleet = SimFleet::new();
        fleet.plug(
            SimDevice::new("usb-touch").on_sign(
                &key(1),
                [
                    StatusCode::WaitTouch,
                    StatusCode::WaitTouch,
                    StatusCode::WaitTouch,
                    StatusCode::Ok,
                ],
            ),
        );
        fleet.plug(SimDevice::new("usb-other").on_sign(&key(1), [StatusCode::Gone]));
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = context(&fleet, Arc::new(Deadline::after(TIMEOUT)));
        let coordinator = MultiTokenCoordinator::sign(ctx, true, ProgressNotifier::new(tx));

        let success = sign(&coordinator, vec![challenge(1)]).await.unwrap();
        assert_eq!(success.device_id, DeviceId::new("usb-touch"));
        assert_eq!(success.status, StatusCode::Ok);
        assert!(success.signature.is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            Progress {
                status: StatusCode::WaitTouch,
                any_devices_found: true,
            }
        );
        success.close();
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_and_closes_every_device() {
        let fleet = SimFleet::new();
        let first = fleet.plug(SimDevice::new("usb-1"));
        let second = fleet.plug(SimDevice::new("usb-2").latency(Duration::from_millis(100)));
        let ctx = context(&fleet, Arc::new(ManualCountdown::new()));
        let coordinator = MultiTokenCoordinator::sign(ctx, true, ProgressNotifier::disabled());
        coordinator.add_challenges(vec![challenge(1)], false);

        let (result, ()) = tokio::join!(coordinator.run(), async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            coordinator.close();
        });
        assert_eq!(
            result.unwrap_err(),
            FleetError::Cancelled {
                any_devices_found: true,
            }
        );
        assert_eq!(first.stats().close_calls, 1);
        assert_eq!(second.stats().close_calls, 1);
        assert_eq!(fleet.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn challenges_added_while_running_reach_every_device() {
        let fleet = SimFleet::new();
        fleet.plug(SimDevice::new("usb-1"));
        fleet.plug(SimDevice::new("usb-2").on_sign(&key(3), [StatusCode::Ok]));
        let coordinator = sign_coordinator(&fleet, TIMEOUT);
        coordinator.add_challenges(vec![challenge(1)], false);

        let (result, ()) = tokio::join!(coordinator.run(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(coordinator.add_challenges(vec![challenge(2), challenge(3)], true));
        });
        let success = result.unwrap();
        assert_eq!(success.device_id, DeviceId::new("usb-2"));
        assert_eq!(success.challenge, Some(challenge(3)));
        assert!(!coordinator.add_challenges(vec![challenge(4)], true));
        success.close();
    }

    #[tokio::test(start_paused = true)]
    async fn live_device_suppresses_reenumeration() {
        let fleet = SimFleet::new();
        let steady = fleet.plug(
            SimDevice::new("usb-steady")
                .on_sign(&key(1), [StatusCode::Busy, StatusCode::Busy, StatusCode::WrongData]),
        );
        let ctx = context(&fleet, Arc::new(ManualCountdown::new()));
        let coordinator = MultiTokenCoordinator::sign(ctx, true, ProgressNotifier::disabled());
        coordinator.add_challenges(vec![challenge(1)], false);

        let (result, ()) = tokio::join!(coordinator.run(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            coordinator.close();
        });
        assert!(matches!(result, Err(FleetError::Cancelled { .. })));
        assert_eq!(steady.stats().opens, 1);
        assert_eq!(fleet.enumerate_calls(), 1);
    }
}
