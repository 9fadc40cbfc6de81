//! Enrollment across a fleet.
//!
//! Every device is first asked to sign the caller's existing
//! registrations. A device that recognises none of them is eligible and
//! receives the enroll challenge for its protocol version. One that does
//! recognise a registration is already enrolled and fails with
//! `WRONG_DATA`. The first device to return a registration wins.

use crate::coordinator::{
    DeviceStage, FleetError, MultiTokenCoordinator, ProgressNotifier, StageContext,
};
use crate::signer::{DeviceFailure, OperationContext, SignerMode, SignerSuccess};
use crate::token::{Challenge, DeviceId, StatusCode};
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Protocol version of an enroll challenge that does not name one.
pub const LEGACY_VERSION: &str = "U2F_V1";

/// A registration request for one protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollChallenge {
    pub challenge_hash: Vec<u8>,
    pub app_id_hash: Vec<u8>,
    pub version: Option<String>,
}

impl EnrollChallenge {
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(LEGACY_VERSION)
    }
}

fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// A completed registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrollment {
    pub device_id: DeviceId,
    pub version: String,
    #[serde(serialize_with = "hex_bytes")]
    pub registration: Vec<u8>,
}

// ── Stage ────────────────────────────────────────────────────────

/// Performs the enroll write on an eligible device.
#[derive(Debug, Clone, Default)]
pub struct EnrollStage {
    by_version: BTreeMap<String, EnrollChallenge>,
}

impl EnrollStage {
    /// The first challenge given for a version is the one used.
    pub fn new(challenges: Vec<EnrollChallenge>) -> Self {
        let mut by_version = BTreeMap::new();
        for challenge in challenges {
            by_version
                .entry(challenge.version().to_string())
                .or_insert(challenge);
        }
        Self { by_version }
    }

    pub fn challenge_for(&self, version: &str) -> Option<&EnrollChallenge> {
        self.by_version.get(version)
    }
}

#[async_trait]
impl DeviceStage for EnrollStage {
    type Output = Enrollment;

    async fn complete(
        &self,
        success: SignerSuccess,
        ctx: &StageContext,
    ) -> Result<Enrollment, DeviceFailure> {
        let Some(challenge) = self.challenge_for(&success.version) else {
            tracing::warn!(
                device = %success.device_id,
                version = %success.version,
                "No enroll challenge for device version"
            );
            success.close();
            return Err(DeviceFailure::Status(StatusCode::InvalidData));
        };
        tracing::info!(device = %success.device_id, version = %success.version, "Enrolling device");

        loop {
            let answer = success
                .device
                .enroll(&challenge.challenge_hash, &challenge.app_id_hash)
                .await;
            if ctx.cancel.is_cancelled() {
                success.close();
                return Err(DeviceFailure::Closed);
            }
            match answer {
                Ok(registration) => {
                    let enrollment = Enrollment {
                        device_id: success.device_id.clone(),
                        version: success.version.clone(),
                        registration,
                    };
                    success.close();
                    return Ok(enrollment);
                }
                Err(
                    status @ (StatusCode::WaitTouch | StatusCode::Busy | StatusCode::Timeout),
                ) => {
                    ctx.progress.notify(status);
                    if ctx.countdown.expired() {
                        tracing::info!(
                            device = %success.device_id,
                            status = %status,
                            "Enroll timed out"
                        );
                        success.close();
                        return Err(DeviceFailure::Status(status));
                    }
                    if !ctx.pause(ctx.timing.enroll_retry).await {
                        success.close();
                        return Err(DeviceFailure::Closed);
                    }
                }
                Err(status) => {
                    tracing::warn!(
                        device = %success.device_id,
                        status = %status,
                        "Enroll failed"
                    );
                    success.close();
                    return Err(DeviceFailure::Status(status));
                }
            }
        }
    }

    fn release(&self, output: Enrollment) {
        // The write already happened; nothing on the device to undo.
        tracing::warn!(
            device = %output.device_id,
            "Discarding registration from a second device"
        );
    }
}

// ── Coordinator ──────────────────────────────────────────────────

/// Enrolls exactly one device that does not already hold a registration.
pub struct EnrollCoordinator {
    inner: MultiTokenCoordinator<EnrollStage>,
}

impl EnrollCoordinator {
    /// `registered` are sign challenges for the caller's existing
    /// registrations; they form the final challenge set.
    pub fn new(
        ctx: OperationContext,
        enroll: Vec<EnrollChallenge>,
        registered: Vec<Challenge>,
        progress: ProgressNotifier,
    ) -> Self {
        let inner =
            MultiTokenCoordinator::new(ctx, SignerMode::Enroll, EnrollStage::new(enroll), progress);
        inner.add_challenges(registered, true);
        Self { inner }
    }

    pub async fn run(&self) -> Result<Enrollment, FleetError> {
        self.inner.run().await
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn any_devices_found(&self) -> bool {
        self.inner.any_devices_found()
    }
}
