//! TOML description of a simulated fleet and the challenges to run
//! against it.
//!
//! ```toml
//! [[device]]
//! id = "usb-1"
//! version = "U2F_V2"
//! open = ["busy", "ok"]
//! enroll = ["wait_touch", "ok"]
//! [device.sign]
//! "0a0b0c" = ["wrong_data"]
//!
//! [[challenge]]
//! app_id = "https://example.com"
//! challenge = "login-1"
//! key_handle = "0a0b0c"
//!
//! [[enroll]]
//! app_id = "https://example.com"
//! challenge = "register-1"
//! version = "U2F_V2"
//! ```

use super::{SimDevice, SimFleet, DEFAULT_VERSION};
use crate::enroll::EnrollChallenge;
use crate::token::{Challenge, DeviceId, KeyHandle, StatusCode};
use anyhow::Context;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown status `{status}` in script for device {device}")]
    UnknownStatus { device: String, status: String },
    #[error("invalid key handle `{value}`: {source}")]
    KeyHandle {
        value: String,
        #[source]
        source: hex::FromHexError,
    },
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// A simulated device and its scripts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSpec {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub latency_ms: Option<u64>,
    pub appear_after_ms: Option<u64>,
    pub gone_after_ms: Option<u64>,
    #[serde(default)]
    pub open: Vec<String>,
    #[serde(default)]
    pub enroll: Vec<String>,
    pub default_sign: Option<String>,
    /// Hex key handle → statuses answered for it.
    #[serde(default)]
    pub sign: BTreeMap<String, Vec<String>>,
}

/// A sign challenge; hashes are SHA-256 of the given strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChallengeSpec {
    pub app_id: String,
    pub challenge: String,
    pub key_handle: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollSpec {
    pub app_id: String,
    pub challenge: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceSpec>,
    #[serde(default, rename = "challenge")]
    pub challenges: Vec<ChallengeSpec>,
    #[serde(default)]
    pub enroll: Vec<EnrollSpec>,
    /// Explicit enumeration answers (device ids) before the live view takes over.
    #[serde(default)]
    pub enumerations: Vec<Vec<String>>,
}

fn sha256(text: &str) -> Vec<u8> {
    Sha256::digest(text.as_bytes()).to_vec()
}

fn statuses(device: &str, steps: &[String]) -> Result<Vec<StatusCode>, ScenarioError> {
    steps
        .iter()
        .map(|step| {
            StatusCode::parse(step).ok_or_else(|| ScenarioError::UnknownStatus {
                device: device.to_string(),
                status: step.clone(),
            })
        })
        .collect()
}

fn key_handle(value: &str) -> Result<KeyHandle, ScenarioError> {
    KeyHandle::from_hex(value).map_err(|source| ScenarioError::KeyHandle {
        value: value.to_string(),
        source,
    })
}

impl Scenario {
    pub fn from_toml(contents: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn build_fleet(&self) -> Result<SimFleet, ScenarioError> {
        let fleet = SimFleet::new();
        for spec in &self.devices {
            let mut device = SimDevice::new(spec.id.clone()).version(spec.version.clone());
            if let Some(ms) = spec.latency_ms {
                device = device.latency(Duration::from_millis(ms));
            }
            if let Some(ms) = spec.appear_after_ms {
                device = device.appear_after(Duration::from_millis(ms));
            }
            if let Some(ms) = spec.gone_after_ms {
                device = device.gone_after(Duration::from_millis(ms));
            }
            if !spec.open.is_empty() {
                device = device.open_script(statuses(&spec.id, &spec.open)?);
            }
            if !spec.enroll.is_empty() {
                device = device.on_enroll(statuses(&spec.id, &spec.enroll)?);
            }
            if let Some(status) = &spec.default_sign {
                let status = statuses(&spec.id, std::slice::from_ref(status))?;
                device = device.default_sign(status[0]);
            }
            for (handle, steps) in &spec.sign {
                device = device.on_sign(&key_handle(handle)?, statuses(&spec.id, steps)?);
            }
            fleet.plug(device);
        }
        fleet.script_enumerations(self.enumerations.iter().map(|ids| {
            Ok(ids.iter().map(|id| DeviceId::new(id.as_str())).collect())
        }));
        Ok(fleet)
    }

    pub fn sign_challenges(&self) -> Result<Vec<Challenge>, ScenarioError> {
        self.challenges
            .iter()
            .map(|spec| {
                Ok(Challenge {
                    challenge_hash: sha256(&spec.challenge),
                    app_id_hash: sha256(&spec.app_id),
                    key_handle: key_handle(&spec.key_handle)?,
                    version: spec.version.clone(),
                })
            })
            .collect()
    }

    pub fn enroll_challenges(&self) -> Vec<EnrollChallenge> {
        self.enroll
            .iter()
            .map(|spec| EnrollChallenge {
                challenge_hash: sha256(&spec.challenge),
                app_id_hash: sha256(&spec.app_id),
                version: spec.version.clone(),
            })
            .collect()
    }
}
