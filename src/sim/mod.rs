//! In-memory token fleet with scripted answers.
//!
//! [`SimFleet`] implements [`TokenFactory`] over a set of [`SimDevice`]s.
//! Each device answers from per-operation scripts (the last entry of a
//! script repeats once the rest is used up), can appear or disappear at
//! a fixed offset from fleet creation, and counts every call it receives
//! so tests can assert on exactly what the coordination layer did.
//!
//! The CLI drives the same fleet from a TOML [`scenario`].

pub mod scenario;

pub use scenario::{Scenario, ScenarioError};

use crate::token::{DeviceHandle, DeviceId, KeyHandle, StatusCode, TokenFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default per-call latency. Non-zero so retry loops advance the clock.
const DEFAULT_LATENCY: Duration = Duration::from_millis(5);

/// Version reported when a script does not set one.
pub const DEFAULT_VERSION: &str = "U2F_V2";

// ── Scripts ──────────────────────────────────────────────────────

/// Sequence of statuses; the last one repeats.
#[derive(Debug, Clone)]
struct Script {
    steps: VecDeque<StatusCode>,
}

impl Script {
    fn new(steps: impl IntoIterator<Item = StatusCode>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    fn next(&mut self, fallback: StatusCode) -> StatusCode {
        match self.steps.len() {
            0 => fallback,
            1 => self.steps[0],
            _ => self.steps.pop_front().unwrap_or(fallback),
        }
    }
}

// ── Device ───────────────────────────────────────────────────────

/// A scripted token.
#[derive(Debug)]
pub struct SimDevice {
    id: DeviceId,
    version: String,
    latency: Duration,
    appear_after: Option<Duration>,
    gone_after: Option<Duration>,
    signature_len: Option<usize>,
    epoch: Mutex<Option<Instant>>,
    unplugged: AtomicBool,
    open_script: Mutex<Script>,
    version_script: Mutex<Script>,
    sign_scripts: Mutex<HashMap<KeyHandle, Script>>,
    default_sign: StatusCode,
    enroll_script: Mutex<Script>,
    stats: Mutex<DeviceStats>,
    open_handles: AtomicUsize,
}

/// Calls observed by a [`SimDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub opens: usize,
    pub version_calls: usize,
    /// Key handles in the order they were presented to `sign`.
    pub sign_calls: Vec<KeyHandle>,
    pub enroll_calls: usize,
    pub close_calls: usize,
}

impl SimDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            version: DEFAULT_VERSION.to_string(),
            latency: DEFAULT_LATENCY,
            appear_after: None,
            gone_after: None,
            signature_len: None,
            epoch: Mutex::new(None),
            unplugged: AtomicBool::new(false),
            open_script: Mutex::new(Script::new([StatusCode::Ok])),
            version_script: Mutex::new(Script::new([StatusCode::Ok])),
            sign_scripts: Mutex::new(HashMap::new()),
            default_sign: StatusCode::WrongData,
            enroll_script: Mutex::new(Script::new([StatusCode::Ok])),
            stats: Mutex::new(DeviceStats::default()),
            open_handles: AtomicUsize::new(0),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Only enumerated (and openable) this long after the fleet was created.
    pub fn appear_after(mut self, delay: Duration) -> Self {
        self.appear_after = Some(delay);
        self
    }

    /// Unplugged this long after the fleet was created.
    pub fn gone_after(mut self, delay: Duration) -> Self {
        self.gone_after = Some(delay);
        self
    }

    pub fn open_script(self, steps: impl IntoIterator<Item = StatusCode>) -> Self {
        *self.open_script.lock() = Script::new(steps);
        self
    }

    pub fn version_script(self, steps: impl IntoIterator<Item = StatusCode>) -> Self {
        *self.version_script.lock() = Script::new(steps);
        self
    }

    /// Answers for `sign` calls carrying `key_handle`.
    pub fn on_sign(
        self,
        key_handle: &KeyHandle,
        steps: impl IntoIterator<Item = StatusCode>,
    ) -> Self {
        self.sign_scripts
            .lock()
            .insert(key_handle.clone(), Script::new(steps));
        self
    }

    /// Answer for key handles without their own script.
    pub fn default_sign(mut self, status: StatusCode) -> Self {
        self.default_sign = status;
        self
    }

    pub fn on_enroll(self, steps: impl IntoIterator<Item = StatusCode>) -> Self {
        *self.enroll_script.lock() = Script::new(steps);
        self
    }

    /// Return signatures of this length instead of a well-formed one.
    pub fn signature_len(mut self, len: usize) -> Self {
        self.signature_len = Some(len);
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Unplug now.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    fn since_epoch(&self) -> Duration {
        match *self.epoch.lock() {
            Some(epoch) => Instant::now().saturating_duration_since(epoch),
            None => Duration::ZERO,
        }
    }

    fn is_present(&self) -> bool {
        if self.unplugged.load(Ordering::SeqCst) {
            return false;
        }
        let elapsed = self.since_epoch();
        let appeared = self.appear_after.map_or(true, |at| elapsed >= at);
        let gone = self.gone_after.is_some_and(|at| elapsed >= at);
        appeared && !gone
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn signature_for(&self, challenge_hash: &[u8], key_handle: &KeyHandle) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(challenge_hash);
        hasher.update(key_handle.as_bytes());
        let mut signature = vec![0x01, 0x00, 0x00, 0x00, 0x01];
        signature.extend_from_slice(&hasher.finalize());
        if let Some(len) = self.signature_len {
            signature.resize(len, 0);
        }
        signature
    }

    fn registration_for(&self, challenge_hash: &[u8], app_id_hash: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_str().as_bytes());
        hasher.update(app_id_hash);
        hasher.update(challenge_hash);
        let mut registration = vec![0x05];
        registration.extend_from_slice(&hasher.finalize());
        registration
    }
}

// ── Handle ───────────────────────────────────────────────────────

struct SimHandle {
    device: Arc<SimDevice>,
    released: AtomicBool,
}

#[async_trait]
impl DeviceHandle for SimHandle {
    fn id(&self) -> &DeviceId {
        &self.device.id
    }

    async fn version(&self) -> Result<String, StatusCode> {
        self.device.delay().await;
        self.device.stats.lock().version_calls += 1;
        if !self.device.is_present() {
            return Err(StatusCode::Gone);
        }
        match self.device.version_script.lock().next(StatusCode::Ok) {
            StatusCode::Ok => Ok(self.device.version.clone()),
            status => Err(status),
        }
    }

    async fn sign(
        &self,
        challenge_hash: &[u8],
        _app_id_hash: &[u8],
        key_handle: &KeyHandle,
        _no_wink: bool,
    ) -> Result<Vec<u8>, StatusCode> {
        self.device.delay().await;
        self.device.stats.lock().sign_calls.push(key_handle.clone());
        if !self.device.is_present() {
            return Err(StatusCode::Gone);
        }
        let status = {
            let mut scripts = self.device.sign_scripts.lock();
            match scripts.get_mut(key_handle) {
                Some(script) => script.next(self.device.default_sign),
                None => self.device.default_sign,
            }
        };
        match status {
            StatusCode::Ok => Ok(self.device.signature_for(challenge_hash, key_handle)),
            status => Err(status),
        }
    }

    async fn enroll(
        &self,
        challenge_hash: &[u8],
        app_id_hash: &[u8],
    ) -> Result<Vec<u8>, StatusCode> {
        self.device.delay().await;
        self.device.stats.lock().enroll_calls += 1;
        if !self.device.is_present() {
            return Err(StatusCode::Gone);
        }
        match self.device.enroll_script.lock().next(StatusCode::Ok) {
            StatusCode::Ok => Ok(self.device.registration_for(challenge_hash, app_id_hash)),
            status => Err(status),
        }
    }

    fn close(&self) {
        self.device.stats.lock().close_calls += 1;
        if !self.released.swap(true, Ordering::SeqCst) {
            self.device.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ── Fleet ────────────────────────────────────────────────────────

/// Scripted [`TokenFactory`].
#[derive(Clone)]
pub struct SimFleet {
    inner: Arc<FleetState>,
}

struct FleetState {
    epoch: Instant,
    devices: Mutex<BTreeMap<DeviceId, Arc<SimDevice>>>,
    enumerations: Mutex<VecDeque<Result<Vec<DeviceId>, StatusCode>>>,
    enumerate_calls: AtomicUsize,
}

impl SimFleet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FleetState {
                epoch: Instant::now(),
                devices: Mutex::new(BTreeMap::new()),
                enumerations: Mutex::new(VecDeque::new()),
                enumerate_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Add a device to the fleet; returns it for inspection.
    pub fn plug(&self, device: SimDevice) -> Arc<SimDevice> {
        *device.epoch.lock() = Some(self.inner.epoch);
        let device = Arc::new(device);
        self.inner
            .devices
            .lock()
            .insert(device.id.clone(), Arc::clone(&device));
        device
    }

    pub fn device(&self, id: &DeviceId) -> Option<Arc<SimDevice>> {
        self.inner.devices.lock().get(id).cloned()
    }

    /// Queue explicit enumeration answers. Once used up, enumeration
    /// reports the devices currently present.
    pub fn script_enumerations(
        &self,
        answers: impl IntoIterator<Item = Result<Vec<DeviceId>, StatusCode>>,
    ) {
        self.inner.enumerations.lock().extend(answers);
    }

    pub fn enumerate_calls(&self) -> usize {
        self.inner.enumerate_calls.load(Ordering::SeqCst)
    }

    /// Handles opened across the fleet and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.inner
            .devices
            .lock()
            .values()
            .map(|device| device.open_handles())
            .sum()
    }
}

impl Default for SimFleet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenFactory for SimFleet {
    async fn enumerate(&self) -> Result<Vec<DeviceId>, StatusCode> {
        self.inner.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(answer) = self.inner.enumerations.lock().pop_front() {
            return answer;
        }
        Ok(self
            .inner
            .devices
            .lock()
            .values()
            .filter(|device| device.is_present())
            .map(|device| device.id.clone())
            .collect())
    }

    async fn open(
        &self,
        id: &DeviceId,
        _for_enroll: bool,
    ) -> Result<Box<dyn DeviceHandle>, StatusCode> {
        let device = self.device(id).ok_or(StatusCode::Gone)?;
        device.delay().await;
        device.stats.lock().opens += 1;
        if !device.is_present() {
            return Err(StatusCode::Gone);
        }
        match device.open_script.lock().next(StatusCode::Ok) {
            StatusCode::Ok => {}
            status => return Err(status),
        }
        device.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimHandle {
            device,
            released: AtomicBool::new(false),
        }))
    }
}
