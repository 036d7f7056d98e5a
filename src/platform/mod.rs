//! Platform adapter: the one place OS-specific device access lives.
//!
//! The wipe engine is parameterized by [`PlatformAdapter`], so the same state
//! machine runs against the native backend and against fully simulated
//! devices in tests.

#[cfg(target_os = "linux")]
pub mod linux;

use crate::io::{RawReader, RawWriter};
use crate::{Device, WipeResult};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a hardware purge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareOutcome {
    /// The controller erased all user data; no software passes needed
    Purged,
    /// The device or transport has no purge primitive; not an error
    Unsupported,
    /// The primitive exists but the attempt failed (includes timeouts)
    Failed(String),
}

/// One hidden region reported by the controller
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HiddenRegion {
    pub kind: HiddenRegionKind,
    pub hidden_sectors: u64,
    pub hidden_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenRegionKind {
    HostProtectedArea,
    DeviceConfigurationOverlay,
    ControllerReserved,
}

impl HiddenRegionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HiddenRegionKind::HostProtectedArea => "HPA",
            HiddenRegionKind::DeviceConfigurationOverlay => "DCO",
            HiddenRegionKind::ControllerReserved => "controller-reserved",
        }
    }
}

/// Pre-neutralization scan result
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HiddenAreaInfo {
    pub regions: Vec<HiddenRegion>,
    pub notes: Vec<String>,
}

impl HiddenAreaInfo {
    pub fn is_clean(&self) -> bool {
        self.regions.is_empty()
    }
}

/// What neutralization achieved. Inability to clear is reported, never fatal.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HiddenAreaOutcome {
    pub cleared: Vec<HiddenRegionKind>,
    pub uncleared: Vec<HiddenRegionKind>,
    pub notes: Vec<String>,
}

/// Exclusive hold on a device for the duration of a wipe.
///
/// Dismounted partitions and the raw-device lock are released when this guard
/// drops, on every exit path including panics and cancellation.
pub struct ScopedLock {
    device_path: String,
    release: Option<Box<dyn FnOnce() + Send>>,
    degraded_note: Option<String>,
}

impl ScopedLock {
    pub fn new(device_path: impl Into<String>, release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            device_path: device_path.into(),
            release: Some(release),
            degraded_note: None,
        }
    }

    /// A lock that acquired a writable handle but not full exclusivity.
    /// The note lands in the wipe log.
    pub fn degraded(
        device_path: impl Into<String>,
        release: Box<dyn FnOnce() + Send>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            release: Some(release),
            degraded_note: Some(note.into()),
        }
    }

    pub fn degraded_note(&self) -> Option<&str> {
        self.degraded_note.as_deref()
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!(device = %self.device_path, "device lock released");
        }
    }
}

/// Uniform, OS-independent device surface consumed by the wipe engine
pub trait PlatformAdapter: Send + Sync {
    /// Short identifier recorded in logs and certificates ("linux", "sim")
    fn platform_tag(&self) -> String;

    /// Snapshot of fixed and removable block devices. Individual device
    /// failures are dropped with a diagnostic; only catastrophic OS errors
    /// fail the call.
    fn enumerate(&self) -> anyhow::Result<Vec<Device>>;

    /// Validate privilege, reachability, and that no partition is held
    fn preflight(&self, device: &Device) -> WipeResult<()>;

    /// Dismount all partitions and take an exclusive lock on the raw device
    fn dismount_and_lock(&self, device: &Device) -> WipeResult<ScopedLock>;

    fn raw_writer(&self, device: &Device) -> WipeResult<Box<dyn RawWriter>>;

    fn raw_reader(&self, device: &Device) -> WipeResult<Box<dyn RawReader>>;

    /// Authoritative device length in bytes
    fn device_size(&self, device: &Device) -> WipeResult<u64>;

    fn hidden_area_report(&self, device: &Device) -> WipeResult<HiddenAreaInfo>;

    fn neutralize_hidden_areas(&self, device: &Device) -> WipeResult<HiddenAreaOutcome>;

    /// ATA Security Erase / NVMe Format, bounded by `timeout`
    fn try_hardware_purge(&self, device: &Device, timeout: Duration) -> HardwareOutcome;

    /// Whole-device discard on solid-state media; no-op elsewhere
    fn post_wipe_trim(&self, device: &Device) -> WipeResult<()>;
}

/// The native adapter for the running OS
#[cfg(target_os = "linux")]
pub fn native() -> Arc<dyn PlatformAdapter> {
    Arc::new(linux::LinuxAdapter::new())
}
