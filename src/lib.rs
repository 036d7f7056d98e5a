// Allow uppercase acronyms for industry-standard terms like HPA, DCO, NVMe
#![allow(clippy::upper_case_acronyms)]

pub mod crypto;
pub mod engine;
pub mod io;
pub mod patterns;
pub mod platform;
pub mod ui;
pub mod verification;

// Re-export the engine entry points for convenience
pub use engine::{WipeEngine, WipeLog};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

// Global flag for handling Ctrl+C interrupts
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set the interrupt flag (called by signal handler)
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Check if an interrupt has been received
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing)
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Cooperative cancellation handle shared between the caller and the wipe
/// worker. The engine polls it between passes and at write-buffer boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True when the caller requested cancellation or a Ctrl+C arrived.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || is_interrupted()
    }
}

/// Error taxonomy for wipe and attestation operations
#[derive(Error, Debug)]
pub enum WipeError {
    #[error("administrative privilege required: {0}")]
    NotPrivileged(String),

    #[error("device missing: {0}")]
    DeviceMissing(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("device is write-protected: {0}")]
    WriteProtected(String),

    #[error("transient I/O failure: {0}")]
    IoTransient(String),

    #[error("medium error at offset {offset}: {reason}")]
    IoMedium { offset: u64, reason: String },

    #[error("fatal I/O failure: {0}")]
    IoFatal(String),

    #[error("hardware erase not supported")]
    HardwareEraseUnsupported,

    #[error("hardware erase failed: {0}")]
    HardwareEraseFailed(String),

    #[error("verification flagged residual data: {0}")]
    VerificationResidual(String),

    #[error("operation cancelled by user")]
    Cancelled,

    #[error("cryptographic operation failed: {0}")]
    CryptoFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WipeError {
    /// Transient errors are retried in place; medium errors are skipped and
    /// recorded. Everything else surfaces to the terminal state.
    pub fn is_transient(&self) -> bool {
        matches!(self, WipeError::IoTransient(_))
    }

    pub fn is_medium(&self) -> bool {
        matches!(self, WipeError::IoMedium { .. })
    }
}

pub type WipeResult<T> = Result<T, WipeError>;

/// Broad class of storage medium, driving the purge strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediumClass {
    RotationalHdd,
    SataSsd,
    NvmeSsd,
    UsbMassStorage,
    EmbeddedFlash,
    Unknown,
}

impl MediumClass {
    /// Hardware purge (ATA security erase / NVMe format) only applies to
    /// solid-state media the controller manages itself.
    pub fn supports_hardware_purge(&self) -> bool {
        matches!(
            self,
            MediumClass::SataSsd | MediumClass::NvmeSsd | MediumClass::EmbeddedFlash
        )
    }

    /// TRIM/discard is meaningful on solid-state media only.
    pub fn is_solid_state(&self) -> bool {
        matches!(
            self,
            MediumClass::SataSsd
                | MediumClass::NvmeSsd
                | MediumClass::EmbeddedFlash
                | MediumClass::UsbMassStorage
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediumClass::RotationalHdd => "rotational_hdd",
            MediumClass::SataSsd => "sata_ssd",
            MediumClass::NvmeSsd => "nvme_ssd",
            MediumClass::UsbMassStorage => "usb_mass_storage",
            MediumClass::EmbeddedFlash => "embedded_flash",
            MediumClass::Unknown => "unknown",
        }
    }
}

/// Immutable description of an enumerated block device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub path: String,
    pub model: String,
    pub serial: String,
    pub interface: String,
    pub medium_class: MediumClass,
    pub logical_bytes: u64,
    pub sector_bytes: u32,
    pub platform_tag: String,
}

impl Device {
    /// Short identity digest: first 8 bytes of
    /// SHA-256("model|serial|size|medium_class|interface|platform_tag|sector_bytes"),
    /// upper-case hex.
    pub fn fingerprint(&self) -> String {
        let identity = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.model,
            self.serial,
            self.logical_bytes,
            self.medium_class.as_str(),
            self.interface,
            self.platform_tag,
            self.sector_bytes
        );
        let digest = Sha256::digest(identity.as_bytes());
        hex::encode_upper(&digest[..8])
    }

    /// Human-readable size for display and the certificate's device block
    pub fn size_human(&self) -> String {
        const GIB: u64 = 1024 * 1024 * 1024;
        const MIB: u64 = 1024 * 1024;
        if self.logical_bytes >= GIB {
            format!("{:.1} GiB", self.logical_bytes as f64 / GIB as f64)
        } else {
            format!("{:.1} MiB", self.logical_bytes as f64 / MIB as f64)
        }
    }
}

/// Tunables for the wipe engine. Defaults follow the documented contract;
/// tests shrink the I/O-volume knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Write buffer size per pass
    pub buffer_bytes: usize,
    /// Flush-to-media interval during overwrite passes
    pub flush_interval_bytes: u64,
    /// Transient-failure retries at the same offset
    pub transient_retries: u32,
    /// Delay between transient retries, milliseconds
    pub transient_retry_delay_ms: u64,
    /// Skip-ahead distance after a medium error
    pub bad_sector_skip_bytes: u64,
    /// Abort once this many bad sectors accumulate
    pub max_bad_sectors: u64,
    /// Failures before this progress fraction indicate a device fault
    pub early_fault_fraction: f64,
    /// ATA security-erase timeout, seconds
    pub ata_erase_timeout_secs: u64,
    /// NVMe format timeout, seconds
    pub nvme_format_timeout_secs: u64,
    /// Verification sample count bounds
    pub verify_min_samples: usize,
    pub verify_max_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 1024 * 1024,
            flush_interval_bytes: 50 * 1024 * 1024,
            transient_retries: 3,
            transient_retry_delay_ms: 250,
            bad_sector_skip_bytes: 512 * 1024,
            max_bad_sectors: 100,
            early_fault_fraction: 0.10,
            ata_erase_timeout_secs: 2 * 3600,
            nvme_format_timeout_secs: 30 * 60,
            verify_min_samples: 5,
            verify_max_samples: 20,
        }
    }
}
