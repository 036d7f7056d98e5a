//! Wipe engine: the state machine that takes one device through
//! preflight, hidden-area neutralization, hardware purge or software
//! overwrite, verification, and finalization, producing a terminal
//! [`WipeLog`].
//!
//! The engine never propagates errors to its caller. Every outcome,
//! including cancellation and fatal device faults, ends in a `WipeLog`
//! whose `success` flag and `errors` array carry the result.

pub mod overwrite;

use crate::patterns::{self, Method};
use crate::platform::{HardwareOutcome, PlatformAdapter, ScopedLock};
use crate::verification::sample_device;
use crate::{CancelToken, Device, EngineConfig, WipeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// States of the wipe lifecycle. Transitions are strictly ordered; any state
/// may fall to `Aborted` (cancel) or `Failed` (non-recoverable error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipeState {
    Idle,
    Preflight,
    DismountLock,
    HiddenAreaScan,
    HardwarePurge,
    SoftwareOverwrite,
    Verify,
    Finalize,
    Done,
    Aborted,
    Failed,
}

/// Accumulated bad-sector statistics for one wipe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BadSectorSummary {
    pub count: u64,
    pub min_offset: Option<u64>,
    pub max_offset: Option<u64>,
}

impl BadSectorSummary {
    fn record(&mut self, offset: u64) {
        self.count += 1;
        self.min_offset = Some(self.min_offset.map_or(offset, |m| m.min(offset)));
        self.max_offset = Some(self.max_offset.map_or(offset, |m| m.max(offset)));
    }
}

/// Append-only record of one wipe. Finalized on the terminal transition and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WipeLog {
    pub device: Device,
    pub method_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_passes: u32,
    pub passes_completed: u32,
    pub hardware_erase_used: bool,
    pub verification_passed: bool,
    pub bad_sectors: BadSectorSummary,
    pub errors: Vec<String>,
    pub duration_seconds: u64,
    pub platform_tag: String,
    pub success: bool,
    pub verification_note: Option<String>,
    pub hidden_area_notes: Vec<String>,
    pub terminal_state: WipeState,
}

impl WipeLog {
    fn begin(device: &Device, method: &Method, platform_tag: String) -> Self {
        Self {
            device: device.clone(),
            method_id: method.id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            total_passes: method.total_passes(),
            passes_completed: 0,
            hardware_erase_used: false,
            verification_passed: false,
            bad_sectors: BadSectorSummary::default(),
            errors: Vec::new(),
            duration_seconds: 0,
            platform_tag,
            success: false,
            verification_note: None,
            hidden_area_notes: Vec::new(),
            terminal_state: WipeState::Idle,
        }
    }

    /// Compliance tags declared by the method that produced this log
    pub fn compliance_standards(&self) -> Vec<String> {
        patterns::method(&self.method_id)
            .map(|m| m.compliance.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default()
    }
}

/// Progress sink: `(percent 0..=100, human message)`. Messages are advisory
/// and never part of the audit trail.
pub type ProgressSink = Box<dyn Fn(f64, &str) + Send + Sync>;

/// Discard-progress sink for headless callers
pub fn null_progress() -> ProgressSink {
    Box::new(|_, _| {})
}

pub struct WipeEngine {
    adapter: Arc<dyn PlatformAdapter>,
    config: EngineConfig,
}

impl WipeEngine {
    pub fn new(adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self::with_config(adapter, EngineConfig::default())
    }

    pub fn with_config(adapter: Arc<dyn PlatformAdapter>, config: EngineConfig) -> Self {
        Self { adapter, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current snapshot of candidate devices
    pub fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        self.adapter.enumerate()
    }

    /// Run the full wipe state machine on `device` with the method named by
    /// `method_id`. Always returns a terminal log; the caller inspects
    /// `success` and `errors`.
    pub fn wipe(
        &self,
        device: &Device,
        method_id: &str,
        cancel: &CancelToken,
        progress: &ProgressSink,
    ) -> WipeLog {
        let Some(method) = patterns::method(method_id) else {
            let now = Utc::now();
            return WipeLog {
                device: device.clone(),
                method_id: method_id.to_string(),
                started_at: now,
                ended_at: Some(now),
                total_passes: 0,
                passes_completed: 0,
                hardware_erase_used: false,
                verification_passed: false,
                bad_sectors: BadSectorSummary::default(),
                errors: vec![format!("unknown method '{method_id}'")],
                duration_seconds: 0,
                platform_tag: self.adapter.platform_tag(),
                success: false,
                verification_note: None,
                hidden_area_notes: Vec::new(),
                terminal_state: WipeState::Failed,
            };
        };

        let mut log = WipeLog::begin(device, method, self.adapter.platform_tag());
        tracing::info!(
            device = %device.path,
            method = method.id,
            passes = method.total_passes(),
            "wipe started"
        );

        match self.run_state_machine(device, method, cancel, progress, &mut log) {
            Ok(()) => self.finalize(&mut log, WipeState::Done, progress),
            Err(WipeError::Cancelled) => {
                log.errors.push("cancelled by operator".to_string());
                self.finalize(&mut log, WipeState::Aborted, progress);
            }
            Err(e) => {
                log.errors.push(e.to_string());
                self.finalize(&mut log, WipeState::Failed, progress);
            }
        }

        log
    }

    fn run_state_machine(
        &self,
        device: &Device,
        method: &Method,
        cancel: &CancelToken,
        progress: &ProgressSink,
        log: &mut WipeLog,
    ) -> Result<(), WipeError> {
        // Preflight: no side effects before this validates
        log.terminal_state = WipeState::Preflight;
        progress(0.0, "preflight checks");
        self.adapter.preflight(device)?;

        if cancel.is_cancelled() {
            return Err(WipeError::Cancelled);
        }

        // DismountLock: a degraded lock is recorded but not fatal
        log.terminal_state = WipeState::DismountLock;
        progress(1.0, "dismounting and locking device");
        let lock: ScopedLock = self.adapter.dismount_and_lock(device)?;
        if let Some(note) = lock.degraded_note() {
            log.errors.push(format!("lock degraded: {note}"));
        }

        // HiddenAreaScan: findings are appended regardless of outcome
        log.terminal_state = WipeState::HiddenAreaScan;
        progress(2.0, "scanning hidden areas");
        match self.adapter.hidden_area_report(device) {
            Ok(report) => log.hidden_area_notes.extend(report.notes),
            Err(e) => log
                .hidden_area_notes
                .push(format!("hidden-area scan failed: {e}")),
        }
        match self.adapter.neutralize_hidden_areas(device) {
            Ok(outcome) => {
                for kind in &outcome.cleared {
                    log.hidden_area_notes.push(format!("{} cleared", kind.as_str()));
                }
                for kind in &outcome.uncleared {
                    log.hidden_area_notes
                        .push(format!("{} could not be cleared", kind.as_str()));
                }
                log.hidden_area_notes.extend(outcome.notes);
            }
            Err(e) => log
                .hidden_area_notes
                .push(format!("hidden-area neutralization failed: {e}")),
        }

        let device_bytes = match self.adapter.device_size(device) {
            Ok(bytes) => bytes,
            Err(e) => {
                log.errors
                    .push(format!("size query failed, using enumerated size: {e}"));
                device.logical_bytes
            }
        };

        if cancel.is_cancelled() {
            return Err(WipeError::Cancelled);
        }

        // HardwarePurge: SSD-class media only; failure falls back to software
        let mut purged = false;
        if device.medium_class.supports_hardware_purge() {
            log.terminal_state = WipeState::HardwarePurge;
            progress(3.0, "attempting hardware purge");
            let timeout = self.purge_timeout(device);
            match self.adapter.try_hardware_purge(device, timeout) {
                HardwareOutcome::Purged => {
                    // The controller-level purge satisfies every pass
                    log.passes_completed = log.total_passes;
                    log.hardware_erase_used = true;
                    purged = true;
                    tracing::info!(device = %device.path, "hardware purge succeeded");
                }
                HardwareOutcome::Unsupported => {
                    tracing::info!(device = %device.path, "hardware purge unsupported");
                }
                HardwareOutcome::Failed(reason) => {
                    log.errors
                        .push(format!("hardware purge failed, falling back: {reason}"));
                }
            }
        }

        if !purged {
            log.terminal_state = WipeState::SoftwareOverwrite;
            self.software_overwrite(device, method, device_bytes, cancel, progress, log)?;
        }

        // Verify only runs after all passes have flushed
        log.terminal_state = WipeState::Verify;
        progress(95.0, "verifying erasure");
        self.verify(device, device_bytes, log);

        Ok(())
    }

    fn software_overwrite(
        &self,
        device: &Device,
        method: &Method,
        device_bytes: u64,
        cancel: &CancelToken,
        progress: &ProgressSink,
        log: &mut WipeLog,
    ) -> Result<(), WipeError> {
        let total = method.total_passes() as u64;
        let mut writer = self.adapter.raw_writer(device)?;

        for (index, descriptor) in method.passes.iter().enumerate() {
            if cancel.is_cancelled() {
                let _ = writer.flush_to_media();
                return Err(WipeError::Cancelled);
            }

            let pass_number = index as u64 + 1;
            progress(
                (index as u64 * 90 / total) as f64 + 4.0,
                &format!(
                    "pass {pass_number}/{total}: {}",
                    descriptor.describe()
                ),
            );

            let outcome = overwrite::run_pass(
                writer.as_mut(),
                descriptor,
                device_bytes,
                &self.config,
                cancel,
                log.bad_sectors.count,
                |offset| {
                    let pass_fraction = offset as f64 / device_bytes.max(1) as f64;
                    let percent =
                        4.0 + ((index as f64 + pass_fraction) / total as f64) * 90.0;
                    progress(
                        percent,
                        &format!(
                            "pass {pass_number}/{total}: {} / {} bytes",
                            offset, device_bytes
                        ),
                    );
                },
            )?;

            for offset in outcome.bad_sector_offsets {
                log.bad_sectors.record(offset);
            }
            log.passes_completed += 1;
            tracing::info!(
                device = %device.path,
                pass = pass_number,
                bad_sectors = log.bad_sectors.count,
                "pass completed"
            );
        }

        Ok(())
    }

    fn verify(&self, device: &Device, device_bytes: u64, log: &mut WipeLog) {
        match self.adapter.raw_reader(device) {
            Ok(mut reader) => {
                match sample_device(
                    reader.as_mut(),
                    device_bytes,
                    device.sector_bytes,
                    &self.config,
                ) {
                    Ok(outcome) => {
                        log.verification_passed = outcome.passed;
                        if !outcome.passed {
                            for finding in &outcome.findings {
                                tracing::warn!(device = %device.path, finding = %finding,
                                    "verification finding");
                            }
                            log.errors.extend(
                                outcome
                                    .findings
                                    .iter()
                                    .map(|f| format!("verification: {f}")),
                            );
                        }
                    }
                    Err(e) => {
                        log.verification_passed = false;
                        log.errors.push(format!("verification read failed: {e}"));
                    }
                }
            }
            Err(e) => {
                log.verification_passed = false;
                log.errors
                    .push(format!("verification could not open device: {e}"));
            }
        }
    }

    fn finalize(&self, log: &mut WipeLog, terminal: WipeState, progress: &ProgressSink) {
        log.terminal_state = WipeState::Finalize;

        // Best-effort TRIM once the overwrite ran to completion
        if terminal == WipeState::Done {
            if let Err(e) = self.adapter.post_wipe_trim(&log.device) {
                log.errors.push(format!("post-wipe trim failed: {e}"));
            }
        }

        let ended = Utc::now();
        log.ended_at = Some(ended);
        log.duration_seconds = (ended - log.started_at).num_seconds().max(0) as u64;

        log.success = terminal == WipeState::Done
            && log.passes_completed == log.total_passes
            && log.total_passes > 0;

        if log.success && !log.verification_passed {
            // All passes completed without critical errors: keep the result
            // but make the lenient outcome auditable
            log.verification_note = Some(
                "verification flagged residual-looking data but all overwrite passes completed"
                    .to_string(),
            );
        }

        log.terminal_state = terminal;
        progress(
            100.0,
            match terminal {
                WipeState::Done => "wipe complete",
                WipeState::Aborted => "wipe cancelled",
                _ => "wipe failed",
            },
        );

        tracing::info!(
            device = %log.device.path,
            state = ?log.terminal_state,
            success = log.success,
            passes = log.passes_completed,
            verification = log.verification_passed,
            "wipe finalized"
        );

        debug_assert!(log.passes_completed <= log.total_passes);
        debug_assert!(!log.success || log.verification_passed || log.verification_note.is_some());
        debug_assert!(!log.hardware_erase_used || log.passes_completed == log.total_passes);
    }

    fn purge_timeout(&self, device: &Device) -> Duration {
        match device.medium_class {
            crate::MediumClass::NvmeSsd => {
                Duration::from_secs(self.config.nvme_format_timeout_secs)
            }
            _ => Duration::from_secs(self.config.ata_erase_timeout_secs),
        }
    }
}
