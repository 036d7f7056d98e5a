//! In-memory simulated platform backend.
//!
//! Implements the full platform capability surface over byte vectors so the
//! wipe state machine can be exercised end to end: per-pass medium-error
//! injection, permission loss at an offset, cancellation after a byte count,
//! scripted hardware-purge outcomes, and lock-state introspection.

use ewsafe_wipe::io::{RawReader, RawWriter};
use ewsafe_wipe::platform::{
    HardwareOutcome, HiddenAreaInfo, HiddenAreaOutcome, PlatformAdapter, ScopedLock,
};
use ewsafe_wipe::{CancelToken, Device, MediumClass, WipeError, WipeResult};
use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fault script for one simulated disk
#[derive(Default, Clone)]
pub struct FaultPlan {
    /// Offsets that fail with a medium error once per pass
    pub medium_error_offsets: Vec<u64>,
    /// Offset at which the writer loses permission (fatal)
    pub permission_loss_at: Option<u64>,
    /// Cancel this token once the writer has accepted this many bytes
    pub cancel_after: Option<(u64, CancelToken)>,
    /// Writes covering sector 0 silently leave it untouched
    pub skip_first_sector: bool,
}

struct SimDisk {
    data: Arc<Mutex<Vec<u8>>>,
    device: Device,
    faults: FaultPlan,
    locked: Arc<AtomicBool>,
    purge: HardwareOutcome,
    trimmed: Arc<AtomicBool>,
}

/// Simulated platform adapter holding any number of disks
#[derive(Default)]
pub struct SimAdapter {
    disks: Mutex<HashMap<String, Arc<SimDisk>>>,
}

impl SimAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a disk filled with `fill` and return its device descriptor
    pub fn add_device(&self, name: &str, size: u64, medium_class: MediumClass, fill: u8) -> Device {
        let path = format!("/dev/sim/{name}");
        let device = Device {
            path: path.clone(),
            model: format!("SimDisk {name}"),
            serial: format!("SIM-{name}"),
            interface: match medium_class {
                MediumClass::NvmeSsd => "nvme",
                MediumClass::UsbMassStorage => "usb",
                MediumClass::EmbeddedFlash => "mmc",
                _ => "sata",
            }
            .to_string(),
            medium_class,
            logical_bytes: size,
            sector_bytes: 512,
            platform_tag: "sim".to_string(),
        };

        let disk = Arc::new(SimDisk {
            data: Arc::new(Mutex::new(vec![fill; size as usize])),
            device: device.clone(),
            faults: FaultPlan::default(),
            locked: Arc::new(AtomicBool::new(false)),
            purge: HardwareOutcome::Unsupported,
            trimmed: Arc::new(AtomicBool::new(false)),
        });
        self.disks.lock().unwrap().insert(path, disk);
        device
    }

    fn disk(&self, path: &str) -> Arc<SimDisk> {
        self.disks
            .lock()
            .unwrap()
            .get(path)
            .expect("unknown simulated device")
            .clone()
    }

    fn update_disk(&self, path: &str, f: impl FnOnce(&mut SimDisk)) {
        let mut disks = self.disks.lock().unwrap();
        let disk = disks.get_mut(path).expect("unknown simulated device");
        let inner = Arc::get_mut(disk).expect("disk is in use; configure before wiping");
        f(inner);
    }

    pub fn set_faults(&self, path: &str, faults: FaultPlan) {
        self.update_disk(path, |d| d.faults = faults);
    }

    pub fn set_purge_outcome(&self, path: &str, outcome: HardwareOutcome) {
        self.update_disk(path, |d| d.purge = outcome);
    }

    /// Write raw bytes into the backing store (test preloading)
    pub fn preload(&self, path: &str, offset: u64, bytes: &[u8]) {
        let disk = self.disk(path);
        let mut data = disk.data.lock().unwrap();
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn contents(&self, path: &str) -> Vec<u8> {
        self.disk(path).data.lock().unwrap().clone()
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.disk(path).locked.load(Ordering::SeqCst)
    }

    pub fn was_trimmed(&self, path: &str) -> bool {
        self.disk(path).trimmed.load(Ordering::SeqCst)
    }
}

impl PlatformAdapter for SimAdapter {
    fn platform_tag(&self) -> String {
        "sim".to_string()
    }

    fn enumerate(&self) -> anyhow::Result<Vec<Device>> {
        Ok(self
            .disks
            .lock()
            .unwrap()
            .values()
            .map(|d| d.device.clone())
            .collect())
    }

    fn preflight(&self, device: &Device) -> WipeResult<()> {
        if !self.disks.lock().unwrap().contains_key(&device.path) {
            return Err(WipeError::DeviceMissing(device.path.clone()));
        }
        Ok(())
    }

    fn dismount_and_lock(&self, device: &Device) -> WipeResult<ScopedLock> {
        let disk = self.disk(&device.path);
        if disk.locked.swap(true, Ordering::SeqCst) {
            return Err(WipeError::DeviceBusy(device.path.clone()));
        }
        let flag = disk.locked.clone();
        Ok(ScopedLock::new(
            device.path.clone(),
            Box::new(move || flag.store(false, Ordering::SeqCst)),
        ))
    }

    fn raw_writer(&self, device: &Device) -> WipeResult<Box<dyn RawWriter>> {
        let disk = self.disk(&device.path);
        Ok(Box::new(SimWriter {
            data: disk.data.clone(),
            faults: disk.faults.clone(),
            position: 0,
            triggered_this_pass: HashSet::new(),
            bytes_accepted: 0,
        }))
    }

    fn raw_reader(&self, device: &Device) -> WipeResult<Box<dyn RawReader>> {
        let disk = self.disk(&device.path);
        Ok(Box::new(SimReader {
            data: disk.data.clone(),
            position: 0,
        }))
    }

    fn device_size(&self, device: &Device) -> WipeResult<u64> {
        Ok(self.disk(&device.path).data.lock().unwrap().len() as u64)
    }

    fn hidden_area_report(&self, _device: &Device) -> WipeResult<HiddenAreaInfo> {
        Ok(HiddenAreaInfo::default())
    }

    fn neutralize_hidden_areas(&self, _device: &Device) -> WipeResult<HiddenAreaOutcome> {
        Ok(HiddenAreaOutcome::default())
    }

    fn try_hardware_purge(&self, device: &Device, _timeout: Duration) -> HardwareOutcome {
        let disk = self.disk(&device.path);
        if disk.purge == HardwareOutcome::Purged {
            disk.data.lock().unwrap().fill(0);
        }
        disk.purge.clone()
    }

    fn post_wipe_trim(&self, device: &Device) -> WipeResult<()> {
        if device.medium_class.is_solid_state() {
            self.disk(&device.path).trimmed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct SimWriter {
    data: Arc<Mutex<Vec<u8>>>,
    faults: FaultPlan,
    position: u64,
    triggered_this_pass: HashSet<u64>,
    bytes_accepted: u64,
}

impl RawWriter for SimWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let start = self.position;
        let end = start + buf.len() as u64;

        if let Some(offset) = self.faults.permission_loss_at {
            if offset >= start && offset < end {
                return Err(Error::new(
                    ErrorKind::PermissionDenied,
                    "simulated permission loss",
                ));
            }
        }

        for &offset in &self.faults.medium_error_offsets {
            if offset >= start && offset < end && !self.triggered_this_pass.contains(&offset) {
                self.triggered_this_pass.insert(offset);
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    "simulated unrecoverable medium error",
                ));
            }
        }

        {
            let mut data = self.data.lock().unwrap();
            let start = start as usize;
            let len = buf.len().min(data.len().saturating_sub(start));
            let skip = if self.faults.skip_first_sector && start < 512 {
                (512 - start).min(len)
            } else {
                0
            };
            data[start + skip..start + len].copy_from_slice(&buf[skip..len]);
            self.position += len as u64;
            self.bytes_accepted += len as u64;
        }

        if let Some((threshold, token)) = &self.faults.cancel_after {
            if self.bytes_accepted >= *threshold {
                token.cancel();
            }
        }

        Ok(buf.len())
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        self.position = offset;
        if offset == 0 {
            // A rewind marks the start of a new pass
            self.triggered_this_pass.clear();
        }
        Ok(())
    }

    fn flush_to_media(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct SimReader {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl RawReader for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.data.lock().unwrap();
        let start = (self.position as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        self.position += len as u64;
        Ok(len)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<()> {
        self.position = offset;
        Ok(())
    }
}
