//! Linux platform backend.
//!
//! Device discovery walks sysfs; vendor primitives (HPA/DCO, ATA security
//! erase, NVMe format, discard) go through the standard admin tools
//! (`hdparm`, `nvme`, `blkdiscard`), which is also where every other
//! privileged disk utility on the platform ends up.

use super::{
    HardwareOutcome, HiddenAreaInfo, HiddenAreaOutcome, HiddenRegion, HiddenRegionKind,
    PlatformAdapter, ScopedLock,
};
use crate::io::{RawDeviceFile, RawReader, RawWriter};
use crate::{Device, MediumClass, WipeError, WipeResult};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const SYS_BLOCK: &str = "/sys/block";

pub struct LinuxAdapter;

impl Default for LinuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Skip virtual and optical nodes: loop, ram, device-mapper, CD/DVD,
    /// zram, md arrays, network block devices.
    fn should_skip_device(device_name: &str) -> bool {
        device_name.starts_with("loop")
            || device_name.starts_with("ram")
            || device_name.starts_with("dm-")
            || device_name.starts_with("sr")
            || device_name.starts_with("zram")
            || device_name.starts_with("md")
            || device_name.starts_with("nbd")
    }

    fn sysfs_attr(device_name: &str, rel: &str) -> Option<String> {
        fs::read_to_string(format!("{SYS_BLOCK}/{device_name}/{rel}"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn is_usb_attached(device_name: &str) -> bool {
        fs::read_link(format!("{SYS_BLOCK}/{device_name}/device"))
            .map(|p| p.to_string_lossy().contains("usb"))
            .unwrap_or(false)
    }

    /// Medium classification priority: explicit transport hint, then the
    /// rotational flag, then model-name heuristics.
    fn classify(device_name: &str, model: &str) -> MediumClass {
        if device_name.starts_with("nvme") {
            return MediumClass::NvmeSsd;
        }
        if device_name.starts_with("mmcblk") {
            return MediumClass::EmbeddedFlash;
        }
        if Self::is_usb_attached(device_name) {
            return MediumClass::UsbMassStorage;
        }

        match Self::sysfs_attr(device_name, "queue/rotational").as_deref() {
            Some("0") => MediumClass::SataSsd,
            Some("1") => MediumClass::RotationalHdd,
            _ => {
                let upper = model.to_uppercase();
                if upper.contains("SSD") || upper.contains("SOLID STATE") {
                    MediumClass::SataSsd
                } else {
                    MediumClass::Unknown
                }
            }
        }
    }

    fn interface_of(device_name: &str, medium: MediumClass) -> &'static str {
        match medium {
            MediumClass::NvmeSsd => "nvme",
            MediumClass::UsbMassStorage => "usb",
            MediumClass::EmbeddedFlash => "mmc",
            _ if device_name.starts_with("sd") => "sata",
            _ => "unknown",
        }
    }

    /// Pull a `Field: value` line out of tool output
    fn extract_field(output: &str, field_name: &str) -> Option<String> {
        output
            .lines()
            .find(|line| line.contains(field_name))?
            .split(':')
            .nth(1)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn analyze_device(&self, device_name: &str) -> Result<Device> {
        let path = format!("/dev/{device_name}");

        let model = Self::sysfs_attr(device_name, "device/model")
            .or_else(|| {
                let out = run("hdparm", &["-I", &path]).ok()?;
                Self::extract_field(&out, "Model Number:")
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let serial = Self::sysfs_attr(device_name, "device/serial")
            .or_else(|| {
                let out = run("hdparm", &["-I", &path]).ok()?;
                Self::extract_field(&out, "Serial Number:")
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let medium_class = Self::classify(device_name, &model);

        let sector_bytes = Self::sysfs_attr(device_name, "queue/logical_block_size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(512);

        let device = Device {
            logical_bytes: 0,
            interface: Self::interface_of(device_name, medium_class).to_string(),
            path,
            model,
            serial,
            medium_class,
            sector_bytes,
            platform_tag: self.platform_tag(),
        };

        let logical_bytes = self
            .device_size(&device)
            .with_context(|| format!("cannot size {}", device.path))?;

        Ok(Device {
            logical_bytes,
            ..device
        })
    }

    fn mounted_partitions(device_path: &str) -> Vec<(String, String)> {
        let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
            return Vec::new();
        };
        mounts
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let source = parts.next()?;
                let target = parts.next()?;
                source
                    .starts_with(device_path)
                    .then(|| (source.to_string(), target.to_string()))
            })
            .collect()
    }

    fn hosts_root_filesystem(device_path: &str) -> bool {
        Self::mounted_partitions(device_path)
            .iter()
            .any(|(_, target)| target == "/")
    }

    fn has_holders(device_name: &str) -> bool {
        fs::read_dir(format!("{SYS_BLOCK}/{device_name}/holders"))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    fn device_name(device: &Device) -> String {
        Path::new(&device.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| device.path.clone())
    }

    fn hpa_region(device: &Device) -> Option<HiddenRegion> {
        // "max sectors = <current>/<native>, HPA is enabled"
        let out = run("hdparm", &["-N", &device.path]).ok()?;
        let line = out.lines().find(|l| l.contains("max sectors"))?;
        let values = line.split('=').nth(1)?.trim();
        let mut parts = values.split('/');
        let current: u64 = parts.next()?.trim().parse().ok()?;
        let native: u64 = parts
            .next()?
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()?;

        (native > current).then(|| HiddenRegion {
            kind: HiddenRegionKind::HostProtectedArea,
            hidden_sectors: native - current,
            hidden_bytes: (native - current) * device.sector_bytes as u64,
        })
    }

    fn dco_region(device: &Device) -> Option<HiddenRegion> {
        let out = run("hdparm", &["--dco-identify", &device.path]).ok()?;
        let real_max: u64 = Self::extract_field(&out, "Real max sectors")?
            .split_whitespace()
            .next()?
            .parse()
            .ok()?;
        let reported = device.logical_bytes / device.sector_bytes as u64;

        (real_max > reported).then(|| HiddenRegion {
            kind: HiddenRegionKind::DeviceConfigurationOverlay,
            hidden_sectors: real_max - reported,
            hidden_bytes: (real_max - reported) * device.sector_bytes as u64,
        })
    }

    fn ata_security_erase(device: &Device, timeout: Duration) -> HardwareOutcome {
        // Security erase needs a temporary password; it is cleared by the
        // erase itself.
        let pass = "ewsafe-erase";
        let set = run(
            "hdparm",
            &[
                "--user-master",
                "u",
                "--security-set-pass",
                pass,
                &device.path,
            ],
        );
        if let Err(e) = set {
            let msg = e.to_string();
            return if msg.contains("not supported") || msg.contains("Invalid") {
                HardwareOutcome::Unsupported
            } else {
                HardwareOutcome::Failed(format!("security-set-pass: {msg}"))
            };
        }

        match run_with_timeout(
            "hdparm",
            &[
                "--user-master",
                "u",
                "--security-erase",
                pass,
                &device.path,
            ],
            timeout,
        ) {
            Ok(_) => HardwareOutcome::Purged,
            Err(e) => {
                // Leave no stale password behind on failure
                let _ = run(
                    "hdparm",
                    &["--user-master", "u", "--security-disable", pass, &device.path],
                );
                HardwareOutcome::Failed(format!("security-erase: {e}"))
            }
        }
    }

    fn nvme_format(device: &Device, timeout: Duration) -> HardwareOutcome {
        match run_with_timeout("nvme", &["format", &device.path, "--ses=1"], timeout) {
            Ok(_) => HardwareOutcome::Purged,
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("not supported") || msg.contains("INVALID") {
                    HardwareOutcome::Unsupported
                } else {
                    HardwareOutcome::Failed(format!("nvme format: {msg}"))
                }
            }
        }
    }
}

impl PlatformAdapter for LinuxAdapter {
    fn platform_tag(&self) -> String {
        "linux".to_string()
    }

    fn enumerate(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();

        let entries = fs::read_dir(SYS_BLOCK).context("cannot read /sys/block")?;
        for entry in entries {
            let entry = entry?;
            let device_name = entry.file_name();
            let device_name = device_name.to_string_lossy();

            if Self::should_skip_device(&device_name) {
                continue;
            }
            if !Path::new(&format!("/dev/{device_name}")).exists() {
                continue;
            }

            match self.analyze_device(&device_name) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    tracing::warn!(device = %device_name, error = %e, "skipping device");
                }
            }
        }

        Ok(devices)
    }

    fn preflight(&self, device: &Device) -> WipeResult<()> {
        if !nix::unistd::Uid::effective().is_root() {
            return Err(WipeError::NotPrivileged(
                "raw device access requires root".to_string(),
            ));
        }

        if !Path::new(&device.path).exists() {
            return Err(WipeError::DeviceMissing(device.path.clone()));
        }

        let name = Self::device_name(device);
        if Self::sysfs_attr(&name, "ro").as_deref() == Some("1") {
            return Err(WipeError::WriteProtected(device.path.clone()));
        }

        if Self::hosts_root_filesystem(&device.path) {
            return Err(WipeError::DeviceBusy(format!(
                "{} hosts the running system",
                device.path
            )));
        }

        if Self::has_holders(&name) {
            return Err(WipeError::DeviceBusy(format!(
                "{} is claimed by another subsystem (device-mapper/md)",
                device.path
            )));
        }

        Ok(())
    }

    fn dismount_and_lock(&self, device: &Device) -> WipeResult<ScopedLock> {
        let mut dismount_failures = Vec::new();
        for (source, target) in Self::mounted_partitions(&device.path) {
            match run("umount", &[&source]) {
                Ok(_) => tracing::info!(partition = %source, mount = %target, "dismounted"),
                Err(e) => {
                    dismount_failures.push(format!("{source}: {e}"));
                }
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.path)
            .map_err(|e| WipeError::DeviceBusy(format!("{}: {e}", device.path)))?;

        let locked = {
            use std::os::unix::io::AsRawFd;
            nix::fcntl::flock(
                file.as_raw_fd(),
                nix::fcntl::FlockArg::LockExclusiveNonblock,
            )
            .is_ok()
        };

        let path = device.path.clone();
        // The closure owns the handle; dropping it releases the flock
        let release = Box::new(move || drop(file));

        if !locked || !dismount_failures.is_empty() {
            let mut note = String::from("exclusive lock degraded");
            if !locked {
                note.push_str("; flock unavailable");
            }
            if !dismount_failures.is_empty() {
                note.push_str(&format!("; dismount failures: {}", dismount_failures.join(", ")));
            }
            tracing::warn!(device = %path, note = %note, "proceeding with writable handle only");
            return Ok(ScopedLock::degraded(path, release, note));
        }

        Ok(ScopedLock::new(path, release))
    }

    fn raw_writer(&self, device: &Device) -> WipeResult<Box<dyn RawWriter>> {
        let file = RawDeviceFile::open_write(Path::new(&device.path))?;
        Ok(Box::new(file))
    }

    fn raw_reader(&self, device: &Device) -> WipeResult<Box<dyn RawReader>> {
        let file = RawDeviceFile::open_read(Path::new(&device.path))?;
        Ok(Box::new(file))
    }

    fn device_size(&self, device: &Device) -> WipeResult<u64> {
        use std::os::unix::io::AsRawFd;

        nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

        let file = std::fs::File::open(&device.path)
            .map_err(|e| WipeError::DeviceMissing(format!("{}: {e}", device.path)))?;

        let mut size: u64 = 0;
        let ioctl_ok = unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.is_ok();
        if ioctl_ok && size > 0 {
            return Ok(size);
        }

        // Regular files and exotic transports: fall back to seek-to-end
        let mut raw = RawDeviceFile::open_read(Path::new(&device.path))?;
        Ok(raw.seek_end()?)
    }

    fn hidden_area_report(&self, device: &Device) -> WipeResult<HiddenAreaInfo> {
        let mut info = HiddenAreaInfo::default();

        match device.medium_class {
            MediumClass::RotationalHdd | MediumClass::SataSsd => {
                if let Some(region) = Self::hpa_region(device) {
                    info.notes.push(format!(
                        "HPA hides {} sectors ({} bytes)",
                        region.hidden_sectors, region.hidden_bytes
                    ));
                    info.regions.push(region);
                }
                if let Some(region) = Self::dco_region(device) {
                    info.notes.push(format!(
                        "DCO hides {} sectors ({} bytes)",
                        region.hidden_sectors, region.hidden_bytes
                    ));
                    info.regions.push(region);
                }
            }
            MediumClass::NvmeSsd | MediumClass::EmbeddedFlash => {
                info.notes.push(
                    "controller over-provisioning is not host-addressable; \
                     hardware purge covers it"
                        .to_string(),
                );
            }
            _ => {}
        }

        Ok(info)
    }

    fn neutralize_hidden_areas(&self, device: &Device) -> WipeResult<HiddenAreaOutcome> {
        let mut outcome = HiddenAreaOutcome::default();
        let report = self.hidden_area_report(device)?;

        for region in &report.regions {
            match region.kind {
                HiddenRegionKind::HostProtectedArea => {
                    let reported = device.logical_bytes / device.sector_bytes as u64;
                    let native = reported + region.hidden_sectors;
                    match run(
                        "hdparm",
                        &[
                            "--yes-i-know-what-i-am-doing",
                            "-N",
                            &format!("p{native}"),
                            &device.path,
                        ],
                    ) {
                        Ok(_) => outcome.cleared.push(region.kind),
                        Err(e) => {
                            outcome.uncleared.push(region.kind);
                            outcome.notes.push(format!("HPA removal failed: {e}"));
                        }
                    }
                }
                HiddenRegionKind::DeviceConfigurationOverlay => {
                    match run(
                        "hdparm",
                        &["--yes-i-know-what-i-am-doing", "--dco-restore", &device.path],
                    ) {
                        Ok(_) => outcome.cleared.push(region.kind),
                        Err(e) => {
                            outcome.uncleared.push(region.kind);
                            outcome.notes.push(format!("DCO restore failed: {e}"));
                        }
                    }
                }
                HiddenRegionKind::ControllerReserved => {
                    outcome.uncleared.push(region.kind);
                    outcome
                        .notes
                        .push("controller-reserved space cannot be exposed by the host".to_string());
                }
            }
        }

        outcome.notes.extend(report.notes);
        Ok(outcome)
    }

    fn try_hardware_purge(&self, device: &Device, timeout: Duration) -> HardwareOutcome {
        match device.medium_class {
            MediumClass::NvmeSsd => Self::nvme_format(device, timeout),
            MediumClass::SataSsd => Self::ata_security_erase(device, timeout),
            MediumClass::EmbeddedFlash => {
                // Secure discard reaches the whole eMMC including spare blocks
                match run_with_timeout("blkdiscard", &["-s", &device.path], timeout) {
                    Ok(_) => HardwareOutcome::Purged,
                    Err(e) => HardwareOutcome::Failed(format!("secure discard: {e}")),
                }
            }
            _ => HardwareOutcome::Unsupported,
        }
    }

    fn post_wipe_trim(&self, device: &Device) -> WipeResult<()> {
        if !device.medium_class.is_solid_state() {
            return Ok(());
        }

        if let Err(e) = run("blkdiscard", &[&device.path]) {
            tracing::warn!(device = %device.path, error = %e, "post-wipe TRIM failed");
        }
        Ok(())
    }
}

/// Run an admin tool, returning stdout on success
fn run(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("cannot execute {cmd}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{cmd} failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run an admin tool with a hard deadline; the child is killed on timeout
fn run_with_timeout(cmd: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("cannot execute {cmd}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let output = child.wait_with_output()?;
            if !status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("{cmd} failed: {}", stderr.trim());
            }
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("{cmd} timed out after {}", humantime::format_duration(timeout));
        }

        std::thread::sleep(Duration::from_millis(200));
    }
}
