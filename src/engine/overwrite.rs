//! Software overwrite pass execution.
//!
//! One pass writes the pass buffer across the whole logical length with
//! bounded fault tolerance: transient failures retry in place, medium errors
//! are recorded and skipped, permission loss and device faults abort.

use crate::io::{AlignedBuffer, RawWriter};
use crate::patterns::PassDescriptor;
use crate::{CancelToken, EngineConfig, WipeError};
use std::io::ErrorKind;
use std::time::Duration;

/// What one completed pass did to the device
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub bytes_written: u64,
    pub bad_sector_offsets: Vec<u64>,
}

/// How a single write failure should be handled
#[derive(Debug)]
enum WriteFault {
    Transient(String),
    Medium(String),
    Fatal(String),
}

fn classify(error: &std::io::Error) -> WriteFault {
    match error.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            WriteFault::Transient(error.to_string())
        }
        ErrorKind::PermissionDenied => WriteFault::Fatal(format!(
            "write handle lost permission mid-pass: {error}"
        )),
        _ => WriteFault::Medium(error.to_string()),
    }
}

/// Execute one overwrite pass. `prior_bad_sectors` carries the accumulated
/// count from earlier passes so the abort budget spans the whole wipe.
/// `on_progress` receives the running byte offset after each buffer.
pub fn run_pass(
    writer: &mut dyn RawWriter,
    descriptor: &PassDescriptor,
    device_bytes: u64,
    config: &EngineConfig,
    cancel: &CancelToken,
    prior_bad_sectors: u64,
    mut on_progress: impl FnMut(u64),
) -> Result<PassOutcome, WipeError> {
    let mut buffer = AlignedBuffer::new(config.buffer_bytes)?;
    descriptor.materialize(buffer.as_mut_slice())?;

    let mut outcome = PassOutcome::default();
    let mut offset = 0u64;
    let mut unflushed = 0u64;
    let early_fault_boundary = (device_bytes as f64 * config.early_fault_fraction) as u64;

    writer.seek(0)?;

    while offset < device_bytes {
        if cancel.is_cancelled() {
            let _ = writer.flush_to_media();
            return Err(WipeError::Cancelled);
        }

        let chunk = (device_bytes - offset).min(config.buffer_bytes as u64) as usize;

        match write_chunk(writer, &buffer.as_slice()[..chunk], config) {
            Ok(()) => {
                offset += chunk as u64;
                unflushed += chunk as u64;
                outcome.bytes_written += chunk as u64;
            }
            Err(WriteFault::Fatal(reason)) => {
                return Err(WipeError::IoFatal(reason));
            }
            Err(WriteFault::Medium(reason)) | Err(WriteFault::Transient(reason)) => {
                // A failure this early is a device fault, not an isolated
                // bad sector
                if offset < early_fault_boundary {
                    return Err(WipeError::IoFatal(format!(
                        "write failed at offset {offset} before {}% progress: {reason}",
                        (config.early_fault_fraction * 100.0) as u32
                    )));
                }

                outcome.bad_sector_offsets.push(offset);
                let total_bad = prior_bad_sectors + outcome.bad_sector_offsets.len() as u64;
                tracing::warn!(
                    offset,
                    total_bad,
                    reason = %reason,
                    "bad sector recorded, skipping ahead"
                );

                if total_bad > config.max_bad_sectors {
                    return Err(WipeError::IoFatal(format!(
                        "bad sector budget exceeded ({total_bad} > {})",
                        config.max_bad_sectors
                    )));
                }

                offset = (offset + config.bad_sector_skip_bytes).min(device_bytes);
                writer.seek(offset)?;
            }
        }

        if unflushed >= config.flush_interval_bytes {
            writer
                .flush_to_media()
                .map_err(|e| WipeError::IoFatal(format!("flush failed: {e}")))?;
            unflushed = 0;
        }

        on_progress(offset);
    }

    writer
        .flush_to_media()
        .map_err(|e| WipeError::IoFatal(format!("final flush failed: {e}")))?;

    Ok(outcome)
}

/// Write one buffer's worth, retrying transient faults in place. Partial
/// writes continue from where the device stopped.
fn write_chunk(
    writer: &mut dyn RawWriter,
    chunk: &[u8],
    config: &EngineConfig,
) -> Result<(), WriteFault> {
    let mut written = 0usize;
    let mut transient_attempts = 0u32;

    while written < chunk.len() {
        match writer.write(&chunk[written..]) {
            Ok(0) => {
                return Err(WriteFault::Medium(
                    "device accepted zero bytes".to_string(),
                ));
            }
            Ok(n) => {
                written += n;
                transient_attempts = 0;
            }
            Err(e) => match classify(&e) {
                WriteFault::Transient(reason) => {
                    transient_attempts += 1;
                    if transient_attempts > config.transient_retries {
                        // Persistent transience reads as a medium problem
                        return Err(WriteFault::Medium(format!(
                            "transient failure persisted through {} retries: {reason}",
                            config.transient_retries
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(config.transient_retry_delay_ms));
                }
                fault => return Err(fault),
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RawWriter;
    use std::io::{Error, ErrorKind};

    /// Writer over a memory image with scriptable faults
    struct ScriptedWriter {
        image: Vec<u8>,
        position: u64,
        // (offset, kind, remaining_hits)
        faults: Vec<(u64, ErrorKind, u32)>,
        flushes: u32,
    }

    impl ScriptedWriter {
        fn new(size: usize) -> Self {
            Self {
                image: vec![0xEE; size],
                position: 0,
                faults: Vec::new(),
                flushes: 0,
            }
        }

        fn fault_at(mut self, offset: u64, kind: ErrorKind, hits: u32) -> Self {
            self.faults.push((offset, kind, hits));
            self
        }
    }

    impl RawWriter for ScriptedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let start = self.position;
            let end = start + buf.len() as u64;
            for fault in &mut self.faults {
                if fault.2 > 0 && fault.0 >= start && fault.0 < end {
                    fault.2 -= 1;
                    return Err(Error::new(fault.1, "scripted fault"));
                }
            }
            let start = start as usize;
            let len = buf.len().min(self.image.len() - start);
            self.image[start..start + len].copy_from_slice(&buf[..len]);
            self.position += len as u64;
            Ok(len)
        }

        fn seek(&mut self, offset: u64) -> std::io::Result<()> {
            self.position = offset;
            Ok(())
        }

        fn flush_to_media(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            buffer_bytes: 64 * 1024,
            flush_interval_bytes: 256 * 1024,
            transient_retry_delay_ms: 0,
            bad_sector_skip_bytes: 64 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn clean_pass_covers_whole_device() {
        let size = 1024 * 1024;
        let mut writer = ScriptedWriter::new(size);
        let config = small_config();
        let cancel = CancelToken::new();

        let outcome = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &cancel,
            0,
            |_| {},
        )
        .unwrap();

        assert_eq!(outcome.bytes_written, size as u64);
        assert!(outcome.bad_sector_offsets.is_empty());
        assert!(writer.image.iter().all(|&b| b == 0x00));
        assert!(writer.flushes >= 1);
    }

    #[test]
    fn transient_fault_is_retried_in_place() {
        let size = 1024 * 1024;
        let mut writer =
            ScriptedWriter::new(size).fault_at(512 * 1024, ErrorKind::Interrupted, 2);
        let config = small_config();

        let outcome = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &CancelToken::new(),
            0,
            |_| {},
        )
        .unwrap();

        assert!(outcome.bad_sector_offsets.is_empty());
        assert!(writer.image.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn medium_fault_past_early_boundary_records_and_skips() {
        let size = 1024 * 1024;
        // Unlimited hits: the sector stays bad across retries
        let mut writer =
            ScriptedWriter::new(size).fault_at(512 * 1024, ErrorKind::InvalidData, u32::MAX);
        let config = small_config();

        let outcome = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &CancelToken::new(),
            0,
            |_| {},
        )
        .unwrap();

        assert_eq!(outcome.bad_sector_offsets, vec![512 * 1024]);
        // Skipped region keeps its old content, the rest is wiped
        assert!(writer.image[..512 * 1024].iter().all(|&b| b == 0x00));
        assert!(writer.image[(512 + 64) * 1024..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn early_fault_aborts_as_device_failure() {
        let size = 1024 * 1024;
        let mut writer = ScriptedWriter::new(size).fault_at(0, ErrorKind::InvalidData, u32::MAX);
        let config = small_config();

        let err = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &CancelToken::new(),
            0,
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, WipeError::IoFatal(_)));
    }

    #[test]
    fn permission_loss_fails_the_pass() {
        let size = 1024 * 1024;
        let mut writer =
            ScriptedWriter::new(size).fault_at(768 * 1024, ErrorKind::PermissionDenied, 1);
        let config = small_config();

        let err = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &CancelToken::new(),
            0,
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, WipeError::IoFatal(_)));
    }

    #[test]
    fn bad_sector_budget_aborts() {
        let size = 4 * 1024 * 1024;
        let mut writer = ScriptedWriter::new(size);
        // Every buffer write past the early boundary fails persistently
        for i in 8..64 {
            writer = writer.fault_at(i * 64 * 1024, ErrorKind::InvalidData, u32::MAX);
        }
        let config = EngineConfig {
            max_bad_sectors: 10,
            ..small_config()
        };

        let err = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &CancelToken::new(),
            0,
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, WipeError::IoFatal(_)));
    }

    #[test]
    fn cancellation_stops_within_one_buffer() {
        let size = 4 * 1024 * 1024;
        let mut writer = ScriptedWriter::new(size);
        let config = small_config();
        let cancel = CancelToken::new();

        let cancel_at = cancel.clone();
        let mut cancelled_offset = 0u64;
        let err = run_pass(
            &mut writer,
            &PassDescriptor::Constant(0x00),
            size as u64,
            &config,
            &cancel,
            0,
            |offset| {
                if offset >= 1024 * 1024 && cancelled_offset == 0 {
                    cancelled_offset = offset;
                    cancel_at.cancel();
                }
            },
        )
        .unwrap_err();

        assert!(matches!(err, WipeError::Cancelled));
        // One more buffer at most was written after the cancel request
        assert!(writer.position <= cancelled_offset + config.buffer_bytes as u64);
    }
}
