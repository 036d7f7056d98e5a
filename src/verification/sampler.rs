//! Post-wipe verification sampling.
//!
//! Reads a bounded number of 1 MiB, sector-aligned samples across the device
//! and applies the recoverability predicate to each. Legitimate erase output
//! (uniform bytes, alternating pairs, CSPRNG noise) never triggers; known
//! filesystem structures, file magics, and text-bearing regions do.

use crate::crypto::secure_rng::SecureRng;
use crate::io::RawReader;
use crate::{EngineConfig, WipeResult};
use rand::Rng;

pub const SAMPLE_BYTES: usize = 1024 * 1024;

/// One device-size increment per extra sample beyond the minimum
const BYTES_PER_SAMPLE: u64 = 512 * 1024 * 1024;

/// High-entropy exclusion: more than 80% of possible byte values present
const DISTINCT_BYTE_CEILING: usize = 204;

/// Filename/document keywords consulted by the text heuristic
const TEXT_KEYWORDS: [&str; 14] = [
    "password",
    "confidential",
    "invoice",
    "account",
    "statement",
    "resume",
    ".docx",
    ".xlsx",
    ".pdf",
    ".jpg",
    ".png",
    "c:\\users",
    "/home/",
    "documents and settings",
];

/// File magics checked at sector-aligned offsets
const FILE_MAGICS: [(&[u8], &str); 8] = [
    (b"\x89PNG\r\n\x1a\n", "PNG"),
    (b"\xFF\xD8\xFF", "JPEG/JFIF"),
    (b"%PDF-", "PDF"),
    (b"PK\x03\x04", "ZIP"),
    (b"MZ", "MZ/PE executable"),
    (b"\x7fELF", "ELF executable"),
    (b"RIFF", "RIFF container"),
    (b"GIF8", "GIF"),
];

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub samples_taken: usize,
    pub findings: Vec<String>,
}

/// Sample the device and apply the recoverability predicate.
pub fn sample_device(
    reader: &mut dyn RawReader,
    logical_bytes: u64,
    sector_bytes: u32,
    config: &EngineConfig,
) -> WipeResult<VerificationOutcome> {
    let sample_len = SAMPLE_BYTES.min(logical_bytes as usize).max(1);
    let positions = sample_positions(logical_bytes, sample_len as u64, sector_bytes, config);

    let mut findings = Vec::new();
    let mut buf = vec![0u8; sample_len];

    for &offset in &positions {
        reader.seek(offset)?;
        read_full(reader, &mut buf)?;
        findings.extend(recoverability_findings(&buf, offset, sector_bytes));
    }

    Ok(VerificationOutcome {
        passed: findings.is_empty(),
        samples_taken: positions.len(),
        findings,
    })
}

/// Sector-aligned sample offsets: start of device, last full sample, and
/// uniformly random positions in between. Count scales with device size
/// within the configured bounds.
pub fn sample_positions(
    logical_bytes: u64,
    sample_len: u64,
    sector_bytes: u32,
    config: &EngineConfig,
) -> Vec<u64> {
    let sector = sector_bytes.max(1) as u64;
    let scaled = (logical_bytes / BYTES_PER_SAMPLE) as usize + config.verify_min_samples;
    let count = scaled.clamp(config.verify_min_samples, config.verify_max_samples);

    let last = logical_bytes.saturating_sub(sample_len) / sector * sector;

    let mut positions = vec![0u64];
    if last > 0 {
        positions.push(last);
    }

    let mut rng = rand::thread_rng();
    while positions.len() < count && last > sample_len {
        let raw = rng.gen_range(0..=last);
        let aligned = raw / sector * sector;
        if !positions.contains(&aligned) {
            positions.push(aligned);
        }
    }

    positions.sort_unstable();
    positions
}

fn read_full(reader: &mut dyn RawReader, buf: &mut [u8]) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    // Short reads at the device tail verify whatever was returned
    for byte in &mut buf[filled..] {
        *byte = 0;
    }
    Ok(())
}

/// Apply the recoverability predicate to a single sample. An empty result
/// means the sample looks like erase output.
pub fn recoverability_findings(sample: &[u8], base_offset: u64, sector_bytes: u32) -> Vec<String> {
    // Exclusions first: uniform and alternating wipe patterns, and
    // high-entropy random wipes, are legitimate erase output.
    let distinct = SecureRng::distinct_byte_values(sample);
    if distinct <= 2 || distinct > DISTINCT_BYTE_CEILING {
        return Vec::new();
    }

    let mut findings = Vec::new();
    let sector = (sector_bytes as usize).max(512);

    for (index, chunk) in sample.chunks(sector).enumerate() {
        let offset = base_offset + (index * sector) as u64;
        if let Some(name) = filesystem_signature(chunk) {
            findings.push(format!("{name} signature at offset {offset}"));
        }
        if let Some(name) = file_magic(chunk) {
            findings.push(format!("{name} magic at offset {offset}"));
        }
    }

    if let Some(finding) = text_window(sample, base_offset) {
        findings.push(finding);
    }

    if let Some(finding) = repeated_metadata_sectors(sample, base_offset) {
        findings.push(finding);
    }

    findings
}

/// Filesystem and container signatures at their in-sector offsets
fn filesystem_signature(sector: &[u8]) -> Option<&'static str> {
    if sector.len() < 512 {
        return None;
    }

    if &sector[3..11] == b"NTFS    " {
        return Some("NTFS");
    }
    if sector.len() > 90 && &sector[82..90] == b"FAT32   " {
        return Some("FAT32");
    }
    if &sector[54..62] == b"FAT16   " || &sector[54..62] == b"FAT12   " {
        return Some("FAT16");
    }
    if &sector[3..11] == b"EXFAT   " {
        return Some("exFAT");
    }
    // ext superblock magic lives 56 bytes into the superblock, which itself
    // starts on a sector boundary 1 KiB into the filesystem
    if sector[56] == 0x53 && sector[57] == 0xEF {
        return Some("ext2/3/4");
    }
    if &sector[0..4] == b"XFSB" {
        return Some("XFS");
    }
    if sector.len() > 72 && &sector[64..72] == b"_BHRfS_M" {
        return Some("Btrfs");
    }
    if sector[510] == 0x55 && sector[511] == 0xAA {
        return Some("boot sector trailer");
    }

    None
}

fn file_magic(sector: &[u8]) -> Option<&'static str> {
    FILE_MAGICS
        .iter()
        .find(|(magic, _)| sector.len() >= magic.len() && sector.starts_with(magic))
        .map(|(_, name)| *name)
}

/// Printable-text heuristic: a window of more than 100 bytes whose
/// printable-ASCII ratio exceeds 10% and which contains a known
/// filename/document keyword.
fn text_window(sample: &[u8], base_offset: u64) -> Option<String> {
    const WINDOW: usize = 512;
    const STRIDE: usize = 256;

    if sample.len() <= 100 {
        return None;
    }

    let mut start = 0;
    while start < sample.len() {
        let end = (start + WINDOW).min(sample.len());
        let window = &sample[start..end];
        if window.len() > 100 {
            let printable = window
                .iter()
                .filter(|&&b| (0x20..=0x7E).contains(&b))
                .count();
            if printable * 10 > window.len() {
                let lowered: String = window
                    .iter()
                    .map(|&b| (b as char).to_ascii_lowercase())
                    .collect();
                if let Some(keyword) = TEXT_KEYWORDS.iter().find(|k| lowered.contains(*k)) {
                    return Some(format!(
                        "document text ({keyword:?}) near offset {}",
                        base_offset + start as u64
                    ));
                }
            }
        }
        start += STRIDE;
    }

    None
}

/// Repeated-sector heuristic: 80% or more of the sample's 512-byte sectors
/// are identical and that sector carries filesystem-metadata markers.
fn repeated_metadata_sectors(sample: &[u8], base_offset: u64) -> Option<String> {
    use std::collections::HashMap;

    let sectors: Vec<&[u8]> = sample.chunks_exact(512).collect();
    if sectors.is_empty() {
        return None;
    }

    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for &sector in &sectors {
        *counts.entry(sector).or_insert(0) += 1;
    }

    let (dominant, count) = counts.into_iter().max_by_key(|(_, c)| *c)?;
    if count * 5 >= sectors.len() * 4 && looks_like_fs_metadata(dominant) {
        return Some(format!(
            "{count}/{} identical metadata-bearing sectors near offset {base_offset}",
            sectors.len()
        ));
    }

    None
}

/// Boot signature, FAT/NTFS markers, or a plausible directory-entry layout
fn looks_like_fs_metadata(sector: &[u8]) -> bool {
    if sector.len() < 512 {
        return false;
    }

    if sector[510] == 0x55 && sector[511] == 0xAA {
        return true;
    }
    if &sector[3..11] == b"NTFS    " || &sector[54..57] == b"FAT" || &sector[82..85] == b"FAT" {
        return true;
    }

    // Directory entries: 32-byte records with a plausible attribute byte and
    // a non-empty name field
    let mut plausible_entries = 0;
    for entry in sector.chunks_exact(32) {
        let attr = entry[11];
        let first = entry[0];
        if first != 0x00
            && matches!(attr, 0x10 | 0x20 | 0x0F | 0x01 | 0x02 | 0x04 | 0x08)
        {
            plausible_entries += 1;
        }
    }
    plausible_entries >= 8
}
