use anyhow::{anyhow, Result};
use ring::rand::{SecureRandom, SystemRandom};
use std::fs::File;
use std::io::Read;
use std::sync::Mutex;

/// Entropy source abstraction so the generator can fall back when the
/// preferred OS facility is unavailable.
pub trait EntropySource: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()>;
    fn is_available(&self) -> bool;
    fn name(&self) -> &str;
}

/// Ring-based system random (uses OS facilities)
pub struct RingSystemRng {
    rng: SystemRandom,
}

impl Default for RingSystemRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RingSystemRng {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl EntropySource for RingSystemRng {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        self.rng
            .fill(dest)
            .map_err(|_| anyhow!("ring SystemRandom failed"))?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "RingSystemRng"
    }
}

/// /dev/urandom fallback source
pub struct URandom {
    available: bool,
}

impl Default for URandom {
    fn default() -> Self {
        Self::new()
    }
}

impl URandom {
    pub fn new() -> Self {
        let available = std::path::Path::new("/dev/urandom").exists();
        Self { available }
    }
}

impl EntropySource for URandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        if !self.available {
            return Err(anyhow!("/dev/urandom not available"));
        }

        let mut file = File::open("/dev/urandom")
            .map_err(|e| anyhow!("failed to open /dev/urandom: {e}"))?;
        file.read_exact(dest)
            .map_err(|e| anyhow!("failed to read /dev/urandom: {e}"))?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn name(&self) -> &str {
        "URandom"
    }
}

/// Cryptographically secure generator behind every `Random` pass and every
/// piece of certificate id material.
pub struct SecureRng {
    primary: Box<dyn EntropySource>,
    fallback: Box<dyn EntropySource>,
}

impl SecureRng {
    pub fn new() -> Result<Self> {
        let primary = Box::new(RingSystemRng::new()) as Box<dyn EntropySource>;
        let fallback = Box::new(URandom::new()) as Box<dyn EntropySource>;

        if !primary.is_available() && !fallback.is_available() {
            return Err(anyhow!("no entropy sources available"));
        }

        Ok(Self { primary, fallback })
    }

    pub fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        if self.primary.is_available() && self.primary.fill_bytes(dest).is_ok() {
            return Ok(());
        }
        self.fallback
            .fill_bytes(dest)
            .map_err(|e| anyhow!("all entropy sources failed (last: {e})"))
    }

    /// Shannon entropy in bits per byte
    pub fn calculate_entropy(data: &[u8]) -> f64 {
        let mut counts = [0u64; 256];
        for &byte in data {
            counts[byte as usize] += 1;
        }

        let length = data.len() as f64;
        let mut entropy = 0.0;
        for &count in &counts {
            if count > 0 {
                let probability = count as f64 / length;
                entropy -= probability * probability.log2();
            }
        }
        entropy
    }

    /// Number of distinct byte values present in `data`
    pub fn distinct_byte_values(data: &[u8]) -> usize {
        let mut seen = [false; 256];
        let mut distinct = 0;
        for &byte in data {
            if !seen[byte as usize] {
                seen[byte as usize] = true;
                distinct += 1;
            }
        }
        distinct
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_RNG: Mutex<SecureRng> = Mutex::new(
        SecureRng::new().expect("failed to initialize secure RNG")
    );
}

/// Fill `dest` from the process-wide secure generator
pub fn secure_random_bytes(dest: &mut [u8]) -> Result<()> {
    GLOBAL_RNG.lock().unwrap().fill_bytes(dest)
}
