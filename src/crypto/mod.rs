pub mod canonical;
pub mod certificates;
pub mod keystore;
pub mod secure_rng;

pub use certificates::{AttestationPipeline, Certificate, IssuerIdentity};
pub use keystore::KeyStore;

use crate::{WipeError, WipeResult};
use std::path::PathBuf;

/// Per-user application data directory holding the signing key and issued
/// certificates. Overridable through `EWSAFE_DATA_DIR` for sandboxed runs.
pub fn data_dir() -> WipeResult<PathBuf> {
    if let Ok(dir) = std::env::var("EWSAFE_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }

    directories::ProjectDirs::from("org", "ewsafe", "ewsafe")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| {
            WipeError::CryptoFailed("cannot resolve per-user data directory".to_string())
        })
}
