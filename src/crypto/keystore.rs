//! Signing key lifecycle: create-on-first-use, load on later runs.
//!
//! The private key is an RSA-2048 PKCS#8 PEM at a fixed user-scoped path with
//! owner-only permissions. The public key fingerprint (SHA-256 over the DER
//! SubjectPublicKeyInfo) identifies the key pair in every certificate.

use crate::{WipeError, WipeResult};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Default modulus size. 2048 meets the attestation contract; deployments
/// wanting 4096 regenerate the key file offline.
pub const KEY_BITS: usize = 2048;

/// File name of the private key inside the user data directory
pub const KEY_FILE_NAME: &str = "master_key.pem";

pub struct KeyStore {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    fingerprint: String,
    path: PathBuf,
}

impl KeyStore {
    /// Load the key at `path`, generating and persisting a fresh pair on
    /// first use. The same path always yields the same key afterwards.
    pub fn open(path: impl Into<PathBuf>) -> WipeResult<Self> {
        let path = path.into();

        let private = if path.exists() {
            let pem = fs::read_to_string(&path)?;
            RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| WipeError::CryptoFailed(format!("key load: {e}")))?
        } else {
            let key = Self::generate()?;
            Self::persist(&key, &path)?;
            key
        };

        let public = RsaPublicKey::from(&private);
        let fingerprint = Self::fingerprint_of(&public)?;

        Ok(Self {
            private,
            public,
            fingerprint,
            path,
        })
    }

    /// Open the process-default key store under the per-user data directory
    pub fn open_default() -> WipeResult<Self> {
        Self::open(super::data_dir()?.join(KEY_FILE_NAME))
    }

    fn generate() -> WipeResult<RsaPrivateKey> {
        tracing::info!(bits = KEY_BITS, "generating signing key pair");
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| WipeError::CryptoFailed(format!("key generation: {e}")))
    }

    fn persist(key: &RsaPrivateKey, path: &Path) -> WipeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| WipeError::CryptoFailed(format!("key encode: {e}")))?;
        fs::write(path, pem.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %path.display(), "signing key persisted");
        Ok(())
    }

    fn fingerprint_of(public: &RsaPublicKey) -> WipeResult<String> {
        let der = public
            .to_public_key_der()
            .map_err(|e| WipeError::CryptoFailed(format!("public key encode: {e}")))?;
        Ok(hex::encode(Sha256::digest(der.as_bytes())))
    }

    /// Hex SHA-256 of the public key DER, embedded in every certificate
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn key_bits(&self) -> usize {
        self.public.size() * 8
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// RSA-PSS-SHA256 signature over `message`, hex encoded
    pub fn sign(&self, message: &[u8]) -> WipeResult<String> {
        let signing_key = BlindedSigningKey::<Sha256>::new(self.private.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, message);
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Verify a hex RSA-PSS-SHA256 signature against this store's public key
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        Self::verify_with(&self.public, message, signature_hex)
    }

    /// Verify against an arbitrary public key (certificate-embedded issuer)
    pub fn verify_with(public: &RsaPublicKey, message: &[u8], signature_hex: &str) -> bool {
        let Ok(raw) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(raw.as_slice()) else {
            return false;
        };
        let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
        verifying_key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_load_yields_same_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);

        let first = KeyStore::open(&path).unwrap();
        let second = KeyStore::open(&path).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.key_bits(), KEY_BITS);
    }

    #[test]
    fn sign_verify_roundtrip_and_tamper_detection() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::open(dir.path().join(KEY_FILE_NAME)).unwrap();

        let message = b"attested wipe record";
        let signature = store.sign(message).unwrap();

        assert!(store.verify(message, &signature));
        assert!(!store.verify(b"attested wipe recorD", &signature));
        assert!(!store.verify(message, "deadbeef"));
        assert!(!store.verify(message, "not-hex"));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        KeyStore::open(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
