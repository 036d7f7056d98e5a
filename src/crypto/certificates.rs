//! Attestation pipeline: canonicalize a terminal wipe record into a signed
//! certificate, persist it, and verify certificates presented later.

use super::canonical::{canonical_bytes, canonical_json};
use super::keystore::KeyStore;
use super::secure_rng::secure_random_bytes;
use crate::engine::WipeLog;
use crate::{WipeError, WipeResult};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: &str = "1.0";
pub const SIGNATURE_ALGORITHM: &str = "RSA-PSS-SHA256";

/// Top-level keys that may be annotated onto a stored certificate after
/// signing (file paths, portal URLs). They are stripped before verification.
const UNSIGNED_FIELDS: [&str; 3] = ["certificate_path", "verification_url", "qr_payload"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerBlock {
    pub organization: String,
    pub system_id: String,
    pub public_key_fingerprint: String,
    pub authority_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBlock {
    pub path: String,
    pub model: String,
    pub serial: String,
    pub size_bytes: u64,
    pub size_human: String,
    pub medium_class: String,
    pub interface: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WipeBlock {
    pub method_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: u64,
    pub passes_completed: u32,
    pub total_passes: u32,
    pub hardware_erase_used: bool,
    pub verification_passed: bool,
    pub success: bool,
    pub errors: Vec<String>,
    pub platform_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceBlock {
    pub standards: Vec<String>,
    pub compliance_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityBlock {
    pub signature_algorithm: String,
    pub key_size: u32,
}

/// Tamper-evident wipe certificate. Immutable after signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_id: String,
    pub format_version: String,
    pub issued_at: String,
    pub issuer: IssuerBlock,
    pub device: DeviceBlock,
    pub wipe: WipeBlock,
    pub compliance: ComplianceBlock,
    pub security: SecurityBlock,
    pub content_hash: String,
    pub signature: String,
}

/// Static identity of the certificate issuer
#[derive(Debug, Clone)]
pub struct IssuerIdentity {
    pub organization: String,
    pub system_id: String,
    pub authority_name: String,
}

impl Default for IssuerIdentity {
    fn default() -> Self {
        Self {
            organization: "E-Waste Safe".to_string(),
            system_id: format!("ewsafe-wipe/{}", env!("CARGO_PKG_VERSION")),
            authority_name: "E-Waste Safe Erasure Authority".to_string(),
        }
    }
}

pub struct AttestationPipeline {
    keystore: KeyStore,
    cert_dir: PathBuf,
    issuer: IssuerIdentity,
}

impl AttestationPipeline {
    pub fn new(keystore: KeyStore, cert_dir: impl Into<PathBuf>, issuer: IssuerIdentity) -> Self {
        Self {
            keystore,
            cert_dir: cert_dir.into(),
            issuer,
        }
    }

    /// Pipeline bound to the per-user data directory and default key store
    pub fn open_default() -> WipeResult<Self> {
        let keystore = KeyStore::open_default()?;
        let cert_dir = super::data_dir()?.join("certificates");
        Ok(Self::new(keystore, cert_dir, IssuerIdentity::default()))
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Issue, sign, and persist a certificate for a successful wipe.
    /// A wipe that did not succeed is never attested.
    pub fn issue(&self, log: &WipeLog) -> WipeResult<Certificate> {
        if !log.success {
            return Err(WipeError::CryptoFailed(
                "wipe was not successful; refusing to issue a certificate".to_string(),
            ));
        }

        let issued_at = Utc::now();
        let started_at = log
            .started_at
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let ended_at = log
            .ended_at
            .unwrap_or(issued_at)
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let device = &log.device;
        let wipe = WipeBlock {
            method_id: log.method_id.clone(),
            started_at: started_at.clone(),
            ended_at,
            duration_seconds: log.duration_seconds,
            passes_completed: log.passes_completed,
            total_passes: log.total_passes,
            hardware_erase_used: log.hardware_erase_used,
            verification_passed: log.verification_passed,
            success: log.success,
            errors: log.errors.clone(),
            platform_tag: log.platform_tag.clone(),
            verification_note: log.verification_note.clone(),
        };

        let compliance_hash = Self::compliance_hash(&wipe)?;
        let mut standards = log.compliance_standards();
        if log.hardware_erase_used {
            standards.push("NIST SP 800-88 Rev.1 Purge (device-level erase)".to_string());
        }

        let mut certificate = Certificate {
            certificate_id: Self::certificate_id(device.fingerprint(), issued_at.timestamp())?,
            format_version: FORMAT_VERSION.to_string(),
            issued_at: issued_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            issuer: IssuerBlock {
                organization: self.issuer.organization.clone(),
                system_id: self.issuer.system_id.clone(),
                public_key_fingerprint: self.keystore.fingerprint().to_string(),
                authority_name: self.issuer.authority_name.clone(),
            },
            device: DeviceBlock {
                path: device.path.clone(),
                model: device.model.clone(),
                serial: device.serial.clone(),
                size_bytes: device.logical_bytes,
                size_human: device.size_human(),
                medium_class: device.medium_class.as_str().to_string(),
                interface: device.interface.clone(),
                fingerprint: device.fingerprint(),
            },
            wipe,
            compliance: ComplianceBlock {
                standards,
                compliance_hash,
            },
            security: SecurityBlock {
                signature_algorithm: SIGNATURE_ALGORITHM.to_string(),
                key_size: self.keystore.key_bits() as u32,
            },
            content_hash: String::new(),
            signature: String::new(),
        };

        certificate.content_hash = Self::content_hash(&certificate)?;
        certificate.signature = self.sign(&certificate)?;

        self.persist(&certificate)?;
        Ok(certificate)
    }

    /// Verify a certificate's content hash and signature against this
    /// system's key store. The issuer fingerprint must name a known key.
    pub fn verify(&self, certificate: &Certificate) -> bool {
        if certificate.issuer.public_key_fingerprint != self.keystore.fingerprint() {
            tracing::warn!(
                presented = %certificate.issuer.public_key_fingerprint,
                "certificate names an unknown signing key"
            );
            return false;
        }

        let Ok(expected_hash) = Self::content_hash(certificate) else {
            return false;
        };
        if expected_hash != certificate.content_hash {
            return false;
        }

        let Ok(signed) = Self::signed_payload(certificate) else {
            return false;
        };
        self.keystore.verify(&signed, &certificate.signature)
    }

    /// Verify a certificate JSON document loaded from disk
    pub fn verify_file(&self, path: &Path) -> WipeResult<bool> {
        let raw = fs::read_to_string(path)?;
        let certificate: Certificate = serde_json::from_str(&raw)
            .map_err(|e| WipeError::CryptoFailed(format!("certificate parse: {e}")))?;
        Ok(self.verify(&certificate))
    }

    /// Load a previously issued certificate by id
    pub fn load(&self, certificate_id: &str) -> WipeResult<Option<Certificate>> {
        let path = self.certificate_path(certificate_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let certificate = serde_json::from_str(&raw)
            .map_err(|e| WipeError::CryptoFailed(format!("certificate parse: {e}")))?;
        Ok(Some(certificate))
    }

    pub fn certificate_path(&self, certificate_id: &str) -> PathBuf {
        self.cert_dir.join(format!("{certificate_id}.json"))
    }

    fn persist(&self, certificate: &Certificate) -> WipeResult<()> {
        fs::create_dir_all(&self.cert_dir)?;
        let path = self.certificate_path(&certificate.certificate_id);
        let rendered = serde_json::to_string_pretty(certificate)
            .map_err(|e| WipeError::CryptoFailed(format!("certificate encode: {e}")))?;
        fs::write(&path, rendered)?;
        tracing::info!(
            certificate_id = %certificate.certificate_id,
            path = %path.display(),
            "certificate issued"
        );
        Ok(())
    }

    /// `EWSAFE-<hex unix time>-<hex sha256(device identity)[0..8]>-<hex random[0..4]>`
    fn certificate_id(device_fingerprint: String, now_unix: i64) -> WipeResult<String> {
        let device_digest = Sha256::digest(device_fingerprint.as_bytes());
        let mut nonce = [0u8; 4];
        secure_random_bytes(&mut nonce)
            .map_err(|e| WipeError::CryptoFailed(format!("certificate id rng: {e}")))?;

        Ok(format!(
            "EWSAFE-{:x}-{}-{}",
            now_unix,
            hex::encode(&device_digest[..8]),
            hex::encode(nonce)
        ))
    }

    /// Hash over the wipe facts a compliance auditor re-derives:
    /// `SHA256(canonical_json({method_id, passes_completed,
    /// verification_passed, platform_tag, started_at}))`
    fn compliance_hash(wipe: &WipeBlock) -> WipeResult<String> {
        let doc = json!({
            "method_id": wipe.method_id,
            "passes_completed": wipe.passes_completed,
            "verification_passed": wipe.verification_passed,
            "platform_tag": wipe.platform_tag,
            "started_at": wipe.started_at,
        });
        let bytes = canonical_bytes(&doc)
            .map_err(|e| WipeError::CryptoFailed(format!("compliance hash: {e}")))?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }

    /// Canonical certificate value with unsigned annotations removed
    fn stripped_value(certificate: &Certificate) -> WipeResult<Value> {
        let mut value = serde_json::to_value(certificate)
            .map_err(|e| WipeError::CryptoFailed(format!("certificate encode: {e}")))?;
        if let Value::Object(map) = &mut value {
            for field in UNSIGNED_FIELDS {
                map.remove(field);
            }
        }
        Ok(value)
    }

    /// `SHA256(canonical_json(certificate \ {content_hash, signature}))`
    fn content_hash(certificate: &Certificate) -> WipeResult<String> {
        let mut value = Self::stripped_value(certificate)?;
        if let Value::Object(map) = &mut value {
            map.remove("content_hash");
            map.remove("signature");
        }
        let canonical = canonical_json(&value)
            .map_err(|e| WipeError::CryptoFailed(format!("canonicalize: {e}")))?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// The signed region: everything except `signature`
    fn signed_payload(certificate: &Certificate) -> WipeResult<Vec<u8>> {
        let mut value = Self::stripped_value(certificate)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        canonical_bytes(&value).map_err(|e| WipeError::CryptoFailed(format!("canonicalize: {e}")))
    }

    fn sign(&self, certificate: &Certificate) -> WipeResult<String> {
        let payload = Self::signed_payload(certificate)?;
        self.keystore.sign(&payload)
    }
}

/// Human-readable certificate rendering for terminal display
pub fn render_certificate(certificate: &Certificate) -> String {
    let mut out = String::new();
    out.push_str("==========================================================\n");
    out.push_str("           SECURE DATA ERASURE CERTIFICATE\n");
    out.push_str("==========================================================\n");
    out.push_str(&format!("Certificate ID : {}\n", certificate.certificate_id));
    out.push_str(&format!("Issued at      : {}\n", certificate.issued_at));
    out.push_str(&format!(
        "Issuer         : {} ({})\n",
        certificate.issuer.organization, certificate.issuer.authority_name
    ));
    out.push_str("----------------------------------------------------------\n");
    out.push_str(&format!(
        "Device         : {} ({})\n",
        certificate.device.model, certificate.device.path
    ));
    out.push_str(&format!("Serial         : {}\n", certificate.device.serial));
    out.push_str(&format!(
        "Capacity       : {} ({} bytes)\n",
        certificate.device.size_human, certificate.device.size_bytes
    ));
    out.push_str(&format!("Medium         : {}\n", certificate.device.medium_class));
    out.push_str(&format!("Fingerprint    : {}\n", certificate.device.fingerprint));
    out.push_str("----------------------------------------------------------\n");
    out.push_str(&format!("Method         : {}\n", certificate.wipe.method_id));
    out.push_str(&format!(
        "Passes         : {}/{}\n",
        certificate.wipe.passes_completed, certificate.wipe.total_passes
    ));
    out.push_str(&format!(
        "Hardware erase : {}\n",
        if certificate.wipe.hardware_erase_used { "yes" } else { "no" }
    ));
    out.push_str(&format!(
        "Verification   : {}\n",
        if certificate.wipe.verification_passed { "passed" } else { "flagged" }
    ));
    if let Some(note) = &certificate.wipe.verification_note {
        out.push_str(&format!("Note           : {note}\n"));
    }
    out.push_str(&format!(
        "Standards      : {}\n",
        certificate.compliance.standards.join(", ")
    ));
    out.push_str("----------------------------------------------------------\n");
    out.push_str(&format!(
        "Signature      : {} ({} bit)\n",
        certificate.security.signature_algorithm, certificate.security.key_size
    ));
    out.push_str(&format!("Content hash   : {}\n", certificate.content_hash));
    out.push_str("==========================================================\n");
    out
}
