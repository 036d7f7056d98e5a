//! Attestation pipeline integration: issue/verify round trips, tamper
//! evidence, persistence, and key stability across pipeline instances.

mod common;

use common::sim::SimAdapter;
use ewsafe_wipe::crypto::canonical::canonical_json;
use ewsafe_wipe::crypto::{AttestationPipeline, Certificate, IssuerIdentity, KeyStore};
use ewsafe_wipe::engine::{null_progress, WipeEngine, WipeLog};
use ewsafe_wipe::{CancelToken, MediumClass};
use std::sync::Arc;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn successful_log(name: &str) -> WipeLog {
    ewsafe_wipe::reset_interrupted();
    let adapter = Arc::new(SimAdapter::new());
    let device = adapter.add_device(name, 8 * MIB, MediumClass::RotationalHdd, 0xAB);
    let engine = WipeEngine::new(adapter.clone());
    let log = engine.wipe(&device, "nist_clear", &CancelToken::new(), &null_progress());
    assert!(log.success, "fixture wipe must succeed");
    log
}

fn pipeline_in(dir: &TempDir) -> AttestationPipeline {
    let keystore = KeyStore::open(dir.path().join("master_key.pem")).unwrap();
    AttestationPipeline::new(
        keystore,
        dir.path().join("certificates"),
        IssuerIdentity::default(),
    )
}

#[test]
fn issue_verify_roundtrip() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(&dir);
    let log = successful_log("rt");

    let certificate = pipeline.issue(&log).unwrap();
    assert!(pipeline.verify(&certificate));

    assert_eq!(certificate.format_version, "1.0");
    assert_eq!(certificate.security.signature_algorithm, "RSA-PSS-SHA256");
    assert!(certificate.security.key_size >= 2048);
    assert_eq!(certificate.content_hash.len(), 64);
    assert_eq!(
        certificate.issuer.public_key_fingerprint,
        pipeline.keystore().fingerprint()
    );
}

#[test]
fn any_mutation_of_signed_fields_breaks_verification() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(&dir);
    let certificate = pipeline.issue(&successful_log("mt")).unwrap();

    let mut tampered = certificate.clone();
    tampered.device.serial = format!("{}X", tampered.device.serial);
    assert!(!pipeline.verify(&tampered));

    let mut tampered = certificate.clone();
    tampered.wipe.passes_completed += 1;
    assert!(!pipeline.verify(&tampered));

    let mut tampered = certificate.clone();
    tampered.wipe.verification_passed = !tampered.wipe.verification_passed;
    assert!(!pipeline.verify(&tampered));

    let mut tampered = certificate.clone();
    tampered.compliance.standards.push("ISO 99999".to_string());
    assert!(!pipeline.verify(&tampered));

    // Tampering with the hash itself is also caught
    let mut tampered = certificate.clone();
    tampered.content_hash = tampered.content_hash.replace(
        tampered.content_hash.chars().next().unwrap(),
        if tampered.content_hash.starts_with('0') { "1" } else { "0" },
    );
    assert!(!pipeline.verify(&tampered));

    // And so is swapping in a signature from a different certificate
    let other = pipeline.issue(&successful_log("mt2")).unwrap();
    let mut tampered = certificate.clone();
    tampered.signature = other.signature;
    assert!(!pipeline.verify(&tampered));
}

#[test]
fn persisted_certificate_loads_and_verifies() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(&dir);
    let certificate = pipeline.issue(&successful_log("ld")).unwrap();

    let loaded = pipeline
        .load(&certificate.certificate_id)
        .unwrap()
        .expect("certificate must be on disk");
    assert!(pipeline.verify(&loaded));
    assert_eq!(loaded.certificate_id, certificate.certificate_id);

    assert!(pipeline.load("EWSAFE-ffffffff-0000-0000").unwrap().is_none());

    // File-level verification matches the in-memory path
    let path = pipeline.certificate_path(&certificate.certificate_id);
    assert!(pipeline.verify_file(&path).unwrap());
}

#[test]
fn verification_survives_json_reordering() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(&dir);
    let certificate = pipeline.issue(&successful_log("ro")).unwrap();

    // Re-encode through a Value, which re-orders object keys internally;
    // semantic equality must be enough for verification
    let value = serde_json::to_value(&certificate).unwrap();
    let reparsed: Certificate = serde_json::from_value(value).unwrap();
    assert!(pipeline.verify(&reparsed));

    // Canonical forms of both encodings are byte-identical
    assert_eq!(
        canonical_json(&certificate).unwrap(),
        canonical_json(&reparsed).unwrap()
    );
}

#[test]
fn key_store_is_stable_across_pipeline_instances() {
    let dir = TempDir::new().unwrap();

    let first = pipeline_in(&dir);
    let certificate = first.issue(&successful_log("ks")).unwrap();
    let first_fingerprint = first.keystore().fingerprint().to_string();
    drop(first);

    // A fresh pipeline over the same data directory loads the same key
    let second = pipeline_in(&dir);
    assert_eq!(second.keystore().fingerprint(), first_fingerprint);
    assert!(second.verify(&certificate));
}

#[test]
fn foreign_key_certificates_are_rejected() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    let issuer = pipeline_in(&dir_a);
    let stranger = pipeline_in(&dir_b);

    let certificate = issuer.issue(&successful_log("fk")).unwrap();
    assert!(issuer.verify(&certificate));
    // A different key store must not vouch for this certificate
    assert!(!stranger.verify(&certificate));
}

#[test]
fn failed_and_cancelled_logs_are_never_certified() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(&dir);

    let mut log = successful_log("nc");
    log.success = false;
    assert!(pipeline.issue(&log).is_err());
}

#[test]
fn certificate_ids_are_unique_per_issue() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline_in(&dir);
    let log = successful_log("uq");

    let a = pipeline.issue(&log).unwrap();
    let b = pipeline.issue(&log).unwrap();
    assert_ne!(a.certificate_id, b.certificate_id);
}
