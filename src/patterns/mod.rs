//! Catalog of erase methods.
//!
//! A method is a frozen, ordered list of pass descriptors. Descriptors are a
//! closed sum: a constant byte, an alternating byte pair, or fresh
//! cryptographically secure random data. `Random` is materialized into a new
//! buffer for every pass at execution time and never cached.

use crate::crypto::secure_rng::secure_random_bytes;
use crate::{WipeError, WipeResult};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// One overwrite pass, resolved to bytes only at execution time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassDescriptor {
    /// Every byte of the pass is this value
    Constant(u8),
    /// The pass tiles this two-byte sequence
    Alternating([u8; 2]),
    /// Fresh CSPRNG output, new bytes per pass
    Random,
}

impl PassDescriptor {
    /// Fill `buf` with this pass's data. Constant and alternating patterns
    /// tile from offset 0 of the buffer; callers reuse one buffer across a
    /// pass, so tiling stays sector-aligned for any power-of-two buffer.
    pub fn materialize(&self, buf: &mut [u8]) -> WipeResult<()> {
        match self {
            PassDescriptor::Constant(b) => buf.fill(*b),
            PassDescriptor::Alternating(pair) => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = pair[i % 2];
                }
            }
            PassDescriptor::Random => {
                secure_random_bytes(buf)
                    .map_err(|e| WipeError::CryptoFailed(format!("pattern rng: {e}")))?;
            }
        }
        Ok(())
    }

    /// Deterministic descriptors produce the same bytes on every
    /// materialization; `Random` does not.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, PassDescriptor::Random)
    }

    pub fn describe(&self) -> String {
        match self {
            PassDescriptor::Constant(b) => format!("constant 0x{b:02X}"),
            PassDescriptor::Alternating([a, b]) => format!("alternating 0x{a:02X}/0x{b:02X}"),
            PassDescriptor::Random => "cryptographic random".to_string(),
        }
    }
}

/// A named erase method: immutable pass sequence plus the compliance tags it
/// was designed against.
#[derive(Debug, Clone)]
pub struct Method {
    pub id: &'static str,
    pub name: &'static str,
    pub passes: Vec<PassDescriptor>,
    pub compliance: Vec<&'static str>,
}

impl Method {
    pub fn total_passes(&self) -> u32 {
        self.passes.len() as u32
    }
}

use PassDescriptor::{Alternating, Constant, Random};

/// The Gutmann-style middle block: deterministic patterns between the random
/// lead-in and lead-out passes.
const MIXED_35_MIDDLE: [PassDescriptor; 27] = [
    Constant(0x55),
    Constant(0xAA),
    Alternating([0x92, 0x49]),
    Alternating([0x49, 0x92]),
    Alternating([0x24, 0x92]),
    Constant(0x00),
    Constant(0x11),
    Constant(0x22),
    Constant(0x33),
    Constant(0x44),
    Constant(0x55),
    Constant(0x66),
    Constant(0x77),
    Constant(0x88),
    Constant(0x99),
    Constant(0xAA),
    Constant(0xBB),
    Constant(0xCC),
    Constant(0xDD),
    Constant(0xEE),
    Constant(0xFF),
    Alternating([0x92, 0x49]),
    Alternating([0x49, 0x92]),
    Alternating([0x24, 0x92]),
    Alternating([0x6D, 0xB6]),
    Alternating([0xB6, 0xDB]),
    Alternating([0xDB, 0x6D]),
];

fn build_catalog() -> Vec<Method> {
    let mut mixed_35 = vec![Random; 4];
    mixed_35.extend_from_slice(&MIXED_35_MIDDLE);
    mixed_35.extend(std::iter::repeat(Random).take(4));

    vec![
        Method {
            id: "nist_clear",
            name: "NIST Clear (single zero pass)",
            passes: vec![Constant(0x00)],
            compliance: vec!["NIST SP 800-88 Rev.1 Clear"],
        },
        Method {
            id: "nist_purge",
            name: "NIST Purge overwrite (zero, ones, random)",
            passes: vec![Constant(0x00), Constant(0xFF), Random],
            compliance: vec!["NIST SP 800-88 Rev.1 Purge (overwrite)"],
        },
        Method {
            id: "dod_5220_22m",
            name: "DoD 5220.22-M ECE (seven pass)",
            passes: vec![
                Constant(0x35),
                Alternating([0x55, 0xAA]),
                Constant(0x97),
                Constant(0x00),
                Constant(0xFF),
                Alternating([0x92, 0x49]),
                Random,
            ],
            compliance: vec!["DoD 5220.22-M ECE"],
        },
        Method {
            id: "random7",
            name: "Seven random passes",
            passes: vec![Random; 7],
            compliance: vec!["BSI-GS", "VSITR-equivalent"],
        },
        Method {
            id: "gutmann",
            name: "Gutmann 35-pass mixed sequence",
            passes: mixed_35,
            compliance: vec!["Gutmann (1996)"],
        },
    ]
}

lazy_static! {
    static ref CATALOG: Vec<Method> = build_catalog();
}

/// All known methods, in catalog order
pub fn catalog() -> &'static [Method] {
    &CATALOG
}

/// Look up a method by id
pub fn method(id: &str) -> Option<&'static Method> {
    CATALOG.iter().find(|m| m.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_contains_required_methods() {
        for (id, passes) in [
            ("nist_clear", 1),
            ("nist_purge", 3),
            ("dod_5220_22m", 7),
            ("random7", 7),
            ("gutmann", 35),
        ] {
            let m = method(id).unwrap_or_else(|| panic!("missing method {id}"));
            assert_eq!(m.total_passes(), passes, "{id} pass count");
        }
    }

    #[test]
    fn unknown_method_is_absent() {
        assert!(method("nist_obliterate").is_none());
    }

    #[test]
    fn nist_purge_sequence_is_zero_ones_random() {
        let m = method("nist_purge").unwrap();
        assert_eq!(m.passes[0], Constant(0x00));
        assert_eq!(m.passes[1], Constant(0xFF));
        assert_eq!(m.passes[2], Random);
    }

    #[test]
    fn gutmann_has_random_head_and_tail() {
        let m = method("gutmann").unwrap();
        assert!(m.passes[..4].iter().all(|p| *p == Random));
        assert!(m.passes[31..].iter().all(|p| *p == Random));
        assert!(m.passes[4..31].iter().all(|p| p.is_deterministic()));
    }

    #[test]
    fn constant_tiles_whole_buffer() {
        let mut buf = vec![0xEEu8; 4096];
        Constant(0x5A).materialize(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn alternating_tiles_in_order() {
        let mut buf = vec![0u8; 1024];
        Alternating([0xDE, 0xAD]).materialize(&mut buf).unwrap();
        for (i, &b) in buf.iter().enumerate() {
            assert_eq!(b, if i % 2 == 0 { 0xDE } else { 0xAD });
        }
    }

    #[test]
    fn random_passes_do_not_repeat() {
        let mut a = vec![0u8; 64 * 1024];
        let mut b = vec![0u8; 64 * 1024];
        Random.materialize(&mut a).unwrap();
        Random.materialize(&mut b).unwrap();
        // Collision over 64 KiB of CSPRNG output is negligible
        assert_ne!(a, b);
    }
}
