// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call ID generation.
//!
//! The default wire format is `call_` followed by 12 lowercase hex characters
//! from the OS CSPRNG.  Providers that require a stricter alphabet (exactly
//! 9 alphanumerics, no prefix) use [`IdProfile::StrictAlphanumeric`];
//! conversions between profiles happen at the wire boundary only.

use rand::rngs::OsRng;
use rand::RngCore;

/// ID alphabet profile required by the active provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdProfile {
    /// `call_` + 12 lowercase hex characters.
    #[default]
    Standard,
    /// Exactly 9 characters from `[A-Za-z0-9]`, no prefix.
    StrictAlphanumeric,
}

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Mint a fresh tool-call ID under the given profile.
pub fn generate(profile: IdProfile) -> String {
    match profile {
        IdProfile::Standard => {
            let mut bytes = [0u8; 6];
            OsRng.fill_bytes(&mut bytes);
            format!("call_{}", hex::encode(bytes))
        }
        IdProfile::StrictAlphanumeric => {
            let mut bytes = [0u8; 9];
            OsRng.fill_bytes(&mut bytes);
            bytes
                .iter()
                .map(|b| ALPHANUMERIC[*b as usize % ALPHANUMERIC.len()] as char)
                .collect()
        }
    }
}

/// Convert an existing ID to the strict 9-alphanumeric wire form.
///
/// Non-alphanumeric characters are dropped; the remainder is truncated or
/// padded with fresh random characters to exactly 9.  IDs already in strict
/// form pass through unchanged.
pub fn to_strict_wire(id: &str) -> String {
    let mut out: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).take(9).collect();
    while out.len() < 9 {
        let mut b = [0u8; 1];
        OsRng.fill_bytes(&mut b);
        out.push(ALPHANUMERIC[b[0] as usize % ALPHANUMERIC.len()] as char);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_ids_have_prefix_and_hex_suffix() {
        let id = generate(IdProfile::Standard);
        assert!(id.starts_with("call_"));
        let suffix = &id["call_".len()..];
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn standard_ids_are_unique() {
        let a = generate(IdProfile::Standard);
        let b = generate(IdProfile::Standard);
        assert_ne!(a, b);
    }

    #[test]
    fn strict_ids_are_nine_alphanumerics() {
        for _ in 0..100 {
            let id = generate(IdProfile::StrictAlphanumeric);
            assert_eq!(id.len(), 9);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn to_strict_wire_strips_prefix_punctuation() {
        let wire = to_strict_wire("call_ab12cd34ef56");
        assert_eq!(wire.len(), 9);
        assert!(wire.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(wire.starts_with("callab12c"));
    }

    #[test]
    fn to_strict_wire_pads_short_ids() {
        let wire = to_strict_wire("ab");
        assert_eq!(wire.len(), 9);
        assert!(wire.starts_with("ab"));
    }

    #[test]
    fn to_strict_wire_is_identity_for_strict_ids() {
        let id = generate(IdProfile::StrictAlphanumeric);
        assert_eq!(to_strict_wire(&id), id);
    }
}
