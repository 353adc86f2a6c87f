use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::checksum::sha256_hex;

pub const ARCHIVE_SIGNATURE_DOMAIN: &str = "pkgmgr-archive-v1";

/// Bytes each archive signer signs: a domain tag followed by the digests of
/// the manifest and of the bytecode payload (empty when absent).
pub fn archive_signing_payload(manifest: &[u8], code: Option<&[u8]>) -> Vec<u8> {
    format!(
        "{ARCHIVE_SIGNATURE_DOMAIN}\n{}\n{}",
        sha256_hex(manifest),
        sha256_hex(code.unwrap_or_default())
    )
    .into_bytes()
}

/// Returns `Ok(false)` for a well-formed signature that does not verify and
/// an error when the key or signature cannot be decoded.
pub fn verify_signer_hex(payload: &[u8], public_key_hex: &str, signature_hex: &str) -> Result<bool> {
    let public_key_bytes =
        hex::decode(public_key_hex.trim()).context("failed to decode Ed25519 public key hex")?;
    let signature_bytes =
        hex::decode(signature_hex.trim()).context("failed to decode Ed25519 signature hex")?;
    let public_key_len = public_key_bytes.len();
    let signature_len = signature_bytes.len();

    let public_key_array: [u8; 32] = public_key_bytes.try_into().map_err(|_| {
        anyhow::anyhow!(
            "invalid Ed25519 public key length: expected 32 bytes, got {}",
            public_key_len
        )
    })?;
    let signature_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
        anyhow::anyhow!(
            "invalid Ed25519 signature length: expected 64 bytes, got {}",
            signature_len
        )
    })?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key_array).context("invalid Ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    fn signer(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn verify_signer_accepts_valid_archive_signature() {
        let key = signer(7);
        let payload = archive_signing_payload(b"name = \"com.example.a\"", Some(b"code"));
        let signature = key.sign(&payload);

        let verified = verify_signer_hex(
            &payload,
            &hex::encode(key.verifying_key().to_bytes()),
            &hex::encode(signature.to_bytes()),
        )
        .expect("verification must complete");

        assert!(verified);
    }

    #[test]
    fn verify_signer_returns_false_for_tampered_code() {
        let key = signer(7);
        let signed = archive_signing_payload(b"manifest", Some(b"code"));
        let tampered = archive_signing_payload(b"manifest", Some(b"c0de"));
        let signature = key.sign(&signed);

        let verified = verify_signer_hex(
            &tampered,
            &hex::encode(key.verifying_key().to_bytes()),
            &hex::encode(signature.to_bytes()),
        )
        .expect("verification must complete");

        assert!(!verified);
    }

    #[test]
    fn payload_without_code_hashes_empty_input() {
        let without = archive_signing_payload(b"manifest", None);
        let empty = archive_signing_payload(b"manifest", Some(b""));
        assert_eq!(without, empty);
        let text = String::from_utf8(without).expect("payload must be utf-8");
        assert!(text.starts_with("pkgmgr-archive-v1\n"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn verify_signer_errors_for_invalid_signature_hex_or_length() {
        let public_key_hex = hex::encode(signer(1).verifying_key().to_bytes());

        assert!(verify_signer_hex(b"", &public_key_hex, "zz").is_err());
        assert!(verify_signer_hex(b"", &public_key_hex, "00").is_err());
    }

    #[test]
    fn verify_signer_errors_for_invalid_public_key_hex_or_length() {
        let signature_hex = hex::encode(signer(1).sign(b"").to_bytes());

        assert!(verify_signer_hex(b"", "zz", &signature_hex).is_err());
        assert!(verify_signer_hex(b"", "00", &signature_hex).is_err());
    }
}
