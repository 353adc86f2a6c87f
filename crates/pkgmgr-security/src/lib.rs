mod checksum;
mod ed25519;
mod signatures;

pub use checksum::{certificate_fingerprint, sha256_file_hex, sha256_hex};
pub use ed25519::{archive_signing_payload, verify_signer_hex, ARCHIVE_SIGNATURE_DOMAIN};
pub use signatures::{
    compare_signatures, satisfies_upgrade_key_sets, update_signatures_acceptable, SignatureMatch,
};
