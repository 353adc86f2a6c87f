use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use pkgmgr_core::CertificateSet;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Stable identity of a signer set: sha256 over the sorted keys, one per line.
pub fn certificate_fingerprint(certificates: &CertificateSet) -> String {
    let mut hasher = Sha256::new();
    for key in certificates.keys() {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn certificate_fingerprint_ignores_input_order_and_case() {
        let first = CertificateSet::new(["aa", "BB"]);
        let second = CertificateSet::new(["bb", "AA"]);
        assert_eq!(
            certificate_fingerprint(&first),
            certificate_fingerprint(&second)
        );
        assert_ne!(
            certificate_fingerprint(&first),
            certificate_fingerprint(&CertificateSet::new(["aa"]))
        );
    }

    #[test]
    fn sha256_file_hex_hashes_file_contents() {
        let path = std::env::temp_dir().join(format!(
            "pkgmgr-security-checksum-{}.bin",
            std::process::id()
        ));
        std::fs::write(&path, b"").expect("must write fixture");
        let digest = sha256_file_hex(&path).expect("must hash file");
        assert_eq!(digest, sha256_hex(b""));
        let _ = std::fs::remove_file(&path);
    }
}
