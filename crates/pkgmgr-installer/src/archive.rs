use std::fs;
use std::io;
use std::path::Path;

use pkgmgr_core::{
    CertificateSet, InstallOutcome, PackageDescriptor, PackageManagerError, PmResult,
};
use pkgmgr_security::{archive_signing_payload, verify_signer_hex};
use serde::{Deserialize, Serialize};

use crate::collaborators::{ArchiveParser, LiteDescriptor};
use crate::fs_utils::{child_dirs, dir_size};

pub const MANIFEST_FILE: &str = "manifest.toml";
pub const SIGNATURES_FILE: &str = "signatures.toml";
pub const CODE_FILE: &str = "code.bin";
pub const NATIVE_LIB_DIR: &str = "lib";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSigner {
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturesFile {
    #[serde(default)]
    pub signers: Vec<ArchiveSigner>,
}

/// Reads the directory archive format: a TOML manifest, a signer list, an
/// optional bytecode payload and per-ABI native libraries.
#[derive(Debug, Clone, Default)]
pub struct ManifestArchiveParser;

impl ManifestArchiveParser {
    pub fn new() -> Self {
        Self
    }

    fn read_manifest(archive: &Path) -> PmResult<(Vec<u8>, PackageDescriptor)> {
        if !archive.is_dir() {
            return Err(PackageManagerError::new(
                InstallOutcome::ParseFailedNotApk,
                format!("archive is not a directory: {}", archive.display()),
            ));
        }
        let manifest_path = archive.join(MANIFEST_FILE);
        let manifest = match fs::read(&manifest_path) {
            Ok(manifest) => manifest,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedNotApk,
                    format!("archive has no {MANIFEST_FILE}: {}", archive.display()),
                ));
            }
            Err(err) => {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedUnexpectedException,
                    format!("failed to read {}: {err}", manifest_path.display()),
                ));
            }
        };
        let text = std::str::from_utf8(&manifest).map_err(|_| {
            PackageManagerError::new(
                InstallOutcome::ParseFailedBadManifest,
                format!("{} is not valid UTF-8", manifest_path.display()),
            )
        })?;
        let descriptor = PackageDescriptor::from_toml_str(text)?;
        Ok((manifest, descriptor))
    }

    fn native_abis(archive: &Path, declared: &[String]) -> PmResult<Vec<String>> {
        if !declared.is_empty() {
            return Ok(declared.to_vec());
        }
        let dirs = child_dirs(&archive.join(NATIVE_LIB_DIR))
            .map_err(|err| PackageManagerError::from_anyhow(InstallOutcome::InvalidApk, &err))?;
        Ok(dirs
            .iter()
            .filter_map(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn read_certificates(archive: &Path, manifest: &[u8], code: Option<&[u8]>) -> PmResult<CertificateSet> {
        let path = archive.join(SIGNATURES_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedNoCertificates,
                    format!("archive is not signed: {}", archive.display()),
                ));
            }
            Err(err) => {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedUnexpectedException,
                    format!("failed to read {}: {err}", path.display()),
                ));
            }
        };
        let signatures: SignaturesFile = toml::from_str(&content).map_err(|err| {
            PackageManagerError::new(
                InstallOutcome::ParseFailedCertificateEncoding,
                format!("failed to parse {}: {err}", path.display()),
            )
        })?;
        if signatures.signers.is_empty() {
            return Err(PackageManagerError::new(
                InstallOutcome::ParseFailedNoCertificates,
                format!("{} lists no signers", path.display()),
            ));
        }

        let payload = archive_signing_payload(manifest, code);
        for signer in &signatures.signers {
            let verified = verify_signer_hex(&payload, &signer.public_key, &signer.signature)
                .map_err(|err| {
                    PackageManagerError::from_anyhow(
                        InstallOutcome::ParseFailedCertificateEncoding,
                        &err,
                    )
                })?;
            if !verified {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedInconsistentCertificates,
                    format!(
                        "signature of {} does not match archive contents",
                        signer.public_key
                    ),
                ));
            }
        }

        Ok(CertificateSet::new(
            signatures.signers.iter().map(|signer| signer.public_key.as_str()),
        ))
    }
}

impl ArchiveParser for ManifestArchiveParser {
    fn parse_lite(&self, archive: &Path) -> PmResult<LiteDescriptor> {
        let (_, descriptor) = Self::read_manifest(archive)?;
        let native_abis = Self::native_abis(archive, &descriptor.native_abis)?;
        let size_bytes = dir_size(archive).map_err(|err| {
            PackageManagerError::from_anyhow(InstallOutcome::ParseFailedUnexpectedException, &err)
        })?;
        Ok(LiteDescriptor {
            name: descriptor.name,
            version_code: descriptor.version_code,
            install_location: descriptor.install_location,
            native_abis,
            child_names: descriptor
                .child_packages
                .iter()
                .map(|child| child.name.clone())
                .collect(),
            size_bytes,
            path: archive.to_path_buf(),
        })
    }

    fn parse(&self, archive: &Path) -> PmResult<PackageDescriptor> {
        let (manifest, mut descriptor) = Self::read_manifest(archive)?;
        let code_path = archive.join(CODE_FILE);
        let code = match fs::read(&code_path) {
            Ok(code) => Some(code),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(PackageManagerError::new(
                    InstallOutcome::ParseFailedUnexpectedException,
                    format!("failed to read {}: {err}", code_path.display()),
                ));
            }
        };
        if descriptor.flags.has_code && code.is_none() {
            return Err(PackageManagerError::new(
                InstallOutcome::InvalidApk,
                format!("package {} declares code but has no {CODE_FILE}", descriptor.name),
            ));
        }

        descriptor.certificates = Self::read_certificates(archive, &manifest, code.as_deref())?;
        descriptor.native_abis = Self::native_abis(archive, &descriptor.native_abis)?;
        descriptor.code_path = archive.to_path_buf();
        descriptor.propagate_to_children();
        Ok(descriptor)
    }
}
