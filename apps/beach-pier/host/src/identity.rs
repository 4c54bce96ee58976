//! Persistent host identity.
//!
//! The self-signed certificate and its PKCS#8 key live as DER files in the
//! per-user data directory. Returning clients compare the certificate's
//! SHA-256 fingerprint with the one they pinned on first contact, so the pair
//! is regenerated only when it is missing or unreadable.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

pub const CERT_FILE: &str = "host.crt";
pub const KEY_FILE: &str = "host.key";

/// Names baked into the certificate. Clients verify by fingerprint, not name.
pub const SUBJECT_ALT_NAMES: &[&str] = &["beach-pier", "localhost"];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity io error: {0}")]
    Io(#[from] io::Error),
    #[error("certificate generation failed: {0}")]
    Generate(String),
    #[error("stored identity is corrupt: {0}")]
    Corrupt(String),
    #[error("could not determine a data directory for this user")]
    NoDataDir,
}

#[derive(Clone)]
pub struct HostIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    fingerprint: String,
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl HostIdentity {
    pub fn generate() -> Result<Self, IdentityError> {
        let names: Vec<String> = SUBJECT_ALT_NAMES.iter().map(|s| s.to_string()).collect();
        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|err| IdentityError::Generate(err.to_string()))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|err| IdentityError::Generate(err.to_string()))?;
        let key_der = cert.serialize_private_key_der();
        Ok(Self::from_parts(cert_der, key_der))
    }

    /// Validates DER-encoded parts read back from disk.
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self, IdentityError> {
        if !is_der_sequence(&cert_der) {
            return Err(IdentityError::Corrupt(format!("{CERT_FILE} is not DER")));
        }
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der.clone()));
        rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|err| IdentityError::Corrupt(format!("{KEY_FILE}: {err}")))?;
        Ok(Self::from_parts(cert_der, key_der))
    }

    fn from_parts(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        let fingerprint = fingerprint(&cert_der);
        Self {
            cert_der,
            key_der,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// SHA-256 of the certificate's DER encoding as lowercase colon-separated hex.
pub fn fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    digest
        .iter()
        .map(|byte| hex::encode([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$XDG_DATA_HOME/beach-pier` on Linux and the platform equivalent elsewhere.
    pub fn default_dir() -> Result<PathBuf, IdentityError> {
        ProjectDirs::from("dev", "beach", "beach-pier")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(IdentityError::NoDataDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// `Ok(None)` when either file is missing.
    pub fn load(&self) -> Result<Option<HostIdentity>, IdentityError> {
        let Some(cert_der) = read_optional(&self.cert_path())? else {
            return Ok(None);
        };
        let Some(key_der) = read_optional(&self.key_path())? else {
            return Ok(None);
        };
        HostIdentity::from_der(cert_der, key_der).map(Some)
    }

    pub fn save(&self, identity: &HostIdentity) -> Result<(), IdentityError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.cert_path(), identity.cert_der())?;
        write_private(&self.key_path(), &identity.key_der)?;
        Ok(())
    }

    pub fn load_or_generate(&self) -> Result<HostIdentity, IdentityError> {
        match self.load() {
            Ok(Some(identity)) => {
                info!(
                    dir = %self.dir.display(),
                    fingerprint = identity.fingerprint(),
                    "loaded host identity"
                );
                return Ok(identity);
            }
            Ok(None) => {}
            Err(IdentityError::Corrupt(reason)) => {
                warn!(dir = %self.dir.display(), %reason, "regenerating corrupt host identity");
            }
            Err(err) => return Err(err),
        }

        let identity = HostIdentity::generate()?;
        self.save(&identity)?;
        info!(
            dir = %self.dir.display(),
            fingerprint = identity.fingerprint(),
            "generated new host identity"
        );
        Ok(identity)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, IdentityError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    #[cfg(unix)]
    {
        // `mode` only applies on creation; tighten files left by older runs.
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// Checks for a single DER SEQUENCE spanning the whole buffer.
fn is_der_sequence(bytes: &[u8]) -> bool {
    let (Some(&tag), Some(&first_len)) = (bytes.first(), bytes.get(1)) else {
        return false;
    };
    if tag != 0x30 {
        return false;
    }
    let (header, len) = if first_len & 0x80 == 0 {
        (2, first_len as usize)
    } else {
        let count = (first_len & 0x7f) as usize;
        if count == 0 || count > 4 || bytes.len() < 2 + count {
            return false;
        }
        let len = bytes[2..2 + count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (2 + count, len)
    };
    header + len == bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        let first = store.load_or_generate().unwrap();
        let second = store.load_or_generate().unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.cert_der(), second.cert_der());
    }

    #[test]
    fn fingerprint_format() {
        let identity = HostIdentity::generate().unwrap();
        let fp = identity.fingerprint();
        let pairs: Vec<&str> = fp.split(':').collect();
        assert_eq!(pairs.len(), 32);
        assert!(pairs
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))));
        assert_eq!(fp, fingerprint(identity.cert_der()));
    }

    #[test]
    fn corrupt_files_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let original = store.load_or_generate().unwrap();

        fs::write(store.key_path(), b"not a key").unwrap();
        assert!(matches!(store.load(), Err(IdentityError::Corrupt(_))));

        let replaced = store.load_or_generate().unwrap();
        assert_ne!(original.fingerprint(), replaced.fingerprint());
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn truncated_certificate_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let identity = store.load_or_generate().unwrap();
        let der = identity.cert_der();
        fs::write(store.cert_path(), &der[..der.len() / 2]).unwrap();
        assert!(matches!(store.load(), Err(IdentityError::Corrupt(_))));
    }

    #[test]
    fn missing_key_means_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        store.load_or_generate().unwrap();
        fs::remove_file(store.key_path()).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path().join("nested"));
        store.load_or_generate().unwrap();
        let mode = fs::metadata(store.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
