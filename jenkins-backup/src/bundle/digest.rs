//! Detached SHA-256 digests.
//!
//! The sidecar holds a single `sha256sum`-compatible line,
//! `<hex>  <bundle file name>`, so `sha256sum -c` can check it too.

use super::digest_path;
use crate::utils::errors::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Outcome of checking a bundle against its sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestStatus {
    /// Sidecar present and matching
    Verified(String),
    /// No sidecar next to the bundle
    Unverified,
}

/// Computes and checks bundle digests
pub trait DigestVerifier: Send + Sync {
    /// Hex digest of a whole file
    fn digest(&self, path: &Path) -> Result<String>;

    /// Compare `bundle` against `<bundle>.sha256`. A mismatch is an error; a
    /// missing sidecar is reported as [`DigestStatus::Unverified`].
    fn verify(&self, bundle: &Path) -> Result<DigestStatus> {
        let sidecar = digest_path(bundle);
        let record = match fs::read_to_string(&sidecar) {
            Ok(record) => record,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(bundle = %bundle.display(), "No digest file, restoring unverified");
                return Ok(DigestStatus::Unverified);
            }
            Err(e) => return Err(e.into()),
        };

        let expected = parse_record(&record)
            .map(|(hex, _)| hex.to_ascii_lowercase())
            .ok_or_else(|| BackupError::InvalidDigestFile(sidecar.clone()))?;
        let actual = self.digest(bundle)?;

        if expected != actual {
            return Err(BackupError::DigestMismatch {
                path: bundle.to_path_buf(),
                expected,
                actual,
            });
        }

        Ok(DigestStatus::Verified(actual))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Verifier;

impl DigestVerifier for Sha256Verifier {
    fn digest(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// `<hex>  <file name>\n`
pub fn render_record(hex: &str, file_name: &str) -> String {
    format!("{}  {}\n", hex, file_name)
}

/// Parse the first line of a sidecar into `(hex, file name)`
pub fn parse_record(text: &str) -> Option<(String, String)> {
    let line = text.lines().next()?.trim();
    let (hex, rest) = line.split_once(char::is_whitespace)?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    // "*" marks binary mode in sha256sum output
    let name = rest.trim_start().trim_start_matches('*');
    Some((hex.to_string(), name.to_string()))
}

/// Write the sidecar for `bundle` into `dir`, named after the bundle
pub fn write_sidecar(dir: &Path, bundle_file_name: &str, hex: &str) -> Result<PathBuf> {
    let path = digest_path(&dir.join(bundle_file_name));
    fs::write(&path, render_record(hex, bundle_file_name))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NAME: &str = "jenkins-backup-20240101T000000Z.tar.zst";

    fn bundle_with_sidecar(dir: &Path, payload: &[u8]) -> PathBuf {
        let bundle = dir.join(NAME);
        fs::write(&bundle, payload).unwrap();
        let hex = Sha256Verifier.digest(&bundle).unwrap();
        write_sidecar(dir, NAME, &hex).unwrap();
        bundle
    }

    #[test]
    fn test_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            Sha256Verifier.digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sidecar_format_matches_sha256sum() {
        let record = render_record(&"a".repeat(64), NAME);
        assert_eq!(record, format!("{}  {}\n", "a".repeat(64), NAME));
        assert_eq!(parse_record(&record), Some(("a".repeat(64), NAME.to_string())));
        assert_eq!(
            parse_record(&format!("{} *{}\n", "b".repeat(64), NAME)),
            Some(("b".repeat(64), NAME.to_string()))
        );
        assert!(parse_record("not-a-digest  file\n").is_none());
    }

    #[test]
    fn test_unmodified_bundle_verifies() {
        let dir = TempDir::new().unwrap();
        let bundle = bundle_with_sidecar(dir.path(), b"bundle payload");
        assert!(matches!(
            Sha256Verifier.verify(&bundle).unwrap(),
            DigestStatus::Verified(_)
        ));
    }

    #[test]
    fn test_single_byte_mutation_fails() {
        let dir = TempDir::new().unwrap();
        let bundle = bundle_with_sidecar(dir.path(), b"bundle payload");

        let mut bytes = fs::read(&bundle).unwrap();
        bytes[3] ^= 0x01;
        fs::write(&bundle, bytes).unwrap();

        let err = Sha256Verifier.verify(&bundle).unwrap_err();
        assert!(matches!(err, BackupError::DigestMismatch { .. }));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_missing_sidecar_is_unverified() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join(NAME);
        fs::write(&bundle, b"payload").unwrap();
        assert_eq!(Sha256Verifier.verify(&bundle).unwrap(), DigestStatus::Unverified);
    }

    #[test]
    fn test_garbage_sidecar_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join(NAME);
        fs::write(&bundle, b"payload").unwrap();
        fs::write(digest_path(&bundle), b"corrupted\n").unwrap();

        assert!(matches!(
            Sha256Verifier.verify(&bundle),
            Err(BackupError::InvalidDigestFile(_))
        ));
    }
}
