//! Certificate storage
//!
//! Persists certificates and private keys to a flat, domain-keyed directory
//! that a reverse proxy can read directly.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── account.json              # ACME account credentials (opaque, serialized)
//! ├── example.com.crt           # Certificate chain, leaf first (0644)
//! ├── example.com.key           # Private key (0600)
//! └── example.com.issuer.crt    # Issuer chain, when the CA returned one
//! ```
//!
//! # Saving
//!
//! A save replaces up to three files, and they must change together: a new
//! key next to an old certificate is a broken credential. A save therefore
//!
//! 1. writes and syncs every new file to a temporary in the same directory,
//! 2. hard-links each existing file to `<file>.bak`,
//! 3. drops a `<domain>.pending` marker,
//! 4. renames the temporaries into place,
//! 5. removes the marker, then the backups.
//!
//! A failed rename restores the backups before the error is returned. A
//! marker left behind by a crash is rolled back the next time the storage is
//! opened, so the loader only ever sees a complete old or new set.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};

use crate::certificate::Certificate;
use crate::error::StorageError;

/// Extension of certificate files
const CERT_EXTENSION: &str = ".crt";

/// Extension of private key files
const KEY_EXTENSION: &str = ".key";

/// Suffix (before `.crt`) of per-domain issuer files
const ISSUER_SUFFIX: &str = ".issuer";

/// Reserved unqualified issuer file name
const RESERVED_ISSUER: &str = "issuer";

/// ACME account credentials file
const ACCOUNT_FILE: &str = "account.json";

/// Suffix of the pre-save copy of a replaced file
const BACKUP_EXTENSION: &str = ".bak";

/// Suffix of the marker of a save in progress
const PENDING_EXTENSION: &str = ".pending";

#[cfg(unix)]
const CERT_MODE: u32 = 0o644;
#[cfg(unix)]
const KEY_MODE: u32 = 0o600;

/// Certificate storage manager
///
/// Handles persistent storage of certificates, keys and ACME account
/// credentials. Writes are atomic per file; keys and credentials are
/// owner-only.
#[derive(Debug)]
pub struct CertificateStorage {
    /// Base storage directory
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open (and create if needed) the storage directory
    ///
    /// Saves interrupted by a crash are rolled back here.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path)?;

        let storage = Self {
            base_path: base_path.to_path_buf(),
        };
        storage.recover_interrupted_saves()?;

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(storage)
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Load raw credentials JSON (for `instant_acme::AccountCredentials`)
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join(ACCOUNT_FILE);

        if !creds_path.exists() {
            trace!("No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&creds_path)?;
        debug!("Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    /// Save raw credentials JSON (owner-only)
    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        let creds_path = self.base_path.join(ACCOUNT_FILE);
        self.write_atomic(&creds_path, json.as_bytes(), true)?;

        info!("Saved ACME credentials JSON");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    /// Paths of a domain's certificate and key files
    ///
    /// The paths are derived, the files may not exist.
    pub fn certificate_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        (self.cert_path(domain), self.key_path(domain))
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.base_path.join(format!("{domain}{CERT_EXTENSION}"))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.base_path.join(format!("{domain}{KEY_EXTENSION}"))
    }

    fn issuer_path(&self, domain: &str) -> PathBuf {
        self.base_path
            .join(format!("{domain}{ISSUER_SUFFIX}{CERT_EXTENSION}"))
    }

    fn pending_path(&self, domain: &str) -> PathBuf {
        self.base_path.join(format!("{domain}{PENDING_EXTENSION}"))
    }

    /// Persist a certificate, replacing whatever was stored for its domain
    ///
    /// All or nothing: on error the previously stored files are left as they
    /// were.
    pub fn save(&self, cert: &Certificate) -> Result<(), StorageError> {
        let domain = cert.domain();
        validate_domain(domain)?;

        // Key before certificate: a domain is only listed once its .crt exists.
        let mut staged = vec![
            StagedFile {
                target: self.key_path(domain),
                contents: Some(self.stage(cert.private_key_pem(), true)?),
            },
            StagedFile {
                target: self.cert_path(domain),
                contents: Some(self.stage(cert.certificate_pem(), false)?),
            },
        ];

        let issuer_path = self.issuer_path(domain);
        match cert.issuer_certificate_pem() {
            Some(issuer) => staged.push(StagedFile {
                target: issuer_path,
                contents: Some(self.stage(issuer, false)?),
            }),
            // A stale chain from a previous CA must not be served with the new leaf.
            None if issuer_path.is_file() => staged.push(StagedFile {
                target: issuer_path,
                contents: None,
            }),
            None => {}
        }

        let backups = back_up(staged.iter().map(|f| f.target.as_path()))?;

        let marker = self.pending_path(domain);
        if let Err(e) = self.write_atomic(&marker, domain.as_bytes(), false) {
            discard(&backups);
            return Err(e);
        }

        let mut committed: Vec<PathBuf> = Vec::new();
        for file in staged {
            if let Err(e) = file.commit() {
                warn!(
                    domain = %domain,
                    path = %file.target.display(),
                    error = %e,
                    "Failed to replace stored file, restoring previous certificate"
                );
                restore(&committed, &backups);
                remove_if_present(&marker);
                discard(&backups);
                return Err(e);
            }
            committed.push(file.target);
        }

        remove_if_present(&marker);
        discard(&backups);

        info!(
            domain = %domain,
            expires = %cert.expires_at(),
            "Saved certificate to storage"
        );

        Ok(())
    }

    /// Load a domain's certificate
    ///
    /// `issued_at` comes from the certificate file's modification time since
    /// the original issuance time is not recorded separately.
    pub fn load(&self, domain: &str) -> Result<Certificate, StorageError> {
        validate_domain(domain)?;

        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);

        for path in [&cert_path, &key_path] {
            if !path.exists() {
                trace!(domain = %domain, path = %path.display(), "Stored certificate incomplete");
                return Err(StorageError::NotFound {
                    domain: domain.to_string(),
                    path: path.clone(),
                });
            }
        }

        let cert_pem = fs::read(&cert_path)?;
        let key_pem = fs::read(&key_path)?;

        let issuer_path = self.issuer_path(domain);
        let issuer_pem = if issuer_path.exists() {
            match fs::read(&issuer_path) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Failed to read issuer certificate");
                    None
                }
            }
        } else {
            None
        };

        let issued_at: DateTime<Utc> = fs::metadata(&cert_path)?.modified()?.into();

        let cert = Certificate::from_pem(domain, cert_pem, key_pem, issuer_pem, issued_at)
            .map_err(|source| StorageError::Parse {
                domain: domain.to_string(),
                source,
            })?;

        debug!(
            domain = %domain,
            expires = %cert.expires_at(),
            "Loaded stored certificate"
        );

        Ok(cert)
    }

    /// List all stored domains, sorted
    ///
    /// Issuer files (`issuer.crt`, `<domain>.issuer.crt`) are not domains.
    pub fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(domain) = name.strip_suffix(CERT_EXTENSION) else {
                continue;
            };
            if domain.is_empty() || domain == RESERVED_ISSUER || domain.ends_with(ISSUER_SUFFIX)
            {
                continue;
            }
            domains.push(domain.to_string());
        }

        domains.sort();
        Ok(domains)
    }

    /// Write `contents` to a synced temporary file in the storage directory
    fn stage(&self, contents: &[u8], secret: bool) -> Result<NamedTempFile, StorageError> {
        let mut tmp = NamedTempFile::new_in(&self.base_path)?;
        tmp.write_all(contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if secret { KEY_MODE } else { CERT_MODE };
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = secret;

        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    fn write_atomic(&self, path: &Path, contents: &[u8], secret: bool) -> Result<(), StorageError> {
        StagedFile {
            target: path.to_path_buf(),
            contents: Some(self.stage(contents, secret)?),
        }
        .commit()?;

        trace!(path = %path.display(), "Wrote file atomically");
        Ok(())
    }

    /// Roll back every save a crash left half done
    ///
    /// A domain with a pending marker gets exactly its backed-up files back;
    /// files it has no backup for did not exist before the save. Backups
    /// without a marker belong to a save that finished.
    fn recover_interrupted_saves(&self) -> Result<(), StorageError> {
        let mut pending = Vec::new();
        let mut stray_backups = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some(domain) = name.strip_suffix(PENDING_EXTENSION) {
                pending.push(domain.to_string());
            } else if name.ends_with(BACKUP_EXTENSION) {
                stray_backups.push(entry.path());
            }
        }

        for domain in &pending {
            warn!(domain = %domain, "Rolling back interrupted certificate save");
            for target in [
                self.key_path(domain),
                self.cert_path(domain),
                self.issuer_path(domain),
            ] {
                let backup = backup_path(&target);
                if backup.is_file() {
                    fs::rename(&backup, &target)?;
                } else if target.is_file() {
                    fs::remove_file(&target)?;
                }
            }
            fs::remove_file(self.pending_path(domain))?;
        }

        for backup in stray_backups {
            if backup.is_file() {
                debug!(path = %backup.display(), "Removing leftover backup");
                fs::remove_file(&backup)?;
            }
        }

        Ok(())
    }
}

/// A file a save is about to replace or remove
struct StagedFile {
    target: PathBuf,
    /// `None` removes the target
    contents: Option<NamedTempFile>,
}

impl StagedFile {
    fn commit(&self) -> Result<(), StorageError> {
        match &self.contents {
            Some(tmp) => fs::rename(tmp.path(), &self.target).map_err(|source| {
                StorageError::Persist {
                    path: self.target.clone(),
                    source,
                }
            }),
            None => fs::remove_file(&self.target).map_err(|source| StorageError::Persist {
                path: self.target.clone(),
                source,
            }),
        }
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(BACKUP_EXTENSION);
    PathBuf::from(name)
}

/// Link every existing regular file to its backup name
///
/// Returns `(target, backup)` pairs. Nothing is left behind on error.
fn back_up<'a>(
    targets: impl Iterator<Item = &'a Path>,
) -> Result<Vec<(PathBuf, PathBuf)>, StorageError> {
    let mut backups = Vec::new();

    for target in targets {
        if !target.is_file() {
            continue;
        }
        let backup = backup_path(target);
        remove_if_present(&backup);

        let linked = fs::hard_link(target, &backup)
            .or_else(|_| fs::copy(target, &backup).map(|_| ()));
        if let Err(e) = linked {
            discard(&backups);
            return Err(e.into());
        }
        backups.push((target.to_path_buf(), backup));
    }

    Ok(backups)
}

/// Put the backed-up version of each committed file back
fn restore(committed: &[PathBuf], backups: &[(PathBuf, PathBuf)]) {
    for target in committed {
        let result = match backups.iter().find(|(t, _)| t == target) {
            Some((_, backup)) => fs::rename(backup, target),
            None => fs::remove_file(target),
        };
        if let Err(e) = result {
            warn!(path = %target.display(), error = %e, "Failed to restore stored file");
        }
    }
}

fn discard(backups: &[(PathBuf, PathBuf)]) {
    for (_, backup) in backups {
        remove_if_present(backup);
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

/// Domains become file names, so anything that could escape the storage
/// directory or be mistaken for an issuer file is refused.
fn validate_domain(domain: &str) -> Result<(), StorageError> {
    let invalid = domain.is_empty()
        || domain.contains(['/', '\\'])
        || domain.contains("..")
        || domain.starts_with('.')
        || domain == RESERVED_ISSUER
        || domain.ends_with(ISSUER_SUFFIX);

    if invalid {
        Err(StorageError::InvalidDomain(domain.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{issue, issue_with_issuer, whole_seconds};
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn setup_storage() -> (TempDir, CertificateStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path()).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_storage_creation() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let storage = CertificateStorage::new(&nested).unwrap();
        assert!(storage.base_path().exists());
    }

    #[test]
    fn test_credentials_json_save_load() {
        let (_temp_dir, storage) = setup_storage();

        assert!(storage.load_credentials_json().unwrap().is_none());

        let test_json = r#"{"test": "credentials"}"#;
        storage.save_credentials_json(test_json).unwrap();

        let loaded = storage.load_credentials_json().unwrap();
        assert_eq!(loaded.as_deref(), Some(test_json));
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_temp_dir, storage) = setup_storage();
        let expires = whole_seconds(Utc::now() + TimeDelta::days(90));
        let cert = issue("example.com", expires);

        storage.save(&cert).unwrap();
        let loaded = storage.load("example.com").unwrap();

        assert_eq!(loaded.domain(), "example.com");
        assert_eq!(loaded.expires_at(), cert.expires_at());
        assert_eq!(loaded.expires_at(), expires);
        assert_eq!(loaded.certificate_pem(), cert.certificate_pem());
        assert_eq!(loaded.private_key_pem(), cert.private_key_pem());
        assert_eq!(loaded.fingerprint(), cert.fingerprint());
        assert!(loaded.issuer_certificate_pem().is_none());
    }

    #[test]
    fn test_issuer_round_trip_and_stale_issuer_removed() {
        let (_temp_dir, storage) = setup_storage();
        let expires = Utc::now() + TimeDelta::days(90);

        let with_issuer = issue_with_issuer("example.com", expires);
        storage.save(&with_issuer).unwrap();
        assert!(storage.base_path().join("example.com.issuer.crt").exists());
        let loaded = storage.load("example.com").unwrap();
        assert_eq!(
            loaded.issuer_certificate_pem(),
            with_issuer.issuer_certificate_pem()
        );

        storage.save(&issue("example.com", expires)).unwrap();
        assert!(!storage.base_path().join("example.com.issuer.crt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp_dir, storage) = setup_storage();
        storage
            .save(&issue("example.com", Utc::now() + TimeDelta::days(90)))
            .unwrap();

        let (cert_path, key_path) = storage.certificate_paths("example.com");
        let key_mode = fs::metadata(key_path).unwrap().permissions().mode() & 0o777;
        let cert_mode = fs::metadata(cert_path).unwrap().permissions().mode() & 0o777;

        assert_eq!(key_mode, 0o600);
        assert_eq!(cert_mode, 0o644);
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let (_temp_dir, storage) = setup_storage();
        let first = issue("example.com", Utc::now() + TimeDelta::days(10));
        let second = issue("example.com", Utc::now() + TimeDelta::days(90));

        storage.save(&first).unwrap();
        storage.save(&second).unwrap();

        let loaded = storage.load("example.com").unwrap();
        assert_eq!(loaded.fingerprint(), second.fingerprint());

        // Only the three artifacts remain, no temporaries.
        let files: Vec<_> = fs::read_dir(storage.base_path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_load_missing_key_is_not_found() {
        let (_temp_dir, storage) = setup_storage();
        storage
            .save(&issue("example.com", Utc::now() + TimeDelta::days(90)))
            .unwrap();
        fs::remove_file(storage.base_path().join("example.com.key")).unwrap();

        let err = storage.load("example.com").unwrap_err();
        assert!(err.is_not_found());
        assert!(storage.load("other.com").unwrap_err().is_not_found());
    }

    #[test]
    fn test_load_corrupt_certificate() {
        let (_temp_dir, storage) = setup_storage();
        fs::write(storage.base_path().join("bad.com.crt"), "garbage").unwrap();
        fs::write(storage.base_path().join("bad.com.key"), "key").unwrap();

        assert!(matches!(
            storage.load("bad.com"),
            Err(StorageError::Parse { .. })
        ));
    }

    #[test]
    fn test_list_domains_skips_issuers() {
        let (_temp_dir, storage) = setup_storage();
        let expires = Utc::now() + TimeDelta::days(90);

        storage.save(&issue("b.com", expires)).unwrap();
        storage.save(&issue_with_issuer("a.com", expires)).unwrap();
        fs::write(storage.base_path().join("issuer.crt"), "issuer").unwrap();
        fs::write(storage.base_path().join("notes.txt"), "x").unwrap();
        fs::create_dir(storage.base_path().join("dir.crt")).unwrap();

        assert_eq!(storage.list_domains().unwrap(), vec!["a.com", "b.com"]);
    }

    #[test]
    fn test_rejects_path_like_domains() {
        let (_temp_dir, storage) = setup_storage();
        for domain in ["", "../escape", "a/b", "issuer", ".hidden", "x.issuer"] {
            assert!(
                matches!(storage.load(domain), Err(StorageError::InvalidDomain(_))),
                "{domain} accepted"
            );
        }
    }

    fn leftovers(storage: &CertificateStorage) -> Vec<String> {
        fs::read_dir(storage.base_path())
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|name| name.ends_with(BACKUP_EXTENSION) || name.ends_with(PENDING_EXTENSION))
            .collect()
    }

    #[test]
    fn test_failed_certificate_replace_keeps_previous_key() {
        let (_temp_dir, storage) = setup_storage();
        let first = issue("example.com", Utc::now() + TimeDelta::days(10));
        storage.save(&first).unwrap();

        // The certificate cannot be renamed over a non-empty directory.
        let (cert_path, key_path) = storage.certificate_paths("example.com");
        fs::remove_file(&cert_path).unwrap();
        fs::create_dir(&cert_path).unwrap();
        fs::write(cert_path.join("blocker"), "x").unwrap();

        let second = issue_with_issuer("example.com", Utc::now() + TimeDelta::days(90));
        let err = storage.save(&second).unwrap_err();

        assert!(matches!(err, StorageError::Persist { ref path, .. } if *path == cert_path));
        assert_eq!(fs::read(&key_path).unwrap(), first.private_key_pem());
        assert!(!storage.base_path().join("example.com.issuer.crt").exists());
        assert!(leftovers(&storage).is_empty());
    }

    #[test]
    fn test_failed_issuer_replace_restores_key_and_certificate() {
        let (_temp_dir, storage) = setup_storage();
        let first = issue("example.com", Utc::now() + TimeDelta::days(10));
        storage.save(&first).unwrap();

        let issuer_path = storage.base_path().join("example.com.issuer.crt");
        fs::create_dir(&issuer_path).unwrap();
        fs::write(issuer_path.join("blocker"), "x").unwrap();

        let second = issue_with_issuer("example.com", Utc::now() + TimeDelta::days(90));
        assert!(storage.save(&second).is_err());

        let loaded = storage.load("example.com").unwrap();
        assert_eq!(loaded.fingerprint(), first.fingerprint());
        assert_eq!(loaded.private_key_pem(), first.private_key_pem());
        assert!(leftovers(&storage).is_empty());
    }

    #[test]
    fn test_interrupted_save_rolled_back_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path()).unwrap();
        let first = issue("example.com", Utc::now() + TimeDelta::days(10));
        let second = issue_with_issuer("example.com", Utc::now() + TimeDelta::days(90));
        storage.save(&first).unwrap();

        // State after a crash halfway through replacing the files.
        let (cert_path, key_path) = storage.certificate_paths("example.com");
        fs::hard_link(&key_path, backup_path(&key_path)).unwrap();
        fs::hard_link(&cert_path, backup_path(&cert_path)).unwrap();
        fs::write(storage.pending_path("example.com"), "example.com").unwrap();
        fs::remove_file(&key_path).unwrap();
        fs::write(&key_path, second.private_key_pem()).unwrap();
        fs::write(
            storage.base_path().join("example.com.issuer.crt"),
            second.issuer_certificate_pem().unwrap(),
        )
        .unwrap();
        drop(storage);

        let reopened = CertificateStorage::new(temp_dir.path()).unwrap();

        let loaded = reopened.load("example.com").unwrap();
        assert_eq!(loaded.fingerprint(), first.fingerprint());
        assert_eq!(loaded.private_key_pem(), first.private_key_pem());
        assert!(loaded.issuer_certificate_pem().is_none());
        assert!(leftovers(&reopened).is_empty());
    }

    #[test]
    fn test_leftover_backups_removed_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(temp_dir.path()).unwrap();
        let cert = issue("example.com", Utc::now() + TimeDelta::days(60));
        storage.save(&cert).unwrap();
        let (cert_path, _) = storage.certificate_paths("example.com");
        fs::write(backup_path(&cert_path), "old").unwrap();
        drop(storage);

        let reopened = CertificateStorage::new(temp_dir.path()).unwrap();

        assert!(leftovers(&reopened).is_empty());
        assert_eq!(
            reopened.load("example.com").unwrap().fingerprint(),
            cert.fingerprint()
        );
    }
}
