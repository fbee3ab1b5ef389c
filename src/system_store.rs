use crate::config::Config;
use crate::credentials::{normalize_credentials, short_hash_hex, CanonicalBlob};
use crate::error::{SyncError, SyncResult};
use crate::process::ProcessRunner;
use crate::store::write_file_atomic;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// `security` exit status for errSecItemNotFound.
pub const ITEM_NOT_FOUND_STATUS: i32 = 44;

/// Reads and writes the active credential blob: the macOS keychain item plus
/// the CLI's own `auth.json`.
pub struct SystemCredentialStore {
    auth_file: PathBuf,
    keychain_service: String,
    keychain_account: String,
    security_executable: String,
    read_timeout: Duration,
    write_timeout: Duration,
    process_runner: ProcessRunner,
}

impl SystemCredentialStore {
    pub fn new(config: &Config, process_runner: ProcessRunner) -> Self {
        Self {
            auth_file: config.auth_file.clone(),
            keychain_service: config.keychain_service.clone(),
            keychain_account: config.keychain_account.clone(),
            security_executable: config.security_executable.clone(),
            read_timeout: config.keychain_read_timeout,
            write_timeout: config.keychain_write_timeout,
            process_runner,
        }
    }

    pub fn auth_file(&self) -> &Path {
        &self.auth_file
    }

    pub fn keychain_service(&self) -> &str {
        &self.keychain_service
    }

    /// Returns the canonical blob, or `None` when neither source has one.
    ///
    /// The auth file is consulted first because reading the keychain may raise
    /// an interactive OS prompt.
    pub fn read_system_credentials(&self) -> SyncResult<Option<String>> {
        if let Some(blob) = self.read_auth_file() {
            debug!(source = "auth_file", blob_fp = %short_hash_hex(blob.as_bytes()), "read system credentials");
            return Ok(Some(blob));
        }

        let Some(raw) = self.read_keychain()? else {
            return Ok(None);
        };
        let blob = normalize_credentials(&raw)?;
        debug!(source = "keychain", blob_fp = %short_hash_hex(blob.as_bytes()), "read system credentials");
        Ok(Some(blob))
    }

    /// Canonical blob from the auth file. Missing, unreadable, slow or
    /// malformed files all count as "no credential here".
    pub fn read_auth_file(&self) -> Option<String> {
        let raw = read_file_with_timeout(&self.auth_file, self.read_timeout)?;
        match normalize_credentials(&raw) {
            Ok(blob) => Some(blob),
            Err(err) => {
                warn!(path = %self.auth_file.display(), error = %err, "ignoring malformed auth file");
                None
            }
        }
    }

    pub fn read_keychain(&self) -> SyncResult<Option<String>> {
        let args = vec![
            "find-generic-password".to_string(),
            "-s".to_string(),
            self.keychain_service.clone(),
            "-a".to_string(),
            self.keychain_account.clone(),
            "-w".to_string(),
        ];
        let result = (self.process_runner)(&self.security_executable, &args, self.read_timeout);
        if result.timed_out {
            warn!(
                service = %self.keychain_service,
                timeout_ms = self.read_timeout.as_millis() as u64,
                "keychain read timed out; treating as absent"
            );
            return Ok(None);
        }
        match result.status {
            0 => {
                let trimmed = result.stdout.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            ITEM_NOT_FOUND_STATUS => Ok(None),
            status => Err(SyncError::SecretStoreReadFailed {
                status,
                message: result.stderr.trim().to_string(),
            }),
        }
    }

    /// Replaces the keychain item with `blob` and, when the CLI's auth file
    /// exists, rewrites it to match. A failed file write restores the previous
    /// keychain value before the error is returned.
    pub fn write_system_credentials(&self, blob: &str) -> SyncResult<()> {
        let canonical = normalize_credentials(blob)?;
        let mirror_file = self.auth_file.exists();
        let previous = if mirror_file {
            self.read_keychain().ok().flatten()
        } else {
            None
        };

        self.delete_keychain_item();
        self.add_keychain_item(&canonical)?;

        if mirror_file {
            if let Err(err) = self.write_auth_file(&canonical) {
                warn!(
                    path = %self.auth_file.display(),
                    error = %err,
                    "auth file write failed; restoring previous keychain value"
                );
                if let Some(previous) = previous {
                    self.delete_keychain_item();
                    if let Err(restore_err) = self.add_keychain_item(&previous) {
                        warn!(error = %restore_err, "failed to restore previous keychain value");
                    }
                }
                return Err(err);
            }
        }

        debug!(blob_fp = %short_hash_hex(canonical.as_bytes()), "wrote system credentials");
        Ok(())
    }

    fn delete_keychain_item(&self) {
        let args = vec![
            "delete-generic-password".to_string(),
            "-s".to_string(),
            self.keychain_service.clone(),
            "-a".to_string(),
            self.keychain_account.clone(),
        ];
        let result = (self.process_runner)(&self.security_executable, &args, self.write_timeout);
        if result.timed_out {
            warn!(step = "delete_keychain_item", "keychain delete timed out; continuing");
            return;
        }
        match result.status {
            0 | ITEM_NOT_FOUND_STATUS => {}
            status => warn!(
                step = "delete_keychain_item",
                status,
                stderr = %result.stderr.trim(),
                "keychain delete failed; continuing"
            ),
        }
    }

    fn add_keychain_item(&self, raw: &str) -> SyncResult<()> {
        let args = vec![
            "add-generic-password".to_string(),
            "-a".to_string(),
            self.keychain_account.clone(),
            "-s".to_string(),
            self.keychain_service.clone(),
            "-w".to_string(),
            raw.to_string(),
            "-U".to_string(),
        ];
        let result = (self.process_runner)(&self.security_executable, &args, self.write_timeout);
        if result.timed_out || result.status != 0 {
            return Err(SyncError::SecretStoreWriteFailed {
                status: result.status,
                message: result.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn write_auth_file(&self, canonical: &str) -> SyncResult<()> {
        let blob = CanonicalBlob::parse(canonical).ok_or_else(|| {
            SyncError::MalformedJson("canonical blob has no access token".to_string())
        })?;
        let existing = fs::read(&self.auth_file)
            .ok()
            .and_then(|data| serde_json::from_slice::<Value>(&data).ok());
        let rendered = blob.to_auth_file(existing.as_ref());
        let data = serde_json::to_vec_pretty(&rendered).map_err(|source| SyncError::Encode {
            what: "auth file",
            source,
        })?;
        write_file_atomic(&self.auth_file, &data)
    }
}

/// Reads a small file on a helper thread so a stalled filesystem cannot block
/// the caller past `timeout`.
fn read_file_with_timeout(path: &Path, timeout: Duration) -> Option<String> {
    let (sender, receiver) = mpsc::channel();
    let owned_path = path.to_path_buf();
    thread::spawn(move || {
        let _ = sender.send(fs::read_to_string(&owned_path));
    });

    match receiver.recv_timeout(timeout) {
        Ok(Ok(raw)) => Some(raw),
        Ok(Err(err)) if err.kind() == ErrorKind::NotFound => None,
        Ok(Err(err)) => {
            warn!(path = %path.display(), error = %err, "failed to read auth file");
            None
        }
        Err(_) => {
            warn!(path = %path.display(), "auth file read timed out");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeKeychain;
    use super::*;
    use crate::credentials::extract_access_token;
    use crate::credentials::test_support::{auth_file_json, canonical_blob};
    use tempfile::TempDir;

    fn store_for(home: &Path, keychain: &FakeKeychain) -> SystemCredentialStore {
        let mut config = Config::for_home(home.to_path_buf());
        config.keychain_account = "tester".to_string();
        SystemCredentialStore::new(&config, keychain.runner())
    }

    fn write_auth_file(home: &Path, contents: &str) -> PathBuf {
        let path = home.join(".codex/auth.json");
        write_file_atomic(&path, contents.as_bytes()).expect("write auth file");
        path
    }

    #[test]
    fn read_prefers_auth_file_without_touching_keychain() {
        let temp = TempDir::new().expect("temp dir");
        write_auth_file(temp.path(), &auth_file_json("at-file", Some("acct-1")));
        let keychain = FakeKeychain::with_secret(&canonical_blob("at-keychain", None, None, None));
        let store = store_for(temp.path(), &keychain);

        let blob = store
            .read_system_credentials()
            .expect("read")
            .expect("credentials");
        assert_eq!(extract_access_token(&blob).as_deref(), Some("at-file"));
        assert_eq!(keychain.find_count(), 0);
    }

    #[test]
    fn read_falls_back_to_keychain_and_normalizes_file_shape() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret(&auth_file_json("at-keychain", None));
        let store = store_for(temp.path(), &keychain);

        let blob = store
            .read_system_credentials()
            .expect("read")
            .expect("credentials");
        assert!(blob.contains("codexAiOauth"));
        assert_eq!(extract_access_token(&blob).as_deref(), Some("at-keychain"));
        assert_eq!(keychain.find_count(), 1);
    }

    #[test]
    fn malformed_auth_file_defers_to_keychain() {
        let temp = TempDir::new().expect("temp dir");
        write_auth_file(temp.path(), "{ not json");
        let keychain = FakeKeychain::with_secret(&canonical_blob("at-keychain", None, None, None));
        let store = store_for(temp.path(), &keychain);

        let blob = store
            .read_system_credentials()
            .expect("read")
            .expect("credentials");
        assert_eq!(extract_access_token(&blob).as_deref(), Some("at-keychain"));
    }

    #[test]
    fn missing_item_everywhere_is_absence() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::default();
        let store = store_for(temp.path(), &keychain);
        assert_eq!(store.read_system_credentials().expect("read"), None);
    }

    #[test]
    fn keychain_failure_propagates_when_file_has_nothing() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::default();
        keychain.fail_finds_with(51);
        let store = store_for(temp.path(), &keychain);

        let err = store.read_system_credentials().expect_err("should fail");
        assert!(matches!(err, SyncError::SecretStoreReadFailed { status: 51, .. }));
    }

    #[test]
    fn keychain_failure_is_ignored_when_file_has_credentials() {
        let temp = TempDir::new().expect("temp dir");
        write_auth_file(temp.path(), &auth_file_json("at-file", None));
        let keychain = FakeKeychain::default();
        keychain.fail_finds_with(51);
        let store = store_for(temp.path(), &keychain);

        let blob = store.read_system_credentials().expect("read");
        assert!(blob.is_some());
    }

    #[test]
    fn keychain_timeout_degrades_to_absent() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret(&canonical_blob("at", None, None, None));
        keychain.time_out_finds();
        let store = store_for(temp.path(), &keychain);
        assert_eq!(store.read_system_credentials().expect("read"), None);
    }

    #[test]
    fn write_deletes_then_adds_canonical_blob() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret("old");
        let store = store_for(temp.path(), &keychain);

        store
            .write_system_credentials(&auth_file_json("at-new", None))
            .expect("write");
        assert_eq!(keychain.delete_count(), 1);
        assert_eq!(keychain.add_count(), 1);
        let secret = keychain.secret().expect("secret");
        assert!(secret.contains("codexAiOauth"));
        assert_eq!(extract_access_token(&secret).as_deref(), Some("at-new"));
        assert!(!store.auth_file().exists(), "auth file is not created");
    }

    #[test]
    fn delete_failure_is_not_fatal() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::default();
        keychain.fail_deletes_with(36);
        let store = store_for(temp.path(), &keychain);

        store
            .write_system_credentials(&canonical_blob("at", None, None, None))
            .expect("write despite delete failure");
        assert_eq!(keychain.add_count(), 1);
    }

    #[test]
    fn add_failure_carries_status() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::default();
        keychain.fail_adds_with(25);
        let store = store_for(temp.path(), &keychain);

        let err = store
            .write_system_credentials(&canonical_blob("at", None, None, None))
            .expect_err("write should fail");
        assert!(matches!(err, SyncError::SecretStoreWriteFailed { status: 25, .. }));
    }

    #[test]
    fn write_mirrors_existing_auth_file() {
        let temp = TempDir::new().expect("temp dir");
        let path = write_auth_file(temp.path(), &auth_file_json("at-old", Some("acct-old")));
        let keychain = FakeKeychain::default();
        let store = store_for(temp.path(), &keychain);

        store
            .write_system_credentials(&canonical_blob("at-new", Some("acct-new"), None, None))
            .expect("write");

        let root: Value =
            serde_json::from_slice(&fs::read(&path).expect("read file")).expect("json");
        assert_eq!(root["tokens"]["access_token"], "at-new");
        assert_eq!(root["tokens"]["account_id"], "acct-new");
        assert_eq!(root["auth_mode"], "chatgpt");
        assert!(root.get("OPENAI_API_KEY").is_some());

        let blob = store
            .read_system_credentials()
            .expect("read")
            .expect("credentials");
        assert_eq!(extract_access_token(&blob).as_deref(), Some("at-new"));
    }

    #[test]
    fn write_rejects_malformed_blob() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::default();
        let store = store_for(temp.path(), &keychain);
        let err = store
            .write_system_credentials("{}")
            .expect_err("malformed");
        assert!(matches!(err, SyncError::MalformedJson(_)));
        assert_eq!(keychain.add_count(), 0);
    }
}
