//! Credential persistence.
//!
//! [`SecureStore`] is the raw key/value primitive (a platform keychain, a
//! file, memory). [`CredentialStore`] sits on top of it, namespacing keys by
//! application tag and serializing one [`Credential`] per provider.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::oauth::Credential;
use crate::error::Error;

/// Suffix appended to every credential key.
const KEY_SUFFIX: &str = "oauth";

/// Key/value storage for serialized secrets.
///
/// Implementations must be safe to call from any thread.
pub trait SecureStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
    /// Remove every key, regardless of namespace.
    fn clear(&self) -> Result<()>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.entries).remove(key).is_some())
    }

    fn clear(&self) -> Result<()> {
        lock(&self.entries).clear();
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(lock(&self.entries)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// On-disk layout of [`FileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileContents {
    entries: BTreeMap<String, String>,
}

/// JSON file store, written with `0600` permissions on Unix.
///
/// Defaults to `~/.local/share/oauthkit/credentials.json` following the XDG
/// Base Directory Specification. The file is read on open and rewritten on
/// every mutation; memory only changes once the write succeeds.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    contents: Mutex<FileContents>,
}

impl FileStore {
    /// Get the default storage path.
    pub fn default_path() -> Result<PathBuf> {
        let data_dir =
            dirs::data_local_dir().context("Could not determine local data directory")?;
        Ok(data_dir.join("oauthkit").join("credentials.json"))
    }

    /// Open the store at the default path.
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    /// Open a store file. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = Self::read(&path)?;
        Ok(Self {
            path,
            contents: Mutex::new(contents),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<FileContents> {
        if !path.exists() {
            return Ok(FileContents::default());
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open credential file: {}", path.display()))?;
        let reader = BufReader::new(file);

        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse credential file: {}", path.display()))
    }

    fn write(&self, contents: &FileContents) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = File::create(&self.path).with_context(|| {
            format!("Failed to create credential file: {}", self.path.display())
        })?;

        // Owner read/write only
        #[cfg(unix)]
        {
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }

        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, contents)
            .with_context(|| format!("Failed to write credential file: {}", self.path.display()))
    }
}

impl SecureStore for FileStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut contents = lock(&self.contents);
        let mut updated = contents.clone();
        updated.entries.insert(key.to_string(), value.to_string());
        self.write(&updated)?;
        *contents = updated;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.contents).entries.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut contents = lock(&self.contents);
        if !contents.entries.contains_key(key) {
            return Ok(false);
        }
        let mut updated = contents.clone();
        updated.entries.remove(key);
        self.write(&updated)?;
        *contents = updated;
        Ok(true)
    }

    fn clear(&self) -> Result<()> {
        let mut contents = lock(&self.contents);
        let updated = FileContents::default();
        self.write(&updated)?;
        *contents = updated;
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(lock(&self.contents)
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Credential persistence scoped to one application tag.
///
/// Keys have the form `{tag}.{provider_id}.oauth`, so each provider holds at
/// most one credential and clearing never touches other applications.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecureStore>,
    tag: String,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecureStore>, tag: impl Into<String>) -> Self {
        Self {
            backend,
            tag: tag.into(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Storage key for a provider.
    pub fn key(&self, provider_id: &str) -> String {
        format!("{}.{}.{}", self.tag, provider_id, KEY_SUFFIX)
    }

    fn prefix(&self) -> String {
        format!("{}.", self.tag)
    }

    /// Persist a credential under its issuer, replacing any previous one.
    pub fn save(&self, credential: &Credential) -> Result<(), Error> {
        let value = serde_json::to_string(credential)
            .map_err(|e| Error::CredentialStore(format!("serialize: {}", e)))?;
        self.backend
            .set(&self.key(&credential.issuer), &value)
            .map_err(|e| Error::CredentialStore(format!("{:#}", e)))
    }

    /// Load the credential stored for a provider.
    pub fn load(&self, provider_id: &str) -> Result<Option<Credential>, Error> {
        let value = self
            .backend
            .get(&self.key(provider_id))
            .map_err(|e| Error::CredentialStore(format!("{:#}", e)))?;

        value
            .map(|v| {
                serde_json::from_str(&v).map_err(|e| {
                    Error::CredentialStore(format!("corrupt credential for '{}': {}", provider_id, e))
                })
            })
            .transpose()
    }

    /// Delete the credential for a provider. Returns whether one existed.
    pub fn remove(&self, provider_id: &str) -> Result<bool, Error> {
        self.backend
            .delete(&self.key(provider_id))
            .map_err(|e| Error::CredentialStore(format!("{:#}", e)))
    }

    /// Provider ids that currently have a stored credential.
    pub fn provider_ids(&self) -> Result<Vec<String>, Error> {
        let prefix = self.prefix();
        let suffix = format!(".{}", KEY_SUFFIX);
        let keys = self
            .backend
            .list_keys(&prefix)
            .map_err(|e| Error::CredentialStore(format!("{:#}", e)))?;

        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.strip_suffix(&suffix))
            .map(str::to_string)
            .collect())
    }

    /// Delete every credential under this tag.
    ///
    /// Attempts every key and reports the first failure.
    pub fn clear(&self) -> Result<(), Error> {
        let keys = self
            .backend
            .list_keys(&self.prefix())
            .map_err(|e| Error::CredentialStore(format!("{:#}", e)))?;

        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.backend.delete(&key) {
                first_error.get_or_insert(Error::CredentialStore(format!("{:#}", e)));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::Token;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn credential(issuer: &str, access: &str) -> Credential {
        let issued = DateTime::parse_from_rfc3339("2025-01-03T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Credential::new(issuer, issued, Token::bearer(access))
    }

    fn memory_store(tag: &str) -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStore::new()), tag)
    }

    #[test]
    fn test_key_format() {
        let store = memory_store("com.example.app");
        assert_eq!(store.key("GitHub"), "com.example.app.GitHub.oauth");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = memory_store("app");
        let mut cred = credential("github", "gho_token");
        cred.token.refresh_token = Some("refresh".to_string());
        cred.token.expires_in = Some(28800);
        cred.token.scope = Some("repo".to_string());
        cred.token.open_id_token = Some("eyJ".to_string());

        store.save(&cred).unwrap();
        assert_eq!(store.load("github").unwrap(), Some(cred));
    }

    #[test]
    fn test_roundtrip_preserves_absent_fields() {
        let store = memory_store("app");
        let cred = credential("github", "gho_token");

        store.save(&cred).unwrap();
        let loaded = store.load("github").unwrap().unwrap();
        assert!(loaded.token.refresh_token.is_none());
        assert!(loaded.token.expires_in.is_none());
        assert!(loaded.token.open_id_token.is_none());
        assert_eq!(loaded, cred);
    }

    #[test]
    fn test_save_overwrites_same_provider() {
        let store = memory_store("app");
        store.save(&credential("github", "first")).unwrap();
        store.save(&credential("github", "second")).unwrap();

        assert_eq!(store.provider_ids().unwrap(), vec!["github".to_string()]);
        assert_eq!(
            store.load("github").unwrap().unwrap().token.access_token,
            "second"
        );
    }

    #[test]
    fn test_clear_is_scoped_to_tag() {
        let backend: Arc<dyn SecureStore> = Arc::new(MemoryStore::new());
        let ours = CredentialStore::new(backend.clone(), "ours");
        let theirs = CredentialStore::new(backend.clone(), "theirs");

        ours.save(&credential("a", "1")).unwrap();
        ours.save(&credential("b", "2")).unwrap();
        theirs.save(&credential("a", "3")).unwrap();

        ours.clear().unwrap();
        assert!(ours.provider_ids().unwrap().is_empty());
        assert_eq!(theirs.provider_ids().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_remove() {
        let store = memory_store("app");
        store.save(&credential("github", "t")).unwrap();
        assert!(store.remove("github").unwrap());
        assert!(!store.remove("github").unwrap());
        assert!(store.load("github").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_value_is_store_failure() {
        let backend = Arc::new(MemoryStore::new());
        backend.set("app.github.oauth", "{not json").unwrap();
        let store = CredentialStore::new(backend, "app");

        let err = store.load("github").unwrap_err();
        assert!(matches!(err, Error::CredentialStore(_)));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("credentials.json");

        {
            let store = CredentialStore::new(Arc::new(FileStore::open(&path).unwrap()), "app");
            store.save(&credential("github", "gho_token")).unwrap();
        }

        let reopened = CredentialStore::new(Arc::new(FileStore::open(&path).unwrap()), "app");
        assert_eq!(
            reopened.load("github").unwrap().unwrap().token.access_token,
            "gho_token"
        );
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path().join("nonexistent.json")).unwrap();
        assert!(store.list_keys("").unwrap().is_empty());
    }

    #[test]
    fn test_file_store_clear_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path().join("c.json")).unwrap();
        store.set("a.x.oauth", "1").unwrap();
        store.set("b.y.oauth", "2").unwrap();

        assert!(store.delete("a.x.oauth").unwrap());
        assert_eq!(store.list_keys("").unwrap(), vec!["b.y.oauth".to_string()]);

        store.clear().unwrap();
        assert!(store.list_keys("").unwrap().is_empty());
    }

    #[test]
    fn test_file_store_failed_write_keeps_contents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");
        let store = FileStore::open(&path).unwrap();
        store.set("k", "v").unwrap();

        // A directory in place of the file makes every write fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.set("k", "w").is_err());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.set("other", "x").is_err());
        assert_eq!(store.get("other").unwrap(), None);
        assert!(store.delete("k").is_err());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.clear().is_err());
        assert_eq!(store.list_keys("").unwrap(), vec!["k".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");

        let store = FileStore::open(&path).unwrap();
        store.set("k", "v").unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "File should have 0600 permissions");
    }
}
