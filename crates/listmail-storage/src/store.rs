//! Subscriber store
//!
//! The whole database lives in one JSON file. Readers never lock: every
//! write replaces the file atomically, so a reader sees either the old or
//! the new contents. Writers follow a two-level protocol:
//!
//! 1. `begin_update` takes the per-list lock `<database>.<list>.lock` and
//!    only then reads the file, so the transaction starts from the latest
//!    committed state of that list.
//! 2. `commit` takes the short global lock `<database>.lock`, re-reads the
//!    file, replaces the one list record and renames a fully synced
//!    temporary file over the database. Updates to other lists committed in
//!    the meantime are therefore kept.

use crate::lock::FileLock;
use crate::models::{MailingList, SubscriberDatabase};
use listmail_common::{Config, Error, Result};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Handle on the subscriber database file
#[derive(Debug, Clone)]
pub struct SubscriberStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl SubscriberStore {
    /// Create a store over the database at `path`
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    /// Create a store from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.general.database, config.lock_timeout())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlocked read of the whole database.
    ///
    /// Only the posting path uses this; a slightly stale view is fine there.
    pub async fn read_snapshot(&self) -> Result<SubscriberDatabase> {
        read_database(&self.path).await
    }

    /// Start a membership transaction on one list.
    ///
    /// Waits for the list lock (bounded by the configured timeout) and reads
    /// the file after the lock is held.
    pub async fn begin_update(&self, list_name: &str) -> Result<Transaction> {
        let list_name = list_name.to_lowercase();
        let lock_path = self.lock_path(Some(&list_name))?;
        let lock = FileLock::acquire(&lock_path, self.lock_timeout).await?;
        debug!(list = %list_name, "Acquired list lock");

        let mut database = read_database(&self.path).await?;
        let list = database.remove(&list_name).ok_or_else(|| {
            Error::Config(format!(
                "List {} disappeared from the database during an update",
                list_name
            ))
        })?;

        Ok(Transaction {
            store: self.clone(),
            list_name,
            original: list.clone(),
            list,
            _lock: lock,
        })
    }

    fn lock_path(&self, list_name: Option<&str>) -> Result<PathBuf> {
        let mut name: OsString = self
            .path
            .file_name()
            .ok_or_else(|| {
                Error::Storage(format!("Invalid database path {}", self.path.display()))
            })?
            .to_os_string();

        if let Some(list_name) = list_name {
            if list_name.is_empty()
                || list_name.starts_with('.')
                || list_name.contains(['/', '\\', '\0'])
            {
                return Err(Error::Storage(format!(
                    "Refusing to lock unsafe list name {:?}",
                    list_name
                )));
            }
            name.push(".");
            name.push(list_name);
        }
        name.push(".lock");

        Ok(self.path.with_file_name(name))
    }

    async fn replace_list(&self, list_name: &str, list: &MailingList) -> Result<()> {
        let _commit_lock = FileLock::acquire(&self.lock_path(None)?, self.lock_timeout).await?;

        let mut database = read_database(&self.path).await?;
        database.insert(list_name.to_string(), list.clone());

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_database(&path, &database))
            .await
            .map_err(|e| Error::Internal(format!("Database writer panicked: {}", e)))?
    }
}

/// An exclusive read-modify-write transaction on one list.
///
/// Dropping the transaction without committing releases the lock and
/// leaves the database untouched.
#[derive(Debug)]
pub struct Transaction {
    store: SubscriberStore,
    list_name: String,
    original: MailingList,
    list: MailingList,
    _lock: FileLock,
}

impl Transaction {
    /// The list as read after the lock was acquired, plus local changes
    pub fn list(&self) -> &MailingList {
        &self.list
    }

    /// Add a member; fails with `AlreadyMember` if present
    pub fn add_member(&mut self, address: &str) -> Result<()> {
        self.list.add_member(address)
    }

    /// Remove every occurrence of a member; fails with `NotMember` if absent
    pub fn remove_member(&mut self, address: &str) -> Result<usize> {
        self.list.remove_member(address)
    }

    /// Durably persist the list and release the lock.
    ///
    /// A transaction without changes does not touch the file.
    pub async fn commit(self) -> Result<()> {
        if self.list == self.original {
            debug!(list = %self.list_name, "Nothing to commit");
            return Ok(());
        }

        self.store.replace_list(&self.list_name, &self.list).await?;
        info!(
            list = %self.list_name,
            members = self.list.members.len(),
            "Committed list update"
        );
        Ok(())
    }

    /// Release the lock without persisting anything
    pub fn abort(self) {
        debug!(list = %self.list_name, "Aborted list update");
    }
}

async fn read_database(path: &Path) -> Result<SubscriberDatabase> {
    let data = tokio::fs::read(path).await.map_err(|e| {
        Error::Storage(format!("Failed to read database {}: {}", path.display(), e))
    })?;

    let raw: SubscriberDatabase = serde_json::from_slice(&data)?;

    let mut database = SubscriberDatabase::new();
    for (name, list) in raw {
        let key = name.to_lowercase();
        if database.contains_key(&key) {
            return Err(Error::Config(format!(
                "List {} appears more than once in {} (names are case-insensitive)",
                key,
                path.display()
            )));
        }
        database.insert(key, list);
    }
    Ok(database)
}

fn write_database(path: &Path, database: &SubscriberDatabase) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, database)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;

    // Temporary files are created 0600; keep the mode of the file we replace.
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }

    tmp.persist(path)
        .map_err(|e| Error::Storage(format!("Failed to replace {}: {}", path.display(), e)))?;

    // Make the rename itself durable.
    std::fs::File::open(dir)?.sync_all()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use listmail_common::AllowedSenders;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn seed(dir: &TempDir) -> SubscriberStore {
        let mut database = SubscriberDatabase::new();
        let mut dev = MailingList::new("Developers", "owner@example.org", AllowedSenders::Members);
        dev.members.push("alice@example.org".to_string());
        database.insert("dev".to_string(), dev);
        database.insert(
            "announce".to_string(),
            MailingList::new("Announcements", "owner@example.org", AllowedSenders::Moderators),
        );

        let path = dir.path().join("lists.json");
        write_database(&path, &database).unwrap();
        SubscriberStore::new(path, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_read_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);

        let database = store.read_snapshot().await.unwrap();
        assert_eq!(database.len(), 2);
        assert!(database["dev"].is_member("alice@example.org"));
    }

    #[tokio::test]
    async fn test_snapshot_keys_are_lower_cased() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lists.json");
        std::fs::write(
            &path,
            r#"{"Dev": {"shortname": "Dev", "owner": "o@example.org", "allowed_senders": "anyone"}}"#,
        )
        .unwrap();

        let store = SubscriberStore::new(path, Duration::from_secs(1));
        let database = store.read_snapshot().await.unwrap();
        assert!(database.contains_key("dev"));
    }

    #[tokio::test]
    async fn test_case_colliding_list_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lists.json");
        std::fs::write(
            &path,
            r#"{
                "Dev": {"shortname": "Dev", "owner": "o@example.org", "allowed_senders": "anyone"},
                "dev": {"shortname": "dev", "owner": "o@example.org", "allowed_senders": "members"}
            }"#,
        )
        .unwrap();

        let store = SubscriberStore::new(path, Duration::from_secs(1));
        let err = store.read_snapshot().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_commit_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = seed(&dir);
        std::fs::set_permissions(store.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut tx = store.begin_update("dev").await.unwrap();
        tx.add_member("bob@example.org").unwrap();
        tx.commit().await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_commit_persists_member() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);

        let mut tx = store.begin_update("dev").await.unwrap();
        tx.add_member("bob@example.org").unwrap();
        tx.commit().await.unwrap();

        let database = store.read_snapshot().await.unwrap();
        assert_eq!(
            database["dev"].members,
            vec!["alice@example.org".to_string(), "bob@example.org".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_update_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);
        let before = std::fs::read(store.path()).unwrap();

        let mut tx = store.begin_update("dev").await.unwrap();
        assert!(matches!(
            tx.add_member("Alice@example.org"),
            Err(Error::AlreadyMember(_))
        ));
        tx.abort();

        let mut tx = store.begin_update("dev").await.unwrap();
        assert!(matches!(
            tx.remove_member("nobody@example.org"),
            Err(Error::NotMember(_))
        ));
        drop(tx);

        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_list_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);

        let err = store.begin_update("nope").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unsafe_list_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);

        let err = store.begin_update("../etc").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_second_writer_waits_for_first() {
        let dir = TempDir::new().unwrap();
        let store = SubscriberStore::new(seed(&dir).path(), Duration::from_millis(150));

        let tx = store.begin_update("dev").await.unwrap();
        let err = store.begin_update("dev").await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        // Other lists are not blocked by it.
        let other = store.begin_update("announce").await.unwrap();
        other.abort();
        tx.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribes_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = store.begin_update("dev").await?;
                tx.add_member(&format!("user{}@example.org", i))?;
                tokio::task::yield_now().await;
                tx.commit().await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let database = store.read_snapshot().await.unwrap();
        let dev = &database["dev"];
        assert_eq!(dev.members.len(), 9);
        for i in 0..8 {
            assert!(dev.is_member(&format!("user{}@example.org", i)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_updates_to_different_lists_are_merged() {
        let dir = TempDir::new().unwrap();
        let store = seed(&dir);

        let mut dev = store.begin_update("dev").await.unwrap();
        let mut announce = store.begin_update("announce").await.unwrap();
        dev.add_member("bob@example.org").unwrap();
        announce.add_member("carol@example.org").unwrap();
        announce.commit().await.unwrap();
        dev.commit().await.unwrap();

        let database = store.read_snapshot().await.unwrap();
        assert!(database["dev"].is_member("bob@example.org"));
        assert!(database["announce"].is_member("carol@example.org"));
    }
}
