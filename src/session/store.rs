//! File-per-key session persistence with advisory locks.
//!
//! One JSON record per (host, customer group) key. Multiple worker
//! processes share the same storage directory; writers take an exclusive
//! lock and readers a shared lock, so a reader never observes a
//! half-written record and concurrent writers serialize.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use super::Session;
use crate::error::SessionError;

#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) the storage directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let dir = dir.into();

        std::fs::create_dir_all(&dir).map_err(|source| SessionError::Storage {
            path: dir.clone(),
            source,
        })?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, host: &str, customer_group: Option<&str>) -> PathBuf {
        let filename = match customer_group {
            Some(group) => format!("{host}-cg-{group}.json"),
            None => format!("{host}-anon.json"),
        };
        self.dir.join(filename)
    }

    /// Load the persisted session for a key, if any. A record that fails
    /// to deserialize is treated as absent so the caller re-authenticates
    /// instead of looping on it.
    pub fn load(
        &self,
        host: &str,
        customer_group: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        let path = self.path_for(host, customer_group);

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SessionError::Storage { path, source }),
        };

        let storage_err = |source| SessionError::Storage {
            path: path.clone(),
            source,
        };

        file.lock_shared().map_err(storage_err)?;
        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        let _ = file.unlock();
        read.map_err(storage_err)?;

        match serde_json::from_str(&contents) {
            Ok(session) => Ok(Some(session)),
            Err(error) => {
                warn!(path = %path.display(), %error, "discarding corrupt session record");
                Ok(None)
            }
        }
    }

    /// Persist a session under an exclusive lock. The file is truncated
    /// only after the lock is held, so shared-lock readers never see a
    /// torn record.
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.path_for(session.host(), session.customer_group());

        let storage_err = |source| SessionError::Storage {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(storage_err)?;

        file.lock_exclusive().map_err(storage_err)?;

        let result = (|| {
            file.set_len(0)?;
            let payload = serde_json::to_vec_pretty(session)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.write_all(&payload)?;
            file.flush()
        })();

        let _ = file.unlock();
        result.map_err(storage_err)
    }

    /// Remove the persisted record for a key, if present.
    pub fn delete(&self, host: &str, customer_group: Option<&str>) -> Result<(), SessionError> {
        let path = self.path_for(host, customer_group);

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionError::Storage { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn round_trips_a_session() {
        let (store, _dir) = store();

        let mut session = Session::new("shop.example.com", Some("retail".to_string()));
        session.apply_set_cookie("PHPSESSID=abc; Max-Age=3600", Utc::now());
        session.apply_set_cookie("X-Magento-Vary=deadbeef", Utc::now());
        store.save(&session).unwrap();

        let loaded = store
            .load("shop.example.com", Some("retail"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.host(), "shop.example.com");
        assert_eq!(loaded.customer_group(), Some("retail"));
        assert!(loaded.is_valid(Utc::now()));
    }

    #[test]
    fn missing_key_loads_none() {
        let (store, _dir) = store();
        assert!(store.load("shop.example.com", None).unwrap().is_none());
    }

    #[test]
    fn anonymous_and_group_keys_are_distinct() {
        let (store, _dir) = store();

        store
            .save(&Session::new("shop.example.com", None))
            .unwrap();
        assert!(store.load("shop.example.com", None).unwrap().is_some());
        assert!(store
            .load("shop.example.com", Some("retail"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let (store, _dir) = store();

        store.save(&Session::new("shop.example.com", None)).unwrap();
        store.delete("shop.example.com", None).unwrap();
        store.delete("shop.example.com", None).unwrap();
        assert!(store.load("shop.example.com", None).unwrap().is_none());
    }

    #[test]
    fn corrupt_record_is_discarded() {
        let (store, dir) = store();
        std::fs::write(dir.path().join("shop.example.com-anon.json"), "{nope").unwrap();
        assert!(store.load("shop.example.com", None).unwrap().is_none());
    }
}
