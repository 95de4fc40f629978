//! Pluggable key storage.
//!
//! The [`KeyStore`] trait abstracts over where identity, pre-key, and
//! session blobs live so callers can swap in SQLite, a flat file, an
//! in-memory store, or anything else. Values are opaque blobs; the store
//! never interprets them.
//!
//! Three built-in backends:
//! * [`FileKeyStore`] — one JSON file (default).
//! * [`MemoryKeyStore`] — ephemeral, for tests and throwaway sessions.
//! * `SqliteKeyStore` — SQLite (requires the `sqlite-keystore` feature).

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// The locally registered identity.
#[derive(Clone, Copy, Debug)]
pub struct LocalIdentity {
    pub registration_id: u32,
    /// Seed of the identity signing key.
    pub identity_seed: [u8; 32],
}

/// Asynchronous blob storage for everything the encryption layer persists.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn store_local_identity(&self, identity: LocalIdentity) -> io::Result<()>;
    async fn local_identity(&self) -> io::Result<Option<LocalIdentity>>;

    async fn store_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()>;
    async fn pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>>;
    async fn remove_pre_key(&self, id: u32) -> io::Result<()>;

    async fn store_signed_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()>;
    async fn signed_pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>>;

    async fn store_session(&self, jid: &str, device_id: u32, record: Vec<u8>) -> io::Result<()>;
    async fn load_session(&self, jid: &str, device_id: u32) -> io::Result<Option<Vec<u8>>>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── Shared in-memory model ──────────────────────────────────────────────────

#[derive(Default, Serialize, Deserialize)]
struct StoreData {
    identity: Option<(u32, String)>,
    pre_keys: HashMap<u32, String>,
    signed_pre_keys: HashMap<u32, String>,
    /// Keyed `jid/device_id`.
    sessions: HashMap<String, String>,
}

fn encode(blob: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(blob)
}

fn decode(blob: &str) -> io::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn session_key(jid: &str, device_id: u32) -> String {
    format!("{jid}/{device_id}")
}

impl StoreData {
    fn identity(&self) -> io::Result<Option<LocalIdentity>> {
        match &self.identity {
            None => Ok(None),
            Some((registration_id, seed_b64)) => {
                let seed = decode(seed_b64)?;
                let identity_seed: [u8; 32] = seed
                    .try_into()
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad identity seed"))?;
                Ok(Some(LocalIdentity {
                    registration_id: *registration_id,
                    identity_seed,
                }))
            }
        }
    }
}

// ─── MemoryKeyStore ──────────────────────────────────────────────────────────

/// An ephemeral key store. Everything is gone when the value drops.
#[derive(Default)]
pub struct MemoryKeyStore {
    data: Mutex<StoreData>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn store_local_identity(&self, identity: LocalIdentity) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        data.identity = Some((identity.registration_id, encode(&identity.identity_seed)));
        Ok(())
    }

    async fn local_identity(&self) -> io::Result<Option<LocalIdentity>> {
        self.data.lock().unwrap().identity()
    }

    async fn store_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()> {
        self.data.lock().unwrap().pre_keys.insert(id, encode(&record));
        Ok(())
    }

    async fn pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>> {
        self.data.lock().unwrap().pre_keys.get(&id).map(|b| decode(b)).transpose()
    }

    async fn remove_pre_key(&self, id: u32) -> io::Result<()> {
        self.data.lock().unwrap().pre_keys.remove(&id);
        Ok(())
    }

    async fn store_signed_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()> {
        self.data.lock().unwrap().signed_pre_keys.insert(id, encode(&record));
        Ok(())
    }

    async fn signed_pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>> {
        self.data.lock().unwrap().signed_pre_keys.get(&id).map(|b| decode(b)).transpose()
    }

    async fn store_session(&self, jid: &str, device_id: u32, record: Vec<u8>) -> io::Result<()> {
        self.data
            .lock()
            .unwrap()
            .sessions
            .insert(session_key(jid, device_id), encode(&record));
        Ok(())
    }

    async fn load_session(&self, jid: &str, device_id: u32) -> io::Result<Option<Vec<u8>>> {
        self.data
            .lock()
            .unwrap()
            .sessions
            .get(&session_key(jid, device_id))
            .map(|b| decode(b))
            .transpose()
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

// ─── FileKeyStore ────────────────────────────────────────────────────────────

/// The default key store — one JSON file, rewritten atomically on every
/// mutation. Suits the handful of keys and sessions one account holds.
pub struct FileKeyStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileKeyStore {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn flush(&self, data: &StoreData) -> io::Result<()> {
        let raw = serde_json::to_vec(data).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreData)) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        f(&mut data);
        self.flush(&data)
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn store_local_identity(&self, identity: LocalIdentity) -> io::Result<()> {
        self.mutate(|d| {
            d.identity = Some((identity.registration_id, encode(&identity.identity_seed)));
        })
    }

    async fn local_identity(&self) -> io::Result<Option<LocalIdentity>> {
        self.data.lock().unwrap().identity()
    }

    async fn store_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()> {
        self.mutate(|d| {
            d.pre_keys.insert(id, encode(&record));
        })
    }

    async fn pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>> {
        self.data.lock().unwrap().pre_keys.get(&id).map(|b| decode(b)).transpose()
    }

    async fn remove_pre_key(&self, id: u32) -> io::Result<()> {
        self.mutate(|d| {
            d.pre_keys.remove(&id);
        })
    }

    async fn store_signed_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()> {
        self.mutate(|d| {
            d.signed_pre_keys.insert(id, encode(&record));
        })
    }

    async fn signed_pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>> {
        self.data.lock().unwrap().signed_pre_keys.get(&id).map(|b| decode(b)).transpose()
    }

    async fn store_session(&self, jid: &str, device_id: u32, record: Vec<u8>) -> io::Result<()> {
        self.mutate(|d| {
            d.sessions.insert(session_key(jid, device_id), encode(&record));
        })
    }

    async fn load_session(&self, jid: &str, device_id: u32) -> io::Result<Option<Vec<u8>>> {
        self.data
            .lock()
            .unwrap()
            .sessions
            .get(&session_key(jid, device_id))
            .map(|b| decode(b))
            .transpose()
    }

    fn name(&self) -> &str {
        "json-file"
    }
}

// ─── SqliteKeyStore ──────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-keystore")]
pub use sqlite_store::SqliteKeyStore;

#[cfg(feature = "sqlite-keystore")]
mod sqlite_store {
    use super::*;
    use rusqlite::{params, Connection};

    /// SQLite-backed key store.
    ///
    /// Enable with the `sqlite-keystore` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// waxmpp-client = { version = "*", features = ["sqlite-keystore"] }
    /// ```
    pub struct SqliteKeyStore {
        path: PathBuf,
    }

    impl SqliteKeyStore {
        pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Open and initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(io::Error::other)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS identity (
                    id              INTEGER PRIMARY KEY CHECK (id = 0),
                    registration_id INTEGER NOT NULL,
                    seed            BLOB    NOT NULL
                );
                CREATE TABLE IF NOT EXISTS pre_keys (
                    id     INTEGER PRIMARY KEY,
                    record BLOB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS signed_pre_keys (
                    id     INTEGER PRIMARY KEY,
                    record BLOB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sessions (
                    jid       TEXT    NOT NULL,
                    device_id INTEGER NOT NULL,
                    record    BLOB    NOT NULL,
                    PRIMARY KEY (jid, device_id)
                );",
            )
            .map_err(io::Error::other)?;
            Ok(Self { path })
        }

        fn conn(&self) -> io::Result<Connection> {
            Connection::open(&self.path).map_err(io::Error::other)
        }
    }

    #[async_trait]
    impl KeyStore for SqliteKeyStore {
        async fn store_local_identity(&self, identity: LocalIdentity) -> io::Result<()> {
            self.conn()?
                .execute(
                    "INSERT OR REPLACE INTO identity (id, registration_id, seed) VALUES (0, ?1, ?2)",
                    params![identity.registration_id, identity.identity_seed.to_vec()],
                )
                .map_err(io::Error::other)?;
            Ok(())
        }

        async fn local_identity(&self) -> io::Result<Option<LocalIdentity>> {
            let conn = self.conn()?;
            let row = conn
                .query_row(
                    "SELECT registration_id, seed FROM identity WHERE id = 0",
                    [],
                    |row| {
                        let registration_id: u32 = row.get(0)?;
                        let seed: Vec<u8> = row.get(1)?;
                        Ok((registration_id, seed))
                    },
                )
                .ok();
            match row {
                None => Ok(None),
                Some((registration_id, seed)) => {
                    let identity_seed: [u8; 32] = seed.try_into().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "bad identity seed")
                    })?;
                    Ok(Some(LocalIdentity {
                        registration_id,
                        identity_seed,
                    }))
                }
            }
        }

        async fn store_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()> {
            self.conn()?
                .execute(
                    "INSERT OR REPLACE INTO pre_keys (id, record) VALUES (?1, ?2)",
                    params![id, record],
                )
                .map_err(io::Error::other)?;
            Ok(())
        }

        async fn pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>> {
            let conn = self.conn()?;
            Ok(conn
                .query_row("SELECT record FROM pre_keys WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .ok())
        }

        async fn remove_pre_key(&self, id: u32) -> io::Result<()> {
            self.conn()?
                .execute("DELETE FROM pre_keys WHERE id = ?1", params![id])
                .map_err(io::Error::other)?;
            Ok(())
        }

        async fn store_signed_pre_key(&self, id: u32, record: Vec<u8>) -> io::Result<()> {
            self.conn()?
                .execute(
                    "INSERT OR REPLACE INTO signed_pre_keys (id, record) VALUES (?1, ?2)",
                    params![id, record],
                )
                .map_err(io::Error::other)?;
            Ok(())
        }

        async fn signed_pre_key(&self, id: u32) -> io::Result<Option<Vec<u8>>> {
            let conn = self.conn()?;
            Ok(conn
                .query_row(
                    "SELECT record FROM signed_pre_keys WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .ok())
        }

        async fn store_session(&self, jid: &str, device_id: u32, record: Vec<u8>) -> io::Result<()> {
            self.conn()?
                .execute(
                    "INSERT OR REPLACE INTO sessions (jid, device_id, record) VALUES (?1, ?2, ?3)",
                    params![jid, device_id, record],
                )
                .map_err(io::Error::other)?;
            Ok(())
        }

        async fn load_session(&self, jid: &str, device_id: u32) -> io::Result<Option<Vec<u8>>> {
            let conn = self.conn()?;
            Ok(conn
                .query_row(
                    "SELECT record FROM sessions WHERE jid = ?1 AND device_id = ?2",
                    params![jid, device_id],
                    |r| r.get(0),
                )
                .ok())
        }

        fn name(&self) -> &str {
            "sqlite"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryKeyStore::new();
        assert!(store.local_identity().await.unwrap().is_none());

        store
            .store_local_identity(LocalIdentity {
                registration_id: 42,
                identity_seed: [7; 32],
            })
            .await
            .unwrap();
        let identity = store.local_identity().await.unwrap().unwrap();
        assert_eq!(identity.registration_id, 42);
        assert_eq!(identity.identity_seed, [7; 32]);

        store.store_pre_key(5, vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.pre_key(5).await.unwrap(), Some(vec![1, 2, 3]));
        store.remove_pre_key(5).await.unwrap();
        assert_eq!(store.pre_key(5).await.unwrap(), None);

        store
            .store_session("x@s.whatsapp.net", 1, vec![9])
            .await
            .unwrap();
        assert_eq!(
            store.load_session("x@s.whatsapp.net", 1).await.unwrap(),
            Some(vec![9])
        );
        assert_eq!(store.load_session("y@s.whatsapp.net", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        {
            let store = FileKeyStore::open(&path).unwrap();
            store
                .store_local_identity(LocalIdentity {
                    registration_id: 9,
                    identity_seed: [3; 32],
                })
                .await
                .unwrap();
            store.store_signed_pre_key(1, vec![4, 5]).await.unwrap();
        }

        let store = FileKeyStore::open(&path).unwrap();
        assert_eq!(
            store.local_identity().await.unwrap().unwrap().registration_id,
            9
        );
        assert_eq!(store.signed_pre_key(1).await.unwrap(), Some(vec![4, 5]));
    }
}
