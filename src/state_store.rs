//! Persists router state across process restarts. The local backend writes
//! atomically (temp file + rename, private permissions on the containing
//! directory); an optional remote key-value backend can be layered on top.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RaceError, Result};
use crate::router::RouterState;

/// Self-describing blob: bumping this invalidates any state saved under an
/// older schema, causing a clean reinitialization rather than a crash.
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct StateBlob {
    pub version: u32,
    pub state: RouterState,
    pub saved_at_unix_secs: u64,
}

#[async_trait::async_trait]
pub trait RouterStateStore: Send + Sync {
    async fn save(&self, state: &RouterState, saved_at_unix_secs: u64) -> Result<()>;
    async fn load(&self) -> Result<Option<RouterState>>;
}

/// Local-file backend: atomic temp-and-rename write, directory created with
/// private (0700 on Unix) permissions the first time it's needed.
pub struct LocalFileStateStore {
    path: PathBuf,
}

impl LocalFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LocalFileStateStore { path: path.into() }
    }

    fn ensure_parent_dir(&self) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if dir.as_os_str().is_empty() {
                return Ok(());
            }
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(dir)?.permissions();
                perms.set_mode(0o700);
                fs::set_permissions(dir, perms)?;
            }
        }
        Ok(())
    }

    fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RouterStateStore for LocalFileStateStore {
    async fn save(&self, state: &RouterState, saved_at_unix_secs: u64) -> Result<()> {
        let blob = StateBlob {
            version: STATE_SCHEMA_VERSION,
            state: state.clone(),
            saved_at_unix_secs,
        };
        let bytes = serde_json::to_vec_pretty(&blob)
            .map_err(|e| RaceError::StateStore(format!("serialize: {e}")))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            // ensure_parent_dir + write happen on the blocking pool: both are
            // synchronous filesystem calls.
            let store = LocalFileStateStore { path: path.clone() };
            store.ensure_parent_dir()?;
            LocalFileStateStore::write_atomically(&path, &bytes)
        })
        .await
        .map_err(|e| RaceError::StateStore(format!("join: {e}")))?
        .map_err(|e| RaceError::StateStore(format!("write {}: {e}", self.path.display())))
    }

    async fn load(&self) -> Result<Option<RouterState>> {
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || fs::read(&path))
            .await
            .map_err(|e| RaceError::StateStore(format!("join: {e}")))?;
        let bytes = match bytes {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RaceError::StateStore(format!("read: {e}"))),
        };
        match serde_json::from_slice::<StateBlob>(&bytes) {
            Ok(blob) if blob.version == STATE_SCHEMA_VERSION => Ok(Some(blob.state)),
            Ok(_) => Ok(None), // version mismatch: treat as cold start
            Err(_) => Ok(None), // corrupt blob: treat as cold start
        }
    }
}

/// Narrow remote key-value capability; a single key holds the whole blob.
#[async_trait::async_trait]
pub trait RemoteKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Layers a remote `RemoteKv` backend over a local file store: writes go to
/// both, reads prefer remote and fall back to local on remote failure.
pub struct LayeredStateStore<R: RemoteKv> {
    local: LocalFileStateStore,
    remote: R,
    remote_key: String,
}

impl<R: RemoteKv> LayeredStateStore<R> {
    pub fn new(local: LocalFileStateStore, remote: R, remote_key: impl Into<String>) -> Self {
        LayeredStateStore { local, remote, remote_key: remote_key.into() }
    }
}

#[async_trait::async_trait]
impl<R: RemoteKv> RouterStateStore for LayeredStateStore<R> {
    async fn save(&self, state: &RouterState, saved_at_unix_secs: u64) -> Result<()> {
        let blob = StateBlob {
            version: STATE_SCHEMA_VERSION,
            state: state.clone(),
            saved_at_unix_secs,
        };
        let json = serde_json::to_string(&blob)
            .map_err(|e| RaceError::StateStore(format!("serialize: {e}")))?;
        // Remote write failure is non-fatal: local write still lands.
        let _ = self.remote.set(&self.remote_key, &json).await;
        self.local.save(state, saved_at_unix_secs).await
    }

    async fn load(&self) -> Result<Option<RouterState>> {
        if let Ok(Some(json)) = self.remote.get(&self.remote_key).await {
            if let Ok(blob) = serde_json::from_str::<StateBlob>(&json) {
                if blob.version == STATE_SCHEMA_VERSION {
                    return Ok(Some(blob.state));
                }
            }
        }
        self.local.load().await
    }
}

/// `redis`-backed `RemoteKv`. Behind the `redis-backend` feature so the core
/// crate never forces a network dependency on callers who only want the
/// local file store.
#[cfg(feature = "redis-backend")]
pub mod redis_kv {
    use std::sync::Arc;

    use redis::AsyncCommands;
    use tokio::sync::Mutex;

    use super::RemoteKv;
    use crate::error::{RaceError, Result};

    /// A lazily-opened, reconnect-on-failure multiplexed connection over a
    /// single redis key. One retry: a command that fails drops the cached
    /// connection and reconnects once before giving up.
    pub struct RedisKv {
        client: redis::Client,
        connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
    }

    impl RedisKv {
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| RaceError::StateStore(format!("invalid redis url: {e}")))?;
            Ok(RedisKv { client, connection: Arc::new(Mutex::new(None)) })
        }

        async fn ensure_connection(
            &self,
            slot: &mut Option<redis::aio::MultiplexedConnection>,
        ) -> Result<()> {
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| RaceError::StateStore(format!("redis connect: {e}")))?,
            );
            tracing::debug!("redis state backend connected");
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RemoteKv for RedisKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            for attempt in 0..2 {
                let mut slot = self.connection.lock().await;
                self.ensure_connection(&mut slot).await?;
                let conn = slot.as_mut().expect("connection just ensured");
                match conn.get::<_, Option<String>>(key).await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        tracing::warn!(attempt, error = %err, "redis GET failed; reconnecting");
                        *slot = None;
                        if attempt == 1 {
                            return Err(RaceError::StateStore(format!("redis get: {err}")));
                        }
                    }
                }
            }
            unreachable!("loop returns or errors on its final attempt")
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            for attempt in 0..2 {
                let mut slot = self.connection.lock().await;
                self.ensure_connection(&mut slot).await?;
                let conn = slot.as_mut().expect("connection just ensured");
                match conn.set::<_, _, ()>(key, value).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        tracing::warn!(attempt, error = %err, "redis SET failed; reconnecting");
                        *slot = None;
                        if attempt == 1 {
                            return Err(RaceError::StateStore(format!("redis set: {err}")));
                        }
                    }
                }
            }
            unreachable!("loop returns or errors on its final attempt")
        }
    }
}

/// In-memory `RemoteKv` stand-in: exercises `LayeredStateStore`'s
/// prefer-remote/fall-back-to-local wiring without a real server.
pub struct InMemoryKv {
    entries: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        InMemoryKv { entries: std::sync::Mutex::new(std::collections::HashMap::new()) }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteKv for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ArmState;
    use std::collections::BTreeMap;

    fn sample_state() -> RouterState {
        let mut arms = BTreeMap::new();
        arms.insert(
            crate::query::ModelId::new("a"),
            ArmState::new(3, 1.0),
        );
        RouterState { dim: 3, arms }
    }

    #[tokio::test]
    async fn round_trips_through_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStateStore::new(dir.path().join("state.json"));
        let state = sample_state();
        store.save(&state, 1234).await.unwrap();
        let loaded = store.load().await.unwrap().expect("state should load");
        assert_eq!(loaded.dim, 3);
        assert!(loaded.arms.contains_key(&crate::query::ModelId::new("a")));
    }

    #[tokio::test]
    async fn missing_file_is_cold_start_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStateStore::new(dir.path().join("nope.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_blob_is_treated_as_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"not json").unwrap();
        let store = LocalFileStateStore::new(path);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn layered_store_prefers_remote_and_writes_both() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFileStateStore::new(dir.path().join("state.json"));
        let remote = InMemoryKv::new();
        let store = LayeredStateStore::new(local, remote, "router-state");

        let state = sample_state();
        store.save(&state, 42).await.unwrap();

        // Both backends now hold the blob.
        assert!(store.remote.get("router-state").await.unwrap().is_some());
        let loaded = store.load().await.unwrap().expect("state should load from remote");
        assert_eq!(loaded.dim, 3);
    }

    #[tokio::test]
    async fn layered_store_falls_back_to_local_when_remote_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFileStateStore::new(dir.path().join("state.json"));
        local.save(&sample_state(), 1).await.unwrap();

        let remote = InMemoryKv::new();
        let store = LayeredStateStore::new(local, remote, "router-state");

        let loaded = store.load().await.unwrap().expect("local fallback should load");
        assert_eq!(loaded.dim, 3);
    }
}
