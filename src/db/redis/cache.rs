//! Redis snapshots of candidate source reads.
//!
//! The recording side serializes every successful read and hands it to a
//! single writer task. The serving side reads those snapshots back when the
//! primary source is down. Snapshots expire on their own; nothing deletes
//! them explicitly.

use redis::AsyncCommands;
use redis::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::error::AppResult;
use crate::models::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Signals loaded for a user
    UserSignals(UserId),
    /// A candidate batch, keyed by the source cursor it was fetched with
    CandidateBatch {
        user_id: UserId,
        cursor: Option<String>,
    },
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::UserSignals(user_id) => write!(f, "reco:user:{}", user_id),
            CacheKey::CandidateBatch { user_id, cursor } => write!(
                f,
                "reco:candidates:{}:{}",
                user_id,
                cursor.as_deref().unwrap_or("start")
            ),
        }
    }
}

/// Opens the Redis client used for snapshots. No connection is made until
/// the first read or write.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// A serialized snapshot waiting for the writer task
struct SnapshotWrite {
    key: String,
    payload: String,
    ttl_secs: u64,
}

impl SnapshotWrite {
    fn encode<T: Serialize>(key: &CacheKey, value: &T, ttl_secs: u64) -> serde_json::Result<Self> {
        Ok(Self {
            key: key.to_string(),
            payload: serde_json::to_string(value)?,
            ttl_secs,
        })
    }
}

fn decode_snapshot<T: DeserializeOwned>(key: &CacheKey, raw: Option<String>) -> AppResult<Option<T>> {
    raw.map(|payload| {
        serde_json::from_str(&payload)
            .map_err(|e| AppError::Internal(format!("corrupt snapshot at {}: {}", key, e)))
    })
    .transpose()
}

/// Snapshot store shared by the recording and serving sources
#[derive(Clone)]
pub struct Cache {
    redis_client: Client,
    writes: mpsc::UnboundedSender<SnapshotWrite>,
}

/// Stops the writer task once pending snapshots are written
pub struct CacheWriterHandle {
    stop_tx: mpsc::Sender<()>,
}

impl CacheWriterHandle {
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(()).await;
        tracing::info!("Snapshot writer asked to stop");
    }
}

impl Cache {
    /// Spawns the writer task and returns the store with its stop handle
    pub async fn new(redis_client: Client) -> (Self, CacheWriterHandle) {
        let (writes, pending) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);

        tokio::spawn(run_writer(redis_client.clone(), pending, stop_rx));

        (
            Self {
                redis_client,
                writes,
            },
            CacheWriterHandle { stop_tx },
        )
    }

    /// Reads the snapshot stored under `key`, if any
    pub async fn read_snapshot<T: DeserializeOwned>(&self, key: &CacheKey) -> AppResult<Option<T>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(key.to_string()).await?;
        decode_snapshot(key, raw)
    }

    /// Queues a snapshot of `value`. Never waits on Redis; failures are
    /// logged and the snapshot is lost.
    pub fn record<T: Serialize>(&self, key: &CacheKey, value: &T, ttl_secs: u64) {
        let write = match SnapshotWrite::encode(key, value, ttl_secs) {
            Ok(write) => write,
            Err(e) => {
                tracing::error!(error = %e, key = %key, "Snapshot not serializable");
                return;
            }
        };

        if self.writes.send(write).is_err() {
            tracing::warn!(key = %key, "Snapshot writer stopped, dropping snapshot");
        }
    }
}

async fn run_writer(
    client: Client,
    mut pending: mpsc::UnboundedReceiver<SnapshotWrite>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut written: u64 = 0;
    let mut failed: u64 = 0;

    loop {
        tokio::select! {
            Some(write) = pending.recv() => {
                match store(&client, write).await {
                    Ok(()) => written += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::error!(error = %e, failed, "Snapshot write failed");
                    }
                }
            }
            _ = stop_rx.recv() => {
                pending.close();
                while let Some(write) = pending.recv().await {
                    match store(&client, write).await {
                        Ok(()) => written += 1,
                        Err(_) => failed += 1,
                    }
                }
                tracing::info!(written, failed, "Snapshot writer stopped");
                break;
            }
        }
    }
}

async fn store(client: &Client, write: SnapshotWrite) -> AppResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: () = conn.set_ex(write.key, write.payload, write.ttl_secs).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    #[test]
    fn test_cache_key_display() {
        assert_eq!(CacheKey::UserSignals(UserId(42)).to_string(), "reco:user:42");

        let first = CacheKey::CandidateBatch {
            user_id: UserId(7),
            cursor: None,
        };
        assert_eq!(first.to_string(), "reco:candidates:7:start");

        let next = CacheKey::CandidateBatch {
            user_id: UserId(7),
            cursor: Some("bzoxMDA".to_string()),
        };
        assert_eq!(next.to_string(), "reco:candidates:7:bzoxMDA");
    }

    #[test]
    fn test_encoded_snapshot_carries_key_and_ttl() {
        let key = CacheKey::UserSignals(UserId(3));
        let write = SnapshotWrite::encode(&key, &User::new(UserId(3)), 90).unwrap();

        assert_eq!(write.key, "reco:user:3");
        assert_eq!(write.ttl_secs, 90);
        let user: Option<User> = decode_snapshot(&key, Some(write.payload)).unwrap();
        assert_eq!(user.map(|u| u.id), Some(UserId(3)));
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let key = CacheKey::UserSignals(UserId(3));
        let user: Option<User> = decode_snapshot(&key, None).unwrap();
        assert!(user.is_none());
    }

    #[test]
    fn test_corrupt_snapshot_names_key() {
        let key = CacheKey::UserSignals(UserId(3));
        let result: AppResult<Option<User>> = decode_snapshot(&key, Some("{not json".to_string()));

        match result {
            Err(AppError::Internal(message)) => assert!(message.contains("reco:user:3")),
            other => panic!("expected corrupt snapshot error, got {:?}", other.map(|_| ())),
        }
    }
}
