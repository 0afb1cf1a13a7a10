//! Raft storage for one channel group.
//!
//! Combines in-memory log storage with the channel state machine and
//! durable snapshot persistence. Log entries live in memory: a restarting
//! node recovers from its persisted snapshot and is caught up by the leader
//! through replay or snapshot installation, so committed data survives any
//! minority of failures.
//!
//! Snapshots are persisted through `object_store` with a two-phase commit:
//! data and metadata are written to temp paths, then renamed into place
//! (metadata last, acting as the commit marker). A crash mid-write leaves
//! only orphaned temp files, which are cleaned up on the next startup.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftStorage, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, Vote,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::commands::ChannelOpResult;
use super::state_machine::ChannelStateMachine;
use super::types::{RaftNodeId, TypeConfig};

/// Snapshot metadata persisted alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotManifest {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    snapshot_id: String,
}

/// Snapshot cached in memory, mirroring what is in the object store.
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

/// Combined log and state machine storage for one channel group.
#[derive(Clone)]
pub struct ChannelRaftStore {
    /// Vote state for the current term.
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    /// Log entries indexed by log index.
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    /// Last purged log id.
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    /// The channel state machine.
    sm: Arc<ChannelStateMachine>,
    /// Last applied log id. Entries at or below it are skipped on
    /// re-apply, making recovery idempotent.
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    /// Current membership.
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    /// Serializes apply against snapshot capture/install so a snapshot
    /// reflects exactly one committed index.
    gate: Arc<RwLock<()>>,
    /// Cached snapshot.
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    /// Object store for durable snapshot persistence.
    object_store: Arc<dyn ObjectStore>,
    /// Path prefix for this channel's snapshots.
    snapshot_path: ObjectPath,
}

impl ChannelRaftStore {
    pub fn new(
        sm: Arc<ChannelStateMachine>,
        object_store: Arc<dyn ObjectStore>,
        snapshot_prefix: &str,
    ) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm,
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            gate: Arc::new(RwLock::new(())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            snapshot_path: ObjectPath::from(snapshot_prefix),
        }
    }

    pub fn state_machine(&self) -> Arc<ChannelStateMachine> {
        self.sm.clone()
    }

    fn data_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.snapshot", self.snapshot_path))
    }

    fn meta_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/current.meta", self.snapshot_path))
    }

    /// Load the latest persisted snapshot, restoring the stores and the
    /// last-applied index.
    ///
    /// Returns `Ok(true)` if a snapshot was loaded, `Ok(false)` on a clean
    /// start. A snapshot that exists but cannot be read or decoded is
    /// corruption and fails startup rather than risking divergent state.
    pub async fn load_snapshot_from_store(&self) -> Result<bool, StorageError<RaftNodeId>> {
        self.cleanup_temp_files().await;

        let meta_bytes = match self.object_store.get(&self.meta_path()).await {
            Ok(result) => result.bytes().await.map_err(|e| {
                error!(channel = self.sm.channel(), error = %e, "Snapshot manifest unreadable");
                read_error(e)
            })?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!(channel = self.sm.channel(), "No persisted snapshot, clean start");
                return Ok(false);
            }
            Err(e) => return Err(read_error(e)),
        };

        let manifest: SnapshotManifest = bincode::deserialize(&meta_bytes).map_err(|e| {
            error!(channel = self.sm.channel(), error = %e, "Snapshot manifest corrupted");
            read_error(e)
        })?;

        let data = match self.object_store.get(&self.data_path()).await {
            Ok(result) => result.bytes().await.map_err(read_error)?.to_vec(),
            Err(object_store::Error::NotFound { .. }) => {
                // Manifest without data means an incomplete write.
                error!(
                    channel = self.sm.channel(),
                    snapshot_id = %manifest.snapshot_id,
                    "Snapshot manifest exists but data file is missing"
                );
                return Err(read_error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "snapshot manifest exists but data file is missing",
                )));
            }
            Err(e) => return Err(read_error(e)),
        };

        self.sm.restore(&data).map_err(read_error)?;
        *self.last_applied_log.write().await = manifest.last_log_id;
        *self.last_membership.write().await = manifest.last_membership.clone();
        // The in-memory log restarted empty; everything up to the snapshot
        // counts as purged so the log state lines up with the snapshot.
        *self.last_purged_log_id.write().await = manifest.last_log_id;

        let meta = SnapshotMeta {
            last_log_id: manifest.last_log_id,
            last_membership: manifest.last_membership,
            snapshot_id: manifest.snapshot_id,
        };
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });

        info!(
            channel = self.sm.channel(),
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Restored channel state from persisted snapshot"
        );
        Ok(true)
    }

    /// Delete temp files left over from crashed snapshot writes. Temp
    /// files are never referenced by a valid snapshot, so this is safe at
    /// any time.
    async fn cleanup_temp_files(&self) {
        use futures::StreamExt;

        let mut temp_files: Vec<ObjectPath> = Vec::new();
        let mut stream = self.object_store.list(Some(&self.snapshot_path));
        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => {
                    let path = meta.location.to_string();
                    if path.contains("/temp-")
                        && (path.ends_with(".snapshot") || path.ends_with(".meta"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Error listing snapshot files during temp cleanup");
                }
            }
        }

        for path in temp_files {
            match self.object_store.delete(&path).await {
                Ok(()) => info!(path = %path, "Removed orphaned temp snapshot file"),
                Err(e) => debug!(error = %e, path = %path, "Failed to delete temp file"),
            }
        }
    }

    /// Persist a snapshot: temp write, then rename with the manifest last
    /// as the commit marker. Falls back to copy+delete on backends without
    /// native rename.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<RaftNodeId>> {
        let temp_data = ObjectPath::from(format!(
            "{}/temp-{}.snapshot",
            self.snapshot_path, meta.snapshot_id
        ));
        let temp_meta = ObjectPath::from(format!(
            "{}/temp-{}.meta",
            self.snapshot_path, meta.snapshot_id
        ));

        let manifest = SnapshotManifest {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };
        let manifest_bytes = bincode::serialize(&manifest).map_err(write_error)?;

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(write_error)?;

        if let Err(e) = self
            .object_store
            .put(&temp_meta, Bytes::copy_from_slice(&manifest_bytes).into())
            .await
        {
            let _ = self.object_store.delete(&temp_data).await;
            return Err(write_error(e));
        }

        self.commit_rename(&temp_data, &self.data_path(), &temp_meta)
            .await?;
        self.commit_rename(&temp_meta, &self.meta_path(), &temp_meta)
            .await?;

        info!(
            channel = self.sm.channel(),
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "Persisted channel snapshot"
        );
        Ok(())
    }

    async fn commit_rename(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
        cleanup_on_failure: &ObjectPath,
    ) -> Result<(), StorageError<RaftNodeId>> {
        if let Err(rename_err) = self.object_store.rename(from, to).await {
            if let Err(copy_err) = self.object_store.copy(from, to).await {
                error!(error = %copy_err, from = %from, to = %to, "Snapshot commit failed");
                let _ = self.object_store.delete(from).await;
                let _ = self.object_store.delete(cleanup_on_failure).await;
                return Err(write_error(copy_err));
            }
            let _ = self.object_store.delete(from).await;
            debug!(error = %rename_err, "Used copy+delete fallback for snapshot commit");
        }
        Ok(())
    }
}

fn read_error(e: impl std::error::Error) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Read,
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    )
}

fn write_error(e: impl std::error::Error) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Snapshot(None),
        openraft::ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

impl RaftStorage<TypeConfig> for ChannelRaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = match log.values().last() {
            Some(entry) => Some(entry.log_id),
            None => last_purged,
        };
        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log = self.log.write().await;
        let doomed: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in doomed {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);

        let mut log = self.log.write().await;
        let doomed: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in doomed {
            log.remove(&key);
        }
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ChannelOpResult>, StorageError<RaftNodeId>> {
        let _apply = self.gate.write().await;
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            // Idempotent re-apply: entries at or below the recorded
            // last-applied index have already mutated the stores.
            let already_applied = self
                .last_applied_log
                .read()
                .await
                .map(|applied| entry.log_id.index <= applied.index)
                .unwrap_or(false);
            if already_applied {
                warn!(
                    channel = self.sm.channel(),
                    index = entry.log_id.index,
                    "Skipping already-applied log entry"
                );
                responses.push(ChannelOpResult::Ok);
                continue;
            }

            match &entry.payload {
                EntryPayload::Blank => responses.push(ChannelOpResult::Ok),
                EntryPayload::Normal(op) => responses.push(self.sm.apply(op)),
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    responses.push(ChannelOpResult::Ok);
                }
            }

            *self.last_applied_log.write().await = Some(entry.log_id);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let _install = self.gate.write().await;
        let data = snapshot.into_inner();

        // Failure here is fatal to this channel instance: the stores keep
        // their previous consistent state and catch-up restarts from
        // scratch.
        self.sm.restore(&data).map_err(|e| {
            error!(
                channel = self.sm.channel(),
                snapshot_id = %meta.snapshot_id,
                error = %e,
                "Snapshot install failed"
            );
            read_error(e)
        })?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        self.persist_snapshot(meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });

        info!(
            channel = self.sm.channel(),
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Installed snapshot from leader"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        match &*self.cached_snapshot.read().await {
            Some(cached) => Ok(Some(Snapshot {
                meta: cached.meta.clone(),
                snapshot: Box::new(Cursor::new(cached.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for ChannelRaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let _capture = self.gate.read().await;

        let data = self.sm.snapshot().map_err(read_error)?;
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();

        let snapshot_id = format!(
            "snapshot-{}",
            last_applied.map(|l| l.index).unwrap_or(0)
        );
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        self.persist_snapshot(&meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for ChannelRaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}
