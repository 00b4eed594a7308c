//! Coordination service on JetStream key-value buckets.
//!
//! Paths map to keys by dropping the leading slash and turning the other
//! slashes into dots, so `/flowci-agents/42` is stored under
//! `flowci-agents.42`. Path segments must therefore not contain dots.
//!
//! Three buckets are used:
//!
//! - persistent nodes, kept until deleted;
//! - ephemeral nodes, with a max age of the session ttl. The process that
//!   created a node keeps re-writing it; once it stops, the node ages out
//!   and watchers notice on their next sweep;
//! - locks, with a max age of the lock ttl so that a crashed holder cannot
//!   keep a lock forever.

use crate::connection::NatsConnection;
use async_nats::jetstream::{
    self,
    kv::{self, Operation},
    stream::StorageType,
};
use async_trait::async_trait;
use bytes::Bytes;
use flowci_core::ports::{CoordEvent, CoordEventStream, Coordinator, CreateMode, LockToken};
use flowci_core::{Error, Result};
use futures::{StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_POLL: Duration = Duration::from_millis(50);

/// Key of a coordination path.
pub fn key_of(path: &str) -> Result<String> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let valid = !trimmed.is_empty()
        && trimmed
            .split('/')
            .all(|s| !s.is_empty() && !s.contains('.'));
    if !valid {
        return Err(Error::Coordination(format!("invalid path '{}'", path)));
    }
    Ok(trimmed.replace('/', "."))
}

/// Coordination path of a key.
pub fn path_of(key: &str) -> String {
    format!("/{}", key.replace('.', "/"))
}

fn is_child_key(key: &str, parent: &str) -> bool {
    key.strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|rest| !rest.contains('.'))
}

fn is_descendant_key(key: &str, parent: &str) -> bool {
    key.strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('.'))
}

fn coord_err(e: impl std::fmt::Display) -> Error {
    Error::Coordination(e.to_string())
}

async fn bucket(js: &jetstream::Context, name: String, max_age: Duration) -> Result<kv::Store> {
    if let Ok(store) = js.get_key_value(&name).await {
        return Ok(store);
    }
    js.create_key_value(kv::Config {
        bucket: name.clone(),
        history: 1,
        max_age,
        storage: StorageType::File,
        ..Default::default()
    })
    .await
    .map_err(|e| Error::Coordination(format!("Failed to create bucket {}: {}", name, e)))
}

async fn keys(store: &kv::Store) -> Result<Vec<String>> {
    store
        .keys()
        .await
        .map_err(coord_err)?
        .map_err(coord_err)
        .try_collect()
        .await
}

#[derive(Clone)]
pub struct KvCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    nodes: kv::Store,
    sessions: kv::Store,
    locks: kv::Store,
    /// Ephemeral nodes created by this process, with their latest data.
    owned: Arc<Mutex<HashMap<String, Bytes>>>,
    reconnected: broadcast::Sender<()>,
    sweep: Duration,
    keepalive: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

impl KvCoordinator {
    /// Ensure the buckets exist and start refreshing owned ephemeral nodes.
    pub async fn new(conn: &NatsConnection) -> Result<Self> {
        let config = conn.config();
        let js = conn.jetstream();

        let nodes = bucket(js, config.nodes_bucket(), Duration::ZERO).await?;
        let sessions = bucket(js, config.sessions_bucket(), config.session_ttl()).await?;
        let locks = bucket(js, config.locks_bucket(), config.lock_ttl()).await?;

        let owned = Arc::new(Mutex::new(HashMap::new()));
        let keepalive = tokio::spawn(refresh_sessions(
            sessions.clone(),
            owned.clone(),
            config.session_ttl() / 3,
            conn.reconnected(),
        ));

        // Re-publish reconnects so each watcher gets its own receiver.
        let (reconnected, _) = broadcast::channel(16);
        let tx = reconnected.clone();
        let mut rx = conn.reconnected();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = tx.send(());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!(bucket = %config.coord_bucket, "Coordinator ready");

        Ok(Self {
            inner: Arc::new(Inner {
                nodes,
                sessions,
                locks,
                owned,
                reconnected,
                sweep: (config.session_ttl() / 2).max(Duration::from_secs(1)),
                keepalive,
            }),
        })
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.inner
            .owned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn locate(&self, key: &str) -> Result<Option<(&kv::Store, Bytes)>> {
        if let Some(value) = self.inner.sessions.get(key).await.map_err(coord_err)? {
            return Ok(Some((&self.inner.sessions, value)));
        }
        if let Some(value) = self.inner.nodes.get(key).await.map_err(coord_err)? {
            return Ok(Some((&self.inner.nodes, value)));
        }
        Ok(None)
    }
}

/// Keep ephemeral nodes owned by this process from ageing out.
async fn refresh_sessions(
    sessions: kv::Store,
    owned: Arc<Mutex<HashMap<String, Bytes>>>,
    period: Duration,
    mut reconnected: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            r = reconnected.recv() => {
                if matches!(r, Err(broadcast::error::RecvError::Closed)) {
                    return;
                }
            }
        }

        let snapshot: Vec<(String, Bytes)> = owned
            .lock()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        for (key, value) in snapshot {
            if let Err(e) = sessions.put(key.as_str(), value).await {
                warn!(%key, error = %e, "Failed to refresh ephemeral node");
            }
        }
    }
}

async fn children(stores: [&kv::Store; 2], parent: &str) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    for store in stores {
        for key in keys(store).await? {
            if is_child_key(&key, parent) {
                found.insert(path_of(&key));
            }
        }
    }
    Ok(found)
}

enum WatchInput {
    Entry(Option<std::result::Result<kv::Entry, String>>),
    Sweep,
    Reconnected,
}

#[async_trait]
impl Coordinator for KvCoordinator {
    async fn create(&self, mode: CreateMode, path: &str, data: &[u8]) -> Result<()> {
        let key = key_of(path)?;
        if self.locate(&key).await?.is_some() {
            return Err(Error::Coordination(format!("node {} already exists", path)));
        }

        let store = match mode {
            CreateMode::Persistent => &self.inner.nodes,
            CreateMode::Ephemeral => &self.inner.sessions,
        };
        let value = Bytes::copy_from_slice(data);

        store.create(&key, value.clone()).await.map_err(|e| {
            if e.kind() == kv::CreateErrorKind::AlreadyExists {
                Error::Coordination(format!("node {} already exists", path))
            } else {
                coord_err(e)
            }
        })?;

        if mode == CreateMode::Ephemeral {
            self.owned().insert(key, value);
        }
        debug!(path, ?mode, "Node created");
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = key_of(path)?;
        let Some((store, _)) = self.locate(&key).await? else {
            return Err(Error::Coordination(format!("node {} not found", path)));
        };

        let value = Bytes::copy_from_slice(data);
        store.put(key.as_str(), value.clone()).await.map_err(coord_err)?;

        if let Some(current) = self.owned().get_mut(&key) {
            *current = value;
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let key = key_of(path)?;
        Ok(self.locate(&key).await?.map(|(_, value)| value.to_vec()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = key_of(path)?;
        Ok(self.locate(&key).await?.is_some())
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let key = key_of(path)?;

        let mut doomed = Vec::new();
        for store in [&self.inner.nodes, &self.inner.sessions] {
            for k in keys(store).await? {
                if is_descendant_key(&k, &key) {
                    doomed.push((store, k));
                }
            }
        }

        if !doomed.is_empty() && !recursive {
            return Err(Error::Coordination(format!("node {} has children", path)));
        }

        if let Some((store, _)) = self.locate(&key).await? {
            doomed.push((store, key));
        }

        for (store, k) in doomed {
            self.owned().remove(&k);
            store.delete(k.as_str()).await.map_err(coord_err)?;
        }
        Ok(())
    }

    async fn acquire(&self, path: &str, wait: Duration) -> Result<Option<LockToken>> {
        let key = key_of(path)?;
        let owner = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;

        loop {
            match self
                .inner
                .locks
                .create(&key, Bytes::from(owner.clone()))
                .await
            {
                Ok(_) => {
                    return Ok(Some(LockToken {
                        path: path.to_string(),
                        owner,
                    }));
                }
                Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(path, "Lock wait timed out");
                        return Ok(None);
                    }
                    tokio::time::sleep(LOCK_POLL.min(deadline - now)).await;
                }
                Err(e) => return Err(coord_err(e)),
            }
        }
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        let key = key_of(&token.path)?;
        let entry = self.inner.locks.entry(&key).await.map_err(coord_err)?;

        match entry {
            Some(entry)
                if entry.operation == Operation::Put
                    && entry.value.as_ref() == token.owner.as_bytes() =>
            {
                self.inner
                    .locks
                    .delete_expect_revision(&key, Some(entry.revision))
                    .await
                    .map_err(coord_err)
            }
            _ => Err(Error::Coordination(format!(
                "lock {} not held by {}",
                token.path, token.owner
            ))),
        }
    }

    async fn watch_children(&self, path: &str) -> Result<CoordEventStream> {
        let parent = key_of(path)?;
        let filter = format!("{}.*", parent);

        let nodes = self.inner.nodes.clone();
        let sessions = self.inner.sessions.clone();
        // Last value seen per child; `None` until a write is observed.
        let mut known: HashMap<String, Option<Bytes>> = children([&nodes, &sessions], &parent)
            .await?
            .into_iter()
            .map(|child| (child, None))
            .collect();

        let mut watches = Box::pin(futures::stream::select(
            nodes.watch(&filter).await.map_err(coord_err)?,
            sessions.watch(&filter).await.map_err(coord_err)?,
        ));
        let mut reconnected = self.inner.reconnected.subscribe();
        let sweep = self.inner.sweep;
        let mut ticker = tokio::time::interval_at(Instant::now() + sweep, sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stream = async_stream::stream! {
            loop {
                let input = tokio::select! {
                    entry = watches.next() => {
                        WatchInput::Entry(entry.map(|r| r.map_err(|e| e.to_string())))
                    }
                    _ = ticker.tick() => WatchInput::Sweep,
                    Ok(()) = reconnected.recv() => WatchInput::Reconnected,
                };

                match input {
                    WatchInput::Entry(Some(Ok(entry))) => {
                        let child = path_of(&entry.key);
                        match entry.operation {
                            // Session refreshes rewrite the same value.
                            Operation::Put => match known.insert(child.clone(), Some(entry.value.clone())) {
                                None => yield CoordEvent::ChildAdded(child),
                                Some(previous) if previous.as_ref() != Some(&entry.value) => {
                                    yield CoordEvent::ChildUpdated(child);
                                }
                                Some(_) => {}
                            },
                            Operation::Delete | Operation::Purge => {
                                if known.remove(&child).is_some() {
                                    yield CoordEvent::ChildRemoved(child);
                                }
                            }
                        }
                    }
                    WatchInput::Entry(Some(Err(e))) => warn!(error = %e, "Watch error"),
                    WatchInput::Entry(None) => {
                        warn!("Watch ended");
                        break;
                    }
                    WatchInput::Sweep => match children([&nodes, &sessions], &parent).await {
                        Ok(current) => {
                            let gone: Vec<String> = known
                                .keys()
                                .filter(|child| !current.contains(*child))
                                .cloned()
                                .collect();
                            for child in gone {
                                known.remove(&child);
                                yield CoordEvent::ChildRemoved(child);
                            }
                            for child in current {
                                if !known.contains_key(&child) {
                                    known.insert(child.clone(), None);
                                    yield CoordEvent::ChildAdded(child);
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    },
                    WatchInput::Reconnected => yield CoordEvent::Reconnected,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_key_mapping() {
        assert_eq!(key_of("/flowci-agents/42").unwrap(), "flowci-agents.42");
        assert_eq!(key_of("/flowci-agents").unwrap(), "flowci-agents");
        assert_eq!(path_of("flowci-agents.42-lock"), "/flowci-agents/42-lock");

        assert!(key_of("/").is_err());
        assert!(key_of("/a//b").is_err());
        assert!(key_of("/a/b.c").is_err());
    }

    #[test]
    fn test_child_keys() {
        assert!(is_child_key("root.a", "root"));
        assert!(!is_child_key("root.a.b", "root"));
        assert!(!is_child_key("rooted.a", "root"));
        assert!(!is_child_key("root", "root"));

        assert!(is_descendant_key("root.a.b", "root"));
        assert!(!is_descendant_key("rooted", "root"));
    }
}
