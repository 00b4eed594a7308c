//! Tree-shaped coordination store with locks and child watches.

use async_trait::async_trait;
use flowci_core::ports::{CoordEvent, CoordEventStream, Coordinator, CreateMode, LockToken};
use flowci_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ZNode {
    data: Vec<u8>,
    mode: CreateMode,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, ZNode>,
    locks: HashMap<String, String>,
}

/// In-process coordinator.
///
/// Ephemeral nodes live until [`MemoryCoordinator::expire_session`] is called,
/// which stands in for a lost client session.
#[derive(Clone)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
    lock_released: Arc<Notify>,
    events: broadcast::Sender<(String, CoordEvent)>,
    failing: Arc<AtomicBool>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            lock_released: Arc::new(Notify::new()),
            events,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Drop every ephemeral node, as if the session had expired.
    pub fn expire_session(&self) {
        let removed: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let ephemeral: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.mode == CreateMode::Ephemeral)
                .map(|(p, _)| p.clone())
                .collect();
            for path in &ephemeral {
                state.nodes.remove(path);
            }
            ephemeral
        };

        for path in removed {
            self.emit(&path, CoordEvent::ChildRemoved(path.clone()));
        }
    }

    /// Notify watchers that the session was re-established.
    pub fn reconnect(&self) {
        let _ = self
            .events
            .send((String::new(), CoordEvent::Reconnected));
    }

    /// Make writes fail until called again with `false`.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether a lock is currently held on `path`.
    pub fn is_locked(&self, path: &str) -> bool {
        self.state.lock().unwrap().locks.contains_key(path)
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Coordination("connection lost".to_string()));
        }
        Ok(())
    }

    fn emit(&self, path: &str, event: CoordEvent) {
        if let Some(parent) = parent_of(path) {
            let _ = self.events.send((parent.to_string(), event));
        }
    }

    fn try_lock(&self, path: &str, owner: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.locks.contains_key(path) {
            return false;
        }
        state.locks.insert(path.to_string(), owner.to_string());
        true
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn is_child_of(path: &str, parent: &str) -> bool {
    path.strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some()
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, mode: CreateMode, path: &str, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.lock().unwrap();
            if state.nodes.contains_key(path) {
                return Err(Error::Coordination(format!("node {} already exists", path)));
            }
            state.nodes.insert(
                path.to_string(),
                ZNode {
                    data: data.to_vec(),
                    mode,
                },
            );
        }
        debug!(path, ?mode, "Node created");
        self.emit(path, CoordEvent::ChildAdded(path.to_string()));
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.lock().unwrap();
            let node = state
                .nodes
                .get_mut(path)
                .ok_or_else(|| Error::Coordination(format!("node {} not found", path)))?;
            node.data = data.to_vec();
        }
        self.emit(path, CoordEvent::ChildUpdated(path.to_string()));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_writable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .get(path)
            .map(|n| n.data.clone()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.state.lock().unwrap().nodes.contains_key(path))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.check_writable()?;
        let removed: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let children: Vec<String> = state
                .nodes
                .keys()
                .filter(|p| is_child_of(p, path))
                .cloned()
                .collect();

            if !children.is_empty() && !recursive {
                return Err(Error::Coordination(format!("node {} has children", path)));
            }

            let mut removed = Vec::new();
            for child in children {
                state.nodes.remove(&child);
                removed.push(child);
            }
            if state.nodes.remove(path).is_some() {
                removed.push(path.to_string());
            }
            removed
        };

        for p in removed {
            self.emit(&p, CoordEvent::ChildRemoved(p.clone()));
        }
        Ok(())
    }

    async fn acquire(&self, path: &str, wait: Duration) -> Result<Option<LockToken>> {
        self.check_writable()?;
        let owner = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let released = self.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_lock(path, &owner) {
                return Ok(Some(LockToken {
                    path: path.to_string(),
                    owner,
                }));
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                debug!(path, "Lock wait timed out");
                return Ok(None);
            }
        }
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match state.locks.get(&token.path) {
                Some(owner) if *owner == token.owner => {
                    state.locks.remove(&token.path);
                }
                _ => {
                    return Err(Error::Coordination(format!(
                        "lock {} not held by {}",
                        token.path, token.owner
                    )));
                }
            }
        }
        self.lock_released.notify_waiters();
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> Result<CoordEventStream> {
        let mut receiver = self.events.subscribe();
        let parent = path.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok((p, CoordEvent::Reconnected)) if p.is_empty() => {
                        yield CoordEvent::Reconnected;
                    }
                    Ok((p, event)) if p == parent => yield event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        yield CoordEvent::Reconnected;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
