//! Coordination adapter: a distributed lock/watch store with ephemeral,
//! session-scoped nodes.
//!
//! The master, tablet servers, and clients only ever see the `Coordination`
//! trait; which backend sits behind it is a deployment choice:
//! - `MemoryCoordination` — one shared in-process registry, each component
//!   holding its own session handle (tests and the embedded cluster).
//! - `FileCoordination` — a directory tree with poll-driven watches, usable
//!   across restarts of a single-machine deployment.
//!
//! Semantics follow the usual lock-service contract: ephemeral nodes vanish
//! when their session ends, watches fire on create/change/delete, and a lost
//! session is fatal for the component that held it (no in-place re-join).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

/// Master election node; holder is the acting master.
pub const MASTER_LOCK_PATH: &str = "/master-lock";
/// Parent of per-server ephemeral registrations.
pub const TS_LIST_PATH: &str = "/ts";
/// Parent of kick marks; creating `/kick/<node>` evicts that server.
pub const KICK_PATH: &str = "/kick";
/// Present iff the cluster is in safe mode.
pub const SAFEMODE_PATH: &str = "/safemode";
/// Value is the address currently serving the root (meta) tablet.
pub const ROOT_TABLET_PATH: &str = "/root-tablet-addr";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Changed,
    Deleted,
    SessionLost,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Watch delivery channel. Subscriptions persist until the receiver drops.
pub type Watcher = mpsc::UnboundedSender<WatchEvent>;

/// One session over a coordination store.
pub trait Coordination: Send + Sync {
    /// Create a node; fails if it already exists.
    fn create_node(&self, path: &str, value: &[u8], ephemeral: bool) -> anyhow::Result<()>;
    /// Create an ephemeral node with a store-assigned sequence suffix;
    /// returns the actual path.
    fn create_sequential_ephemeral(&self, prefix: &str, value: &[u8]) -> anyhow::Result<String>;
    /// Create-or-overwrite a persistent node.
    fn set_node(&self, path: &str, value: &[u8]) -> anyhow::Result<()>;
    fn read_node(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;
    /// Delete a node; missing nodes are not an error.
    fn delete_node(&self, path: &str) -> anyhow::Result<()>;
    /// Direct children of `path` as (node name, value).
    fn list_children(&self, path: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
    /// Atomically check existence and subscribe to future events on `path`.
    fn check_and_watch_exist(&self, path: &str, watcher: Watcher) -> anyhow::Result<bool>;
    /// Atomically read and subscribe to future events on `path`.
    fn read_and_watch(&self, path: &str, watcher: Watcher) -> anyhow::Result<Option<Vec<u8>>>;
    fn session_id(&self) -> String;
    /// Subscribe to session loss; a `SessionLost` event means this handle's
    /// ephemerals are gone and the owner must stop serving.
    fn watch_session(&self, watcher: Watcher);
}

struct NodeEntry {
    value: Vec<u8>,
    /// Session number owning this ephemeral, if any.
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct Registry {
    nodes: BTreeMap<String, NodeEntry>,
    node_watchers: HashMap<String, Vec<Watcher>>,
    session_watchers: HashMap<u64, Vec<Watcher>>,
    next_seq: u64,
}

impl Registry {
    fn notify(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(watchers) = self.node_watchers.get_mut(path) {
            watchers.retain(|w| {
                w.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                })
                .is_ok()
            });
            if watchers.is_empty() {
                self.node_watchers.remove(path);
            }
        }
    }

    fn drop_session(&mut self, session: u64) {
        let dead: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in dead {
            self.nodes.remove(&path);
            self.notify(&path, WatchEventKind::Deleted);
        }
        if let Some(watchers) = self.session_watchers.remove(&session) {
            for watcher in watchers {
                let _ = watcher.send(WatchEvent {
                    path: String::new(),
                    kind: WatchEventKind::SessionLost,
                });
            }
        }
    }
}

/// Shared in-process coordination store.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Registry>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session over this registry.
    pub fn session(&self) -> MemoryCoordination {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        MemoryCoordination {
            registry: self.clone(),
            session,
            alive: Arc::new(Mutex::new(true)),
        }
    }

    /// Forcibly expire a session, as if the store timed it out.
    pub fn expire_session(&self, session: u64) {
        self.inner.lock().unwrap().drop_session(session);
    }
}

/// One session over a `MemoryRegistry`.
pub struct MemoryCoordination {
    registry: MemoryRegistry,
    session: u64,
    alive: Arc<Mutex<bool>>,
}

impl MemoryCoordination {
    pub fn session_num(&self) -> u64 {
        self.session
    }
}

impl Drop for MemoryCoordination {
    fn drop(&mut self) {
        let mut alive = self.alive.lock().unwrap();
        if *alive {
            *alive = false;
            self.registry.inner.lock().unwrap().drop_session(self.session);
        }
    }
}

impl Coordination for MemoryCoordination {
    fn create_node(&self, path: &str, value: &[u8], ephemeral: bool) -> anyhow::Result<()> {
        let mut reg = self.registry.inner.lock().unwrap();
        if reg.nodes.contains_key(path) {
            anyhow::bail!("node already exists: {path}");
        }
        reg.nodes.insert(
            path.to_string(),
            NodeEntry {
                value: value.to_vec(),
                ephemeral_owner: ephemeral.then_some(self.session),
            },
        );
        reg.notify(path, WatchEventKind::Created);
        Ok(())
    }

    fn create_sequential_ephemeral(&self, prefix: &str, value: &[u8]) -> anyhow::Result<String> {
        let mut reg = self.registry.inner.lock().unwrap();
        reg.next_seq += 1;
        let path = format!("{prefix}{:010}", reg.next_seq);
        reg.nodes.insert(
            path.clone(),
            NodeEntry {
                value: value.to_vec(),
                ephemeral_owner: Some(self.session),
            },
        );
        reg.notify(&path, WatchEventKind::Created);
        Ok(path)
    }

    fn set_node(&self, path: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut reg = self.registry.inner.lock().unwrap();
        let kind = if reg.nodes.contains_key(path) {
            WatchEventKind::Changed
        } else {
            WatchEventKind::Created
        };
        reg.nodes.insert(
            path.to_string(),
            NodeEntry {
                value: value.to_vec(),
                ephemeral_owner: None,
            },
        );
        reg.notify(path, kind);
        Ok(())
    }

    fn read_node(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let reg = self.registry.inner.lock().unwrap();
        Ok(reg.nodes.get(path).map(|entry| entry.value.clone()))
    }

    fn delete_node(&self, path: &str) -> anyhow::Result<()> {
        let mut reg = self.registry.inner.lock().unwrap();
        if reg.nodes.remove(path).is_some() {
            reg.notify(path, WatchEventKind::Deleted);
        }
        Ok(())
    }

    fn list_children(&self, path: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let reg = self.registry.inner.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut out = Vec::new();
        for (node_path, entry) in reg.nodes.range(prefix.clone()..) {
            let Some(rest) = node_path.strip_prefix(&prefix) else {
                break;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            out.push((rest.to_string(), entry.value.clone()));
        }
        Ok(out)
    }

    fn check_and_watch_exist(&self, path: &str, watcher: Watcher) -> anyhow::Result<bool> {
        let mut reg = self.registry.inner.lock().unwrap();
        let exists = reg.nodes.contains_key(path);
        reg.node_watchers
            .entry(path.to_string())
            .or_default()
            .push(watcher);
        Ok(exists)
    }

    fn read_and_watch(&self, path: &str, watcher: Watcher) -> anyhow::Result<Option<Vec<u8>>> {
        let mut reg = self.registry.inner.lock().unwrap();
        let value = reg.nodes.get(path).map(|entry| entry.value.clone());
        reg.node_watchers
            .entry(path.to_string())
            .or_default()
            .push(watcher);
        Ok(value)
    }

    fn session_id(&self) -> String {
        format!("{:016x}", self.session)
    }

    fn watch_session(&self, watcher: Watcher) {
        let mut reg = self.registry.inner.lock().unwrap();
        reg.session_watchers
            .entry(self.session)
            .or_default()
            .push(watcher);
    }
}

/// Directory-tree coordination backend with poll-driven watches.
///
/// Node `/a/b` maps to `<base>/a/b` on disk; values are file contents.
/// Ephemerals are reaped when the handle drops. Watch latency is bounded by
/// the poll interval.
pub struct FileCoordination {
    base: PathBuf,
    session: u64,
    ephemerals: Mutex<Vec<PathBuf>>,
    watches: Arc<Mutex<Vec<FileWatch>>>,
}

struct FileWatch {
    path: String,
    fs_path: PathBuf,
    last: Option<Vec<u8>>,
    watcher: Watcher,
}

impl FileCoordination {
    pub fn open(base: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let base = base.into();
        std::fs::create_dir_all(&base).context("create coordination dir")?;
        let session = rand::random::<u64>();
        let this = Arc::new(Self {
            base,
            session,
            ephemerals: Mutex::new(Vec::new()),
            watches: Arc::new(Mutex::new(Vec::new())),
        });
        this.spawn_poller();
        Ok(this)
    }

    fn fs_path(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }

    fn spawn_poller(self: &Arc<Self>) {
        let watches = self.watches.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(50));
            loop {
                ticker.tick().await;
                let mut guard = watches.lock().unwrap();
                guard.retain_mut(|watch| {
                    let current = std::fs::read(&watch.fs_path).ok();
                    let event = match (&watch.last, &current) {
                        (None, Some(_)) => Some(WatchEventKind::Created),
                        (Some(_), None) => Some(WatchEventKind::Deleted),
                        (Some(old), Some(new)) if old != new => Some(WatchEventKind::Changed),
                        _ => None,
                    };
                    watch.last = current;
                    match event {
                        Some(kind) => watch
                            .watcher
                            .send(WatchEvent {
                                path: watch.path.clone(),
                                kind,
                            })
                            .is_ok(),
                        None => !watch.watcher.is_closed(),
                    }
                });
            }
        });
    }

    fn register_watch(&self, path: &str, watcher: Watcher) {
        let fs_path = self.fs_path(path);
        let last = std::fs::read(&fs_path).ok();
        self.watches.lock().unwrap().push(FileWatch {
            path: path.to_string(),
            fs_path,
            last,
            watcher,
        });
    }

    fn write_file(&self, path: &str, value: &[u8]) -> anyhow::Result<()> {
        let fs_path = self.fs_path(path);
        if let Some(parent) = fs_path.parent() {
            std::fs::create_dir_all(parent).context("create node parent dir")?;
        }
        std::fs::write(&fs_path, value).with_context(|| format!("write node {path}"))
    }
}

impl Drop for FileCoordination {
    fn drop(&mut self) {
        for path in self.ephemerals.lock().unwrap().drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Coordination for FileCoordination {
    fn create_node(&self, path: &str, value: &[u8], ephemeral: bool) -> anyhow::Result<()> {
        let fs_path = self.fs_path(path);
        if fs_path.exists() {
            anyhow::bail!("node already exists: {path}");
        }
        self.write_file(path, value)?;
        if ephemeral {
            self.ephemerals.lock().unwrap().push(fs_path);
        }
        Ok(())
    }

    fn create_sequential_ephemeral(&self, prefix: &str, value: &[u8]) -> anyhow::Result<String> {
        for _ in 0..1024 {
            let seq = rand::random::<u32>();
            let path = format!("{prefix}{seq:010}");
            let fs_path = self.fs_path(&path);
            if fs_path.exists() {
                continue;
            }
            self.write_file(&path, value)?;
            self.ephemerals.lock().unwrap().push(fs_path);
            return Ok(path);
        }
        anyhow::bail!("could not allocate sequential node under {prefix}")
    }

    fn set_node(&self, path: &str, value: &[u8]) -> anyhow::Result<()> {
        self.write_file(path, value)
    }

    fn read_node(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match std::fs::read(self.fs_path(path)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read node {path}")),
        }
    }

    fn delete_node(&self, path: &str) -> anyhow::Result<()> {
        match std::fs::remove_file(self.fs_path(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete node {path}")),
        }
    }

    fn list_children(&self, path: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let dir = self.fs_path(path);
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err).with_context(|| format!("list children of {path}")),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name().to_string_lossy().to_string();
                let value = std::fs::read(entry.path())?;
                out.push((name, value));
            }
        }
        out.sort();
        Ok(out)
    }

    fn check_and_watch_exist(&self, path: &str, watcher: Watcher) -> anyhow::Result<bool> {
        let exists = self.fs_path(path).exists();
        self.register_watch(path, watcher);
        Ok(exists)
    }

    fn read_and_watch(&self, path: &str, watcher: Watcher) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self.read_node(path)?;
        self.register_watch(path, watcher);
        Ok(value)
    }

    fn session_id(&self) -> String {
        format!("{:016x}", self.session)
    }

    fn watch_session(&self, _watcher: Watcher) {
        // The file backend has no external session authority; sessions end
        // only when the handle drops, so there is nothing to deliver.
    }
}

/// Kick-mark path for a server registration node name.
pub fn kick_path_for(node_name: &str) -> String {
    format!("{KICK_PATH}/{node_name}")
}

/// Registration node prefix for a server session: `/ts/<session>#`.
pub fn ts_node_prefix(session_id: &str) -> String {
    format!("{TS_LIST_PATH}/{session_id}#")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_nodes_die_with_session() {
        let registry = MemoryRegistry::new();
        let observer = registry.session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let path;
        {
            let session = registry.session();
            path = session
                .create_sequential_ephemeral(&ts_node_prefix(&session.session_id()), b"ts1:7777")
                .unwrap();
            assert!(observer.check_and_watch_exist(&path, tx).unwrap());
        }

        // Session dropped: node gone, watcher told.
        assert_eq!(observer.read_node(&path).unwrap(), None);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, WatchEventKind::Deleted);
        assert_eq!(event.path, path);
    }

    #[test]
    fn master_lock_is_exclusive() {
        let registry = MemoryRegistry::new();
        let a = registry.session();
        let b = registry.session();
        a.create_node(MASTER_LOCK_PATH, b"master-a", true).unwrap();
        assert!(b.create_node(MASTER_LOCK_PATH, b"master-b", true).is_err());
        drop(a);
        b.create_node(MASTER_LOCK_PATH, b"master-b", true).unwrap();
        assert_eq!(
            b.read_node(MASTER_LOCK_PATH).unwrap(),
            Some(b"master-b".to_vec())
        );
    }

    #[test]
    fn read_and_watch_sees_changes() {
        let registry = MemoryRegistry::new();
        let session = registry.session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(session.read_and_watch(ROOT_TABLET_PATH, tx).unwrap(), None);

        session.set_node(ROOT_TABLET_PATH, b"ts0:7777").unwrap();
        session.set_node(ROOT_TABLET_PATH, b"ts1:7777").unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, WatchEventKind::Created);
        assert_eq!(rx.try_recv().unwrap().kind, WatchEventKind::Changed);
        assert_eq!(
            session.read_node(ROOT_TABLET_PATH).unwrap(),
            Some(b"ts1:7777".to_vec())
        );
    }

    #[test]
    fn expired_session_notifies_and_reaps() {
        let registry = MemoryRegistry::new();
        let session = registry.session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.watch_session(tx);
        session
            .create_node("/ts/self", b"addr", true)
            .unwrap();

        registry.expire_session(session.session_num());
        assert_eq!(rx.try_recv().unwrap().kind, WatchEventKind::SessionLost);
        assert_eq!(session.read_node("/ts/self").unwrap(), None);
    }

    #[tokio::test]
    async fn file_backend_polls_watches() {
        let dir = tempfile::tempdir().unwrap();
        let session = FileCoordination::open(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!session.check_and_watch_exist(SAFEMODE_PATH, tx).unwrap());

        session.create_node(SAFEMODE_PATH, b"on", false).unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("watch timed out")
            .expect("watch channel closed");
        assert_eq!(event.kind, WatchEventKind::Created);
        assert_eq!(event.path, SAFEMODE_PATH);

        session.delete_node(SAFEMODE_PATH).unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("watch timed out")
            .expect("watch channel closed");
        assert_eq!(event.kind, WatchEventKind::Deleted);

        // Values survive a fresh handle over the same directory.
        session.set_node(ROOT_TABLET_PATH, b"ts1:7777").unwrap();
        drop(session);
        let reopened = FileCoordination::open(dir.path()).unwrap();
        assert_eq!(
            reopened.read_node(ROOT_TABLET_PATH).unwrap(),
            Some(b"ts1:7777".to_vec())
        );
    }

    #[test]
    fn list_children_is_direct_only() {
        let registry = MemoryRegistry::new();
        let session = registry.session();
        session.set_node("/ts/a", b"1").unwrap();
        session.set_node("/ts/b", b"2").unwrap();
        session.set_node("/other", b"3").unwrap();
        let children = session.list_children(TS_LIST_PATH).unwrap();
        let names: Vec<&str> = children.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
