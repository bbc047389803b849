//! Change notification for the virtual filesystem.
//!
//! Two independent channels are fed from every mutation:
//! - per-path watchers (`fs.watch` style), keyed by the watched path and
//!   matched against the mutated path and its ancestors;
//! - coarse change/delete events for mirroring the tree into another
//!   execution context.
//!
//! Callbacks are invoked after the tree lock has been released, so a
//! callback may freely call back into the filesystem.

use super::path;
use super::FileKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Kind of a per-path watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// An entry appeared or disappeared.
    Rename,
    /// An existing entry's content changed.
    Change,
}

/// A per-path watch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Path relative to the watched path (the basename when watching a file).
    pub filename: String,
}

/// Coarse event for mirroring state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfsEvent {
    Changed { path: String, kind: FileKind },
    Deleted { path: String },
}

impl VfsEvent {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Changed { path, .. } | Self::Deleted { path } => path,
        }
    }
}

/// A single tree mutation, produced under the lock and dispatched after.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub path: String,
    pub watch_kind: WatchEventKind,
    pub event: VfsEvent,
}

impl Mutation {
    pub fn created(path: String, kind: FileKind) -> Self {
        Self {
            event: VfsEvent::Changed {
                path: path.clone(),
                kind,
            },
            path,
            watch_kind: WatchEventKind::Rename,
        }
    }

    pub fn modified(path: String, kind: FileKind) -> Self {
        Self {
            event: VfsEvent::Changed {
                path: path.clone(),
                kind,
            },
            path,
            watch_kind: WatchEventKind::Change,
        }
    }

    pub fn removed(path: String) -> Self {
        Self {
            event: VfsEvent::Deleted { path: path.clone() },
            path,
            watch_kind: WatchEventKind::Rename,
        }
    }
}

pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;
pub type EventListener = Arc<dyn Fn(&VfsEvent) + Send + Sync>;

struct Watcher {
    id: u64,
    recursive: bool,
    callback: WatchCallback,
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<String, Vec<Watcher>>>,
    listeners: Mutex<Vec<(u64, EventListener)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatchRegistry {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_watcher(&self, watched: String, recursive: bool, callback: WatchCallback) -> u64 {
        let id = self.next_id();
        lock(&self.watchers).entry(watched).or_default().push(Watcher {
            id,
            recursive,
            callback,
        });
        id
    }

    fn remove_watcher(&self, watched: &str, id: u64) {
        let mut watchers = lock(&self.watchers);
        if let Some(list) = watchers.get_mut(watched) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                watchers.remove(watched);
            }
        }
    }

    pub fn add_listener(&self, listener: EventListener) -> u64 {
        let id = self.next_id();
        lock(&self.listeners).push((id, listener));
        id
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.listeners).retain(|(lid, _)| *lid != id);
    }

    pub fn watcher_count(&self) -> usize {
        lock(&self.watchers).values().map(Vec::len).sum()
    }

    /// Collect the callbacks interested in a mutated path.
    fn matching(&self, mutated: &str) -> Vec<(WatchCallback, String)> {
        let watchers = lock(&self.watchers);
        let mut out = Vec::new();

        if let Some(list) = watchers.get(mutated) {
            let filename = path::basename(mutated);
            for w in list {
                out.push((Arc::clone(&w.callback), filename.clone()));
            }
        }

        let mut ancestor = path::dirname(mutated);
        loop {
            if let Some(list) = watchers.get(&ancestor) {
                if let Some(rel) = path::strip_ancestor(mutated, &ancestor) {
                    let direct_child = !rel.contains('/');
                    for w in list.iter().filter(|w| w.recursive || direct_child) {
                        out.push((Arc::clone(&w.callback), rel.to_string()));
                    }
                }
            }
            if ancestor == "/" {
                break;
            }
            ancestor = path::dirname(&ancestor);
        }

        out
    }

    pub fn dispatch(&self, mutations: &[Mutation]) {
        for mutation in mutations {
            for (callback, filename) in self.matching(&mutation.path) {
                callback(&WatchEvent {
                    kind: mutation.watch_kind,
                    filename,
                });
            }

            let listeners: Vec<EventListener> = lock(&self.listeners)
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in listeners {
                listener(&mutation.event);
            }
        }
    }
}

/// Registration of a per-path watcher. Dropping it stops the watcher.
#[must_use = "dropping a WatchHandle unregisters the watcher"]
pub struct WatchHandle {
    pub(crate) registry: Weak<WatchRegistry>,
    pub(crate) path: String,
    pub(crate) id: u64,
}

impl WatchHandle {
    /// The watched (normalized) path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_watcher(&self.path, self.id);
        }
    }
}

/// Registration of a coarse event listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    pub(crate) registry: Weak<WatchRegistry>,
    pub(crate) id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_listener(self.id);
        }
    }
}
