//! Process-local fallback backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type Entries = HashMap<String, (String, Instant)>;
type NamedLocks = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

#[derive(Debug, Default)]
struct LocalState {
    entries: Mutex<Entries>,
    locks: Mutex<NamedLocks>,
}

/// In-process cache with expiry and a registry of named async mutexes.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    state: Arc<LocalState>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries()
            .insert(key.to_string(), (value.to_string(), expires_at));
    }

    pub fn delete(&self, key: &str) {
        self.entries().remove(key);
    }

    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Mutex shared by every holder of `name` in this process.
    pub fn named_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drop the registry entry for `name` once nobody else references it.
    pub fn forget_lock(&self, name: &str, handle: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks();
        // One reference for the registry, one for the caller's handle.
        if Arc::strong_count(handle) <= 2 {
            if let Some(existing) = locks.get(name) {
                if Arc::ptr_eq(existing, handle) {
                    locks.remove(name);
                }
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.state
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locks(&self) -> MutexGuard<'_, NamedLocks> {
        self.state
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_dropped() {
        let backend = LocalBackend::new();
        backend.set("k", "v", Duration::ZERO);
        assert!(backend.get("k").is_none());

        backend.set("k", "v", Duration::from_secs(30));
        assert_eq!(backend.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn named_locks_are_shared_and_forgotten() {
        let backend = LocalBackend::new();
        let a = backend.named_lock("user:1");
        let b = backend.named_lock("user:1");
        assert!(Arc::ptr_eq(&a, &b));

        drop(b);
        backend.forget_lock("user:1", &a);
        let c = backend.named_lock("user:1");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
