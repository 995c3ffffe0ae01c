use crate::converter::TypedExtensionConfig;
use crate::CoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Write side of the resource cache, as seen by the event handler.
pub trait ResourcePublisher: Send + Sync {
    /// Insert or replace the resource stored under `name`.
    fn publish(&self, name: &str, config: TypedExtensionConfig) -> Result<(), CoreError>;

    /// Remove `name`. Absent names are a no-op.
    fn retract(&self, name: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedResource {
    pub name: String,
    /// blake3 of the serialized resource.
    pub version: String,
    /// RFC 3339.
    pub published_at: String,
    pub resource: TypedExtensionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Published,
    Retracted,
}

/// Pushed to subscribers on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub version: u64,
    pub name: String,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub resources: Vec<PublishedResource>,
}

#[derive(Debug, Default)]
struct CacheState {
    version: u64,
    resources: BTreeMap<String, PublishedResource>,
}

/// Published resources shared between the single writer and any number of
/// concurrent readers.
///
/// Every change bumps a cache-wide version, wakes long-pollers blocked in
/// [`wait_for_change`](Self::wait_for_change) and pushes a [`CacheEvent`]
/// to live subscribers. Republishing identical content and retracting an
/// absent name change nothing.
#[derive(Debug, Default)]
pub struct ResourceCache {
    state: RwLock<CacheState>,
    /// Mirror of `state.version`, written under the state write lock.
    latest: Mutex<u64>,
    changed: Condvar,
    watchers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).version
    }

    pub fn get(&self, name: &str) -> Option<PublishedResource> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resources named in `names`, or all of them when `names` is empty.
    pub fn snapshot(&self, names: &[String]) -> Snapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let resources = if names.is_empty() {
            state.resources.values().cloned().collect()
        } else {
            names
                .iter()
                .filter_map(|n| state.resources.get(n).cloned())
                .collect()
        };
        Snapshot {
            version: state.version,
            resources,
        }
    }

    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = mpsc::channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Block until the version moves past `known` or `timeout` elapses.
    ///
    /// Returns the current version. Waiting registers nothing, so a poll
    /// that times out leaves no state behind.
    pub fn wait_for_change(&self, known: u64, timeout: Duration) -> u64 {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let (latest, _) = self
            .changed
            .wait_timeout_while(latest, timeout, |v| *v == known)
            .unwrap_or_else(PoisonError::into_inner);
        *latest
    }

    fn advance(&self, state: &mut CacheState) {
        state.version += 1;
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = state.version;
    }

    fn notify(&self, event: &CacheEvent) {
        self.changed.notify_all();
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "cache version {} ({} {:?}), {} subscriber(s)",
            event.version,
            event.name,
            event.change,
            watchers.len()
        );
    }
}

fn content_version(config: &TypedExtensionConfig) -> Result<String, CoreError> {
    let bytes = serde_json::to_vec(config)
        .map_err(|e| CoreError::ConversionFailed(format!("serialize {}: {e}", config.name)))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

impl ResourcePublisher for ResourceCache {
    fn publish(&self, name: &str, config: TypedExtensionConfig) -> Result<(), CoreError> {
        let version = content_version(&config)?;
        let event = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state
                .resources
                .get(name)
                .is_some_and(|existing| existing.version == version)
            {
                debug!("{name} unchanged; not bumping cache version");
                return Ok(());
            }
            self.advance(&mut state);
            state.resources.insert(
                name.to_owned(),
                PublishedResource {
                    name: name.to_owned(),
                    version,
                    published_at: chrono::Utc::now().to_rfc3339(),
                    resource: config,
                },
            );
            CacheEvent {
                version: state.version,
                name: name.to_owned(),
                change: ChangeKind::Published,
            }
        };
        self.notify(&event);
        Ok(())
    }

    fn retract(&self, name: &str) {
        let event = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.resources.remove(name).is_none() {
                return;
            }
            self.advance(&mut state);
            CacheEvent {
                version: state.version,
                name: name.to_owned(),
                change: ChangeKind::Retracted,
            }
        };
        self.notify(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{Any, StringValue, STRING_VALUE_TYPE_URL};
    use std::sync::Arc;
    use std::time::Instant;

    fn config(name: &str, value: &str) -> TypedExtensionConfig {
        TypedExtensionConfig {
            name: name.to_owned(),
            typed_config: Any::pack(
                STRING_VALUE_TYPE_URL,
                &StringValue {
                    value: value.to_owned(),
                },
            )
            .unwrap(),
        }
    }

    #[test]
    fn publish_and_retract_bump_version() {
        let cache = ResourceCache::new();
        assert_eq!(cache.version(), 0);
        cache.publish("ns/foo", config("ns/foo", "a")).unwrap();
        assert_eq!(cache.version(), 1);
        assert_eq!(cache.get("ns/foo").unwrap().resource.name, "ns/foo");
        cache.retract("ns/foo");
        assert_eq!(cache.version(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn identical_publish_is_noop() {
        let cache = ResourceCache::new();
        cache.publish("ns/foo", config("ns/foo", "a")).unwrap();
        let first = cache.get("ns/foo").unwrap();
        cache.publish("ns/foo", config("ns/foo", "a")).unwrap();
        assert_eq!(cache.version(), 1);
        assert_eq!(cache.get("ns/foo").unwrap(), first);

        cache.publish("ns/foo", config("ns/foo", "b")).unwrap();
        assert_eq!(cache.version(), 2);
        assert_ne!(cache.get("ns/foo").unwrap().version, first.version);
    }

    #[test]
    fn retract_absent_is_noop() {
        let cache = ResourceCache::new();
        let events = cache.subscribe();
        cache.retract("ns/missing");
        assert_eq!(cache.version(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn subscribers_receive_pushes() {
        let cache = ResourceCache::new();
        let events = cache.subscribe();
        cache.publish("ns/foo", config("ns/foo", "a")).unwrap();
        cache.retract("ns/foo");
        assert_eq!(
            events.recv().unwrap(),
            CacheEvent {
                version: 1,
                name: "ns/foo".to_owned(),
                change: ChangeKind::Published,
            }
        );
        assert_eq!(events.recv().unwrap().change, ChangeKind::Retracted);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let cache = ResourceCache::new();
        drop(cache.subscribe());
        let live = cache.subscribe();
        cache.publish("ns/a", config("ns/a", "x")).unwrap();
        assert_eq!(cache.watchers.lock().unwrap().len(), 1);
        assert_eq!(live.recv().unwrap().version, 1);
    }

    #[test]
    fn snapshot_filters_by_name() {
        let cache = ResourceCache::new();
        cache.publish("ns/a", config("ns/a", "x")).unwrap();
        cache.publish("ns/b", config("ns/b", "y")).unwrap();

        let all = cache.snapshot(&[]);
        assert_eq!(all.version, 2);
        assert_eq!(all.resources.len(), 2);

        let some = cache.snapshot(&["ns/b".to_owned(), "ns/zzz".to_owned()]);
        assert_eq!(some.resources.len(), 1);
        assert_eq!(some.resources[0].name, "ns/b");
    }

    #[test]
    fn wait_for_change_times_out_without_writes() {
        let cache = ResourceCache::new();
        let start = Instant::now();
        assert_eq!(cache.wait_for_change(0, Duration::from_millis(50)), 0);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_for_change_wakes_on_publish() {
        let cache = Arc::new(ResourceCache::new());
        let writer = Arc::clone(&cache);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.publish("ns/a", config("ns/a", "x")).unwrap();
        });
        assert_eq!(cache.wait_for_change(0, Duration::from_secs(10)), 1);
        handle.join().unwrap();
    }

    #[test]
    fn timed_out_waits_leave_no_subscribers() {
        let cache = ResourceCache::new();
        for _ in 0..1000 {
            assert_eq!(cache.wait_for_change(0, Duration::ZERO), 0);
        }
        assert!(cache.watchers.lock().unwrap().is_empty());

        cache.publish("ns/a", config("ns/a", "x")).unwrap();
        assert_eq!(cache.wait_for_change(0, Duration::ZERO), 1);
        assert!(cache.watchers.lock().unwrap().is_empty());
    }

    #[test]
    fn wait_for_change_wakes_every_waiter() {
        let cache = Arc::new(ResourceCache::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.wait_for_change(0, Duration::from_secs(10)))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        cache.publish("ns/a", config("ns/a", "x")).unwrap();
        for w in waiters {
            assert_eq!(w.join().unwrap(), 1);
        }
    }

    #[test]
    fn concurrent_readers_see_consistent_snapshots() {
        let cache = Arc::new(ResourceCache::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snap = cache.snapshot(&[]);
                        assert!(snap.resources.len() <= 1);
                    }
                })
            })
            .collect();
        for i in 0..50 {
            cache
                .publish("ns/a", config("ns/a", &i.to_string()))
                .unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cache.version(), 50);
    }
}
