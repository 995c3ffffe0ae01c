use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use wasmxds_schema::NamespacedName;

/// Fetched binaries keyed by image location.
///
/// Entries are shared by every resource that declares the same location.
/// A resource holds every location it fetched or hit since its last
/// successful publish; [`acquire`](Self::acquire) narrows that down to the
/// published location. An entry is evicted only once no resource holds it.
///
/// Not synchronized. Owned by the [`EventHandler`](crate::EventHandler),
/// which is driven by a single writer.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: HashMap<String, Vec<u8>>,
    holders: HashMap<NamespacedName, HashSet<String>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, location: &str) -> Option<&[u8]> {
        self.entries.get(location).map(Vec::as_slice)
    }

    pub fn put(&mut self, location: &str, bytes: Vec<u8>) {
        self.entries.insert(location.to_owned(), bytes);
    }

    /// Return the cached bytes for `location`, calling `fetch` on a miss,
    /// and record that `holder` holds the entry.
    ///
    /// The flag is true when `fetch` ran. A failed fetch leaves the cache
    /// untouched.
    pub fn get_or_fetch<E>(
        &mut self,
        holder: &NamespacedName,
        location: &str,
        fetch: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<(&[u8], bool), E> {
        let (bytes, fetched) = match self.entries.entry(location.to_owned()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let bytes = fetch()?;
                (entry.insert(bytes), true)
            }
        };
        self.holders
            .entry(holder.clone())
            .or_default()
            .insert(location.to_owned());
        Ok((bytes.as_slice(), fetched))
    }

    /// Drop the entry for `location` regardless of holders.
    pub fn evict(&mut self, location: &str) -> bool {
        self.entries.remove(location).is_some()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries.contains_key(location)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of resources currently holding `location`.
    pub fn holders(&self, location: &str) -> usize {
        self.holders
            .values()
            .filter(|held| held.contains(location))
            .count()
    }

    /// Record that `holder` now depends on `location` alone.
    ///
    /// Every other location the holder held is released.
    pub fn acquire(&mut self, holder: &NamespacedName, location: &str) {
        let previous = self.holders.insert(
            holder.clone(),
            HashSet::from([location.to_owned()]),
        );
        for held in previous.into_iter().flatten() {
            if held != location {
                self.evict_if_unheld(&held);
            }
        }
    }

    /// Release every hold of `holder` and evict `location` and whatever the
    /// holder held if nothing else holds them. Returns whether any entry
    /// was evicted.
    pub fn release(&mut self, holder: &NamespacedName, location: &str) -> bool {
        let held = self.holders.remove(holder).unwrap_or_default();
        let mut evicted = self.evict_if_unheld(location);
        for held in held {
            if held != location {
                evicted |= self.evict_if_unheld(&held);
            }
        }
        evicted
    }

    fn evict_if_unheld(&mut self, location: &str) -> bool {
        if self.holders(location) > 0 {
            debug!("keeping cached image {location}: still referenced");
            return false;
        }
        let evicted = self.evict(location);
        if evicted {
            debug!("evicted cached image {location}");
        }
        evicted
    }
}
