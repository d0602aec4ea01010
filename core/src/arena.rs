//! Dense arena addressed by typed integer handles.
//!
//! Handles are plain `u64` values wrapped in [`Handle<T>`]. Slot `i` of the
//! arena is addressed by handle `i + 1`, which keeps raw value `0` free as the
//! [`Handle::INVALID`] sentinel. Handles are handed out in strictly increasing
//! order and slots are never reused, so a released handle can never alias a
//! newer resource.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed handle into an [`Arena<T>`].
pub struct Handle<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The reserved sentinel. Never resolves to a value.
    pub const INVALID: Self = Self::from_raw(0);

    /// Wrap a raw handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// The raw integer value.
    pub const fn raw(self) -> u64 {
        self.raw
    }

    pub const fn is_valid(self) -> bool {
        self.raw != 0
    }

    fn index(self) -> Option<usize> {
        self.raw.checked_sub(1).map(|i| i as usize)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.raw)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.raw)
    }
}

struct Entry<T> {
    name: String,
    value: T,
}

/// Append-only storage of named values.
pub struct Arena<T> {
    entries: Vec<Option<Entry<T>>>,
    names: HashMap<String, Handle<T>>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            names: HashMap::new(),
            live: 0,
        }
    }

    /// Insert a value and return its fresh handle.
    ///
    /// If `name` is already registered, name lookups resolve to the new value.
    pub fn insert(&mut self, name: impl Into<String>, value: T) -> Handle<T> {
        let name = name.into();
        let handle = Handle::from_raw(self.entries.len() as u64 + 1);

        if let Some(previous) = self.names.insert(name.clone(), handle) {
            log::debug!("Arena name '{}' rebound from {} to {}", name, previous, handle);
        }

        self.entries.push(Some(Entry { name, value }));
        self.live += 1;
        handle
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let index = handle.index()?;
        self.entries
            .get(index)
            .and_then(|entry| entry.as_ref())
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let index = handle.index()?;
        self.entries
            .get_mut(index)
            .and_then(|entry| entry.as_mut())
            .map(|entry| &mut entry.value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove a value. Its handle is retired and never handed out again.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let index = handle.index()?;
        let entry = self.entries.get_mut(index)?.take()?;

        if self.names.get(&entry.name) == Some(&handle) {
            self.names.remove(&entry.name);
        }

        self.live -= 1;
        Some(entry.value)
    }

    /// Look up the most recent live value registered under `name`.
    pub fn find(&self, name: &str) -> Option<Handle<T>> {
        self.names.get(name).copied()
    }

    pub fn name(&self, handle: Handle<T>) -> Option<&str> {
        let index = handle.index()?;
        self.entries
            .get(index)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.name.as_str())
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate live values in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, entry)| {
            entry
                .as_ref()
                .map(|entry| (Handle::from_raw(i as u64 + 1), &entry.value))
        })
    }

    /// Remove every live value, returning them in handle order.
    pub fn drain(&mut self) -> Vec<(Handle<T>, T)> {
        self.names.clear();
        self.live = 0;
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, entry)| {
                entry
                    .take()
                    .map(|entry| (Handle::from_raw(i as u64 + 1), entry.value))
            })
            .collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("live", &self.live)
            .field("issued", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_never_resolves() {
        let mut arena = Arena::new();
        arena.insert("a", 1);
        assert!(!Handle::<i32>::INVALID.is_valid());
        assert_eq!(arena.get(Handle::INVALID), None);
        assert_eq!(Handle::<i32>::default(), Handle::INVALID);
    }

    #[test]
    fn test_handles_strictly_increase() {
        let mut arena = Arena::new();
        let a = arena.insert("a", 'a');
        let b = arena.insert("b", 'b');
        arena.remove(a);
        let c = arena.insert("c", 'c');

        assert!(a < b && b < c);
        assert_eq!(a.raw(), 1);
        assert_eq!(c.raw(), 3);
    }

    #[test]
    fn test_removed_handle_is_not_reused() {
        let mut arena = Arena::new();
        let a = arena.insert("a", 10);
        assert_eq!(arena.remove(a), Some(10));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(a), None);

        let b = arena.insert("b", 20);
        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&20));
    }

    #[test]
    fn test_lookup_by_name() {
        let mut arena = Arena::new();
        let first = arena.insert("mesh", 1);
        assert_eq!(arena.find("mesh"), Some(first));
        assert_eq!(arena.name(first), Some("mesh"));

        let second = arena.insert("mesh", 2);
        assert_eq!(arena.find("mesh"), Some(second));

        // Removing the older entry keeps the newer binding.
        arena.remove(first);
        assert_eq!(arena.find("mesh"), Some(second));

        arena.remove(second);
        assert_eq!(arena.find("mesh"), None);
    }

    #[test]
    fn test_len_and_iter() {
        let mut arena = Arena::new();
        let a = arena.insert("a", 1);
        let b = arena.insert("b", 2);
        let c = arena.insert("c", 3);
        arena.remove(b);

        assert_eq!(arena.len(), 2);
        let items: Vec<_> = arena.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(items, vec![(a, 1), (c, 3)]);

        let drained = arena.drain();
        assert_eq!(drained.len(), 2);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_get_mut() {
        let mut arena = Arena::new();
        let a = arena.insert("a", 1);
        *arena.get_mut(a).unwrap() += 41;
        assert_eq!(arena.get(a), Some(&42));
    }
}
