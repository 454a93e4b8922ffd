//! Bounded arena of live instances addressed by generational handles.
//!
//! A [`Handle`] is an opaque `(index, generation)` pair. Removing an entry
//! bumps the slot's generation, so handles to a removed instance are
//! rejected even after the slot is reused.

use ecrt_common::error::{RtError, RtResult};
use std::fmt;

/// Opaque reference to a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena owning up to `capacity` instances.
#[derive(Debug)]
pub struct Registry<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
}

impl<T> Registry<T> {
    /// Create an empty registry holding at most `capacity` instances.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// Store `value` and return its handle.
    ///
    /// # Errors
    ///
    /// [`RtError::RegistryFull`] if `capacity` instances are live.
    pub fn insert(&mut self, value: T) -> RtResult<Handle> {
        if self.len >= self.capacity {
            return Err(RtError::RegistryFull {
                capacity: self.capacity,
            });
        }

        let index = if let Some(index) = self.free.pop() {
            self.entries[index as usize].value = Some(value);
            index
        } else {
            // len < capacity <= u32::MAX, so the new index fits
            let index = u32::try_from(self.entries.len()).map_err(|_| RtError::RegistryFull {
                capacity: self.capacity,
            })?;
            self.entries.push(Entry {
                generation: 0,
                value: Some(value),
            });
            index
        };

        self.len += 1;
        Ok(Handle {
            index,
            generation: self.entries[index as usize].generation,
        })
    }

    /// Borrow the instance behind `handle`.
    ///
    /// # Errors
    ///
    /// [`RtError::InvalidHandle`] if the handle is stale or out of range.
    pub fn get(&self, handle: Handle) -> RtResult<&T> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_ref())
            .ok_or_else(|| RtError::InvalidHandle(handle.to_string()))
    }

    /// Mutably borrow the instance behind `handle`.
    ///
    /// # Errors
    ///
    /// [`RtError::InvalidHandle`] if the handle is stale or out of range.
    pub fn get_mut(&mut self, handle: Handle) -> RtResult<&mut T> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_mut())
            .ok_or_else(|| RtError::InvalidHandle(handle.to_string()))
    }

    /// Remove and return the instance behind `handle`.
    ///
    /// # Errors
    ///
    /// [`RtError::InvalidHandle`] if the handle is stale or out of range.
    pub fn remove(&mut self, handle: Handle) -> RtResult<T> {
        let entry = self
            .entries
            .get_mut(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation && entry.value.is_some())
            .ok_or_else(|| RtError::InvalidHandle(handle.to_string()))?;

        let value = entry
            .value
            .take()
            .ok_or_else(|| RtError::InvalidHandle(handle.to_string()))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(value)
    }

    /// Iterate over live instances with their handles.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }

    /// Remove every live instance, in handle order.
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        let handles: Vec<Handle> = self.iter().map(|(handle, _)| handle).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle).ok().map(|value| (handle, value)))
            .collect()
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of live instances.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut registry = Registry::with_capacity(4);
        let a = registry.insert("a").unwrap();
        let b = registry.insert("b").unwrap();

        assert_eq!(registry.get(a), Ok(&"a"));
        *registry.get_mut(b).unwrap() = "B";
        assert_eq!(registry.remove(b), Ok("B"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut registry = Registry::with_capacity(1);
        let old = registry.insert(1).unwrap();
        registry.remove(old).unwrap();

        let new = registry.insert(2).unwrap();
        assert_ne!(old, new);
        assert!(matches!(registry.get(old), Err(RtError::InvalidHandle(_))));
        assert!(matches!(registry.remove(old), Err(RtError::InvalidHandle(_))));
        assert_eq!(registry.get(new), Ok(&2));
    }

    #[test]
    fn test_capacity_enforced() {
        let mut registry = Registry::with_capacity(2);
        registry.insert(()).unwrap();
        registry.insert(()).unwrap();
        assert_eq!(
            registry.insert(()),
            Err(RtError::RegistryFull { capacity: 2 })
        );
    }

    #[test]
    fn test_out_of_range_handle() {
        let mut registry: Registry<u8> = Registry::with_capacity(2);
        let handle = Handle {
            index: 7,
            generation: 0,
        };
        assert!(registry.get(handle).is_err());
        assert!(registry.get_mut(handle).is_err());
    }

    #[test]
    fn test_iter_and_drain() {
        let mut registry = Registry::with_capacity(3);
        let a = registry.insert('a').unwrap();
        let b = registry.insert('b').unwrap();
        let c = registry.insert('c').unwrap();
        registry.remove(b).unwrap();

        let live: Vec<_> = registry.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(a, 'a'), (c, 'c')]);

        let drained = registry.drain();
        assert_eq!(drained, vec![(a, 'a'), (c, 'c')]);
        assert!(registry.is_empty());
    }
}
