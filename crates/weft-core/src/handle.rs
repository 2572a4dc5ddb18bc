//! Generation-tagged handle arena.
//!
//! Every runtime resource (device, stream, memory, kernel, pending transfer)
//! lives in a [`HandlePool`] slot. A [`Handle`] pairs the slot index with the
//! generation the slot had when the handle was issued, so a handle that
//! outlives its resource is detected instead of aliasing whatever reuses the
//! slot next.

use std::fmt;

/// Opaque resource identity: slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Pack into a single integer for the C ABI (`generation << 32 | index`).
    ///
    /// Generations start at 1, so a packed live handle is never 0.
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`Handle::to_bits`]. Returns `None` for the null value.
    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits == 0 {
            return None;
        }
        Some(Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of values addressed by generation-tagged [`Handle`]s.
///
/// Freed slots are recycled through a free list; each reuse bumps the slot
/// generation so stale handles stop resolving.
pub struct HandlePool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlePool<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Issue a fresh handle owning `value`.
    pub fn acquire(&mut self, value: T) -> Handle {
        self.acquire_with(|_| value)
    }

    /// Issue a fresh handle owning the value built by `make`, which is told
    /// the handle in advance (for records that refer to themselves).
    pub fn acquire_with(&mut self, make: impl FnOnce(Handle) -> T) -> Handle {
        if let Some(&index) = self.free.last() {
            let generation = self.slots[index as usize].generation.wrapping_add(1).max(1);
            let handle = Handle { index, generation };
            let value = make(handle);
            self.free.pop();
            let slot = &mut self.slots[index as usize];
            slot.generation = generation;
            slot.value = Some(value);
            self.live += 1;
            return handle;
        }
        let handle = Handle {
            index: self.slots.len() as u32,
            generation: 1,
        };
        let value = make(handle);
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        self.live += 1;
        handle
    }

    /// Release the handle, returning its value.
    ///
    /// Releasing a stale or already-released handle is a no-op returning
    /// `None`; the pool is left exactly as the first release left it.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Mutable access to two distinct live entries at once.
    pub fn get2_mut(&mut self, a: Handle, b: Handle) -> Option<(&mut T, &mut T)> {
        if a.index == b.index || !self.is_live(a) || !self.is_live(b) {
            return None;
        }
        let (lo, hi, flipped) = if a.index < b.index {
            (a.index as usize, b.index as usize, false)
        } else {
            (b.index as usize, a.index as usize, true)
        };
        let (head, tail) = self.slots.split_at_mut(hi);
        let lo_value = head[lo].value.as_mut()?;
        let hi_value = tail[0].value.as_mut()?;
        if flipped {
            Some((hi_value, lo_value))
        } else {
            Some((lo_value, hi_value))
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    /// Handles of every live entry matching `pred`.
    pub fn handles_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<Handle> {
        self.iter()
            .filter(|(_, v)| pred(v))
            .map(|(h, _)| h)
            .collect()
    }
}

/// Declare a typed wrapper over [`Handle`] so handles of different resource
/// kinds cannot be mixed up.
macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) $crate::handle::Handle);

        impl $name {
            pub fn handle(&self) -> $crate::handle::Handle {
                self.0
            }

            pub fn to_bits(&self) -> u64 {
                self.0.to_bits()
            }

            pub fn from_bits(bits: u64) -> Option<Self> {
                $crate::handle::Handle::from_bits(bits).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

typed_handle!(
    /// A device created by [`crate::Runtime::create_device`].
    DeviceId, "device"
);
typed_handle!(
    /// An ordered work queue owned by a device.
    StreamId, "stream"
);
typed_handle!(
    /// A device-resident allocation.
    MemoryId, "memory"
);
typed_handle!(
    /// A compiled, callable kernel bound to one device.
    KernelId, "kernel"
);
typed_handle!(
    /// An asynchronous device-to-host read awaiting collection.
    TransferId, "transfer"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let mut pool = HandlePool::new();
        let a = pool.acquire("a");
        let b = pool.acquire("b");
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.release(a), Some("a"));
        assert!(!pool.is_live(a));
        assert!(pool.is_live(b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut pool = HandlePool::new();
        let a = pool.acquire(1u32);
        let _b = pool.acquire(2u32);
        pool.release(a);
        let len_once = pool.len();
        let free_once = pool.free.clone();
        assert_eq!(pool.release(a), None);
        assert_eq!(pool.len(), len_once);
        assert_eq!(pool.free, free_once);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut pool = HandlePool::new();
        let a = pool.acquire(10);
        pool.release(a);
        let b = pool.acquire(20);
        // Same slot, new generation
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(b), Some(&20));
        // Releasing the stale handle must not free the new occupant
        assert_eq!(pool.release(a), None);
        assert!(pool.is_live(b));
    }

    #[test]
    fn test_bits_roundtrip() {
        let mut pool = HandlePool::new();
        let a = pool.acquire(());
        let bits = a.to_bits();
        assert_ne!(bits, 0);
        assert_eq!(Handle::from_bits(bits), Some(a));
        assert_eq!(Handle::from_bits(0), None);
    }

    #[test]
    fn test_get2_mut() {
        let mut pool = HandlePool::new();
        let a = pool.acquire(1);
        let b = pool.acquire(2);
        {
            let (x, y) = pool.get2_mut(b, a).unwrap();
            std::mem::swap(x, y);
        }
        assert_eq!(pool.get(a), Some(&2));
        assert_eq!(pool.get(b), Some(&1));
        assert!(pool.get2_mut(a, a).is_none());
    }

    #[test]
    fn test_handles_where() {
        let mut pool = HandlePool::new();
        let a = pool.acquire(1);
        let _ = pool.acquire(2);
        let c = pool.acquire(3);
        let odd = pool.handles_where(|v| v % 2 == 1);
        assert_eq!(odd, vec![a, c]);
    }

    #[test]
    fn test_typed_display() {
        let mut pool = HandlePool::new();
        let id = DeviceId(pool.acquire(()));
        assert_eq!(format!("{id}"), "device#0v1");
        assert_eq!(DeviceId::from_bits(id.to_bits()), Some(id));
    }
}
