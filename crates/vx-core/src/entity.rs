//! Generation-counted entity handles
//!
//! Every manager in the engine (voices, emitters, sound files) hands out
//! weak handles instead of pointers. A handle packs a slot index and a
//! generation counter into a single `u32`:
//!
//! ```text
//! 31        24 23                        0
//! ┌──────────┬───────────────────────────┐
//! │generation│           index           │
//! └──────────┴───────────────────────────┘
//! ```
//!
//! Releasing a handle bumps the generation stored for its index, so every
//! outstanding copy of the old handle stops validating, even after the index
//! is recycled for a new entity.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Number of bits used for the slot index
pub const INDEX_BITS: u32 = 24;
/// Number of bits used for the generation counter
pub const GENERATION_BITS: u32 = 8;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Largest index an allocator will hand out (the all-ones index is reserved for `INVALID`)
pub const MAX_ENTITY_INDEX: u32 = INDEX_MASK - 1;

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE FLAVORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Marker for voice handles
#[derive(Debug)]
pub enum VoiceKind {}

/// Marker for emitter handles
#[derive(Debug)]
pub enum EmitterKind {}

/// Marker for sound file handles
#[derive(Debug)]
pub enum SoundFileKind {}

/// Handle to a logical voice
pub type VoiceHandle = Handle<VoiceKind>;
/// Handle to a spatial emitter
pub type EmitterHandle = Handle<EmitterKind>;
/// Handle to a sound file cache entry
pub type SoundFileHandle = Handle<SoundFileKind>;

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed, generation-counted entity handle
pub struct Handle<K> {
    id: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    /// Handle that never validates against any allocator
    pub const INVALID: Self = Self {
        id: u32::MAX,
        _kind: PhantomData,
    };

    /// Pack an index and generation into a handle
    #[inline]
    pub fn new(index: u32, generation: u8) -> Self {
        debug_assert!(index <= INDEX_MASK, "entity index {index} out of range");
        Self {
            id: (index & INDEX_MASK) | ((generation as u32 & GENERATION_MASK) << INDEX_BITS),
            _kind: PhantomData,
        }
    }

    /// Rebuild a handle from its packed representation
    #[inline]
    pub fn from_raw(id: u32) -> Self {
        Self {
            id,
            _kind: PhantomData,
        }
    }

    /// Packed representation
    #[inline]
    pub fn raw(self) -> u32 {
        self.id
    }

    /// Slot index
    #[inline]
    pub fn index(self) -> u32 {
        self.id & INDEX_MASK
    }

    /// Generation counter
    #[inline]
    pub fn generation(self) -> u8 {
        ((self.id >> INDEX_BITS) & GENERATION_MASK) as u8
    }

    #[inline]
    pub fn is_invalid(self) -> bool {
        self.id == u32::MAX
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Handle(invalid)")
        } else {
            write!(f, "Handle({}v{})", self.index(), self.generation())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTITY MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Default number of free indices kept in reserve before recycling
pub const DEFAULT_MIN_FREE_INDICES: usize = 32;

/// Allocator for one handle flavor
///
/// Indices are only recycled once more than `min_free_indices` of them are
/// waiting in the free queue. Holding back a reserve spreads reuse across
/// indices, so a generation counter takes much longer to wrap around.
#[derive(Debug)]
pub struct EntityManager<K> {
    generations: Vec<u8>,
    free_indices: VecDeque<u32>,
    min_free_indices: usize,
    live_count: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K> EntityManager<K> {
    pub fn new(min_free_indices: usize) -> Self {
        Self {
            generations: Vec::new(),
            free_indices: VecDeque::new(),
            min_free_indices,
            live_count: 0,
            _kind: PhantomData,
        }
    }

    /// Allocate a new handle
    ///
    /// Returns `Handle::INVALID` if the index space is exhausted.
    pub fn create(&mut self) -> Handle<K> {
        let index = if self.free_indices.len() > self.min_free_indices {
            match self.free_indices.pop_front() {
                Some(index) => index,
                None => return Handle::INVALID,
            }
        } else {
            let index = self.generations.len() as u32;
            if index > MAX_ENTITY_INDEX {
                log::error!("Entity index space exhausted ({} indices)", index);
                return Handle::INVALID;
            }
            self.generations.push(0);
            index
        };

        self.live_count += 1;
        Handle::new(index, self.generations[index as usize])
    }

    /// Release a handle, invalidating every copy of it
    ///
    /// Returns `false` (and does nothing) for a handle that is already invalid.
    pub fn release(&mut self, handle: Handle<K>) -> bool {
        if !self.is_valid(handle) {
            return false;
        }

        let index = handle.index();
        let generation = &mut self.generations[index as usize];
        *generation = generation.wrapping_add(1);
        self.free_indices.push_back(index);
        self.live_count -= 1;
        true
    }

    /// Check whether a handle refers to a live entity
    #[inline]
    pub fn is_valid(&self, handle: Handle<K>) -> bool {
        if handle.is_invalid() {
            return false;
        }
        self.generations
            .get(handle.index() as usize)
            .is_some_and(|&generation| generation == handle.generation())
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Number of indices ever allocated
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}

impl<K> Default for EntityManager<K> {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FREE_INDICES)
    }
}
