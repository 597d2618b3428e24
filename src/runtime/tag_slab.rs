//! Slab mapping transport tags to suspended tasks.
//!
//! When a completion operation registers with the transport, the engine
//! parks its task here and hands the transport the resulting [`Tag`]. When
//! the transport reports that tag, the task is removed and resumed.
//!
//! # Design
//!
//! A free list gives O(1) insert and remove. Each tag carries a generation
//! counter next to the slot index, so a tag delivered after its slot was
//! recycled resolves to nothing instead of the wrong task.
//!
//! ```text
//!  Tag (u64):  [ generation: 32 | index: 32 ]
//! ```
//!
//! The slab is only touched from the I/O thread and is not thread-safe.

use crate::runtime::task::TaskRef;
use crate::transport::Tag;
use std::fmt;

/// Sentinel value indicating end of free list.
const FREE_LIST_END: u32 = u32::MAX;

/// Largest index the slab hands out; keeps every tag distinct from [`Tag::WAKEUP`].
const MAX_INDEX: u32 = u32::MAX - 1;

enum Entry {
    Occupied { task: TaskRef, generation: u32 },
    Vacant { next_free: u32, generation: u32 },
}

impl Entry {
    fn generation(&self) -> u32 {
        match self {
            Self::Occupied { generation, .. } | Self::Vacant { generation, .. } => *generation,
        }
    }
}

const fn pack(index: u32, generation: u32) -> Tag {
    Tag::from_raw(((generation as u64) << 32) | index as u64)
}

const fn unpack(tag: Tag) -> (u32, u32) {
    let raw = tag.into_raw();
    (raw as u32, (raw >> 32) as u32)
}

/// Slab of tasks waiting on transport completions.
pub struct TagSlab {
    entries: Vec<Entry>,
    free_head: u32,
    len: usize,
}

impl TagSlab {
    /// Creates an empty slab.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: FREE_LIST_END,
            len: 0,
        }
    }

    /// Parks a task and returns the tag the transport should report.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX - 1` operations are in flight at once.
    pub fn insert(&mut self, task: TaskRef) -> Tag {
        self.len += 1;
        if self.free_head == FREE_LIST_END {
            let index = u32::try_from(self.entries.len())
                .ok()
                .filter(|index| *index <= MAX_INDEX)
                .unwrap_or_else(|| panic!("tag slab exhausted"));
            self.entries.push(Entry::Occupied {
                task,
                generation: 0,
            });
            return pack(index, 0);
        }

        let index = self.free_head;
        let entry = &mut self.entries[index as usize];
        let (generation, next_free) = match entry {
            Entry::Vacant {
                next_free,
                generation,
            } => (*generation, *next_free),
            Entry::Occupied { .. } => unreachable!("free list pointed to occupied entry"),
        };
        *entry = Entry::Occupied { task, generation };
        self.free_head = next_free;
        pack(index, generation)
    }

    /// Removes and returns the task registered under `tag`.
    ///
    /// Returns `None` for unknown, already-removed, or stale tags.
    pub fn remove(&mut self, tag: Tag) -> Option<TaskRef> {
        let (index, generation) = unpack(tag);
        let slot = self.entries.get_mut(index as usize)?;
        if slot.generation() != generation || matches!(slot, Entry::Vacant { .. }) {
            return None;
        }

        let old = std::mem::replace(
            slot,
            Entry::Vacant {
                next_free: self.free_head,
                generation: generation.wrapping_add(1),
            },
        );
        self.free_head = index;
        self.len -= 1;
        match old {
            Entry::Occupied { task, .. } => Some(task),
            Entry::Vacant { .. } => None,
        }
    }

    /// Removes every parked task. Outstanding tags become stale.
    pub fn drain(&mut self) -> Vec<TaskRef> {
        let mut tasks = Vec::with_capacity(self.len);
        for (index, slot) in (0_u32..).zip(self.entries.iter_mut()) {
            if let Entry::Occupied { generation, .. } = *slot {
                let old = std::mem::replace(
                    slot,
                    Entry::Vacant {
                        next_free: self.free_head,
                        generation: generation.wrapping_add(1),
                    },
                );
                self.free_head = index;
                if let Entry::Occupied { task, .. } = old {
                    tasks.push(task);
                }
            }
        }
        self.len = 0;
        tasks
    }

    /// Returns true if `tag` refers to a parked task.
    #[must_use]
    pub fn contains(&self, tag: Tag) -> bool {
        let (index, generation) = unpack(tag);
        matches!(
            self.entries.get(index as usize),
            Some(Entry::Occupied { generation: g, .. }) if *g == generation
        )
    }

    /// Returns the number of parked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no task is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for TagSlab {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TagSlab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagSlab")
            .field("len", &self.len)
            .field("slots", &self.entries.len())
            .finish()
    }
}
