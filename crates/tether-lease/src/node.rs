//! Arena-backed doubly linked list of outstanding reservations.
//!
//! Nodes live in a slot vector and link to each other by index. `latest` is
//! the most recently inserted node; walking `previous` from it visits every
//! outstanding node exactly once. Each slot carries a generation that is
//! bumped whenever the slot is vacated, so a stale key can never address a
//! node that reused its slot.

/// Address of one node: slot index plus the generation it was created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Vacant {
        generation: u32,
    },
    Occupied {
        generation: u32,
        previous: Option<usize>,
        next: Option<usize>,
        value: T,
    },
}

/// What a removal did to the list.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Unlinked<T> {
    /// A node in the middle (or the oldest) was spliced out.
    Spliced(T),
    /// The latest node was popped and its predecessor became latest.
    Popped(T),
    /// The sole node was removed; the list is now empty.
    Emptied(T),
}

impl<T> Unlinked<T> {
    pub(crate) fn into_value(self) -> T {
        match self {
            Unlinked::Spliced(v) | Unlinked::Popped(v) | Unlinked::Emptied(v) => v,
        }
    }
}

#[derive(Debug)]
pub(crate) struct NodeList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    latest: Option<usize>,
    len: usize,
}

impl<T> Default for NodeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NodeList<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            latest: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.latest.is_none()
    }

    /// Link `value` after the current latest node and make it the new latest.
    pub(crate) fn push(&mut self, value: T) -> NodeKey {
        let previous = self.latest;
        let (index, generation) = match self.free.pop() {
            Some(index) => {
                let generation = match self.slots[index] {
                    Slot::Vacant { generation } => generation,
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                self.slots[index] = Slot::Occupied {
                    generation,
                    previous,
                    next: None,
                    value,
                };
                (index, generation)
            }
            None => {
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    previous,
                    next: None,
                    value,
                });
                (self.slots.len() - 1, 0)
            }
        };

        if let Some(p) = previous {
            self.set_next(p, Some(index));
        }
        self.latest = Some(index);
        self.len += 1;
        NodeKey { index, generation }
    }

    pub(crate) fn contains(&self, key: NodeKey) -> bool {
        matches!(
            self.slots.get(key.index),
            Some(Slot::Occupied { generation, .. }) if *generation == key.generation
        )
    }

    /// Detach the node addressed by `key`. Returns `None` for a stale key.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<Unlinked<T>> {
        if !self.contains(key) {
            return None;
        }

        let (previous, next, value) = self.vacate(key.index);
        self.len -= 1;

        match (previous, next) {
            // Not the latest: splice it out of the middle.
            (_, Some(n)) => {
                self.set_previous(n, previous);
                if let Some(p) = previous {
                    self.set_next(p, Some(n));
                }
                Some(Unlinked::Spliced(value))
            }
            (Some(p), None) => {
                self.latest = Some(p);
                self.set_next(p, None);
                Some(Unlinked::Popped(value))
            }
            (None, None) => {
                self.latest = None;
                Some(Unlinked::Emptied(value))
            }
        }
    }

    /// Detach every node, newest first, leaving the list empty.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.latest.take();
        while let Some(index) = cursor {
            let (previous, _, value) = self.vacate(index);
            out.push(value);
            cursor = previous;
        }
        self.len = 0;
        out
    }

    /// Values from newest to oldest.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.latest;
        std::iter::from_fn(move || {
            let index = cursor?;
            match &self.slots[index] {
                Slot::Occupied {
                    previous, value, ..
                } => {
                    cursor = *previous;
                    Some(value)
                }
                Slot::Vacant { .. } => None,
            }
        })
    }

    /// Check that the chain from `latest` is acyclic, covers every occupied
    /// slot, and that every `next`/`previous` pair agrees.
    pub(crate) fn links_consistent(&self) -> bool {
        let occupied = self
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count();
        if occupied != self.len {
            return false;
        }

        let mut visited = 0usize;
        let mut expected_next: Option<usize> = None;
        let mut cursor = self.latest;
        while let Some(index) = cursor {
            visited += 1;
            if visited > self.len {
                return false;
            }
            match &self.slots[index] {
                Slot::Occupied { previous, next, .. } => {
                    if *next != expected_next {
                        return false;
                    }
                    expected_next = Some(index);
                    cursor = *previous;
                }
                Slot::Vacant { .. } => return false,
            }
        }
        visited == self.len
    }

    fn vacate(&mut self, index: usize) -> (Option<usize>, Option<usize>, T) {
        let generation = match &self.slots[index] {
            Slot::Occupied { generation, .. } => *generation,
            Slot::Vacant { .. } => unreachable!("vacating an empty slot"),
        };
        let old = std::mem::replace(
            &mut self.slots[index],
            Slot::Vacant {
                generation: generation.wrapping_add(1),
            },
        );
        self.free.push(index);
        match old {
            Slot::Occupied {
                previous,
                next,
                value,
                ..
            } => (previous, next, value),
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    fn set_next(&mut self, index: usize, to: Option<usize>) {
        if let Slot::Occupied { next, .. } = &mut self.slots[index] {
            *next = to;
        }
    }

    fn set_previous(&mut self, index: usize, to: Option<usize>) {
        if let Slot::Occupied { previous, .. } = &mut self.slots[index] {
            *previous = to;
        }
    }
}
