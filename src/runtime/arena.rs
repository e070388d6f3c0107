//! Generation-checked slot arena.
//!
//! Entries are addressed by a [`Key`] pairing a slot index with the slot's
//! generation at insertion time. Removing an entry bumps the generation, so a
//! key held by a late completion resolves to nothing instead of to whatever
//! entry reused the slot.
//!
//! Slots can also be *reserved*: the key is handed out before the value
//! exists, which lets a caller tag resources with the final key while the
//! value is still being built. Reserved slots are invisible to lookups and
//! iteration until filled.

/// Stable identifier of an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Slot index. Useful for logging and per-slot side tables.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when this key was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single integer, suitable as a completion key.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Inverse of [`Key::to_u64`].
    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Entry<T> {
    Vacant,
    Reserved,
    Occupied(T),
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

/// Slot arena with generation-checked keys and O(1) insert/lookup/remove.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// Stack of vacant slot indices (LIFO, like slab).
    free: Vec<u32>,
    occupied: usize,
    reserved: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            occupied: 0,
            reserved: 0,
        }
    }

    /// Claim a slot without a value yet.
    pub fn reserve(&mut self) -> Key {
        self.reserved += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Entry::Reserved;
            return Key {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Entry::Reserved,
        });
        Key {
            index,
            generation: 0,
        }
    }

    /// Store a value in a previously reserved slot.
    ///
    /// Hands the value back if `key` does not name a reserved slot.
    pub fn fill(&mut self, key: Key, value: T) -> Result<(), T> {
        let Some(slot) = self.slot_mut(key) else {
            return Err(value);
        };
        if !matches!(slot.entry, Entry::Reserved) {
            return Err(value);
        }
        slot.entry = Entry::Occupied(value);
        self.reserved -= 1;
        self.occupied += 1;
        Ok(())
    }

    /// Give a reserved slot back without ever filling it.
    pub fn cancel(&mut self, key: Key) -> bool {
        let Some(slot) = self.slot_mut(key) else {
            return false;
        };
        if !matches!(slot.entry, Entry::Reserved) {
            return false;
        }
        slot.entry = Entry::Vacant;
        slot.generation = slot.generation.wrapping_add(1);
        self.reserved -= 1;
        self.free.push(key.index);
        true
    }

    /// Insert a value, returning its key.
    pub fn insert(&mut self, value: T) -> Key {
        let key = self.reserve();
        if self.fill(key, value).is_err() {
            unreachable!("freshly reserved slot rejected its value");
        }
        key
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.index as usize) {
            Some(Slot {
                generation,
                entry: Entry::Occupied(value),
            }) if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Remove an entry. Stale or unknown keys return `None`.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slot_mut(key)?;
        if !matches!(slot.entry, Entry::Occupied(_)) {
            return None;
        }
        let entry = std::mem::replace(&mut slot.entry, Entry::Vacant);
        slot.generation = slot.generation.wrapping_add(1);
        self.occupied -= 1;
        self.free.push(key.index);
        match entry {
            Entry::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Remove every occupied entry. Reservations are left in place.
    pub fn drain(&mut self) -> Vec<(Key, T)> {
        let mut drained = Vec::with_capacity(self.occupied);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !matches!(slot.entry, Entry::Occupied(_)) {
                continue;
            }
            let key = Key {
                index: index as u32,
                generation: slot.generation,
            };
            if let Entry::Occupied(value) = std::mem::replace(&mut slot.entry, Entry::Vacant) {
                drained.push((key, value));
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
        }
        self.occupied = 0;
        drained
    }

    /// Iterate over occupied entries.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.entry {
                Entry::Occupied(value) => Some((
                    Key {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )),
                _ => None,
            })
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of reserved but unfilled slots.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    fn slot_mut(&mut self, key: Key) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
    }
}
