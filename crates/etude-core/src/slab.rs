// src/slab.rs

enum Entry<T> {
    Occupied(T),
    /// Next free index, or `usize::MAX` at the end of the list.
    Vacant(usize),
}

/// Bounded free-list slab. Indices are stable for the lifetime of an entry
/// and are reused LIFO after removal; they double as reactor tokens.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    head_free: usize,
    len: usize,
    max: usize,
}

const NIL: usize = usize::MAX;

impl<T> Slab<T> {
    /// Grows lazily up to `max` entries.
    pub fn with_max(max: usize) -> Self {
        Self {
            entries: Vec::new(),
            head_free: NIL,
            len: 0,
            max,
        }
    }

    /// O(1) insertion. The closure receives the index the value will live
    /// at. Returns `None` when the slab is full.
    pub fn insert_with(&mut self, make: impl FnOnce(usize) -> T) -> Option<usize> {
        let idx = if self.head_free != NIL {
            let idx = self.head_free;
            self.head_free = match self.entries[idx] {
                Entry::Vacant(next) => next,
                Entry::Occupied(_) => NIL,
            };
            self.entries[idx] = Entry::Occupied(make(idx));
            idx
        } else if self.entries.len() < self.max {
            let idx = self.entries.len();
            self.entries.push(Entry::Occupied(make(idx)));
            idx
        } else {
            return None;
        };
        self.len += 1;
        Some(idx)
    }

    pub fn insert(&mut self, value: T) -> Option<usize> {
        self.insert_with(|_| value)
    }

    /// O(1) removal; the index goes to the head of the free list.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        match self.entries.get(idx) {
            Some(Entry::Occupied(_)) => {}
            _ => return None,
        }
        let old = std::mem::replace(&mut self.entries[idx], Entry::Vacant(self.head_free));
        self.head_free = idx;
        self.len -= 1;
        match old {
            Entry::Occupied(v) => Some(v),
            Entry::Vacant(_) => None,
        }
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        match self.entries.get(idx) {
            Some(Entry::Occupied(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Removes every entry, yielding them in index order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.head_free = NIL;
        self.len = 0;
        self.entries.drain(..).filter_map(|e| match e {
            Entry::Occupied(v) => Some(v),
            Entry::Vacant(_) => None,
        })
    }
}
