//! Keyed recency list over a slot arena.
//!
//! Entries live in a `Vec` and link to each other by index. Moving an
//! entry to the head and unlinking it are O(1); freed slots are reused.

use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Slot<T> {
    key: String,
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Map from key to value that also remembers which entry was touched last.
#[derive(Debug, Clone)]
pub struct RecencyList<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
}

impl<T> Default for RecencyList<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
        }
    }
}

impl<T> RecencyList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Value under `key` without touching its position.
    pub fn get(&self, key: &str) -> Option<&T> {
        let i = *self.index.get(key)?;
        self.slots[i].as_ref().map(|s| &s.value)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        let i = *self.index.get(key)?;
        self.slots[i].as_mut().map(|s| &mut s.value)
    }

    /// Value for `key`, inserting `make()` at the head if absent.
    pub fn get_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> T) -> &mut T {
        let i = match self.index.get(key) {
            Some(&i) => i,
            None => self.insert_at_head(key.to_string(), make()),
        };
        match self.slots[i].as_mut() {
            Some(slot) => &mut slot.value,
            None => unreachable!("indexed slot {i} is free"),
        }
    }

    /// Mark `key` as the most recently touched entry. Returns false when
    /// the key is unknown.
    pub fn move_to_head(&mut self, key: &str) -> bool {
        let Some(&i) = self.index.get(key) else {
            return false;
        };
        if self.head == Some(i) {
            return true;
        }
        self.unlink(i);
        self.link_at_head(i);
        true
    }

    /// Unlink `key` and free its slot for reuse.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let i = self.index.remove(key)?;
        self.unlink(i);
        let slot = self.slots[i].take()?;
        self.free.push(i);
        Some(slot.value)
    }

    /// Most recently touched value.
    pub fn head(&self) -> Option<&T> {
        let i = self.head?;
        self.slots[i].as_ref().map(|s| &s.value)
    }

    /// Entries from most to least recently touched.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn insert_at_head(&mut self, key: String, value: T) -> usize {
        let slot = Slot {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, i);
        self.link_at_head(i);
        i
    }

    fn link_at_head(&mut self, i: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[i].as_mut() {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(slot) = self.slots[h].as_mut() {
                slot.prev = Some(i);
            }
        }
        self.head = Some(i);
    }

    fn unlink(&mut self, i: usize) {
        let Some((prev, next)) = self.slots[i].as_ref().map(|s| (s.prev, s.next)) else {
            return;
        };
        if let Some(p) = prev {
            if let Some(slot) = self.slots[p].as_mut() {
                slot.next = next;
            }
        }
        if let Some(n) = next {
            if let Some(slot) = self.slots[n].as_mut() {
                slot.prev = prev;
            }
        }
        if self.head == Some(i) {
            self.head = next;
        }
        if let Some(slot) = self.slots[i].as_mut() {
            slot.prev = None;
            slot.next = None;
        }
    }
}

/// Iterator from the most to the least recently touched entry.
pub struct Iter<'a, T> {
    list: &'a RecencyList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (&'a str, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.list.slots[self.cursor?].as_ref()?;
        self.cursor = slot.next;
        Some((slot.key.as_str(), &slot.value))
    }
}
