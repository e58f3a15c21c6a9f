//! Reference table: integer handles for host values.
//!
//! The module refers to host objects only through `u32` handles into this
//! table. Handle 0 is `undefined`; the four constants `undefined`, `null`,
//! `true` and `false` get reserved slots when the module asks for the table
//! to be initialized, and those slots are never freed or reused.
//!
//! Handle misuse (use-after-free, double free) is not detected: a vacant
//! slot reads as `undefined` and freeing twice pushes the slot twice.

use crate::value::HostValue;

/// Handles of the seeded constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinels {
    /// Handle of `undefined`
    pub undefined: u32,
    /// Handle of `null`
    pub null: u32,
    /// Handle of `true`
    pub true_: u32,
    /// Handle of `false`
    pub false_: u32,
}

/// Handle table owned by the instance's store.
#[derive(Debug)]
pub struct RefTable {
    slots: Vec<Option<HostValue>>,
    free: Vec<u32>,
    reserved_end: u32,
    sentinels: Option<Sentinels>,
}

impl RefTable {
    /// Create a table with `initial_len` reserved leading slots (at least one).
    ///
    /// Slot 0 holds `undefined`; the other reserved slots start vacant and
    /// are never handed out by [`RefTable::alloc`].
    pub fn new(initial_len: u32) -> Self {
        let initial_len = initial_len.max(1);
        let mut slots = vec![None; initial_len as usize];
        slots[0] = Some(HostValue::Undefined);
        Self {
            slots,
            free: Vec::new(),
            reserved_end: initial_len,
            sentinels: None,
        }
    }

    /// Reserve and seed the four constant slots. Idempotent.
    pub fn seed_sentinels(&mut self) -> Sentinels {
        if let Some(sentinels) = self.sentinels {
            return sentinels;
        }
        let offset = self.grow(4);
        self.slots[offset as usize] = Some(HostValue::Undefined);
        self.slots[offset as usize + 1] = Some(HostValue::Null);
        self.slots[offset as usize + 2] = Some(HostValue::Bool(true));
        self.slots[offset as usize + 3] = Some(HostValue::Bool(false));
        self.reserved_end = self.reserved_end.max(offset + 4);

        let sentinels = Sentinels {
            undefined: offset,
            null: offset + 1,
            true_: offset + 2,
            false_: offset + 3,
        };
        tracing::debug!(?sentinels, "reference table seeded");
        self.sentinels = Some(sentinels);
        sentinels
    }

    /// Seeded constant handles, if the table was initialized.
    pub fn sentinels(&self) -> Option<Sentinels> {
        self.sentinels
    }

    /// Append `n` vacant slots and return the index of the first.
    pub fn grow(&mut self, n: u32) -> u32 {
        let offset = self.slots.len() as u32;
        self.slots.resize(self.slots.len() + n as usize, None);
        offset
    }

    /// Reserve a slot and return its handle.
    pub fn alloc(&mut self) -> u32 {
        if let Some(handle) = self.free.pop() {
            return handle;
        }
        self.grow(1)
    }

    /// Store `value` at `handle`, growing the table if needed.
    pub fn set(&mut self, handle: u32, value: HostValue) {
        let idx = handle as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        self.slots[idx] = Some(value);
    }

    /// Value at `handle`. Vacant or out-of-range handles read as `undefined`.
    pub fn get(&self, handle: u32) -> HostValue {
        self.slots
            .get(handle as usize)
            .and_then(|slot| slot.clone())
            .unwrap_or_default()
    }

    /// Allocate a fresh handle for `value`.
    pub fn insert(&mut self, value: HostValue) -> u32 {
        let handle = self.alloc();
        self.set(handle, value);
        handle
    }

    /// Handle for `value`, reusing the seeded slot for the four constants.
    pub fn boxed(&mut self, value: HostValue) -> u32 {
        if let Some(s) = self.sentinels {
            match value {
                HostValue::Undefined => return s.undefined,
                HostValue::Null => return s.null,
                HostValue::Bool(true) => return s.true_,
                HostValue::Bool(false) => return s.false_,
                _ => {}
            }
        }
        self.insert(value)
    }

    /// Handle 0 for an absent value, otherwise a fresh handle.
    pub fn boxed_option(&mut self, value: HostValue) -> u32 {
        if value.is_like_none() {
            0
        } else {
            self.insert(value)
        }
    }

    /// Read and release a handle in one step.
    pub fn take(&mut self, handle: u32) -> HostValue {
        let value = self.get(handle);
        self.free(handle);
        value
    }

    /// Release a handle. Reserved slots are ignored.
    pub fn free(&mut self, handle: u32) {
        if handle < self.reserved_end || handle as usize >= self.slots.len() {
            return;
        }
        self.slots[handle as usize] = None;
        self.free.push(handle);
    }

    /// Number of slots (including reserved and vacant ones).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the table has no slots (never, slot 0 always exists).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of occupied non-reserved slots.
    pub fn live(&self) -> usize {
        self.slots[self.reserved_end as usize..]
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

impl Default for RefTable {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PlainObject;

    #[test]
    fn test_handle_zero_is_undefined() {
        let table = RefTable::default();
        assert_eq!(table.get(0), HostValue::Undefined);
        assert_eq!(table.get(999), HostValue::Undefined);
    }

    #[test]
    fn test_sentinels_seeded_once() {
        let mut table = RefTable::default();
        let s = table.seed_sentinels();
        assert_eq!((s.undefined, s.null, s.true_, s.false_), (1, 2, 3, 4));
        assert_eq!(table.get(s.null), HostValue::Null);
        assert_eq!(table.get(s.true_), HostValue::Bool(true));
        assert_eq!(table.seed_sentinels(), s);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_sentinels_survive_free() {
        let mut table = RefTable::default();
        let s = table.seed_sentinels();
        table.free(s.true_);
        table.free(0);
        assert_eq!(table.get(s.true_), HostValue::Bool(true));
        assert_eq!(table.get(0), HostValue::Undefined);
        let h = table.insert(HostValue::from("x"));
        assert!(h > s.false_);
    }

    #[test]
    fn test_boxed_constants_reuse_sentinels() {
        let mut table = RefTable::default();
        let s = table.seed_sentinels();
        assert_eq!(table.boxed(HostValue::Null), s.null);
        assert_eq!(table.boxed(HostValue::Bool(false)), s.false_);
        assert_eq!(table.live(), 0);
        assert_eq!(table.boxed_option(HostValue::Undefined), 0);
        assert_eq!(table.boxed_option(HostValue::Null), 0);
    }

    #[test]
    fn test_freed_slots_reused() {
        let mut table = RefTable::default();
        table.seed_sentinels();
        let a = table.insert(HostValue::object(PlainObject::new()));
        let b = table.insert(HostValue::Number(1.0));
        assert_eq!(table.live(), 2);
        assert_eq!(table.take(a).class_name(), "Object");
        assert_eq!(table.get(a), HostValue::Undefined);
        assert_eq!(table.insert(HostValue::Null), a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reserved_leading_slots() {
        let mut table = RefTable::new(32);
        let s = table.seed_sentinels();
        assert_eq!(s.undefined, 32);
        let h = table.insert(HostValue::Number(2.0));
        assert_eq!(h, 36);
        table.free(5);
        assert_eq!(table.insert(HostValue::Null), 37);
    }
}
