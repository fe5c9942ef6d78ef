// ABOUTME: Defines OptionalVector, a pair of parallel sequences holding one optional scalar per entry.
// ABOUTME: Used for per-entry timestamps and start positions where values may be absent.

use serde::{Deserialize, Serialize};

/// An optional value per archive entry, stored as parallel `defined` flags and
/// `values`. Values are only meaningful where the matching flag is set, and
/// the values sequence may be shorter than the flags sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalVector<T> {
    pub defined: Vec<bool>,
    pub values: Vec<T>,
}

impl<T> Default for OptionalVector<T> {
    fn default() -> Self {
        Self {
            defined: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T: Copy + Default> OptionalVector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, defined or not.
    pub fn len(&self) -> usize {
        self.defined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defined.is_empty()
    }

    /// Append a slot. Undefined slots still occupy a value position (holding
    /// the default) so values stay index-aligned with the flags.
    pub fn push(&mut self, value: Option<T>) {
        self.pad_values();
        self.defined.push(value.is_some());
        self.values.push(value.unwrap_or_default());
    }

    /// Set slot `index`, growing the vector with undefined slots as needed.
    pub fn set(&mut self, index: usize, value: Option<T>) {
        while self.defined.len() <= index {
            self.push(None);
        }
        self.pad_values();
        self.defined[index] = value.is_some();
        self.values[index] = value.unwrap_or_default();
    }

    /// The value at `index`, if that slot exists and is defined.
    pub fn get(&self, index: usize) -> Option<T> {
        match self.defined.get(index) {
            Some(true) => self.values.get(index).copied(),
            _ => None,
        }
    }

    /// Iterate slots as `Option<T>`.
    pub fn iter(&self) -> impl Iterator<Item = Option<T>> + '_ {
        (0..self.defined.len()).map(|i| self.get(i))
    }

    /// Drop every slot at or after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.defined.truncate(len);
        self.values.truncate(len);
    }

    /// Append all slots of `other` after the current ones.
    pub fn extend_from(&mut self, other: &OptionalVector<T>) {
        for value in other.iter() {
            self.push(value);
        }
    }

    /// True when `values.len() <= defined.len()`.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() <= self.defined.len()
    }

    fn pad_values(&mut self) {
        if self.values.len() < self.defined.len() {
            self.values.resize(self.defined.len(), T::default());
        }
    }
}

impl<T: Copy + Default> FromIterator<Option<T>> for OptionalVector<T> {
    fn from_iter<I: IntoIterator<Item = Option<T>>>(iter: I) -> Self {
        let mut vector = Self::new();
        for value in iter {
            vector.push(value);
        }
        vector
    }
}
