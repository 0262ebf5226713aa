use std::collections::HashSet;

/// Resource keys held by running jobs.
///
/// Only the scheduler loop touches this table, so acquisition needs no
/// synchronization beyond `&mut self`. A key is present exactly while one
/// running job holds it.
#[derive(Debug, Default)]
pub struct LockTable {
    held: HashSet<String>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every key in `keys`, or none of them.
    ///
    /// Returns false without side effects if any key is already held.
    pub fn try_acquire(&mut self, keys: &[String]) -> bool {
        if keys.iter().any(|k| self.held.contains(k)) {
            return false;
        }
        self.held.extend(keys.iter().cloned());
        true
    }

    pub fn release(&mut self, keys: &[String]) {
        for key in keys {
            self.held.remove(key);
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
