//! Tags - Compute the changes that converge remote tags to the desired set
//!
//! Compares the tags declared in configuration with the tags last applied to
//! the remote resource, and produces the keys to remove and the pairs to add.

use std::collections::{BTreeMap, HashMap};

/// Tag key to tag value
pub type TagSet = HashMap<String, String>;

/// Result of a tag diff
///
/// A changed value shows up on both sides: the old pair in `to_remove` and the
/// new pair in `to_add`. Callers must remove before they add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDelta {
    /// Tags to remove, with the value currently applied
    pub to_remove: BTreeMap<String, String>,
    /// Tags to add, with the desired value
    pub to_add: BTreeMap<String, String>,
}

impl TagDelta {
    /// Returns whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }

    /// Keys to remove, for untag calls that only take keys
    pub fn removed_keys(&self) -> impl Iterator<Item = &str> {
        self.to_remove.keys().map(String::as_str)
    }

    /// Apply this delta to `current`: removals first, then additions
    pub fn apply(&self, current: &TagSet) -> TagSet {
        let mut tags = current.clone();
        for key in self.to_remove.keys() {
            tags.remove(key);
        }
        for (key, value) in &self.to_add {
            tags.insert(key.clone(), value.clone());
        }
        tags
    }
}

/// Compare desired tags with current tags to compute a TagDelta
pub fn diff(desired: &TagSet, current: &TagSet) -> TagDelta {
    let mut delta = TagDelta::default();

    for (key, current_value) in current {
        match desired.get(key) {
            Some(desired_value) if desired_value == current_value => {}
            _ => {
                delta.to_remove.insert(key.clone(), current_value.clone());
            }
        }
    }

    for (key, desired_value) in desired {
        match current.get(key) {
            Some(current_value) if current_value == desired_value => {}
            _ => {
                delta.to_add.insert(key.clone(), desired_value.clone());
            }
        }
    }

    delta
}
