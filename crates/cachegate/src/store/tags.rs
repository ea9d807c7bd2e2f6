//! Tag → keys index
//!
//! The index may briefly list a key under a tag its live entry no longer
//! carries. Such references are dropped through [`TagIndex::prune`], which
//! the store calls after every overwrite or removal and for every key seen
//! while invalidating a tag.

use dashmap::DashMap;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    tags: DashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// List `key` under each of `tags`.
    pub(crate) fn add<'a>(&self, key: &str, tags: impl IntoIterator<Item = &'a String>) {
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Keys currently listed under `tag`, including stale references.
    pub(crate) fn snapshot(&self, tag: &str) -> Vec<String> {
        self.tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove `key` from each of `tags` unless `still_tagged(tag)` says its
    /// live entry carries that tag. Sets left empty are dropped.
    ///
    /// `still_tagged` runs while the tag's shard is write-locked, so a
    /// concurrent `add` for the same tag cannot interleave with the check.
    pub(crate) fn prune<'a, F>(
        &self,
        key: &str,
        tags: impl IntoIterator<Item = &'a str>,
        still_tagged: F,
    ) where
        F: Fn(&str) -> bool,
    {
        for tag in tags {
            let emptied = match self.tags.get_mut(tag) {
                Some(mut keys) => {
                    if !still_tagged(tag) {
                        keys.remove(key);
                    }
                    keys.is_empty()
                }
                None => false,
            };

            if emptied {
                self.tags.remove_if(tag, |_, keys| keys.is_empty());
            }
        }
    }

    /// Number of tags with at least one listed key.
    pub(crate) fn len(&self) -> usize {
        self.tags.len()
    }

    pub(crate) fn clear(&self) {
        self.tags.clear();
    }
}
