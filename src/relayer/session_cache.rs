// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Per session serving state shared by the server and the mining workers.

use crate::base::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Session serving state.
///
/// Once a session is marked as not rewardable it stays so.
#[derive(Debug)]
pub struct SessionCacheEntry {
    end_height: AtomicU64,
    rewardable: AtomicBool,
}

impl SessionCacheEntry {
    fn new(end_height: u64) -> Self {
        SessionCacheEntry {
            end_height: AtomicU64::new(end_height),
            rewardable: AtomicBool::new(true),
        }
    }

    pub fn end_height(&self) -> u64 {
        self.end_height.load(Ordering::Acquire)
    }

    pub fn is_rewardable(&self) -> bool {
        self.rewardable.load(Ordering::Acquire)
    }

    /// Latch the session as not rewardable.
    /// Returns true only for the call that flipped the flag.
    pub fn mark_non_rewardable(&self) -> bool {
        self.rewardable
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The end height can only move forward.
    pub fn update_end_height(&self, end_height: u64) {
        self.end_height.fetch_max(end_height, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct SessionCache {
    entries: RwLock<HashMap<String, Arc<SessionCacheEntry>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        SessionCache::default()
    }

    /// Entry of the session, created as rewardable on first sight.
    pub fn get_or_insert(&self, session_id: &str, end_height: u64) -> Arc<SessionCacheEntry> {
        if let Some(entry) = self.entries.read().get(session_id) {
            entry.update_end_height(end_height);
            return entry.clone();
        }
        let mut entries = self.entries.write();
        let entry = entries
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(SessionCacheEntry::new(end_height)));
        entry.update_end_height(end_height);
        entry.clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionCacheEntry>> {
        self.entries.read().get(session_id).cloned()
    }

    /// Latch a session as not rewardable, creating the entry if needed.
    pub fn mark_non_rewardable(&self, session_id: &str, end_height: u64) {
        if self
            .get_or_insert(session_id, end_height)
            .mark_non_rewardable()
        {
            info!("[session-cache] session {} is no longer rewardable", session_id);
        }
    }

    /// Drop sessions that ended before `height - 1`.
    /// Returns the number of removed entries.
    pub fn prune(&self, height: u64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.end_height().saturating_add(1) >= height);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn new_sessions_are_rewardable() {
        let cache = SessionCache::new();

        let entry = cache.get_or_insert("s1", 8);

        assert!(entry.is_rewardable());
        assert_eq!(entry.end_height(), 8);
    }

    #[test]
    fn end_height_never_decreases() {
        let cache = SessionCache::new();
        cache.get_or_insert("s1", 8);

        cache.get_or_insert("s1", 4);
        let entry = cache.get_or_insert("s1", 12);

        assert_eq!(entry.end_height(), 12);
    }

    #[test]
    fn non_rewardable_is_sticky() {
        let cache = SessionCache::new();
        let entry = cache.get_or_insert("s1", 8);

        let first = entry.mark_non_rewardable();
        let second = entry.mark_non_rewardable();
        let again = cache.get_or_insert("s1", 8);

        assert!(first);
        assert!(!second);
        assert!(!again.is_rewardable());
    }

    #[test]
    fn concurrent_latching_flips_once() {
        let cache = Arc::new(SessionCache::new());
        let entry = cache.get_or_insert("s1", 8);

        let flips: usize = (0..8)
            .map(|_| {
                let entry = entry.clone();
                thread::spawn(move || entry.mark_non_rewardable())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap() as usize)
            .sum();

        assert_eq!(flips, 1);
    }

    #[test]
    fn prune_expired_sessions() {
        let cache = SessionCache::new();
        cache.get_or_insert("old", 4);
        cache.get_or_insert("current", 8);

        let removed = cache.prune(6);

        assert_eq!(removed, 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("current").is_some());
    }

    #[test]
    fn prune_keeps_session_ended_at_previous_block() {
        let cache = SessionCache::new();
        cache.get_or_insert("s1", 4);

        let removed = cache.prune(5);

        assert_eq!(removed, 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn prune_with_maximal_end_height() {
        let cache = SessionCache::new();
        cache.get_or_insert("far", u64::MAX);
        cache.get_or_insert("old", 4);

        let removed = cache.prune(7);

        assert_eq!(removed, 1);
        assert!(cache.get("far").is_some());
        assert!(cache.get("old").is_none());
    }
}
