//! Per-process LRU cache: local xid → distributed xid.
//!
//! Visibility checks on segments translate committed local xids into
//! distributed ids over and over; the distributed log lookup is shared and
//! comparatively expensive, so each backend keeps a small LRU in front of it.
//! The cache is process-local and needs no locking.

use std::collections::HashMap;

use meridian_common::types::{DistribXid, Xid};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub adds: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    xid: Xid,
    distrib_xid: DistribXid,
    visits: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LocalDistribXactCache {
    capacity: usize,
    map: HashMap<Xid, usize>,
    entries: Vec<CacheEntry>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used; evicted first.
    tail: Option<usize>,
    stats: CacheStats,
}

impl LocalDistribXactCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Look up `xid`; a hit moves the entry to the front.
    pub fn find(&mut self, xid: Xid) -> Option<DistribXid> {
        match self.map.get(&xid).copied() {
            Some(idx) => {
                self.stats.hits += 1;
                metrics::counter!("meridian_distrib_cache_hits_total").increment(1);
                self.entries[idx].visits += 1;
                self.unlink(idx);
                self.push_front(idx);
                Some(self.entries[idx].distrib_xid)
            }
            None => {
                self.stats.misses += 1;
                metrics::counter!("meridian_distrib_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Insert or refresh a mapping, evicting the least recently used entry
    /// when full. A zero-capacity cache stores nothing.
    pub fn add(&mut self, xid: Xid, distrib_xid: DistribXid) {
        if self.capacity == 0 {
            return;
        }
        if let Some(idx) = self.map.get(&xid).copied() {
            self.entries[idx].distrib_xid = distrib_xid;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }
        if self.map.len() >= self.capacity {
            if let Some(victim) = self.tail {
                self.unlink(victim);
                let old = self.entries[victim].xid;
                self.map.remove(&old);
                self.free.push(victim);
                self.stats.evictions += 1;
            }
        }
        let entry = CacheEntry {
            xid,
            distrib_xid,
            visits: 0,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.entries[i] = entry;
                i
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.map.insert(xid, idx);
        self.push_front(idx);
        self.stats.adds += 1;
    }

    pub fn remove(&mut self, xid: Xid) -> bool {
        match self.map.remove(&xid) {
            Some(idx) => {
                self.unlink(idx);
                self.free.push(idx);
                true
            }
            None => false,
        }
    }

    /// Xids from most to least recently used.
    pub fn keys_mru(&self) -> Vec<Xid> {
        let mut out = Vec::with_capacity(self.map.len());
        let mut cur = self.head;
        while let Some(i) = cur {
            out.push(self.entries[i].xid);
            cur = self.entries[i].next;
        }
        out
    }

    pub fn show_stats(&self, context: &str) {
        let total = self.stats.hits + self.stats.misses;
        let hit_pct = if total == 0 {
            0.0
        } else {
            self.stats.hits as f64 * 100.0 / total as f64
        };
        let hottest = self
            .map
            .values()
            .map(|&i| self.entries[i].visits)
            .max()
            .unwrap_or(0);
        tracing::info!(
            "{}: distributed xid cache {} of {} entries, hits={} misses={} ({:.1}%), adds={} evictions={} hottest={}",
            context,
            self.map.len(),
            self.capacity,
            self.stats.hits,
            self.stats.misses,
            hit_pct,
            self.stats.adds,
            self.stats.evictions,
            hottest
        );
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.entries[idx].prev, self.entries[idx].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[idx].prev = None;
        self.entries[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.entries[idx].prev = None;
        self.entries[idx].next = self.head;
        if let Some(h) = self.head {
            self.entries[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}
