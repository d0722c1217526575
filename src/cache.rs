//! Answer cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::dns::{DnsRecord, QueryType};

/// Query type slot used when the cache is not partitioned by type.
const ANY_TYPE: u16 = 0;

struct CacheEntry {
    records: Vec<DnsRecord>,
    stored_at: Instant,
    expires_at: Instant,
    written: u64,
}

impl CacheEntry {
    /// Stored records with TTLs counted down to `now`.
    fn remaining(&self, now: Instant) -> Vec<DnsRecord> {
        let elapsed = u32::try_from(now.duration_since(self.stored_at).as_secs()).unwrap_or(u32::MAX);
        self.records
            .iter()
            .map(|record| DnsRecord {
                ttl: record.ttl.saturating_sub(elapsed),
                ..record.clone()
            })
            .collect()
    }
}

#[derive(Default)]
struct Entries {
    by_type: FxHashMap<u16, FxHashMap<String, CacheEntry>>,
    len: usize,
    writes: u64,
}

impl Entries {
    fn remove(&mut self, qtype: u16, domain: &str) -> bool {
        let removed = self
            .by_type
            .get_mut(&qtype)
            .and_then(|inner| inner.remove(domain))
            .is_some();
        if removed {
            self.len -= 1;
        }
        removed
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for inner in self.by_type.values_mut() {
            let before = inner.len();
            inner.retain(|_, entry| now < entry.expires_at);
            removed += before - inner.len();
        }
        self.len -= removed;
        removed
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_type
            .iter()
            .flat_map(|(qtype, inner)| {
                inner
                    .iter()
                    .map(move |(domain, entry)| (entry.written, *qtype, domain))
            })
            .min_by_key(|(written, _, _)| *written)
            .map(|(_, qtype, domain)| (qtype, domain.clone()));

        if let Some((qtype, domain)) = oldest {
            self.remove(qtype, &domain);
        }
    }
}

/// TTL-based answer cache.
///
/// Uses a 2-level map (qtype -> domain -> entry) to avoid allocations on lookup.
/// When full, expired entries are dropped first, then the oldest write.
pub struct AnswerCache {
    entries: RwLock<Entries>,
    capacity: usize,
    partition_by_type: bool,
}

impl AnswerCache {
    pub fn new(capacity: usize, partition_by_type: bool) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            capacity,
            partition_by_type,
        }
    }

    fn slot(&self, qtype: QueryType) -> u16 {
        if self.partition_by_type {
            qtype.to_u16()
        } else {
            ANY_TYPE
        }
    }

    /// Look up cached answers (no allocation on miss).
    pub fn get(&self, domain: &str, qtype: QueryType) -> Option<Vec<DnsRecord>> {
        let now = Instant::now();
        let slot = self.slot(qtype);

        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            if let Some(inner) = entries.by_type.get(&slot) {
                match inner.get(domain) {
                    Some(entry) if now < entry.expires_at => return Some(entry.remaining(now)),
                    Some(_) => {}
                    None => return None,
                }
            } else {
                return None;
            }
        }

        // Expired: drop it so the next put starts fresh.
        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        let expired = entries
            .by_type
            .get(&slot)
            .and_then(|inner| inner.get(domain))
            .is_some_and(|entry| now >= entry.expires_at);
        if expired {
            entries.remove(slot, domain);
        }
        None
    }

    /// Store answers for `ttl`. Empty answer sets and zero TTLs are not cached.
    pub fn put(&self, domain: &str, qtype: QueryType, records: Vec<DnsRecord>, ttl: Duration) {
        if records.is_empty() || ttl.is_zero() || self.capacity == 0 {
            return;
        }
        let slot = self.slot(qtype);
        let now = Instant::now();

        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        let exists = entries
            .by_type
            .get(&slot)
            .is_some_and(|inner| inner.contains_key(domain));
        if !exists && entries.len >= self.capacity {
            entries.purge_expired(now);
            while entries.len >= self.capacity {
                entries.evict_oldest();
            }
        }

        entries.writes += 1;
        let written = entries.writes;
        let previous = entries.by_type.entry(slot).or_default().insert(
            domain.to_string(),
            CacheEntry {
                records,
                stored_at: now,
                expires_at: now + ttl,
                written,
            },
        );
        if previous.is_none() {
            entries.len += 1;
        }
    }

    /// Drop any entry for the key.
    pub fn invalidate(&self, domain: &str, qtype: QueryType) {
        let slot = self.slot(qtype);
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(slot, domain);
        }
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        self.entries
            .write()
            .map(|mut entries| entries.purge_expired(Instant::now()))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
