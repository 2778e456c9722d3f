//! Process-wide map session cache with prefix-hash reuse indices.
//!
//! Sessions live behind `Arc<RwLock<_>>` so the running task and pollers
//! share one copy. Two indices map the vectorize and projection prefix hashes
//! of finished sessions to their ids. When two sessions with the same prefix
//! finish concurrently, the later registration wins.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use datamap_core::config::MapSettings;
use datamap_core::params::StageHashes;
use datamap_core::session::MapSession;

pub type SharedSession = Arc<RwLock<MapSession>>;

/// How much of an earlier session a new request can take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReuseLevel {
    /// Search results and map vectors.
    Vectorize,
    /// Additionally the 2-D positions.
    Projection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReuseLookup {
    Miss,
    Found { session_id: String, level: ReuseLevel },
    /// An index pointed at a session that is gone.
    Missing { session_id: String },
}

pub struct MapCache {
    sessions: DashMap<String, SharedSession>,
    vectorize_index: DashMap<String, String>,
    projection_index: DashMap<String, String>,
    ttl: Duration,
    max_sessions: usize,
}

impl MapCache {
    pub fn new(settings: &MapSettings) -> Self {
        let ttl_secs = i64::try_from(settings.cache_ttl_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        Self {
            sessions: DashMap::new(),
            vectorize_index: DashMap::new(),
            projection_index: DashMap::new(),
            ttl: Duration::seconds(ttl_secs),
            max_sessions: settings.max_cached_sessions.max(1),
        }
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Cloned state for a poller; counts as an access.
    pub fn snapshot(&self, id: &str) -> Option<MapSession> {
        let shared = self.get(id)?;
        let mut session = shared.write();
        session.touch();
        Some(session.clone())
    }

    /// Insert or replace a session, then apply eviction.
    pub fn insert(&self, session: MapSession) -> SharedSession {
        let id = session.id.clone();
        let shared = Arc::new(RwLock::new(session));
        self.sessions.insert(id, Arc::clone(&shared));
        self.evict_expired();
        shared
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
        self.prune_indices();
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Make a finished session findable by its prefix hashes.
    pub fn register(&self, hashes: &StageHashes, session_id: &str) {
        self.vectorize_index.insert(hashes.vectorize.clone(), session_id.to_string());
        self.projection_index.insert(hashes.projection.clone(), session_id.to_string());
        tracing::debug!(session_id, "session registered for reuse");
    }

    /// Most specific reusable session first: projection, then vectorize.
    pub fn find_reusable(&self, hashes: &StageHashes) -> ReuseLookup {
        let mut missing = None;
        let probes = [
            (&self.projection_index, &hashes.projection, ReuseLevel::Projection),
            (&self.vectorize_index, &hashes.vectorize, ReuseLevel::Vectorize),
        ];
        for (index, hash, level) in probes {
            let Some(session_id) = index.get(hash).map(|e| e.value().clone()) else {
                continue;
            };
            if self.sessions.contains_key(&session_id) {
                return ReuseLookup::Found { session_id, level };
            }
            missing.get_or_insert(session_id);
        }
        missing.map_or(ReuseLookup::Miss, |session_id| ReuseLookup::Missing { session_id })
    }

    /// Drop finished sessions idle for longer than the TTL, then the least
    /// recently accessed finished ones above the size cap. Returns the number
    /// of evicted sessions.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        // (id, last access, finished)
        let mut entries: Vec<(String, chrono::DateTime<Utc>, bool)> = self
            .sessions
            .iter()
            .map(|e| {
                let s = e.value().read();
                (e.key().clone(), s.last_accessed, s.finished)
            })
            .collect();

        let mut evicted: Vec<String> = Vec::new();
        entries.retain(|(id, last, finished)| {
            let expired = *finished && now.signed_duration_since(*last) > self.ttl;
            if expired {
                evicted.push(id.clone());
            }
            !expired
        });
        if entries.len() > self.max_sessions {
            let mut finished: Vec<&(String, chrono::DateTime<Utc>, bool)> = entries.iter().filter(|e| e.2).collect();
            finished.sort_by_key(|e| e.1);
            let excess = entries.len() - self.max_sessions;
            evicted.extend(finished.into_iter().take(excess).map(|e| e.0.clone()));
        }

        for id in &evicted {
            self.sessions.remove(id);
        }
        if !evicted.is_empty() {
            self.prune_indices();
            tracing::debug!(evicted = evicted.len(), remaining = self.sessions.len(), "map cache eviction");
        }
        evicted.len()
    }

    fn prune_indices(&self) {
        self.vectorize_index.retain(|_, id| self.sessions.contains_key(id.as_str()));
        self.projection_index.retain(|_, id| self.sessions.contains_key(id.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamap_core::params::ParameterSet;

    fn settings(ttl: u64, max: usize) -> MapSettings {
        MapSettings { cache_ttl_secs: ttl, max_cached_sessions: max, ..MapSettings::default() }
    }

    fn finished(id: &str, idle_secs: i64) -> MapSession {
        let mut s = MapSession::new(id.to_string(), ParameterSet::default());
        s.finish();
        s.last_accessed = Utc::now() - Duration::seconds(idle_secs);
        s
    }

    fn hashes(v: &str, p: &str) -> StageHashes {
        StageHashes { search: "s".into(), vectorize: v.into(), projection: p.into(), session: "x".into() }
    }

    #[test]
    fn projection_match_beats_vectorize_match() {
        let cache = MapCache::new(&settings(3600, 10));
        cache.insert(finished("a", 0));
        cache.insert(finished("b", 0));
        cache.register(&hashes("v1", "p1"), "a");
        cache.register(&hashes("v2", "p2"), "b");

        assert_eq!(cache.find_reusable(&hashes("v1", "p2")), ReuseLookup::Found { session_id: "b".into(), level: ReuseLevel::Projection });
        assert_eq!(cache.find_reusable(&hashes("v1", "p9")), ReuseLookup::Found { session_id: "a".into(), level: ReuseLevel::Vectorize });
        assert_eq!(cache.find_reusable(&hashes("v9", "p9")), ReuseLookup::Miss);
    }

    #[test]
    fn index_entry_without_session_is_reported_missing() {
        let cache = MapCache::new(&settings(3600, 10));
        cache.register(&hashes("v1", "p1"), "gone");
        assert_eq!(cache.find_reusable(&hashes("v1", "p1")), ReuseLookup::Missing { session_id: "gone".into() });
    }

    #[test]
    fn ttl_and_lru_spare_running_sessions() {
        let cache = MapCache::new(&settings(60, 2));
        let mut running = MapSession::new("running".into(), ParameterSet::default());
        running.last_accessed = Utc::now() - Duration::seconds(600);
        cache.insert(running);
        cache.insert(finished("stale", 600));
        assert!(cache.get("stale").is_none());
        assert!(cache.get("running").is_some());

        cache.insert(finished("old", 30));
        cache.insert(finished("new", 1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some() && cache.get("running").is_some());
    }

    #[test]
    fn eviction_prunes_indices() {
        let cache = MapCache::new(&settings(60, 10));
        cache.insert(finished("a", 0));
        cache.register(&hashes("v1", "p1"), "a");
        if let Some(shared) = cache.get("a") {
            shared.write().last_accessed = Utc::now() - Duration::seconds(120);
        }
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.vectorize_index.is_empty() && cache.projection_index.is_empty());
    }
}
