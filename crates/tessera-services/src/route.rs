//! Route resolution — which transports reach an endpoint.
//!
//! [`RouteResolver`] keeps a cache from endpoint ref to transport refs. On a
//! miss it asks each [`RouteSource`] in registration order and caches the
//! union. Two sources ship with the crate:
//! - [`LocalServiceSource`]: endpoints served by this process
//! - [`RouteTable`]: routes learned from received bundles, pruned by age and
//!   optionally persisted as JSON

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tessera_core::{Ref, Route};

/// Unix seconds now.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Upper bound on learned (endpoint, transport) pairs.
pub const MAX_LEARNED_ROUTES: usize = 4096;

pub trait RouteSource: Send + Sync {
    fn routes_for(&self, endpoint: &Ref) -> Vec<Route>;
}

// ── Local services ────────────────────────────────────────────────────────────

/// Endpoints this process serves itself.
#[derive(Default)]
pub struct LocalServiceSource {
    endpoints: DashMap<Ref, HashSet<Ref>>,
}

impl LocalServiceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: Ref, transport: Ref) {
        self.endpoints.entry(endpoint).or_default().insert(transport);
    }
}

impl RouteSource for LocalServiceSource {
    fn routes_for(&self, endpoint: &Ref) -> Vec<Route> {
        let now = unix_now();
        self.endpoints
            .get(endpoint)
            .map(|transports| {
                transports
                    .iter()
                    .map(|t| Route {
                        endpoint_ref: endpoint.clone(),
                        transport_ref: t.clone(),
                        available_at: now,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Route table ───────────────────────────────────────────────────────────────

/// Learned routes: endpoint → transport → last seen (unix seconds).
///
/// When constructed with a persist path, the table is written to disk on
/// every mutation and reloaded on startup.
pub struct RouteTable {
    routes: DashMap<Ref, HashMap<Ref, u64>>,
    persist_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct PersistedRoute {
    endpoint: Ref,
    transport: Ref,
    available_at: u64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            persist_path: None,
        }
    }

    /// Create a table that persists to the given file path.
    /// Loads existing routes from disk if the file exists.
    pub fn with_persistence(path: PathBuf) -> Self {
        let table = Self {
            routes: DashMap::new(),
            persist_path: Some(path),
        };
        table.load_from_disk();
        table
    }

    /// Record routes, keeping the newest `available_at` per pair.
    ///
    /// Timestamps are clamped to the local clock and the table stops
    /// growing at [`MAX_LEARNED_ROUTES`]. Returns how many routes were added
    /// or refreshed; the file is rewritten only when that is non-zero.
    pub fn learn(&self, routes: &[Route]) -> usize {
        if routes.is_empty() {
            return 0;
        }
        let now = unix_now();
        let mut count = self.len();
        let mut changed = 0;
        let mut dropped = 0;
        for route in routes {
            let available_at = route.available_at.min(now);
            if count >= MAX_LEARNED_ROUTES && !self.knows(route) {
                dropped += 1;
                continue;
            }
            let mut transports = self.routes.entry(route.endpoint_ref.clone()).or_default();
            match transports.get_mut(&route.transport_ref) {
                Some(seen) if *seen >= available_at => {}
                Some(seen) => {
                    *seen = available_at;
                    changed += 1;
                }
                None => {
                    transports.insert(route.transport_ref.clone(), available_at);
                    count += 1;
                    changed += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, limit = MAX_LEARNED_ROUTES, "route table full, routes not learned");
        }
        if changed > 0 {
            self.save_to_disk();
        }
        changed
    }

    fn knows(&self, route: &Route) -> bool {
        self.routes
            .get(&route.endpoint_ref)
            .is_some_and(|t| t.contains_key(&route.transport_ref))
    }

    /// Drop routes not seen within `ttl_secs` of `now`. Returns how many went.
    pub fn prune(&self, now: u64, ttl_secs: u64) -> usize {
        let cutoff = now.saturating_sub(ttl_secs);
        let mut removed = 0;
        self.routes.retain(|_, transports| {
            let before = transports.len();
            transports.retain(|_, available_at| *available_at >= cutoff);
            removed += before - transports.len();
            !transports.is_empty()
        });
        if removed > 0 {
            tracing::debug!(removed, "pruned stale routes");
            self.save_to_disk();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.routes.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Serialize all routes to disk as JSON. Best-effort; logs on failure.
    fn save_to_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let snapshot: Vec<PersistedRoute> = self
            .routes
            .iter()
            .flat_map(|entry| {
                let endpoint = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(move |(transport, available_at)| PersistedRoute {
                        endpoint: endpoint.clone(),
                        transport: transport.clone(),
                        available_at: *available_at,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist routes");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize routes");
            }
        }
    }

    /// Load routes from disk. Called once during construction.
    fn load_from_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read routes");
                return;
            }
        };
        let loaded: Vec<PersistedRoute> = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse routes");
                return;
            }
        };
        for route in &loaded {
            self.routes
                .entry(route.endpoint.clone())
                .or_default()
                .insert(route.transport.clone(), route.available_at);
        }
        if !loaded.is_empty() {
            tracing::info!(count = loaded.len(), path = %path.display(), "loaded persisted routes");
        }
    }
}

impl RouteSource for RouteTable {
    fn routes_for(&self, endpoint: &Ref) -> Vec<Route> {
        self.routes
            .get(endpoint)
            .map(|transports| {
                transports
                    .iter()
                    .map(|(t, available_at)| Route {
                        endpoint_ref: endpoint.clone(),
                        transport_ref: t.clone(),
                        available_at: *available_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Resolver ──────────────────────────────────────────────────────────────────

pub struct RouteResolver {
    cache: DashMap<Ref, HashSet<Ref>>,
    local: Arc<LocalServiceSource>,
    table: Arc<RouteTable>,
    sources: Vec<Arc<dyn RouteSource>>,
}

impl RouteResolver {
    /// Local services are consulted first, then the learned table, then any
    /// sources added later.
    pub fn new(table: Arc<RouteTable>) -> Self {
        let local = Arc::new(LocalServiceSource::new());
        Self {
            cache: DashMap::new(),
            sources: vec![local.clone(), table.clone()],
            local,
            table,
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn RouteSource>) {
        self.sources.push(source);
    }

    pub fn local(&self) -> &Arc<LocalServiceSource> {
        &self.local
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Transports known to reach `endpoint`. Empty if none.
    pub fn resolve(&self, endpoint: &Ref) -> HashSet<Ref> {
        if let Some(hit) = self.cache.get(endpoint) {
            tracing::trace!(endpoint = %endpoint.short(), "route cache hit");
            return hit.value().clone();
        }
        let found: HashSet<Ref> = self
            .sources
            .iter()
            .flat_map(|s| s.routes_for(endpoint))
            .map(|r| r.transport_ref)
            .collect();
        if !found.is_empty() {
            self.cache
                .entry(endpoint.clone())
                .or_default()
                .extend(found.iter().cloned());
        }
        found
    }

    /// Every route any source knows for `endpoint`, with timestamps. Used
    /// when folding routes into outgoing bundles.
    pub fn routes_for(&self, endpoint: &Ref) -> Vec<Route> {
        let mut seen = HashSet::new();
        self.sources
            .iter()
            .flat_map(|s| s.routes_for(endpoint))
            .filter(|r| seen.insert(r.transport_ref.clone()))
            .collect()
    }

    /// Register an endpoint served by this process.
    pub fn register_local(&self, endpoint: Ref, transport: Ref) {
        self.local.register(endpoint.clone(), transport);
        self.cache.remove(&endpoint);
    }

    /// Learn routes from a received bundle.
    pub fn learn(&self, routes: &[Route]) {
        if self.table.learn(routes) == 0 {
            return;
        }
        for route in routes.iter().filter(|r| self.table.knows(r)) {
            if let Some(mut cached) = self.cache.get_mut(&route.endpoint_ref) {
                cached.insert(route.transport_ref.clone());
            }
        }
    }

    /// Prune the learned table and forget cached answers.
    pub fn prune(&self, now: u64, ttl_secs: u64) -> usize {
        let removed = self.table.prune(now, ttl_secs);
        if removed > 0 {
            self.cache.clear();
        }
        removed
    }
}
