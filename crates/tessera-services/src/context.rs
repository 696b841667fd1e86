//! Everything one node shares between its connections.
//!
//! Registries are plain owned values; a [`Context`] is built once and handed
//! around behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use tessera_core::config::TesseraConfig;
use tessera_core::crypto::PublicKey;
use tessera_core::Ref;

use crate::builtins::Builtins;
use crate::cache::CapsuleCache;
use crate::collector::{CollectError, Collection, Collector};
use crate::mosaic::Mosaic;
use crate::route::{RouteResolver, RouteTable};
use crate::servant::{ActorRegistry, NamedServants};
use crate::types::{Type, TypeError, TypeSystem};
use crate::value::Value;
use crate::web::{ResolveError, Web};

/// Tunables read from [`TesseraConfig`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_depth: usize,
    pub rpc_timeout: Duration,
    pub max_pending: usize,
    pub pending_ttl: Duration,
    pub allow_plain: bool,
    pub route_ttl_secs: u64,
}

impl Settings {
    pub fn from_config(config: &TesseraConfig) -> Self {
        Self {
            max_depth: config.collector.max_depth,
            rpc_timeout: config.rpc.timeout(),
            max_pending: config.session.max_pending_requests,
            pending_ttl: config.session.pending_ttl(),
            allow_plain: config.network.allow_plain,
            route_ttl_secs: config.routes.route_ttl_secs,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&TesseraConfig::default())
    }
}

pub struct Context {
    pub web: Web,
    pub types: TypeSystem,
    pub builtins: Builtins,
    pub routes: RouteResolver,
    pub actors: ActorRegistry,
    pub settings: Settings,
}

impl Context {
    pub fn new(mosaic: Arc<Mosaic>, routes: RouteResolver, settings: Settings) -> Result<Self, TypeError> {
        let web = Web::new(mosaic);
        let types = TypeSystem::new();
        let builtins = Builtins::register(&web, &types)?;
        Ok(Self {
            web,
            types,
            builtins,
            routes,
            actors: ActorRegistry::new(),
            settings,
        })
    }

    /// Memory-only store and route table.
    pub fn in_memory(settings: Settings) -> Result<Self, TypeError> {
        Self::new(
            Arc::new(Mosaic::in_memory()),
            RouteResolver::new(Arc::new(RouteTable::new())),
            settings,
        )
    }

    /// Store and route table as configured, persisted if asked.
    pub fn from_config(config: &TesseraConfig) -> Result<Self> {
        let (mosaic, table) = if config.store.persist {
            let cache = CapsuleCache::new(&config.store.cache_path)?;
            tracing::info!(root = %config.store.cache_path.display(), "capsule cache initialized");
            if let Some(parent) = config.routes.table_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create route table dir: {}", parent.display())
                })?;
            }
            (
                Mosaic::with_cache(cache),
                RouteTable::with_persistence(config.routes.table_path.clone()),
            )
        } else {
            (Mosaic::in_memory(), RouteTable::new())
        };
        let routes = RouteResolver::new(Arc::new(table));
        Self::new(Arc::new(mosaic), routes, Settings::from_config(config))
            .context("failed to register builtin types")
    }

    pub fn mosaic(&self) -> &Arc<Mosaic> {
        self.web.mosaic()
    }

    /// Store `value` under `t` in the local Mosaic.
    pub fn put(&self, value: &Value, t: &Arc<Type>) -> Result<Ref, ResolveError> {
        self.mosaic().put(&self.web, &self.types, value, t)
    }

    pub fn summon(&self, r: &Ref) -> Result<Value, ResolveError> {
        self.web.summon(&self.types, r)
    }

    /// Bundle everything reachable from `roots` through `web`, routes
    /// included.
    pub fn collect(&self, web: &Web, roots: &[Ref]) -> Result<Collection, CollectError> {
        Collector::new(web, &self.types, self.settings.max_depth)
            .with_routes(&self.routes)
            .collect(roots)
    }

    pub fn put_peer(&self, key: &PublicKey) -> Result<Ref, ResolveError> {
        self.builtins.put_peer(&self.web, &self.types, key)
    }

    pub fn put_servant_ref(&self, peer: &Ref, name: &str) -> Result<Ref, ResolveError> {
        self.builtins.put_servant_ref(&self.web, &self.types, peer, name)
    }

    /// Announce that `peer` is reachable over TCP at `host:port`.
    pub fn register_tcp_route(&self, peer: &Ref, host: &str, port: u16) -> Result<Ref, ResolveError> {
        let transport = self
            .builtins
            .put_tcp_transport(&self.web, &self.types, host, port)?;
        self.routes.register_local(peer.clone(), transport.clone());
        Ok(transport)
    }

    /// Host named servants for `local_peer`. Calls to `servant_ref` targets
    /// naming this peer are dispatched to the returned set.
    pub fn host_servants(&self, local_peer: Ref) -> Arc<NamedServants> {
        let servants = Arc::new(NamedServants::new(local_peer));
        self.actors
            .register_actor(self.builtins.servant_ref.type_ref.clone(), servants.clone());
        servants
    }

    /// Drop learned routes past their TTL.
    pub fn prune_routes(&self) -> usize {
        self.routes
            .prune(crate::route::unix_now(), self.settings.route_ttl_secs)
    }
}
