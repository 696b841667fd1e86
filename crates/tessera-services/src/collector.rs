//! Reference collector.
//!
//! Walks everything reachable from a set of root refs, breadth first, and
//! packs it into a [`Bundle`] the receiver can decode without asking for
//! anything else. Phony refs are skipped: they name built-ins every node
//! already has. Missing refs are logged and counted, and the walk carries
//! on, so a partial bundle is still produced.

use std::collections::HashSet;

use tessera_core::message::rpc_message_type_ref;
use tessera_core::meta::meta_type_ref;
use tessera_core::{Bundle, Capsule, MetaType, Ref, RpcMessage};

use crate::route::RouteResolver;
use crate::types::TypeSystem;
use crate::web::Web;

pub struct Collector<'a> {
    web: &'a Web,
    types: &'a TypeSystem,
    routes: Option<&'a RouteResolver>,
    max_depth: usize,
}

/// A collected bundle and how many reachable refs could not be found.
#[derive(Debug)]
pub struct Collection {
    pub bundle: Bundle,
    pub missing: usize,
}

impl<'a> Collector<'a> {
    pub fn new(web: &'a Web, types: &'a TypeSystem, max_depth: usize) -> Self {
        Self {
            web,
            types,
            routes: None,
            max_depth,
        }
    }

    /// Fold known routes of every collected ref into the bundle.
    pub fn with_routes(mut self, routes: &'a RouteResolver) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn collect(&self, roots: &[Ref]) -> Result<Collection, CollectError> {
        let mut seen: HashSet<Ref> = HashSet::new();
        let mut seen_routes = HashSet::new();
        let mut bundle = Bundle {
            roots: roots.to_vec(),
            ..Bundle::default()
        };
        let mut missing = 0usize;
        let mut frontier: Vec<Ref> = roots.to_vec();
        let mut depth = 0usize;

        while !frontier.is_empty() {
            if depth > self.max_depth {
                return Err(CollectError::RecursionLimitExceeded {
                    max_depth: self.max_depth,
                });
            }
            let mut next = Vec::new();
            for r in frontier {
                if r.is_phony() || !seen.insert(r.clone()) {
                    continue;
                }
                let capsule = match self.web.resolve_ref(&r) {
                    Ok(c) => c,
                    Err(_) => {
                        missing += 1;
                        tracing::warn!(r = %r, "collector: ref not found, bundle will be partial");
                        continue;
                    }
                };
                next.extend(
                    self.refs_of(&r, &capsule)
                        .into_iter()
                        .filter(|c| !c.is_phony() && !seen.contains(c)),
                );
                if let Some(routes) = self.routes {
                    for route in routes.routes_for(&r) {
                        next.push(route.transport_ref.clone());
                        if seen_routes.insert((route.endpoint_ref.clone(), route.transport_ref.clone())) {
                            bundle.route_list.push(route);
                        }
                    }
                }
                bundle.capsule_list.push(capsule);
            }
            frontier = next;
            depth += 1;
        }

        tracing::debug!(
            roots = roots.len(),
            capsules = bundle.capsule_list.len(),
            routes = bundle.route_list.len(),
            missing,
            "collected bundle"
        );
        Ok(Collection { bundle, missing })
    }

    /// Every ref a capsule mentions: its type, plus whatever its payload
    /// embeds.
    fn refs_of(&self, r: &Ref, capsule: &Capsule) -> Vec<Ref> {
        let mut out = vec![capsule.type_ref.clone()];
        if capsule.type_ref == meta_type_ref() {
            match MetaType::from_capsule(capsule) {
                Ok(meta) => out.extend(meta.refs()),
                Err(e) => tracing::warn!(r = %r.short(), error = %e, "undecodable meta-type"),
            }
        } else if capsule.type_ref == rpc_message_type_ref() {
            match RpcMessage::from_capsule(capsule) {
                Ok(msg) => out.extend(msg.refs()),
                Err(e) => tracing::warn!(r = %r.short(), error = %e, "undecodable rpc message"),
            }
        } else {
            let decoded = self
                .types
                .resolve(self.web, &capsule.type_ref)
                .map_err(|e| e.to_string())
                .and_then(|t| {
                    self.web
                        .decode(self.types, &capsule.encoded_object, &t)
                        .map_err(|e| e.to_string())
                });
            match decoded {
                Ok(value) => value.visit_refs(&mut |child| out.push(child.clone())),
                Err(e) => tracing::debug!(r = %r.short(), error = %e, "payload refs not scanned"),
            }
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("reference graph deeper than {max_depth} levels")]
    RecursionLimitExceeded { max_depth: usize },
}
