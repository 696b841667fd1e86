//! Servants and the actor registry.
//!
//! A call target is a capsule. Its type ref picks an [`ActorFactory`], and
//! the factory turns the decoded target value into the [`Servant`] that
//! handles the call. Dispatch is keyed by type ref, never by Rust type.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;

use tessera_core::Ref;

use crate::types::{Type, TypeSystem};
use crate::value::Value;

/// One decoded keyword argument.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub value: Value,
    pub t: Arc<Type>,
}

/// Everything a servant sees of an incoming request.
pub struct Call<'a> {
    pub params: &'a [Param],
    /// `peer` ref the caller identified itself with, if any.
    pub sender_peer_ref: Option<&'a Ref>,
    pub types: &'a TypeSystem,
}

impl Call<'_> {
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// String argument `name`, or an error naming what was wrong.
    pub fn str_param(&self, name: &str) -> Result<&str> {
        let p = self
            .param(name)
            .ok_or_else(|| anyhow!("missing parameter {name:?}"))?;
        p.value
            .as_str()
            .ok_or_else(|| anyhow!("parameter {name:?} is {}, expected string", p.t))
    }
}

/// A servant's result and the type to store it under.
#[derive(Debug, Clone)]
pub struct Reply {
    pub value: Value,
    pub t: Arc<Type>,
}

/// Handles calls addressed to one target.
///
/// Invoked on the blocking thread pool, so it may block. A panic becomes an
/// internal-error response.
pub trait Servant: Send + Sync {
    fn invoke(&self, call: &Call<'_>) -> Result<Reply>;
}

/// Builds the servant for a target value of the type it is registered for.
pub trait ActorFactory: Send + Sync {
    fn create(&self, target: &Value) -> Result<Arc<dyn Servant>>;
}

impl<F> ActorFactory for F
where
    F: Fn(&Value) -> Result<Arc<dyn Servant>> + Send + Sync,
{
    fn create(&self, target: &Value) -> Result<Arc<dyn Servant>> {
        self(target)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Type ref → factory.
#[derive(Default)]
pub struct ActorRegistry {
    factories: DashMap<Ref, Arc<dyn ActorFactory>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for targets of `type_ref`. Replaces any earlier
    /// registration.
    pub fn register_actor(&self, type_ref: Ref, factory: Arc<dyn ActorFactory>) {
        tracing::debug!(type_ref = %type_ref.short(), "actor registered");
        self.factories.insert(type_ref, factory);
    }

    /// The servant for a target of `type_ref`.
    pub fn resolve(&self, type_ref: &Ref, target: &Value) -> Result<Arc<dyn Servant>> {
        let factory = self
            .factories
            .get(type_ref)
            .map(|f| f.value().clone())
            .ok_or_else(|| anyhow!("no actor registered for type {type_ref}"))?;
        factory.create(target)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

// ── Named servants ────────────────────────────────────────────────────────────

/// Factory for `servant_ref{peer, name}` targets: servants hosted by this
/// node, looked up by name.
pub struct NamedServants {
    local_peer: Ref,
    servants: DashMap<String, Arc<dyn Servant>>,
}

impl NamedServants {
    pub fn new(local_peer: Ref) -> Self {
        Self {
            local_peer,
            servants: DashMap::new(),
        }
    }

    pub fn insert(&self, name: impl Into<String>, servant: Arc<dyn Servant>) {
        let name = name.into();
        tracing::info!(name, "servant registered");
        self.servants.insert(name, servant);
    }

    pub fn names(&self) -> Vec<String> {
        self.servants.iter().map(|e| e.key().clone()).collect()
    }
}

impl ActorFactory for NamedServants {
    fn create(&self, target: &Value) -> Result<Arc<dyn Servant>> {
        let peer = target
            .field("peer")
            .and_then(Value::as_ref_value)
            .ok_or_else(|| anyhow!("servant_ref without a peer"))?;
        if *peer != self.local_peer {
            bail!("servant_ref names peer {}, not this node", peer.short());
        }
        let name = target
            .field("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("servant_ref without a name"))?;
        self.servants
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| anyhow!("no servant named {name:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;
    use tessera_core::HashAlgorithm;

    struct Upper;

    impl Servant for Upper {
        fn invoke(&self, call: &Call<'_>) -> Result<Reply> {
            let s = call.str_param("s")?;
            Ok(Reply {
                value: Value::String(s.to_uppercase()),
                t: call.types.primitive(Primitive::String),
            })
        }
    }

    fn peer() -> Ref {
        Ref::for_bytes(HashAlgorithm::Blake3, b"peer")
    }

    fn target(peer: Ref, name: &str) -> Value {
        Value::record([
            ("peer", Value::Ref(peer)),
            ("name", Value::String(name.into())),
        ])
    }

    #[test]
    fn named_servant_is_found_and_invoked() {
        let types = TypeSystem::new();
        let named = NamedServants::new(peer());
        named.insert("upper", Arc::new(Upper));

        let servant = named.create(&target(peer(), "upper")).unwrap();
        let params = [Param {
            name: "s".into(),
            value: Value::String("hi".into()),
            t: types.primitive(Primitive::String),
        }];
        let reply = servant
            .invoke(&Call {
                params: &params,
                sender_peer_ref: None,
                types: &types,
            })
            .unwrap();
        assert_eq!(reply.value, Value::String("HI".into()));
    }

    #[test]
    fn foreign_peer_and_unknown_name_are_refused() {
        let named = NamedServants::new(peer());
        named.insert("upper", Arc::new(Upper));
        let other = Ref::for_bytes(HashAlgorithm::Blake3, b"other");
        assert!(named.create(&target(other, "upper")).is_err());
        assert!(named.create(&target(peer(), "lower")).is_err());
    }

    #[test]
    fn registry_dispatches_by_type_ref() {
        let registry = ActorRegistry::new();
        let type_ref = Ref::for_bytes(HashAlgorithm::Blake3, b"servant type");
        let factory = |_: &Value| -> Result<Arc<dyn Servant>> { Ok(Arc::new(Upper)) };
        registry.register_actor(type_ref.clone(), Arc::new(factory));

        assert!(registry.resolve(&type_ref, &Value::None).is_ok());
        let err = registry
            .resolve(&Primitive::String.type_ref(), &Value::None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("no actor registered"));
    }

    #[test]
    fn missing_param_is_reported_by_name() {
        let types = TypeSystem::new();
        let err = Upper
            .invoke(&Call {
                params: &[],
                sender_peer_ref: None,
                types: &types,
            })
            .unwrap_err();
        assert!(err.to_string().contains("\"s\""));
    }
}
