//! Mosaic — the local content-addressed capsule store.
//!
//! In-memory map from ref to capsule, optionally backed by the on-disk
//! [`CapsuleCache`]. Reads fall through to disk on a memory miss; writes go
//! to both. Concurrent puts of the same content are harmless: the first
//! writer wins and every later put returns the same ref.

use std::sync::Arc;

use dashmap::DashMap;

use tessera_core::codec;
use tessera_core::{Capsule, HashAlgorithm, Ref};

use crate::cache::CapsuleCache;
use crate::types::{Type, TypeSystem};
use crate::value::Value;
use crate::web::{ResolveError, Web};

pub struct Mosaic {
    capsules: DashMap<Ref, Capsule>,
    disk: Option<CapsuleCache>,
}

impl Mosaic {
    pub fn in_memory() -> Self {
        Self {
            capsules: DashMap::new(),
            disk: None,
        }
    }

    pub fn with_cache(cache: CapsuleCache) -> Self {
        Self {
            capsules: DashMap::new(),
            disk: Some(cache),
        }
    }

    /// Store a capsule and return its ref.
    pub fn put_capsule(&self, capsule: Capsule) -> Result<Ref, codec::CodecError> {
        let r = capsule.make_ref(HashAlgorithm::default())?;
        self.insert(r.clone(), capsule);
        Ok(r)
    }

    /// Store a capsule under a ref computed elsewhere, e.g. one received in a
    /// bundle under a non-default algorithm. The ref is verified.
    pub fn put_capsule_as(&self, r: &Ref, capsule: Capsule) -> bool {
        if r.is_phony() || capsule.make_ref(r.hash_algorithm).ok().as_ref() != Some(r) {
            tracing::warn!(r = %r, "capsule does not hash to its claimed ref");
            return false;
        }
        self.insert(r.clone(), capsule);
        true
    }

    fn insert(&self, r: Ref, capsule: Capsule) {
        if self.capsules.contains_key(&r) {
            return;
        }
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.put(&r, &capsule) {
                tracing::warn!(r = %r.short(), error = %e, "failed to persist capsule");
            }
        }
        self.capsules.entry(r).or_insert(capsule);
    }

    /// Capsule for `r`, from memory or disk.
    pub fn get(&self, r: &Ref) -> Option<Capsule> {
        if let Some(c) = self.capsules.get(r) {
            return Some(c.value().clone());
        }
        let disk = self.disk.as_ref()?;
        match disk.get(r) {
            Ok(Some(capsule)) => {
                tracing::trace!(r = %r.short(), "capsule loaded from disk");
                self.capsules.entry(r.clone()).or_insert(capsule.clone());
                Some(capsule)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(r = %r.short(), error = %e, "failed to read cached capsule");
                None
            }
        }
    }

    pub fn resolve_ref(&self, r: &Ref) -> Result<Capsule, ResolveError> {
        self.get(r).ok_or_else(|| ResolveError::UnresolvedRef(r.clone()))
    }

    pub fn contains(&self, r: &Ref) -> bool {
        self.capsules.contains_key(r) || self.disk.as_ref().is_some_and(|d| d.has(r))
    }

    /// Number of capsules held in memory.
    pub fn len(&self) -> usize {
        self.capsules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capsules.is_empty()
    }

    /// Encode `value` under `t`, store it and return its ref.
    ///
    /// `t` is registered with `types` first if it is not already, so the
    /// capsule's type ref always resolves.
    pub fn put(
        &self,
        web: &Web,
        types: &TypeSystem,
        value: &Value,
        t: &Arc<Type>,
    ) -> Result<Ref, ResolveError> {
        let lookup = |r: &Ref| types.resolve(web, r);
        value.validate(t, &lookup)?;
        let type_ref = types.ref_for(web, t)?;
        let encoded = codec::encode(value)?;
        Ok(self.put_capsule(Capsule::new(type_ref, encoded))?)
    }
}
