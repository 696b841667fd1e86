//! Web — the resolver chain.
//!
//! A ref is looked up in the local [`Mosaic`] first, then in each registered
//! [`RefSource`] in order. The first hit wins and is not copied into the
//! Mosaic: capsules that arrived in a request bundle stay scoped to that
//! request unless someone stores them explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_core::codec::CodecError;
use tessera_core::{Bundle, Capsule, HashAlgorithm, Ref};

use crate::mosaic::Mosaic;
use crate::types::{Type, TypeError, TypeSystem};
use crate::value::Value;

/// Somewhere capsules can come from besides the local store.
pub trait RefSource: Send + Sync {
    fn resolve_ref(&self, r: &Ref) -> Option<Capsule>;
}

#[derive(Clone)]
pub struct Web {
    mosaic: Arc<Mosaic>,
    sources: Vec<Arc<dyn RefSource>>,
}

impl Web {
    pub fn new(mosaic: Arc<Mosaic>) -> Self {
        Self {
            mosaic,
            sources: Vec::new(),
        }
    }

    /// Append a source. Sources are consulted in the order added.
    pub fn add_source(&mut self, source: Arc<dyn RefSource>) {
        self.sources.push(source);
    }

    /// A copy of this chain that consults `source` right after the Mosaic.
    /// The original chain is untouched.
    pub fn with_source(&self, source: Arc<dyn RefSource>) -> Self {
        let mut sources = Vec::with_capacity(self.sources.len() + 1);
        sources.push(source);
        sources.extend(self.sources.iter().cloned());
        Self {
            mosaic: self.mosaic.clone(),
            sources,
        }
    }

    pub fn mosaic(&self) -> &Arc<Mosaic> {
        &self.mosaic
    }

    pub fn resolve_ref(&self, r: &Ref) -> Result<Capsule, ResolveError> {
        if let Some(capsule) = self.mosaic.get(r) {
            return Ok(capsule);
        }
        self.sources
            .iter()
            .find_map(|s| s.resolve_ref(r))
            .ok_or_else(|| ResolveError::UnresolvedRef(r.clone()))
    }

    /// Resolve and decode the value behind `r`.
    pub fn summon(&self, types: &TypeSystem, r: &Ref) -> Result<Value, ResolveError> {
        self.summon_with_t(types, r).map(|(v, _)| v)
    }

    /// Like [`summon`](Self::summon), also returning the value's type.
    pub fn summon_with_t(
        &self,
        types: &TypeSystem,
        r: &Ref,
    ) -> Result<(Value, Arc<Type>), ResolveError> {
        let capsule = self.resolve_ref(r)?;
        // A capsule's type must resolve before its payload is touched.
        let t = types.resolve(self, &capsule.type_ref)?;
        let value = self.decode(types, &capsule.encoded_object, &t)?;
        Ok((value, t))
    }

    /// Decode a payload of type `t`, resolving variant classes through this
    /// chain.
    pub fn decode(&self, types: &TypeSystem, bytes: &[u8], t: &Type) -> Result<Value, ResolveError> {
        let lookup = |r: &Ref| types.resolve(self, r);
        Ok(Value::decode(bytes, t, &lookup)?)
    }
}

// ── Bundle source ─────────────────────────────────────────────────────────────

/// Resolves refs from the capsules of one received bundle.
pub struct BundleSource {
    capsules: HashMap<Ref, Capsule>,
}

impl BundleSource {
    /// Index a bundle's capsules under both content algorithms, so refs made
    /// by either resolve.
    pub fn new(bundle: &Bundle) -> Self {
        Self::from_capsules(&bundle.capsule_list)
    }

    pub fn from_capsules<'a>(list: impl IntoIterator<Item = &'a Capsule>) -> Self {
        let mut capsules = HashMap::new();
        for capsule in list {
            for alg in [HashAlgorithm::Blake3, HashAlgorithm::Sha512] {
                match capsule.make_ref(alg) {
                    Ok(r) => {
                        capsules.insert(r, capsule.clone());
                    }
                    Err(e) => tracing::warn!(error = %e, "bundle capsule cannot be hashed, skipped"),
                }
            }
        }
        Self { capsules }
    }

    pub fn contains(&self, r: &Ref) -> bool {
        self.capsules.contains_key(r)
    }
}

impl RefSource for BundleSource {
    fn resolve_ref(&self, r: &Ref) -> Option<Capsule> {
        self.capsules.get(r).cloned()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unresolved ref {0}")]
    UnresolvedRef(Ref),

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;

    struct MapSource(HashMap<Ref, Capsule>);

    impl RefSource for MapSource {
        fn resolve_ref(&self, r: &Ref) -> Option<Capsule> {
            self.0.get(r).cloned()
        }
    }

    fn string_capsule(s: &str) -> (Ref, Capsule) {
        let c = Capsule::new(
            Primitive::String.type_ref(),
            tessera_core::codec::encode(s).unwrap(),
        );
        (c.make_ref(HashAlgorithm::Blake3).unwrap(), c)
    }

    #[test]
    fn summon_roundtrips_put() {
        let mosaic = Arc::new(Mosaic::in_memory());
        let web = Web::new(mosaic.clone());
        let types = TypeSystem::new();
        let v = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let t = types.deduce(&v).unwrap();

        let r = mosaic.put(&web, &types, &v, &t).unwrap();
        let (back, back_t) = web.summon_with_t(&types, &r).unwrap();
        assert_eq!(back, v);
        assert!(Arc::ptr_eq(&back_t, &t) || *back_t == *t);
    }

    #[test]
    fn sources_are_consulted_in_order_and_not_cached() {
        let mosaic = Arc::new(Mosaic::in_memory());
        let (r, c) = string_capsule("from source");
        let mut web = Web::new(mosaic.clone());
        web.add_source(Arc::new(MapSource(HashMap::from([(r.clone(), c.clone())]))));

        assert_eq!(web.resolve_ref(&r).unwrap(), c);
        assert!(!mosaic.contains(&r));
        assert_eq!(
            web.summon(&TypeSystem::new(), &r).unwrap(),
            Value::String("from source".into())
        );
    }

    #[test]
    fn layered_source_does_not_leak_into_the_parent() {
        let mosaic = Arc::new(Mosaic::in_memory());
        let web = Web::new(mosaic);
        let (r, c) = string_capsule("scoped");
        let bundle = Bundle {
            roots: vec![r.clone()],
            capsule_list: vec![c],
            route_list: vec![],
        };

        let scoped = web.with_source(Arc::new(BundleSource::new(&bundle)));
        assert!(scoped.resolve_ref(&r).is_ok());
        assert!(matches!(
            web.resolve_ref(&r),
            Err(ResolveError::UnresolvedRef(_))
        ));
    }

    #[test]
    fn bundle_source_answers_sha512_refs() {
        let (_, c) = string_capsule("either");
        let sha = c.make_ref(HashAlgorithm::Sha512).unwrap();
        let source = BundleSource::new(&Bundle {
            roots: vec![],
            capsule_list: vec![c.clone()],
            route_list: vec![],
        });
        assert_eq!(source.resolve_ref(&sha), Some(c));
    }

    #[test]
    fn unresolvable_type_blocks_decoding() {
        let mosaic = Arc::new(Mosaic::in_memory());
        let web = Web::new(mosaic.clone());
        let unknown_type = Ref::for_bytes(HashAlgorithm::Blake3, b"no such type");
        let r = mosaic.put_capsule(Capsule::new(unknown_type, vec![0xc0])).unwrap();
        assert!(matches!(
            web.summon(&TypeSystem::new(), &r),
            Err(ResolveError::Type(TypeError::Unresolved(_)))
        ));
    }
}
