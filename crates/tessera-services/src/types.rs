//! Runtime type system.
//!
//! Types are capsules too: a type ref points at a `MetaType` record, which
//! is turned into a structural [`Type`] by the factory registered for its
//! tag. Nested type refs are resolved recursively and every result is
//! memoized in both directions, so resolving the same ref twice yields the
//! same `Arc`, and a resolved type can be mapped back to its ref.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use tessera_core::codec::CodecError;
use tessera_core::meta::meta_type_ref;
use tessera_core::{MetaField, MetaType, Ref};

use crate::value::Value;
use crate::web::Web;

// ── Structural types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    None,
    Bool,
    Int,
    String,
    Bytes,
    Ref,
}

impl Primitive {
    pub const ALL: [Primitive; 6] = [
        Self::None,
        Self::Bool,
        Self::Int,
        Self::String,
        Self::Bytes,
        Self::Ref,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Ref => "ref",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Phony ref naming this primitive. Identical on every node.
    pub fn type_ref(&self) -> Ref {
        Ref::phony(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub t: Arc<Type>,
}

/// Record with its base's fields already flattened in front.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordType {
    pub name: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HierarchyType {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassType {
    /// Always a `Type::Hierarchy`.
    pub hierarchy: Arc<Type>,
    pub id: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(Primitive),
    Optional(Arc<Type>),
    List(Arc<Type>),
    Record(RecordType),
    Hierarchy(HierarchyType),
    Class(ClassType),
}

impl Type {
    /// Fields of a record or class value, in encoding order.
    pub fn fields(&self) -> Option<&[Field]> {
        match self {
            Self::Record(r) => Some(&r.fields),
            Self::Class(c) => Some(&c.fields),
            _ => None,
        }
    }

    /// Types whose values can encode as nil. An optional of one of these
    /// could not tell "absent" from "present and nil".
    pub fn is_nullable(&self) -> bool {
        matches!(self, Self::Optional(_) | Self::Primitive(Primitive::None))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => f.write_str(p.name()),
            Self::Optional(t) => write!(f, "optional<{t}>"),
            Self::List(t) => write!(f, "list<{t}>"),
            Self::Record(r) => write!(f, "record {}", r.name),
            Self::Hierarchy(h) => write!(f, "hierarchy {}", h.name),
            Self::Class(c) => match c.hierarchy.as_ref() {
                Type::Hierarchy(h) => write!(f, "class {}.{}", h.name, c.id),
                _ => write!(f, "class {}", c.id),
            },
        }
    }
}

// ── Factories ─────────────────────────────────────────────────────────────────

/// Builds a structural type from one kind of meta-type record.
pub trait TypeFactory: Send + Sync {
    fn build(&self, types: &TypeSystem, web: &Web, meta: &MetaType) -> Result<Type, TypeError>;
}

struct PrimitiveFactory;
struct OptionalFactory;
struct ListFactory;
struct RecordFactory;
struct HierarchyFactory;
struct ClassFactory;

impl TypeFactory for PrimitiveFactory {
    fn build(&self, _: &TypeSystem, _: &Web, meta: &MetaType) -> Result<Type, TypeError> {
        let MetaType::Primitive { name } = meta else {
            return Err(TypeError::wrong_tag("primitive", meta));
        };
        Primitive::from_name(name)
            .map(Type::Primitive)
            .ok_or_else(|| TypeError::Mismatch {
                expected: "primitive name".into(),
                found: name.clone(),
            })
    }
}

impl TypeFactory for OptionalFactory {
    fn build(&self, types: &TypeSystem, web: &Web, meta: &MetaType) -> Result<Type, TypeError> {
        let MetaType::Optional { base } = meta else {
            return Err(TypeError::wrong_tag("optional", meta));
        };
        let base = types.resolve(web, base)?;
        if base.is_nullable() {
            return Err(TypeError::Mismatch {
                expected: "non-nullable optional base".into(),
                found: base.to_string(),
            });
        }
        Ok(Type::Optional(base))
    }
}

impl TypeFactory for ListFactory {
    fn build(&self, types: &TypeSystem, web: &Web, meta: &MetaType) -> Result<Type, TypeError> {
        let MetaType::List { element } = meta else {
            return Err(TypeError::wrong_tag("list", meta));
        };
        Ok(Type::List(types.resolve(web, element)?))
    }
}

impl TypeFactory for RecordFactory {
    fn build(&self, types: &TypeSystem, web: &Web, meta: &MetaType) -> Result<Type, TypeError> {
        let MetaType::Record { name, fields, base } = meta else {
            return Err(TypeError::wrong_tag("record", meta));
        };
        let mut all = match base {
            Some(base) => inherited_fields(types, web, base)?,
            None => Vec::new(),
        };
        all.extend(resolve_fields(types, web, fields)?);
        Ok(Type::Record(RecordType {
            name: name.clone(),
            fields: all,
        }))
    }
}

impl TypeFactory for HierarchyFactory {
    fn build(&self, _: &TypeSystem, _: &Web, meta: &MetaType) -> Result<Type, TypeError> {
        let MetaType::Hierarchy { name } = meta else {
            return Err(TypeError::wrong_tag("hierarchy", meta));
        };
        Ok(Type::Hierarchy(HierarchyType { name: name.clone() }))
    }
}

impl TypeFactory for ClassFactory {
    fn build(&self, types: &TypeSystem, web: &Web, meta: &MetaType) -> Result<Type, TypeError> {
        let MetaType::Class {
            hierarchy,
            id,
            base,
            fields,
        } = meta
        else {
            return Err(TypeError::wrong_tag("class", meta));
        };
        let hierarchy = types.resolve(web, hierarchy)?;
        if !matches!(hierarchy.as_ref(), Type::Hierarchy(_)) {
            return Err(TypeError::Mismatch {
                expected: "hierarchy".into(),
                found: hierarchy.to_string(),
            });
        }
        let mut all = match base {
            Some(base) => inherited_fields(types, web, base)?,
            None => Vec::new(),
        };
        all.extend(resolve_fields(types, web, fields)?);
        Ok(Type::Class(ClassType {
            hierarchy,
            id: id.clone(),
            fields: all,
        }))
    }
}

fn resolve_fields(types: &TypeSystem, web: &Web, fields: &[MetaField]) -> Result<Vec<Field>, TypeError> {
    fields
        .iter()
        .map(|f| {
            Ok(Field {
                name: f.name.clone(),
                t: types.resolve(web, &f.type_ref)?,
            })
        })
        .collect()
}

fn inherited_fields(types: &TypeSystem, web: &Web, base: &Ref) -> Result<Vec<Field>, TypeError> {
    let base = types.resolve(web, base)?;
    base.fields()
        .map(<[Field]>::to_vec)
        .ok_or_else(|| TypeError::Mismatch {
            expected: "record or class base".into(),
            found: base.to_string(),
        })
}

// ── Type system ───────────────────────────────────────────────────────────────

/// Bidirectional cache between type refs and resolved types.
///
/// One instance per [`Context`](crate::context::Context); nothing here is
/// global.
pub struct TypeSystem {
    by_ref: DashMap<Ref, Arc<Type>>,
    by_type: DashMap<Arc<Type>, Ref>,
    factories: HashMap<&'static str, Arc<dyn TypeFactory>>,
}

impl Default for TypeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeSystem {
    /// A type system knowing the primitives and the standard factories.
    pub fn new() -> Self {
        let mut types = Self {
            by_ref: DashMap::new(),
            by_type: DashMap::new(),
            factories: HashMap::new(),
        };
        types.register_factory("primitive", Arc::new(PrimitiveFactory));
        types.register_factory("optional", Arc::new(OptionalFactory));
        types.register_factory("list", Arc::new(ListFactory));
        types.register_factory("record", Arc::new(RecordFactory));
        types.register_factory("hierarchy", Arc::new(HierarchyFactory));
        types.register_factory("class", Arc::new(ClassFactory));

        for p in Primitive::ALL {
            let t = Arc::new(Type::Primitive(p));
            types.by_ref.insert(p.type_ref(), t.clone());
            types.by_type.insert(t, p.type_ref());
        }
        types
    }

    pub fn register_factory(&mut self, tag: &'static str, factory: Arc<dyn TypeFactory>) {
        self.factories.insert(tag, factory);
    }

    pub fn primitive(&self, p: Primitive) -> Arc<Type> {
        self.intern(Type::Primitive(p))
    }

    /// Resolve a type ref to its structural type.
    pub fn resolve(&self, web: &Web, type_ref: &Ref) -> Result<Arc<Type>, TypeError> {
        if let Some(t) = self.by_ref.get(type_ref) {
            tracing::trace!(type_ref = %type_ref.short(), "type cache hit");
            return Ok(t.value().clone());
        }
        if type_ref.is_phony() {
            return Err(TypeError::Unresolved(type_ref.clone()));
        }

        let capsule = web
            .resolve_ref(type_ref)
            .map_err(|_| TypeError::Unresolved(type_ref.clone()))?;
        if capsule.type_ref != meta_type_ref() {
            return Err(TypeError::Mismatch {
                expected: "meta_type capsule".into(),
                found: capsule.type_ref.to_string(),
            });
        }
        let meta = MetaType::from_capsule(&capsule)
            .map_err(|e| TypeError::Decode(type_ref.clone(), e))?;
        let factory = self
            .factories
            .get(meta.tag())
            .ok_or_else(|| TypeError::UnknownMetaTag(meta.tag().to_string()))?;

        let t = self.intern(factory.build(self, web, &meta)?);

        // Concurrent resolutions of the same ref: first writer wins.
        let t = self
            .by_ref
            .entry(type_ref.clone())
            .or_insert(t)
            .value()
            .clone();
        self.by_type.entry(t.clone()).or_insert_with(|| type_ref.clone());
        tracing::debug!(type_ref = %type_ref.short(), t = %t, "type resolved");
        Ok(t)
    }

    /// The ref a type was registered or resolved under.
    pub fn reverse_resolve(&self, t: &Type) -> Result<Ref, TypeError> {
        self.by_type
            .get(t)
            .map(|r| r.value().clone())
            .ok_or_else(|| TypeError::NotRegistered(t.to_string()))
    }

    /// Store a meta-type record and resolve it.
    pub fn register(&self, web: &Web, meta: MetaType) -> Result<(Ref, Arc<Type>), TypeError> {
        let (r, capsule) = meta.to_capsule().map_err(TypeError::Encode)?;
        web.mosaic().put_capsule(capsule).map_err(TypeError::Encode)?;
        let t = self.resolve(web, &r)?;
        Ok((r, t))
    }

    /// Register a record without a base.
    pub fn register_record(
        &self,
        web: &Web,
        name: &str,
        fields: &[(&str, Ref)],
    ) -> Result<(Ref, Arc<Type>), TypeError> {
        self.register(
            web,
            MetaType::Record {
                name: name.to_string(),
                fields: fields
                    .iter()
                    .map(|(n, r)| MetaField {
                        name: n.to_string(),
                        type_ref: r.clone(),
                    })
                    .collect(),
                base: None,
            },
        )
    }

    /// Like [`reverse_resolve`](Self::reverse_resolve), registering the type
    /// (and anything it is built from) first if needed.
    pub fn ref_for(&self, web: &Web, t: &Type) -> Result<Ref, TypeError> {
        if let Ok(r) = self.reverse_resolve(t) {
            return Ok(r);
        }
        let meta = match t {
            Type::Primitive(p) => return Ok(p.type_ref()),
            Type::Optional(inner) => MetaType::Optional {
                base: self.ref_for(web, inner)?,
            },
            Type::List(element) => MetaType::List {
                element: self.ref_for(web, element)?,
            },
            Type::Record(r) => MetaType::Record {
                name: r.name.clone(),
                fields: self.meta_fields(web, &r.fields)?,
                base: None,
            },
            Type::Hierarchy(h) => MetaType::Hierarchy {
                name: h.name.clone(),
            },
            Type::Class(c) => MetaType::Class {
                hierarchy: self.ref_for(web, &c.hierarchy)?,
                id: c.id.clone(),
                base: None,
                fields: self.meta_fields(web, &c.fields)?,
            },
        };
        Ok(self.register(web, meta)?.0)
    }

    fn meta_fields(&self, web: &Web, fields: &[Field]) -> Result<Vec<MetaField>, TypeError> {
        fields
            .iter()
            .map(|f| {
                Ok(MetaField {
                    name: f.name.clone(),
                    type_ref: self.ref_for(web, &f.t)?,
                })
            })
            .collect()
    }

    /// Type of a keyword argument when the caller gave none.
    ///
    /// Primitives, optionals of them and non-empty homogeneous lists deduce;
    /// records and variants need an explicit type.
    pub fn deduce(&self, value: &Value) -> Option<Arc<Type>> {
        let t = match value {
            Value::None => return Some(self.primitive(Primitive::None)),
            Value::Bool(_) => return Some(self.primitive(Primitive::Bool)),
            Value::Int(_) => return Some(self.primitive(Primitive::Int)),
            Value::String(_) => return Some(self.primitive(Primitive::String)),
            Value::Bytes(_) => return Some(self.primitive(Primitive::Bytes)),
            Value::Ref(_) => return Some(self.primitive(Primitive::Ref)),
            Value::Optional(Some(inner)) => {
                let inner = self.deduce(inner)?;
                if inner.is_nullable() {
                    return None;
                }
                Type::Optional(inner)
            }
            Value::List(items) => {
                let (first, rest) = items.split_first()?;
                let element = self.deduce(first)?;
                for item in rest {
                    if self.deduce(item)? != element {
                        return None;
                    }
                }
                Type::List(element)
            }
            Value::Optional(None) | Value::Record(_) | Value::Variant { .. } => return None,
        };
        Some(self.intern(t))
    }

    /// Return the registered `Arc` for a structurally equal type, if any.
    fn intern(&self, t: Type) -> Arc<Type> {
        match self.by_type.get(&t) {
            Some(entry) => entry.key().clone(),
            None => Arc::new(t),
        }
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("no factory for meta-type tag {0:?}")]
    UnknownMetaTag(String),

    #[error("type {0} was never registered with this type system")]
    NotRegistered(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    Mismatch { expected: String, found: String },

    #[error("type ref {0} could not be resolved")]
    Unresolved(Ref),

    #[error("malformed meta-type {0}: {1}")]
    Decode(Ref, #[source] CodecError),

    #[error("failed to encode meta-type: {0}")]
    Encode(#[source] CodecError),
}

impl TypeError {
    fn wrong_tag(expected: &str, meta: &MetaType) -> Self {
        Self::Mismatch {
            expected: expected.to_string(),
            found: meta.tag().to_string(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mosaic::Mosaic;
    use crate::web::BundleSource;

    fn setup() -> (Web, TypeSystem) {
        (Web::new(Arc::new(Mosaic::in_memory())), TypeSystem::new())
    }

    fn field(name: &str, r: Ref) -> MetaField {
        MetaField {
            name: name.into(),
            type_ref: r,
        }
    }

    #[test]
    fn primitives_resolve_without_capsules() {
        let (web, types) = setup();
        for p in Primitive::ALL {
            let t = types.resolve(&web, &p.type_ref()).unwrap();
            assert_eq!(*t, Type::Primitive(p));
            assert_eq!(types.reverse_resolve(&t).unwrap(), p.type_ref());
        }
    }

    #[test]
    fn same_ref_yields_same_object() {
        let (web, types) = setup();
        let (r, t) = types
            .register(&web, MetaType::List { element: Primitive::Int.type_ref() })
            .unwrap();
        let again = types.resolve(&web, &r).unwrap();
        assert!(Arc::ptr_eq(&t, &again));
        assert_eq!(types.reverse_resolve(&again).unwrap(), r);
    }

    #[test]
    fn fresh_type_system_resolves_from_the_store() {
        let (web, types) = setup();
        let (r, t) = types
            .register_record(
                &web,
                "point",
                &[("x", Primitive::Int.type_ref()), ("y", Primitive::Int.type_ref())],
            )
            .unwrap();

        let other = TypeSystem::new();
        let resolved = other.resolve(&web, &r).unwrap();
        assert_eq!(*resolved, *t);
    }

    #[test]
    fn record_base_fields_come_first() {
        let (web, types) = setup();
        let (base, _) = types
            .register_record(&web, "named", &[("name", Primitive::String.type_ref())])
            .unwrap();
        let (_, t) = types
            .register(
                &web,
                MetaType::Record {
                    name: "person".into(),
                    fields: vec![field("age", Primitive::Int.type_ref())],
                    base: Some(base),
                },
            )
            .unwrap();
        let names: Vec<_> = t.fields().unwrap().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["name", "age"]);
    }

    #[test]
    fn class_must_belong_to_a_hierarchy() {
        let (web, types) = setup();
        let (hier, h) = types
            .register(&web, MetaType::Hierarchy { name: "shape".into() })
            .unwrap();
        let (_, circle) = types
            .register(
                &web,
                MetaType::Class {
                    hierarchy: hier,
                    id: "circle".into(),
                    base: None,
                    fields: vec![field("radius", Primitive::Int.type_ref())],
                },
            )
            .unwrap();
        match circle.as_ref() {
            Type::Class(c) => assert!(Arc::ptr_eq(&c.hierarchy, &h)),
            other => panic!("expected class, got {other}"),
        }

        let bad = types.register(
            &web,
            MetaType::Class {
                hierarchy: Primitive::Int.type_ref(),
                id: "nope".into(),
                base: None,
                fields: vec![],
            },
        );
        assert!(matches!(bad, Err(TypeError::Mismatch { .. })));
    }

    #[test]
    fn unknown_ref_is_unresolved() {
        let (web, types) = setup();
        let missing = Ref::for_bytes(tessera_core::HashAlgorithm::Blake3, b"nothing");
        assert!(matches!(
            types.resolve(&web, &missing),
            Err(TypeError::Unresolved(_))
        ));
        assert!(matches!(
            types.resolve(&web, &Ref::phony("float")),
            Err(TypeError::Unresolved(_))
        ));
    }

    #[test]
    fn reverse_resolve_fails_for_unregistered() {
        let (_, types) = setup();
        let t = Type::List(types.primitive(Primitive::Bytes));
        assert!(matches!(
            types.reverse_resolve(&t),
            Err(TypeError::NotRegistered(_))
        ));
    }

    #[test]
    fn ref_for_registers_on_demand() {
        let (web, types) = setup();
        let t = Type::Optional(Arc::new(Type::List(types.primitive(Primitive::String))));
        let r = types.ref_for(&web, &t).unwrap();
        assert_eq!(types.reverse_resolve(&t).unwrap(), r);
        assert_eq!(*types.resolve(&web, &r).unwrap(), t);
    }

    #[test]
    fn optional_and_list_resolve_from_a_bundle() {
        let (web, types) = setup();
        let (list_ref, list_t) = types
            .register(&web, MetaType::List { element: Primitive::Int.type_ref() })
            .unwrap();
        let (opt_ref, opt_t) = types
            .register(&web, MetaType::Optional { base: list_ref.clone() })
            .unwrap();
        let capsules = [
            web.resolve_ref(&list_ref).unwrap(),
            web.resolve_ref(&opt_ref).unwrap(),
        ];

        // A second node sees the meta-types only through the received capsules.
        let remote = Web::new(Arc::new(Mosaic::in_memory()))
            .with_source(Arc::new(BundleSource::from_capsules(&capsules)));
        let other = TypeSystem::new();
        let resolved = other.resolve(&remote, &opt_ref).unwrap();
        assert_eq!(*resolved, *opt_t);
        assert_eq!(*other.resolve(&remote, &list_ref).unwrap(), *list_t);
        assert!(remote.mosaic().is_empty());
    }

    #[test]
    fn nullable_optional_bases_are_refused() {
        let (web, types) = setup();
        let (opt, _) = types
            .register(&web, MetaType::Optional { base: Primitive::Int.type_ref() })
            .unwrap();
        for base in [opt, Primitive::None.type_ref()] {
            assert!(matches!(
                types.register(&web, MetaType::Optional { base }),
                Err(TypeError::Mismatch { .. })
            ));
        }
        let nested = Value::Optional(Some(Box::new(Value::Optional(None))));
        assert!(types.deduce(&nested).is_none());
    }

    #[test]
    fn unknown_meta_tag_is_reported() {
        let (web, mut types) = setup();
        types.factories.remove("hierarchy");
        let err = types
            .register(&web, MetaType::Hierarchy { name: "x".into() })
            .unwrap_err();
        assert!(matches!(err, TypeError::UnknownMetaTag(tag) if tag == "hierarchy"));
    }

    #[test]
    fn deduce_primitives_and_lists() {
        let (_, types) = setup();
        assert_eq!(
            *types.deduce(&Value::String("hi".into())).unwrap(),
            Type::Primitive(Primitive::String)
        );
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(
            *types.deduce(&list).unwrap(),
            Type::List(types.primitive(Primitive::Int))
        );
        let mixed = Value::List(vec![Value::Int(1), Value::Bool(true)]);
        assert!(types.deduce(&mixed).is_none());
        assert!(types.deduce(&Value::List(vec![])).is_none());
        assert!(types.deduce(&Value::Record(vec![])).is_none());
    }
}
