//! Dynamically typed values.
//!
//! A [`Value`] is what a capsule payload decodes to. Encoding is positional:
//! records are tuples of their field values and variants are
//! `[class_ref, [fields...]]`, so decoding needs the [`Type`] that says what
//! each position holds. [`TypedSeed`] drives that as a serde
//! `DeserializeSeed`.

use std::fmt;
use std::sync::Arc;

use serde::de::{self, DeserializeSeed, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

use tessera_core::capsule::bytes_serde;
use tessera_core::codec::CodecError;
use tessera_core::Ref;

use crate::types::{Field, Primitive, Type, TypeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    Ref(Ref),
    Optional(Option<Box<Value>>),
    List(Vec<Value>),
    /// Field values in declaration order, named.
    Record(Vec<(String, Value)>),
    /// Member of a hierarchy, tagged with its class's type ref.
    Variant {
        class_ref: Ref,
        fields: Vec<(String, Value)>,
    },
}

/// Looks up a class type by its ref while decoding variants.
pub type ClassLookup<'a> = &'a dyn Fn(&Ref) -> Result<Arc<Type>, TypeError>;

impl Value {
    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self::Record(
            fields
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        )
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Record(fields) | Self::Variant { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&Ref> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Ref(_) => "ref",
            Self::Optional(_) => "optional",
            Self::List(_) => "list",
            Self::Record(_) => "record",
            Self::Variant { .. } => "variant",
        }
    }

    /// Call `f` on every ref embedded in this value, class refs included.
    pub fn visit_refs(&self, f: &mut impl FnMut(&Ref)) {
        match self {
            Self::Ref(r) => f(r),
            Self::Optional(Some(v)) => v.visit_refs(f),
            Self::List(items) => items.iter().for_each(|v| v.visit_refs(f)),
            Self::Record(fields) => fields.iter().for_each(|(_, v)| v.visit_refs(f)),
            Self::Variant { class_ref, fields } => {
                f(class_ref);
                fields.iter().for_each(|(_, v)| v.visit_refs(f));
            }
            _ => {}
        }
    }

    /// Check that this value has the shape `t` describes.
    pub fn validate(&self, t: &Type, classes: ClassLookup<'_>) -> Result<(), TypeError> {
        let mismatch = || TypeError::Mismatch {
            expected: t.to_string(),
            found: self.kind().to_string(),
        };
        match (self, t) {
            (Self::Optional(_), Type::Optional(inner)) if inner.is_nullable() => Err(mismatch()),
            (Self::None, Type::Primitive(Primitive::None))
            | (Self::Bool(_), Type::Primitive(Primitive::Bool))
            | (Self::Int(_), Type::Primitive(Primitive::Int))
            | (Self::String(_), Type::Primitive(Primitive::String))
            | (Self::Bytes(_), Type::Primitive(Primitive::Bytes))
            | (Self::Ref(_), Type::Primitive(Primitive::Ref))
            | (Self::Optional(None), Type::Optional(_)) => Ok(()),
            (Self::Optional(Some(v)), Type::Optional(inner)) => v.validate(inner, classes),
            (Self::List(items), Type::List(element)) => items
                .iter()
                .try_for_each(|v| v.validate(element, classes)),
            (Self::Record(fields), Type::Record(rec)) => {
                validate_fields(fields, &rec.fields, classes).map_err(|_| mismatch())
            }
            (Self::Variant { class_ref, fields }, Type::Hierarchy(_) | Type::Class(_)) => {
                let class = class_for(t, class_ref, classes)?;
                let expected = class.fields().unwrap_or_default();
                validate_fields(fields, expected, classes).map_err(|_| mismatch())
            }
            _ => Err(mismatch()),
        }
    }

    /// Decode a payload encoded under `t`.
    pub fn decode(bytes: &[u8], t: &Type, classes: ClassLookup<'_>) -> Result<Self, CodecError> {
        let mut de = rmp_serde::Deserializer::from_read_ref(bytes);
        Ok(TypedSeed { t, classes }.deserialize(&mut de)?)
    }
}

fn validate_fields(
    values: &[(String, Value)],
    fields: &[Field],
    classes: ClassLookup<'_>,
) -> Result<(), TypeError> {
    if values.len() != fields.len() {
        return Err(TypeError::Mismatch {
            expected: format!("{} fields", fields.len()),
            found: format!("{} fields", values.len()),
        });
    }
    for ((name, v), f) in values.iter().zip(fields) {
        if *name != f.name {
            return Err(TypeError::Mismatch {
                expected: f.name.clone(),
                found: name.clone(),
            });
        }
        v.validate(&f.t, classes)?;
    }
    Ok(())
}

/// Look up `class_ref` and check that it may stand where `expected` is.
fn class_for(expected: &Type, class_ref: &Ref, classes: ClassLookup<'_>) -> Result<Arc<Type>, TypeError> {
    let class = classes(class_ref)?;
    let fits = match (expected, class.as_ref()) {
        (Type::Hierarchy(_), Type::Class(c)) => *c.hierarchy == *expected,
        (Type::Class(_), Type::Class(_)) => *class == *expected,
        _ => false,
    };
    if fits {
        Ok(class)
    } else {
        Err(TypeError::Mismatch {
            expected: expected.to_string(),
            found: class.to_string(),
        })
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::String(s) => serializer.serialize_str(s),
            Self::Bytes(b) => serializer.serialize_bytes(b),
            Self::Ref(r) => r.serialize(serializer),
            Self::Optional(None) => serializer.serialize_none(),
            Self::Optional(Some(v)) => serializer.serialize_some(v.as_ref()),
            Self::List(items) => serializer.collect_seq(items),
            Self::Record(fields) => FieldValues(fields).serialize(serializer),
            Self::Variant { class_ref, fields } => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element(class_ref)?;
                tuple.serialize_element(&FieldValues(fields))?;
                tuple.end()
            }
        }
    }
}

struct FieldValues<'a>(&'a [(String, Value)]);

impl Serialize for FieldValues<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(self.0.len())?;
        for (_, v) in self.0 {
            tuple.serialize_element(v)?;
        }
        tuple.end()
    }
}

// ── Type-directed decoding ────────────────────────────────────────────────────

/// Decodes one value of type `t`.
#[derive(Clone, Copy)]
pub struct TypedSeed<'a> {
    pub t: &'a Type,
    pub classes: ClassLookup<'a>,
}

impl<'de> DeserializeSeed<'de> for TypedSeed<'_> {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        match self.t {
            Type::Primitive(p) => match p {
                Primitive::None => {
                    <()>::deserialize(d)?;
                    Ok(Value::None)
                }
                Primitive::Bool => bool::deserialize(d).map(Value::Bool),
                Primitive::Int => i64::deserialize(d).map(Value::Int),
                Primitive::String => String::deserialize(d).map(Value::String),
                Primitive::Bytes => bytes_serde::deserialize(d).map(Value::Bytes),
                Primitive::Ref => Ref::deserialize(d).map(Value::Ref),
            },
            Type::Optional(inner) => d.deserialize_option(OptionVisitor {
                inner: TypedSeed {
                    t: inner,
                    classes: self.classes,
                },
            }),
            Type::List(element) => d.deserialize_seq(ListVisitor {
                element: TypedSeed {
                    t: element,
                    classes: self.classes,
                },
            }),
            Type::Record(rec) => FieldsSeed {
                fields: &rec.fields,
                classes: self.classes,
            }
            .deserialize(d)
            .map(Value::Record),
            Type::Hierarchy(_) | Type::Class(_) => d.deserialize_tuple(2, VariantVisitor(self)),
        }
    }
}

struct OptionVisitor<'a> {
    inner: TypedSeed<'a>,
}

impl<'de> Visitor<'de> for OptionVisitor<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "optional {}", self.inner.t)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Optional(None))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Optional(None))
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        let v = self.inner.deserialize(d)?;
        Ok(Value::Optional(Some(Box::new(v))))
    }
}

struct ListVisitor<'a> {
    element: TypedSeed<'a>,
}

impl<'de> Visitor<'de> for ListVisitor<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list of {}", self.element.t)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element_seed(self.element)? {
            items.push(v);
        }
        Ok(Value::List(items))
    }
}

#[derive(Clone, Copy)]
struct FieldsSeed<'a> {
    fields: &'a [Field],
    classes: ClassLookup<'a>,
}

impl<'de> DeserializeSeed<'de> for FieldsSeed<'_> {
    type Value = Vec<(String, Value)>;

    fn deserialize<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
        d.deserialize_tuple(self.fields.len(), self)
    }
}

impl<'de> Visitor<'de> for FieldsSeed<'_> {
    type Value = Vec<(String, Value)>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} field values", self.fields.len())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::with_capacity(self.fields.len());
        for (i, field) in self.fields.iter().enumerate() {
            let seed = TypedSeed {
                t: &field.t,
                classes: self.classes,
            };
            let v = seq
                .next_element_seed(seed)?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
            out.push((field.name.clone(), v));
        }
        Ok(out)
    }
}

struct VariantVisitor<'a>(TypedSeed<'a>);

impl<'de> Visitor<'de> for VariantVisitor<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[class_ref, fields] for {}", self.0.t)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let class_ref: Ref = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let class = class_for(self.0.t, &class_ref, self.0.classes).map_err(de::Error::custom)?;
        let fields = class.fields().unwrap_or_default();
        let values = seq
            .next_element_seed(FieldsSeed {
                fields,
                classes: self.0.classes,
            })?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        Ok(Value::Variant {
            class_ref,
            fields: values,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassType, HierarchyType, RecordType};
    use tessera_core::codec;

    fn no_classes(r: &Ref) -> Result<Arc<Type>, TypeError> {
        Err(TypeError::Unresolved(r.clone()))
    }

    fn prim(p: Primitive) -> Arc<Type> {
        Arc::new(Type::Primitive(p))
    }

    fn point() -> Type {
        Type::Record(RecordType {
            name: "point".into(),
            fields: vec![
                Field { name: "x".into(), t: prim(Primitive::Int) },
                Field { name: "y".into(), t: prim(Primitive::Int) },
            ],
        })
    }

    fn decode(bytes: &[u8], t: &Type) -> Value {
        Value::decode(bytes, t, &no_classes).unwrap()
    }

    #[test]
    fn record_encodes_positionally() {
        let v = Value::record([("x", Value::Int(1)), ("y", Value::Int(2))]);
        let bytes = codec::encode(&v).unwrap();
        assert_eq!(bytes, vec![0x92, 0x01, 0x02]);
        assert_eq!(decode(&bytes, &point()), v);
    }

    #[test]
    fn nested_optional_list_decodes() {
        let t = Type::Optional(Arc::new(Type::List(prim(Primitive::String))));
        let v = Value::Optional(Some(Box::new(Value::List(vec![
            Value::String("a".into()),
            Value::String("b".into()),
        ]))));
        assert_eq!(decode(&codec::encode(&v).unwrap(), &t), v);

        let absent = Value::Optional(None);
        assert_eq!(decode(&codec::encode(&absent).unwrap(), &t), absent);
    }

    #[test]
    fn bytes_and_refs_decode() {
        let r = Ref::phony("string");
        let t = Type::Record(RecordType {
            name: "blob".into(),
            fields: vec![
                Field { name: "data".into(), t: prim(Primitive::Bytes) },
                Field { name: "link".into(), t: prim(Primitive::Ref) },
            ],
        });
        let v = Value::record([
            ("data", Value::Bytes(vec![0, 1, 255])),
            ("link", Value::Ref(r.clone())),
        ]);
        let decoded = decode(&codec::encode(&v).unwrap(), &t);
        assert_eq!(decoded, v);

        let mut seen = Vec::new();
        decoded.visit_refs(&mut |r| seen.push(r.clone()));
        assert_eq!(seen, vec![r]);
    }

    #[test]
    fn wrong_shape_fails_to_decode() {
        let bytes = codec::encode(&Value::String("nope".into())).unwrap();
        assert!(Value::decode(&bytes, &point(), &no_classes).is_err());
    }

    #[test]
    fn variants_decode_through_class_lookup() {
        let hierarchy = Arc::new(Type::Hierarchy(HierarchyType { name: "shape".into() }));
        let circle = Arc::new(Type::Class(ClassType {
            hierarchy: hierarchy.clone(),
            id: "circle".into(),
            fields: vec![Field { name: "radius".into(), t: prim(Primitive::Int) }],
        }));
        let circle_ref = Ref::phony("test-circle");
        let lookup = {
            let circle = circle.clone();
            let circle_ref = circle_ref.clone();
            move |r: &Ref| {
                if *r == circle_ref {
                    Ok(circle.clone())
                } else {
                    Err(TypeError::Unresolved(r.clone()))
                }
            }
        };

        let v = Value::Variant {
            class_ref: circle_ref.clone(),
            fields: vec![("radius".into(), Value::Int(5))],
        };
        v.validate(&hierarchy, &lookup).unwrap();
        let bytes = codec::encode(&v).unwrap();
        assert_eq!(Value::decode(&bytes, &hierarchy, &lookup).unwrap(), v);

        let unknown = Value::Variant {
            class_ref: Ref::phony("test-square"),
            fields: vec![],
        };
        let bytes = codec::encode(&unknown).unwrap();
        assert!(Value::decode(&bytes, &hierarchy, &lookup).is_err());
    }

    #[test]
    fn validate_checks_field_names_and_types() {
        let good = Value::record([("x", Value::Int(1)), ("y", Value::Int(2))]);
        assert!(good.validate(&point(), &no_classes).is_ok());

        let renamed = Value::record([("x", Value::Int(1)), ("z", Value::Int(2))]);
        assert!(renamed.validate(&point(), &no_classes).is_err());

        let wrong_type = Value::record([("x", Value::Int(1)), ("y", Value::Bool(true))]);
        assert!(wrong_type.validate(&point(), &no_classes).is_err());

        assert!(Value::Int(3)
            .validate(&Type::Primitive(Primitive::String), &no_classes)
            .is_err());
    }

    #[test]
    fn optional_of_nullable_is_rejected() {
        let t = Type::Optional(Arc::new(Type::Optional(prim(Primitive::Int))));
        let nested = Value::Optional(Some(Box::new(Value::Optional(None))));
        assert!(nested.validate(&t, &no_classes).is_err());

        let of_none = Type::Optional(prim(Primitive::None));
        let present = Value::Optional(Some(Box::new(Value::None)));
        assert!(present.validate(&of_none, &no_classes).is_err());

        let fine = Type::Optional(prim(Primitive::Int));
        assert!(Value::Optional(Some(Box::new(Value::Int(1))))
            .validate(&fine, &no_classes)
            .is_ok());
    }

    #[test]
    fn field_lookup() {
        let v = Value::record([("msg", Value::String("hi".into()))]);
        assert_eq!(v.field("msg").and_then(Value::as_str), Some("hi"));
        assert!(v.field("other").is_none());
    }
}
