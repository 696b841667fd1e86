//! Meta-type records.
//!
//! A type is itself a capsule: its type ref is the phony `meta_type` ref and
//! its payload is one of the records below. The services crate turns these
//! into structural types; this module only defines what is stored.

use serde::{Deserialize, Serialize};

use crate::capsule::{Capsule, HashAlgorithm, Ref};
use crate::codec::{self, CodecError};

/// Type ref of every meta-type capsule.
pub fn meta_type_ref() -> Ref {
    Ref::phony("meta_type")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaField {
    pub name: String,
    pub type_ref: Ref,
}

/// Stored externally tagged: a one-entry map from the tag to the variant's
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaType {
    Primitive {
        name: String,
    },
    Optional {
        base: Ref,
    },
    List {
        element: Ref,
    },
    Record {
        name: String,
        fields: Vec<MetaField>,
        /// Record whose fields come first.
        base: Option<Ref>,
    },
    /// Root of a tagged family of records.
    Hierarchy {
        name: String,
    },
    /// Member of a hierarchy, identified by `id` within it.
    Class {
        hierarchy: Ref,
        id: String,
        base: Option<Ref>,
        fields: Vec<MetaField>,
    },
}

impl MetaType {
    /// Factory key for this record.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Primitive { .. } => "primitive",
            Self::Optional { .. } => "optional",
            Self::List { .. } => "list",
            Self::Record { .. } => "record",
            Self::Hierarchy { .. } => "hierarchy",
            Self::Class { .. } => "class",
        }
    }

    /// Type refs this record depends on.
    pub fn refs(&self) -> Vec<Ref> {
        match self {
            Self::Primitive { .. } | Self::Hierarchy { .. } => Vec::new(),
            Self::Optional { base } => vec![base.clone()],
            Self::List { element } => vec![element.clone()],
            Self::Record { fields, base, .. } => base
                .iter()
                .cloned()
                .chain(fields.iter().map(|f| f.type_ref.clone()))
                .collect(),
            Self::Class {
                hierarchy,
                base,
                fields,
                ..
            } => std::iter::once(hierarchy.clone())
                .chain(base.iter().cloned())
                .chain(fields.iter().map(|f| f.type_ref.clone()))
                .collect(),
        }
    }

    pub fn to_capsule(&self) -> Result<(Ref, Capsule), CodecError> {
        let capsule = Capsule::new(meta_type_ref(), codec::encode(self)?);
        let r = capsule.make_ref(HashAlgorithm::default())?;
        Ok((r, capsule))
    }

    pub fn from_capsule(capsule: &Capsule) -> Result<Self, CodecError> {
        codec::decode(&capsule.encoded_object)
    }
}
