//! Content-addressed records: refs, capsules, bundles and routes.
//!
//! A capsule's ref is the hash of the capsule's own canonical encoding, so
//! two capsules with the same type, encoding and payload always share a ref.
//! Nothing in this module is mutable once built.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;

// ── Hash algorithm ────────────────────────────────────────────────────────────

/// How a ref's hash was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3 over the canonical capsule bytes. Default for new capsules.
    Blake3,
    /// SHA-512 over the canonical capsule bytes.
    Sha512,
    /// Names a built-in entity. The "hash" is the entity name and is never
    /// computed from content.
    Phony,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha512 => "sha512",
            Self::Phony => "phony",
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Blake3
    }
}

// ── Ref ───────────────────────────────────────────────────────────────────────

/// Content identifier. Two refs are equal iff algorithm and hash match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    pub hash_algorithm: HashAlgorithm,
    #[serde(with = "bytes_serde")]
    pub hash: Vec<u8>,
}

impl Ref {
    /// Hash `data` with `algorithm`. Phony refs cannot be computed this way.
    pub fn for_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let hash = match algorithm {
            HashAlgorithm::Blake3 => crate::crypto::hash(data).to_vec(),
            HashAlgorithm::Sha512 => crate::crypto::sha512(data).to_vec(),
            HashAlgorithm::Phony => data.to_vec(),
        };
        Self {
            hash_algorithm: algorithm,
            hash,
        }
    }

    /// Ref naming a built-in entity, identical on every node.
    pub fn phony(name: &str) -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Phony,
            hash: name.as_bytes().to_vec(),
        }
    }

    pub fn is_phony(&self) -> bool {
        self.hash_algorithm == HashAlgorithm::Phony
    }

    /// Short printable prefix for log lines.
    pub fn short(&self) -> String {
        match self.hash_algorithm {
            HashAlgorithm::Phony => String::from_utf8_lossy(&self.hash).into_owned(),
            _ => hex::encode(&self.hash[..self.hash.len().min(8)]),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hash_algorithm {
            HashAlgorithm::Phony => write!(f, "phony:{}", String::from_utf8_lossy(&self.hash)),
            alg => write!(f, "{}:{}", alg.name(), hex::encode(&self.hash)),
        }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({self})")
    }
}

// ── Capsule ───────────────────────────────────────────────────────────────────

/// Encoding name stored in every capsule this crate produces.
pub const ENCODING_MSGPACK: &str = "msgpack";

/// A type-tagged encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capsule {
    pub type_ref: Ref,
    pub encoding: String,
    #[serde(with = "bytes_serde")]
    pub encoded_object: Vec<u8>,
}

impl Capsule {
    pub fn new(type_ref: Ref, encoded_object: Vec<u8>) -> Self {
        Self {
            type_ref,
            encoding: ENCODING_MSGPACK.to_string(),
            encoded_object,
        }
    }

    /// Compute this capsule's ref under `algorithm`: the hash of its
    /// canonical encoding.
    pub fn make_ref(&self, algorithm: HashAlgorithm) -> Result<Ref, codec::CodecError> {
        let bytes = codec::encode(self)?;
        Ok(Ref::for_bytes(algorithm, &bytes))
    }
}

// ── Route ─────────────────────────────────────────────────────────────────────

/// Declares a transport by which an endpoint may be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub endpoint_ref: Ref,
    pub transport_ref: Ref,
    /// Unix seconds at which the route was last known to work.
    pub available_at: u64,
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// Self-contained transmission unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub roots: Vec<Ref>,
    pub capsule_list: Vec<Capsule>,
    pub route_list: Vec<Route>,
}

impl Bundle {
    pub fn encode(&self) -> Result<Vec<u8>, codec::CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, codec::CodecError> {
        codec::decode(bytes)
    }
}

// ── Byte-string serde helper ──────────────────────────────────────────────────

/// Serialize `Vec<u8>` as a MessagePack `bin` rather than an array of ints,
/// accepting either form when reading.
pub mod bytes_serde {
    use std::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_byte_buf(BytesVisitor)
    }

    pub(crate) struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

/// Fixed-size variant of [`bytes_serde`] for arrays such as IVs and digests.
pub mod array_serde {
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = deserializer.deserialize_byte_buf(super::bytes_serde::BytesVisitor)?;
        let len = v.len();
        v.try_into()
            .map_err(|_| de::Error::invalid_length(len, &"a fixed-size byte string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_capsules_share_a_ref() {
        let a = Capsule::new(Ref::phony("string"), b"payload".to_vec());
        let b = Capsule::new(Ref::phony("string"), b"payload".to_vec());
        assert_eq!(
            a.make_ref(HashAlgorithm::Blake3).unwrap(),
            b.make_ref(HashAlgorithm::Blake3).unwrap()
        );
    }

    #[test]
    fn ref_is_hash_of_canonical_encoding() {
        let c = Capsule::new(Ref::phony("bytes"), vec![1, 2, 3]);
        let bytes = codec::encode(&c).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(
            c.make_ref(HashAlgorithm::Blake3).unwrap(),
            Ref::for_bytes(HashAlgorithm::Blake3, &bytes)
        );
    }

    #[test]
    fn type_ref_participates_in_capsule_ref() {
        let a = Capsule::new(Ref::phony("string"), b"x".to_vec());
        let b = Capsule::new(Ref::phony("bytes"), b"x".to_vec());
        assert_ne!(
            a.make_ref(HashAlgorithm::Blake3).unwrap(),
            b.make_ref(HashAlgorithm::Blake3).unwrap()
        );
    }

    #[test]
    fn algorithm_participates_in_ref_equality() {
        let c = Capsule::new(Ref::phony("int"), vec![1]);
        let blake = c.make_ref(HashAlgorithm::Blake3).unwrap();
        let sha = c.make_ref(HashAlgorithm::Sha512).unwrap();
        assert_ne!(blake, sha);
        assert_eq!(blake.hash.len(), 32);
        assert_eq!(sha.hash.len(), 64);
    }

    #[test]
    fn ref_display_is_algorithm_prefixed() {
        assert_eq!(Ref::phony("string").to_string(), "phony:string");
        let r = Ref::for_bytes(HashAlgorithm::Blake3, b"");
        assert!(r.to_string().starts_with("blake3:af1349b9"));
    }

    #[test]
    fn bundle_survives_encoding() {
        let capsule = Capsule::new(Ref::phony("bytes"), vec![0xde, 0xad]);
        let root = capsule.make_ref(HashAlgorithm::Blake3).unwrap();
        let bundle = Bundle {
            roots: vec![root.clone()],
            capsule_list: vec![capsule],
            route_list: vec![Route {
                endpoint_ref: root.clone(),
                transport_ref: Ref::phony("local"),
                available_at: 1_700_000_000,
            }],
        };
        let bytes = bundle.encode().unwrap();
        assert_eq!(Bundle::decode(&bytes).unwrap(), bundle);
    }
}
