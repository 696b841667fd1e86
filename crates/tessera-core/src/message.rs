//! RPC message schema.
//!
//! Requests and responses never carry values inline: every parameter, result
//! and exception travels as a ref, and the capsules behind those refs travel
//! alongside in the same bundle.

use serde::{Deserialize, Serialize};

use crate::capsule::{Capsule, HashAlgorithm, Ref};
use crate::codec::{self, CodecError};

/// Type ref of capsules holding an [`RpcMessage`].
pub fn rpc_message_type_ref() -> Ref {
    Ref::phony("rpc_message")
}

/// Fresh random request id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One keyword argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcParam {
    pub name: String,
    pub value: Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// UUIDv4 string. Never reused while a call is outstanding.
    pub request_id: String,
    /// `servant_ref` capsule naming the servant to invoke.
    pub target_ref: Ref,
    pub params: Vec<RpcParam>,
    /// `peer` capsule of the caller, if it identifies itself.
    pub sender_peer_ref: Option<Ref>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: String,
    pub result_ref: Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub request_id: String,
    /// `rpc_exception` capsule.
    pub exception_ref: Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Error(RpcErrorResponse),
}

impl RpcMessage {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Request(r) => &r.request_id,
            Self::Response(r) => &r.request_id,
            Self::Error(r) => &r.request_id,
        }
    }

    /// Every ref this message points at.
    pub fn refs(&self) -> Vec<Ref> {
        match self {
            Self::Request(r) => {
                let mut out = Vec::with_capacity(r.params.len() + 2);
                out.push(r.target_ref.clone());
                out.extend(r.params.iter().map(|p| p.value.clone()));
                out.extend(r.sender_peer_ref.iter().cloned());
                out
            }
            Self::Response(r) => vec![r.result_ref.clone()],
            Self::Error(r) => vec![r.exception_ref.clone()],
        }
    }

    /// Wrap this message in a capsule and return it with its ref.
    pub fn to_capsule(&self) -> Result<(Ref, Capsule), CodecError> {
        let capsule = Capsule::new(rpc_message_type_ref(), codec::encode(self)?);
        let r = capsule.make_ref(HashAlgorithm::default())?;
        Ok((r, capsule))
    }

    pub fn from_capsule(capsule: &Capsule) -> Result<Self, CodecError> {
        codec::decode(&capsule.encoded_object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RpcRequest {
        RpcRequest {
            request_id: new_request_id(),
            target_ref: Ref::for_bytes(HashAlgorithm::Blake3, b"servant"),
            params: vec![RpcParam {
                name: "msg".into(),
                value: Ref::for_bytes(HashAlgorithm::Blake3, b"hi"),
            }],
            sender_peer_ref: Some(Ref::for_bytes(HashAlgorithm::Blake3, b"peer")),
        }
    }

    #[test]
    fn request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn request_refs_cover_target_params_and_sender() {
        let req = request();
        let refs = RpcMessage::Request(req.clone()).refs();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0], req.target_ref);
        assert_eq!(refs[1], req.params[0].value);
    }

    #[test]
    fn capsule_roundtrip() {
        let msg = RpcMessage::Request(request());
        let (r, capsule) = msg.to_capsule().unwrap();
        assert_eq!(capsule.type_ref, rpc_message_type_ref());
        assert_eq!(r, capsule.make_ref(HashAlgorithm::Blake3).unwrap());
        assert_eq!(RpcMessage::from_capsule(&capsule).unwrap(), msg);
    }
}
