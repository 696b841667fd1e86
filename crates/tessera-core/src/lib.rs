//! tessera-core — content-addressed records, wire format, canonical encoding
//! and cryptographic primitives. All other Tessera crates depend on this one.

pub mod capsule;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod message;
pub mod meta;
pub mod wire;

pub use capsule::{Bundle, Capsule, HashAlgorithm, Ref, Route};
pub use message::{RpcErrorResponse, RpcMessage, RpcParam, RpcRequest, RpcResponse};
pub use meta::{MetaField, MetaType};
