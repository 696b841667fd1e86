//! Standard record types every node registers.
//!
//! The meta-type capsules are content-addressed, so registering the same
//! definitions on two nodes yields the same type refs on both, and values
//! built on one decode on the other.

use std::sync::Arc;

use tessera_core::crypto::PublicKey;
use tessera_core::{MetaType, Ref};

use crate::types::{Primitive, Type, TypeError, TypeSystem};
use crate::value::Value;
use crate::web::{ResolveError, Web};

/// A registered type and the ref it lives under.
#[derive(Debug, Clone)]
pub struct BuiltinType {
    pub type_ref: Ref,
    pub t: Arc<Type>,
}

#[derive(Debug, Clone)]
pub struct Builtins {
    /// `peer{public_key_der: bytes}`. A peer's ref names the node.
    pub peer: BuiltinType,
    /// `tcp_transport{host: string, port: int}`.
    pub tcp_transport: BuiltinType,
    /// `servant_ref{peer: ref, name: string}`. Call targets.
    pub servant_ref: BuiltinType,
    /// `rpc_exception{message: string, traceback: list<string>}`.
    pub rpc_exception: BuiltinType,
}

impl Builtins {
    pub fn register(web: &Web, types: &TypeSystem) -> Result<Self, TypeError> {
        let record = |name: &str, fields: &[(&str, Ref)]| {
            types
                .register_record(web, name, fields)
                .map(|(type_ref, t)| BuiltinType { type_ref, t })
        };
        let (string_list, _) = types.register(
            web,
            MetaType::List {
                element: Primitive::String.type_ref(),
            },
        )?;

        Ok(Self {
            peer: record("peer", &[("public_key_der", Primitive::Bytes.type_ref())])?,
            tcp_transport: record(
                "tcp_transport",
                &[
                    ("host", Primitive::String.type_ref()),
                    ("port", Primitive::Int.type_ref()),
                ],
            )?,
            servant_ref: record(
                "servant_ref",
                &[
                    ("peer", Primitive::Ref.type_ref()),
                    ("name", Primitive::String.type_ref()),
                ],
            )?,
            rpc_exception: record(
                "rpc_exception",
                &[
                    ("message", Primitive::String.type_ref()),
                    ("traceback", string_list),
                ],
            )?,
        })
    }

    /// Store the `peer` record for a public key.
    pub fn put_peer(&self, web: &Web, types: &TypeSystem, key: &PublicKey) -> Result<Ref, ResolveError> {
        let value = Value::record([("public_key_der", Value::Bytes(key.der().to_vec()))]);
        web.mosaic().put(web, types, &value, &self.peer.t)
    }

    pub fn put_tcp_transport(
        &self,
        web: &Web,
        types: &TypeSystem,
        host: &str,
        port: u16,
    ) -> Result<Ref, ResolveError> {
        let value = Value::record([
            ("host", Value::String(host.to_string())),
            ("port", Value::Int(i64::from(port))),
        ]);
        web.mosaic().put(web, types, &value, &self.tcp_transport.t)
    }

    pub fn put_servant_ref(
        &self,
        web: &Web,
        types: &TypeSystem,
        peer: &Ref,
        name: &str,
    ) -> Result<Ref, ResolveError> {
        let value = Value::record([
            ("peer", Value::Ref(peer.clone())),
            ("name", Value::String(name.to_string())),
        ]);
        web.mosaic().put(web, types, &value, &self.servant_ref.t)
    }

    pub fn put_exception(
        &self,
        web: &Web,
        types: &TypeSystem,
        message: &str,
        traceback: &[String],
    ) -> Result<Ref, ResolveError> {
        let value = Value::record([
            ("message", Value::String(message.to_string())),
            (
                "traceback",
                Value::List(traceback.iter().cloned().map(Value::String).collect()),
            ),
        ]);
        web.mosaic().put(web, types, &value, &self.rpc_exception.t)
    }
}

/// `(host, port)` of a `tcp_transport` value.
pub fn tcp_transport_addr(value: &Value) -> Option<(String, u16)> {
    let host = value.field("host")?.as_str()?.to_string();
    let port = u16::try_from(value.field("port")?.as_int()?).ok()?;
    Some((host, port))
}

/// `(message, traceback)` of an `rpc_exception` value.
pub fn exception_parts(value: &Value) -> (String, Vec<String>) {
    let message = value
        .field("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let traceback = match value.field("traceback") {
        Some(Value::List(lines)) => lines
            .iter()
            .filter_map(|l| l.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    (message, traceback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mosaic::Mosaic;

    fn setup() -> (Web, TypeSystem, Builtins) {
        let web = Web::new(Arc::new(Mosaic::in_memory()));
        let types = TypeSystem::new();
        let builtins = Builtins::register(&web, &types).unwrap();
        (web, types, builtins)
    }

    #[test]
    fn registration_is_identical_across_nodes() {
        let (_, _, a) = setup();
        let (_, _, b) = setup();
        assert_eq!(a.peer.type_ref, b.peer.type_ref);
        assert_eq!(a.servant_ref.type_ref, b.servant_ref.type_ref);
        assert_eq!(a.rpc_exception.type_ref, b.rpc_exception.type_ref);
        assert_ne!(a.peer.type_ref, a.tcp_transport.type_ref);
    }

    #[test]
    fn tcp_transport_roundtrip() {
        let (web, types, builtins) = setup();
        let r = builtins
            .put_tcp_transport(&web, &types, "127.0.0.1", 8760)
            .unwrap();
        let value = web.summon(&types, &r).unwrap();
        assert_eq!(
            tcp_transport_addr(&value),
            Some(("127.0.0.1".to_string(), 8760))
        );
    }

    #[test]
    fn exception_roundtrip() {
        let (web, types, builtins) = setup();
        let trace = vec!["frame 1".to_string(), "frame 2".to_string()];
        let r = builtins
            .put_exception(&web, &types, "boom", &trace)
            .unwrap();
        let value = web.summon(&types, &r).unwrap();
        assert_eq!(exception_parts(&value), ("boom".to_string(), trace));
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let value = Value::record([
            ("host", Value::String("h".into())),
            ("port", Value::Int(70_000)),
        ]);
        assert_eq!(tcp_transport_addr(&value), None);
    }
}
