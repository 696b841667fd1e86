//! tessera-services — stores, resolvers, type system, sessions and RPC.
//!
//! Everything a node runs between the wire format in `tessera-core` and the
//! daemon binary.

pub mod builtins;
pub mod cache;
pub mod collector;
pub mod connection;
pub mod context;
pub mod mosaic;
pub mod route;
pub mod rpc;
pub mod servant;
pub mod session;
pub mod types;
pub mod value;
pub mod web;

pub use builtins::Builtins;
pub use cache::CapsuleCache;
pub use collector::{CollectError, Collection, Collector};
pub use connection::{accept_loop, Client, Connection, ServerConnection};
pub use context::{Context, Settings};
pub use mosaic::Mosaic;
pub use route::{RouteResolver, RouteSource, RouteTable};
pub use rpc::{RpcEndpoint, RpcError};
pub use servant::{ActorFactory, ActorRegistry, Call, NamedServants, Param, Reply, Servant};
pub use session::{ClientSession, ServerSession, SessionError, SessionEvent, SessionState};
pub use types::{Primitive, Type, TypeError, TypeSystem};
pub use value::Value;
pub use web::{BundleSource, RefSource, ResolveError, Web};
