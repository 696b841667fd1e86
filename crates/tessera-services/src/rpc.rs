//! RPC endpoint: outgoing calls, incoming requests, response correlation.
//!
//! Every RPC message travels as a bundle whose single root is the message
//! capsule; parameters, results and exceptions are refs into the same
//! bundle. The endpoint never touches sockets. Outgoing bundles go into an
//! `mpsc::Sender<Bundle>` the connection drains, incoming ones are handed to
//! [`RpcEndpoint::handle_bundle`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use tessera_core::codec::CodecError;
use tessera_core::message::{new_request_id, rpc_message_type_ref};
use tessera_core::{
    Bundle, Ref, RpcErrorResponse, RpcMessage, RpcParam, RpcRequest, RpcResponse,
};

use crate::builtins::exception_parts;
use crate::collector::CollectError;
use crate::context::Context;
use crate::servant::{Call, Param, Reply};
use crate::types::Type;
use crate::value::Value;
use crate::web::{BundleSource, RefSource, ResolveError, Web};

/// Exception message for requests refused before authentication.
pub const NOT_AUTHORIZED: &str = "NotAuthorized";

/// Exception message for servant panics.
pub const INTERNAL_ERROR: &str = "internal server error";

/// A response bundle and the message at its root.
#[derive(Debug)]
pub struct Inbound {
    pub message: RpcMessage,
    pub bundle: Bundle,
}

/// Decode the RPC message at the root of a bundle.
pub fn open_bundle(bundle: &Bundle) -> Result<RpcMessage, RpcError> {
    let root = bundle
        .roots
        .first()
        .ok_or_else(|| RpcError::Malformed("bundle has no root".into()))?;
    let capsule = BundleSource::new(bundle)
        .resolve_ref(root)
        .ok_or_else(|| RpcError::Malformed(format!("root {} not in bundle", root.short())))?;
    if capsule.type_ref != rpc_message_type_ref() {
        return Err(RpcError::Malformed(format!(
            "root has type {}, not an rpc message",
            capsule.type_ref.short()
        )));
    }
    Ok(RpcMessage::from_capsule(&capsule)?)
}

// ── Pending calls ─────────────────────────────────────────────────────────────

/// Outstanding calls by request id, one oneshot per call.
///
/// Each slot is removed exactly once: by its response, by its caller
/// giving up, or by [`cancel_all`](Self::cancel_all).
#[derive(Default)]
pub struct PendingCalls {
    slots: Mutex<HashMap<String, oneshot::Sender<Inbound>>>,
    stopped: AtomicBool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, request_id: &str) -> Result<oneshot::Receiver<Inbound>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().await;
        // Checked under the lock so a concurrent cancel_all cannot miss us.
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Stopping);
        }
        if slots.insert(request_id.to_string(), tx).is_some() {
            return Err(RpcError::Malformed(format!("request id {request_id} reused")));
        }
        Ok(rx)
    }

    /// Hand a response to its waiter. Returns false if nobody was waiting.
    pub async fn complete(&self, inbound: Inbound) -> bool {
        let request_id = inbound.message.request_id().to_string();
        let Some(tx) = self.slots.lock().await.remove(&request_id) else {
            tracing::debug!(request_id, "response for no pending call, dropped");
            return false;
        };
        // A waiter that timed out between our remove and this send is fine.
        tx.send(inbound).is_ok()
    }

    pub async fn remove(&self, request_id: &str) -> bool {
        self.slots.lock().await.remove(request_id).is_some()
    }

    /// Refuse new calls and wake every waiter with `Stopping`.
    pub async fn cancel_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        self.stopped.store(true, Ordering::SeqCst);
        let n = slots.len();
        slots.clear();
        n
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

pub struct RpcEndpoint {
    ctx: Arc<Context>,
    pending: PendingCalls,
    sender_peer_ref: Option<Ref>,
    timeout: Duration,
}

impl RpcEndpoint {
    pub fn new(ctx: Arc<Context>) -> Self {
        let timeout = ctx.settings.rpc_timeout;
        Self {
            ctx,
            pending: PendingCalls::new(),
            sender_peer_ref: None,
            timeout,
        }
    }

    /// Identify outgoing requests as coming from `peer`.
    pub fn with_sender(mut self, peer: Ref) -> Self {
        self.sender_peer_ref = Some(peer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Call `target` with keyword arguments whose types are deduced.
    pub async fn call<'a>(
        &self,
        outbound: &mpsc::Sender<Bundle>,
        target: &Ref,
        args: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Value, RpcError> {
        let mut typed = Vec::new();
        for (name, value) in args {
            let t = self
                .ctx
                .types
                .deduce(&value)
                .ok_or_else(|| RpcError::CannotDeduce(name.to_string()))?;
            typed.push((name.to_string(), value, t));
        }
        self.call_typed(outbound, target, typed)
            .await
            .map(|(value, _)| value)
    }

    /// Call `target` with explicitly typed keyword arguments.
    pub async fn call_typed(
        &self,
        outbound: &mpsc::Sender<Bundle>,
        target: &Ref,
        args: Vec<(String, Value, Arc<Type>)>,
    ) -> Result<(Value, Arc<Type>), RpcError> {
        let mut params = Vec::with_capacity(args.len());
        for (name, value, t) in args {
            let value = self.ctx.put(&value, &t)?;
            params.push(RpcParam { name, value });
        }

        let request_id = new_request_id();
        let message = RpcMessage::Request(RpcRequest {
            request_id: request_id.clone(),
            target_ref: target.clone(),
            params,
            sender_peer_ref: self.sender_peer_ref.clone(),
        });
        let bundle = self.bundle_message(&self.ctx.web, &message)?;

        let rx = self.pending.register(&request_id).await?;
        tracing::debug!(request_id, target = %target.short(), "sending request");
        if outbound.send(bundle).await.is_err() {
            self.pending.remove(&request_id).await;
            return Err(RpcError::SendFailed);
        }

        let inbound = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(inbound)) => inbound,
            Ok(Err(_)) => return Err(RpcError::Stopping),
            Err(_) => {
                self.pending.remove(&request_id).await;
                tracing::warn!(request_id, timeout = ?self.timeout, "no response");
                return Err(RpcError::TimeoutWaitingForResponse {
                    request_id,
                    timeout: self.timeout,
                });
            }
        };
        self.interpret(inbound)
    }

    /// Decode a response in the scope of its own bundle.
    fn interpret(&self, inbound: Inbound) -> Result<(Value, Arc<Type>), RpcError> {
        let scoped = self
            .ctx
            .web
            .with_source(Arc::new(BundleSource::new(&inbound.bundle)));
        match inbound.message {
            RpcMessage::Response(response) => {
                Ok(scoped.summon_with_t(&self.ctx.types, &response.result_ref)?)
            }
            RpcMessage::Error(error) => {
                let value = scoped.summon(&self.ctx.types, &error.exception_ref)?;
                let (message, traceback) = exception_parts(&value);
                if message == NOT_AUTHORIZED {
                    return Err(RpcError::NotAuthorized);
                }
                Err(RpcError::Remote { message, traceback })
            }
            RpcMessage::Request(request) => Err(RpcError::Malformed(format!(
                "request {} delivered as a response",
                request.request_id
            ))),
        }
    }

    /// Process one incoming bundle. Returns the response to send back when
    /// the bundle was a request.
    pub async fn handle_bundle(&self, bundle: Bundle) -> Option<Bundle> {
        let message = match open_bundle(&bundle) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable rpc bundle");
                return None;
            }
        };
        self.ctx.routes.learn(&bundle.route_list);

        match message {
            RpcMessage::Request(request) => match self.handle_request(&bundle, &request).await {
                Ok(response) => Some(response),
                Err(e) => {
                    tracing::warn!(request_id = request.request_id, error = %e, "failed to build response");
                    None
                }
            },
            message => {
                self.pending.complete(Inbound { message, bundle }).await;
                None
            }
        }
    }

    /// Invoke the servant a request names and bundle the outcome.
    ///
    /// Servant errors and panics become error responses; only a failure to
    /// build the response itself is returned as `Err`.
    pub async fn handle_request(&self, bundle: &Bundle, request: &RpcRequest) -> Result<Bundle, RpcError> {
        let scoped = self.ctx.web.with_source(Arc::new(BundleSource::new(bundle)));
        let request_id = request.request_id.clone();

        let message = match self.invoke(&scoped, request).await {
            Ok(reply) => {
                let result_ref =
                    self.ctx
                        .mosaic()
                        .put(&scoped, &self.ctx.types, &reply.value, &reply.t)?;
                tracing::debug!(request_id, result = %result_ref.short(), "request served");
                RpcMessage::Response(RpcResponse {
                    request_id,
                    result_ref,
                })
            }
            Err(failure) => {
                tracing::warn!(request_id, error = %failure.message, "request failed");
                self.error_message(&scoped, request_id, &failure)?
            }
        };
        self.bundle_message(&scoped, &message)
    }

    /// Resolve the servant and its arguments, then run it on the blocking
    /// pool so a slow servant does not hold up the runtime.
    async fn invoke(&self, web: &Web, request: &RpcRequest) -> Result<Reply, Failure> {
        let types = &self.ctx.types;
        let target = web.resolve_ref(&request.target_ref).map_err(Failure::from_error)?;
        let target_value = web.summon(types, &request.target_ref).map_err(Failure::from_error)?;
        let servant = self
            .ctx
            .actors
            .resolve(&target.type_ref, &target_value)
            .map_err(Failure::from_anyhow)?;

        let params = request
            .params
            .iter()
            .map(|p| {
                let (value, t) = web.summon_with_t(types, &p.value)?;
                Ok(Param {
                    name: p.name.clone(),
                    value,
                    t,
                })
            })
            .collect::<Result<Vec<_>, ResolveError>>()
            .map_err(Failure::from_error)?;

        let ctx = self.ctx.clone();
        let sender_peer_ref = request.sender_peer_ref.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let call = Call {
                params: &params,
                sender_peer_ref: sender_peer_ref.as_ref(),
                types: &ctx.types,
            };
            catch_unwind(AssertUnwindSafe(|| servant.invoke(&call)))
        })
        .await;
        match outcome {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(e))) => Err(Failure::from_anyhow(e)),
            Ok(Err(panic)) => Err(Failure::panicked(panic)),
            Err(e) => Err(Failure {
                message: INTERNAL_ERROR.to_string(),
                traceback: vec![e.to_string()],
            }),
        }
    }

    fn error_message(&self, web: &Web, request_id: String, failure: &Failure) -> Result<RpcMessage, RpcError> {
        let exception_ref = self.ctx.builtins.put_exception(
            web,
            &self.ctx.types,
            &failure.message,
            &failure.traceback,
        )?;
        Ok(RpcMessage::Error(RpcErrorResponse {
            request_id,
            exception_ref,
        }))
    }

    /// Error response for a request that could not be held until the peer
    /// authenticated. `None` if the bundle was not a request.
    pub fn not_authorized(&self, bundle: &Bundle) -> Option<Bundle> {
        let RpcMessage::Request(request) = open_bundle(bundle).ok()? else {
            return None;
        };
        let failure = Failure {
            message: NOT_AUTHORIZED.to_string(),
            traceback: vec!["request cannot be queued before authentication".to_string()],
        };
        let web = &self.ctx.web;
        let built = self
            .error_message(web, request.request_id.clone(), &failure)
            .and_then(|m| self.bundle_message(web, &m));
        match built {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::warn!(request_id = request.request_id, error = %e, "failed to build NotAuthorized response");
                None
            }
        }
    }

    /// Collect `message` and everything it references. The message capsule
    /// itself is not stored in the Mosaic.
    fn bundle_message(&self, web: &Web, message: &RpcMessage) -> Result<Bundle, RpcError> {
        let (root, capsule) = message.to_capsule()?;
        let web = web.with_source(Arc::new(BundleSource::from_capsules([&capsule])));
        let collection = self.ctx.collect(&web, &[root])?;
        Ok(collection.bundle)
    }

    /// Cancel every outstanding call and refuse new ones.
    pub async fn stop(&self) {
        let cancelled = self.pending.cancel_all().await;
        tracing::info!(cancelled, "rpc endpoint stopped");
    }
}

/// A servant failure on its way into an `rpc_exception`.
struct Failure {
    message: String,
    traceback: Vec<String>,
}

impl Failure {
    fn from_error(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::from_anyhow(anyhow::Error::new(e))
    }

    fn from_anyhow(e: anyhow::Error) -> Self {
        let mut traceback: Vec<String> = e.chain().skip(1).map(|c| c.to_string()).collect();
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            traceback.extend(backtrace.to_string().lines().map(str::to_string));
        }
        Self {
            message: e.to_string(),
            traceback,
        }
    }

    fn panicked(panic: Box<dyn Any + Send>) -> Self {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "servant panicked".to_string());
        Self {
            message: INTERNAL_ERROR.to_string(),
            traceback: vec![detail],
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("timed out after {timeout:?} waiting for response to {request_id}")]
    TimeoutWaitingForResponse { request_id: String, timeout: Duration },

    #[error("remote error: {message}")]
    Remote {
        message: String,
        traceback: Vec<String>,
    },

    #[error("rpc endpoint is stopping")]
    Stopping,

    #[error("connection closed before the request was sent")]
    SendFailed,

    #[error("request refused: peer not authenticated")]
    NotAuthorized,

    #[error("cannot deduce the type of parameter {0:?}")]
    CannotDeduce(String),

    #[error("malformed rpc bundle: {0}")]
    Malformed(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
