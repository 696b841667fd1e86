//! Connection drivers.
//!
//! Frames come off any `AsyncRead + AsyncWrite` stream, go through the
//! session state machine, and the resulting bundles go to the
//! [`RpcEndpoint`]. One reader loop per connection owns the session; a
//! writer task owns the write half. Requests are served in their own tasks
//! so a slow servant never stalls the receive path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use tessera_core::crypto::{Identity, PublicKey};
use tessera_core::wire::{
    decode_packet, encode_packet, EncryptedPacket, SessionMessage, TransportPacket,
    TRANSPORT_ENCRYPTED, TRANSPORT_PLAIN,
};
use tessera_core::{Bundle, Ref};

use crate::builtins::tcp_transport_addr;
use crate::context::Context;
use crate::rpc::{RpcEndpoint, RpcError};
use crate::session::{ClientSession, ServerSession, SessionEvent};
use crate::types::Type;
use crate::value::Value;

const READ_CHUNK: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 256;
const EXPIRY_TICK: Duration = Duration::from_secs(1);

/// Write framed packets until the channel closes.
async fn write_loop<S>(mut writer: WriteHalf<S>, mut frames: mpsc::Receiver<Vec<u8>>)
where
    S: AsyncWrite,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(error = %e, "write failed, closing writer");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn sealed_frame(packet: &EncryptedPacket) -> Result<Vec<u8>> {
    Ok(encode_packet(&TransportPacket::encrypted(packet)?)?)
}

// ── Server ────────────────────────────────────────────────────────────────────

/// A response on its way out, sealed or not depending on how the request
/// arrived.
enum Outgoing {
    Sealed(Bundle),
    Plain(Bundle),
}

/// Serves one accepted connection.
pub struct ServerConnection {
    label: String,
    identity: Arc<Identity>,
    endpoint: Arc<RpcEndpoint>,
    session: ServerSession,
    shutdown: broadcast::Receiver<()>,
}

impl ServerConnection {
    pub fn new(
        label: String,
        identity: Arc<Identity>,
        endpoint: Arc<RpcEndpoint>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let settings = &endpoint.context().settings;
        let session = ServerSession::new(settings.max_pending, settings.pending_ttl);
        Self {
            label,
            identity,
            endpoint,
            session,
            shutdown,
        }
    }

    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
        let writer_task = tokio::spawn(write_loop(writer, frame_rx));
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(QUEUE_DEPTH);

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut tick = tokio::time::interval(EXPIRY_TICK);
        tracing::debug!(peer = %self.label, "connection opened");

        let result = loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(peer = %self.label, "connection closing for shutdown");
                    break Ok(());
                }

                _ = tick.tick() => {
                    for payload in self.session.expire(Instant::now()) {
                        self.reject(payload, &out_tx);
                    }
                }

                Some(out) = out_rx.recv() => {
                    if let Err(e) = self.send(out, &frame_tx).await {
                        tracing::warn!(peer = %self.label, error = %e, "failed to send response");
                    }
                }

                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => break Ok(()),
                        Ok(_) => {}
                        Err(e) => break Err(anyhow!(e).context("read failed")),
                    }
                    // A framing error means the stream is out of sync for good.
                    loop {
                        match decode_packet(&mut buf) {
                            Ok(Some(packet)) => self.on_packet(packet, &out_tx, &frame_tx).await,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(peer = %self.label, error = %e, "bad frame, closing");
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        };

        drop(frame_tx);
        let _ = writer_task.await;
        tracing::debug!(peer = %self.label, "connection closed");
        result
    }

    async fn on_packet(
        &mut self,
        packet: TransportPacket,
        out_tx: &mpsc::Sender<Outgoing>,
        frame_tx: &mpsc::Sender<Vec<u8>>,
    ) {
        match packet.transport_id.as_str() {
            TRANSPORT_ENCRYPTED => {
                let encrypted = match EncryptedPacket::decode(&packet.data) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(peer = %self.label, error = %e, "undecodable encrypted packet");
                        return;
                    }
                };
                let events = match self.session.receive(&self.identity, &encrypted, Instant::now()) {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(peer = %self.label, error = %e, "packet discarded");
                        return;
                    }
                };
                for event in events {
                    self.on_event(event, out_tx, frame_tx).await;
                }
            }
            TRANSPORT_PLAIN if self.endpoint.context().settings.allow_plain => {
                match Bundle::decode(&packet.data) {
                    Ok(bundle) => self.serve(vec![bundle], out_tx, Outgoing::Plain),
                    Err(e) => tracing::warn!(peer = %self.label, error = %e, "undecodable plain bundle"),
                }
            }
            other => {
                tracing::warn!(peer = %self.label, transport = other, "transport not accepted");
            }
        }
    }

    async fn on_event(
        &mut self,
        event: SessionEvent,
        out_tx: &mpsc::Sender<Outgoing>,
        frame_tx: &mpsc::Sender<Vec<u8>>,
    ) {
        match event {
            SessionEvent::Send(message) => {
                let sent = self
                    .session
                    .seal(&message)
                    .map_err(anyhow::Error::from)
                    .and_then(|p| sealed_frame(&p));
                match sent {
                    Ok(frame) => {
                        let _ = frame_tx.send(frame).await;
                    }
                    Err(e) => tracing::warn!(peer = %self.label, error = %e, "failed to seal"),
                }
            }
            SessionEvent::Deliver(payload) => {
                if let Some(bundle) = self.decode_payload(&payload) {
                    self.serve(vec![bundle], out_tx, Outgoing::Sealed);
                }
            }
            SessionEvent::Replay(payloads) => {
                tracing::debug!(peer = %self.label, count = payloads.len(), "replaying queued requests");
                let bundles = payloads
                    .iter()
                    .filter_map(|p| self.decode_payload(p))
                    .collect();
                self.serve(bundles, out_tx, Outgoing::Sealed);
            }
            SessionEvent::Reject(payload) => self.reject(payload, out_tx),
            SessionEvent::Authenticated(ids) => {
                tracing::info!(
                    peer = %self.label,
                    keys = ids.len(),
                    key = ids.first().map(|id| hex::encode(&id[..8])).unwrap_or_default(),
                    "session authenticated"
                );
            }
        }
    }

    fn decode_payload(&self, payload: &[u8]) -> Option<Bundle> {
        match Bundle::decode(payload) {
            Ok(b) => Some(b),
            Err(e) => {
                tracing::warn!(peer = %self.label, error = %e, "undecodable payload bundle");
                None
            }
        }
    }

    /// Handle bundles one after another in a task of their own.
    fn serve(&self, bundles: Vec<Bundle>, out_tx: &mpsc::Sender<Outgoing>, wrap: fn(Bundle) -> Outgoing) {
        let endpoint = self.endpoint.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            for bundle in bundles {
                if let Some(response) = endpoint.handle_bundle(bundle).await {
                    if out_tx.send(wrap(response)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn reject(&self, payload: Vec<u8>, out_tx: &mpsc::Sender<Outgoing>) {
        let Some(bundle) = self.decode_payload(&payload) else {
            return;
        };
        if let Some(response) = self.endpoint.not_authorized(&bundle) {
            if out_tx.try_send(Outgoing::Sealed(response)).is_err() {
                tracing::warn!(peer = %self.label, "response queue full, NotAuthorized dropped");
            }
        }
    }

    async fn send(&self, out: Outgoing, frame_tx: &mpsc::Sender<Vec<u8>>) -> Result<()> {
        let frame = match out {
            Outgoing::Sealed(bundle) => {
                let message = SessionMessage::Payload(bundle.encode()?);
                sealed_frame(&self.session.seal(&message)?)?
            }
            Outgoing::Plain(bundle) => encode_packet(&TransportPacket::plain(bundle.encode()?))?,
        };
        frame_tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("writer closed"))
    }
}

/// Accept connections until shutdown, one task each.
pub async fn accept_loop(
    listener: TcpListener,
    identity: Arc<Identity>,
    endpoint: Arc<RpcEndpoint>,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let mut stop = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = stop.recv() => {
                tracing::info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let conn = ServerConnection::new(
                    addr.to_string(),
                    identity.clone(),
                    endpoint.clone(),
                    shutdown.subscribe(),
                );
                tokio::spawn(async move {
                    if let Err(e) = conn.run(stream).await {
                        tracing::warn!(peer = %addr, error = %e, "connection ended with error");
                    }
                });
            }
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

enum Mode {
    Encrypted(ClientSession),
    Plain,
}

/// An open client connection. Calls may be issued concurrently.
pub struct Connection {
    endpoint: Arc<RpcEndpoint>,
    outbound: mpsc::Sender<Bundle>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Start an encrypted session over `stream`. The session key goes out
    /// with the first call; the challenge that follows is answered with
    /// every identity in `identities`.
    pub fn open<S>(
        stream: S,
        server_key: PublicKey,
        identities: Vec<Arc<Identity>>,
        endpoint: Arc<RpcEndpoint>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tracing::debug!(server = hex::encode(&server_key.id()[..8]), "opening session");
        Self::start(stream, Mode::Encrypted(ClientSession::new(server_key, identities)), endpoint)
    }

    /// Unencrypted connection to a listener that allows it.
    pub fn open_plain<S>(stream: S, endpoint: Arc<RpcEndpoint>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, Mode::Plain, endpoint)
    }

    fn start<S>(stream: S, mode: Mode, endpoint: Arc<RpcEndpoint>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel::<Bundle>(QUEUE_DEPTH);
        let task = tokio::spawn(drive_client(
            stream,
            mode,
            endpoint.clone(),
            outbound.clone(),
            outbound_rx,
        ));
        Self {
            endpoint,
            outbound,
            task,
        }
    }

    pub fn endpoint(&self) -> &Arc<RpcEndpoint> {
        &self.endpoint
    }

    pub async fn call<'a>(
        &self,
        target: &Ref,
        args: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Value, RpcError> {
        self.endpoint.call(&self.outbound, target, args).await
    }

    pub async fn call_typed(
        &self,
        target: &Ref,
        args: Vec<(String, Value, Arc<Type>)>,
    ) -> Result<(Value, Arc<Type>), RpcError> {
        self.endpoint.call_typed(&self.outbound, target, args).await
    }

    /// Stop the driver. Outstanding calls fail with `Stopping`.
    pub async fn shutdown(&self) {
        self.task.abort();
        self.endpoint.stop().await;
    }

    pub async fn close(self) {
        self.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drive_client<S>(
    stream: S,
    mut mode: Mode,
    endpoint: Arc<RpcEndpoint>,
    outbound: mpsc::Sender<Bundle>,
    mut outbound_rx: mpsc::Receiver<Bundle>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_loop(writer, frame_rx));
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            Some(bundle) = outbound_rx.recv() => {
                let frame = bundle
                    .encode()
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| client_frame(&mut mode, SessionMessage::Payload(bytes)));
                match frame {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to frame request"),
                }
            }

            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        break;
                    }
                }
                let mut desync = false;
                loop {
                    match decode_packet(&mut buf) {
                        Ok(Some(packet)) => {
                            on_client_packet(&mut mode, packet, &endpoint, &outbound, &frame_tx).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "bad frame from server");
                            desync = true;
                            break;
                        }
                    }
                }
                if desync {
                    break;
                }
            }
        }
    }

    tracing::debug!("client connection closed");
    endpoint.stop().await;
    drop(frame_tx);
    let _ = writer_task.await;
}

fn client_frame(mode: &mut Mode, message: SessionMessage) -> Result<Vec<u8>> {
    match mode {
        Mode::Encrypted(session) => sealed_frame(&session.seal(&message)?),
        Mode::Plain => match message {
            SessionMessage::Payload(bytes) => Ok(encode_packet(&TransportPacket::plain(bytes))?),
            _ => bail!("plain connections carry payloads only"),
        },
    }
}

async fn on_client_packet(
    mode: &mut Mode,
    packet: TransportPacket,
    endpoint: &Arc<RpcEndpoint>,
    outbound: &mpsc::Sender<Bundle>,
    frame_tx: &mpsc::Sender<Vec<u8>>,
) {
    let payload = match (mode, packet.transport_id.as_str()) {
        (Mode::Encrypted(session), TRANSPORT_ENCRYPTED) => {
            let event = EncryptedPacket::decode(&packet.data)
                .map_err(Into::into)
                .and_then(|p| session.receive(&p));
            match event {
                Ok(Some(SessionEvent::Deliver(payload))) => payload,
                Ok(Some(SessionEvent::Send(reply))) => {
                    match session.seal(&reply).map_err(anyhow::Error::from).and_then(|p| sealed_frame(&p)) {
                        Ok(frame) => {
                            let _ = frame_tx.send(frame).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to answer challenge"),
                    }
                    return;
                }
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "packet from server discarded");
                    return;
                }
            }
        }
        (Mode::Plain, TRANSPORT_PLAIN) => packet.data,
        (_, other) => {
            tracing::warn!(transport = other, "unexpected transport from server");
            return;
        }
    };

    let bundle = match Bundle::decode(&payload) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable bundle from server");
            return;
        }
    };
    // Requests from the server are answered like any other.
    let endpoint = endpoint.clone();
    let outbound = outbound.clone();
    tokio::spawn(async move {
        if let Some(response) = endpoint.handle_bundle(bundle).await {
            let _ = outbound.send(response).await;
        }
    });
}

/// Dials peers by ref.
pub struct Client {
    ctx: Arc<Context>,
    identities: Vec<Arc<Identity>>,
}

impl Client {
    pub fn new(ctx: Arc<Context>, identities: Vec<Arc<Identity>>) -> Self {
        Self { ctx, identities }
    }

    fn endpoint(&self) -> Result<Arc<RpcEndpoint>> {
        let mut endpoint = RpcEndpoint::new(self.ctx.clone());
        if let Some(first) = self.identities.first() {
            let me = self.ctx.put_peer(first.public_key())?;
            endpoint = endpoint.with_sender(me);
        }
        Ok(Arc::new(endpoint))
    }

    pub async fn connect(&self, addr: SocketAddr, server_key: PublicKey) -> Result<Connection> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(Connection::open(
            stream,
            server_key,
            self.identities.clone(),
            self.endpoint()?,
        ))
    }

    /// Connect to the node `peer_ref` names, trying each of its
    /// `tcp_transport` routes in turn.
    pub async fn connect_peer(&self, peer_ref: &Ref) -> Result<Connection> {
        let peer = self
            .ctx
            .summon(peer_ref)
            .with_context(|| format!("unknown peer {}", peer_ref.short()))?;
        let der = peer
            .field("public_key_der")
            .and_then(Value::as_bytes)
            .ok_or_else(|| anyhow!("{} is not a peer record", peer_ref.short()))?;
        let server_key = PublicKey::from_der(der)?;

        for transport in self.ctx.routes.resolve(peer_ref) {
            let Some((host, port)) = self
                .ctx
                .summon(&transport)
                .ok()
                .as_ref()
                .and_then(tcp_transport_addr)
            else {
                continue;
            };
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::info!(peer = %peer_ref.short(), host, port, "connected");
                    return Ok(Connection::open(
                        stream,
                        server_key,
                        self.identities.clone(),
                        self.endpoint()?,
                    ));
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_ref.short(), host, port, error = %e, "transport unreachable");
                }
            }
        }
        bail!("no reachable tcp transport for peer {}", peer_ref.short())
    }
}
