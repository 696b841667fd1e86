//! Tessera integration test harness.
//!
//! Every test runs its nodes in-process on loopback TCP with fresh
//! in-memory stores, so tests are independent and need no setup:
//!
//!   cargo test --test integration
//!
//! Keys are 1024-bit to keep generation fast.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tessera_core::crypto::{Identity, PublicKey};
use tessera_core::wire::{decode_packet, encode_packet, EncryptedPacket, SessionMessage, TransportPacket};
use tessera_core::Ref;
use tessera_services::{
    accept_loop, Call, Client, ClientSession, Context, NamedServants, Primitive, Reply,
    RpcEndpoint, Servant, SessionEvent, Settings, Value,
};

mod correlation;
mod echo;
mod queuing;
mod timeouts;

pub const TEST_KEY_BITS: usize = 1024;

pub fn test_identity() -> Arc<Identity> {
    Arc::new(Identity::generate(TEST_KEY_BITS).expect("key generation"))
}

pub fn settings() -> Settings {
    Settings {
        rpc_timeout: Duration::from_secs(5),
        ..Settings::default()
    }
}

// ── Servants ──────────────────────────────────────────────────────────────────

/// Returns `msg` unchanged.
pub struct Echo;

impl Servant for Echo {
    fn invoke(&self, call: &Call<'_>) -> anyhow::Result<Reply> {
        let msg = call.param("msg").ok_or_else(|| anyhow!("missing msg"))?;
        Ok(Reply {
            value: msg.value.clone(),
            t: msg.t.clone(),
        })
    }
}

/// Records every `msg` in arrival order.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<String>>,
}

impl Servant for Recorder {
    fn invoke(&self, call: &Call<'_>) -> anyhow::Result<Reply> {
        let msg = call.str_param("msg")?.to_string();
        self.seen.lock().expect("recorder lock").push(msg.clone());
        Ok(Reply {
            value: Value::String(msg),
            t: call.types.primitive(Primitive::String),
        })
    }
}

/// Echoes after sleeping `delay_ms`.
pub struct Delayed;

impl Servant for Delayed {
    fn invoke(&self, call: &Call<'_>) -> anyhow::Result<Reply> {
        let delay = call
            .param("delay_ms")
            .and_then(|p| p.value.as_int())
            .unwrap_or(0);
        std::thread::sleep(Duration::from_millis(delay as u64));
        Echo.invoke(call)
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// A serving node on an ephemeral loopback port.
pub struct Node {
    pub identity: Arc<Identity>,
    pub ctx: Arc<Context>,
    pub peer: Ref,
    pub addr: SocketAddr,
    pub servants: Arc<NamedServants>,
    pub recorder: Arc<Recorder>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Node {
    pub async fn spawn(settings: Settings) -> Result<Self> {
        let identity = test_identity();
        let ctx = Arc::new(Context::in_memory(settings)?);
        let peer = ctx.put_peer(identity.public_key())?;

        let servants = ctx.host_servants(peer.clone());
        let recorder = Arc::new(Recorder::default());
        servants.insert("echo", Arc::new(Echo));
        servants.insert("delayed", Arc::new(Delayed));
        servants.insert("recorder", recorder.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        ctx.register_tcp_route(&peer, "127.0.0.1", addr.port())?;

        let endpoint = Arc::new(RpcEndpoint::new(ctx.clone()).with_sender(peer.clone()));
        let (shutdown, _) = broadcast::channel(1);
        let task = tokio::spawn(accept_loop(listener, identity.clone(), endpoint, shutdown.clone()));

        Ok(Self {
            identity,
            ctx,
            peer,
            addr,
            servants,
            recorder,
            shutdown,
            task,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key().clone()
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await?
    }
}

/// A calling node: its own store, its own identity.
pub struct Caller {
    pub identity: Arc<Identity>,
    pub ctx: Arc<Context>,
    pub client: Client,
}

impl Caller {
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_identities(settings, vec![test_identity()])
    }

    pub fn with_identities(settings: Settings, identities: Vec<Arc<Identity>>) -> Result<Self> {
        let ctx = Arc::new(Context::in_memory(settings)?);
        let identity = identities.first().cloned().unwrap_or_else(test_identity);
        Ok(Self {
            identity,
            client: Client::new(ctx.clone(), identities),
            ctx,
        })
    }

    /// The `servant_ref` for `name` on `node`, built from the node's key
    /// alone.
    pub fn target(&self, node: &Node, name: &str) -> Result<Ref> {
        let peer = self.ctx.put_peer(&node.public_key())?;
        Ok(self.ctx.put_servant_ref(&peer, name)?)
    }
}

// ── Raw session client ────────────────────────────────────────────────────────

/// Drives a client session by hand, for tests that need exact control over
/// packet order.
pub struct RawClient {
    stream: TcpStream,
    session: ClientSession,
    buf: BytesMut,
}

impl RawClient {
    pub async fn connect(node: &Node, identities: Vec<Arc<Identity>>) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(node.addr).await?,
            session: ClientSession::new(node.public_key(), identities),
            buf: BytesMut::new(),
        })
    }

    pub async fn send(&mut self, message: &SessionMessage) -> Result<()> {
        let packet = self.session.seal(message)?;
        let frame = encode_packet(&TransportPacket::encrypted(&packet)?)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Next event from the server. Challenges come back as `Send` events
    /// carrying the prepared proof.
    pub async fn recv(&mut self) -> Result<SessionEvent> {
        loop {
            if let Some(packet) = decode_packet(&mut self.buf)? {
                let encrypted = EncryptedPacket::decode(&packet.data)?;
                if let Some(event) = self.session.receive(&encrypted)? {
                    return Ok(event);
                }
                continue;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
                .await
                .context("server went quiet")??;
            if n == 0 {
                bail!("server closed the connection");
            }
        }
    }
}
