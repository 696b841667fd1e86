//! Encrypted session state machines.
//!
//! Both sides are sans-IO: they take decoded packets in and hand back what
//! should be sent or delivered. The connection driver owns the sockets.
//!
//! Server side:
//!
//! ```text
//! Uninitialized --initial packet--> KeyEstablished --challenge sent--> ChallengeSent
//!      ChallengeSent --valid POP--> Authenticated
//! ```
//!
//! Payloads that arrive before `Authenticated` are queued, bounded in count
//! and age, and handed back in arrival order once a proof verifies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_core::crypto::{self, CryptoError, Identity, PublicKey, SessionKey, CHALLENGE_LEN};
use tessera_core::wire::{EncryptedPacket, PopRecord, SessionMessage, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    KeyEstablished,
    ChallengeSent,
    Authenticated,
}

/// What the driver should do after feeding the session a packet.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Encrypt and send this message to the peer.
    Send(SessionMessage),
    /// Process this payload now.
    Deliver(Vec<u8>),
    /// Payloads queued before authentication, oldest first. Process them
    /// one after another.
    Replay(Vec<Vec<u8>>),
    /// This payload cannot be queued; answer it with NotAuthorized.
    Reject(Vec<u8>),
    /// The proof verified for these key ids.
    Authenticated(Vec<[u8; 32]>),
}

struct Queued {
    received_at: Instant,
    payload: Vec<u8>,
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Responder half of a session.
pub struct ServerSession {
    state: SessionState,
    session_key: Option<SessionKey>,
    pop_challenge: Option<[u8; CHALLENGE_LEN]>,
    peer_public_keys: Vec<PublicKey>,
    pending: VecDeque<Queued>,
    max_pending: usize,
    pending_ttl: Duration,
}

impl ServerSession {
    pub fn new(max_pending: usize, pending_ttl: Duration) -> Self {
        Self {
            state: SessionState::Uninitialized,
            session_key: None,
            pop_challenge: None,
            peer_public_keys: Vec::new(),
            pending: VecDeque::new(),
            max_pending,
            pending_ttl,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_public_keys(&self) -> &[PublicKey] {
        &self.peer_public_keys
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decrypt one packet and advance the state machine.
    ///
    /// Errors mean the packet is discarded; the session stays usable.
    pub fn receive(
        &mut self,
        identity: &Identity,
        packet: &EncryptedPacket,
        now: Instant,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        let mut events = Vec::new();

        let plaintext = match packet {
            EncryptedPacket::Initial {
                encrypted_session_key,
                sealed,
            } => {
                if self.session_key.is_some() {
                    return Err(SessionError::SessionKeyAlreadySet);
                }
                let raw = identity.decrypt(encrypted_session_key)?;
                let key = SessionKey::from_slice(&raw)?;
                // Verify the packet under the new key before adopting it.
                let plaintext = key.open(sealed)?;
                self.session_key = Some(key);
                self.state = SessionState::KeyEstablished;
                tracing::debug!("session key established");
                plaintext
            }
            EncryptedPacket::Subsequent(sealed) => {
                let key = self.session_key.as_ref().ok_or(SessionError::NoSessionKey)?;
                key.open(sealed)?
            }
        };

        // An undecodable packet leaves the challenge unissued.
        let message = SessionMessage::decode(&plaintext)?;

        if self.pop_challenge.is_none() {
            let challenge = crypto::generate_challenge();
            self.pop_challenge = Some(challenge);
            self.state = SessionState::ChallengeSent;
            events.push(SessionEvent::Send(SessionMessage::PopChallenge { challenge }));
        }

        match message {
            SessionMessage::Payload(payload) => {
                if self.state == SessionState::Authenticated {
                    events.push(SessionEvent::Deliver(payload));
                } else {
                    self.expire_into(now, &mut events);
                    if self.pending.len() >= self.max_pending {
                        tracing::warn!(
                            queued = self.pending.len(),
                            "pre-auth queue full, rejecting request"
                        );
                        events.push(SessionEvent::Reject(payload));
                    } else {
                        self.pending.push_back(Queued {
                            received_at: now,
                            payload,
                        });
                    }
                }
            }
            SessionMessage::PopResponse {
                challenge,
                pop_records,
            } => self.verify_pop(&challenge, &pop_records, now, &mut events),
            SessionMessage::PopChallenge { .. } => {
                tracing::warn!("peer sent a challenge to the responder, ignoring");
            }
        }
        Ok(events)
    }

    fn verify_pop(
        &mut self,
        challenge: &[u8; CHALLENGE_LEN],
        records: &[PopRecord],
        now: Instant,
        events: &mut Vec<SessionEvent>,
    ) {
        if self.pop_challenge.as_ref() != Some(challenge) {
            tracing::warn!("proof of possession answers a different challenge");
            return;
        }
        let mut verified = Vec::new();
        for record in records {
            let key = match PublicKey::from_der(&record.public_key_der) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable public key in proof");
                    continue;
                }
            };
            if key.verify(challenge, &record.signature).is_err() {
                tracing::warn!(key = hex::encode(&key.id()[..8]), "proof signature rejected");
                continue;
            }
            if !self.peer_public_keys.contains(&key) {
                verified.push(key.id());
                self.peer_public_keys.push(key);
            }
        }
        if verified.is_empty() {
            return;
        }
        tracing::info!(
            keys = verified.len(),
            first = hex::encode(&verified[0][..8]),
            "peer proved possession"
        );
        events.push(SessionEvent::Authenticated(verified));
        if self.state != SessionState::Authenticated {
            self.state = SessionState::Authenticated;
            self.expire_into(now, events);
            let replay: Vec<Vec<u8>> = self.pending.drain(..).map(|q| q.payload).collect();
            if !replay.is_empty() {
                events.push(SessionEvent::Replay(replay));
            }
        }
    }

    /// Queued payloads older than the TTL, removed from the queue.
    pub fn expire(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut events = Vec::new();
        self.expire_into(now, &mut events);
        events
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Reject(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn expire_into(&mut self, now: Instant, events: &mut Vec<SessionEvent>) {
        while let Some(front) = self.pending.front() {
            if now.saturating_duration_since(front.received_at) < self.pending_ttl {
                break;
            }
            if let Some(q) = self.pending.pop_front() {
                tracing::warn!("queued request expired before authentication");
                events.push(SessionEvent::Reject(q.payload));
            }
        }
    }

    /// Encrypt an outgoing message.
    pub fn seal(&self, message: &SessionMessage) -> Result<EncryptedPacket, SessionError> {
        let key = self.session_key.as_ref().ok_or(SessionError::NoSessionKey)?;
        Ok(EncryptedPacket::Subsequent(key.seal(&message.encode()?)))
    }

    /// The session key, for handing to a writer task once established.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Initiator half of a session.
///
/// The first sealed packet carries the session key wrapped for the server;
/// every later one is `Subsequent`. Challenges are answered with a
/// signature from each identity held.
pub struct ClientSession {
    session_key: SessionKey,
    server_key: PublicKey,
    identities: Vec<Arc<Identity>>,
    sent_initial: bool,
    answered_challenge: bool,
}

impl ClientSession {
    pub fn new(server_key: PublicKey, identities: Vec<Arc<Identity>>) -> Self {
        Self {
            session_key: SessionKey::generate(),
            server_key,
            identities,
            sent_initial: false,
            answered_challenge: false,
        }
    }

    pub fn seal(&mut self, message: &SessionMessage) -> Result<EncryptedPacket, SessionError> {
        let sealed = self.session_key.seal(&message.encode()?);
        if self.sent_initial {
            return Ok(EncryptedPacket::Subsequent(sealed));
        }
        let encrypted_session_key = self.server_key.encrypt(self.session_key.as_bytes())?;
        self.sent_initial = true;
        Ok(EncryptedPacket::Initial {
            encrypted_session_key,
            sealed,
        })
    }

    /// Decrypt a packet from the server.
    ///
    /// Returns the message to send back, if any, and the payload to
    /// deliver, if any.
    pub fn receive(&mut self, packet: &EncryptedPacket) -> Result<Option<SessionEvent>, SessionError> {
        let EncryptedPacket::Subsequent(sealed) = packet else {
            return Err(SessionError::UnexpectedInitial);
        };
        let plaintext = self.session_key.open(sealed)?;
        match SessionMessage::decode(&plaintext)? {
            SessionMessage::Payload(payload) => Ok(Some(SessionEvent::Deliver(payload))),
            SessionMessage::PopChallenge { challenge } => {
                if self.answered_challenge {
                    tracing::warn!("server issued a second challenge, ignoring");
                    return Ok(None);
                }
                self.answered_challenge = true;
                let pop_records = self
                    .identities
                    .iter()
                    .map(|id| {
                        Ok(PopRecord {
                            public_key_der: id.public_key().der().to_vec(),
                            signature: id.sign(&challenge)?,
                        })
                    })
                    .collect::<Result<Vec<_>, CryptoError>>()?;
                tracing::debug!(records = pop_records.len(), "answering challenge");
                Ok(Some(SessionEvent::Send(SessionMessage::PopResponse {
                    challenge,
                    pop_records,
                })))
            }
            SessionMessage::PopResponse { .. } => {
                tracing::warn!("server sent a proof response, ignoring");
                Ok(None)
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("subsequent packet before any session key")]
    NoSessionKey,

    #[error("session key already set; sessions are never renegotiated")]
    SessionKeyAlreadySet,

    #[error("request cannot be queued before authentication")]
    NotAuthorized,

    #[error("responder sent an initial packet")]
    UnexpectedInitial,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Wire(#[from] WireError),
}
