//! Cryptographic primitives for Tessera.
//!
//! Provides three things:
//!   1. Hashing: BLAKE3 content hashes, SHA-512 packet digests, SHA-256
//!      public key ids
//!   2. RSA identities: OAEP(SHA-1) key transport and PSS(SHA-256)
//!      proof-of-possession signatures
//!   3. Packet sealing: AES-256-CBC with PKCS7 padding, integrity-checked
//!      by a SHA-512 digest of the ciphertext
//!
//! The algorithm set is fixed; there is no negotiation. Session keys derive
//! ZeroizeOnDrop and their Debug output is redacted.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::capsule::array_serde;
use crate::capsule::bytes_serde;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Default RSA modulus size for generated identities.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Size of a proof-of-possession challenge.
pub const CHALLENGE_LEN: usize = 64;

// ── Hashing ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for capsule refs.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// SHA-512 digest. Guards every encrypted packet's ciphertext.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

/// SHA-256 digest. Public key ids are the SHA-256 of the DER encoding.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

// ── Public key ────────────────────────────────────────────────────────────────

/// The public half of an identity. Verifies signatures and encrypts
/// session keys.
#[derive(Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der)?;
        Ok(Self {
            key,
            der: der.to_vec(),
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(pem)?;
        Self::from_rsa(key)
    }

    /// Load a public key written by [`generate_identity`].
    pub fn load_pem(path: &Path) -> Result<Self, CryptoError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CryptoError::Io(path.to_path_buf(), e))?;
        Self::from_pem(&text)
    }

    fn from_rsa(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let der = key.to_public_key_der()?.as_bytes().to_vec();
        Ok(Self { key, der })
    }

    /// SPKI DER encoding. This is what travels in POP records.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> Result<String, CryptoError> {
        Ok(self.key.to_public_key_pem(LineEnding::LF)?)
    }

    /// Stable id: SHA-256 of the DER encoding.
    pub fn id(&self) -> [u8; 32] {
        sha256(&self.der)
    }

    /// RSA-OAEP(SHA-1) encrypt. Used to transport session keys.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::thread_rng();
        Ok(self
            .key
            .encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), plaintext)?)
    }

    /// Verify an RSA-PSS(SHA-256) signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let digest = Sha256::digest(data);
        self.key
            .verify(Pss::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.id()[..8]))
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// A long-term RSA keypair.
///
/// The private key never leaves this struct except as a PEM string written
/// to disk by [`Identity::save`].
pub struct Identity {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl Identity {
    /// Generate a fresh keypair with the given modulus size.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = PublicKey::from_rsa(private.to_public_key())?;
        Ok(Self { private, public })
    }

    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        Self::from_private(RsaPrivateKey::from_pkcs8_pem(pem)?)
    }

    /// PKCS#8 PEM of the private key. Zeroized when dropped.
    pub fn to_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        Ok(self.private.to_pkcs8_pem(LineEnding::LF)?)
    }

    /// Load an identity from a PKCS#8 PEM file.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let text = Zeroizing::new(
            std::fs::read_to_string(path).map_err(|e| CryptoError::Io(path.to_path_buf(), e))?,
        );
        Self::from_pem(&text)
    }

    /// Write the private key (mode 0600 on Unix) and the public key next to it.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CryptoError::Io(parent.to_path_buf(), e))?;
            }
        }
        let pem = self.to_pem()?;
        write_private(path, pem.as_bytes())?;

        let pub_path = public_key_path(path);
        std::fs::write(&pub_path, self.public.to_pem()?)
            .map_err(|e| CryptoError::Io(pub_path, e))?;
        Ok(())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// RSA-PSS(SHA-256) signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::thread_rng();
        let digest = Sha256::digest(data);
        Ok(self
            .private
            .sign_with_rng(&mut rng, Pss::new::<Sha256>(), &digest)?)
    }

    /// RSA-OAEP(SHA-1) decrypt.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        Ok(Zeroizing::new(
            self.private.decrypt(Oaep::new::<sha1::Sha1>(), ciphertext)?,
        ))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:?})", self.public)
    }
}

/// Path of the public key PEM written alongside a private key.
pub fn public_key_path(identity_path: &Path) -> PathBuf {
    let mut name = identity_path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

/// Create an identity and persist it as PEM files.
///
/// Fails with [`CryptoError::IdentityExists`] when `path` already exists and
/// `overwrite` is false.
pub fn generate_identity(path: &Path, overwrite: bool, bits: usize) -> Result<Identity, CryptoError> {
    if path.exists() && !overwrite {
        return Err(CryptoError::IdentityExists(path.to_path_buf()));
    }
    let identity = Identity::generate(bits)?;
    identity.save(path)?;
    Ok(identity)
}

fn write_private(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| CryptoError::Io(path.to_path_buf(), e))?;
    file.write_all(data)
        .map_err(|e| CryptoError::Io(path.to_path_buf(), e))?;
    Ok(())
}

// ── Session key ───────────────────────────────────────────────────────────────

/// Ephemeral AES-256 key securing one connection.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::BadKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt `plaintext` under a fresh random IV.
    pub fn seal(&self, plaintext: &[u8]) -> SealedBox {
        let mut cbc_iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cbc_iv);
        let encrypted_contents = Aes256CbcEnc::new(&self.0.into(), &cbc_iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let hash = sha512(&encrypted_contents);
        SealedBox {
            cbc_iv,
            encrypted_contents,
            hash,
        }
    }

    /// Verify the ciphertext digest, then decrypt.
    ///
    /// The digest is checked before any decryption so tampered packets are
    /// rejected without touching the cipher.
    pub fn open(&self, sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
        let computed = sha512(&sealed.encrypted_contents);
        if !bool::from(computed.ct_eq(&sealed.hash)) {
            return Err(CryptoError::HashMismatch);
        }
        Aes256CbcDec::new(&self.0.into(), &sealed.cbc_iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&sealed.encrypted_contents)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// AES-CBC ciphertext with its IV and integrity digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "array_serde")]
    pub cbc_iv: [u8; 16],
    #[serde(with = "bytes_serde")]
    pub encrypted_contents: Vec<u8>,
    /// SHA-512 of `encrypted_contents`.
    #[serde(with = "array_serde")]
    pub hash: [u8; 64],
}

/// Random proof-of-possession challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext hash mismatch")]
    HashMismatch,

    #[error("decryption failed (bad key or padding)")]
    Decrypt,

    #[error("session key must be 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("signature verification failed")]
    BadSignature,

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("PKCS#8 error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("SPKI error: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),

    #[error("identity already exists at {0} (pass overwrite to replace it)")]
    IdentityExists(PathBuf),

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
