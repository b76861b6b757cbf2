//! The pluggable encryption contract (`spec.md` §4.8) plus one concrete
//! implementation so the workspace is runnable without the caller
//! supplying their own crypto.
//!
//! `conduit::Connection` only ever depends on the `MessageEncryption` and
//! `KeyExchange` traits below — never on `ChaChaEncryption` or
//! `X25519Exchange` directly — matching the spec's framing of encryption
//! as an external collaborator reached through
//! `IMessageEncryption{SetKey, Encrypt, Decrypt}` and a Diffie-Hellman
//! primitive producing a shared secret.

use crate::error::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Symmetric encryption applied to user payloads once a connection has
/// negotiated (or been configured with) a shared key. Implementors
/// encrypt/decrypt whole payloads; the transport never inspects
/// plaintext beyond treating it as an opaque byte string.
pub trait MessageEncryption: Send {
    /// Installs (or replaces) the symmetric key.
    fn set_key(&mut self, key: &[u8; 32]);

    /// Encrypts `plain`, returning ciphertext (including any MAC/tag).
    /// `nonce` must be unique per key for the lifetime of the key — the
    /// connection's sequence number is used for this.
    fn encrypt(&mut self, nonce: u64, plain: &[u8]) -> Vec<u8>;

    /// Decrypts `cipher` produced by the peer's `encrypt` under the same
    /// key and nonce.
    fn decrypt(&mut self, nonce: u64, cipher: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Bytes of overhead `encrypt` adds on top of the plaintext length —
    /// used for MTU/fragmentation-size arithmetic.
    fn overhead(&self) -> usize;
}

/// Diffie-Hellman key agreement, run once per connection during the
/// `Connected -> ConnectedSecured` transition.
pub trait KeyExchange: Sized {
    type PublicKey: AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Generates a fresh key pair, returning the private half and the
    /// public half to transmit to the peer.
    fn generate() -> (Self, Self::PublicKey);

    /// Consumes the private half and the peer's public half to derive a
    /// 32-byte shared secret.
    fn shared_secret(self, their_public: &Self::PublicKey) -> [u8; 32];
}

/// ChaCha20-Poly1305 AEAD, keyed by a 32-byte secret (typically the
/// output of `X25519Exchange::shared_secret`, or a fixed configured key).
pub struct ChaChaEncryption {
    cipher: Option<ChaCha20Poly1305>,
}

impl ChaChaEncryption {
    pub fn new() -> Self {
        ChaChaEncryption { cipher: None }
    }

    #[inline]
    fn nonce_bytes(nonce: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&nonce.to_le_bytes());
        Nonce::from(bytes)
    }
}

impl Default for ChaChaEncryption {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageEncryption for ChaChaEncryption {
    fn set_key(&mut self, key: &[u8; 32]) {
        self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(key)));
    }

    fn encrypt(&mut self, nonce: u64, plain: &[u8]) -> Vec<u8> {
        let cipher = self.cipher.as_ref().expect("encryption key not set");
        cipher
            .encrypt(&Self::nonce_bytes(nonce), plain)
            .expect("chacha20poly1305 encryption cannot fail for well-formed input")
    }

    fn decrypt(&mut self, nonce: u64, cipher_text: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().expect("encryption key not set");
        cipher
            .decrypt(&Self::nonce_bytes(nonce), cipher_text)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    fn overhead(&self) -> usize {
        16 // Poly1305 tag
    }
}

/// X25519 Diffie-Hellman.
pub struct X25519Exchange(EphemeralSecret);

impl KeyExchange for X25519Exchange {
    type PublicKey = [u8; 32];

    fn generate() -> (Self, Self::PublicKey) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (X25519Exchange(secret), public.to_bytes())
    }

    fn shared_secret(self, their_public: &Self::PublicKey) -> [u8; 32] {
        let their_public = PublicKey::from(*their_public);
        self.0.diffie_hellman(&their_public).to_bytes()
    }
}

/// Fills `out` with cryptographically secure random bytes, e.g. for
/// generating a fixed `EncryptionKey` or a connection nonce.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}
