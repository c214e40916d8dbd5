//! Cryptographic primitives for Covault.
//!
//! Wraps Ed25519 signing, X25519 sealing, ChaCha20-Poly1305 encryption and
//! Blake3 hashing with strong types. Everything above this module consumes
//! crypto through the [`CryptoProvider`] trait; [`NativeCrypto`] is the
//! implementation shipped with the crate.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{CoreError, Result};
use crate::ids::AgentId;

const SEAL_KEY_CONTEXT: &str = "covault 2024-06 seal key";
const SEAL_NONCE_CONTEXT: &str = "covault 2024-06 seal nonce";

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash under a derive-key context, for domain separation.
    pub fn derive(context: &str, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero hash (start of every session chain).
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Blake3Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-byte Ed25519 public key (the signing half of an agent).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ed25519PublicKey(pub [u8; 32]);

impl Ed25519PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        Ok(Self(decode_32(s)?))
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

/// A 64-byte Ed25519 signature, rendered as `sig_<hex>` on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig_{}", self.to_hex())
    }
}

impl FromStr for Ed25519Signature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("sig_")
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        let bytes = hex::decode(hex_part).map_err(|e| CoreError::MalformedId(e.to_string()))?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CoreError::MalformedId(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl From<Ed25519Signature> for String {
    fn from(sig: Ed25519Signature) -> Self {
        sig.to_string()
    }
}

impl TryFrom<String> for Ed25519Signature {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// A keypair for signing session checkpoints.
///
/// This wraps ed25519-dalek's SigningKey.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        let sig = self.signing_key.sign(message);
        Ed25519Signature(sig.to_bytes())
    }

    /// Get the raw seed bytes (secret key material).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// An X25519 public key (the sealing half of an agent).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        Ok(Self(decode_32(s)?))
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519Pub({})", &self.to_hex()[..16])
    }
}

/// An X25519 static secret key.
///
/// Unlike Ed25519, X25519 keys are only for key agreement, not signing.
#[derive(Clone)]
pub struct X25519Secret(StaticSecret);

impl X25519Secret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(StaticSecret::from(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(*PublicKey::from(&self.0).as_bytes())
    }

    fn diffie_hellman(&self, peer: &X25519PublicKey) -> [u8; 32] {
        *self.0.diffie_hellman(&peer.to_dalek()).as_bytes()
    }
}

/// A 256-bit symmetric key protecting private transactions of a group.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(pub [u8; 32]);

impl KeySecret {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(..)")
    }
}

impl fmt::Display for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keySecret_{}", hex::encode(self.0))
    }
}

impl FromStr for KeySecret {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("keySecret_")
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        let bytes = decode_32(hex_part).map_err(|e| CoreError::MalformedId(e.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Both secret halves of an agent: one for signing, one for unsealing.
#[derive(Clone)]
pub struct AgentSecret {
    pub signer: Keypair,
    pub sealer: X25519Secret,
}

impl AgentSecret {
    pub fn generate() -> Self {
        Self {
            signer: Keypair::generate(),
            sealer: X25519Secret::generate(),
        }
    }

    /// Deterministic agent from a seed, for tests and fixtures.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let sealer_seed = Blake3Hash::derive("covault 2024-06 sealer seed", seed);
        Self {
            signer: Keypair::from_seed(seed),
            sealer: X25519Secret::from_bytes(sealer_seed.0),
        }
    }

    pub fn id(&self) -> AgentId {
        AgentId::new(self.signer.public_key(), self.sealer.public_key())
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentSecret({})", self.id())
    }
}

/// The cryptographic capabilities the rest of the system consumes.
///
/// Any implementation (native, WASM, hardware-backed) that satisfies this
/// contract is interchangeable. Encryption is deterministic: the nonce is
/// derived from `nonce_material` by keyed hashing, never drawn at random.
pub trait CryptoProvider: Send + Sync {
    fn sign(&self, secret: &Keypair, message: &[u8]) -> Ed25519Signature;

    fn verify(&self, signature: &Ed25519Signature, message: &[u8], public: &Ed25519PublicKey)
        -> bool;

    /// Authenticated asymmetric encryption to `to`, using a fresh ephemeral key.
    fn seal(&self, message: &[u8], to: &X25519PublicKey, nonce_material: &[u8]) -> Result<Vec<u8>>;

    fn unseal(&self, sealed: &[u8], recipient: &X25519Secret, nonce_material: &[u8])
        -> Result<Vec<u8>>;

    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8], key: &KeySecret, nonce_material: &[u8])
        -> Result<Vec<u8>>;

    /// Blake3, optionally under a derive-key context.
    fn hash(&self, data: &[u8], context: Option<&str>) -> Blake3Hash;

    fn random_bytes(&self, len: usize) -> Vec<u8>;

    fn new_key_secret(&self) -> KeySecret {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.random_bytes(32));
        KeySecret(bytes)
    }
}

/// Pure-Rust provider built on dalek, chacha20poly1305 and blake3.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCrypto;

impl NativeCrypto {
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &[u8; 32]) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(key).map_err(|e| CoreError::EncryptionError(e.to_string()))
    }

    fn keyed_nonce(key: &[u8; 32], nonce_material: &[u8]) -> [u8; 12] {
        let digest = blake3::keyed_hash(key, nonce_material);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest.as_bytes()[..12]);
        nonce
    }

    fn seal_key(shared: &[u8; 32], ephemeral: &X25519PublicKey, to: &X25519PublicKey) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(SEAL_KEY_CONTEXT);
        hasher.update(shared);
        hasher.update(ephemeral.as_bytes());
        hasher.update(to.as_bytes());
        *hasher.finalize().as_bytes()
    }

    fn seal_nonce(nonce_material: &[u8]) -> [u8; 12] {
        let digest = Blake3Hash::derive(SEAL_NONCE_CONTEXT, nonce_material);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest.0[..12]);
        nonce
    }
}

impl CryptoProvider for NativeCrypto {
    fn sign(&self, secret: &Keypair, message: &[u8]) -> Ed25519Signature {
        secret.sign(message)
    }

    fn verify(
        &self,
        signature: &Ed25519Signature,
        message: &[u8],
        public: &Ed25519PublicKey,
    ) -> bool {
        public.verify(message, signature).is_ok()
    }

    fn seal(&self, message: &[u8], to: &X25519PublicKey, nonce_material: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
        let ephemeral_public = X25519PublicKey(*PublicKey::from(&ephemeral).as_bytes());
        let shared = ephemeral.diffie_hellman(&to.to_dalek());

        let key = Self::seal_key(shared.as_bytes(), &ephemeral_public, to);
        let nonce = Self::seal_nonce(nonce_material);
        let ciphertext = Self::cipher(&key)?
            .encrypt(Nonce::from_slice(&nonce), message)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;

        let mut sealed = Vec::with_capacity(32 + ciphertext.len());
        sealed.extend_from_slice(ephemeral_public.as_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(
        &self,
        sealed: &[u8],
        recipient: &X25519Secret,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>> {
        if sealed.len() < 32 {
            return Err(CoreError::DecryptionError("sealed message too short".into()));
        }
        let (ephemeral_bytes, ciphertext) = sealed.split_at(32);
        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let ephemeral = X25519PublicKey(ephemeral);

        let shared = recipient.diffie_hellman(&ephemeral);
        let key = Self::seal_key(&shared, &ephemeral, &recipient.public_key());
        let nonce = Self::seal_nonce(nonce_material);

        Self::cipher(&key)?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))
    }

    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::keyed_nonce(&key.0, nonce_material);
        Self::cipher(&key.0)?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &KeySecret,
        nonce_material: &[u8],
    ) -> Result<Vec<u8>> {
        let nonce = Self::keyed_nonce(&key.0, nonce_material);
        Self::cipher(&key.0)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))
    }

    fn hash(&self, data: &[u8], context: Option<&str>) -> Blake3Hash {
        match context {
            Some(context) => Blake3Hash::derive(context, data),
            None => Blake3Hash::hash(data),
        }
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

fn decode_32(s: &str) -> std::result::Result<[u8; 32], hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}
