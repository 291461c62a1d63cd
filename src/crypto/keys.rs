//! Identity and ephemeral keypairs.
//!
//! The long-term identity keypair is externally managed: the core only
//! receives encrypt/decrypt-with-peer-public-key callbacks, never the raw
//! secret. Applications implement [`IdentityKeyPair`] over whatever
//! key-storage they use; [`LocalIdentityKeyPair`] is a ready-made
//! implementation backed by `crypto_box::SalsaBox` for tests and for
//! callers with no external identity service.
//!
//! Ephemeral keypairs (one per connection, for forward secrecy) are plain
//! `crypto_box` keypairs generated fresh by [`generate_ephemeral`] and
//! dropped once the shared box is derived in `crypto::exchange`.

use std::fmt;

use crypto_box::aead::{generic_array::GenericArray, Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

/// Failures from the box-encryption primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption rejected the input (oversized plaintext).
    EncryptFailed,
    /// AEAD decryption failed (wrong key, tampered ciphertext, or a
    /// malformed/undersized blob).
    DecryptFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncryptFailed => write!(f, "encryption failed"),
            Self::DecryptFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Encrypt `plain` for `peer_pub`, authenticated under `my_secret`. The
/// 24-byte nonce `SalsaBox::generate_nonce` produces is prepended to the
/// ciphertext so the one-shot `Encrypt(x; pub, secret)` callback shape
/// needs no separate nonce parameter.
pub fn encrypt_for(
    plain: &[u8],
    peer_pub: &PublicKey,
    my_secret: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = SalsaBox::new(peer_pub, my_secret);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|_| CryptoError::EncryptFailed)?;
    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_for`]: split the leading 24-byte nonce from `blob`
/// and decrypt the remainder under `(peer_pub, my_secret)`.
pub fn decrypt_from(
    blob: &[u8],
    peer_pub: &PublicKey,
    my_secret: &SecretKey,
) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < 24 {
        return Err(CryptoError::DecryptFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(24);
    let nonce = GenericArray::clone_from_slice(nonce_bytes);
    let cipher = SalsaBox::new(peer_pub, my_secret);
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// A long-term identity keypair, owned externally to this crate.
///
/// Implementations never hand the secret key itself across this boundary —
/// only `encrypt`/`decrypt` results, so the secret never leaves the
/// owning process.
pub trait IdentityKeyPair: Send + Sync {
    /// This identity's stable, addressable public key.
    fn public_key(&self) -> PublicKey;

    /// `Encrypt(plain; peer_pub, my_secret)`.
    fn encrypt(&self, plain: &[u8], peer_pub: &PublicKey) -> Result<Vec<u8>, CryptoError>;

    /// `Decrypt(cipher; peer_pub, my_secret)`.
    fn decrypt(&self, cipher: &[u8], peer_pub: &PublicKey) -> Result<Vec<u8>, CryptoError>;
}

/// A `crypto_box`-backed [`IdentityKeyPair`] for tests and for callers with
/// no external identity service. The secret key zeroizes on drop (built on
/// `x25519_dalek::StaticSecret`, which is `ZeroizeOnDrop`).
pub struct LocalIdentityKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl fmt::Debug for LocalIdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentityKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl LocalIdentityKeyPair {
    /// Generate a fresh identity keypair.
    #[must_use]
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Rebuild an identity from a previously persisted 32-byte secret scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly 32 bytes long.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::DecryptFailed)?;
        let secret = SecretKey::from(array);
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// The raw 32-byte secret scalar, for persisting to disk between runs.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl IdentityKeyPair for LocalIdentityKeyPair {
    fn public_key(&self) -> PublicKey {
        self.public
    }

    fn encrypt(&self, plain: &[u8], peer_pub: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        encrypt_for(plain, peer_pub, &self.secret)
    }

    fn decrypt(&self, cipher: &[u8], peer_pub: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        decrypt_from(cipher, peer_pub, &self.secret)
    }
}

/// A freshly generated ephemeral keypair, one per connection.
pub struct EphemeralKeyPair {
    /// The secret half; zeroized on drop, destroyed once the shared box is
    /// derived (callers should not retain this beyond `crypto::exchange`).
    pub secret: SecretKey,
    /// The public half, sent across the wire during key exchange.
    pub public: PublicKey,
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generate a fresh ephemeral box keypair.
#[must_use]
pub fn generate_ephemeral() -> EphemeralKeyPair {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    EphemeralKeyPair { secret, public }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let alice = LocalIdentityKeyPair::generate();
        let bob = LocalIdentityKeyPair::generate();

        let cipher = alice
            .encrypt(b"hello bob", &bob.public_key())
            .unwrap();
        let plain = bob.decrypt(&cipher, &alice.public_key()).unwrap();
        assert_eq!(plain, b"hello bob");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let alice = LocalIdentityKeyPair::generate();
        let bob = LocalIdentityKeyPair::generate();
        let mallory = LocalIdentityKeyPair::generate();

        let cipher = alice.encrypt(b"secret", &bob.public_key()).unwrap();
        let err = mallory.decrypt(&cipher, &alice.public_key()).unwrap_err();
        assert_eq!(err, CryptoError::DecryptFailed);
    }

    #[test]
    fn truncated_blob_is_decrypt_failed() {
        let alice = LocalIdentityKeyPair::generate();
        let bob = LocalIdentityKeyPair::generate();
        let err = bob.decrypt(&[0u8; 4], &alice.public_key()).unwrap_err();
        assert_eq!(err, CryptoError::DecryptFailed);
    }

    #[test]
    fn ephemeral_keypairs_are_unique() {
        let a = generate_ephemeral();
        let b = generate_ephemeral();
        assert_ne!(a.public.as_bytes(), b.public.as_bytes());
    }
}
