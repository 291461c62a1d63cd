//! Encrypted Channel (EC).
//!
//! Wraps a [`FramedDuplexChannel`] with per-frame AEAD confidentiality and
//! integrity, using a shared `SalsaBox` derived once during key exchange
//! (`crypto::exchange`) and a monotonically advancing send/receive nonce
//! counter assigned by role at channel birth.
//!
//! Nonces are never random: each side's 24-byte nonce is the big-endian
//! encoding of its own counter placed in the low 8 bytes, counting by two so
//! the two directions can never collide regardless of message loss or
//! reordering upstream. Initiators start on odd counters, acceptors on even
//! ones (or vice versa — `nonce_parity_initiator` in config).

use std::fmt;
use std::time::Duration;

use crypto_box::aead::{generic_array::GenericArray, Aead};
use crypto_box::SalsaBox;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::transport::fdc::{FdcError, Frame, FramedDuplexChannel};

/// One past the highest counter value this channel will use to build a
/// nonce. Encryption is refused once the counter reaches this ceiling, well
/// short of the 64-bit nonce field actually overflowing.
const NONCE_CEILING: u64 = (1u64 << 53) - 2;

fn counter_to_nonce(counter: u64) -> GenericArray<u8, crypto_box::aead::generic_array::typenum::U24> {
    let mut bytes = [0u8; 24];
    bytes[16..24].copy_from_slice(&counter.to_be_bytes());
    GenericArray::clone_from_slice(&bytes)
}

/// Failure modes specific to the encrypted channel layer.
#[derive(Debug)]
pub enum EcError {
    /// The send-side counter has reached its safe ceiling; this channel can
    /// never send another frame and should be replaced.
    NonceExhausted,
    /// AEAD decryption failed — wrong key, tampered ciphertext, or
    /// desynchronized counters. Always fatal to the channel.
    DecryptFailed,
    /// A frame arrived in the wrong wire shape (text where binary was
    /// required).
    UnexpectedFrameType,
    /// Decrypted payload was not valid UTF-8 where text was expected.
    NotUtf8,
    /// The underlying transport failed or reached a terminal state.
    Transport(FdcError),
}

impl fmt::Display for EcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonceExhausted => write!(f, "nonce counter exhausted"),
            Self::DecryptFailed => write!(f, "decryption failed"),
            Self::UnexpectedFrameType => write!(f, "expected a binary frame"),
            Self::NotUtf8 => write!(f, "decrypted payload was not utf-8"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for EcError {}

impl From<FdcError> for EcError {
    fn from(err: FdcError) -> Self {
        Self::Transport(err)
    }
}

/// Which parity of nonce counter this side of the channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceParity {
    /// Counter starts at 1 and advances by 2: 1, 3, 5, ...
    Odd,
    /// Counter starts at 0 and advances by 2: 0, 2, 4, ...
    Even,
}

impl NonceParity {
    fn start(self) -> u64 {
        match self {
            Self::Odd => 1,
            Self::Even => 0,
        }
    }

    /// The opposite parity — the remote side always uses this channel's
    /// complement so the two directions' nonces can never collide.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Odd => Self::Even,
            Self::Even => Self::Odd,
        }
    }
}

/// An end-to-end encrypted duplex channel over an [`FramedDuplexChannel`].
pub struct EncryptedChannel<S> {
    fdc: FramedDuplexChannel<S>,
    cipher: SalsaBox,
    local_counter: Mutex<u64>,
    remote_counter: Mutex<u64>,
}

impl<S> fmt::Debug for EncryptedChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("id", &self.fdc.id())
            .finish_non_exhaustive()
    }
}

impl<S> EncryptedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap `fdc` with `cipher` (the shared box derived during key
    /// exchange), assigning this side's nonce counter `local_parity` and
    /// expecting the remote side's frames to carry `local_parity.opposite()`.
    #[must_use]
    pub fn new(fdc: FramedDuplexChannel<S>, cipher: SalsaBox, local_parity: NonceParity) -> Self {
        Self {
            fdc,
            cipher,
            local_counter: Mutex::new(local_parity.start()),
            remote_counter: Mutex::new(local_parity.opposite().start()),
        }
    }

    /// Encrypt and send `plain` as a binary frame.
    pub async fn send(&self, plain: &[u8]) -> Result<(), EcError> {
        let mut counter = self.local_counter.lock().await;
        if *counter >= NONCE_CEILING {
            return Err(EcError::NonceExhausted);
        }
        let nonce = counter_to_nonce(*counter);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| EcError::NonceExhausted)?;
        self.fdc.send(Frame::Binary(ciphertext)).await?;
        *counter += 2;
        Ok(())
    }

    /// Convenience wrapper: encrypt a UTF-8 string.
    pub async fn send_text(&self, text: &str) -> Result<(), EcError> {
        self.send(text.as_bytes()).await
    }

    /// Receive the next frame and decrypt it. A decrypt failure closes the
    /// underlying channel — the two sides' counters are no longer provably
    /// in sync, and retrying would risk nonce reuse.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>, EcError> {
        let frame = self.fdc.recv(timeout).await?;
        let ciphertext = match frame {
            Frame::Binary(bytes) => bytes,
            Frame::Text(_) => return Err(EcError::UnexpectedFrameType),
        };

        let mut counter = self.remote_counter.lock().await;
        let nonce = counter_to_nonce(*counter);
        let plain = match self.cipher.decrypt(&nonce, ciphertext.as_slice()) {
            Ok(plain) => plain,
            Err(_) => {
                drop(counter);
                self.fdc.terminate("decrypt failed").await;
                return Err(EcError::DecryptFailed);
            }
        };
        *counter += 2;
        Ok(plain)
    }

    /// Convenience wrapper: decrypt and require UTF-8.
    pub async fn recv_text(&self, timeout: Option<Duration>) -> Result<String, EcError> {
        let bytes = self.recv(timeout).await?;
        String::from_utf8(bytes).map_err(|_| EcError::NotUtf8)
    }

    /// Close the underlying channel, accumulating `reason`.
    pub async fn close(&self, reason: &str) {
        self.fdc.close(reason).await;
    }

    /// This channel's connection id, for logging.
    #[must_use]
    pub fn id(&self) -> crate::ids::ConnectionId {
        self.fdc.id()
    }
}
