//! Outgoing Connection Establisher (OCE).
//!
//! Retries an outbound dial + `communication_request`/`communication_ready`
//! handshake + CS-C key exchange against a target public key until it
//! succeeds or the caller stops it. [`connect_once_with_deadline`] bounds a
//! single attempt-and-retry run with an overall deadline (the "OCE success
//! window").

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::codec::messages::{BrokerMessage, HexBytes};
use crate::crypto::channel::{EncryptedChannel, NonceParity};
use crate::crypto::exchange::{perform_cs_c, ExchangeError};
use crate::crypto::keys::IdentityKeyPair;
use crate::ids::ConnectionId;
use crate::transport::fdc::{Frame, FramedDuplexChannel};
use crate::ws;

/// Failure modes of a single connection attempt.
#[derive(Debug)]
pub enum OceError {
    /// Dial, send, or recv failed at the transport layer.
    Transport(String),
    /// The peer's response didn't match the expected shape.
    Protocol(String),
    /// The ephemeral key exchange failed.
    Exchange(ExchangeError),
    /// `connect_once_with_deadline` elapsed before a channel was established.
    Timeout,
    /// `stop()` was called before a connection succeeded.
    Cancelled,
}

impl fmt::Display for OceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Self::Exchange(err) => write!(f, "key exchange error: {err}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for OceError {}

impl From<ExchangeError> for OceError {
    fn from(err: ExchangeError) -> Self {
        Self::Exchange(err)
    }
}

/// Retries an outbound dial + handshake against one target public key.
pub struct OutgoingConnectionEstablisher<I: IdentityKeyPair> {
    url: String,
    identity: Arc<I>,
    target_pub: crypto_box::PublicKey,
    retry_delay: Duration,
    max_frame_queue: usize,
    initiator_parity: NonceParity,
    stop: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl<I: IdentityKeyPair> fmt::Debug for OutgoingConnectionEstablisher<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingConnectionEstablisher")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl<I: IdentityKeyPair + 'static> OutgoingConnectionEstablisher<I> {
    /// Build an establisher for one `(url, identity, target_pub)` triple.
    ///
    /// `initiator_parity` is this side's nonce parity as the CS-C initiator,
    /// set via the `nonce_parity_initiator` config key; the peer's CS-S
    /// side always takes the complement, so both ends of the pairing must
    /// agree on this value.
    #[must_use]
    pub fn new(
        url: String,
        identity: I,
        target_pub: crypto_box::PublicKey,
        retry_delay: Duration,
        max_frame_queue: usize,
        initiator_parity: NonceParity,
    ) -> Self {
        Self {
            url,
            identity: Arc::new(identity),
            target_pub,
            retry_delay,
            max_frame_queue,
            initiator_parity,
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Stop retrying. A retry already sleeping or in flight observes this on
    /// its next check and returns `Cancelled`.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Loop dialing and attempting the handshake until it succeeds or
    /// [`stop`](Self::stop) is called.
    pub async fn connect(&self) -> Result<EncryptedChannel<ws::ClientStream>, OceError> {
        loop {
            if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(OceError::Cancelled);
            }
            match self.try_once().await {
                Ok(channel) => return Ok(channel),
                Err(err) => {
                    log::debug!("[OCE] attempt to {} failed: {err}, retrying", self.url);
                }
            }
            tokio::select! {
                () = tokio::time::sleep(self.retry_delay) => {}
                () = self.stop.notified() => return Err(OceError::Cancelled),
            }
        }
    }

    /// Like [`connect`](Self::connect), but gives up with `Timeout` if no
    /// attempt succeeds within `success_timeout` (the `oce_success_timeout_ms`
    /// config key).
    pub async fn connect_once_with_deadline(
        &self,
        success_timeout: Duration,
    ) -> Result<EncryptedChannel<ws::ClientStream>, OceError> {
        tokio::time::timeout(success_timeout, self.connect())
            .await
            .unwrap_or(Err(OceError::Timeout))
    }

    async fn try_once(&self) -> Result<EncryptedChannel<ws::ClientStream>, OceError> {
        let (writer, reader) = ws::connect(&self.url, &[])
            .await
            .map_err(|err| OceError::Transport(err.to_string()))?;
        let id = ConnectionId::next();
        let fdc = FramedDuplexChannel::new(id, writer, reader, self.max_frame_queue);

        let my_pub = self.identity.public_key();
        fdc.send(Frame::Text(
            BrokerMessage::CommunicationRequest {
                source_public_key: HexBytes(my_pub.as_bytes().to_vec()),
                target_public_key: HexBytes(self.target_pub.as_bytes().to_vec()),
            }
            .encode()
            .map_err(|err| OceError::Protocol(err.to_string()))?,
        ))
        .await
        .map_err(|err| OceError::Transport(err.to_string()))?;

        let ready_frame = fdc
            .recv(Some(Duration::from_secs(10)))
            .await
            .map_err(|err| OceError::Transport(err.to_string()))?;
        let Frame::Text(text) = ready_frame else {
            return Err(OceError::Protocol("expected text frame".to_string()));
        };
        match BrokerMessage::decode(&text).map_err(|err| OceError::Protocol(err.to_string()))? {
            BrokerMessage::CommunicationReady => {}
            _ => return Err(OceError::Protocol("expected communication_ready".to_string())),
        }

        let channel = perform_cs_c(
            fdc,
            self.identity.as_ref(),
            &self.target_pub,
            Some(Duration::from_secs(10)),
            self.initiator_parity,
        )
        .await?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::LocalIdentityKeyPair;

    #[tokio::test]
    async fn unreachable_url_times_out_via_deadline() {
        let identity = LocalIdentityKeyPair::generate();
        let target = LocalIdentityKeyPair::generate().public_key();
        let oce = OutgoingConnectionEstablisher::new(
            "ws://127.0.0.1:1".to_string(),
            identity,
            target,
            Duration::from_millis(20),
            16,
            NonceParity::Odd,
        );
        let result = oce
            .connect_once_with_deadline(Duration::from_millis(150))
            .await;
        assert!(matches!(result, Err(OceError::Timeout)));
    }

    #[tokio::test]
    async fn stop_cancels_a_pending_retry_loop() {
        let identity = LocalIdentityKeyPair::generate();
        let target = LocalIdentityKeyPair::generate().public_key();
        let oce = Arc::new(OutgoingConnectionEstablisher::new(
            "ws://127.0.0.1:1".to_string(),
            identity,
            target,
            Duration::from_secs(30),
            16,
            NonceParity::Odd,
        ));
        let oce2 = Arc::clone(&oce);
        let handle = tokio::spawn(async move { oce2.connect().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        oce.stop();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(OceError::Cancelled)));
    }
}
