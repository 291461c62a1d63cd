//! Incoming Connection Manager (ICM).
//!
//! Unifies two accept sources under one interface:
//!
//! - broker-assisted: spares handed over by a [`crate::listener::Listener`]
//! - direct: a raw listen socket with a per-endpoint allowlist of local
//!   public keys it serves
//!
//! Both sources funnel through [`IncomingConnectionManager::handle_request`],
//! which performs the constant-time allowlist check and the CS-S key
//! exchange, closing the connection *after* the exchange on a rejected
//! target so accept vs. reject is not observable via timing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::codec::messages::{BrokerMessage, HexBytes};
use crate::config::Config;
use crate::crypto::channel::EncryptedChannel;
use crate::crypto::constant_time_eq;
use crate::crypto::exchange::{perform_cs_s, ExchangeError};
use crate::crypto::keys::IdentityKeyPair;
use crate::ids::ConnectionId;
use crate::listener::ReadyConnection;
use crate::transport::fdc::{Frame, FramedDuplexChannel};
use crate::ws;

/// Failure modes of the incoming-connection accept path.
#[derive(Debug)]
pub enum IcmError {
    /// Transport failure before the request could be read.
    Transport(String),
    /// The first message wasn't a well-formed `communication_request`.
    Protocol(String),
    /// `target_public_key` wasn't in this endpoint's allowlist. Still only
    /// returned after the key exchange completes, per the timing contract.
    NotAllowed,
    /// The key exchange itself failed.
    Exchange(ExchangeError),
}

impl fmt::Display for IcmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Self::NotAllowed => write!(f, "target public key not in allowlist"),
            Self::Exchange(err) => write!(f, "key exchange error: {err}"),
        }
    }
}

impl std::error::Error for IcmError {}

impl From<ExchangeError> for IcmError {
    fn from(err: ExchangeError) -> Self {
        Self::Exchange(err)
    }
}

/// A promoted, encrypted, application-facing channel, erased over its
/// underlying byte-stream type so broker-spliced and direct-socket
/// connections can be handled uniformly once accepted by the listener
/// accept callback.
#[async_trait]
pub trait AcceptedChannel: Send + Sync {
    /// Send ciphertext for `plain`.
    async fn send(&self, plain: &[u8]) -> Result<(), crate::crypto::channel::EcError>;
    /// Send ciphertext for a UTF-8 string.
    async fn send_text(&self, text: &str) -> Result<(), crate::crypto::channel::EcError>;
    /// Receive and decrypt the next frame.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>, crate::crypto::channel::EcError>;
    /// Receive, decrypt, and require UTF-8.
    async fn recv_text(&self, timeout: Option<Duration>) -> Result<String, crate::crypto::channel::EcError>;
    /// Close the underlying channel.
    async fn close(&self, reason: &str);
    /// This channel's connection id, for logging.
    fn id(&self) -> ConnectionId;
}

#[async_trait]
impl<S> AcceptedChannel for EncryptedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, plain: &[u8]) -> Result<(), crate::crypto::channel::EcError> {
        EncryptedChannel::send(self, plain).await
    }

    async fn send_text(&self, text: &str) -> Result<(), crate::crypto::channel::EcError> {
        EncryptedChannel::send_text(self, text).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>, crate::crypto::channel::EcError> {
        EncryptedChannel::recv(self, timeout).await
    }

    async fn recv_text(
        &self,
        timeout: Option<Duration>,
    ) -> Result<String, crate::crypto::channel::EcError> {
        EncryptedChannel::recv_text(self, timeout).await
    }

    async fn close(&self, reason: &str) {
        EncryptedChannel::close(self, reason).await;
    }

    fn id(&self) -> ConnectionId {
        EncryptedChannel::id(self)
    }
}

/// A connection delivered to the application, with both sides' identities
/// resolved from the forwarded `communication_request`.
pub struct AcceptedConnection {
    /// The promoted, encrypted channel.
    pub channel: Arc<dyn AcceptedChannel>,
    /// The local public key the peer addressed (the allowlist entry this
    /// connection matched, on the direct-listen path).
    pub local_public_key: HexBytes,
    /// The remote peer's public key.
    pub remote_public_key: HexBytes,
}

impl fmt::Debug for AcceptedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptedConnection")
            .field("id", &self.channel.id())
            .field("remote_public_key", &self.remote_public_key)
            .finish_non_exhaustive()
    }
}

/// Aggregates broker-assisted and direct-listen accept sources, applying a
/// shared allowlist and emitting [`AcceptedConnection`]s on one channel.
pub struct IncomingConnectionManager<I: IdentityKeyPair> {
    identity: Arc<I>,
    allowlist: Arc<Vec<HexBytes>>,
    config: Config,
    accepted_tx: mpsc::UnboundedSender<AcceptedConnection>,
}

impl<I: IdentityKeyPair> fmt::Debug for IncomingConnectionManager<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingConnectionManager").finish_non_exhaustive()
    }
}

impl<I: IdentityKeyPair + 'static> IncomingConnectionManager<I> {
    /// Build an ICM over `identity` and a fixed `allowlist` of local public
    /// keys this endpoint serves. Returns the manager plus the receiving
    /// half of the accepted-connection channel.
    #[must_use]
    pub fn new(
        identity: I,
        allowlist: Vec<HexBytes>,
        config: Config,
    ) -> (Self, mpsc::UnboundedReceiver<AcceptedConnection>) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity: Arc::new(identity),
                allowlist: Arc::new(allowlist),
                config,
                accepted_tx,
            },
            accepted_rx,
        )
    }

    /// Drain a [`crate::listener::Listener`]'s ready-connection channel
    /// forever, running each handed-over spare through the allowlist check
    /// and CS-S exchange.
    pub fn drive_broker_assisted(
        &self,
        mut ready_rx: mpsc::UnboundedReceiver<ReadyConnection>,
    ) -> tokio::task::JoinHandle<()> {
        let identity = Arc::clone(&self.identity);
        let allowlist = Arc::clone(&self.allowlist);
        let accepted_tx = self.accepted_tx.clone();
        let initiator_parity = self.config.nonce_parity_initiator.initiator_parity();
        tokio::spawn(async move {
            while let Some(ready) = ready_rx.recv().await {
                let identity = Arc::clone(&identity);
                let allowlist = Arc::clone(&allowlist);
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    match promote(
                        ready.fdc,
                        ready.source_public_key,
                        ready.target_public_key,
                        &identity,
                        &allowlist,
                        initiator_parity,
                    )
                    .await
                    {
                        Ok(accepted) => {
                            let _ = accepted_tx.send(accepted);
                        }
                        Err(err) => log::debug!("[ICM] broker-assisted accept dropped: {err}"),
                    }
                });
            }
        })
    }

    /// Bind and run a direct listen socket, reading a `communication_request`
    /// off every accepted connection before promoting it the same way.
    pub fn serve_direct(&self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        let identity = Arc::clone(&self.identity);
        let allowlist = Arc::clone(&self.allowlist);
        let accepted_tx = self.accepted_tx.clone();
        let max_frame_queue = self.config.max_frame_queue;
        let initiator_parity = self.config.nonce_parity_initiator.initiator_parity();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::debug!("[ICM] direct accept from {addr}");
                        let identity = Arc::clone(&identity);
                        let allowlist = Arc::clone(&allowlist);
                        let accepted_tx = accepted_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = Self::handle_direct(
                                stream,
                                max_frame_queue,
                                &identity,
                                &allowlist,
                                initiator_parity,
                                &accepted_tx,
                            )
                            .await
                            {
                                log::debug!("[ICM] direct accept dropped: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        log::error!("[ICM] direct listen accept failed: {err}");
                        return;
                    }
                }
            }
        })
    }

    async fn handle_direct(
        stream: TcpStream,
        max_frame_queue: usize,
        identity: &Arc<I>,
        allowlist: &Arc<Vec<HexBytes>>,
        initiator_parity: crate::crypto::channel::NonceParity,
        accepted_tx: &mpsc::UnboundedSender<AcceptedConnection>,
    ) -> Result<(), IcmError> {
        let (writer, reader) = ws::accept(stream)
            .await
            .map_err(|err| IcmError::Transport(err.to_string()))?;
        let id = ConnectionId::next();
        let fdc = FramedDuplexChannel::new(id, writer, reader, max_frame_queue);

        let frame = fdc
            .recv(Some(Duration::from_secs(10)))
            .await
            .map_err(|err| IcmError::Transport(err.to_string()))?;
        let Frame::Text(text) = frame else {
            return Err(IcmError::Protocol("expected text frame".to_string()));
        };
        let (source_public_key, target_public_key) = match BrokerMessage::decode(&text)
            .map_err(|err| IcmError::Protocol(err.to_string()))?
        {
            BrokerMessage::CommunicationRequest {
                source_public_key,
                target_public_key,
            } => (source_public_key, target_public_key),
            _ => return Err(IcmError::Protocol("expected communication_request".to_string())),
        };

        let accepted = promote(
            fdc,
            source_public_key,
            target_public_key,
            identity,
            allowlist,
            initiator_parity,
        )
        .await?;
        let _ = accepted_tx.send(accepted);
        Ok(())
    }
}

/// Shared by both accept sources: reply `communication_ready`, check the
/// allowlist without short-circuiting, run CS-S, and only then act on the
/// allowlist result.
async fn promote<S, I>(
    fdc: FramedDuplexChannel<S>,
    source_public_key: HexBytes,
    target_public_key: HexBytes,
    identity: &I,
    allowlist: &[HexBytes],
    initiator_parity: crate::crypto::channel::NonceParity,
) -> Result<AcceptedConnection, IcmError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    I: IdentityKeyPair,
{
    fdc.send(Frame::Text(
        BrokerMessage::CommunicationReady
            .encode()
            .map_err(|err| IcmError::Protocol(err.to_string()))?,
    ))
    .await
    .map_err(|err| IcmError::Transport(err.to_string()))?;

    let allowed = allowlist_contains(allowlist, &target_public_key);

    let peer_pub_array: [u8; 32] = source_public_key
        .0
        .clone()
        .try_into()
        .map_err(|_| IcmError::Protocol("source_public_key must be 32 bytes".to_string()))?;
    let peer_pub = crypto_box::PublicKey::from(peer_pub_array);

    let channel = perform_cs_s(
        fdc,
        identity,
        &peer_pub,
        Some(Duration::from_secs(10)),
        initiator_parity,
    )
    .await?;

    if !allowed {
        channel.close("target public key not served here").await;
        return Err(IcmError::NotAllowed);
    }

    Ok(AcceptedConnection {
        channel: Arc::new(channel),
        local_public_key: target_public_key,
        remote_public_key: source_public_key,
    })
}

/// Constant-time allowlist membership: every entry is compared, regardless
/// of whether an earlier one already matched, so the check's duration is
/// independent of match position.
fn allowlist_contains(allowlist: &[HexBytes], target: &HexBytes) -> bool {
    let mut found = false;
    for entry in allowlist {
        if constant_time_eq(&entry.0, &target.0) {
            found = true;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_contains_matches_regardless_of_position() {
        let allowlist = vec![
            HexBytes(vec![1; 32]),
            HexBytes(vec![2; 32]),
            HexBytes(vec![3; 32]),
        ];
        assert!(allowlist_contains(&allowlist, &HexBytes(vec![1; 32])));
        assert!(allowlist_contains(&allowlist, &HexBytes(vec![3; 32])));
        assert!(!allowlist_contains(&allowlist, &HexBytes(vec![9; 32])));
    }

    #[test]
    fn allowlist_check_visits_every_entry() {
        // A regression guard for accidental short-circuiting: an empty
        // allowlist and a non-matching one both report false.
        assert!(!allowlist_contains(&[], &HexBytes(vec![1; 32])));
    }
}
