//! Client-Side Setup / Server-Side Setup key exchange (CS-C / CS-S).
//!
//! Promotes an unencrypted [`FramedDuplexChannel`] to an [`EncryptedChannel`]
//! once both peers have confirmed a `communication_request` /
//! `communication_ready` exchange. Each side generates a fresh ephemeral box
//! keypair, authenticates it under the long-term identity keys, and derives
//! a shared box via Diffie-Hellman on the two ephemerals. The client (CS-C)
//! sends its authenticated ephemeral first; the server (CS-S) receives
//! first, so it can decide whether to reject *before* revealing anything
//! about its own decision through timing.

use std::fmt;
use std::time::Duration;

use crypto_box::{PublicKey, SalsaBox};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::channel::{EncryptedChannel, NonceParity};
use crate::crypto::keys::{generate_ephemeral, CryptoError, IdentityKeyPair};
use crate::transport::fdc::{FdcError, Frame, FramedDuplexChannel};

/// Failure modes of the ephemeral key exchange.
#[derive(Debug)]
pub enum ExchangeError {
    /// The underlying FDC failed or closed before the exchange completed.
    Transport(FdcError),
    /// The peer's authenticated ephemeral public key didn't decrypt.
    Crypto(CryptoError),
    /// The decrypted ephemeral public key was not 32 bytes.
    MalformedPeerKey,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error during key exchange: {err}"),
            Self::Crypto(err) => write!(f, "key exchange crypto error: {err}"),
            Self::MalformedPeerKey => write!(f, "peer ephemeral public key was malformed"),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<FdcError> for ExchangeError {
    fn from(err: FdcError) -> Self {
        Self::Transport(err)
    }
}

impl From<CryptoError> for ExchangeError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

fn decode_peer_epk(bytes: &[u8]) -> Result<PublicKey, ExchangeError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| ExchangeError::MalformedPeerKey)?;
    Ok(PublicKey::from(array))
}

/// Run the client side (CS-C): send the authenticated ephemeral first, then
/// await the peer's. `initiator_parity` is this side's nonce parity, set
/// via the `nonce_parity_initiator` config key; the server side always
/// takes the complement.
pub async fn perform_cs_c<S, I>(
    fdc: FramedDuplexChannel<S>,
    identity: &I,
    peer_identity_pub: &PublicKey,
    timeout: Option<Duration>,
    initiator_parity: NonceParity,
) -> Result<EncryptedChannel<S>, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    I: IdentityKeyPair,
{
    let ephemeral = generate_ephemeral();

    let authenticated_epk = identity.encrypt(ephemeral.public.as_bytes(), peer_identity_pub)?;
    fdc.send(Frame::Binary(authenticated_epk)).await?;

    let reply = fdc.recv(timeout).await?;
    let peer_authenticated_epk = match reply {
        Frame::Binary(bytes) => bytes,
        Frame::Text(text) => text.into_bytes(),
    };
    let peer_epk_bytes = identity.decrypt(&peer_authenticated_epk, peer_identity_pub)?;
    let peer_epk = decode_peer_epk(&peer_epk_bytes)?;

    let shared = SalsaBox::new(&peer_epk, &ephemeral.secret);
    Ok(EncryptedChannel::new(fdc, shared, initiator_parity))
}

/// Run the server side (CS-S): receive the peer's authenticated ephemeral
/// first, then send this side's. Always takes the complement of
/// `initiator_parity` so the two directions' nonces can never collide.
pub async fn perform_cs_s<S, I>(
    fdc: FramedDuplexChannel<S>,
    identity: &I,
    peer_identity_pub: &PublicKey,
    timeout: Option<Duration>,
    initiator_parity: NonceParity,
) -> Result<EncryptedChannel<S>, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    I: IdentityKeyPair,
{
    let ephemeral = generate_ephemeral();

    let request = fdc.recv(timeout).await?;
    let peer_authenticated_epk = match request {
        Frame::Binary(bytes) => bytes,
        Frame::Text(text) => text.into_bytes(),
    };
    let peer_epk_bytes = identity.decrypt(&peer_authenticated_epk, peer_identity_pub)?;
    let peer_epk = decode_peer_epk(&peer_epk_bytes)?;

    let authenticated_epk = identity.encrypt(ephemeral.public.as_bytes(), peer_identity_pub)?;
    fdc.send(Frame::Binary(authenticated_epk)).await?;

    let shared = SalsaBox::new(&peer_epk, &ephemeral.secret);
    Ok(EncryptedChannel::new(fdc, shared, initiator_parity.opposite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::LocalIdentityKeyPair;
    use crate::ids::ConnectionId;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn fdc_pair() -> (
        FramedDuplexChannel<TcpStream>,
        FramedDuplexChannel<crate::ws::ClientStream>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_fut = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            crate::ws::accept(stream).await.unwrap()
        });

        let (client_writer, client_reader) =
            crate::ws::connect(&format!("ws://{addr}"), &[]).await.unwrap();
        let (server_writer, server_reader) = server_fut.await.unwrap();

        let server = FramedDuplexChannel::new(ConnectionId::next(), server_writer, server_reader, 8);
        let client = FramedDuplexChannel::new(ConnectionId::next(), client_writer, client_reader, 8);
        (server, client)
    }

    #[tokio::test]
    async fn client_and_server_derive_the_same_shared_box() {
        let (server_fdc, client_fdc) = fdc_pair().await;
        let client_identity = LocalIdentityKeyPair::generate();
        let server_identity = LocalIdentityKeyPair::generate();
        let client_pub = client_identity.public_key();
        let server_pub = server_identity.public_key();

        let server_task = tokio::spawn(async move {
            perform_cs_s(
                server_fdc,
                &server_identity,
                &client_pub,
                Some(Duration::from_secs(2)),
                NonceParity::Odd,
            )
            .await
        });
        let client_ec = perform_cs_c(
            client_fdc,
            &client_identity,
            &server_pub,
            Some(Duration::from_secs(2)),
            NonceParity::Odd,
        )
        .await
        .unwrap();
        let server_ec = server_task.await.unwrap().unwrap();

        client_ec.send_text("ping").await.unwrap();
        let received = server_ec.recv_text(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(received, "ping");

        server_ec.send_text("pong").await.unwrap();
        let received = client_ec.recv_text(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(received, "pong");
    }

    #[tokio::test]
    async fn wrong_peer_identity_key_fails_exchange() {
        let (server_fdc, client_fdc) = fdc_pair().await;
        let client_identity = LocalIdentityKeyPair::generate();
        let server_identity = LocalIdentityKeyPair::generate();
        let impostor_identity = LocalIdentityKeyPair::generate();
        let client_pub = client_identity.public_key();

        let server_task = tokio::spawn(async move {
            perform_cs_s(
                server_fdc,
                &server_identity,
                &client_pub,
                Some(Duration::from_secs(2)),
                NonceParity::Odd,
            )
            .await
        });
        // Client addresses the exchange to the wrong server identity key; the
        // server will fail to decrypt the client's authenticated ephemeral.
        let client_result = perform_cs_c(
            client_fdc,
            &client_identity,
            &impostor_identity.public_key(),
            Some(Duration::from_secs(2)),
            NonceParity::Odd,
        )
        .await;
        assert!(client_result.is_err() || server_task.await.unwrap().is_err());
    }
}
