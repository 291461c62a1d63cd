//! Accept loop, authentication, and splice logic for the Relay Broker
//! Server.
//!
//! One [`RelayBroker`] owns the whole process's pool map — there is no
//! other shared mutable state across connections. Every accepted socket is
//! handled on its own task; the pool itself serializes pushes (successful
//! auth), pops (splice), and removals (parked spare closes) behind
//! [`pool::SparePool`]'s single lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::broker::pool::{SharedSparePool, Spare, SparePool};
use crate::codec::messages::{BrokerMessage, HexBytes};
use crate::config::Config;
use crate::crypto::constant_time_eq;
use crate::crypto::keys::IdentityKeyPair;
use crate::ids::ConnectionId;
use crate::transport::fdc::{Frame, FramedDuplexChannel};
use crate::ws;

const CHALLENGE_LEN: usize = 64;

/// Failure modes surfaced while running the broker.
#[derive(Debug)]
pub enum BrokerError {
    /// The peer's first message wasn't `register` or `communication_request`.
    Protocol(String),
    /// Challenge/response mismatch during registration.
    AuthFailed,
    /// `communication_request` named a public key with no parked spares.
    NoListener,
    /// The underlying transport failed.
    Transport(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Self::AuthFailed => write!(f, "AuthFailed"),
            Self::NoListener => write!(f, "NoListener"),
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// A parked spare: the authenticated FDC plus the task keeping it alive
/// with ping/pong while parked. The task is aborted the instant the spare
/// is popped for splice, handing sole ownership of the FDC's single reader
/// slot to the splice pipe.
struct ParkedConn {
    fdc: Arc<FramedDuplexChannel<TcpStream>>,
    ping_task: JoinHandle<()>,
}

/// The relay broker server: accepts connections, authenticates listeners,
/// parks them, and splices requesters to spares.
pub struct RelayBroker<I: IdentityKeyPair> {
    identity: Arc<I>,
    pool: SharedSparePool<ParkedConn>,
    config: Config,
}

impl<I: IdentityKeyPair> fmt::Debug for RelayBroker<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayBroker").finish_non_exhaustive()
    }
}

impl<I: IdentityKeyPair + 'static> RelayBroker<I> {
    /// Build a broker around its own long-term identity and a configuration
    /// (ping interval, pong timeout, frame queue bound).
    #[must_use]
    pub fn new(identity: I, config: Config) -> Self {
        Self {
            identity: Arc::new(identity),
            pool: Arc::new(SparePool::new()),
            config,
        }
    }

    /// Number of spares currently parked for `public_key_hex`, for tests and
    /// diagnostics.
    pub async fn parked_for(&self, public_key_hex: &str) -> usize {
        self.pool.parked_for(public_key_hex).await
    }

    /// Total spares parked across all public keys.
    pub async fn total_parked(&self) -> usize {
        self.pool.total_parked().await
    }

    /// Graceful shutdown: close every parked spare with `Shutdown`, abort
    /// its ping/pong loop, and leave already-spliced connections alone to
    /// drain on their own. Callers should stop the
    /// accept loop (drop or abort the [`RelayBroker::serve`] handle) first
    /// so no new spares are parked while this runs.
    pub async fn shutdown(&self) {
        let spares = self.pool.drain_all().await;
        log::info!("[Broker] shutting down, closing {} parked spare(s)", spares.len());
        for spare in spares {
            spare.value.ping_task.abort();
            spare.value.fdc.close("Shutdown").await;
        }
    }

    /// Accept loop: binds nothing itself, takes an already-bound listener so
    /// callers (binary, tests) control the address. Runs until the listener
    /// errors or the caller drops/aborts the returned task.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::debug!("[Broker] accepted connection from {addr}");
                        let broker = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = broker.handle_connection(stream).await {
                                log::debug!("[Broker] connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        log::error!("[Broker] accept failed: {err}");
                        return;
                    }
                }
            }
        })
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), BrokerError> {
        let (writer, reader) = ws::accept(stream)
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        let id = ConnectionId::next();
        let fdc = Arc::new(FramedDuplexChannel::new(
            id,
            writer,
            reader,
            self.config.max_frame_queue,
        ));

        let frame = fdc
            .recv(Some(Duration::from_secs(30)))
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        let text = match &frame {
            Frame::Text(text) => text.clone(),
            Frame::Binary(_) => {
                fdc.close("Protocol: expected text frame").await;
                return Err(BrokerError::Protocol("expected text frame".to_string()));
            }
        };
        let message = BrokerMessage::decode(&text).map_err(|err| {
            let reason = format!("Protocol: {err}");
            let fdc = Arc::clone(&fdc);
            tokio::spawn(async move { fdc.close(&reason).await });
            BrokerError::Protocol(err.to_string())
        })?;

        match message {
            BrokerMessage::Register { public_key } => self.authenticate(id, fdc, public_key).await,
            BrokerMessage::CommunicationRequest {
                source_public_key,
                target_public_key,
            } => {
                self.splice(fdc, source_public_key, target_public_key, text)
                    .await
            }
            _ => {
                fdc.close("Protocol: unexpected first message").await;
                Err(BrokerError::Protocol(
                    "first message must be register or communication_request".to_string(),
                ))
            }
        }
    }

    /// Authenticate a registering listener: challenge, verify, park, begin
    /// ping/pong.
    async fn authenticate(
        self: Arc<Self>,
        id: ConnectionId,
        fdc: Arc<FramedDuplexChannel<TcpStream>>,
        public_key: HexBytes,
    ) -> Result<(), BrokerError> {
        let public_key_hex = public_key.to_string();
        let peer_pub = decode_public_key(&public_key).map_err(|detail| {
            BrokerError::Protocol(detail)
        })?;

        let mut challenge = vec![0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);

        let encrypted_challenge = self
            .identity
            .encrypt(&challenge, &peer_pub)
            .map_err(|err| BrokerError::Transport(err.to_string()))?;

        let request = BrokerMessage::AuthenticationRequest {
            public_key: HexBytes(self.identity.public_key().as_bytes().to_vec()),
            challenge: HexBytes(encrypted_challenge),
        };
        send_message(&fdc, &request).await?;

        let response_frame = fdc
            .recv(Some(Duration::from_secs(10)))
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        let response_text = match response_frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => {
                fdc.close("Protocol: expected text frame").await;
                return Err(BrokerError::Protocol("expected text frame".to_string()));
            }
        };
        let response = match BrokerMessage::decode(&response_text) {
            Ok(BrokerMessage::AuthenticationResponse { response }) => response,
            _ => {
                fdc.close("Protocol: expected authentication_response").await;
                return Err(BrokerError::Protocol(
                    "expected authentication_response".to_string(),
                ));
            }
        };

        // The listener must decrypt the challenge, bit-invert it, and
        // re-encrypt — so the broker's expected value is the inverted
        // challenge, never the challenge itself. A peer that just echoes
        // the ciphertext back decrypts to the original, unmodified
        // `challenge` and is rejected here.
        let inverted_challenge: Vec<u8> = challenge.iter().map(|b| !b).collect();
        let decrypted = self.identity.decrypt(&response.0, &peer_pub).ok();
        let matches = decrypted
            .as_deref()
            .is_some_and(|plain| constant_time_eq(plain, &inverted_challenge));
        if !matches {
            fdc.close("AuthFailed").await;
            return Err(BrokerError::AuthFailed);
        }

        send_message(
            &fdc,
            &BrokerMessage::AuthenticationSuccess {
                ping_interval: self.config.ping_interval_ms,
            },
        )
        .await?;

        let pool = Arc::clone(&self.pool);
        let key_for_task = public_key_hex.clone();
        let fdc_for_task = Arc::clone(&fdc);
        let ping_interval = Duration::from_millis(self.config.ping_interval_ms);
        let pong_timeout = Duration::from_millis(self.config.pong_timeout_ms());
        let ping_task = tokio::spawn(async move {
            Self::ping_loop(pool, key_for_task, id, fdc_for_task, ping_interval, pong_timeout).await;
        });

        self.pool
            .push(
                &public_key_hex,
                Spare {
                    id,
                    value: ParkedConn { fdc, ping_task },
                },
            )
            .await;
        log::info!("[Broker] listener {public_key_hex} registered as spare {id}");
        Ok(())
    }

    /// Keep-alive loop while a spare is parked: evict after `pong_timeout`
    /// of the first ping with no pong.
    async fn ping_loop(
        pool: SharedSparePool<ParkedConn>,
        public_key_hex: String,
        id: ConnectionId,
        fdc: Arc<FramedDuplexChannel<TcpStream>>,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) {
        loop {
            tokio::time::sleep(ping_interval).await;
            if send_message(&fdc, &BrokerMessage::CommPing).await.is_err() {
                pool.remove(&public_key_hex, id).await;
                return;
            }
            match fdc.recv(Some(pong_timeout)).await {
                Ok(Frame::Text(text)) => match BrokerMessage::decode(&text) {
                    Ok(BrokerMessage::CommPong) => continue,
                    _ => {
                        log::warn!("[Broker] spare {id} sent unexpected frame during ping/pong");
                        pool.remove(&public_key_hex, id).await;
                        fdc.close("Protocol: expected comm_pong").await;
                        return;
                    }
                },
                Ok(Frame::Binary(_)) => {
                    pool.remove(&public_key_hex, id).await;
                    fdc.close("Protocol: expected comm_pong").await;
                    return;
                }
                Err(_) => {
                    log::warn!("[Broker] spare {id} missed pong within {pong_timeout:?}, evicting");
                    pool.remove(&public_key_hex, id).await;
                    fdc.close("PingTimeout").await;
                    return;
                }
            }
        }
    }

    /// Splice: pop a spare for `target_public_key`, hand it over, and pipe
    /// the two connections opaquely in both directions.
    async fn splice(
        self: Arc<Self>,
        requester: Arc<FramedDuplexChannel<TcpStream>>,
        source_public_key: HexBytes,
        target_public_key: HexBytes,
        original_request_text: String,
    ) -> Result<(), BrokerError> {
        let target_hex = target_public_key.to_string();
        let Some(spare) = self.pool.pop(&target_hex).await else {
            requester.close("NoListener").await;
            return Err(BrokerError::NoListener);
        };
        // Must fully stop before the FDC's reader is handed to the splice
        // pipe below: if ping_loop is suspended in its own fdc.recv, an
        // abort without awaiting the handle leaves the queue's waiter slot
        // occupied, and the pipe's first recv fails with ReaderBusy.
        spare.value.ping_task.abort();
        let _ = spare.value.ping_task.await;
        let listener_fdc = spare.value.fdc;

        send_message(&listener_fdc, &BrokerMessage::ConnectionHandover).await?;
        listener_fdc
            .send(Frame::Text(original_request_text))
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;

        log::info!(
            "[Broker] splicing {source_public_key} -> {target_hex} ({} <-> {})",
            requester.id(),
            listener_fdc.id()
        );

        pipe_both_directions(requester, listener_fdc).await;
        Ok(())
    }
}

/// Forward every frame received on one side to the other, in both
/// directions, until either side closes; then close the other with a
/// relay-attributed reason.
async fn pipe_both_directions(
    a: Arc<FramedDuplexChannel<TcpStream>>,
    b: Arc<FramedDuplexChannel<TcpStream>>,
) {
    let a_to_b = {
        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        tokio::spawn(async move { pipe_one_direction(a, b).await })
    };
    let b_to_a = tokio::spawn(async move { pipe_one_direction(b, a).await });

    let _ = tokio::join!(a_to_b, b_to_a);
}

async fn pipe_one_direction(
    from: Arc<FramedDuplexChannel<TcpStream>>,
    to: Arc<FramedDuplexChannel<TcpStream>>,
) {
    loop {
        match from.recv(None).await {
            Ok(frame) => {
                if to.send(frame).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                to.close(&format!("Closed by relay: {err}")).await;
                return;
            }
        }
    }
}

fn decode_public_key(bytes: &HexBytes) -> Result<crypto_box::PublicKey, String> {
    let array: [u8; 32] = bytes
        .0
        .clone()
        .try_into()
        .map_err(|_| "public_key must be 32 bytes".to_string())?;
    Ok(crypto_box::PublicKey::from(array))
}

async fn send_message(
    fdc: &FramedDuplexChannel<TcpStream>,
    message: &BrokerMessage,
) -> Result<(), BrokerError> {
    let text = message
        .encode()
        .map_err(|err| BrokerError::Protocol(err.to_string()))?;
    fdc.send(Frame::Text(text))
        .await
        .map_err(|err| BrokerError::Transport(err.to_string()))
}
