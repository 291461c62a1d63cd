//! Listener — the peer-side counterpart of the Relay Broker Server.
//!
//! Maintains up to `target_spare_count` simultaneously-registered spare
//! connections under one public key. Each spare independently dials the
//! broker, authenticates via the challenge transform (decrypt + bit-invert +
//! re-encrypt), then parks waiting for `comm_ping` or `connection_handover`.
//! A handed-over spare is delivered to the caller through an unbounded
//! channel as a [`ReadyConnection`]; the slot then redials to replace it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::codec::messages::{BrokerMessage, HexBytes};
use crate::config::Config;
use crate::crypto::keys::IdentityKeyPair;
use crate::ids::ConnectionId;
use crate::transport::fdc::{Frame, FramedDuplexChannel};
use crate::ws;

/// The listener registration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not running, or `target_spare_count == 0`.
    NotListening,
    /// Running but no spare has reached `Listening` yet.
    Connecting,
    /// At least one spare is parked at the broker.
    Listening,
}

/// A spare handed over by the broker: the still-unencrypted FDC plus the
/// forwarded `communication_request` that triggered the handover. The
/// caller runs CS-S over `fdc` to promote it to an encrypted channel.
pub struct ReadyConnection {
    /// The spliced connection, not yet key-exchanged.
    pub fdc: FramedDuplexChannel<ws::ClientStream>,
    /// The forwarded request naming the caller (`source_public_key`) and
    /// this listener (`target_public_key`).
    pub source_public_key: HexBytes,
    /// This listener's own public key, as the requester addressed it.
    pub target_public_key: HexBytes,
}

impl fmt::Debug for ReadyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyConnection")
            .field("fdc", &self.fdc.id())
            .field("source_public_key", &self.source_public_key)
            .finish_non_exhaustive()
    }
}

/// Peer-side listener maintaining `target_spare_count` parked spares at the
/// broker for one public key.
pub struct Listener<I: IdentityKeyPair> {
    identity: Arc<I>,
    broker_url: String,
    config: Config,
    target_spare_count: usize,
    spare_count: Arc<AtomicUsize>,
    state: Arc<std::sync::Mutex<ListenerState>>,
    stop: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    ready_tx: mpsc::UnboundedSender<ReadyConnection>,
}

impl<I: IdentityKeyPair> fmt::Debug for Listener<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.state())
            .field("spare_count", &self.spare_count.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<I: IdentityKeyPair + 'static> Listener<I> {
    /// Build a listener. Does not start dialing until [`Listener::start`] is
    /// called. Returns the listener plus the receiving half of the
    /// handed-over-connection channel.
    #[must_use]
    pub fn new(
        identity: I,
        broker_url: String,
        target_spare_count: usize,
        config: Config,
    ) -> (Self, mpsc::UnboundedReceiver<ReadyConnection>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let listener = Self {
            identity: Arc::new(identity),
            broker_url,
            config,
            target_spare_count,
            spare_count: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(std::sync::Mutex::new(ListenerState::NotListening)),
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            ready_tx,
        };
        (listener, ready_rx)
    }

    /// Current state machine value.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of spares currently parked at the broker.
    #[must_use]
    pub fn spare_count(&self) -> usize {
        self.spare_count.load(Ordering::SeqCst)
    }

    fn set_state(&self, new_state: ListenerState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = new_state;
    }

    /// Start maintaining `target_spare_count` spares. `N == 0` leaves the
    /// listener in `NotListening` forever and spawns no tasks. Returns the
    /// join handles so callers can await shutdown.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.stopped.store(false, Ordering::SeqCst);
        if self.target_spare_count == 0 {
            self.set_state(ListenerState::NotListening);
            return Vec::new();
        }
        self.set_state(ListenerState::Connecting);

        (0..self.target_spare_count)
            .map(|slot| {
                let identity = Arc::clone(&self.identity);
                let broker_url = self.broker_url.clone();
                let config = self.config.clone();
                let spare_count = Arc::clone(&self.spare_count);
                let this_state = Arc::clone(&self.state);
                let stop = Arc::clone(&self.stop);
                let stopped = Arc::clone(&self.stopped);
                let ready_tx = self.ready_tx.clone();
                tokio::spawn(async move {
                    Self::run_slot(
                        slot,
                        identity,
                        broker_url,
                        config,
                        spare_count,
                        this_state,
                        stop,
                        stopped,
                        ready_tx,
                    )
                    .await;
                })
            })
            .collect()
    }

    /// Stop maintaining spares. Any `Connecting`/`Listening` slot unwinds to
    /// `NotListening`; in-flight registrations close with `Shutdown`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.set_state(ListenerState::NotListening);
        self.stop.notify_waiters();
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_slot(
        slot: usize,
        identity: Arc<I>,
        broker_url: String,
        config: Config,
        spare_count: Arc<AtomicUsize>,
        state: Arc<std::sync::Mutex<ListenerState>>,
        stop: Arc<Notify>,
        stopped: Arc<std::sync::atomic::AtomicBool>,
        ready_tx: mpsc::UnboundedSender<ReadyConnection>,
    ) {
        loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            let outcome = tokio::select! {
                result = Self::register_and_park(
                    &identity,
                    &broker_url,
                    &config,
                    &spare_count,
                    &state,
                    &stopped,
                ) => result,
                () = stop.notified() => return,
            };

            match outcome {
                Ok(ready) => {
                    if ready_tx.send(ready).is_err() {
                        return; // caller dropped the receiver; nothing left to deliver to
                    }
                }
                Err(err) => {
                    log::debug!("[Listener] slot {slot} failed: {err}, backing off");
                }
            }

            if stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(config.reconnect_backoff_ms)) => {}
                () = stop.notified() => return,
            }
        }
    }

    /// Phase 1 (register) + Phase 2 (parked, ping/pong) for one spare slot.
    /// Returns once the broker hands the connection over, or an error on
    /// any transport/auth failure (the caller backs off and retries).
    ///
    /// `spare_count`/`state` are bumped to reflect "parked" as soon as
    /// authentication succeeds (the start of Phase 2), not only once the
    /// connection is later handed over — a [`ParkedGuard`] un-bumps them on
    /// every exit from Phase 2, success or failure alike.
    async fn register_and_park(
        identity: &I,
        broker_url: &str,
        config: &Config,
        spare_count: &Arc<AtomicUsize>,
        state: &Arc<std::sync::Mutex<ListenerState>>,
        stopped: &Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<ReadyConnection, ListenerError> {
        let (writer, reader) = ws::connect(broker_url, &[])
            .await
            .map_err(|err| ListenerError::Transport(err.to_string()))?;
        let id = ConnectionId::next();
        let fdc = FramedDuplexChannel::new(id, writer, reader, config.max_frame_queue);

        let my_pub = identity.public_key();
        fdc.send(Frame::Text(
            BrokerMessage::Register {
                public_key: HexBytes(my_pub.as_bytes().to_vec()),
            }
            .encode()
            .map_err(|err| ListenerError::Protocol(err.to_string()))?,
        ))
        .await
        .map_err(|err| ListenerError::Transport(err.to_string()))?;

        let auth_request_frame = fdc
            .recv(Some(Duration::from_secs(10)))
            .await
            .map_err(|err| ListenerError::Transport(err.to_string()))?;
        let Frame::Text(text) = auth_request_frame else {
            return Err(ListenerError::Protocol("expected text frame".to_string()));
        };
        let (broker_pub, challenge) = match BrokerMessage::decode(&text)
            .map_err(|err| ListenerError::Protocol(err.to_string()))?
        {
            BrokerMessage::AuthenticationRequest {
                public_key,
                challenge,
            } => (public_key, challenge),
            _ => {
                return Err(ListenerError::Protocol(
                    "expected authentication_request".to_string(),
                ))
            }
        };
        let broker_pub_array: [u8; 32] = broker_pub
            .0
            .try_into()
            .map_err(|_| ListenerError::Protocol("broker public_key must be 32 bytes".to_string()))?;
        let broker_pub = crypto_box::PublicKey::from(broker_pub_array);

        // Challenge transform: decrypt, bit-invert, re-encrypt.
        let plain = identity
            .decrypt(&challenge.0, &broker_pub)
            .map_err(|err| ListenerError::Crypto(err.to_string()))?;
        let inverted: Vec<u8> = plain.iter().map(|b| !b).collect();
        let transformed = identity
            .encrypt(&inverted, &broker_pub)
            .map_err(|err| ListenerError::Crypto(err.to_string()))?;

        fdc.send(Frame::Text(
            BrokerMessage::AuthenticationResponse {
                response: HexBytes(transformed),
            }
            .encode()
            .map_err(|err| ListenerError::Protocol(err.to_string()))?,
        ))
        .await
        .map_err(|err| ListenerError::Transport(err.to_string()))?;

        let success_frame = fdc
            .recv(Some(Duration::from_secs(10)))
            .await
            .map_err(|err| ListenerError::Transport(err.to_string()))?;
        let Frame::Text(text) = success_frame else {
            return Err(ListenerError::Protocol("expected text frame".to_string()));
        };
        let ping_interval_ms = match BrokerMessage::decode(&text)
            .map_err(|err| ListenerError::Protocol(err.to_string()))?
        {
            BrokerMessage::AuthenticationSuccess { ping_interval } => ping_interval,
            _ => {
                return Err(ListenerError::Protocol(
                    "expected authentication_success".to_string(),
                ))
            }
        };
        let pong_timeout = config
            .pong_timeout_ms
            .unwrap_or_else(|| ping_interval_ms.saturating_mul(3));

        // Now actually parked at the broker: bump the spare count and flip
        // to `Listening` for the duration of Phase 2, regardless of how it
        // ends.
        let _parked_guard = ParkedGuard::enter(spare_count, state, stopped);

        // Phase 2: parked, replying to ping until handover.
        loop {
            let frame = fdc
                .recv(Some(Duration::from_millis(pong_timeout)))
                .await
                .map_err(|err| ListenerError::Transport(err.to_string()))?;
            let Frame::Text(text) = frame else {
                return Err(ListenerError::Protocol("expected text frame".to_string()));
            };
            match BrokerMessage::decode(&text).map_err(|err| ListenerError::Protocol(err.to_string()))? {
                BrokerMessage::CommPing => {
                    fdc.send(Frame::Text(
                        BrokerMessage::CommPong
                            .encode()
                            .map_err(|err| ListenerError::Protocol(err.to_string()))?,
                    ))
                    .await
                    .map_err(|err| ListenerError::Transport(err.to_string()))?;
                }
                BrokerMessage::ConnectionHandover => {
                    let request_frame = fdc
                        .recv(Some(Duration::from_secs(10)))
                        .await
                        .map_err(|err| ListenerError::Transport(err.to_string()))?;
                    let Frame::Text(text) = request_frame else {
                        return Err(ListenerError::Protocol("expected text frame".to_string()));
                    };
                    match BrokerMessage::decode(&text)
                        .map_err(|err| ListenerError::Protocol(err.to_string()))?
                    {
                        BrokerMessage::CommunicationRequest {
                            source_public_key,
                            target_public_key,
                        } => {
                            return Ok(ReadyConnection {
                                fdc,
                                source_public_key,
                                target_public_key,
                            });
                        }
                        _ => {
                            return Err(ListenerError::Protocol(
                                "expected communication_request after handover".to_string(),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(ListenerError::Protocol(
                        "unexpected message while parked".to_string(),
                    ))
                }
            }
        }
    }
}

/// RAII marker for "this slot currently holds a parked spare at the
/// broker". Bumps `spare_count`/`state` to `Listening` on construction;
/// drop un-bumps them, dropping back to `Connecting` only if no other slot
/// is still parked and the listener hasn't been stopped (`stop()` already
/// forces `NotListening` on its own path).
struct ParkedGuard<'a> {
    spare_count: &'a Arc<AtomicUsize>,
    state: &'a Arc<std::sync::Mutex<ListenerState>>,
    stopped: &'a Arc<std::sync::atomic::AtomicBool>,
}

impl<'a> ParkedGuard<'a> {
    fn enter(
        spare_count: &'a Arc<AtomicUsize>,
        state: &'a Arc<std::sync::Mutex<ListenerState>>,
        stopped: &'a Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        spare_count.fetch_add(1, Ordering::SeqCst);
        *state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = ListenerState::Listening;
        Self { spare_count, state, stopped }
    }
}

impl Drop for ParkedGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.spare_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && !self.stopped.load(Ordering::SeqCst) {
            *self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = ListenerState::Connecting;
        }
    }
}

/// Failure modes of listener registration/parking.
#[derive(Debug)]
pub enum ListenerError {
    /// Transport-level failure (dial, send, recv, unexpected close).
    Transport(String),
    /// The peer sent something other than the expected message shape.
    Protocol(String),
    /// A crypto operation (challenge decrypt/encrypt) failed.
    Crypto(String),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
            Self::Crypto(detail) => write!(f, "crypto error: {detail}"),
        }
    }
}

impl std::error::Error for ListenerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::LocalIdentityKeyPair;

    #[tokio::test]
    async fn zero_target_spares_never_leaves_not_listening() {
        let identity = LocalIdentityKeyPair::generate();
        let (listener, _rx) = Listener::new(
            identity,
            "ws://127.0.0.1:1".to_string(),
            0,
            Config::default(),
        );
        let handles = listener.start();
        assert!(handles.is_empty());
        assert_eq!(listener.state(), ListenerState::NotListening);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.state(), ListenerState::NotListening);
    }

    #[tokio::test]
    async fn starting_with_unreachable_broker_stays_connecting() {
        let identity = LocalIdentityKeyPair::generate();
        let mut config = Config::default();
        config.reconnect_backoff_ms = 50;
        let (listener, _rx) = Listener::new(identity, "ws://127.0.0.1:1".to_string(), 1, config);
        listener.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.state(), ListenerState::Connecting);
        listener.stop();
    }

    #[tokio::test]
    async fn reaches_listening_and_parks_before_any_handover_arrives() {
        use crate::broker::RelayBroker;

        let broker_identity = LocalIdentityKeyPair::generate();
        let broker = Arc::new(RelayBroker::new(broker_identity, Config::default()));
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        Arc::clone(&broker).serve(tcp);

        let identity = LocalIdentityKeyPair::generate();
        let (listener, _rx) = Listener::new(identity, format!("ws://{addr}"), 1, Config::default());
        listener.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if listener.state() == ListenerState::Listening && listener.spare_count() == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener never reached Listening with a parked spare");

        // No communication_request was ever sent, so the spare is only
        // "Listening" because parking itself flips the state — not because
        // of a handover that hasn't happened.
        assert_eq!(broker.total_parked().await, 1);

        listener.stop();
    }
}
