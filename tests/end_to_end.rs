//! End-to-end test wiring every subsystem together over real loopback
//! sockets: a `RelayBroker`, a broker-assisted `Listener`, an `Icm` driving
//! its handovers, and an `OutgoingConnectionEstablisher` dialing in from the
//! other side. Exercises the full happy path: register, splice, CS-C/CS-S
//! key exchange, encrypted text round trip.

use std::sync::Arc;
use std::time::Duration;

use relay_core::broker::RelayBroker;
use relay_core::codec::messages::HexBytes;
use relay_core::config::Config;
use relay_core::crypto::keys::LocalIdentityKeyPair;
use relay_core::icm::IncomingConnectionManager;
use relay_core::listener::Listener;
use relay_core::oce::OutgoingConnectionEstablisher;
use tokio::net::TcpListener;

async fn spawn_test_broker() -> String {
    let identity = LocalIdentityKeyPair::generate();
    let config = Config {
        ping_interval_ms: 500,
        pong_timeout_ms: Some(1_500),
        ..Config::default()
    };
    let broker = Arc::new(RelayBroker::new(identity, config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    broker.serve(listener);
    format!("ws://{addr}")
}

#[tokio::test]
async fn happy_path_register_splice_and_exchange_hellos() {
    let broker_url = spawn_test_broker().await;

    // The callee: registers with the broker and serves its own public key.
    let callee_identity = LocalIdentityKeyPair::generate();
    let callee_pub = callee_identity.public_key();
    let icm_identity =
        LocalIdentityKeyPair::from_secret_bytes(&callee_identity.secret_bytes()).unwrap();

    let config = Config::default();
    let (listener, ready_rx) =
        Listener::new(callee_identity, broker_url.clone(), 1, config.clone());
    let _slot_handles = listener.start();

    let (icm, mut accepted_rx) = IncomingConnectionManager::new(
        icm_identity,
        vec![HexBytes(callee_pub.as_bytes().to_vec())],
        config.clone(),
    );
    let _icm_handle = icm.drive_broker_assisted(ready_rx);

    // Wait for the listener to actually park a spare before dialing in.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if listener.spare_count() >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener never reached Listening");

    // The caller: dials the broker and requests a connection to the callee.
    let caller_identity = LocalIdentityKeyPair::generate();
    let oce = OutgoingConnectionEstablisher::new(
        broker_url,
        caller_identity,
        callee_pub,
        Duration::from_millis(100),
        config.max_frame_queue,
        config.nonce_parity_initiator.initiator_parity(),
    );
    let caller_channel = oce
        .connect_once_with_deadline(Duration::from_secs(5))
        .await
        .expect("caller side of the handshake failed");

    let accepted = tokio::time::timeout(Duration::from_secs(5), accepted_rx.recv())
        .await
        .expect("timed out waiting for the accepted connection")
        .expect("icm channel closed without delivering a connection");

    caller_channel.send_text("hello").await.unwrap();
    let received = accepted
        .channel
        .recv_text(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(received, "hello");

    accepted.channel.send_text("world").await.unwrap();
    let received = caller_channel
        .recv_text(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(received, "world");

    listener.stop();
}

#[tokio::test]
async fn connecting_to_a_target_with_no_registered_listener_times_out() {
    let broker_url = spawn_test_broker().await;
    let caller_identity = LocalIdentityKeyPair::generate();
    let nobody = LocalIdentityKeyPair::generate().public_key();

    let oce = OutgoingConnectionEstablisher::new(
        broker_url,
        caller_identity,
        nobody,
        Duration::from_millis(50),
        64,
        Config::default().nonce_parity_initiator.initiator_parity(),
    );
    let result = oce
        .connect_once_with_deadline(Duration::from_millis(400))
        .await;
    assert!(result.is_err());
}
