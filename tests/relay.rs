//! End-to-end test: two relays on loopback doing real ICE, DTLS and SCTP.
//!
//! Signaling is bridged in-process: each relay's sdp/candidate callbacks are
//! pumped into the other relay's handle, exactly what the embedding adapter
//! does over its signaling transport.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ice_peer_relay::{IceMessage, PeerRelay, RelayCallbacks, RelayHandle, RelayOptions};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Endpoint {
    handle: RelayHandle,
    /// Plays the game process: bound to the port this relay forwards
    /// inbound peer traffic to.
    game: UdpSocket,
    msgs: mpsc::UnboundedReceiver<IceMessage>,
    connected: mpsc::UnboundedReceiver<bool>,
    channel_open: mpsc::UnboundedReceiver<()>,
}

async fn endpoint(id: i64, login: &str, is_offerer: bool) -> Endpoint {
    let game = UdpSocket::bind((LOCALHOST, 0)).await.expect("game socket");
    let game_port = game.local_addr().unwrap().port();

    let (msg_tx, msgs) = mpsc::unbounded_channel();
    let (conn_tx, connected) = mpsc::unbounded_channel();
    let (open_tx, channel_open) = mpsc::unbounded_channel();

    let sdp_tx = msg_tx.clone();
    let callbacks = RelayCallbacks {
        on_ice_state: Some(Box::new(move |state| info!(%state, "ice state"))),
        on_connected: Some(Box::new(move |c| {
            let _ = conn_tx.send(c);
        })),
        on_candidate: Some(Box::new(move |msg| {
            let _ = msg_tx.send(msg);
        })),
        on_sdp: Some(Box::new(move |msg| {
            let _ = sdp_tx.send(msg);
        })),
        on_channel_open: Some(Box::new(move || {
            let _ = open_tx.send(());
        })),
    };

    let mut options = RelayOptions::new(id, login, game_port, is_offerer);
    options.bind_addr = LOCALHOST;

    let handle = PeerRelay::spawn(options, callbacks)
        .await
        .expect("relay construction");

    Endpoint {
        handle,
        game,
        msgs,
        connected,
        channel_open,
    }
}

/// Pump signaling messages from `from` into `to` for the whole test.
fn bridge(mut from: mpsc::UnboundedReceiver<IceMessage>, to: RelayHandle) {
    tokio::spawn(async move {
        while let Some(msg) = from.recv().await {
            info!(kind = msg.kind(), "bridging signaling message");
            to.add_ice_message(msg);
        }
    });
}

async fn wait_connected(rx: &mut mpsc::UnboundedReceiver<bool>, who: &str) {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv().await {
                Some(true) => break,
                Some(false) => continue,
                None => panic!("{who}: relay went away before connecting"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{who}: never connected"));
}

/// The channel is unreliable by contract, so send until the far side sees
/// the payload.
async fn relay_datagram(sender: &UdpSocket, to_port: u16, receiver: &UdpSocket, payload: &[u8]) {
    let mut buf = [0u8; 2048];
    for _ in 0..20 {
        sender
            .send_to(payload, (LOCALHOST, to_port))
            .await
            .expect("game send");
        match tokio::time::timeout(Duration::from_millis(500), receiver.recv_from(&mut buf)).await
        {
            Ok(Ok((n, _))) => {
                assert_eq!(&buf[..n], payload, "payload must arrive verbatim");
                return;
            }
            Ok(Err(e)) => panic!("game recv failed: {e}"),
            Err(_) => continue,
        }
    }
    panic!("datagram never made it across the relay pair");
}

#[tokio::test(flavor = "multi_thread")]
async fn relays_bridge_game_traffic_over_loopback() {
    init();

    let mut offerer = endpoint(1, "bob", true).await;
    let mut answerer = endpoint(2, "alice", false).await;

    bridge(
        std::mem::replace(&mut offerer.msgs, mpsc::unbounded_channel().1),
        answerer.handle.clone(),
    );
    bridge(
        std::mem::replace(&mut answerer.msgs, mpsc::unbounded_channel().1),
        offerer.handle.clone(),
    );

    wait_connected(&mut offerer.connected, "offerer").await;
    wait_connected(&mut answerer.connected, "answerer").await;

    tokio::time::timeout(Duration::from_secs(10), offerer.channel_open.recv())
        .await
        .expect("offerer channel never opened");
    tokio::time::timeout(Duration::from_secs(10), answerer.channel_open.recv())
        .await
        .expect("answerer channel never opened");

    // Game traffic offerer -> answerer.
    relay_datagram(
        &offerer.game,
        offerer.handle.local_udp_port(),
        &answerer.game,
        &[0x01, 0x02, 0x03, 0x04],
    )
    .await;

    // And back.
    relay_datagram(
        &answerer.game,
        answerer.handle.local_udp_port(),
        &offerer.game,
        b"from the answerer side",
    )
    .await;

    let status = offerer.handle.status().await.expect("status");
    assert_eq!(status.remote_player_login, "bob");
    assert!(status.ice.offerer);
    assert!(status.ice.connected);
    assert!(status.ice.time_to_connected > 0.0);
    assert_eq!(status.ice.datachannel_state, "open");
    assert!(!status.ice.loc_cand_addr.is_empty());
    assert!(!status.ice.rem_cand_addr.is_empty());

    let status = answerer.handle.status().await.expect("status");
    assert!(!status.ice.offerer);
    assert!(status.ice.connected);

    // Shutdown is clean: the relay task goes away and the handle notices.
    offerer.handle.shutdown();
    answerer.handle.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(offerer.handle.status().await.is_none());
    assert!(answerer.handle.status().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn datagrams_before_connection_are_dropped() {
    init();

    let offerer = endpoint(7, "carol", true).await;

    // No remote peer exists; the relay must swallow this quietly.
    offerer
        .game
        .send_to(&[9, 9, 9], (LOCALHOST, offerer.handle.local_udp_port()))
        .await
        .expect("game send");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = offerer.handle.status().await.expect("status");
    assert!(!status.ice.connected);
    assert_eq!(status.ice.time_to_connected, 0.0);

    offerer.handle.shutdown();
}
