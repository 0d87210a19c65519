//! Relay session state machine, probed at the wire level

use std::time::Duration;

use futures::io::AsyncReadExt as _;
use libp2p::{Multiaddr, PeerId};

use onionp2p_onion::message::{Body, Dial, External, Message, Settings, Variant};
use onionp2p_onion::{boxed, BoxConduit, PROTOCOL_ID};
use onionp2p_testsuite::{TestNet, TestNode};

const DEADLINE: Duration = Duration::from_secs(60);

/// Open a raw overlay stream to `relay` and consume its settings message.
async fn open_probe(client: &TestNode, relay: PeerId) -> (BoxConduit, Settings) {
    let stream = client
        .network
        .open_stream(relay, PROTOCOL_ID)
        .await
        .unwrap();
    let mut conduit = boxed(stream);

    let message = Message::recv(&mut conduit, &Settings::default())
        .await
        .unwrap();
    let settings = match message.body.variant().unwrap() {
        Variant::Settings(settings) => *settings,
        other => panic!("expected settings, got {other:?}"),
    };
    (conduit, settings)
}

#[tokio::test(flavor = "multi_thread")]
async fn first_message_must_be_noise() {
    let net = TestNet::spawn(2, true).await.unwrap();
    let client = net.spawn_client().await.unwrap();
    let relay = net.peer_ids()[0];

    let (mut conduit, settings) = open_probe(&client, relay).await;

    // A valid, correctly priced message of the wrong variant: the session
    // must die with the conduit closed, not execute the dial.
    let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9".parse().unwrap();
    Message::send(
        &mut conduit,
        Body::external(External::new(&addr)),
        &settings,
        DEADLINE,
    )
    .await
    .unwrap();

    let mut buf = [0u8; 1];
    assert!(conduit.read_exact(&mut buf).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn underpriced_message_is_refused() {
    let net = TestNet::spawn(2, true).await.unwrap();
    let client = net.spawn_client().await.unwrap();
    let relay = net.peer_ids()[0];

    // Hold open enough parallel sessions to push the advertised price
    // above zero, then send a message minted at difficulty zero.
    let mut held = Vec::new();
    for _ in 0..9 {
        let (extra, _) = open_probe(&client, relay).await;
        held.push(extra);
    }

    let (mut conduit, settings) = open_probe(&client, relay).await;
    assert!(settings.pow_difficulty > 0, "difficulty never rose");

    let ephemeral = libp2p::identity::Keypair::generate_ed25519();
    Message::send(
        &mut conduit,
        Body::noise(onionp2p_onion::message::NoiseHello {
            public_key: ephemeral.public().encode_protobuf(),
        }),
        &Settings::default(), // mints a zero-difficulty token
        DEADLINE,
    )
    .await
    .unwrap();

    let mut buf = [0u8; 1];
    assert!(conduit.read_exact(&mut buf).await.is_err());
    drop(held);
}

#[tokio::test(flavor = "multi_thread")]
async fn dial_for_unhosted_address_is_refused() {
    let net = TestNet::spawn(2, true).await.unwrap();
    let client = net.spawn_client().await.unwrap();

    let hops = net.peer_ids()[..1].to_vec();
    let circuit = client.onion.circuit(&hops).await.unwrap();

    let unknown =
        onionp2p_onion::peers::hidden_address_from_keypair(&libp2p::identity::Keypair::generate_ed25519());
    let connection = circuit.dial(unknown).await.unwrap();

    // The relay kills the session; opening a stream cannot succeed.
    assert!(connection.open().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn dial_variant_carries_a_cid() {
    // The wire form of a dial address round-trips through the CID type.
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let address = onionp2p_onion::peers::hidden_address_from_keypair(&keypair);
    let dial = Dial::new(&address);
    assert_eq!(dial.address().unwrap(), address);
}
