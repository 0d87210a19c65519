//! Hidden service publish, lookup, dial and replica scenarios

use std::time::Duration;

use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};
use libp2p::identity::Keypair;

use onionp2p_onion::peers::hidden_address_from_keypair;
use onionp2p_testsuite::{eventually, TestNet};

#[tokio::test(flavor = "multi_thread")]
async fn hidden_service_end_to_end() {
    let net = TestNet::spawn(10, true).await.unwrap();
    let binder = net.spawn_client().await.unwrap();
    let dialer = net.spawn_client().await.unwrap();

    let service_key = Keypair::generate_ed25519();
    let address = hidden_address_from_keypair(&service_key);

    let ids = net.peer_ids();

    // Service side: bind through a circuit ending at ids[2].
    let bind_circuit = binder.onion.circuit(&ids[..3]).await.unwrap();
    let listener = bind_circuit.bind(&service_key).await.unwrap();
    assert_eq!(listener.address(), address);

    // The hosting relay advertised the address into the DHT.
    let probe = dialer.network.clone();
    let key = address.to_bytes();
    eventually(Duration::from_secs(60), || {
        let probe = probe.clone();
        let key = key.clone();
        async move {
            probe
                .find_providers(key)
                .await
                .map(|p| !p.is_empty())
                .unwrap_or(false)
        }
    })
    .await
    .unwrap();

    // Dialer side: discover providers anonymously through a throwaway
    // tail, extend to one of them, and dial.
    let mut dial_circuit = dialer.onion.circuit(&ids[3..6]).await.unwrap();
    let providers = dial_circuit.hidden_dht(address).await.unwrap();
    assert!(!providers.is_empty(), "lookup returned no providers");

    dial_circuit.extend(providers[0].peer_id).await.unwrap();
    let connection = dial_circuit.dial(address).await.unwrap();

    let accept = tokio::spawn(async move {
        let mut stream = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    });

    let mut stream = connection.open().await.unwrap();
    stream.write_all(b"PING").await.unwrap();
    stream.flush().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(30), accept)
        .await
        .expect("binder never saw the stream")
        .unwrap();
    assert_eq!(&received, b"PING");
}

#[tokio::test(flavor = "multi_thread")]
async fn replica_hidden_service_lists_both_providers() {
    let net = TestNet::spawn(6, false).await.unwrap();
    let binder = net.spawn_client().await.unwrap();

    let service_key = Keypair::generate_ed25519();
    let address = hidden_address_from_keypair(&service_key);

    let ids = net.peer_ids();

    // Two replicas of the same service, each bound through a different
    // circuit with a different tail.
    let circuit_a = binder.onion.circuit(&ids[..2]).await.unwrap();
    let _listener_a = circuit_a.bind(&service_key).await.unwrap();

    let circuit_b = binder.onion.circuit(&ids[2..4]).await.unwrap();
    let _listener_b = circuit_b.bind(&service_key).await.unwrap();

    let probe = binder.network.clone();
    let key = address.to_bytes();
    eventually(Duration::from_secs(60), || {
        let probe = probe.clone();
        let key = key.clone();
        async move {
            probe
                .find_providers(key)
                .await
                .map(|p| p.len() >= 2)
                .unwrap_or(false)
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_with_wrong_signature_is_refused() {
    let net = TestNet::spawn(2, false).await.unwrap();
    let client = net.spawn_client().await.unwrap();

    // A listener bound with a mismatched key must never become dialable:
    // craft the bind by hand with a signature from the wrong key.
    use onionp2p_onion::message::{Bind, Body, Message, Settings, Variant};
    use onionp2p_onion::PROTOCOL_ID;

    let service_key = Keypair::generate_ed25519();
    let wrong_key = Keypair::generate_ed25519();
    let address = hidden_address_from_keypair(&service_key);

    let relay = net.peer_ids()[0];
    let stream = client.network.open_stream(relay, PROTOCOL_ID).await.unwrap();
    let mut conduit = onionp2p_onion::boxed(stream);

    let settings_msg = Message::recv(&mut conduit, &Settings::default()).await.unwrap();
    let settings = match settings_msg.body.variant().unwrap() {
        Variant::Settings(s) => *s,
        _ => panic!("expected settings"),
    };

    // Secure the session under an ephemeral identity, like a circuit does.
    let ephemeral = Keypair::generate_ed25519();
    Message::send(
        &mut conduit,
        Body::noise(onionp2p_onion::message::NoiseHello {
            public_key: ephemeral.public().encode_protobuf(),
        }),
        &settings,
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    let noise = onionp2p_onion::noise::NoiseUpgrader::new(&ephemeral).unwrap();
    let mut secured = noise.secure_outbound(conduit, relay).await.unwrap();

    let signature = wrong_key.sign(&address.to_bytes()).unwrap();
    Message::send(
        &mut secured,
        Body::bind(Bind {
            public_key: service_key.public().encode_protobuf(),
            signature,
        }),
        &settings,
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    // The relay drops the session instead of hosting the service.
    let mut buf = [0u8; 1];
    assert!(secured.read_exact(&mut buf).await.is_err());
    assert!(net.nodes[0].onion.hidden_services().is_empty());
}
