//! Circuit construction over a live localhost network

use onionp2p_testsuite::TestNet;

#[tokio::test(flavor = "multi_thread")]
async fn builds_circuit_through_every_node() {
    let net = TestNet::spawn(10, true).await.unwrap();
    let client = net.spawn_client().await.unwrap();

    // Walk the whole network back to front, one hop per node.
    let mut targets = net.peer_ids();
    targets.reverse();

    let circuit = client.onion.circuit(&targets).await.unwrap();
    assert_eq!(circuit.hops(), targets.as_slice());
    assert_eq!(circuit.tail(), Some(targets[targets.len() - 1]));

    // Every hop advertised settings during extension.
    for peer in &targets {
        let settings = circuit.settings_for(*peer).expect("settings recorded");
        assert!(settings.exit_node);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn extends_an_existing_circuit() {
    let net = TestNet::spawn(4, false).await.unwrap();
    let client = net.spawn_client().await.unwrap();

    let ids = net.peer_ids();
    let mut circuit = client.onion.circuit(&ids[..2]).await.unwrap();
    assert_eq!(circuit.hops().len(), 2);

    circuit.extend(ids[2]).await.unwrap();
    assert_eq!(circuit.hops().len(), 3);
    assert_eq!(circuit.tail(), Some(ids[2]));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_peer_list_is_rejected() {
    let net = TestNet::spawn(1, false).await.unwrap();
    let client = net.spawn_client().await.unwrap();

    assert!(client.onion.circuit(&[]).await.is_err());
}
