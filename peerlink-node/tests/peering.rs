//! Two peer books connected over loopback.

use std::time::{Duration, Instant};

use peerlink_net::{ConnectionHandler, HandlerConfig};
use peerlink_node::cli::Network;
use peerlink_node::config::{NodeConfig, PeerEntry};
use peerlink_node::node::PeerBook;

fn node_config(listen: bool, peers: Vec<PeerEntry>) -> NodeConfig {
    NodeConfig {
        network: Network::Regtest,
        listen: listen.then(|| "127.0.0.1:0".parse().unwrap()),
        peers,
        target_outbound: 1,
        ..NodeConfig::default()
    }
}

fn engine(config: NodeConfig) -> ConnectionHandler<PeerBook> {
    let handler_config = HandlerConfig::default().with_request_interval(Duration::from_millis(20));
    ConnectionHandler::new(handler_config, PeerBook::new(config)).unwrap()
}

#[test]
fn test_two_nodes_connect() {
    let mut server = engine(node_config(true, Vec::new()));
    server.start(0).unwrap();
    let addr = server.events().local_addr().unwrap();

    let mut client = engine(node_config(false, vec![PeerEntry::new(addr.to_string(), false)]));
    client.start(1).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while client.events().outbound_count() == 0 || server.events().inbound_count() == 0 {
        assert!(Instant::now() < deadline, "nodes did not connect");
        client.pump(false);
        server.pump(false);
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(client.events().known_peers().peers.len(), 1);
    assert_eq!(client.connected_count(), 1);
    assert_eq!(server.connected_count(), 1);

    client.shutdown();
    while client.pump(true) {}
    assert_eq!(client.events().outbound_count(), 0);
    assert!(client.is_drained());
    drop(client);

    // The server sees the client go away
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.events().inbound_count() > 0 {
        assert!(Instant::now() < deadline, "server did not notice the disconnect");
        server.pump(true);
    }
    server.shutdown();
    while server.pump(true) {}
}
