//! Registry semantics: first-writer-wins and relay selection.

use std::sync::Arc;

use fleetd::net::{DirectClient, NodeRegistry, PeerClient, ProxyClient};
use fleetd::promise::Promise;

fn proxy(name: &str, addr: &str) -> Arc<ProxyClient> {
    Arc::new(ProxyClient::new(name, addr, Arc::new(Promise::new(1))))
}

#[test]
fn mark_is_first_writer_wins() {
    let registry = NodeRegistry::new();
    assert!(registry.set_node_if_absent("worker", proxy("worker", "10.0.0.2:11451")));
    assert!(!registry.set_node_if_absent("worker", proxy("worker", "10.9.9.9:1")));

    let kept = registry.node("worker").unwrap();
    assert!(kept.status().contains("10.0.0.2:11451"));
    assert_eq!(registry.len(), 1);
}

#[test]
fn set_node_replaces_for_reestablishment() {
    let registry = NodeRegistry::new();
    registry.set_node("worker", proxy("worker", "10.0.0.2:1"));
    registry.set_node("worker", proxy("worker", "10.0.0.2:2"));
    assert!(registry.node("worker").unwrap().status().contains("10.0.0.2:2"));
}

#[tokio::test]
async fn first_public_skips_relayed_peers() {
    let registry = NodeRegistry::new();
    registry.set_node("a-private", proxy("a-private", "10.0.0.2:1"));
    let relay = Arc::new(DirectClient::connect("b-relay", "127.0.0.1:11451").unwrap());
    registry.set_node("b-relay", relay);

    let chosen = registry.first_public().expect("a public peer exists");
    assert_eq!(chosen.name(), "b-relay");
    assert!(chosen.is_public());
}

#[test]
fn names_are_sorted() {
    let registry = NodeRegistry::new();
    registry.set_node("zeta", proxy("zeta", "z"));
    registry.set_node("alpha", proxy("alpha", "a"));
    assert_eq!(registry.names(), vec!["alpha".to_string(), "zeta".to_string()]);
    registry.remove("zeta");
    assert_eq!(registry.names(), vec!["alpha".to_string()]);
}
