use super::pubsub_client::Client;
use tokio::sync::mpsc;

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel();
    let client = Client::new(tx);
    assert!(!client.id.is_empty());
    assert_eq!(client.ready_count, 0);
    assert!(!client.is_ready());
}

#[test]
fn test_client_ids_are_unique() {
    let (tx, _) = mpsc::unbounded_channel();
    let a = Client::new(tx.clone());
    let b = Client::new(tx);
    assert_ne!(a.id, b.id);
}
