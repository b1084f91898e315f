use crate::*;

#[tokio::test]
async fn test_presence_is_heard_and_expires() {
    let mesh = mesh(&[("phone-a", false), ("phone-b", false), ("phone-c", false)]);
    mesh.cut(0, 2);

    mesh.node(0).announce_presence().await.unwrap();
    mesh.node(2).announce_presence().await.unwrap();
    mesh.settle().await.unwrap();

    let b = mesh.status(1).await;
    assert!(b.active_devices.contains(&"phone-a".to_string()));
    assert!(b.active_devices.contains(&"phone-c".to_string()));
    assert!(b.active_peers >= 2);

    // presence is not relayed: A and C are out of range of each other
    let a = mesh.status(0).await;
    assert!(!a.active_devices.contains(&"phone-c".to_string()));

    mesh.clock.advance(Duration::from_secs(31));
    let b = mesh.status(1).await;
    assert!(b.active_devices.is_empty());
    assert_eq!(b.active_peers, 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_message_traffic_counts_as_activity() {
    let mesh = mesh(&[("phone-a", false), ("phone-b", false)]);

    mesh.node(0)
        .send_query(pulse_services::NewQuery::assistant("hello"))
        .await
        .unwrap();
    mesh.node(0).tick().await.unwrap();

    let b = mesh.status(1).await;
    assert_eq!(b.active_peers, 1);
    assert!(b.active_devices.is_empty(), "no presence heard yet");
    mesh.shutdown().await;
}
