//! WebSocket loopback tests for the broadcast server.

use std::sync::Arc;
use std::time::Duration;

use beaconfix::broadcast::{
    BroadcastConfig, BroadcastServer, Payload, PositionBroadcaster, ProximityEntry,
};
use beaconfix::estimator::Proximity;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_server(
    heartbeat: Duration,
) -> (Arc<PositionBroadcaster>, String, CancellationToken) {
    let broadcaster = Arc::new(PositionBroadcaster::new(BroadcastConfig {
        heartbeat_interval: heartbeat,
        ..BroadcastConfig::default()
    }));
    let server = BroadcastServer::bind("127.0.0.1:0", Arc::clone(&broadcaster))
        .await
        .unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(cancel.clone()));
    (broadcaster, url, cancel)
}

async fn next_payload(client: &mut Client) -> Payload {
    let message = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for payload")
        .expect("stream ended")
        .expect("transport error");
    match message {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame {:?}", other),
    }
}

async fn wait_for_subscribers(broadcaster: &PositionBroadcaster, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broadcaster.subscriber_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count never reached target");
}

#[tokio::test]
async fn test_client_receives_hello_then_published_payload() {
    let (broadcaster, url, cancel) = start_server(Duration::from_secs(60)).await;
    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    match next_payload(&mut client).await {
        Payload::Hello { service, .. } => assert_eq!(service, "beaconfix"),
        other => panic!("expected hello, got {:?}", other),
    }

    wait_for_subscribers(&broadcaster, 1).await;
    let report = broadcaster.publish(Payload::unresolved(4, "anchors are collinear"));
    assert_eq!(report.delivered, 1);

    match next_payload(&mut client).await {
        Payload::Unresolved { cycle, reason, .. } => {
            assert_eq!(cycle, 4);
            assert_eq!(reason, "anchors are collinear");
        }
        other => panic!("expected unresolved, got {:?}", other),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_heartbeats_carry_proximity() {
    let (broadcaster, url, cancel) = start_server(Duration::from_millis(50)).await;
    broadcaster.update_proximity(ProximityEntry {
        id: "alpha".into(),
        proximity: Proximity::Near,
        rssi: Some(-65),
    });

    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert!(matches!(next_payload(&mut client).await, Payload::Hello { .. }));

    match next_payload(&mut client).await {
        Payload::Heartbeat { beacons, .. } => {
            assert_eq!(beacons.len(), 1);
            assert_eq!(beacons[0].id.as_str(), "alpha");
            assert_eq!(beacons[0].proximity, Proximity::Near);
        }
        other => panic!("expected heartbeat, got {:?}", other),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_client_text_is_ignored_and_close_unsubscribes() {
    let (broadcaster, url, cancel) = start_server(Duration::from_secs(60)).await;
    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert!(matches!(next_payload(&mut client).await, Payload::Hello { .. }));
    wait_for_subscribers(&broadcaster, 1).await;

    client.send(Message::Text("hi there".to_string())).await.unwrap();
    broadcaster.publish(Payload::unresolved(1, "still here"));
    assert!(matches!(
        next_payload(&mut client).await,
        Payload::Unresolved { cycle: 1, .. }
    ));

    client.close(None).await.unwrap();
    wait_for_subscribers(&broadcaster, 0).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (broadcaster, url, cancel) = start_server(Duration::from_secs(60)).await;
    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert!(matches!(next_payload(&mut client).await, Payload::Hello { .. }));
    wait_for_subscribers(&broadcaster, 1).await;

    cancel.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
