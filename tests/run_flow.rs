//! End-to-end run over the public API: simulated broker traffic flows
//! through the router into the cycle worker and comes out as backend rows.

use std::sync::Arc;

use tokio::sync::mpsc;

use feederlink::broker::{CommandPublisher, ConnectionManager, InboundMessage, TopicRouter};
use feederlink::config::{topics, BrokerConfig};
use feederlink::cycle::{CycleEvent, CycleHandle, RunPhase};

fn weight(value: &str) -> InboundMessage {
    InboundMessage {
        topic: topics::WEIGHT.to_string(),
        payload: value.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn broker_weights_drive_a_run_to_backend_rows() {
    let config = BrokerConfig::default();
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let connection = Arc::new(ConnectionManager::new(config.clone(), inbound_tx.clone()));
    let router = TopicRouter::spawn(connection.clone(), inbound_rx);
    router.subscribe(topics::WEIGHT).await;

    let publisher = Arc::new(CommandPublisher::new(config.command_topics, connection));
    let cycle = CycleHandle::spawn(router.listen(topics::WEIGHT).await, publisher);
    let mut events = cycle.events();

    cycle.set_initial_weight(100.0).await;
    cycle.start().await.expect("start");

    // Simulated broker publishes, including noise the worker must skip.
    for payload in ["40", "garbage", "35", "25"] {
        inbound_tx.send(weight(payload)).await.unwrap();
    }

    let mut watch = cycle.watch();
    while watch.borrow().phase != RunPhase::Completed {
        watch.changed().await.expect("worker alive");
    }

    let snapshot = cycle.snapshot();
    assert_eq!(snapshot.records.len(), 3);
    assert_eq!(snapshot.remaining_weight, Some(0.0));
    assert_eq!(router.latest(topics::WEIGHT).unwrap().text(), Some("25"));

    // Drain to the completion event and check the handoff shape.
    let rows = loop {
        match events.recv().await.expect("event stream") {
            CycleEvent::Completed { rows } => break rows,
            _ => continue,
        }
    };
    let json = serde_json::to_string(&rows[0]).expect("serialize");
    assert_eq!(
        json,
        r#"{"Cycle":"1","Start":"100","End":"60","Drop_Rate":"40"}"#
    );

    cycle.shutdown();
    router.shutdown();
}
